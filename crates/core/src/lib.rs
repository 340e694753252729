//! CES setup core types: dogu descriptors, versions, install phases and run state.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

mod error;

pub use error::MultiError;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid dogu version {0:?}")]
    Version(String),
    #[error("invalid dogu reference {0:?} (expect namespace/name[:version])")]
    Request(String),
    #[error("unknown phase {0:?} (expect component, dogu or loadbalancer)")]
    Phase(String),
    #[error("unknown run state {0:?} (expect installing or installed)")]
    RunState(String),
}

/// Returns the part after the namespace of a qualified dogu name (`official/ldap` -> `ldap`).
pub fn simple_name(qualified: &str) -> &str {
    qualified.rsplit_once('/').map(|(_, n)| n).unwrap_or(qualified)
}

/// Dogu version in `major.minor.patch[.extra]-nano` form.
///
/// Missing trailing components count as zero, so `2.6` and `2.6.0-0` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DoguVersion {
    raw: String,
    parts: [u64; 5],
}

impl DoguVersion {
    pub fn as_str(&self) -> &str { &self.raw }
}

impl FromStr for DoguVersion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Version(s.to_string()));
        }
        let (upstream, nano) = match trimmed.split_once('-') {
            Some((u, n)) => (u, Some(n)),
            None => (trimmed, None),
        };
        let mut parts = [0u64; 5];
        let segments: Vec<&str> = upstream.split('.').collect();
        if segments.len() > 4 {
            return Err(ParseError::Version(s.to_string()));
        }
        for (i, seg) in segments.iter().enumerate() {
            parts[i] = seg.parse().map_err(|_| ParseError::Version(s.to_string()))?;
        }
        if let Some(n) = nano {
            parts[4] = n.parse().map_err(|_| ParseError::Version(s.to_string()))?;
        }
        Ok(Self { raw: trimmed.to_string(), parts })
    }
}

impl Ord for DoguVersion {
    fn cmp(&self, other: &Self) -> Ordering { self.parts.cmp(&other.parts) }
}

impl PartialOrd for DoguVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl fmt::Display for DoguVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.raw) }
}

/// A requested dogu: qualified name, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DoguRequest {
    pub name: String,
    pub version: Option<String>,
}

impl DoguRequest {
    pub fn simple_name(&self) -> &str { simple_name(&self.name) }
}

impl FromStr for DoguRequest {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, version) = match s.split_once(':') {
            Some((n, v)) if !v.is_empty() => (n, Some(v.to_string())),
            Some(_) => return Err(ParseError::Request(s.to_string())),
            None => (s, None),
        };
        match name.split_once('/') {
            Some((ns, simple)) if !ns.is_empty() && !simple.is_empty() && !simple.contains('/') => {}
            _ => return Err(ParseError::Request(s.to_string())),
        }
        if let Some(v) = &version {
            v.parse::<DoguVersion>().map_err(|_| ParseError::Request(s.to_string()))?;
        }
        Ok(Self { name: name.to_string(), version })
    }
}

impl fmt::Display for DoguRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}:{}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    #[default]
    #[serde(alias = "")]
    Dogu,
    Client,
    Package,
}

/// Declared dependency of a dogu, referenced by simple name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(rename = "Type", default)]
    pub kind: DependencyType,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Version", default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl Dependency {
    pub fn dogu(name: &str) -> Self { Self { kind: DependencyType::Dogu, name: name.to_string(), version: String::new() } }
}

/// Who provides the credentials behind a service account requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceAccountKind {
    Dogu,
    Component,
    Unknown(String),
}

impl ServiceAccountKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Dogu => "dogu",
            Self::Component => "component",
            Self::Unknown(s) => s.as_str(),
        }
    }
}

impl From<&str> for ServiceAccountKind {
    fn from(s: &str) -> Self {
        match s {
            "" | "dogu" => Self::Dogu,
            "component" | "k8s" => Self::Component,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl Serialize for ServiceAccountKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ServiceAccountKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

impl Default for ServiceAccountKind {
    fn default() -> Self { Self::Dogu }
}

/// Requirement for a service account provisioned by another dogu or a platform component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccount {
    /// Name of the providing dogu or component.
    #[serde(rename = "Type")]
    pub target: String,
    #[serde(rename = "Kind", default)]
    pub kind: ServiceAccountKind,
    #[serde(rename = "Optional", default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

/// Full descriptor of an installable dogu (subset of dogu.json).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoguDescriptor {
    /// Qualified name, e.g. `official/redmine`.
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Dependencies", default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    #[serde(rename = "OptionalDependencies", default, skip_serializing_if = "Vec::is_empty")]
    pub optional_dependencies: Vec<Dependency>,
    #[serde(rename = "ServiceAccounts", default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccount>,
}

impl DoguDescriptor {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            dependencies: Vec::new(),
            optional_dependencies: Vec::new(),
            service_accounts: Vec::new(),
        }
    }

    pub fn simple_name(&self) -> &str { simple_name(&self.name) }

    /// Namespace part of the qualified name (empty if unqualified).
    pub fn namespace(&self) -> &str {
        self.name.rsplit_once('/').map(|(ns, _)| ns).unwrap_or("")
    }

    /// Simple names of dogu-type dependencies, hard and optional.
    pub fn dogu_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .chain(self.optional_dependencies.iter())
            .filter(|d| d.kind == DependencyType::Dogu)
            .map(|d| d.name.as_str())
    }

    /// A service account is optional when flagged so or when its provider is an optional dependency.
    pub fn is_optional_service_account(&self, sa: &ServiceAccount) -> bool {
        sa.optional || self.optional_dependencies.iter().any(|d| d.name == sa.target)
    }
}

/// Named stage of the install pipeline; scopes when resource patches apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Component,
    Dogu,
    Loadbalancer,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Component => "component",
            Self::Dogu => "dogu",
            Self::Loadbalancer => "loadbalancer",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Phase {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "component" => Ok(Self::Component),
            "dogu" => Ok(Self::Dogu),
            "loadbalancer" => Ok(Self::Loadbalancer),
            other => Err(ParseError::Phase(other.to_string())),
        }
    }
}

/// Durable marker of a setup run, stored in a config map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Installing,
    Installed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Installed => "installed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for RunState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "installing" => Ok(Self::Installing),
            "installed" => Ok(Self::Installed),
            other => Err(ParseError::RunState(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_order_numerically() {
        let a: DoguVersion = "2.6.2-1".parse().unwrap();
        let b: DoguVersion = "2.10.0-1".parse().unwrap();
        let c: DoguVersion = "2.6.2-10".parse().unwrap();
        assert!(a < b);
        assert!(a < c);
        assert_eq!("2.6".parse::<DoguVersion>().unwrap().cmp(&"2.6.0-0".parse().unwrap()), Ordering::Equal);
        assert!("2.x".parse::<DoguVersion>().is_err());
        assert!("".parse::<DoguVersion>().is_err());
    }

    #[test]
    fn parses_requests() {
        let r: DoguRequest = "official/ldap:2.6.2-1".parse().unwrap();
        assert_eq!(r.name, "official/ldap");
        assert_eq!(r.version.as_deref(), Some("2.6.2-1"));
        assert_eq!(r.simple_name(), "ldap");

        let r: DoguRequest = "k8s/nginx-ingress".parse().unwrap();
        assert_eq!(r.version, None);

        assert!("ldap".parse::<DoguRequest>().is_err());
        assert!("official/ldap:".parse::<DoguRequest>().is_err());
        assert!("official/ldap:latest".parse::<DoguRequest>().is_err());
    }

    #[test]
    fn descriptor_reads_dogu_json_fields() {
        let raw = serde_json::json!({
            "Name": "official/redmine",
            "Version": "5.1.0-1",
            "Dependencies": [
                {"Type": "dogu", "Name": "postgresql"},
                {"Type": "client", "Name": "cesapp", "Version": ">=6.0.0"}
            ],
            "OptionalDependencies": [{"Type": "dogu", "Name": "mail"}],
            "ServiceAccounts": [
                {"Type": "postgresql", "Kind": "dogu"},
                {"Type": "mail"},
                {"Type": "k8s-prometheus", "Kind": "component"},
                {"Type": "x", "Kind": "cloud"}
            ]
        });
        let d: DoguDescriptor = serde_json::from_value(raw).unwrap();
        assert_eq!(d.simple_name(), "redmine");
        assert_eq!(d.namespace(), "official");
        assert_eq!(d.dogu_dependencies().collect::<Vec<_>>(), vec!["postgresql", "mail"]);
        assert_eq!(d.service_accounts[1].kind, ServiceAccountKind::Dogu);
        assert_eq!(d.service_accounts[2].kind, ServiceAccountKind::Component);
        assert_eq!(d.service_accounts[3].kind, ServiceAccountKind::Unknown("cloud".into()));
        assert!(!d.is_optional_service_account(&d.service_accounts[0]));
        assert!(d.is_optional_service_account(&d.service_accounts[1]));
    }

    #[test]
    fn phase_and_state_round_trip_strings() {
        assert_eq!("loadbalancer".parse::<Phase>().unwrap(), Phase::Loadbalancer);
        assert!("ingress".parse::<Phase>().is_err());
        assert_eq!(RunState::Installing.to_string(), "installing");
        assert_eq!("installed".parse::<RunState>().unwrap(), RunState::Installed);
    }
}
