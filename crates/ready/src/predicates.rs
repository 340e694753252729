//! Readiness rules for the resources the setup waits on.

use ces_kubehub::crd::{Component, HEALTH_AVAILABLE};
use k8s_openapi::api::core::v1::Pod;

use crate::Readiness;

/// Pod condition `Ready` is `True`; a pod in phase `Failed` will not recover.
pub fn pod_ready(pod: &Pod) -> Readiness {
    let Some(status) = pod.status.as_ref() else { return Readiness::Pending };
    if status.phase.as_deref() == Some("Failed") {
        let reason = status.reason.clone().or_else(|| status.message.clone()).unwrap_or_else(|| "pod failed".into());
        return Readiness::Failed(reason);
    }
    let ready = status
        .conditions
        .as_ref()
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false);
    if ready { Readiness::Ready } else { Readiness::Pending }
}

/// The component operator reports the component as available.
pub fn component_healthy(component: &Component) -> Readiness {
    match &component.status {
        Some(s) if s.health == HEALTH_AVAILABLE => Readiness::Ready,
        _ => Readiness::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ces_kubehub::crd::{ComponentSpec, ComponentStatus};
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod_with(cond_type: &str, status: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition { type_: cond_type.into(), status: status.into(), ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_needs_ready_condition() {
        assert_eq!(pod_ready(&pod_with("Ready", "True")), Readiness::Ready);
        assert_eq!(pod_ready(&pod_with("Ready", "False")), Readiness::Pending);
        assert_eq!(pod_ready(&pod_with("PodScheduled", "True")), Readiness::Pending);
        assert_eq!(pod_ready(&Pod::default()), Readiness::Pending);
    }

    #[test]
    fn failed_pod_phase_is_fatal() {
        let mut p = pod_with("Ready", "False");
        if let Some(s) = p.status.as_mut() {
            s.phase = Some("Failed".into());
            s.reason = Some("Evicted".into());
        }
        assert_eq!(pod_ready(&p), Readiness::Failed("Evicted".into()));
    }

    #[test]
    fn component_needs_available_health() {
        let spec = ComponentSpec { name: "k8s-etcd".into(), namespace: "k8s".into(), version: "3.5.9-1".into(), deploy_namespace: None };
        let mut c = Component::new("k8s-etcd", spec);
        assert_eq!(component_healthy(&c), Readiness::Pending);
        c.status = Some(ComponentStatus { status: "installed".into(), health: "unavailable".into() });
        assert_eq!(component_healthy(&c), Readiness::Pending);
        c.status = Some(ComponentStatus { status: "installed".into(), health: "available".into() });
        assert_eq!(component_healthy(&c), Readiness::Ready);
    }
}
