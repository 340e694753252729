use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use ces_api::{Cluster, MemoryCluster, Setup, SetupConfig};
use ces_kubehub::{KubeAccessor, RunStateStore};
use ces_plan::{DirRegistry, DoguRegistry};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::ConfigMap;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ces-setup", version, about = "Install the Cloudogu EcoSystem into a Kubernetes cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full setup once
    Run {
        #[arg(short = 'c', long, env = "CES_SETUP_CONFIG")]
        config: PathBuf,
        /// Dogu descriptor directory (overrides registryDir)
        #[arg(long)]
        registry: Option<PathBuf>,
    },
    /// Print the steps a run would execute, without a cluster
    Plan {
        #[arg(short = 'c', long, env = "CES_SETUP_CONFIG")]
        config: PathBuf,
        #[arg(long)]
        registry: Option<PathBuf>,
    },
    /// Show the recorded setup state of a namespace
    State {
        #[arg(long = "namespace", short = 'n', default_value = "ecosystem")]
        namespace: String,
    },
}

fn init_tracing() {
    let env = std::env::var("CES_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CES_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CES_METRICS_ADDR; expected host:port");
        }
    }
}

fn registry_for(cfg: &SetupConfig, flag: Option<PathBuf>) -> Result<Arc<dyn DoguRegistry>> {
    let root = flag
        .or_else(|| cfg.registry_dir.clone())
        .context("no dogu registry: set registryDir in the configuration or pass --registry")?;
    Ok(Arc::new(DirRegistry::new(root)))
}

async fn load(path: &Path, registry: Option<PathBuf>) -> Result<(SetupConfig, Arc<dyn DoguRegistry>)> {
    let cfg = SetupConfig::load(path).await.with_context(|| format!("loading {}", path.display()))?;
    let reg = registry_for(&cfg, registry)?;
    Ok((cfg, reg))
}

/// Cancels the token on the first Ctrl-C; the running step sees it and stops.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling setup");
            trigger.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, registry } => {
            let (cfg, reg) = load(&config, registry).await?;
            let namespace = cfg.namespace.clone();
            info!(namespace = %namespace, config = %config.display(), "run invoked");
            let client = ces_kubehub::get_kube_client().await?;
            let setup = Setup::new(cfg, Cluster::kube(client, &namespace), reg);
            let res = setup.run(&cancel_on_interrupt()).await;
            match (&res, cli.output) {
                (Ok(()), Output::Human) => println!("setup of {} completed", namespace),
                (Ok(()), Output::Json) => println!("{}", serde_json::json!({ "namespace": namespace, "state": "installed" })),
                (Err(e), Output::Json) => println!(
                    "{}",
                    serde_json::json!({ "namespace": namespace, "error": e.to_string(), "failedStep": e.failed_step() })
                ),
                (Err(e), Output::Human) => error!(error = %e, "setup failed"),
            }
            res?;
        }
        Commands::Plan { config, registry } => {
            let (cfg, reg) = load(&config, registry).await?;
            info!(namespace = %cfg.namespace, "plan invoked");
            let steps = Setup::new(cfg, MemoryCluster::new().cluster(), reg).plan().await?;
            match cli.output {
                Output::Human => {
                    for (i, s) in steps.iter().enumerate() {
                        println!("{:>3}. {}", i + 1, s);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&steps)?),
            }
        }
        Commands::State { namespace } => {
            let client = ces_kubehub::get_kube_client().await?;
            let store = RunStateStore::new(KubeAccessor::<ConfigMap>::namespaced(client, &namespace));
            let state = store.get().await?;
            let label = state.map(|s| s.to_string()).unwrap_or_else(|| "not started".to_string());
            match cli.output {
                Output::Human => println!("{}: {}", namespace, label),
                Output::Json => println!("{}", serde_json::json!({ "namespace": namespace, "state": state })),
            }
        }
    }
    Ok(())
}
