use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use keelson_core::{Chart, ClusterApi, ObjectKey, ResourceDescriptor, DEFAULT_REPO};
use keelson_engine::{Engine, EngineConfig};
use keelson_kubehub::{get_kube_client, watch_charts, KubeCluster};
use keelson_render::{BundleSource, HelmCli, HelmConfig};
use keelson_store::{spawn_dispatch, DispatchConfig};
use kube::CustomResourceExt;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelson", version, about = "Chart release controller")]
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
    /// Watch Charts and converge their releases until interrupted
    Run(RunArgs),
    /// Print the Chart CustomResourceDefinition
    Crd,
    /// Render a Chart's bundle without touching the cluster
    Render {
        /// Chart instance name
        name: String,
        #[command(flatten)]
        helm: HelmArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct HelmArgs {
    /// helm executable
    #[arg(long = "helm-bin", env = "KEELSON_HELM_BIN", default_value = "helm")]
    helm_bin: PathBuf,
    /// Directory charts are pulled into
    #[arg(long = "chart-cache", env = "KEELSON_CHART_CACHE", default_value = "./charts")]
    chart_cache: PathBuf,
    /// Repository alias for charts that leave `repo` empty
    #[arg(long = "default-repo", env = "KEELSON_DEFAULT_REPO", default_value = DEFAULT_REPO)]
    default_repo: String,
    /// Run `helm repo update` before pulling
    #[arg(long = "repo-update", env = "KEELSON_REPO_UPDATE", action = ArgAction::SetTrue)]
    repo_update: bool,
}

impl HelmArgs {
    fn source(&self) -> Arc<dyn BundleSource> {
        Arc::new(HelmCli::new(HelmConfig {
            helm_bin: self.helm_bin.clone(),
            cache_dir: self.chart_cache.clone(),
            repo_update: self.repo_update,
        }))
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig { default_repo: self.default_repo.clone(), ..EngineConfig::default() }
    }
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Concurrent passes across distinct charts
    #[arg(long = "workers", env = "KEELSON_WORKERS", default_value_t = 4)]
    workers: usize,
    /// Pending-key capacity of the dispatch intake
    #[arg(long = "queue-cap", env = "KEELSON_QUEUE_CAP", default_value_t = 1024)]
    queue_cap: usize,
    /// Prometheus listener, e.g. 0.0.0.0:8080
    #[arg(long = "metrics-addr", env = "KEELSON_METRICS_ADDR")]
    metrics_addr: Option<String>,
    #[arg(long = "backoff-base-ms", env = "KEELSON_BACKOFF_BASE_MS", default_value_t = 200)]
    backoff_base_ms: u64,
    #[arg(long = "backoff-max-secs", env = "KEELSON_BACKOFF_MAX_SECS", default_value_t = 60)]
    backoff_max_secs: u64,
    #[command(flatten)]
    helm: HelmArgs,
}

impl RunArgs {
    fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.workers,
            queue_cap: self.queue_cap,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KEELSON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid metrics address; expected host:port"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Crd => match cli.output {
            Output::Human => print!("{}", serde_yaml::to_string(&Chart::crd())?),
            Output::Json => println!("{}", serde_json::to_string_pretty(&Chart::crd())?),
        },
        Commands::Run(args) => run(args).await?,
        Commands::Render { name, helm } => render(&name, &helm, cli.output).await?,
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    init_metrics(args.metrics_addr.as_deref());
    let client = get_kube_client().await.context("building kubernetes client")?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client.clone()));
    let engine = Arc::new(Engine::with_config(cluster, args.helm.source(), args.helm.engine_config()));

    let dispatcher = spawn_dispatch(args.dispatch_config(), move |key: ObjectKey| {
        let engine = Arc::clone(&engine);
        async move { engine.reconcile(&key).await }
    });
    let mut watcher = tokio::spawn({
        let tx = dispatcher.sender();
        async move {
            if let Err(e) = watch_charts(client, tx).await {
                error!(error = %e, "chart watcher failed");
            }
        }
    });
    info!(workers = args.workers, "keelson running");

    tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res { warn!(error = %e, "signal handler failed"); }
            info!("interrupt received; shutting down");
        }
        _ = &mut watcher => warn!("chart watcher exited; shutting down"),
    }
    watcher.abort();
    let stats = dispatcher.shutdown().await;
    info!(passes = stats.passes, failures = stats.failures, "dispatch stopped");
    Ok(())
}

async fn render(name: &str, helm: &HelmArgs, output: Output) -> Result<()> {
    let client = get_kube_client().await.context("building kubernetes client")?;
    let cluster = Arc::new(KubeCluster::new(client));
    let chart = cluster
        .get_chart(&ObjectKey::cluster(name))
        .await
        .with_context(|| format!("fetching chart {name}"))?
        .ok_or_else(|| anyhow!("chart {name} not found"))?;
    let engine = Engine::with_config(cluster, helm.source(), helm.engine_config());
    let descriptors = engine.preview(&chart).await.with_context(|| format!("rendering chart {name}"))?;
    match output {
        Output::Human => print_table(&descriptors),
        Output::Json => println!("{}", serde_json::to_string_pretty(&descriptors)?),
    }
    Ok(())
}

fn print_table(descriptors: &[ResourceDescriptor]) {
    println!("{:<24} {:<28} {:<16} NAME", "KIND", "APIVERSION", "NAMESPACE");
    for d in descriptors {
        println!("{:<24} {:<28} {:<16} {}", d.kind, d.api_version, d.namespace.as_deref().unwrap_or("-"), d.name);
    }
}
