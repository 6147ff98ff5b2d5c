use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use carto_controller::{Context, Controller, ControllerConfig};
use carto_kubehub::cache::StampCache;
use carto_kubehub::{watch, ApiResolver, KubeEventRecorder, KubeRepository, KubeRepositoryBuilder, KubeTokenMinter, TokenCache, WatchHub};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::watch as shutdown_signal;
use tracing::{error, info, warn};

mod stamp;

/// Lifetime requested for minted service account tokens.
const TOKEN_TTL: Duration = Duration::from_secs(3600);

#[derive(Parser, Debug)]
#[command(name = "cartographer", version, about = "Cartographer supply chain choreographer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Yaml,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every controller against the current cluster
    Run {
        /// Full resync period in seconds
        #[arg(long, env = "CARTO_RESYNC_SECS")]
        resync_secs: Option<u64>,
        /// Workers per controller
        #[arg(long, env = "CARTO_CONCURRENCY")]
        concurrency: Option<usize>,
        /// Field manager used for server-side apply
        #[arg(long, env = "CARTO_FIELD_MANAGER")]
        field_manager: Option<String>,
        /// Interval of the expired token sweep, in seconds
        #[arg(long, env = "CARTO_TOKEN_GC_SECS")]
        token_gc_secs: Option<u64>,
    },
    /// Stamp a template for an owner offline and print the result
    Stamp {
        /// Template object (any Cluster*Template kind)
        #[arg(long)]
        template: PathBuf,
        /// Workload or Deliverable object
        #[arg(long)]
        owner: PathBuf,
        /// Upstream inputs: sources, images, configs, deployment
        #[arg(long)]
        inputs: Option<PathBuf>,
        /// Blueprint name put on the stamping labels
        #[arg(long, default_value = "offline")]
        blueprint: String,
        /// Blueprint resource name
        #[arg(long, default_value = "resource")]
        resource: String,
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Yaml)]
        output: Output,
    },
}

fn init_tracing() {
    let env = std::env::var("CARTO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CARTO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CARTO_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_document(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    stamp::parse_document(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn run(config: ControllerConfig) -> Result<()> {
    let kube_config = carto_kubehub::infer_config().await?;
    let client = carto_kubehub::client_for(kube_config.clone())?;
    let resolver = Arc::new(ApiResolver::new(client.clone()));
    let cache = Arc::new(StampCache::new());

    let system = Arc::new(KubeRepository::new(client.clone(), resolver.clone(), &config.field_manager, cache.clone()));
    let builder = Arc::new(KubeRepositoryBuilder::new(kube_config, resolver.clone(), &config.field_manager, cache));
    let tokens = Arc::new(TokenCache::new(KubeTokenMinter::new(client.clone(), TOKEN_TTL)));
    tokens.start(config.token_gc);
    let events = Arc::new(KubeEventRecorder::new(client.clone(), &config.field_manager));

    let (stop_tx, stop_rx) = shutdown_signal::channel(false);
    let (hub, objects) = WatchHub::new(client, resolver, stop_rx.clone(), config.queue_cap);
    let ctx = Context::new(system, builder, tokens.clone(), events, hub.clone(), &config);
    let controller = Controller::new(ctx, config);

    let pump = tokio::spawn(watch::pump(controller.clone(), objects));
    hub.watch_engine_kinds();
    let runner = tokio::spawn(controller.clone().run(stop_rx));

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    stop_tx.send(true).context("signalling shutdown")?;
    if let Err(e) = runner.await {
        error!(error = %e, "controller task failed");
    }
    pump.abort();
    tokens.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { resync_secs, concurrency, field_manager, token_gc_secs } => {
            let mut config = ControllerConfig::from_env();
            if let Some(s) = resync_secs.filter(|s| *s > 0) {
                config.resync = Duration::from_secs(s);
            }
            if let Some(n) = concurrency.filter(|n| *n > 0) {
                config.concurrency = n;
            }
            if let Some(f) = field_manager.filter(|f| !f.trim().is_empty()) {
                config.field_manager = f;
            }
            if let Some(s) = token_gc_secs.filter(|s| *s > 0) {
                config.token_gc = Duration::from_secs(s);
            }
            info!(?config, "starting cartographer");
            run(config).await
        }
        Commands::Stamp { template, owner, inputs, blueprint, resource, output } => {
            let template = read_document(&template)?;
            let owner = read_document(&owner)?;
            let inputs = match inputs {
                Some(p) => read_document(&p)?,
                None => serde_json::Value::Null,
            };
            let stamped = stamp::stamp(&template, &owner, &inputs, &blueprint, &resource)?;
            match output {
                Output::Yaml => print!("{}", serde_yaml::to_string(&stamped)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&stamped)?),
            }
            Ok(())
        }
    }
}
