use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use dashlite_kubehub::{ClusterSource, KubeSource, StaticSource};
use dashlite_server::{router, Config, Services, SyncMode};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dashlite", version, about = "Read-only Kubernetes workload dashboard backend")]
struct Cli {
    /// YAML config file
    #[arg(short = 'c', long = "config", env = "DASHLITE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (host:port), overrides server.bind
    #[arg(long = "bind")]
    bind: Option<String>,

    /// Cluster sync mode, overrides kubernetes.mode
    #[arg(long = "mode", value_enum)]
    mode: Option<SyncMode>,

    /// Serve demo fixtures instead of a live cluster
    #[arg(long = "mock", action = ArgAction::SetTrue)]
    mock: bool,

    /// Print the effective configuration as YAML and exit
    #[arg(long = "print-config", action = ArgAction::SetTrue)]
    print_config: bool,
}

fn init_tracing() {
    let env = std::env::var("DASHLITE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DASHLITE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DASHLITE_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        }
        _ = token.cancelled() => {}
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        cfg.server.bind = bind;
    }
    if let Some(mode) = cli.mode {
        cfg.kubernetes.mode = mode;
    }
    cfg.kubernetes.mock |= cli.mock;
    cfg.validate().context("invalid configuration")?;
    if cli.print_config {
        print!("{}", serde_yaml::to_string(&cfg)?);
        return Ok(());
    }
    init_metrics();

    let source: Arc<dyn ClusterSource> = if cfg.kubernetes.mock {
        warn!("kubernetes mock mode: serving demo fixtures");
        Arc::new(StaticSource::demo())
    } else {
        Arc::new(KubeSource::try_default().await.context("connecting to the cluster")?)
    };

    let shutdown = CancellationToken::new();
    let services = Services::start(&cfg, source, &shutdown)?;
    let app = router(services.state.clone());
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind))?;
    info!(addr = %cfg.server.bind, mode = ?cfg.kubernetes.mode, "dashlite listening");
    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown.clone())).await;

    services.stop(&shutdown).await;
    served.context("http server failed")
}
