//! `unit-host`: runs a unit host driven by JSON-line loader requests on
//! stdin. Each request line produces one response line on stdout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use unithost_core::{LoaderRequest, LoaderResponse};
use unithost_server::unit::builtin::builtin_factory;
use unithost_server::unit::UnitFactory;
use unithost_server::{HostConfig, LivenessConfig, LoaderService, UnitHost};

#[derive(Parser, Debug)]
#[command(name = "unit-host")]
#[command(about = "Hosts dynamically loaded units driven by JSON-line requests", long_about = None)]
struct Args {
    /// Namespace unit names and liveness topics resolve under
    #[arg(long, env = "UNITHOST_NAMESPACE", default_value = "/")]
    namespace: String,

    /// Dispatch worker threads (0 = one per core)
    #[arg(long, env = "UNITHOST_NUM_WORKER_THREADS", default_value_t = 0)]
    num_worker_threads: usize,

    /// Silence in milliseconds after which a liveness peer is declared lost
    #[arg(long, env = "UNITHOST_HEARTBEAT_TIMEOUT_MS", default_value_t = 4000)]
    heartbeat_timeout_ms: u64,

    /// Address of the Prometheus scrape endpoint
    #[arg(long, env = "UNITHOST_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn host_config(&self) -> HostConfig {
        HostConfig {
            namespace: self.namespace.clone(),
            num_worker_threads: self.num_worker_threads,
            liveness: LivenessConfig {
                heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
                ..LivenessConfig::default()
            },
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    // Logs go to stderr; stdout carries responses.
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn respond_to_line(service: Option<&LoaderService>, line: &str) -> LoaderResponse {
    let request = match serde_json::from_str::<LoaderRequest>(line) {
        Ok(request) => request,
        Err(e) => {
            warn!("rejecting malformed request: {e}");
            return LoaderResponse::Error {
                message: format!("malformed request: {e}"),
            };
        }
    };
    match service {
        Some(service) => service.handle(request),
        None => LoaderResponse::Error {
            message: "unit host is shutting down".to_string(),
        },
    }
}

async fn serve(host: Arc<UnitHost>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read request")?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        };
        let Some(line) = line else {
            info!("request stream closed");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        // Registry calls block on locks and in-flight callbacks.
        let service = host.service();
        let response =
            tokio::task::spawn_blocking(move || respond_to_line(service.as_deref(), &line))
                .await
                .context("request handler panicked")?;

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("serving metrics on {addr}");
    }

    let factory = builtin_factory();
    info!("available unit types: {:?}", factory.declared_types());
    let host = Arc::new(UnitHost::new(&args.host_config(), Arc::new(factory))?);

    let served = serve(Arc::clone(&host)).await;
    if let Err(e) = &served {
        error!("request loop failed: {e:#}");
    }

    let teardown = Arc::clone(&host);
    tokio::task::spawn_blocking(move || teardown.shutdown())
        .await
        .context("shutdown panicked")?;
    info!("final phase: {}", host.phase());
    served
}
