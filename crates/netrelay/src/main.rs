//! netrelay: debugging proxy that relays every forwarded call to a sink.

mod config;
mod forward;
mod server;
mod stats;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use config::RelayConfig;
use netrelay::{CollectorSink, EventRelay, FanoutSink, RelayClient, ReportSink, TracingSink};
use server::AppState;
use stats::ProxyStats;

/// How long to wait for queued collector events after shutdown.
const COLLECTOR_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
        .or_else(|| std::env::var("NETRELAY_CONFIG").ok())
        .unwrap_or_else(|| "netrelay.toml".to_string());

    let upstream_override = args
        .iter()
        .position(|a| a == "--upstream")
        .and_then(|i| args.get(i + 1).cloned());

    let mut config = RelayConfig::load(&config_path)?;
    if let Some(url) = upstream_override {
        config.upstream.url = url;
    }

    // The OTLP gRPC exporter needs a reactor, so build the runtime first.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let _tracing_guard = netrelay_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            upstream = %config.upstream.url,
            collector = ?config.collector.url,
            max_body_bytes = config.capture.max_body_bytes,
            "Starting netrelay"
        );

        run(config).await
    })
}

async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let upstream_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upstream.timeout_secs))
        .build()?;

    let stats = ProxyStats::new();
    let mut sinks = FanoutSink::new(vec![
        Arc::new(TracingSink) as Arc<dyn ReportSink>,
        Arc::new(stats.clone()) as Arc<dyn ReportSink>,
    ]);

    let collector_task = match config.collector.url {
        Some(ref url) => {
            let (collector, task) = CollectorSink::spawn(reqwest::Client::new(), url.clone());
            sinks.push(Arc::new(collector));
            Some(task)
        }
        None => None,
    };

    let relay = EventRelay::new(Arc::new(sinks), config.capture.clone());
    let capture_enabled = Arc::new(AtomicBool::new(config.server.capture_enabled));

    let state = AppState {
        config,
        relay_client: RelayClient::new(upstream_client, relay),
        stats,
        capture_enabled,
    };

    // The router owns the only sink references, so the collector queue
    // closes once the server has shut down.
    let result = server::run(state).await;

    if let Some(task) = collector_task {
        if tokio::time::timeout(COLLECTOR_FLUSH_TIMEOUT, task).await.is_err() {
            tracing::warn!("Timed out flushing collector events");
        }
    }

    result
}
