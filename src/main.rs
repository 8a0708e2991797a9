use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use log::{error, info, warn};
use logger::SentinelLogger;
use settings::Settings;
use tokio_util::sync::CancellationToken;
use wallet_sentinel::connection::{BackoffConfig, TcpLink};
use wallet_sentinel::daemon::{ConnectionsDaemon, Links};
use wallet_sentinel::network::ProbeNetworkMonitor;
use wallet_sentinel::prometheus::start_prometheus_exporter;
use wallet_sentinel::store::{JsonFileStore, OutcomeStore};
use wallet_sentinel::{log_error, quit_signal, VERSION};

pub fn main() {
    let settings = Arc::new(Settings::load());
    let level = match settings.log_level.parse() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("Invalid log level {}", settings.log_level);
            std::process::exit(2);
        }
    };
    SentinelLogger::init(&settings.node_id, level);

    info!("Starting {VERSION}");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("could not create runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = if let Err(e) = runtime.block_on(run_sentinel(settings)) {
        error!("Fatal error encountered: {e}");
        log_error(&e);
        1
    } else {
        0
    };

    info!("Shutting down");
    runtime.shutdown_timeout(Duration::from_secs(30));
    info!("Stopped all threads. Process finished.");
    std::process::exit(exit_code);
}

async fn run_sentinel(settings: Arc<Settings>) -> Result<()> {
    let quit_signal = quit_signal().shared();
    let cancel = CancellationToken::new();

    let store = JsonFileStore::open(&settings.data_dir)
        .await
        .context("cannot open store")?;
    match store.latest_outcome().await {
        Ok(Some(outcome)) => info!("last watchtower outcome: {outcome:?}"),
        Ok(None) => info!("watchtower never ran"),
        Err(e) => log_error(&e),
    }

    let monitor = ProbeNetworkMonitor::start(
        settings.network_probe_address.clone(),
        Duration::from_secs(settings.network_probe_interval_secs),
        cancel.child_token(),
    );
    let links = Links {
        peer: Arc::new(TcpLink::new("peer", &settings.peer_address)),
        electrum: Arc::new(TcpLink::new("electrum", &settings.electrum_address)),
        http: Arc::new(TcpLink::new("http", &settings.http_address)),
    };
    let daemon = ConnectionsDaemon::start(
        links,
        &monitor,
        BackoffConfig::from(settings.as_ref()),
        cancel.child_token(),
    );

    let mut connections = daemon.subscribe_connections();
    let watcher = cancel.child_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = watcher.cancelled() => break,
                status = connections.recv() => match status {
                    Some(status) => info!("connections: {status}"),
                    None => break,
                },
            }
        }
    });

    let result = tokio::select!(
        _ = quit_signal.clone() => {
            info!("Received quit signal.");
            Ok(())
        },
        result = start_prometheus_exporter(settings.exporter_address.clone(), daemon.connections(), quit_signal.clone()) => {
            result.context("Prometheus exporter failed")
        }
    );
    if result.is_err() {
        warn!("stopping connections after a failure");
    }
    cancel.cancel();
    daemon.stop().await;
    result
}
