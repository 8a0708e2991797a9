use tokio::signal::unix::SignalKind;

pub mod alert;
pub mod connection;
pub mod daemon;
pub mod network;
pub mod prometheus;
pub mod scheduler;
pub mod store;
pub mod traffic;
pub mod watchtower;
pub mod workers;

pub const VERSION: &str = concat!("SENTINEL v", env!("CARGO_PKG_VERSION"));

pub async fn quit_signal() {
    match tokio::signal::unix::signal(SignalKind::quit()) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            log::error!("Cannot listen for quit signal: {e}");
            std::future::pending::<()>().await
        }
    }
}

pub fn log_error(e: &anyhow::Error) {
    for cause in e.chain() {
        log::error!("{}", cause);
    }
}

/// Milliseconds since the unix epoch, the timestamp unit used by persisted records.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
