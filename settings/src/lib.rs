use clap::{builder::OsStr, Parser};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Settings {
    #[arg(long, default_value = "one", env = "SENTINEL_NODE_ID")]
    pub node_id: String,
    #[arg(long, default_value = "info", env = "SENTINEL_LOG_LEVEL")]
    pub log_level: String,
    #[arg(long, default_value = "/var/lib/sentinel", env = "SENTINEL_DATA_DIR")]
    pub data_dir: String,

    /// Lightning peer (LSP) the wallet keeps its channels with.
    #[arg(long, default_value = "127.0.0.1:9735", env = "SENTINEL_PEER_ADDRESS")]
    pub peer_address: String,
    /// Electrum server used to follow the chain.
    #[arg(long, default_value = "127.0.0.1:50001", env = "SENTINEL_ELECTRUM_ADDRESS")]
    pub electrum_address: String,
    /// Endpoint backing the generic http capability (rates, configuration).
    #[arg(long, default_value = "127.0.0.1:443", env = "SENTINEL_HTTP_ADDRESS")]
    pub http_address: String,
    #[arg(
        long,
        default_value = "1.1.1.1:53",
        env = "SENTINEL_NETWORK_PROBE_ADDRESS"
    )]
    pub network_probe_address: String,
    #[arg(long, default_value = "15", env = "SENTINEL_NETWORK_PROBE_INTERVAL_SECS")]
    pub network_probe_interval_secs: u64,

    #[arg(long, default_value = "127.0.0.1:2233", env = "SENTINEL_EXPORTER_ADDRESS")]
    pub exporter_address: String,

    #[arg(long, default_value = "100", env = "SENTINEL_BACKOFF_MIN_MILLIS")]
    pub backoff_min_millis: u64,
    #[arg(long, default_value = "8000", env = "SENTINEL_BACKOFF_MAX_MILLIS")]
    pub backoff_max_millis: u64,

    /// Execution window granted to one watchtower run.
    #[arg(long, default_value = "30", env = "SENTINEL_WATCHTOWER_DEADLINE_SECS")]
    pub watchtower_deadline_secs: u64,
    #[arg(long, default_value = "10", env = "SENTINEL_SETTLE_GRACE_SECS")]
    pub settle_grace_secs: u64,
    #[arg(long, default_value = "36", env = "SENTINEL_WATCHTOWER_INTERVAL_HOURS")]
    pub watchtower_interval_hours: u64,
    #[arg(long, default_value = "12", env = "SENTINEL_WATCHTOWER_FLEX_HOURS")]
    pub watchtower_flex_hours: u64,
    /// Delay before the next run when the previous one hit its deadline.
    #[arg(long, default_value = "30", env = "SENTINEL_WATCHTOWER_RETRY_MINUTES")]
    pub watchtower_retry_minutes: u64,
    /// Skip waiting for the chain indexer (diagnostics only).
    #[arg(long, env = "SENTINEL_DISABLE_CHAIN_WATCH")]
    pub disable_chain_watch: bool,

    #[arg(long, default_value = "5", env = "SENTINEL_WORKER_POLL_SECS")]
    pub worker_poll_secs: u64,
    #[arg(long, default_value = "120", env = "SENTINEL_WORKER_TIMEOUT_SECS")]
    pub worker_timeout_secs: u64,
    #[arg(long, default_value = "120", env = "SENTINEL_WORKER_RETRY_MINUTES")]
    pub worker_retry_minutes: u64,
}

impl Settings {
    pub fn load() -> Settings {
        Settings::parse()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::parse_from::<Vec<OsStr>, OsStr>(vec![])
    }
}
