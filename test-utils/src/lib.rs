use std::str::FromStr;

use bitcoin::Txid;
use settings::Settings;

pub const TEST_NODE_ID: &str = "test-node";

pub struct TestSettingsBuilder {
    settings: Settings,
}

impl TestSettingsBuilder {
    pub fn new() -> TestSettingsBuilder {
        let mut settings = Settings::default();
        settings.node_id = TEST_NODE_ID.to_string();
        settings.log_level = "debug".to_string();
        TestSettingsBuilder { settings }
    }

    pub fn with_data_dir(mut self, data_dir: &str) -> TestSettingsBuilder {
        self.settings.data_dir = data_dir.to_string();
        self
    }

    pub fn with_backoff_millis(mut self, min: u64, max: u64) -> TestSettingsBuilder {
        self.settings.backoff_min_millis = min;
        self.settings.backoff_max_millis = max;
        self
    }

    pub fn with_watchtower_deadline_secs(mut self, secs: u64) -> TestSettingsBuilder {
        self.settings.watchtower_deadline_secs = secs;
        self
    }

    pub fn without_chain_watch(mut self) -> TestSettingsBuilder {
        self.settings.disable_chain_watch = true;
        self
    }

    pub fn build(self) -> Settings {
        self.settings
    }
}

impl Default for TestSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn test_settings() -> Settings {
    TestSettingsBuilder::new().build()
}

/// Deterministic 32 byte identifier, all bytes set to `n`.
pub fn channel_bytes(n: u8) -> [u8; 32] {
    [n; 32]
}

pub fn txid(n: u64) -> Txid {
    Txid::from_str(&format!("{n:064x}")).unwrap()
}

pub fn wallet_id(n: usize) -> String {
    format!("wallet-{n}")
}
