use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use std::{process, sync::Arc};

/// A logger instance for logfmt format (https://www.brandur.org/logfmt)
#[derive(Debug)]
pub struct SentinelLogger {
    node_id: String,
}

static SENTINEL_LOGGER: OnceCell<Arc<SentinelLogger>> = OnceCell::new();

impl SentinelLogger {
    pub fn init(node_id: &str, level_filter: LevelFilter) {
        let logger = SENTINEL_LOGGER.get_or_init(|| {
            Arc::new(SentinelLogger {
                node_id: node_id.to_string(),
            })
        });
        // This function gets called multiple times by the tests so ignore the error.
        let _ = log::set_logger(logger.as_ref()).map(|()| log::set_max_level(level_filter));
    }

    pub fn global() -> Option<Arc<SentinelLogger>> {
        SENTINEL_LOGGER.get().cloned()
    }

    fn format(&self, record: &Record) -> String {
        let level = record.level().to_string().to_lowercase();
        format!(
            "level={level} pid={} message=\"{}\" target=\"{}\" node_id={}",
            process::id(),
            record.args(),
            record.target(),
            self.node_id
        )
    }
}

impl Log for SentinelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("{}", self.format(record));
        }
    }

    fn flush(&self) {}
}
