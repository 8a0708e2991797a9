//! Per wallet persistence of watch outcomes and pending work.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};

use crate::watchtower::WatchOutcome;

const OUTCOMES_FILE: &str = "outcomes.jsonl";
const ATTEMPT_FILE: &str = "last_attempt.json";
const IN_FLIGHT_FILE: &str = "in_flight.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupted record in {path} at line {line}: {source}")]
    Corrupted {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// When the watchtower last ran and whether it finished in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchAttempt {
    pub timestamp: u64,
    pub failed: bool,
}

#[async_trait]
pub trait OutcomeStore: Send + Sync {
    async fn save_outcome(&self, outcome: &WatchOutcome) -> Result<()>;

    async fn latest_outcome(&self) -> Result<Option<WatchOutcome>>;

    async fn save_attempt(&self, attempt: &WatchAttempt) -> Result<()>;

    async fn last_attempt(&self) -> Result<Option<WatchAttempt>>;
}

/// The number of payments still in flight, persisted across restarts.
#[async_trait]
pub trait PendingWorkCounter: Send + Sync {
    fn in_flight_payments(&self) -> u32;

    /// Observe the count, the current value is seen first.
    fn subscribe(&self) -> watch::Receiver<u32>;

    async fn save_in_flight_payments(&self, count: u32) -> Result<()>;
}

pub trait WalletStore: OutcomeStore + PendingWorkCounter {}

impl<T: OutcomeStore + PendingWorkCounter> WalletStore for T {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InFlight {
    count: u32,
}

/// Stores everything as json files in one directory per wallet.
///
/// Outcomes are appended one per line, the last line is the latest outcome.
pub struct JsonFileStore {
    dir: PathBuf,
    in_flight: watch::Sender<u32>,
    write: Mutex<()>,
}

impl JsonFileStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<JsonFileStore> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create store directory {}", dir.display()))?;
        let in_flight: Option<InFlight> = read_json(&dir.join(IN_FLIGHT_FILE)).await?;
        let (in_flight, _) = watch::channel(in_flight.unwrap_or_default().count);
        Ok(JsonFileStore {
            dir,
            in_flight,
            write: Mutex::new(()),
        })
    }

    pub async fn for_wallet(data_dir: impl AsRef<Path>, wallet: &str) -> Result<JsonFileStore> {
        JsonFileStore::open(data_dir.as_ref().join("wallets").join(wallet)).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
    };
    let value = serde_json::from_str(&content).map_err(|source| StoreError::Corrupted {
        path: path.to_path_buf(),
        line: 1,
        source,
    })?;
    Ok(Some(value))
}

/// Writes next to the target then renames, a crash leaves either version intact.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec(value)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("cannot write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("cannot replace {}", path.display()))
}

#[async_trait]
impl OutcomeStore for JsonFileStore {
    async fn save_outcome(&self, outcome: &WatchOutcome) -> Result<()> {
        let mut line = serde_json::to_vec(outcome)?;
        line.push(b'\n');
        let path = self.dir.join(OUTCOMES_FILE);
        let _lock = self.write.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("cannot open {}", path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn latest_outcome(&self) -> Result<Option<WatchOutcome>> {
        let path = self.dir.join(OUTCOMES_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
        };
        let Some((index, line)) = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .last()
        else {
            return Ok(None);
        };
        let outcome = serde_json::from_str(line).map_err(|source| StoreError::Corrupted {
            path,
            line: index + 1,
            source,
        })?;
        Ok(Some(outcome))
    }

    async fn save_attempt(&self, attempt: &WatchAttempt) -> Result<()> {
        let _lock = self.write.lock().await;
        write_json(&self.dir.join(ATTEMPT_FILE), attempt).await
    }

    async fn last_attempt(&self) -> Result<Option<WatchAttempt>> {
        read_json(&self.dir.join(ATTEMPT_FILE)).await
    }
}

#[async_trait]
impl PendingWorkCounter for JsonFileStore {
    fn in_flight_payments(&self) -> u32 {
        *self.in_flight.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<u32> {
        self.in_flight.subscribe()
    }

    async fn save_in_flight_payments(&self, count: u32) -> Result<()> {
        {
            let _lock = self.write.lock().await;
            write_json(&self.dir.join(IN_FLIGHT_FILE), &InFlight { count }).await?;
        }
        self.in_flight.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
        Ok(())
    }
}
