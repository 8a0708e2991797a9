//! Periodic check that no counterparty published a revoked commitment while
//! the wallet was offline.

mod latch;
mod task;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use bitcoin::Txid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::now_millis;

pub use latch::{Check, CompletionLatch};
pub use task::{WatchReport, WatchtowerConfig, WatchtowerTask, WATCHTOWER_TAG};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub [u8; 32]);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ChannelId({self})")
    }
}

impl FromStr for ChannelId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        let id: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("channel id must be 32 bytes"))?;
        Ok(ChannelId(id))
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChannelId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Closing data of a channel, once a closing transaction is known.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelClosingInfo {
    /// Revoked commitments of the counterparty seen on chain.
    pub revoked_commitments: BTreeSet<Txid>,
}

impl ChannelClosingInfo {
    pub fn with_revoked(txids: impl IntoIterator<Item = Txid>) -> ChannelClosingInfo {
        ChannelClosingInfo {
            revoked_commitments: txids.into_iter().collect(),
        }
    }
}

/// Every channel of the wallet with its closing info, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelSnapshot(BTreeMap<ChannelId, Option<ChannelClosingInfo>>);

impl ChannelSnapshot {
    pub fn new() -> ChannelSnapshot {
        ChannelSnapshot::default()
    }

    pub fn with_channel(mut self, id: ChannelId, closing: Option<ChannelClosingInfo>) -> Self {
        self.0.insert(id, closing);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelId> {
        self.0.keys()
    }

    fn revoked(&self, id: &ChannelId) -> Option<&BTreeSet<Txid>> {
        self.0
            .get(id)
            .and_then(|closing| closing.as_ref())
            .map(|closing| &closing.revoked_commitments)
    }

    /// Channels of `after` holding a revoked commitment this snapshot does not.
    pub fn new_revocations(&self, after: &ChannelSnapshot) -> BTreeSet<ChannelId> {
        after
            .0
            .keys()
            .filter(|id| {
                let Some(revoked) = after.revoked(id) else {
                    return false;
                };
                match self.revoked(id) {
                    Some(known) => !revoked.is_subset(known),
                    None => !revoked.is_empty(),
                }
            })
            .copied()
            .collect()
    }
}

impl From<BTreeMap<ChannelId, Option<ChannelClosingInfo>>> for ChannelSnapshot {
    fn from(channels: BTreeMap<ChannelId, Option<ChannelClosingInfo>>) -> Self {
        ChannelSnapshot(channels)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchOutcome {
    Nominal {
        channels_watched: usize,
        timestamp: u64,
    },
    RevokedFound {
        channels: BTreeSet<ChannelId>,
        timestamp: u64,
    },
    Unknown {
        timestamp: u64,
    },
}

impl WatchOutcome {
    pub fn nominal(channels_watched: usize) -> WatchOutcome {
        WatchOutcome::Nominal {
            channels_watched,
            timestamp: now_millis(),
        }
    }

    pub fn revoked_found(channels: BTreeSet<ChannelId>) -> WatchOutcome {
        WatchOutcome::RevokedFound {
            channels,
            timestamp: now_millis(),
        }
    }

    pub fn unknown() -> WatchOutcome {
        WatchOutcome::Unknown {
            timestamp: now_millis(),
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            WatchOutcome::Nominal { timestamp, .. }
            | WatchOutcome::RevokedFound { timestamp, .. }
            | WatchOutcome::Unknown { timestamp } => *timestamp,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WatchOutcome::Nominal { .. } => "nominal",
            WatchOutcome::RevokedFound { .. } => "revoked_found",
            WatchOutcome::Unknown { .. } => "unknown",
        }
    }
}

/// The channel state held by the protocol engine.
pub trait ChannelStateProvider: Send + Sync {
    fn snapshot(&self) -> ChannelSnapshot;

    fn subscribe(&self) -> watch::Receiver<ChannelSnapshot>;
}

/// Progress of the chain indexer synchronisation.
pub trait ChainSyncSignal: Send + Sync {
    /// The last time every watched channel was checked against the chain tip.
    fn up_to_date(&self) -> watch::Receiver<Option<Instant>>;
}
