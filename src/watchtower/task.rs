use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{info, warn};
use settings::Settings;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    ChainSyncSignal, ChannelStateProvider, Check, CompletionLatch, WatchOutcome,
};
use crate::alert::AlertSink;
use crate::connection::{ConnectionState, Connections};
use crate::scheduler::{BackgroundScheduler, ScheduledJob};
use crate::store::{OutcomeStore, PendingWorkCounter, WatchAttempt};
use crate::traffic::{ControlTarget, TrafficControls};
use crate::{log_error, now_millis, prometheus};

pub const WATCHTOWER_TAG: &str = "watchtower";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchtowerConfig {
    pub chain_watch: bool,
    pub deadline: Duration,
    pub settle_grace: Duration,
    pub interval: Duration,
    pub flex: Duration,
    pub retry_delay: Duration,
}

impl Default for WatchtowerConfig {
    fn default() -> Self {
        WatchtowerConfig {
            chain_watch: true,
            deadline: Duration::from_secs(30),
            settle_grace: Duration::from_secs(10),
            interval: Duration::from_secs(36 * 3600),
            flex: Duration::from_secs(12 * 3600),
            retry_delay: Duration::from_secs(30 * 60),
        }
    }
}

impl From<&Settings> for WatchtowerConfig {
    fn from(settings: &Settings) -> Self {
        WatchtowerConfig {
            chain_watch: !settings.disable_chain_watch,
            deadline: Duration::from_secs(settings.watchtower_deadline_secs),
            settle_grace: Duration::from_secs(settings.settle_grace_secs),
            interval: Duration::from_secs(settings.watchtower_interval_hours * 3600),
            flex: Duration::from_secs(settings.watchtower_flex_hours * 3600),
            retry_delay: Duration::from_secs(settings.watchtower_retry_minutes * 60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchReport {
    pub outcome: WatchOutcome,
    pub timed_out: bool,
}

/// One bounded watchtower pass: connect what is needed, wait for the chain
/// indexer and in-flight payments, diff the channels, disconnect again.
pub struct WatchtowerTask {
    config: WatchtowerConfig,
    traffic: Arc<TrafficControls>,
    channels: Arc<dyn ChannelStateProvider>,
    chain: Arc<dyn ChainSyncSignal>,
    pending: Arc<dyn PendingWorkCounter>,
    connections: watch::Receiver<Connections>,
    store: Arc<dyn OutcomeStore>,
    alerts: Arc<dyn AlertSink>,
    scheduler: Arc<dyn BackgroundScheduler>,
}

impl WatchtowerTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WatchtowerConfig,
        traffic: Arc<TrafficControls>,
        channels: Arc<dyn ChannelStateProvider>,
        chain: Arc<dyn ChainSyncSignal>,
        pending: Arc<dyn PendingWorkCounter>,
        connections: watch::Receiver<Connections>,
        store: Arc<dyn OutcomeStore>,
        alerts: Arc<dyn AlertSink>,
        scheduler: Arc<dyn BackgroundScheduler>,
    ) -> WatchtowerTask {
        WatchtowerTask {
            config,
            traffic,
            channels,
            chain,
            pending,
            connections,
            store,
            alerts,
            scheduler,
        }
    }

    /// Resources the checks of a run need connected.
    pub fn target(chain_watch: bool, settle: bool) -> ControlTarget {
        match (chain_watch, settle) {
            (_, true) => ControlTarget::PEER | ControlTarget::ELECTRUM,
            (true, false) => ControlTarget::ELECTRUM,
            (false, false) => ControlTarget::NONE,
        }
    }

    pub async fn run(&self, deadline: CancellationToken) -> WatchReport {
        let before = self.channels.snapshot();
        if before.is_empty() {
            info!("no channels found, nothing to watch");
            return WatchReport {
                outcome: WatchOutcome::nominal(0),
                timed_out: false,
            };
        }

        let chain_watch = self.config.chain_watch;
        let settle = self.pending.in_flight_payments() > 0;
        let target = WatchtowerTask::target(chain_watch, settle);
        info!(
            "watching {} channel(s), chain_watch={chain_watch} settle={settle} target={target}",
            before.len()
        );

        let vote = self.traffic.hold_connected(target);
        let voted_at = Instant::now();
        let latch = CompletionLatch::new(chain_watch, settle);
        let mut checks = JoinSet::new();
        if chain_watch {
            let up_to_date = self.chain.up_to_date();
            let latch = latch.clone();
            checks.spawn(async move {
                report(&latch, Check::ChainWatch, wait_chain_sync(up_to_date, voted_at).await)
            });
        }
        if settle {
            let pending = self.pending.subscribe();
            let connections = self.connections.clone();
            let grace = self.config.settle_grace;
            let latch = latch.clone();
            checks.spawn(async move {
                report(
                    &latch,
                    Check::Settlement,
                    wait_settlement(pending, connections, grace).await,
                )
            });
        }

        tokio::select! {
            _ = latch.wait() => {}
            _ = deadline.cancelled() => {}
            _ = tokio::time::sleep(self.config.deadline) => {}
        }
        let timed_out = !latch.seal();
        if timed_out {
            warn!("watchtower checks did not complete in time");
        }

        checks.abort_all();
        vote.release();

        let after = self.channels.snapshot();
        let revoked = before.new_revocations(&after);
        let outcome = if !revoked.is_empty() {
            self.alerts.notify_revoked_commit_found(&revoked);
            WatchOutcome::revoked_found(revoked)
        } else if timed_out {
            WatchOutcome::unknown()
        } else {
            WatchOutcome::nominal(after.len())
        };
        info!("watchtower outcome: {outcome:?}");
        prometheus::record_watch_outcome(&outcome);

        self.persist(&outcome, timed_out).await;
        self.rearm(timed_out);
        WatchReport { outcome, timed_out }
    }

    async fn persist(&self, outcome: &WatchOutcome, timed_out: bool) {
        if let Err(e) = self.store.save_outcome(outcome).await {
            log_error(&e);
        }
        let attempt = WatchAttempt {
            timestamp: now_millis(),
            failed: timed_out,
        };
        if let Err(e) = self.store.save_attempt(&attempt).await {
            log_error(&e);
        }
    }

    fn rearm(&self, timed_out: bool) {
        if timed_out {
            self.scheduler
                .schedule_once(WATCHTOWER_TAG, self.config.retry_delay);
        } else {
            self.scheduler.schedule_periodic(
                WATCHTOWER_TAG,
                self.config.interval,
                self.config.flex,
            );
        }
    }
}

#[async_trait]
impl ScheduledJob for WatchtowerTask {
    async fn run(&self, deadline: CancellationToken) {
        WatchtowerTask::run(self, deadline).await;
    }
}

fn report(latch: &CompletionLatch, check: Check, result: Result<()>) {
    match result {
        Ok(()) => {
            if latch.complete(check) {
                info!("{check:?} complete");
            }
        }
        Err(e) => warn!("{check:?} did not complete: {e}"),
    }
}

/// Waits for the indexer to report a synchronisation newer than `since`.
async fn wait_chain_sync(
    mut up_to_date: watch::Receiver<Option<Instant>>,
    since: Instant,
) -> Result<()> {
    up_to_date
        .wait_for(|synced| synced.is_some_and(|at| at > since))
        .await
        .map_err(|_| anyhow!("chain indexer stopped reporting"))?;
    Ok(())
}

/// Waits for in-flight payments to drain, or for a grace period once every
/// connection is established.
async fn wait_settlement(
    mut pending: watch::Receiver<u32>,
    mut connections: watch::Receiver<Connections>,
    grace: Duration,
) -> Result<()> {
    let drained = async {
        pending
            .wait_for(|count| *count == 0)
            .await
            .map_err(|_| anyhow!("in-flight payments are no longer reported"))?;
        Ok::<_, anyhow::Error>(())
    };
    let grace_elapsed = async {
        connections
            .wait_for(|c| c.global == ConnectionState::Established)
            .await
            .map_err(|_| anyhow!("connections are no longer monitored"))?;
        info!("connected, allowing {grace:?} for in-flight payments to settle");
        tokio::time::sleep(grace).await;
        Ok::<_, anyhow::Error>(())
    };
    tokio::select! {
        result = drained => result,
        result = grace_elapsed => result,
    }
}
