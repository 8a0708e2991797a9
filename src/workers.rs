//! Headless verification of wallets nobody has open.
//!
//! A worker starts a background session for one wallet, waits until its
//! in-flight payments settle or a hard timer expires, then tears the session
//! down. Every wallet runs under its own cancellation subtree.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use settings::Settings;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::alert::AlertSink;
use crate::connection::{ConnectionState, Connections};
use crate::log_error;
use crate::scheduler::{BackgroundScheduler, ScheduledJob};
use crate::store::{PendingWorkCounter, WalletStore};
use crate::traffic::{ControlTarget, TrafficControls};
use crate::watchtower::{ChannelStateProvider, WatchOutcome};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletId(String);

impl WalletId {
    pub fn new(id: impl Into<String>) -> WalletId {
        WalletId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WalletId {
    fn from(id: &str) -> Self {
        WalletId::new(id)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no secret stored for {0}")]
    MissingSecret(WalletId),
    #[error("cannot start session for {wallet}: {reason}")]
    Startup { wallet: WalletId, reason: String },
}

/// A background instance of the protocol engine for one wallet.
#[async_trait]
pub trait HeadlessSession: Send + Sync {
    fn traffic(&self) -> Arc<TrafficControls>;

    fn channels(&self) -> Arc<dyn ChannelStateProvider>;

    /// Live count of payments in flight, as seen by the engine.
    fn pending(&self) -> Arc<dyn PendingWorkCounter>;

    fn connections(&self) -> watch::Receiver<Connections>;

    async fn stop(&self);
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Whether the user has the wallet open right now.
    fn foreground_active(&self, wallet: &WalletId) -> bool;

    fn has_secret(&self, wallet: &WalletId) -> bool;

    async fn store(&self, wallet: &WalletId) -> Result<Arc<dyn WalletStore>>;

    async fn start_headless(
        &self,
        wallet: &WalletId,
    ) -> Result<Arc<dyn HeadlessSession>, SessionError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub tag: &'static str,
    pub poll_interval: Duration,
    /// Consecutive polls at zero in-flight payments before the wallet counts as settled.
    pub stable_polls: u32,
    pub hard_timeout: Duration,
    pub retry_delay: Duration,
    /// Skip wallets whose persisted in-flight count is zero.
    pub require_pending_work: bool,
}

impl WorkerConfig {
    pub fn channels_watcher(settings: &Settings) -> WorkerConfig {
        WorkerConfig {
            tag: "channels-watcher",
            poll_interval: Duration::from_secs(settings.worker_poll_secs),
            stable_polls: 2,
            hard_timeout: Duration::from_secs(settings.worker_timeout_secs),
            retry_delay: Duration::from_secs(settings.worker_retry_minutes * 60),
            require_pending_work: false,
        }
    }

    pub fn in_flight_payments_watcher(settings: &Settings) -> WorkerConfig {
        WorkerConfig {
            tag: "in-flight-payments-watcher",
            require_pending_work: true,
            ..WorkerConfig::channels_watcher(settings)
        }
    }

    fn wallet_tag(&self, wallet: &WalletId) -> String {
        format!("{}.{wallet}", self.tag)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    ForegroundActive,
    NoSecret,
    NothingPending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    Skipped(SkipReason),
    NoChannels,
    Settled { channels: usize },
    /// The wallet was opened in the foreground, or the run was cancelled.
    Interrupted,
    TimedOut { in_flight: u32 },
    /// The headless session could not be started.
    Unknown,
}

pub struct VerificationWorker {
    config: WorkerConfig,
    sessions: Arc<dyn SessionFactory>,
    scheduler: Arc<dyn BackgroundScheduler>,
    alerts: Arc<dyn AlertSink>,
}

impl VerificationWorker {
    pub fn new(
        config: WorkerConfig,
        sessions: Arc<dyn SessionFactory>,
        scheduler: Arc<dyn BackgroundScheduler>,
        alerts: Arc<dyn AlertSink>,
    ) -> VerificationWorker {
        VerificationWorker {
            config,
            sessions,
            scheduler,
            alerts,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn run(&self, wallet: &WalletId, cancel: CancellationToken) -> WorkerOutcome {
        if self.sessions.foreground_active(wallet) {
            info!("{wallet} is open in the foreground, skipping {}", self.config.tag);
            return WorkerOutcome::Skipped(SkipReason::ForegroundActive);
        }
        if !self.sessions.has_secret(wallet) {
            info!("no secret for {wallet}, skipping {}", self.config.tag);
            return WorkerOutcome::Skipped(SkipReason::NoSecret);
        }
        let store = match self.sessions.store(wallet).await {
            Ok(store) => store,
            Err(e) => {
                log_error(&e);
                return WorkerOutcome::Unknown;
            }
        };
        if self.config.require_pending_work && store.in_flight_payments() == 0 {
            debug!("{wallet} has no payment in flight");
            return WorkerOutcome::Skipped(SkipReason::NothingPending);
        }

        let session = match self.sessions.start_headless(wallet).await {
            Ok(session) => session,
            Err(e) => {
                warn!("{e}");
                if let Err(e) = store.save_outcome(&WatchOutcome::unknown()).await {
                    log_error(&e);
                }
                return WorkerOutcome::Unknown;
            }
        };
        info!("{} started for {wallet}", self.config.tag);
        session
            .traffic()
            .force_reconnect(ControlTarget::PEER | ControlTarget::ELECTRUM);

        let outcome = self.watch(wallet, &session, &store, cancel).await;
        info!("{} finished for {wallet}: {outcome:?}", self.config.tag);

        let traffic = session.traffic();
        let disconnect = traffic.hold_disconnected(ControlTarget::ALL);
        session.stop().await;
        disconnect.release();

        self.conclude(wallet, &store, outcome).await;
        outcome
    }

    /// Races the poller, the hard timer and the foreground check. The first
    /// to finish cancels the others.
    async fn watch(
        &self,
        wallet: &WalletId,
        session: &Arc<dyn HeadlessSession>,
        store: &Arc<dyn WalletStore>,
        cancel: CancellationToken,
    ) -> WorkerOutcome {
        let stop = cancel.child_token();
        let mut tasks: JoinSet<Option<WorkerOutcome>> = JoinSet::new();
        let poll_interval = self.config.poll_interval;

        let token = stop.clone();
        let poller = poll(
            wallet.clone(),
            session.clone(),
            store.clone(),
            poll_interval,
            self.config.stable_polls,
        );
        tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => None,
                outcome = poller => Some(outcome),
            }
        });

        let token = stop.clone();
        let hard_timeout = self.config.hard_timeout;
        let pending = session.pending();
        tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => None,
                _ = tokio::time::sleep(hard_timeout) => Some(WorkerOutcome::TimedOut {
                    in_flight: pending.in_flight_payments(),
                }),
            }
        });

        let token = stop.clone();
        let sessions = self.sessions.clone();
        let foreground = wallet.clone();
        tasks.spawn(async move {
            let mut ticks = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return None,
                    _ = ticks.tick() => {}
                }
                if sessions.foreground_active(&foreground) {
                    info!("{foreground} opened in the foreground, interrupting");
                    return Some(WorkerOutcome::Interrupted);
                }
            }
        });

        let mut outcome = WorkerOutcome::Interrupted;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(first)) => {
                    outcome = first;
                    break;
                }
                Ok(None) => {}
                Err(e) => error!("{wallet} watch task failed: {e}"),
            }
        }
        stop.cancel();
        tasks.shutdown().await;
        outcome
    }

    async fn conclude(&self, wallet: &WalletId, store: &Arc<dyn WalletStore>, outcome: WorkerOutcome) {
        let record = match outcome {
            WorkerOutcome::NoChannels => Some(WatchOutcome::nominal(0)),
            WorkerOutcome::Settled { channels } => Some(WatchOutcome::nominal(channels)),
            WorkerOutcome::TimedOut { .. } => Some(WatchOutcome::unknown()),
            _ => None,
        };
        if let Some(record) = record {
            if let Err(e) = store.save_outcome(&record).await {
                log_error(&e);
            }
        }
        match outcome {
            WorkerOutcome::TimedOut { in_flight } => {
                if in_flight > 0 {
                    self.alerts.notify_pending_payments(wallet, in_flight);
                }
                self.scheduler
                    .schedule_once(&self.config.wallet_tag(wallet), self.config.retry_delay);
            }
            WorkerOutcome::Interrupted => {
                self.scheduler
                    .schedule_once(&self.config.wallet_tag(wallet), self.config.retry_delay);
            }
            _ => {}
        }
    }
}

/// Polls the session until the channels are gone or the in-flight count
/// stayed at zero long enough. Every poll persists the count.
async fn poll(
    wallet: WalletId,
    session: Arc<dyn HeadlessSession>,
    store: Arc<dyn WalletStore>,
    poll_interval: Duration,
    stable_polls: u32,
) -> WorkerOutcome {
    let mut connections = session.connections();
    if connections
        .wait_for(|c| c.global == ConnectionState::Established)
        .await
        .is_err()
    {
        warn!("{wallet} session stopped reporting connections");
    }
    let channels = session.channels();
    let pending = session.pending();
    let mut zero_polls = 0;
    let mut index = 0;
    loop {
        index += 1;
        let snapshot = channels.snapshot();
        let in_flight = pending.in_flight_payments();
        if let Err(e) = store.save_in_flight_payments(in_flight).await {
            log_error(&e);
        }
        if snapshot.is_empty() {
            info!("{wallet} has no channels");
            return WorkerOutcome::NoChannels;
        }
        if in_flight == 0 {
            zero_polls += 1;
            if zero_polls >= stable_polls {
                return WorkerOutcome::Settled {
                    channels: snapshot.len(),
                };
            }
        } else {
            zero_polls = 0;
        }
        debug!("{wallet}: {in_flight} payment(s) in flight, next check (#{index}) in {poll_interval:?}");
        tokio::time::sleep(poll_interval).await;
    }
}

/// Runs a worker for every wallet, each under its own cancellation subtree.
pub struct VerificationRunner {
    worker: Arc<VerificationWorker>,
    cancel: CancellationToken,
    wallets: Mutex<HashMap<WalletId, CancellationToken>>,
}

impl VerificationRunner {
    pub fn new(worker: Arc<VerificationWorker>, cancel: CancellationToken) -> VerificationRunner {
        VerificationRunner {
            worker,
            cancel,
            wallets: Mutex::new(HashMap::new()),
        }
    }

    fn wallets(&self) -> std::sync::MutexGuard<'_, HashMap<WalletId, CancellationToken>> {
        match self.wallets.lock() {
            Ok(wallets) => wallets,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Tears down every task of `wallet`, others are left alone.
    pub fn cancel_wallet(&self, wallet: &WalletId) -> bool {
        match self.wallets().remove(wallet) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    pub async fn run_all(&self, wallets: Vec<WalletId>) -> BTreeMap<WalletId, WorkerOutcome> {
        let mut tasks = JoinSet::new();
        for wallet in wallets {
            let token = self.cancel.child_token();
            self.wallets().insert(wallet.clone(), token.clone());
            let worker = self.worker.clone();
            tasks.spawn(async move {
                let outcome = worker.run(&wallet, token).await;
                (wallet, outcome)
            });
        }
        let mut outcomes = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((wallet, outcome)) => {
                    self.wallets().remove(&wallet);
                    outcomes.insert(wallet, outcome);
                }
                Err(e) => error!("wallet worker failed: {e}"),
            }
        }
        outcomes
    }
}

/// Runs one worker for one wallet whenever its tag fires.
pub struct WalletJob {
    worker: Arc<VerificationWorker>,
    wallet: WalletId,
}

impl WalletJob {
    pub fn new(worker: Arc<VerificationWorker>, wallet: WalletId) -> WalletJob {
        WalletJob { worker, wallet }
    }

    pub fn tag(&self) -> String {
        self.worker.config.wallet_tag(&self.wallet)
    }
}

#[async_trait]
impl ScheduledJob for WalletJob {
    async fn run(&self, deadline: CancellationToken) {
        self.worker.run(&self.wallet, deadline).await;
    }
}
