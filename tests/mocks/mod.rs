#![allow(dead_code)]


use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use wallet_sentinel::alert::{AlertSink, LogAlertSink};
use wallet_sentinel::connection::{ConnectionLink, ConnectionState, LinkError};
use wallet_sentinel::network::{NetworkMonitor, NetworkState};
use wallet_sentinel::scheduler::BackgroundScheduler;
use wallet_sentinel::store::{OutcomeStore, PendingWorkCounter, WatchAttempt};
use wallet_sentinel::watchtower::{ChainSyncSignal, ChannelId, ChannelSnapshot, ChannelStateProvider, WatchOutcome};
use wallet_sentinel::workers::WalletId;

pub struct MockLink {
    name: String,
    state: watch::Sender<ConnectionState>,
    refuse: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
    disconnects: AtomicU32,
}

impl MockLink {
    pub fn new(name: &str) -> Arc<MockLink> {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Arc::new(MockLink {
            name: name.to_string(),
            state,
            refuse: AtomicBool::new(false),
            attempts: Mutex::new(vec![]),
            disconnects: AtomicU32::new(0),
        })
    }

    pub fn refusing(name: &str) -> Arc<MockLink> {
        let link = MockLink::new(name);
        link.refuse(true);
        link
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// The remote end closes the connection.
    pub fn drop_connection(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

#[async_trait]
impl ConnectionLink for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn connect(&self, _attempt: u32) -> Result<(), LinkError> {
        self.attempts.lock().unwrap().push(Instant::now());
        if self.refuse.load(Ordering::SeqCst) {
            self.state.send_replace(ConnectionState::Closed);
            return Err(LinkError::Aborted(self.name.clone(), "refused".to_string()));
        }
        self.state.send_replace(ConnectionState::Established);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Closed);
    }
}

pub struct MockNetwork {
    state: watch::Sender<NetworkState>,
}

impl MockNetwork {
    pub fn new(available: bool) -> MockNetwork {
        let (state, _) = watch::channel(NetworkState::NotAvailable);
        let network = MockNetwork { state };
        network.set_available(available);
        network
    }

    pub fn set_available(&self, available: bool) {
        self.state.send_replace(if available {
            NetworkState::Available
        } else {
            NetworkState::NotAvailable
        });
    }
}

impl NetworkMonitor for MockNetwork {
    fn network_state(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }
}

pub struct MockChannels {
    snapshot: watch::Sender<ChannelSnapshot>,
}

impl MockChannels {
    pub fn new(snapshot: ChannelSnapshot) -> Arc<MockChannels> {
        let (snapshot, _) = watch::channel(snapshot);
        Arc::new(MockChannels { snapshot })
    }

    pub fn set(&self, snapshot: ChannelSnapshot) {
        self.snapshot.send_replace(snapshot);
    }
}

impl ChannelStateProvider for MockChannels {
    fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshot.subscribe()
    }
}

pub struct MockChain {
    synced: Mutex<Option<watch::Sender<Option<Instant>>>>,
}

impl MockChain {
    pub fn new() -> Arc<MockChain> {
        let (synced, _) = watch::channel(None);
        Arc::new(MockChain {
            synced: Mutex::new(Some(synced)),
        })
    }

    pub fn mark_synced(&self) {
        if let Some(synced) = self.synced.lock().unwrap().as_ref() {
            synced.send_replace(Some(Instant::now()));
        }
    }

    /// Marks the chain synced after `delay`, running `before` right before.
    pub fn sync_after(self: &Arc<Self>, delay: Duration, before: impl FnOnce() + Send + 'static) {
        let chain = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            before();
            chain.mark_synced();
        });
    }

    /// The indexer goes away, observers see a closed signal.
    pub fn close(&self) {
        self.synced.lock().unwrap().take();
    }
}

impl ChainSyncSignal for MockChain {
    fn up_to_date(&self) -> watch::Receiver<Option<Instant>> {
        match self.synced.lock().unwrap().as_ref() {
            Some(synced) => synced.subscribe(),
            None => watch::channel(None).1,
        }
    }
}

/// In memory [`OutcomeStore`] and [`PendingWorkCounter`].
pub struct MemoryStore {
    outcomes: Mutex<Vec<WatchOutcome>>,
    attempts: Mutex<Vec<WatchAttempt>>,
    in_flight: watch::Sender<u32>,
    saves: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Arc<MemoryStore> {
        MemoryStore::with_in_flight(0)
    }

    pub fn with_in_flight(count: u32) -> Arc<MemoryStore> {
        let (in_flight, _) = watch::channel(count);
        Arc::new(MemoryStore {
            outcomes: Mutex::new(vec![]),
            attempts: Mutex::new(vec![]),
            in_flight,
            saves: AtomicU32::new(0),
        })
    }

    pub fn set_in_flight(&self, count: u32) {
        self.in_flight.send_replace(count);
    }

    pub fn outcomes(&self) -> Vec<WatchOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> Vec<WatchAttempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn in_flight_saves(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutcomeStore for MemoryStore {
    async fn save_outcome(&self, outcome: &WatchOutcome) -> Result<()> {
        self.outcomes.lock().unwrap().push(outcome.clone());
        Ok(())
    }

    async fn latest_outcome(&self) -> Result<Option<WatchOutcome>> {
        Ok(self.outcomes.lock().unwrap().last().cloned())
    }

    async fn save_attempt(&self, attempt: &WatchAttempt) -> Result<()> {
        self.attempts.lock().unwrap().push(*attempt);
        Ok(())
    }

    async fn last_attempt(&self) -> Result<Option<WatchAttempt>> {
        Ok(self.attempts.lock().unwrap().last().copied())
    }
}

#[async_trait]
impl PendingWorkCounter for MemoryStore {
    fn in_flight_payments(&self) -> u32 {
        *self.in_flight.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<u32> {
        self.in_flight.subscribe()
    }

    async fn save_in_flight_payments(&self, count: u32) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.in_flight.send_replace(count);
        Ok(())
    }
}

/// Records alerts, and logs them like a headless deployment would.
#[derive(Default)]
pub struct RecordingAlerts {
    pub revoked: Mutex<Vec<BTreeSet<ChannelId>>>,
    pub pending: Mutex<Vec<(WalletId, u32)>>,
    log: LogAlertSink,
}

impl AlertSink for RecordingAlerts {
    fn notify_revoked_commit_found(&self, channels: &BTreeSet<ChannelId>) {
        self.log.notify_revoked_commit_found(channels);
        self.revoked.lock().unwrap().push(channels.clone());
    }

    fn notify_pending_payments(&self, wallet: &WalletId, in_flight: u32) {
        self.log.notify_pending_payments(wallet, in_flight);
        self.pending.lock().unwrap().push((wallet.clone(), in_flight));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleCall {
    Once(String, Duration),
    Periodic(String, Duration, Duration),
    Cancel(String),
}

#[derive(Default)]
pub struct RecordingScheduler {
    calls: Mutex<Vec<ScheduleCall>>,
}

impl RecordingScheduler {
    pub fn calls(&self) -> Vec<ScheduleCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl BackgroundScheduler for RecordingScheduler {
    fn schedule_once(&self, tag: &str, delay: Duration) {
        self.calls
            .lock()
            .unwrap()
            .push(ScheduleCall::Once(tag.to_string(), delay));
    }

    fn schedule_periodic(&self, tag: &str, interval: Duration, flex: Duration) {
        self.calls
            .lock()
            .unwrap()
            .push(ScheduleCall::Periodic(tag.to_string(), interval, flex));
    }

    fn cancel(&self, tag: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(ScheduleCall::Cancel(tag.to_string()));
    }
}
