use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use settings::Settings;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ConnectionLink, ConnectionState};
use crate::traffic::{TrafficControl, TrafficControlGate};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            min: Duration::from_millis(100),
            max: Duration::from_secs(8),
            multiplier: 2,
        }
    }
}

impl From<&Settings> for BackoffConfig {
    fn from(settings: &Settings) -> Self {
        BackoffConfig {
            min: Duration::from_millis(settings.backoff_min_millis),
            max: Duration::from_millis(settings.backoff_max_millis.max(settings.backoff_min_millis)),
            ..Default::default()
        }
    }
}

/// Exponential backoff between connection attempts of one active loop.
#[derive(Clone, Debug)]
pub struct RetryState {
    config: BackoffConfig,
    current: Duration,
    failures: u32,
}

impl RetryState {
    pub fn new(config: BackoffConfig) -> RetryState {
        RetryState {
            config,
            current: config.min,
            failures: 0,
        }
    }

    pub fn current_backoff(&self) -> Duration {
        self.current
    }

    /// Consecutive failed attempts since the last established connection.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a closed connection and returns how long to wait before the
    /// next attempt.
    pub fn on_closed(&mut self) -> Duration {
        let pause = self.current;
        self.failures = self.failures.saturating_add(1);
        self.current = self
            .current
            .saturating_mul(self.config.multiplier)
            .min(self.config.max);
        pause
    }

    pub fn on_established(&mut self) {
        self.current = self.config.min;
        self.failures = 0;
    }
}

/// How long a single connection attempt may take. The first attempts fail
/// fast, later ones are more lenient for slow networks.
pub fn connect_timeout(attempt: u32) -> Duration {
    match attempt {
        0..=1 => Duration::from_secs(2),
        2..=3 => Duration::from_secs(4),
        4..=6 => Duration::from_secs(7),
        7..=10 => Duration::from_secs(10),
        _ => Duration::from_secs(15),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Active,
    Retrying(Duration),
}

/// Keeps one [`ConnectionLink`] connected for as long as its gate says so.
pub struct ConnectionSupervisor {
    name: String,
    state: watch::Receiver<SupervisorState>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConnectionSupervisor {
    pub fn start(
        link: Arc<dyn ConnectionLink>,
        gate: &TrafficControlGate,
        config: BackoffConfig,
        cancel: CancellationToken,
    ) -> ConnectionSupervisor {
        let name = link.name().to_string();
        let (state_tx, state) = watch::channel(SupervisorState::Idle);
        let handle = tokio::spawn(supervise(
            link,
            gate.subscribe(),
            config,
            Arc::new(state_tx),
            cancel.clone(),
        ));
        ConnectionSupervisor {
            name,
            state,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Cancels any pending attempt, disconnects the link and waits for it.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("{} supervisor ended abnormally: {e}", self.name);
        }
    }
}

async fn supervise(
    link: Arc<dyn ConnectionLink>,
    mut decisions: mpsc::UnboundedReceiver<TrafficControl>,
    config: BackoffConfig,
    state: Arc<watch::Sender<SupervisorState>>,
    cancel: CancellationToken,
) {
    let mut active: Option<ActiveLoop> = None;
    let mut config_version = TrafficControl::default().config_version;
    loop {
        let control = tokio::select! {
            _ = cancel.cancelled() => break,
            control = decisions.recv() => match control {
                Some(control) => control,
                None => break,
            },
        };
        let restart = control.config_version != config_version;
        config_version = control.config_version;

        if restart || !control.should_connect() {
            if let Some(running) = active.take() {
                info!("disconnect and cancel {} connection loop", link.name());
                running.stop().await;
                disconnect(link.as_ref()).await;
                state.send_replace(SupervisorState::Idle);
            }
        }
        if active.as_ref().map_or(false, ActiveLoop::is_finished) {
            debug!("{} connection loop ended on its own", link.name());
            active = None;
        }
        if control.should_connect() && active.is_none() {
            debug!("starting {} connection loop", link.name());
            active = Some(ActiveLoop::spawn(
                link.clone(),
                config,
                state.clone(),
                cancel.child_token(),
            ));
        }
    }
    if let Some(running) = active.take() {
        running.stop().await;
        disconnect(link.as_ref()).await;
    }
    state.send_replace(SupervisorState::Idle);
}

async fn disconnect(link: &dyn ConnectionLink) {
    if tokio::time::timeout(DISCONNECT_TIMEOUT, link.disconnect())
        .await
        .is_err()
    {
        warn!("{} did not disconnect within {DISCONNECT_TIMEOUT:?}", link.name());
    }
}

struct ActiveLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActiveLoop {
    fn spawn(
        link: Arc<dyn ConnectionLink>,
        config: BackoffConfig,
        state: Arc<watch::Sender<SupervisorState>>,
        cancel: CancellationToken,
    ) -> ActiveLoop {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = connection_loop(link, config, state) => {}
            }
        });
        ActiveLoop { cancel, handle }
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Connects, follows the link until it closes, pauses and tries again.
async fn connection_loop(
    link: Arc<dyn ConnectionLink>,
    config: BackoffConfig,
    state: Arc<watch::Sender<SupervisorState>>,
) {
    let name = link.name().to_string();
    let mut retry = RetryState::new(config);
    let mut status = link.state();
    state.send_replace(SupervisorState::Active);
    loop {
        let attempt = retry.failures().saturating_add(1);
        let timeout = connect_timeout(attempt);
        let connected = match tokio::time::timeout(timeout, link.connect(attempt)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("error when connecting to {name}: {e}");
                false
            }
            Err(_) => {
                warn!("{name} connection attempt #{attempt} timed out after {timeout:?}");
                false
            }
        };

        if connected && !follow(&name, &mut status, &mut retry, timeout, &state).await {
            warn!("{name} link went away, stopping connection loop");
            state.send_replace(SupervisorState::Idle);
            return;
        }

        let pause = retry.on_closed();
        info!(
            "next {name} connection attempt #{} in {pause:?}",
            retry.failures()
        );
        state.send_replace(SupervisorState::Retrying(pause));
        tokio::time::sleep(pause).await;
        state.send_replace(SupervisorState::Active);
    }
}

/// Follows the link state until it is closed. Returns false when the link
/// stopped publishing its state.
async fn follow(
    name: &str,
    status: &mut watch::Receiver<ConnectionState>,
    retry: &mut RetryState,
    establishing_timeout: Duration,
    state: &watch::Sender<SupervisorState>,
) -> bool {
    loop {
        let current = *status.borrow_and_update();
        debug!("{name} connection state is {current}");
        match current {
            ConnectionState::Closed => return true,
            ConnectionState::Established => {
                retry.on_established();
                state.send_replace(SupervisorState::Active);
                if status.changed().await.is_err() {
                    return false;
                }
            }
            ConnectionState::Establishing => {
                match tokio::time::timeout(establishing_timeout, status.changed()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return false,
                    Err(_) => {
                        warn!("{name} still establishing after {establishing_timeout:?}");
                        return true;
                    }
                }
            }
        }
    }
}
