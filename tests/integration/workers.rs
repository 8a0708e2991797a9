use std::sync::Arc;
use std::time::Duration;

use test_utils::{channel_bytes, test_settings};
use tokio_util::sync::CancellationToken;
use wallet_sentinel::scheduler::{BackgroundScheduler, Schedule, TokioScheduler};
use wallet_sentinel::store::PendingWorkCounter;
use wallet_sentinel::traffic::Resource;
use wallet_sentinel::watchtower::{ChannelId, ChannelSnapshot, WatchOutcome};
use wallet_sentinel::workers::{
    SkipReason, VerificationRunner, VerificationWorker, WalletId, WalletJob, WorkerConfig,
    WorkerOutcome,
};

use crate::mocks::mock_session::{MockSession, MockSessionFactory};
use crate::mocks::{RecordingAlerts, RecordingScheduler, ScheduleCall};

fn channels() -> ChannelSnapshot {
    ChannelSnapshot::new().with_channel(ChannelId(channel_bytes(1)), None)
}

struct Setup {
    sessions: Arc<MockSessionFactory>,
    scheduler: Arc<RecordingScheduler>,
    alerts: Arc<RecordingAlerts>,
}

impl Setup {
    fn new() -> Setup {
        Setup {
            sessions: MockSessionFactory::new(),
            scheduler: Arc::new(RecordingScheduler::default()),
            alerts: Arc::new(RecordingAlerts::default()),
        }
    }

    fn worker(&self, config: WorkerConfig) -> Arc<VerificationWorker> {
        Arc::new(VerificationWorker::new(
            config,
            self.sessions.clone(),
            self.scheduler.clone(),
            self.alerts.clone(),
        ))
    }
}

fn payments_watcher() -> WorkerConfig {
    WorkerConfig::in_flight_payments_watcher(&test_settings())
}

#[tokio::test(start_paused = true)]
async fn test_skips() {
    let setup = Setup::new();
    let worker = setup.worker(payments_watcher());
    let open = WalletId::from("open");
    let locked = WalletId::from("locked");
    let idle = WalletId::from("idle");
    setup.sessions.add_wallet(&open, 1, Some(MockSession::new(channels(), 1)));
    setup.sessions.set_foreground(&open, true);
    setup.sessions.add_wallet(&locked, 1, Some(MockSession::new(channels(), 1)));
    setup.sessions.forget_secret(&locked);
    let session = MockSession::new(channels(), 0);
    setup.sessions.add_wallet(&idle, 0, Some(session.clone()));

    assert_eq!(
        worker.run(&open, CancellationToken::new()).await,
        WorkerOutcome::Skipped(SkipReason::ForegroundActive)
    );
    assert_eq!(
        worker.run(&locked, CancellationToken::new()).await,
        WorkerOutcome::Skipped(SkipReason::NoSecret)
    );
    assert_eq!(
        worker.run(&idle, CancellationToken::new()).await,
        WorkerOutcome::Skipped(SkipReason::NothingPending)
    );
    assert!(!session.is_stopped());
    assert!(setup.scheduler.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_payments_settle() {
    let setup = Setup::new();
    let worker = setup.worker(payments_watcher());
    let wallet = WalletId::from("wallet");
    let session = MockSession::new(channels(), 2);
    let store = setup.sessions.add_wallet(&wallet, 2, Some(session.clone()));
    let pending = session.pending.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        pending.set_in_flight(0);
    });

    let started = tokio::time::Instant::now();
    let outcome = worker.run(&wallet, CancellationToken::new()).await;

    assert_eq!(outcome, WorkerOutcome::Settled { channels: 1 });
    // Polls at 0s, 5s, 10s and 15s, the last two at zero.
    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(store.in_flight_saves(), 4);
    assert_eq!(store.in_flight_payments(), 0);
    assert!(session.is_stopped());
    assert!(matches!(
        store.outcomes().as_slice(),
        [WatchOutcome::Nominal {
            channels_watched: 1,
            ..
        }]
    ));
    assert!(setup.scheduler.calls().is_empty());
    for resource in Resource::ALL {
        let control = session.traffic.gate(resource).settled().await;
        assert_eq!(control.disconnect_votes, 0, "{resource}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_stuck_payments_time_out() {
    let setup = Setup::new();
    let config = payments_watcher();
    let worker = setup.worker(config.clone());
    let wallet = WalletId::from("stuck");
    let session = MockSession::new(channels(), 3);
    let store = setup.sessions.add_wallet(&wallet, 3, Some(session.clone()));

    let started = tokio::time::Instant::now();
    let outcome = worker.run(&wallet, CancellationToken::new()).await;

    assert_eq!(outcome, WorkerOutcome::TimedOut { in_flight: 3 });
    assert_eq!(started.elapsed(), config.hard_timeout);
    assert!(session.is_stopped());
    assert_eq!(
        *setup.alerts.pending.lock().unwrap(),
        vec![(wallet.clone(), 3)]
    );
    assert_eq!(
        setup.scheduler.calls(),
        vec![ScheduleCall::Once(
            "in-flight-payments-watcher.stuck".to_string(),
            Duration::from_secs(2 * 3600)
        )]
    );
    assert!(matches!(
        store.outcomes().as_slice(),
        [WatchOutcome::Unknown { .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_foreground_interrupts() {
    let setup = Setup::new();
    let worker = setup.worker(WorkerConfig::channels_watcher(&test_settings()));
    let wallet = WalletId::from("wallet");
    let session = MockSession::new(channels(), 1);
    setup.sessions.add_wallet(&wallet, 0, Some(session.clone()));
    let sessions = setup.sessions.clone();
    let opened = wallet.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        sessions.set_foreground(&opened, true);
    });

    let outcome = worker.run(&wallet, CancellationToken::new()).await;

    assert_eq!(outcome, WorkerOutcome::Interrupted);
    assert!(session.is_stopped());
    assert_eq!(
        setup.scheduler.calls(),
        vec![ScheduleCall::Once(
            "channels-watcher.wallet".to_string(),
            Duration::from_secs(2 * 3600)
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_channels() {
    let setup = Setup::new();
    let worker = setup.worker(WorkerConfig::channels_watcher(&test_settings()));
    let wallet = WalletId::from("empty");
    let session = MockSession::new(ChannelSnapshot::new(), 0);
    setup.sessions.add_wallet(&wallet, 0, Some(session.clone()));

    let outcome = worker.run(&wallet, CancellationToken::new()).await;
    assert_eq!(outcome, WorkerOutcome::NoChannels);
    assert!(session.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_wallets_run_in_isolation() {
    let setup = Setup::new();
    let worker = setup.worker(payments_watcher());
    let broken = WalletId::from("wallet-0");
    let settling = WalletId::from("wallet-1");
    let cancelled = WalletId::from("wallet-2");
    let broken_store = setup.sessions.add_wallet(&broken, 1, None);
    let settling_session = MockSession::new(channels(), 0);
    setup
        .sessions
        .add_wallet(&settling, 1, Some(settling_session.clone()));
    let cancelled_session = MockSession::new(channels(), 5);
    setup
        .sessions
        .add_wallet(&cancelled, 5, Some(cancelled_session.clone()));

    let runner = Arc::new(VerificationRunner::new(worker, CancellationToken::new()));
    let running = runner.clone();
    let wallets = vec![broken.clone(), settling.clone(), cancelled.clone()];
    let outcomes = tokio::spawn(async move { running.run_all(wallets).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(runner.cancel_wallet(&cancelled));
    let outcomes = outcomes.await.unwrap();

    assert_eq!(outcomes[&broken], WorkerOutcome::Unknown);
    assert!(matches!(
        broken_store.outcomes().as_slice(),
        [WatchOutcome::Unknown { .. }]
    ));
    assert_eq!(outcomes[&settling], WorkerOutcome::Settled { channels: 1 });
    assert_eq!(outcomes[&cancelled], WorkerOutcome::Interrupted);
    assert!(settling_session.is_stopped());
    assert!(cancelled_session.is_stopped());
    assert!(!runner.cancel_wallet(&cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_wallet_job_fires_again() {
    let sessions = MockSessionFactory::new();
    let scheduler = TokioScheduler::new(Duration::from_secs(600), CancellationToken::new());
    let config = payments_watcher();
    let worker = Arc::new(VerificationWorker::new(
        config.clone(),
        sessions.clone(),
        Arc::new(scheduler.clone()),
        Arc::new(RecordingAlerts::default()),
    ));
    let wallet = WalletId::from("stuck");
    let session = MockSession::new(channels(), 3);
    let store = sessions.add_wallet(&wallet, 3, Some(session.clone()));

    let job = WalletJob::new(worker, wallet.clone());
    let tag = job.tag();
    assert_eq!(tag, "in-flight-payments-watcher.stuck");
    scheduler.register(&tag, Arc::new(job));
    scheduler.schedule_once(&tag, Duration::ZERO);

    tokio::time::sleep(config.hard_timeout + Duration::from_secs(1)).await;
    assert_eq!(store.outcomes().len(), 1);
    assert!(session.is_stopped());
    assert_eq!(
        scheduler.schedule_of(&tag),
        Some(Schedule::Once {
            delay: config.retry_delay
        })
    );

    tokio::time::sleep(config.retry_delay + config.hard_timeout).await;
    assert!(matches!(
        store.outcomes().as_slice(),
        [WatchOutcome::Unknown { .. }, WatchOutcome::Unknown { .. }]
    ));
    assert_eq!(scheduler.active_tags(), vec![tag]);
}
