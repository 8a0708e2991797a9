//! Tag based scheduling of background jobs.
//!
//! Scheduling a tag replaces whatever was scheduled under that tag, so a
//! job may re-arm itself any number of times without piling up timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ScheduledJob: Send + Sync {
    /// Runs the job once. `deadline` is cancelled when the execution window
    /// closes, the job must then clean up and return.
    async fn run(&self, deadline: CancellationToken);
}

pub trait BackgroundScheduler: Send + Sync {
    /// Run `tag` once after `delay`, replacing any schedule it had.
    fn schedule_once(&self, tag: &str, delay: Duration);

    /// Run `tag` every `interval`, each run starting anywhere in the last
    /// `flex` of the interval. Replaces any schedule it had.
    fn schedule_periodic(&self, tag: &str, interval: Duration, flex: Duration);

    fn cancel(&self, tag: &str);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    Once { delay: Duration },
    Periodic { interval: Duration, flex: Duration },
}

impl Schedule {
    fn next_delay(&self) -> Duration {
        match *self {
            Schedule::Once { delay } => delay,
            Schedule::Periodic { interval, flex } => {
                let flex = flex.min(interval);
                let jitter = if flex.is_zero() {
                    Duration::ZERO
                } else {
                    rand::thread_rng().gen_range(Duration::ZERO..=flex)
                };
                interval - flex + jitter
            }
        }
    }
}

struct Entry {
    generation: u64,
    schedule: Schedule,
    token: CancellationToken,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<String, Arc<dyn ScheduledJob>>,
    entries: HashMap<String, Entry>,
    generation: u64,
}

struct Inner {
    execution_window: Duration,
    registry: Mutex<Registry>,
    cancel: CancellationToken,
}

impl Inner {
    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// [`BackgroundScheduler`] on top of tokio timers.
#[derive(Clone)]
pub struct TokioScheduler {
    inner: Arc<Inner>,
}

impl TokioScheduler {
    pub fn new(execution_window: Duration, cancel: CancellationToken) -> TokioScheduler {
        TokioScheduler {
            inner: Arc::new(Inner {
                execution_window,
                registry: Mutex::new(Registry::default()),
                cancel,
            }),
        }
    }

    /// Registers the job run whenever `tag` fires.
    pub fn register(&self, tag: &str, job: Arc<dyn ScheduledJob>) {
        self.inner.registry().jobs.insert(tag.to_string(), job);
    }

    pub fn schedule_of(&self, tag: &str) -> Option<Schedule> {
        self.inner.registry().entries.get(tag).map(|e| e.schedule)
    }

    /// Tags currently holding a schedule.
    pub fn active_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.inner.registry().entries.keys().cloned().collect();
        tags.sort();
        tags
    }

    fn replace(&self, tag: &str, schedule: Schedule) {
        let token = self.inner.cancel.child_token();
        let generation = {
            let mut registry = self.inner.registry();
            registry.generation += 1;
            let generation = registry.generation;
            let previous = registry.entries.insert(
                tag.to_string(),
                Entry {
                    generation,
                    schedule,
                    token: token.clone(),
                },
            );
            if let Some(previous) = previous {
                debug!("replacing {:?} schedule of {tag}", previous.schedule);
                previous.token.cancel();
            }
            generation
        };
        tokio::spawn(timer(
            self.inner.clone(),
            tag.to_string(),
            schedule,
            generation,
            token,
        ));
    }
}

impl BackgroundScheduler for TokioScheduler {
    fn schedule_once(&self, tag: &str, delay: Duration) {
        info!("scheduling {tag} once in {delay:?}");
        self.replace(tag, Schedule::Once { delay })
    }

    fn schedule_periodic(&self, tag: &str, interval: Duration, flex: Duration) {
        info!("scheduling {tag} every {interval:?} (flex {flex:?})");
        self.replace(tag, Schedule::Periodic { interval, flex })
    }

    fn cancel(&self, tag: &str) {
        if let Some(entry) = self.inner.registry().entries.remove(tag) {
            info!("cancelled schedule of {tag}");
            entry.token.cancel();
        }
    }
}

async fn timer(
    inner: Arc<Inner>,
    tag: String,
    schedule: Schedule,
    generation: u64,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(schedule.next_delay()) => {}
        }
        if let Schedule::Once { .. } = schedule {
            let mut registry = inner.registry();
            if registry
                .entries
                .get(&tag)
                .is_some_and(|e| e.generation == generation)
            {
                registry.entries.remove(&tag);
            }
        }
        fire(&inner, &tag);
        if let Schedule::Once { .. } = schedule {
            return;
        }
    }
}

/// Starts a run of the job registered under `tag`. The run is detached from
/// the schedule so that it can re-arm its own tag.
fn fire(inner: &Arc<Inner>, tag: &str) {
    let job = inner.registry().jobs.get(tag).cloned();
    let Some(job) = job else {
        warn!("{tag} fired but no job is registered for it");
        return;
    };
    let deadline = inner.cancel.child_token();
    let window = inner.execution_window;
    let tag = tag.to_string();
    tokio::spawn(async move {
        let expiry = deadline.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            expiry.cancel();
        });
        info!("running {tag}");
        job.run(deadline).await;
        timer.abort();
        debug!("{tag} finished");
    });
}
