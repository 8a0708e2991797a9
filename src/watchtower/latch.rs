use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Check {
    ChainWatch,
    Settlement,
}

#[derive(Clone, Copy, Debug, Default)]
struct LatchState {
    chain_watch: bool,
    settlement: bool,
    sealed: bool,
}

impl LatchState {
    fn complete(&self) -> bool {
        self.chain_watch && self.settlement
    }
}

/// Resolves once every needed check reported completion.
///
/// Once sealed, late reports are ignored so the run's verdict cannot change
/// after the deadline.
#[derive(Clone)]
pub struct CompletionLatch {
    state: Arc<watch::Sender<LatchState>>,
}

impl CompletionLatch {
    /// Checks that are not needed start completed.
    pub fn new(chain_watch_needed: bool, settlement_needed: bool) -> CompletionLatch {
        let (state, _) = watch::channel(LatchState {
            chain_watch: !chain_watch_needed,
            settlement: !settlement_needed,
            sealed: false,
        });
        CompletionLatch {
            state: Arc::new(state),
        }
    }

    /// Returns false when the check was already complete or the latch is sealed.
    pub fn complete(&self, check: Check) -> bool {
        self.state.send_if_modified(|state| {
            if state.sealed {
                return false;
            }
            let flag = match check {
                Check::ChainWatch => &mut state.chain_watch,
                Check::Settlement => &mut state.settlement,
            };
            if *flag {
                return false;
            }
            *flag = true;
            true
        })
    }

    pub fn is_complete(&self) -> bool {
        self.state.borrow().complete()
    }

    /// Stops accepting reports, returns whether every check completed.
    pub fn seal(&self) -> bool {
        self.state.send_modify(|state| state.sealed = true);
        self.is_complete()
    }

    pub async fn wait(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| state.complete()).await;
    }
}
