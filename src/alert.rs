use std::collections::BTreeSet;

use log::{info, warn};

use crate::watchtower::ChannelId;
use crate::workers::WalletId;

/// User facing notifications raised by background checks.
pub trait AlertSink: Send + Sync {
    fn notify_revoked_commit_found(&self, channels: &BTreeSet<ChannelId>);

    /// Payments of `wallet` were still in flight when the background worker gave up.
    fn notify_pending_payments(&self, wallet: &WalletId, in_flight: u32);
}

/// Writes alerts to the log, for headless deployments.
#[derive(Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify_revoked_commit_found(&self, channels: &BTreeSet<ChannelId>) {
        for channel in channels {
            warn!("revoked commitment published for channel {channel}");
        }
    }

    fn notify_pending_payments(&self, wallet: &WalletId, in_flight: u32) {
        info!("{wallet} still has {in_flight} payment(s) in flight, open the wallet to settle them");
    }
}
