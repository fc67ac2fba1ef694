// ABOUTME: Listener traits notified by the channel: global ChannelListener and per-group GroupListener.
// ABOUTME: All methods default to no-ops so implementors override only what they need.

use beacon_core::Log;

use crate::error::DeliveryError;

/// Observes every group. Listeners are notified in registration order.
pub trait ChannelListener: Send + Sync {
    /// A record is about to get metadata attached and be filtered.
    fn on_enqueuing_log(&self, _log: &Log, _group: &str) {}

    /// Return `true` to drop the record before it is persisted.
    fn should_filter(&self, _log: &Log) -> bool {
        false
    }

    fn on_group_added(&self, _group: &str) {}

    fn on_group_removed(&self, _group: &str) {}

    /// Persisted records of a group were deleted by `clear`.
    fn on_clear(&self, _group: &str) {}

    fn on_globally_enabled(&self, _enabled: bool) {}
}

/// Per-record delivery callbacks for one group.
pub trait GroupListener: Send + Sync {
    fn on_before_sending(&self, _log: &Log) {}

    fn on_success(&self, _log: &Log) {}

    fn on_failure(&self, _log: &Log, _error: &DeliveryError) {}
}
