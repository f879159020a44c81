use std::sync::Weak;

use crate::{dispatcher::DispatcherInner, types::Channel};

/// Handle to a registered listener.
///
/// Dropping the handle unsubscribes the listener. For the `newEvent`
/// channel this also feeds the auto-start lifecycle: an auto emitter
/// starts when the first subscription appears and stops when the last one
/// is dropped.
pub struct Subscription {
    channel: Channel,
    id: u64,
    dispatcher: Weak<DispatcherInner>,
}

impl Subscription {
    pub(crate) fn new(channel: Channel, id: u64, dispatcher: Weak<DispatcherInner>) -> Self {
        Self { channel, id, dispatcher }
    }

    /// The channel this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Explicitly unsubscribes; equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unsubscribe(self.channel, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("channel", &self.channel).field("id", &self.id).finish()
    }
}
