//! The polymorphic contract every venue adapter satisfies.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::model::{BookUpdate, Trade};

pub type ReceiveEndpoint<T> = mpsc::Receiver<T>;

/// Default capacity of every per-feed channel. Load-bearing: it applies
/// back-pressure from the aggregator through to the socket reader.
pub const FEED_CHANNEL_CAPACITY: usize = 1;

#[derive(thiserror::Error, Debug)]
pub enum DialError {
    #[error("failed to connect: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("unexpected handshake response: {0}")]
    Handshake(String),
}

/// A single-use slot for a lazily-created feed channel.
///
/// `book()`/`trades()` are specified as idempotent: the first call performs
/// the subscription side effect and hands back the receiver, later calls must
/// not resubscribe. An `mpsc::Receiver` cannot be duplicated, so "subsequent
/// calls return the same endpoint" is realized here as: the receiver is
/// produced exactly once, and any later call observes the slot already
/// taken and returns `None`, identical to the "subscription failed" case.
pub struct ChannelSlot<T> {
    inner: Mutex<SlotState<T>>,
}

enum SlotState<T> {
    NotSubscribed,
    Taken,
    #[allow(dead_code)]
    _Marker(std::marker::PhantomData<T>),
}

impl<T: Send + 'static> ChannelSlot<T> {
    pub fn new() -> Self {
        ChannelSlot {
            inner: Mutex::new(SlotState::NotSubscribed),
        }
    }

    /// Returns `Some(receiver)` and a sender to hand to the producer task the
    /// first time this is called; `None` on every later call.
    pub async fn subscribe_once(
        &self,
        capacity: usize,
    ) -> Option<(mpsc::Sender<T>, mpsc::Receiver<T>)> {
        let mut state = self.inner.lock().await;
        match *state {
            SlotState::NotSubscribed => {
                let (tx, rx) = mpsc::channel(capacity);
                *state = SlotState::Taken;
                Some((tx, rx))
            }
            _ => None,
        }
    }

    pub async fn was_subscribed(&self) -> bool {
        !matches!(*self.inner.lock().await, SlotState::NotSubscribed)
    }
}

impl<T: Send + 'static> Default for ChannelSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait Listener: Send + Sync {
    /// Stable venue identifier, e.g. `"Binance"`.
    fn exchange(&self) -> &str;

    /// Trading symbol as configured.
    fn symbol(&self) -> &str;

    /// Dials the venue and performs the initial handshake. Returns once the
    /// session is live enough to accept later `book()`/`trades()` calls.
    async fn start(&self, cancel: CancellationToken) -> Result<(), DialError>;

    /// Idempotent: the first call subscribes to the depth feed and returns
    /// its receive endpoint; later calls return `None`.
    async fn book(&self) -> Option<ReceiveEndpoint<BookUpdate>>;

    /// Idempotent: the first call subscribes to the trade feed and returns
    /// its receive endpoint; later calls return `None`.
    async fn trades(&self) -> Option<ReceiveEndpoint<Vec<Trade>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_slot_hands_out_receiver_exactly_once() {
        let slot: ChannelSlot<u32> = ChannelSlot::new();
        assert!(!slot.was_subscribed().await);

        let first = slot.subscribe_once(1).await;
        assert!(first.is_some());
        assert!(slot.was_subscribed().await);

        let second = slot.subscribe_once(1).await;
        assert!(second.is_none());
    }
}
