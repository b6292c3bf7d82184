//! Log channel abstraction
//!
//! [`CaptureSession`](crate::CaptureSession) reads through [`LogChannel`].
//! The NFLOG socket is the production implementation; [`MemoryChannel`]
//! replays scripted events for tests and dry runs.
//!
//! ```text
//! ┌────────────────┐
//! │ CaptureSession │
//! └───────┬────────┘
//!         ▼
//!   ┌────────────┐
//!   │ LogChannel │ (trait)
//!   └────────────┘
//!     │        │
//!     ▼        ▼
//!   Nflog    Memory
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use crate::error::{CaptureError, EventError};
use crate::event::PacketEvent;

/// One item read from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Event(PacketEvent),
    /// Recoverable; the channel is still usable
    Error(EventError),
}

/// A source of packet events.
///
/// `recv` must be cancel-safe: dropping its future before completion loses
/// nothing that was already decoded.
pub trait LogChannel: Send {
    /// Waits for the next event or recoverable error.
    ///
    /// `Err` is a fatal fault; the session stops and closes the channel.
    fn recv(&mut self) -> impl Future<Output = Result<Received, CaptureError>> + Send;

    /// Releases the channel. Called at most once by the session.
    fn close(&mut self);
}

type Item = Result<Received, CaptureError>;

/// In-memory channel fed through a [`MemoryFeed`].
///
/// With nothing queued, `recv` waits, and it keeps waiting once every feed
/// is dropped, the way an idle socket does.
pub struct MemoryChannel {
    rx: mpsc::UnboundedReceiver<Item>,
    closes: Arc<AtomicUsize>,
}

/// Sending half of a [`MemoryChannel`].
#[derive(Clone)]
pub struct MemoryFeed {
    tx: mpsc::UnboundedSender<Item>,
    closes: Arc<AtomicUsize>,
}

impl MemoryChannel {
    pub fn new() -> (Self, MemoryFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                rx,
                closes: Arc::clone(&closes),
            },
            MemoryFeed { tx, closes },
        )
    }
}

impl MemoryFeed {
    /// Queues a packet event. Returns `false` once the channel is gone.
    pub fn event(&self, event: PacketEvent) -> bool {
        self.tx.send(Ok(Received::Event(event))).is_ok()
    }

    /// Queues a recoverable error.
    pub fn error(&self, error: EventError) -> bool {
        self.tx.send(Ok(Received::Error(error))).is_ok()
    }

    /// Queues a fatal fault.
    pub fn fault(&self, reason: impl Into<String>) -> bool {
        self.tx
            .send(Err(CaptureError::ChannelFault(reason.into())))
            .is_ok()
    }

    /// How many times the channel was closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl LogChannel for MemoryChannel {
    async fn recv(&mut self) -> Result<Received, CaptureError> {
        match self.rx.recv().await {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn items_arrive_in_order() {
        let (mut channel, feed) = MemoryChannel::new();
        feed.event(PacketEvent::new(1, Bytes::new()));
        feed.error(EventError::Overrun);
        feed.fault("gone");

        assert!(matches!(channel.recv().await, Ok(Received::Event(_))));
        assert!(matches!(
            channel.recv().await,
            Ok(Received::Error(EventError::Overrun))
        ));
        assert!(matches!(
            channel.recv().await,
            Err(CaptureError::ChannelFault(_))
        ));
    }

    #[tokio::test]
    async fn dropped_feed_leaves_channel_idle() {
        let (mut channel, feed) = MemoryChannel::new();
        drop(feed);
        let waited = tokio::time::timeout(Duration::from_millis(50), channel.recv()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn close_is_counted_and_rejects_new_items() {
        let (mut channel, feed) = MemoryChannel::new();
        channel.close();
        assert_eq!(feed.close_count(), 1);
        assert!(!feed.event(PacketEvent::new(1, Bytes::new())));
    }
}
