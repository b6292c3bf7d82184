//! Per-event handler abstraction
//!
//! The receive loop is the only caller of a handler, so calls are strictly
//! sequential and `&mut self` is enough for handler state.

use crate::error::EventError;
use crate::event::PacketEvent;

/// Continuation hint returned from [`EventHandler::on_event`].
///
/// Advisory only: the session logs a `Stop` and keeps receiving. Capture
/// ends through cancellation or a channel fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Verdict {
    #[default]
    Continue,
    Stop,
}

/// Receives packet events and recoverable errors from a
/// [`CaptureSession`](crate::CaptureSession).
pub trait EventHandler: Send {
    /// Called for each packet, in kernel delivery order.
    fn on_event(&mut self, event: &PacketEvent) -> Verdict;

    /// Called once per recoverable error; capture continues afterwards.
    fn on_error(&mut self, error: &EventError);
}

/// Handler built from two closures, see [`handler_fn`].
pub struct FnHandler<E, R> {
    on_event: E,
    on_error: R,
}

/// Builds an [`EventHandler`] from closures.
///
/// ```ignore
/// let mut handler = handler_fn(
///     |event| { seen.push(event.group); Verdict::Continue },
///     |err| warn!(%err, "capture error"),
/// );
/// session.run(cancel, &mut handler).await?;
/// ```
pub fn handler_fn<E, R>(on_event: E, on_error: R) -> FnHandler<E, R>
where
    E: FnMut(&PacketEvent) -> Verdict + Send,
    R: FnMut(&EventError) + Send,
{
    FnHandler { on_event, on_error }
}

impl<E, R> EventHandler for FnHandler<E, R>
where
    E: FnMut(&PacketEvent) -> Verdict + Send,
    R: FnMut(&EventError) + Send,
{
    fn on_event(&mut self, event: &PacketEvent) -> Verdict {
        (self.on_event)(event)
    }

    fn on_error(&mut self, error: &EventError) {
        (self.on_error)(error)
    }
}

impl<H: EventHandler + ?Sized> EventHandler for Box<H> {
    fn on_event(&mut self, event: &PacketEvent) -> Verdict {
        (**self).on_event(event)
    }

    fn on_error(&mut self, error: &EventError) {
        (**self).on_error(error)
    }
}
