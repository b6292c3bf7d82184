//! NFLOG capture for flagwatch.
//!
//! Binds a netfilter log group and runs a cancellable receive loop that
//! hands each packet to an [`EventHandler`].
//!
//! # Modules
//! - [`config`]: [`CaptureConfig`], copy mode
//! - [`nflog`]: NFLOG request encoding and packet decoding
//! - [`channel`]: [`LogChannel`] trait, in-memory channel
//! - `socket`: `NETLINK_NETFILTER` channel (Linux)
//! - [`session`]: [`CaptureSession`] state machine and receive loop
//! - [`handler`]: [`EventHandler`], [`Verdict`], [`handler_fn`]
//!
//! ```text
//! kernel ──NFLOG──▶ NflogChannel ──recv──▶ CaptureSession::run ──▶ EventHandler
//!                                              ▲
//!                                   CancellationToken
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod nflog;
pub mod session;
#[cfg(target_os = "linux")]
pub mod socket;

// --- re-exports ---

pub use channel::{LogChannel, MemoryChannel, MemoryFeed, Received};
pub use config::{CaptureConfig, CopyMode};
pub use error::{CaptureError, EventError};
pub use event::{PacketEvent, PacketMetadata};
pub use handler::{EventHandler, FnHandler, Verdict, handler_fn};
pub use session::{CaptureSession, CaptureStats, SessionState};
#[cfg(target_os = "linux")]
pub use socket::NflogChannel;
