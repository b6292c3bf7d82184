//! Capture session lifecycle and receive loop
//!
//! ```text
//! Created ──run()──▶ Running ──cancel / fault──▶ Stopped
//!    │                                             ▲
//!    └────────────────────close()──────────────────┘
//! ```
//!
//! There is no way back from `Stopped`. The channel is released exactly
//! once, by whichever of `run`, `close` or `Drop` gets there first.

use std::fmt;

use flagwatch_core::metrics as m;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::channel::{LogChannel, Received};
use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::handler::{EventHandler, Verdict};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Events dispatched to `on_event`
    pub events: u64,
    /// Recoverable errors dispatched to `on_error`
    pub errors: u64,
    /// Payload bytes across all events
    pub bytes: u64,
    /// `Verdict::Stop` answers (advisory, counted only)
    pub stop_verdicts: u64,
}

/// A bound log group and its receive loop.
pub struct CaptureSession<C: LogChannel> {
    config: CaptureConfig,
    channel: Option<C>,
    state: SessionState,
    stats: CaptureStats,
}

#[cfg(target_os = "linux")]
impl CaptureSession<crate::socket::NflogChannel> {
    /// Binds the NFLOG group described by `config`.
    ///
    /// Fails with [`CaptureError::ChannelOpen`] without `CAP_NET_ADMIN` or
    /// when another process holds the group. Must be called from within a
    /// tokio runtime.
    pub fn open(config: CaptureConfig) -> Result<Self, CaptureError> {
        let channel = crate::socket::NflogChannel::open(&config)?;
        info!(
            group = config.group,
            copy_mode = %config.copy_mode,
            copy_range = config.copy_range,
            "NFLOG group bound"
        );
        Ok(Self::with_channel(config, channel))
    }
}

impl<C: LogChannel> CaptureSession<C> {
    /// Session over an already-open channel.
    pub fn with_channel(config: CaptureConfig, channel: C) -> Self {
        Self {
            config,
            channel: Some(channel),
            state: SessionState::Created,
            stats: CaptureStats::default(),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Receives until `cancel` fires or the channel faults.
    ///
    /// Events go to `handler.on_event` in delivery order, recoverable errors
    /// to `handler.on_error`. Cancellation is checked before every receive,
    /// so nothing is dispatched once it has fired. On return the session is
    /// `Stopped` and the channel closed.
    ///
    /// # Errors
    /// - [`CaptureError::InvalidState`] unless the session is `Created`
    /// - [`CaptureError::ChannelFault`] on an unrecoverable receive failure
    pub async fn run<H>(
        &mut self,
        cancel: CancellationToken,
        handler: &mut H,
    ) -> Result<(), CaptureError>
    where
        H: EventHandler + ?Sized,
    {
        if self.state != SessionState::Created {
            return Err(CaptureError::InvalidState {
                expected: SessionState::Created.as_str(),
                found: self.state.as_str(),
            });
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(CaptureError::InvalidState {
                expected: SessionState::Created.as_str(),
                found: SessionState::Stopped.as_str(),
            });
        };

        self.state = SessionState::Running;
        metrics::gauge!(m::CAPTURE_SESSION_RUNNING).set(1.0);
        let group = self.config.group;
        info!(group, "capture session running");

        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(group, "capture session cancelled");
                    break Ok(());
                }

                received = channel.recv() => match received {
                    Ok(Received::Event(event)) => {
                        self.stats.events += 1;
                        self.stats.bytes += event.payload_len() as u64;
                        metrics::counter!(m::CAPTURE_EVENTS_TOTAL).increment(1);
                        metrics::counter!(m::CAPTURE_BYTES_TOTAL)
                            .increment(event.payload_len() as u64);

                        if handler.on_event(&event) == Verdict::Stop {
                            self.stats.stop_verdicts += 1;
                            debug!(group, "handler returned Stop, continuing (advisory)");
                        }
                    }
                    Ok(Received::Error(err)) => {
                        self.stats.errors += 1;
                        metrics::counter!(m::CAPTURE_ERRORS_TOTAL, m::LABEL_KIND => err.kind())
                            .increment(1);
                        handler.on_error(&err);
                    }
                    Err(e) => {
                        error!(group, error = %e, "capture channel fault");
                        metrics::counter!(m::CAPTURE_FAULTS_TOTAL).increment(1);
                        break Err(e);
                    }
                }
            }
        };

        self.state = SessionState::Stopped;
        metrics::gauge!(m::CAPTURE_SESSION_RUNNING).set(0.0);
        self.close();
        info!(
            group,
            events = self.stats.events,
            errors = self.stats.errors,
            "capture session stopped"
        );
        result
    }

    /// Releases the channel. Safe to call any number of times, before or
    /// after `run`.
    pub fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
            debug!(group = self.config.group, "capture channel closed");
        }
        self.state = SessionState::Stopped;
    }
}

impl<C: LogChannel> Drop for CaptureSession<C> {
    fn drop(&mut self) {
        self.close();
    }
}
