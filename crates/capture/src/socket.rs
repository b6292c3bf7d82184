//! NFLOG netlink socket
//!
//! Setup runs in blocking mode and waits for the kernel's ACK after every
//! config request. The socket is then switched to non-blocking and
//! registered with the tokio reactor, so a pending `recv` can be abandoned
//! as soon as the session is cancelled.

use std::collections::VecDeque;
use std::io;

use netlink_sys::protocols::NETLINK_NETFILTER;
use netlink_sys::{Socket, SocketAddr};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use crate::channel::{LogChannel, Received};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, EventError};
use crate::nflog::{ConfigRequest, Decoded, decode_datagram};

/// Kernel port id.
const KERNEL: u32 = 0;

/// A bound NFLOG group.
pub struct NflogChannel {
    fd: AsyncFd<Socket>,
    group: u16,
    buf: Vec<u8>,
    pending: VecDeque<Received>,
    seq: u32,
    closed: bool,
}

impl NflogChannel {
    /// Opens a `NETLINK_NETFILTER` socket and binds it to `config.group`.
    ///
    /// Needs `CAP_NET_ADMIN`. Must be called from within a tokio runtime.
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let group = config.group;
        let open_err = |what: &str, e: io::Error| CaptureError::ChannelOpen {
            group,
            reason: format!("{what}: {e}"),
        };

        let mut socket = Socket::new(NETLINK_NETFILTER).map_err(|e| open_err("socket", e))?;
        socket.bind_auto().map_err(|e| open_err("bind", e))?;

        let mut setup = Setup {
            socket: &socket,
            buf: Vec::with_capacity(config.recv_buffer_len),
            seq: 0,
        };

        let mut families = vec![libc::AF_INET as u8];
        if config.ipv6 {
            families.push(libc::AF_INET6 as u8);
        }
        for family in families {
            // no-ops on current kernels, required on old ones; failures are tolerated
            for request in [ConfigRequest::pf_unbind(family), ConfigRequest::pf_bind(family)] {
                let what = request.describe();
                if let Err(e) = setup.request(request) {
                    debug!(group, request = %what, error = %e, "handler registration not acknowledged");
                }
            }
        }

        setup
            .request(ConfigRequest::bind(group))
            .map_err(|e| open_err("bind group", e))?;
        setup
            .request(ConfigRequest::mode(group, config.copy_mode, config.copy_range))
            .map_err(|e| open_err("set copy mode", e))?;
        if let Some(size) = config.buffer_size {
            setup
                .request(ConfigRequest::buffer_size(group, size))
                .map_err(|e| open_err("set buffer size", e))?;
        }
        let seq = setup.seq;
        let mut buf = setup.buf;
        buf.clear();

        socket
            .set_non_blocking(true)
            .map_err(|e| open_err("set non-blocking", e))?;
        let fd = AsyncFd::new(socket).map_err(|e| open_err("register with reactor", e))?;

        Ok(Self {
            fd,
            group,
            buf,
            pending: VecDeque::new(),
            seq,
            closed: false,
        })
    }

    pub fn group(&self) -> u16 {
        self.group
    }

    /// Decodes the datagram in `buf` into the pending queue.
    fn ingest(&mut self) {
        for decoded in decode_datagram(&self.buf) {
            match decoded {
                Ok(Decoded::Event(event)) => self.pending.push_back(Received::Event(event)),
                Ok(Decoded::Error { errno, .. }) => {
                    self.pending
                        .push_back(Received::Error(EventError::kernel(errno)));
                }
                Ok(Decoded::Ack { .. } | Decoded::Ignored) => {}
                Err(e) => self.pending.push_back(Received::Error(e)),
            }
        }
    }
}

impl LogChannel for NflogChannel {
    async fn recv(&mut self) -> Result<Received, CaptureError> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(item);
            }

            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| CaptureError::ChannelFault(e.to_string()))?;

            self.buf.clear();
            let result = guard.try_io(|fd| fd.get_ref().recv(&mut self.buf, 0));
            drop(guard);
            match result {
                Err(_would_block) => continue,
                Ok(Ok(_)) => self.ingest(),
                Ok(Err(e)) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    return Ok(Received::Error(EventError::Overrun));
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(CaptureError::ChannelFault(e.to_string())),
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.seq = self.seq.wrapping_add(1);
        let request = ConfigRequest::unbind(self.group).encode(self.seq);
        // the ACK is never read; the fd closes when the channel drops
        if let Err(e) = self
            .fd
            .get_ref()
            .send_to(&request, &SocketAddr::new(KERNEL, 0), 0)
        {
            warn!(group = self.group, error = %e, "failed to unbind NFLOG group");
        }
        debug!(group = self.group, "NFLOG group unbound");
    }
}

/// Blocking request/ACK exchange used while opening.
struct Setup<'a> {
    socket: &'a Socket,
    buf: Vec<u8>,
    seq: u32,
}

impl Setup<'_> {
    fn request(&mut self, request: ConfigRequest) -> io::Result<()> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let bytes = request.encode(seq);
        self.socket
            .send_to(&bytes, &SocketAddr::new(KERNEL, 0), 0)?;

        loop {
            self.buf.clear();
            self.socket.recv(&mut self.buf, 0)?;
            for decoded in decode_datagram(&self.buf) {
                match decoded {
                    Ok(Decoded::Ack { seq: s }) if s == seq => return Ok(()),
                    Ok(Decoded::Error { seq: s, errno }) if s == seq => {
                        return Err(io::Error::from_raw_os_error(errno));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
                    }
                }
            }
        }
    }
}
