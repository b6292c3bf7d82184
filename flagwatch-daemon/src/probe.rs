//! Default packet handler: one log line per captured probe.

use flagwatch_capture::{EventError, EventHandler, PacketEvent, Verdict};
use flagwatch_core::metrics as m;
use flagwatch_firewall::{Probe, TcpFlags, classify};
use tracing::{info, warn};

const IPPROTO_TCP: u8 = 6;
const IPV6_HEADER_LEN: usize = 40;

/// Logs every event at info and every recoverable error at warn.
#[derive(Debug, Default)]
pub struct ProbeLogger {
    events: u64,
    errors: u64,
}

impl ProbeLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }
}

impl EventHandler for ProbeLogger {
    fn on_event(&mut self, event: &PacketEvent) -> Verdict {
        self.events += 1;
        let probe = probe_of(&event.payload);
        let label = probe.map_or("unknown", Probe::as_str);
        metrics::counter!(m::CAPTURE_PROBES_TOTAL, m::LABEL_PROBE => label).increment(1);

        let meta = &event.metadata;
        info!(
            group = event.group,
            probe = label,
            prefix = meta.prefix.as_deref().unwrap_or(""),
            indev = meta.indev.unwrap_or_default(),
            mark = meta.mark.unwrap_or_default(),
            len = event.payload_len(),
            "probe packet captured"
        );
        Verdict::Continue
    }

    fn on_error(&mut self, error: &EventError) {
        self.errors += 1;
        warn!(kind = error.kind(), error = %error, "capture error, continuing");
    }
}

/// Classifies a copied network-layer packet by its TCP flags.
///
/// `None` for non-TCP packets, IPv6 packets with extension headers, and
/// payloads truncated before the TCP header (meta copy mode).
pub fn probe_of(packet: &[u8]) -> Option<Probe> {
    classify(TcpFlags::from_tcp_header(tcp_header(packet)?)?)
}

fn tcp_header(packet: &[u8]) -> Option<&[u8]> {
    match packet.first()? >> 4 {
        4 => {
            let ihl = usize::from(packet[0] & 0x0f) * 4;
            if ihl < 20 || *packet.get(9)? != IPPROTO_TCP {
                return None;
            }
            packet.get(ihl..)
        }
        6 => {
            if *packet.get(6)? != IPPROTO_TCP {
                return None;
            }
            packet.get(IPV6_HEADER_LEN..)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn ipv4_tcp(flags: u8) -> Vec<u8> {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x45;
        packet[9] = IPPROTO_TCP;
        packet[20 + 13] = flags;
        packet
    }

    #[test]
    fn ipv4_stealth_and_syn_are_classified() {
        assert_eq!(probe_of(&ipv4_tcp(0x29)), Some(Probe::Stealth));
        assert_eq!(probe_of(&ipv4_tcp(0x02)), Some(Probe::BareSyn));
        assert_eq!(probe_of(&ipv4_tcp(0x12)), None);
    }

    #[test]
    fn ipv4_options_shift_tcp_header() {
        let mut packet = vec![0u8; 44];
        packet[0] = 0x46;
        packet[9] = IPPROTO_TCP;
        packet[24 + 13] = 0x02;
        assert_eq!(probe_of(&packet), Some(Probe::BareSyn));
    }

    #[test]
    fn ipv6_tcp_is_classified() {
        let mut packet = vec![0u8; 60];
        packet[0] = 0x60;
        packet[6] = IPPROTO_TCP;
        packet[40 + 13] = 0x29;
        assert_eq!(probe_of(&packet), Some(Probe::Stealth));
    }

    #[test]
    fn short_or_non_tcp_payloads_are_unknown() {
        assert_eq!(probe_of(&[]), None);
        assert_eq!(probe_of(&ipv4_tcp(0x02)[..30]), None);
        let mut udp = ipv4_tcp(0x02);
        udp[9] = 17;
        assert_eq!(probe_of(&udp), None);
    }

    #[test]
    fn logger_counts_and_always_continues() {
        let mut logger = ProbeLogger::new();
        let event = PacketEvent::new(100, Bytes::from(ipv4_tcp(0x29)));
        assert_eq!(logger.on_event(&event), Verdict::Continue);
        logger.on_error(&EventError::Overrun);
        assert_eq!(logger.events(), 1);
        assert_eq!(logger.errors(), 1);
    }
}
