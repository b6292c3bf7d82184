//! NFLOG wire codec (nfnetlink subsystem `NFNL_SUBSYS_ULOG`)
//!
//! ```text
//! nlmsghdr (16) │ nfgenmsg (4) │ nlattr │ nlattr │ ...
//!               │ family       │
//!               │ version = 0  │  nla_len, nla_type: host order
//!               │ res_id (BE)  │  attribute values:  network order
//! ```
//!
//! Framing goes through `netlink-packet-core`; the nfnetlink body and
//! attributes are encoded here.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use netlink_packet_core::{
    NLM_F_ACK, NLM_F_REQUEST, NetlinkDeserializable, NetlinkHeader, NetlinkMessage,
    NetlinkPayload, NetlinkSerializable,
};

use crate::config::CopyMode;
use crate::error::EventError;
use crate::event::{PacketEvent, PacketMetadata};

pub const NFNL_SUBSYS_ULOG: u16 = 4;
pub const NFULNL_MSG_PACKET: u16 = 0;
pub const NFULNL_MSG_CONFIG: u16 = 1;

/// Full netlink message type of packet notifications.
pub const PACKET_MSG_TYPE: u16 = (NFNL_SUBSYS_ULOG << 8) | NFULNL_MSG_PACKET;
/// Full netlink message type of config requests.
pub const CONFIG_MSG_TYPE: u16 = (NFNL_SUBSYS_ULOG << 8) | NFULNL_MSG_CONFIG;

const NFNETLINK_V0: u8 = 0;
const NFGENMSG_LEN: usize = 4;
const NLA_HEADER_LEN: usize = 4;
const NLMSG_HEADER_LEN: usize = 16;
/// NLA_F_NESTED | NLA_F_NET_BYTEORDER
const NLA_FLAGS: u16 = 0xc000;

// config attributes
const NFULA_CFG_CMD: u16 = 1;
const NFULA_CFG_MODE: u16 = 2;
const NFULA_CFG_NLBUFSIZ: u16 = 3;

// packet attributes
const NFULA_PACKET_HDR: u16 = 1;
const NFULA_MARK: u16 = 2;
const NFULA_TIMESTAMP: u16 = 3;
const NFULA_IFINDEX_INDEV: u16 = 4;
const NFULA_IFINDEX_OUTDEV: u16 = 5;
const NFULA_IFINDEX_PHYSINDEV: u16 = 6;
const NFULA_IFINDEX_PHYSOUTDEV: u16 = 7;
const NFULA_HWADDR: u16 = 8;
const NFULA_PAYLOAD: u16 = 9;
const NFULA_PREFIX: u16 = 10;
const NFULA_UID: u16 = 11;
const NFULA_SEQ: u16 = 12;
const NFULA_SEQ_GLOBAL: u16 = 13;
const NFULA_GID: u16 = 14;

/// `NFULNL_CFG_CMD_*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigCommand {
    Bind = 1,
    Unbind = 2,
    PfBind = 3,
    PfUnbind = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigAttr {
    Cmd(ConfigCommand),
    Mode { copy_range: u32, mode: CopyMode },
    BufSize(u32),
}

impl ConfigAttr {
    fn kind(&self) -> u16 {
        match self {
            Self::Cmd(_) => NFULA_CFG_CMD,
            Self::Mode { .. } => NFULA_CFG_MODE,
            Self::BufSize(_) => NFULA_CFG_NLBUFSIZ,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            Self::Cmd(_) => 1,
            // u32 copy_range, u8 copy_mode, u8 pad
            Self::Mode { .. } => 6,
            Self::BufSize(_) => 4,
        }
    }

    fn write_value(&self, out: &mut [u8]) {
        match *self {
            Self::Cmd(cmd) => out[0] = cmd as u8,
            Self::Mode { copy_range, mode } => {
                out[..4].copy_from_slice(&copy_range.to_be_bytes());
                out[4] = mode.wire_value();
                out[5] = 0;
            }
            Self::BufSize(size) => out[..4].copy_from_slice(&size.to_be_bytes()),
        }
    }
}

/// One `NFULNL_MSG_CONFIG` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRequest {
    family: u8,
    group: u16,
    attr: ConfigAttr,
}

impl ConfigRequest {
    /// Binds this socket to `group`.
    pub fn bind(group: u16) -> Self {
        Self::command(libc::AF_UNSPEC as u8, group, ConfigCommand::Bind)
    }

    pub fn unbind(group: u16) -> Self {
        Self::command(libc::AF_UNSPEC as u8, group, ConfigCommand::Unbind)
    }

    /// Registers the NFLOG handler for an address family.
    pub fn pf_bind(family: u8) -> Self {
        Self::command(family, 0, ConfigCommand::PfBind)
    }

    pub fn pf_unbind(family: u8) -> Self {
        Self::command(family, 0, ConfigCommand::PfUnbind)
    }

    pub fn mode(group: u16, mode: CopyMode, copy_range: u32) -> Self {
        Self {
            family: libc::AF_UNSPEC as u8,
            group,
            attr: ConfigAttr::Mode { copy_range, mode },
        }
    }

    /// Kernel-side per-group buffer size.
    pub fn buffer_size(group: u16, size: u32) -> Self {
        Self {
            family: libc::AF_UNSPEC as u8,
            group,
            attr: ConfigAttr::BufSize(size),
        }
    }

    fn command(family: u8, group: u16, cmd: ConfigCommand) -> Self {
        Self {
            family,
            group,
            attr: ConfigAttr::Cmd(cmd),
        }
    }

    /// Human-readable name for logs.
    pub fn describe(&self) -> String {
        match self.attr {
            ConfigAttr::Cmd(cmd) => format!("{cmd:?} (family {}, group {})", self.family, self.group),
            ConfigAttr::Mode { copy_range, mode } => {
                format!("mode {mode} range {copy_range} (group {})", self.group)
            }
            ConfigAttr::BufSize(size) => format!("buffer size {size} (group {})", self.group),
        }
    }

    /// Frames the request with REQUEST|ACK and the given sequence number.
    pub fn encode(self, sequence_number: u32) -> Vec<u8> {
        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_ACK;
        header.sequence_number = sequence_number;

        let mut message = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(self));
        message.finalize();

        let mut buf = vec![0u8; message.buffer_len()];
        message.serialize(&mut buf);
        buf
    }
}

impl NetlinkSerializable for ConfigRequest {
    fn message_type(&self) -> u16 {
        CONFIG_MSG_TYPE
    }

    fn buffer_len(&self) -> usize {
        NFGENMSG_LEN + align4(NLA_HEADER_LEN + self.attr.value_len())
    }

    fn serialize(&self, buffer: &mut [u8]) {
        buffer[0] = self.family;
        buffer[1] = NFNETLINK_V0;
        buffer[2..4].copy_from_slice(&self.group.to_be_bytes());

        let nla = &mut buffer[NFGENMSG_LEN..];
        let nla_len = (NLA_HEADER_LEN + self.attr.value_len()) as u16;
        nla[0..2].copy_from_slice(&nla_len.to_ne_bytes());
        nla[2..4].copy_from_slice(&self.attr.kind().to_ne_bytes());
        self.attr.write_value(&mut nla[NLA_HEADER_LEN..]);
        for byte in &mut nla[usize::from(nla_len)..] {
            *byte = 0;
        }
    }
}

/// Body decode failure.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(String);

/// Inner message of an nfnetlink ULOG datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NflogMessage {
    Packet(PacketEvent),
    /// Any other ULOG message type
    Other(u16),
}

impl NetlinkDeserializable for NflogMessage {
    type Error = CodecError;

    fn deserialize(header: &NetlinkHeader, payload: &[u8]) -> Result<Self, Self::Error> {
        if header.message_type == PACKET_MSG_TYPE {
            parse_packet(payload).map(Self::Packet)
        } else {
            Ok(Self::Other(header.message_type))
        }
    }
}

/// One message out of a received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(PacketEvent),
    /// NLMSG_ERROR with code 0
    Ack { seq: u32 },
    /// NLMSG_ERROR with a negative errno
    Error { seq: u32, errno: i32 },
    /// NLMSG_DONE, NLMSG_NOOP, unknown ULOG types
    Ignored,
}

/// Splits a datagram into messages and decodes each one.
///
/// A malformed message is reported in place; framing damage (a length
/// that does not fit) stops decoding of the rest of the datagram.
pub fn decode_datagram(buf: &[u8]) -> Vec<Result<Decoded, EventError>> {
    let mut out = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let rest = &buf[offset..];
        if rest.len() < NLMSG_HEADER_LEN {
            out.push(Err(EventError::Malformed(format!(
                "{} trailing bytes, shorter than a netlink header",
                rest.len()
            ))));
            break;
        }
        let len = u32::from_ne_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len < NLMSG_HEADER_LEN || len > rest.len() {
            out.push(Err(EventError::Malformed(format!(
                "netlink length {len} does not fit {} remaining bytes",
                rest.len()
            ))));
            break;
        }

        out.push(decode_message(&rest[..len]));
        offset += align4(len);
    }

    out
}

fn decode_message(bytes: &[u8]) -> Result<Decoded, EventError> {
    let message = NetlinkMessage::<NflogMessage>::deserialize(bytes)
        .map_err(|e| EventError::Malformed(e.to_string()))?;
    let seq = message.header.sequence_number;

    Ok(match message.payload {
        NetlinkPayload::InnerMessage(NflogMessage::Packet(event)) => Decoded::Event(event),
        NetlinkPayload::InnerMessage(NflogMessage::Other(_)) => Decoded::Ignored,
        NetlinkPayload::Error(err) => match err.code {
            None => Decoded::Ack { seq },
            Some(code) => Decoded::Error {
                seq,
                errno: code.get().saturating_abs(),
            },
        },
        NetlinkPayload::Overrun(_) => return Err(EventError::Overrun),
        _ => Decoded::Ignored,
    })
}

/// Parses the body of an `NFULNL_MSG_PACKET`.
pub fn parse_packet(payload: &[u8]) -> Result<PacketEvent, CodecError> {
    if payload.len() < NFGENMSG_LEN {
        return Err(CodecError(format!(
            "packet body is {} bytes, shorter than nfgenmsg",
            payload.len()
        )));
    }
    let group = u16::from_be_bytes([payload[2], payload[3]]);

    let mut meta = PacketMetadata::default();
    let mut data = Bytes::new();

    for attr in Attributes::new(&payload[NFGENMSG_LEN..]) {
        let (kind, value) = attr?;
        match kind {
            NFULA_PACKET_HDR => {
                let v = fixed::<4>(kind, value)?;
                meta.hw_protocol = Some(u16::from_be_bytes([v[0], v[1]]));
                meta.hook = Some(v[2]);
            }
            NFULA_MARK => meta.mark = Some(be_u32(kind, value)?),
            NFULA_TIMESTAMP => {
                let v = fixed::<16>(kind, value)?;
                let mut sec = [0u8; 8];
                let mut usec = [0u8; 8];
                sec.copy_from_slice(&v[..8]);
                usec.copy_from_slice(&v[8..16]);
                let since_epoch = Duration::from_secs(u64::from_be_bytes(sec))
                    + Duration::from_micros(u64::from_be_bytes(usec));
                meta.timestamp = SystemTime::UNIX_EPOCH.checked_add(since_epoch);
            }
            NFULA_IFINDEX_INDEV => meta.indev = Some(be_u32(kind, value)?),
            NFULA_IFINDEX_OUTDEV => meta.outdev = Some(be_u32(kind, value)?),
            NFULA_IFINDEX_PHYSINDEV => meta.physindev = Some(be_u32(kind, value)?),
            NFULA_IFINDEX_PHYSOUTDEV => meta.physoutdev = Some(be_u32(kind, value)?),
            NFULA_HWADDR => {
                let v = fixed::<4>(kind, value)?;
                let addr_len = usize::from(u16::from_be_bytes([v[0], v[1]])).min(value.len() - 4);
                meta.hw_addr = Some(value[4..4 + addr_len].to_vec());
            }
            NFULA_PAYLOAD => data = Bytes::copy_from_slice(value),
            NFULA_PREFIX => {
                let end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
                meta.prefix = Some(String::from_utf8_lossy(&value[..end]).into_owned());
            }
            NFULA_UID => meta.uid = Some(be_u32(kind, value)?),
            NFULA_GID => meta.gid = Some(be_u32(kind, value)?),
            NFULA_SEQ => meta.seq = Some(be_u32(kind, value)?),
            NFULA_SEQ_GLOBAL => meta.seq_global = Some(be_u32(kind, value)?),
            // conntrack, vlan, l2 header: not requested, skipped
            _ => {}
        }
    }

    Ok(PacketEvent::new(group, data).with_metadata(meta))
}

/// Iterator over `nlattr` TLVs.
struct Attributes<'a> {
    buf: &'a [u8],
}

impl<'a> Attributes<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = Result<(u16, &'a [u8]), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < NLA_HEADER_LEN {
            let err = CodecError(format!("{} stray bytes after attributes", self.buf.len()));
            self.buf = &[];
            return Some(Err(err));
        }
        let len = usize::from(u16::from_ne_bytes([self.buf[0], self.buf[1]]));
        let kind = u16::from_ne_bytes([self.buf[2], self.buf[3]]) & !NLA_FLAGS;
        if len < NLA_HEADER_LEN || len > self.buf.len() {
            let err = CodecError(format!(
                "attribute {kind} length {len} exceeds {} remaining bytes",
                self.buf.len()
            ));
            self.buf = &[];
            return Some(Err(err));
        }
        let value = &self.buf[NLA_HEADER_LEN..len];
        self.buf = self.buf.get(align4(len)..).unwrap_or(&[]);
        Some(Ok((kind, value)))
    }
}

fn fixed<const N: usize>(kind: u16, value: &[u8]) -> Result<&[u8], CodecError> {
    if value.len() < N {
        return Err(CodecError(format!(
            "attribute {kind} is {} bytes, expected at least {N}",
            value.len()
        )));
    }
    Ok(value)
}

fn be_u32(kind: u16, value: &[u8]) -> Result<u32, CodecError> {
    let v = fixed::<4>(kind, value)?;
    Ok(u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
}

const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn push_attr(buf: &mut Vec<u8>, kind: u16, value: &[u8]) {
        let len = (NLA_HEADER_LEN + value.len()) as u16;
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&kind.to_ne_bytes());
        buf.extend_from_slice(value);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    fn frame(message_type: u16, seq: u32, body: &[u8]) -> Vec<u8> {
        let len = (NLMSG_HEADER_LEN + body.len()) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&message_type.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(body);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf
    }

    /// A packet notification as the kernel would send it.
    pub(crate) fn packet_datagram(group: u16, prefix: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![libc::AF_INET as u8, 0];
        body.extend_from_slice(&group.to_be_bytes());
        push_attr(&mut body, NFULA_PACKET_HDR, &[0x08, 0x00, 1, 0]);
        push_attr(&mut body, NFULA_MARK, &7u32.to_be_bytes());
        let mut ts = Vec::new();
        ts.extend_from_slice(&1_700_000_000u64.to_be_bytes());
        ts.extend_from_slice(&250_000u64.to_be_bytes());
        push_attr(&mut body, NFULA_TIMESTAMP, &ts);
        push_attr(&mut body, NFULA_IFINDEX_INDEV, &2u32.to_be_bytes());
        push_attr(&mut body, NFULA_HWADDR, &[0, 6, 0, 0, 0xde, 0xad, 0xbe, 0xef, 0, 1, 0, 0]);
        let mut prefix_bytes = prefix.as_bytes().to_vec();
        prefix_bytes.push(0);
        push_attr(&mut body, NFULA_PREFIX, &prefix_bytes);
        push_attr(&mut body, NFULA_SEQ, &41u32.to_be_bytes());
        push_attr(&mut body, NFULA_PAYLOAD, payload);
        frame(PACKET_MSG_TYPE, 0, &body)
    }

    fn error_datagram(seq: u32, code: i32) -> Vec<u8> {
        let mut body = code.to_ne_bytes().to_vec();
        body.extend_from_slice(&[0u8; NLMSG_HEADER_LEN]);
        frame(2, seq, &body)
    }

    #[test]
    fn bind_request_layout() {
        let buf = ConfigRequest::bind(100).encode(9);

        // nlmsghdr
        assert_eq!(buf.len(), 28);
        assert_eq!(u32::from_ne_bytes(buf[0..4].try_into().unwrap()), 28);
        assert_eq!(u16::from_ne_bytes([buf[4], buf[5]]), 0x0401);
        assert_eq!(u16::from_ne_bytes([buf[6], buf[7]]), NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(u32::from_ne_bytes(buf[8..12].try_into().unwrap()), 9);
        // nfgenmsg: AF_UNSPEC, v0, res_id 100 big-endian
        assert_eq!(&buf[16..20], &[0, 0, 0, 100]);
        // NFULA_CFG_CMD, len 5, BIND, padding
        assert_eq!(u16::from_ne_bytes([buf[20], buf[21]]), 5);
        assert_eq!(u16::from_ne_bytes([buf[22], buf[23]]), NFULA_CFG_CMD);
        assert_eq!(&buf[24..28], &[1, 0, 0, 0]);
    }

    #[test]
    fn mode_request_layout() {
        let buf = ConfigRequest::mode(100, CopyMode::Packet, 0xffff).encode(1);
        assert_eq!(buf.len(), 16 + 4 + 12);
        assert_eq!(u16::from_ne_bytes([buf[20], buf[21]]), 10);
        assert_eq!(u16::from_ne_bytes([buf[22], buf[23]]), NFULA_CFG_MODE);
        assert_eq!(&buf[24..30], &[0, 0, 0xff, 0xff, 0x02, 0]);
    }

    #[test]
    fn pf_unbind_targets_family_with_group_zero() {
        let buf = ConfigRequest::pf_unbind(libc::AF_INET as u8).encode(1);
        assert_eq!(&buf[16..20], &[libc::AF_INET as u8, 0, 0, 0]);
        assert_eq!(buf[24], ConfigCommand::PfUnbind as u8);
    }

    #[test]
    fn packet_attributes_are_parsed() {
        let datagram = packet_datagram(100, "flagwatch", b"\x45\x00");
        let decoded = decode_datagram(&datagram);
        assert_eq!(decoded.len(), 1);

        let Ok(Decoded::Event(event)) = &decoded[0] else {
            panic!("expected event, got {decoded:?}");
        };
        assert_eq!(event.group, 100);
        assert_eq!(event.payload.as_ref(), b"\x45\x00");
        assert_eq!(event.metadata.hw_protocol, Some(0x0800));
        assert_eq!(event.metadata.hook, Some(1));
        assert_eq!(event.metadata.mark, Some(7));
        assert_eq!(event.metadata.indev, Some(2));
        assert_eq!(event.metadata.prefix.as_deref(), Some("flagwatch"));
        assert_eq!(event.metadata.seq, Some(41));
        assert_eq!(
            event.metadata.hw_addr.as_deref(),
            Some(&[0xde, 0xad, 0xbe, 0xef, 0, 1][..])
        );
        assert_eq!(
            event.metadata.timestamp,
            Some(SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_250))
        );
        assert_eq!(event.metadata.outdev, None);
    }

    #[test]
    fn several_messages_in_one_datagram_keep_order() {
        let mut datagram = packet_datagram(5, "a", b"1");
        datagram.extend(packet_datagram(5, "b", b"2"));
        let prefixes: Vec<_> = decode_datagram(&datagram)
            .into_iter()
            .map(|d| match d {
                Ok(Decoded::Event(e)) => e.metadata.prefix.unwrap_or_default(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(prefixes, vec!["a", "b"]);
    }

    #[test]
    fn truncated_attribute_is_malformed() {
        let mut body = vec![0u8, 0, 0, 100];
        // claims 12 bytes, only 6 follow
        body.extend_from_slice(&12u16.to_ne_bytes());
        body.extend_from_slice(&NFULA_MARK.to_ne_bytes());
        body.extend_from_slice(&[0, 0]);
        let datagram = frame(PACKET_MSG_TYPE, 0, &body);

        let decoded = decode_datagram(&datagram);
        assert!(matches!(decoded[0], Err(EventError::Malformed(_))));
    }

    #[test]
    fn short_mark_attribute_is_malformed() {
        let mut body = vec![0u8, 0, 0, 100];
        push_attr(&mut body, NFULA_MARK, &[1, 2]);
        let decoded = decode_datagram(&frame(PACKET_MSG_TYPE, 0, &body));
        assert!(matches!(decoded[0], Err(EventError::Malformed(_))));
    }

    #[test]
    fn bad_outer_length_stops_decoding() {
        let mut datagram = packet_datagram(1, "x", b"");
        datagram[0..4].copy_from_slice(&4096u32.to_ne_bytes());
        let decoded = decode_datagram(&datagram);
        assert_eq!(decoded.len(), 1);
        assert!(matches!(decoded[0], Err(EventError::Malformed(_))));
    }

    #[test]
    fn ack_and_error_are_distinguished() {
        let mut datagram = error_datagram(3, 0);
        datagram.extend(error_datagram(4, -libc::EBUSY));
        let decoded = decode_datagram(&datagram);
        assert_eq!(decoded[0], Ok(Decoded::Ack { seq: 3 }));
        assert_eq!(
            decoded[1],
            Ok(Decoded::Error {
                seq: 4,
                errno: libc::EBUSY
            })
        );
    }

    #[test]
    fn unknown_ulog_type_is_ignored() {
        let body = [0u8, 0, 0, 1];
        let decoded = decode_datagram(&frame(CONFIG_MSG_TYPE, 0, &body));
        assert_eq!(decoded, vec![Ok(Decoded::Ignored)]);
    }
}
