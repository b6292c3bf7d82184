//! Packet events delivered by the NFLOG group

use std::time::SystemTime;

use bytes::Bytes;

/// Metadata the kernel attaches to a logged packet.
///
/// Every field is optional: the kernel only sends what applies (no
/// `outdev` on INPUT, no `uid` for forwarded traffic, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketMetadata {
    /// Link-layer protocol (ETH_P_IP = 0x0800, ETH_P_IPV6 = 0x86dd)
    pub hw_protocol: Option<u16>,
    /// Netfilter hook number
    pub hook: Option<u8>,
    pub mark: Option<u32>,
    pub timestamp: Option<SystemTime>,
    pub indev: Option<u32>,
    pub outdev: Option<u32>,
    pub physindev: Option<u32>,
    pub physoutdev: Option<u32>,
    /// Source hardware address
    pub hw_addr: Option<Vec<u8>>,
    /// `--nflog-prefix` of the matching rule
    pub prefix: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Per-group sequence number
    pub seq: Option<u32>,
    /// Global sequence number
    pub seq_global: Option<u32>,
}

/// One packet copied into the log group by a matching rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEvent {
    /// Log group the packet arrived on
    pub group: u16,
    /// Network-layer packet, truncated to `copy_range`; empty in meta mode
    pub payload: Bytes,
    pub metadata: PacketMetadata,
}

impl PacketEvent {
    pub fn new(group: u16, payload: Bytes) -> Self {
        Self {
            group,
            payload,
            metadata: PacketMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: PacketMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}
