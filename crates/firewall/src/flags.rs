//! TCP flag signatures
//!
//! Two signatures are interesting, both checked over the same six flags:
//!
//! | signature | mask | match |
//! |-----------|------|-------|
//! | stealth   | FIN,SYN,RST,PSH,ACK,URG | FIN,PSH,URG |
//! | bare SYN  | FIN,SYN,RST,PSH,ACK,URG | SYN |
//!
//! The match sets are disjoint, so a packet hits at most one of them.
//! Everything here is pure data; [`rules`] turns the signatures into
//! [`FirewallRule`]s for [`RuleManager`](crate::RuleManager).

use std::fmt;
use std::ops::{BitAnd, BitOr};

use crate::error::FirewallError;
use crate::rule::{FirewallRule, NflogTarget, PortRange};

/// TCP header flag bits (lower six bits of byte 13).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: Self = Self(0x01);
    pub const SYN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);
    pub const PSH: Self = Self(0x08);
    pub const ACK: Self = Self(0x10);
    pub const URG: Self = Self(0x20);

    /// All six flags the signatures inspect.
    pub const CHECKED: Self = Self(0x3f);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::FIN, "FIN"),
        (Self::SYN, "SYN"),
        (Self::RST, "RST"),
        (Self::PSH, "PSH"),
        (Self::ACK, "ACK"),
        (Self::URG, "URG"),
    ];

    /// No flag set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Keeps the six known bits, drops ECE/CWR and anything above.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::CHECKED.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Reads the flags out of a raw TCP header.
    ///
    /// Returns `None` when the header is shorter than the fixed 20 bytes.
    pub fn from_tcp_header(header: &[u8]) -> Option<Self> {
        if header.len() < 20 {
            return None;
        }
        Some(Self::from_bits_truncate(header[13]))
    }
}

impl BitOr for TcpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for TcpFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// iptables `--tcp-flags` syntax: `FIN,SYN,...` in header order, `NONE` if empty.
impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A mask/match pair: a packet matches iff `(flags & mask) == matched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagSignature {
    mask: TcpFlags,
    matched: TcpFlags,
}

impl FlagSignature {
    /// Builds a signature. Every bit in `matched` must be covered by `mask`,
    /// otherwise the signature could never match anything.
    pub fn new(mask: TcpFlags, matched: TcpFlags) -> Result<Self, FirewallError> {
        if !mask.contains(matched) {
            return Err(FirewallError::InvalidRule(format!(
                "match set {matched} is not covered by mask {mask}"
            )));
        }
        Ok(Self { mask, matched })
    }

    pub fn mask(&self) -> TcpFlags {
        self.mask
    }

    pub fn matched(&self) -> TcpFlags {
        self.matched
    }

    pub fn matches(&self, flags: TcpFlags) -> bool {
        flags & self.mask == self.matched
    }
}

/// Which probe a flag combination looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Probe {
    /// FIN+PSH+URG with SYN/RST/ACK clear ("xmas" style)
    Stealth,
    /// SYN alone
    BareSyn,
}

impl Probe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stealth => "stealth",
            Self::BareSyn => "bare-syn",
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FIN,PSH,URG set; SYN,RST,ACK clear.
pub const fn stealth_signature() -> FlagSignature {
    FlagSignature {
        mask: TcpFlags::CHECKED,
        matched: TcpFlags(TcpFlags::FIN.0 | TcpFlags::PSH.0 | TcpFlags::URG.0),
    }
}

/// SYN set; the other five clear.
pub const fn bare_syn_signature() -> FlagSignature {
    FlagSignature {
        mask: TcpFlags::CHECKED,
        matched: TcpFlags::SYN,
    }
}

/// Names the signature a flag set hits, if any.
pub fn classify(flags: TcpFlags) -> Option<Probe> {
    if stealth_signature().matches(flags) {
        Some(Probe::Stealth)
    } else if bare_syn_signature().matches(flags) {
        Some(Probe::BareSyn)
    } else {
        None
    }
}

/// The capture rule set: stealth first, then bare SYN.
///
/// Order only affects how the chain reads in `iptables -L`; each rule is
/// evaluated independently and LOG does not terminate evaluation.
pub fn rules(ports: PortRange, target: &NflogTarget) -> Vec<FirewallRule> {
    [stealth_signature(), bare_syn_signature()]
        .into_iter()
        .map(|signature| FirewallRule::tcp(ports, signature, target.clone()))
        .collect()
}
