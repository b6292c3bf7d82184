//! Capture rule model and iptables rulespec rendering
//!
//! A [`FirewallRule`] is TCP + destination port range + flag signature, with
//! NFLOG as the (non-terminating) action:
//!
//! ```text
//! -p tcp -m tcp -m multiport --dports 20:65535 \
//!     --tcp-flags FIN,SYN,RST,PSH,ACK,URG FIN,PSH,URG \
//!     -j NFLOG --nflog-group 100
//! ```

use std::fmt;

use crate::error::FirewallError;
use crate::flags::{FlagSignature, TcpFlags};

/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

/// Inclusive destination port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, FirewallError> {
        if start == 0 {
            return Err(FirewallError::InvalidRule(
                "port range must start at 1 or above".to_owned(),
            ));
        }
        if start > end {
            return Err(FirewallError::InvalidRule(format!(
                "port range {start}:{end} is reversed"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Takes `u32` so values past 65535 can be asked about and rejected.
    pub fn contains(&self, port: u32) -> bool {
        port >= u32::from(self.start) && port <= u32::from(self.end)
    }
}

/// `start:end`, the multiport `--dports` syntax.
impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

/// Where matching packets are copied to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NflogTarget {
    group: u16,
    prefix: Option<String>,
}

impl NflogTarget {
    pub fn new(group: u16) -> Self {
        Self {
            group,
            prefix: None,
        }
    }

    /// Attaches `--nflog-prefix`. An empty prefix means none.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn group(&self) -> u16 {
        self.group
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

/// One capture rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    ports: PortRange,
    signature: FlagSignature,
    target: NflogTarget,
}

impl FirewallRule {
    /// A TCP rule. The signature already guarantees mask ⊇ match.
    pub fn tcp(ports: PortRange, signature: FlagSignature, target: NflogTarget) -> Self {
        Self {
            ports,
            signature,
            target,
        }
    }

    pub fn ports(&self) -> PortRange {
        self.ports
    }

    pub fn signature(&self) -> FlagSignature {
        self.signature
    }

    pub fn target(&self) -> &NflogTarget {
        &self.target
    }

    /// Evaluates the rule against packet header fields, the way the kernel would.
    pub fn matches(&self, protocol: u8, dport: u32, flags: TcpFlags) -> bool {
        protocol == IPPROTO_TCP && self.ports.contains(dport) && self.signature.matches(flags)
    }

    /// Rulespec as separate arguments.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "tcp",
            "-m",
            "tcp",
            "-m",
            "multiport",
            "--dports",
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
        args.push(self.ports.to_string());
        args.push("--tcp-flags".to_owned());
        args.push(self.signature.mask().to_string());
        args.push(self.signature.matched().to_string());
        args.push("-j".to_owned());
        args.push("NFLOG".to_owned());
        args.push("--nflog-group".to_owned());
        args.push(self.target.group.to_string());
        if let Some(prefix) = &self.target.prefix {
            args.push("--nflog-prefix".to_owned());
            args.push(quote(prefix));
        }
        args
    }

    /// Rulespec as one whitespace-separated string, the form the iptables
    /// driver splits (quoted segments stay together).
    pub fn rulespec(&self) -> String {
        self.to_args().join(" ")
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rulespec())
    }
}

fn quote(value: &str) -> String {
    if value.chars().any(char::is_whitespace) {
        format!("\"{}\"", value.replace('"', ""))
    } else {
        value.to_owned()
    }
}
