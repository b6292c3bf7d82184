//! Capture chain location

use flagwatch_core::config::FirewallSection;

use crate::error::FirewallError;
use crate::flags;
use crate::rule::{FirewallRule, NflogTarget, PortRange};

/// Where the capture chain lives and where it is hooked in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    /// iptables table (`filter`)
    pub table: String,
    /// dedicated chain (`nflog`)
    pub chain: String,
    /// built-in chain that jumps to it (`INPUT`)
    pub attach_to: String,
    /// 1-based jump position; 1 puts capture ahead of every other decision
    pub position: u32,
}

impl ChainSpec {
    pub fn new(
        table: impl Into<String>,
        chain: impl Into<String>,
        attach_to: impl Into<String>,
        position: u32,
    ) -> Self {
        Self {
            table: table.into(),
            chain: chain.into(),
            attach_to: attach_to.into(),
            position,
        }
    }

    /// Reads the `[firewall]` config section.
    pub fn from_core(section: &FirewallSection) -> Self {
        Self::new(
            &section.table,
            &section.chain,
            &section.attach_to,
            section.position,
        )
    }

    /// Rulespec of the jump placed in `attach_to`.
    pub fn jump_rule(&self) -> String {
        format!("-j {}", self.chain)
    }
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self::from_core(&FirewallSection::default())
    }
}

/// Builds the capture rules described by the `[firewall]` section for `group`.
pub fn rules_from_core(section: &FirewallSection, group: u16) -> Result<Vec<FirewallRule>, FirewallError> {
    let ports = PortRange::new(section.port_start, section.port_end)?;
    let target = NflogTarget::new(group).with_prefix(section.prefix.as_str());
    Ok(flags::rules(ports, &target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_is_filter_nflog_input_first() {
        let spec = ChainSpec::default();
        assert_eq!(spec.table, "filter");
        assert_eq!(spec.chain, "nflog");
        assert_eq!(spec.attach_to, "INPUT");
        assert_eq!(spec.position, 1);
        assert_eq!(spec.jump_rule(), "-j nflog");
    }

    #[test]
    fn rules_from_default_section() {
        let rules = rules_from_core(&FirewallSection::default(), 100).unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.target().group() == 100));
        assert!(rules.iter().all(|r| r.ports().to_string() == "20:65535"));
    }

    #[test]
    fn rules_from_section_with_reversed_ports_fail() {
        let section = FirewallSection {
            port_start: 9000,
            port_end: 10,
            ..FirewallSection::default()
        };
        assert!(rules_from_core(&section, 100).is_err());
    }
}
