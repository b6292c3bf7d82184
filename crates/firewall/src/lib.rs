//! TCP flag signatures and the iptables chain that mirrors matching packets
//! into an NFLOG group.
//!
//! # Modules
//! - [`flags`]: flag bit set, the stealth and bare-SYN signatures, rule set builder
//! - [`rule`]: [`FirewallRule`], port range, NFLOG target, rulespec rendering
//! - [`chain`]: [`ChainSpec`]: where the capture chain lives and hooks in
//! - [`backend`]: [`FirewallBackend`] trait, iptables and in-memory backends
//! - [`manager`]: [`RuleManager`]: idempotent install and teardown
//!
//! ```text
//! flags::rules(ports, target) ──▶ RuleManager::init(chain, rules)
//!                                        │
//!                                  FirewallBackend
//!                                   │           │
//!                            IptablesBackend  MemoryBackend
//! ```

pub mod backend;
pub mod chain;
pub mod error;
pub mod flags;
pub mod manager;
pub mod rule;

// --- re-exports ---

pub use backend::{BackendError, BackendOp, FirewallBackend, MemoryBackend};
#[cfg(target_os = "linux")]
pub use backend::IptablesBackend;
pub use chain::ChainSpec;
pub use error::{FirewallError, Step};
pub use flags::{FlagSignature, Probe, TcpFlags, bare_syn_signature, classify, rules, stealth_signature};
pub use manager::{Absence, InitReport, RuleManager, TeardownReport};
pub use rule::{FirewallRule, NflogTarget, PortRange};
