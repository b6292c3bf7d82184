//! Firewall backend abstraction for testability.
//!
//! [`RuleManager`](crate::RuleManager) talks to the kernel firewall only
//! through [`FirewallBackend`]. Production uses [`IptablesBackend`] (the
//! `iptables` crate, which shells out to `iptables`/`ip6tables`); tests and
//! dry runs use [`MemoryBackend`], which models the same chain semantics.
//!
//! ```text
//! ┌─────────────┐
//! │ RuleManager │
//! └──────┬──────┘
//!        ▼
//! ┌─────────────────┐
//! │ FirewallBackend │ (trait)
//! └─────────────────┘
//!      │        │
//!      ▼        ▼
//!  Iptables   Memory
//! ```
//!
//! All methods are synchronous, matching the underlying driver.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Backend failure, carrying the driver's message (usually iptables stderr).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Chain and rule operations the capture chain lifecycle needs.
///
/// Rules are passed as whitespace-separated rulespecs (`-j nflog`).
pub trait FirewallBackend: Send + Sync {
    /// Whether `chain` exists in `table`.
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, BackendError>;

    /// Creates a user chain. Fails if it already exists.
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), BackendError>;

    /// Removes every rule from a chain. Fails if the chain is missing.
    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), BackendError>;

    /// Deletes an empty, unreferenced user chain.
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), BackendError>;

    /// Whether an identical rule is present (`iptables -C`).
    /// A missing chain reads as `false`.
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, BackendError>;

    /// Inserts at a 1-based position.
    fn insert(&self, table: &str, chain: &str, rule: &str, position: u32)
    -> Result<(), BackendError>;

    /// Appends at the end of the chain.
    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), BackendError>;

    /// Deletes the first identical rule.
    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), BackendError>;
}

/// Production backend backed by the `iptables` crate.
#[cfg(target_os = "linux")]
pub struct IptablesBackend {
    inner: iptables::IPTables,
}

#[cfg(target_os = "linux")]
impl IptablesBackend {
    /// Probes the `iptables` (or `ip6tables`) binary.
    pub fn new(ipv6: bool) -> Result<Self, BackendError> {
        let inner = iptables::new(ipv6).map_err(|e| BackendError::new(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Runs `-S`/`-C` and reads the answer from exit status and stderr.
    ///
    /// The driver's own `chain_exists`/`exists` report every non-zero exit
    /// as `false`, permission errors included.
    fn query(&self, table: &str, command: &str) -> Result<bool, BackendError> {
        let output = self.inner.execute(table, command).map_err(driver_err)?;
        query_answer(output.status.code(), &String::from_utf8_lossy(&output.stderr))
    }
}

#[cfg(target_os = "linux")]
fn driver_err(e: Box<dyn std::error::Error>) -> BackendError {
    BackendError::new(e.to_string().trim().to_owned())
}

/// Exit status of an iptables query that found nothing.
const STATUS_NOT_FOUND: i32 = 1;
/// Exit status iptables uses for resource problems such as missing privileges.
const STATUS_RESOURCE: i32 = 4;

const NO_CHAIN: &str = "iptables: No chain/target/match by that name.";
const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";
const PERMISSION_DENIED: &str = "iptables: Permission denied (you must be root).";

/// Reads an iptables `-S`/`-C` answer.
///
/// Only status 1 with a "no chain" or "bad rule" message means absent.
/// Every other non-zero exit is a failure, so a denied query never reads
/// as an absent chain.
pub(crate) fn query_answer(status: Option<i32>, stderr: &str) -> Result<bool, BackendError> {
    match status {
        Some(0) => Ok(true),
        Some(STATUS_NOT_FOUND)
            if stderr.contains("No chain/target/match") || stderr.contains("Bad rule") =>
        {
            Ok(false)
        }
        Some(code) => {
            let stderr = stderr.trim();
            if stderr.is_empty() {
                Err(BackendError::new(format!("iptables exited with status {code}")))
            } else {
                Err(BackendError::new(stderr))
            }
        }
        None => Err(BackendError::new("iptables terminated by a signal")),
    }
}

#[cfg(target_os = "linux")]
impl FirewallBackend for IptablesBackend {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, BackendError> {
        self.query(table, &format!("-S {chain}"))
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), BackendError> {
        self.inner.new_chain(table, chain).map_err(driver_err)
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), BackendError> {
        self.inner.flush_chain(table, chain).map_err(driver_err)
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), BackendError> {
        self.inner.delete_chain(table, chain).map_err(driver_err)
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, BackendError> {
        self.query(table, &format!("-C {chain} {rule}"))
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        position: u32,
    ) -> Result<(), BackendError> {
        let position = i32::try_from(position)
            .map_err(|_| BackendError::new(format!("position {position} out of range")))?;
        self.inner
            .insert(table, chain, rule, position)
            .map_err(driver_err)
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), BackendError> {
        self.inner.append(table, chain, rule).map_err(driver_err)
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), BackendError> {
        self.inner.delete(table, chain, rule).map_err(driver_err)
    }
}

/// Operation names for [`MemoryBackend::fail_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    ChainExists,
    NewChain,
    FlushChain,
    DeleteChain,
    Exists,
    Insert,
    Append,
    Delete,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// (table, chain) -> rulespecs, in evaluation order
    chains: BTreeMap<(String, String), Vec<String>>,
    /// injected failures: (op, chain)
    failures: Vec<(BackendOp, String)>,
}

/// In-memory firewall modelling iptables chain semantics.
///
/// Starts with the built-in `filter` chains (`INPUT`, `FORWARD`, `OUTPUT`).
/// Rules compare by whitespace-normalized rulespec.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

const BUILTIN_CHAINS: [&str; 5] = ["INPUT", "FORWARD", "OUTPUT", "PREROUTING", "POSTROUTING"];

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        for chain in ["INPUT", "FORWARD", "OUTPUT"] {
            state
                .chains
                .insert(("filter".to_owned(), chain.to_owned()), Vec::new());
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Creates (or replaces) a chain with the given rules.
    pub fn with_chain(self, table: &str, chain: &str, rules: &[&str]) -> Self {
        self.lock().chains.insert(
            (table.to_owned(), chain.to_owned()),
            rules.iter().map(|r| normalize(r)).collect(),
        );
        self
    }

    /// Makes every `op` on `chain` fail with a permission error.
    pub fn fail_on(&self, op: BackendOp, chain: &str) {
        self.lock().failures.push((op, chain.to_owned()));
    }

    /// Clears injected failures.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Snapshot of a chain's rules, `None` if the chain does not exist.
    pub fn rules(&self, table: &str, chain: &str) -> Option<Vec<String>> {
        self.lock()
            .chains
            .get(&(table.to_owned(), chain.to_owned()))
            .cloned()
    }

    /// How many copies of `rule` the chain holds.
    pub fn count(&self, table: &str, chain: &str, rule: &str) -> usize {
        let rule = normalize(rule);
        self.rules(table, chain)
            .map(|rules| rules.iter().filter(|r| **r == rule).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn injected(state: &MemoryState, op: BackendOp, chain: &str) -> bool {
        state.failures.iter().any(|(o, c)| *o == op && c == chain)
    }

    fn check(state: &MemoryState, op: BackendOp, chain: &str) -> Result<(), BackendError> {
        if Self::injected(state, op, chain) {
            return Err(BackendError::new(PERMISSION_DENIED));
        }
        Ok(())
    }

    /// Answers a query with the exit status and stderr the binary would give.
    fn query(
        state: &MemoryState,
        op: BackendOp,
        chain: &str,
        answer: Result<(), &str>,
    ) -> Result<bool, BackendError> {
        let (status, stderr) = if Self::injected(state, op, chain) {
            (STATUS_RESOURCE, PERMISSION_DENIED)
        } else {
            match answer {
                Ok(()) => (0, ""),
                Err(stderr) => (STATUS_NOT_FOUND, stderr),
            }
        };
        query_answer(Some(status), stderr)
    }

    fn no_chain() -> BackendError {
        BackendError::new(NO_CHAIN)
    }
}

fn normalize(rule: &str) -> String {
    rule.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn key(table: &str, chain: &str) -> (String, String) {
    (table.to_owned(), chain.to_owned())
}

impl FirewallBackend for MemoryBackend {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, BackendError> {
        let state = self.lock();
        let answer = if state.chains.contains_key(&key(table, chain)) {
            Ok(())
        } else {
            Err(NO_CHAIN)
        };
        Self::query(&state, BackendOp::ChainExists, chain, answer)
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        Self::check(&state, BackendOp::NewChain, chain)?;
        if state.chains.contains_key(&key(table, chain)) {
            return Err(BackendError::new("Chain already exists."));
        }
        state.chains.insert(key(table, chain), Vec::new());
        Ok(())
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        Self::check(&state, BackendOp::FlushChain, chain)?;
        state
            .chains
            .get_mut(&key(table, chain))
            .ok_or_else(Self::no_chain)?
            .clear();
        Ok(())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        Self::check(&state, BackendOp::DeleteChain, chain)?;
        if BUILTIN_CHAINS.contains(&chain) {
            return Err(BackendError::new("Cannot delete built-in chain."));
        }
        match state.chains.get(&key(table, chain)) {
            None => return Err(Self::no_chain()),
            Some(rules) if !rules.is_empty() => {
                return Err(BackendError::new("Directory not empty."));
            }
            Some(_) => {}
        }
        let jump = normalize(&format!("-j {chain}"));
        let referenced = state
            .chains
            .iter()
            .any(|((t, _), rules)| t == table && rules.contains(&jump));
        if referenced {
            return Err(BackendError::new("Too many links."));
        }
        state.chains.remove(&key(table, chain));
        Ok(())
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, BackendError> {
        let state = self.lock();
        let rule = normalize(rule);
        let answer = match state.chains.get(&key(table, chain)) {
            None => Err(NO_CHAIN),
            Some(rules) if rules.contains(&rule) => Ok(()),
            Some(_) => Err(BAD_RULE),
        };
        Self::query(&state, BackendOp::Exists, chain, answer)
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        position: u32,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        Self::check(&state, BackendOp::Insert, chain)?;
        let rules = state
            .chains
            .get_mut(&key(table, chain))
            .ok_or_else(Self::no_chain)?;
        let index = position as usize;
        if index == 0 || index > rules.len() + 1 {
            return Err(BackendError::new("Index of insertion too big."));
        }
        rules.insert(index - 1, normalize(rule));
        Ok(())
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        Self::check(&state, BackendOp::Append, chain)?;
        state
            .chains
            .get_mut(&key(table, chain))
            .ok_or_else(Self::no_chain)?
            .push(normalize(rule));
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        Self::check(&state, BackendOp::Delete, chain)?;
        let rule = normalize(rule);
        let rules = state
            .chains
            .get_mut(&key(table, chain))
            .ok_or_else(Self::no_chain)?;
        let index = rules.iter().position(|r| *r == rule).ok_or_else(|| {
            BackendError::new("Bad rule (does a matching rule exist in that chain?).")
        })?;
        rules.remove(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_has_builtin_filter_chains() {
        let backend = MemoryBackend::new();
        assert!(backend.chain_exists("filter", "INPUT").unwrap());
        assert!(!backend.chain_exists("filter", "nflog").unwrap());
    }

    #[test]
    fn flush_missing_chain_fails() {
        let backend = MemoryBackend::new();
        assert!(backend.flush_chain("filter", "nflog").is_err());
    }

    #[test]
    fn insert_respects_position() {
        let backend = MemoryBackend::new().with_chain("filter", "INPUT", &["-j ACCEPT"]);
        backend.insert("filter", "INPUT", "-j nflog", 1).unwrap();
        assert_eq!(
            backend.rules("filter", "INPUT").unwrap(),
            vec!["-j nflog".to_owned(), "-j ACCEPT".to_owned()]
        );
        assert!(backend.insert("filter", "INPUT", "-j DROP", 9).is_err());
    }

    #[test]
    fn exists_normalizes_whitespace_and_tolerates_missing_chain() {
        let backend = MemoryBackend::new().with_chain("filter", "nflog", &["-p tcp  -j NFLOG"]);
        assert!(backend.exists("filter", "nflog", "-p tcp -j NFLOG").unwrap());
        assert!(!backend.exists("filter", "absent", "-p tcp -j NFLOG").unwrap());
    }

    #[test]
    fn delete_removes_one_copy() {
        let backend = MemoryBackend::new().with_chain("filter", "INPUT", &["-j nflog", "-j nflog"]);
        backend.delete("filter", "INPUT", "-j nflog").unwrap();
        assert_eq!(backend.count("filter", "INPUT", "-j nflog"), 1);
    }

    #[test]
    fn delete_chain_refuses_referenced_or_nonempty() {
        let backend = MemoryBackend::new()
            .with_chain("filter", "nflog", &[])
            .with_chain("filter", "INPUT", &["-j nflog"]);
        assert!(backend.delete_chain("filter", "nflog").is_err());
        backend.delete("filter", "INPUT", "-j nflog").unwrap();
        backend.delete_chain("filter", "nflog").unwrap();
        assert!(backend.rules("filter", "nflog").is_none());
    }

    #[test]
    fn query_absence_needs_status_one_and_a_not_found_message() {
        assert_eq!(query_answer(Some(0), ""), Ok(true));
        assert_eq!(query_answer(Some(1), NO_CHAIN), Ok(false));
        assert_eq!(query_answer(Some(1), BAD_RULE), Ok(false));
    }

    #[test]
    fn query_failures_are_not_absence() {
        // denied, legacy lock contention, missing extension, killed
        let denied = query_answer(Some(4), "iptables v1.8.9 (nf_tables): Permission denied (you must be root)\n");
        assert_eq!(
            denied.unwrap_err().to_string(),
            "iptables v1.8.9 (nf_tables): Permission denied (you must be root)"
        );
        assert!(query_answer(Some(3), "can't initialize iptables table `filter'").is_err());
        assert!(query_answer(Some(1), "Couldn't load match `multiport'").is_err());
        assert!(query_answer(Some(2), "").unwrap_err().to_string().contains("status 2"));
        assert!(query_answer(None, "").is_err());
    }

    #[test]
    fn injected_query_failure_is_an_error_not_absence() {
        let backend = MemoryBackend::new();
        backend.fail_on(BackendOp::Exists, "INPUT");
        assert!(backend.exists("filter", "INPUT", "-j nflog").is_err());
        assert!(!backend.exists("filter", "OUTPUT", "-j nflog").unwrap());
    }

    #[test]
    fn injected_failure_is_reported() {
        let backend = MemoryBackend::new();
        backend.fail_on(BackendOp::ChainExists, "nflog");
        let err = backend.chain_exists("filter", "nflog").unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
        backend.clear_failures();
        assert!(backend.chain_exists("filter", "nflog").is_ok());
    }
}
