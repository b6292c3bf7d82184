//! Idempotent capture-chain install and teardown
//!
//! [`RuleManager::init`] converges the firewall to one state no matter what
//! it started from:
//!
//! ```text
//! 1. clear chain        flush if present, create if absent
//! 2. remove attachment  delete every `-j <chain>` in attach_to
//! 3. insert attachment  `-j <chain>` at position
//! 4. append rules       skip any rule already present
//! ```
//!
//! A step that finds nothing to undo records [`Absence::NotPresent`]; a
//! backend error (including a failed existence query) aborts with the step
//! name. Nothing is rolled back. Callers serialize init/teardown per chain.

use flagwatch_core::metrics as m;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, FirewallBackend};
use crate::chain::ChainSpec;
use crate::error::{FirewallError, Step};
use crate::rule::FirewallRule;

/// Upper bound on attachment copies removed in one pass.
const MAX_DETACH: usize = 256;

/// Whether an "if present" step had something to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absence {
    /// The target existed and the mutation was applied
    Applied,
    /// The target was already absent; nothing to do
    NotPresent,
}

impl Absence {
    fn from_present(present: bool) -> Self {
        if present { Self::Applied } else { Self::NotPresent }
    }
}

/// What [`RuleManager::init`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    /// `Applied`: existing chain flushed. `NotPresent`: chain created.
    pub flushed: Absence,
    /// Whether a stale attachment had to be removed
    pub detached: Absence,
    /// Number of attachment copies removed
    pub removed_attachments: usize,
    /// Rules appended
    pub appended: usize,
    /// Rules skipped because an identical one was already in the chain
    pub already_present: usize,
}

/// What [`RuleManager::teardown`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub detached: Absence,
    pub removed_attachments: usize,
    /// `NotPresent` when the chain was already gone
    pub deleted: Absence,
}

/// Installs and removes the capture chain through a [`FirewallBackend`].
pub struct RuleManager<B> {
    backend: B,
}

#[cfg(target_os = "linux")]
impl RuleManager<crate::backend::IptablesBackend> {
    /// Manager over the system `iptables` (or `ip6tables`).
    pub fn iptables(ipv6: bool) -> Result<Self, FirewallError> {
        let backend = crate::backend::IptablesBackend::new(ipv6)
            .map_err(|e| FirewallError::Backend(e.to_string()))?;
        Ok(Self::new(backend))
    }
}

impl<B: FirewallBackend> RuleManager<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Brings the chain to its configured state. Running it again changes
    /// nothing.
    pub fn init(
        &self,
        spec: &ChainSpec,
        rules: &[FirewallRule],
    ) -> Result<InitReport, FirewallError> {
        let result = self.init_inner(spec, rules);
        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!(m::FIREWALL_INIT_TOTAL, m::LABEL_RESULT => outcome).increment(1);
        if let Err(e) = &result {
            warn!(table = %spec.table, chain = %spec.chain, error = %e, "capture chain install failed");
        }
        result
    }

    fn init_inner(
        &self,
        spec: &ChainSpec,
        rules: &[FirewallRule],
    ) -> Result<InitReport, FirewallError> {
        let table = spec.table.as_str();
        let chain = spec.chain.as_str();

        // 1. clear chain
        let present = self
            .backend
            .chain_exists(table, chain)
            .map_err(|e| step_err(Step::ClearChain, table, chain, e))?;
        if present {
            self.backend
                .flush_chain(table, chain)
                .map_err(|e| step_err(Step::ClearChain, table, chain, e))?;
        } else {
            self.backend
                .new_chain(table, chain)
                .map_err(|e| step_err(Step::ClearChain, table, chain, e))?;
        }
        let flushed = Absence::from_present(present);
        debug!(table, chain, ?flushed, "capture chain cleared");

        // 2. remove attachment
        let removed_attachments = self.detach(spec)?;
        let detached = Absence::from_present(removed_attachments > 0);
        if removed_attachments > 1 {
            warn!(
                table,
                attach_to = %spec.attach_to,
                count = removed_attachments,
                "removed duplicate attachments"
            );
        }

        // 3. insert attachment
        let jump = spec.jump_rule();
        self.backend
            .insert(table, &spec.attach_to, &jump, spec.position)
            .map_err(|e| step_err(Step::InsertAttachment, table, &spec.attach_to, e))?;

        // 4. append rules
        let mut appended = 0;
        let mut already_present = 0;
        for rule in rules {
            let rulespec = rule.rulespec();
            let exists = self
                .backend
                .exists(table, chain, &rulespec)
                .map_err(|e| step_err(Step::AppendRule, table, chain, e))?;
            if exists {
                already_present += 1;
                continue;
            }
            self.backend
                .append(table, chain, &rulespec)
                .map_err(|e| step_err(Step::AppendRule, table, chain, e))?;
            appended += 1;
        }

        info!(
            table,
            chain,
            attach_to = %spec.attach_to,
            position = spec.position,
            appended,
            already_present,
            "capture chain installed"
        );

        Ok(InitReport {
            flushed,
            detached,
            removed_attachments,
            appended,
            already_present,
        })
    }

    /// Removes the capture chain and every jump into it. Succeeds when
    /// already torn down.
    pub fn teardown(&self, spec: &ChainSpec) -> Result<TeardownReport, FirewallError> {
        let result = self.teardown_inner(spec);
        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!(m::FIREWALL_TEARDOWN_TOTAL, m::LABEL_RESULT => outcome).increment(1);
        result
    }

    fn teardown_inner(&self, spec: &ChainSpec) -> Result<TeardownReport, FirewallError> {
        let table = spec.table.as_str();
        let chain = spec.chain.as_str();

        let removed_attachments = self.detach(spec)?;

        let present = self
            .backend
            .chain_exists(table, chain)
            .map_err(|e| step_err(Step::DeleteChain, table, chain, e))?;
        if present {
            self.backend
                .flush_chain(table, chain)
                .map_err(|e| step_err(Step::ClearChain, table, chain, e))?;
            self.backend
                .delete_chain(table, chain)
                .map_err(|e| step_err(Step::DeleteChain, table, chain, e))?;
        }

        let report = TeardownReport {
            detached: Absence::from_present(removed_attachments > 0),
            removed_attachments,
            deleted: Absence::from_present(present),
        };
        info!(table, chain, deleted = ?report.deleted, "capture chain removed");
        Ok(report)
    }

    /// Read-only check: chain present, jumped to from `attach_to` and every
    /// rule present. Duplicate jumps are not detected; `init` removes them.
    pub fn verify(&self, spec: &ChainSpec, rules: &[FirewallRule]) -> Result<bool, FirewallError> {
        let table = spec.table.as_str();
        let chain = spec.chain.as_str();
        let verify_err = |e: BackendError| step_err(Step::Verify, table, chain, e);

        if !self.backend.chain_exists(table, chain).map_err(verify_err)? {
            return Ok(false);
        }
        if !self
            .backend
            .exists(table, &spec.attach_to, &spec.jump_rule())
            .map_err(verify_err)?
        {
            return Ok(false);
        }
        for rule in rules {
            if !self
                .backend
                .exists(table, chain, &rule.rulespec())
                .map_err(verify_err)?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Deletes `-j <chain>` from `attach_to` until none is left.
    fn detach(&self, spec: &ChainSpec) -> Result<usize, FirewallError> {
        let table = spec.table.as_str();
        let attach_to = spec.attach_to.as_str();
        let jump = spec.jump_rule();

        let mut removed = 0;
        while self
            .backend
            .exists(table, attach_to, &jump)
            .map_err(|e| step_err(Step::RemoveAttachment, table, attach_to, e))?
        {
            if removed == MAX_DETACH {
                return Err(step_err(
                    Step::RemoveAttachment,
                    table,
                    attach_to,
                    BackendError::new(format!("attachment still present after {MAX_DETACH} deletions")),
                ));
            }
            self.backend
                .delete(table, attach_to, &jump)
                .map_err(|e| step_err(Step::RemoveAttachment, table, attach_to, e))?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn step_err(step: Step, table: &str, chain: &str, err: BackendError) -> FirewallError {
    FirewallError::Step {
        step,
        table: table.to_owned(),
        chain: chain.to_owned(),
        reason: err.0,
    }
}
