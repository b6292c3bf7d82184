//! `IptablesBackend` against a scripted `iptables` binary on `PATH`.
#![cfg(target_os = "linux")]

use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use flagwatch_firewall::{Absence, ChainSpec, FirewallBackend, FirewallError, IptablesBackend, RuleManager, Step};
use serial_test::serial;

/// Installs an `iptables` that reports a version and answers every other
/// command with `stderr` and `status`.
fn fake_iptables(dir: &Path, status: i32, stderr: &str) {
    let script = format!(
        "#!/bin/sh\n\
         if [ \"$1\" = \"--version\" ]; then\n\
         \techo 'iptables v1.8.7 (nf_tables)'\n\
         \texit 0\n\
         fi\n\
         cat >&2 <<'MSG'\n\
         {stderr}\n\
         MSG\n\
         exit {status}\n"
    );
    let path = dir.join("iptables");
    std::fs::write(&path, script).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
}

/// Runs `f` with `dir` first on `PATH`.
fn with_path<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
    let original = std::env::var_os("PATH").unwrap_or_default();
    let mut path = OsString::from(dir);
    path.push(":");
    path.push(&original);
    // SAFETY: serialized with #[serial], no other thread touches the env
    unsafe { std::env::set_var("PATH", &path) };
    let result = f();
    unsafe { std::env::set_var("PATH", &original) };
    result
}

#[test]
#[serial]
fn permission_denied_query_is_an_error() {
    // Given: every query fails the way an unprivileged run does
    let dir = tempfile::tempdir().unwrap();
    fake_iptables(dir.path(), 4, "iptables v1.8.7 (nf_tables): Permission denied (you must be root)");

    // When
    let (chain, teardown, verify) = with_path(dir.path(), || {
        let backend = IptablesBackend::new(false).unwrap();
        let chain = backend.chain_exists("filter", "nflog");
        let manager = RuleManager::iptables(false).unwrap();
        let spec = ChainSpec::default();
        (chain, manager.teardown(&spec), manager.verify(&spec, &[]))
    });

    // Then: none of them reads as "chain absent"
    assert!(chain.unwrap_err().to_string().contains("Permission denied"));
    match teardown.unwrap_err() {
        FirewallError::Step { step, reason, .. } => {
            assert_eq!(step, Step::RemoveAttachment);
            assert!(reason.contains("Permission denied"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(verify.unwrap_err(), FirewallError::Step { step: Step::Verify, .. }));
}

#[test]
#[serial]
fn missing_chain_reads_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    fake_iptables(dir.path(), 1, "iptables: No chain/target/match by that name.");

    let (chain, teardown) = with_path(dir.path(), || {
        let backend = IptablesBackend::new(false).unwrap();
        let chain = backend.chain_exists("filter", "nflog");
        let manager = RuleManager::iptables(false).unwrap();
        (chain, manager.teardown(&ChainSpec::default()))
    });

    assert!(!chain.unwrap());
    let report = teardown.unwrap();
    assert_eq!(report.detached, Absence::NotPresent);
    assert_eq!(report.deleted, Absence::NotPresent);
}

#[test]
#[serial]
fn unexpected_status_one_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    fake_iptables(dir.path(), 1, "iptables v1.8.7 (nf_tables): Couldn't load match `multiport'");

    let result = with_path(dir.path(), || {
        IptablesBackend::new(false)
            .unwrap()
            .exists("filter", "nflog", "-p tcp -m multiport --dports 20:65535 -j NFLOG")
    });

    assert!(result.unwrap_err().to_string().contains("Couldn't load match"));
}
