//! Metric names and descriptions
//!
//! Every crate records through these constants with `metrics::counter!()`.
//! Without an installed recorder the macros are no-ops, so libraries record
//! unconditionally and the daemon decides whether to export.
//!
//! # Naming
//! - prefix: `flagwatch_`
//! - component: `firewall_`, `capture_`
//! - suffix: `_total` for counters, none for gauges

// --- label keys ---

/// Outcome label key (success, failure)
pub const LABEL_RESULT: &str = "result";

/// Error kind label key (overrun, malformed, kernel)
pub const LABEL_KIND: &str = "kind";

/// Probe label key (stealth, bare-syn, unknown)
pub const LABEL_PROBE: &str = "probe";

// --- firewall ---

/// Firewall: RuleManager init runs (counter, label: result)
pub const FIREWALL_INIT_TOTAL: &str = "flagwatch_firewall_init_total";

/// Firewall: RuleManager teardown runs (counter, label: result)
pub const FIREWALL_TEARDOWN_TOTAL: &str = "flagwatch_firewall_teardown_total";

// --- capture ---

/// Capture: packet events dispatched to the handler (counter)
pub const CAPTURE_EVENTS_TOTAL: &str = "flagwatch_capture_events_total";

/// Capture: payload bytes received (counter)
pub const CAPTURE_BYTES_TOTAL: &str = "flagwatch_capture_bytes_total";

/// Capture: recoverable per-event errors (counter, label: kind)
pub const CAPTURE_ERRORS_TOTAL: &str = "flagwatch_capture_errors_total";

/// Capture: fatal channel faults that ended a session (counter)
pub const CAPTURE_FAULTS_TOTAL: &str = "flagwatch_capture_faults_total";

/// Capture: matched packets by probe signature (counter, label: probe)
pub const CAPTURE_PROBES_TOTAL: &str = "flagwatch_capture_probes_total";

/// Capture: 1 while a session is running (gauge)
pub const CAPTURE_SESSION_RUNNING: &str = "flagwatch_capture_session_running";

// --- daemon ---

/// Daemon: build info, always 1 (gauge, label: version)
pub const DAEMON_BUILD_INFO: &str = "flagwatch_daemon_build_info";

/// Registers descriptions for every metric.
///
/// Call once after installing the recorder.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge};

    describe_counter!(
        FIREWALL_INIT_TOTAL,
        "Capture chain installation attempts by result"
    );
    describe_counter!(
        FIREWALL_TEARDOWN_TOTAL,
        "Capture chain removal attempts by result"
    );
    describe_counter!(
        CAPTURE_EVENTS_TOTAL,
        "Packet events received from the NFLOG group"
    );
    describe_counter!(CAPTURE_BYTES_TOTAL, "Payload bytes received from NFLOG");
    describe_counter!(
        CAPTURE_ERRORS_TOTAL,
        "Recoverable capture errors by kind"
    );
    describe_counter!(
        CAPTURE_FAULTS_TOTAL,
        "Fatal channel faults that stopped a capture session"
    );
    describe_counter!(
        CAPTURE_PROBES_TOTAL,
        "Matched packets by probe signature"
    );
    describe_gauge!(
        CAPTURE_SESSION_RUNNING,
        "1 while a capture session is running"
    );
    describe_gauge!(DAEMON_BUILD_INFO, "Build information (always 1)");
}
