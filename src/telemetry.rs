//! Structured telemetry for runtime rule violations.
//!
//! Instead of only logging with `tracing::warn!`, violations of the runtime's own
//! rules (frame ordering, ring bounds, configuration constraints) are structured
//! data that can be:
//!
//! - logged via tracing (default behavior),
//! - collected programmatically for testing,
//! - sent to custom observers (metrics, alerting).
//!
//! # Example
//!
//! ```
//! use bulwark_rollback::telemetry::CollectingObserver;
//!
//! let observer = CollectingObserver::new();
//! // ... run some operations that report to the observer ...
//! assert!(observer.violations().is_empty(), "unexpected violations");
//! ```

use parking_lot::Mutex;
use std::sync::Arc;

/// Severity of a runtime rule violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ViolationSeverity {
    /// Unexpected but harmless; operation continued unchanged.
    Info,
    /// Unexpected and recovered with a fallback.
    Warning,
    /// An operation was refused or produced a degraded result.
    Error,
    /// The runtime's own invariants are broken; state may be inconsistent.
    Critical,
}

/// The subsystem domain a violation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ViolationKind {
    /// Frame ordering and confirmation horizon rules.
    FrameSync,
    /// Rollback and re-simulation rules.
    Rollback,
    /// Checksum exchange and desync handling.
    Desync,
    /// Host migration protocol.
    Migration,
    /// Latency, loss and bandwidth measurement.
    Diagnostics,
    /// Configuration validation.
    Configuration,
    /// Anything that indicates a bug in the runtime itself.
    InternalError,
}

/// A single reported violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeViolation {
    /// How severe the violation is.
    pub severity: ViolationSeverity,
    /// Which subsystem domain it belongs to.
    pub kind: ViolationKind,
    /// Human-readable description.
    pub message: String,
    /// `file:line` of the reporting site.
    pub location: &'static str,
}

impl RuntimeViolation {
    /// Creates a new violation record.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
        }
    }
}

impl std::fmt::Display for RuntimeViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:?}/{:?}] {} ({})",
            self.severity, self.kind, self.message, self.location
        )
    }
}

/// Receives violations as they are reported.
pub trait ViolationObserver: Send + Sync {
    /// Called once per reported violation.
    fn on_violation(&self, violation: &RuntimeViolation);
}

/// The default observer: mirrors violations into `tracing` at a level matching
/// their severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &RuntimeViolation) {
        match violation.severity {
            ViolationSeverity::Info => {
                tracing::debug!(kind = ?violation.kind, location = violation.location, "{}", violation.message);
            },
            ViolationSeverity::Warning => {
                tracing::warn!(kind = ?violation.kind, location = violation.location, "{}", violation.message);
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(kind = ?violation.kind, location = violation.location, "{}", violation.message);
            },
        }
    }
}

/// An observer that stores every violation, for tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<RuntimeViolation>>,
}

impl CollectingObserver {
    /// Creates an empty collecting observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<RuntimeViolation> {
        self.violations.lock().clone()
    }

    /// Removes and returns all collected violations.
    pub fn drain(&self) -> Vec<RuntimeViolation> {
        std::mem::take(&mut *self.violations.lock())
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &RuntimeViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Routes a violation to an optional observer, always mirroring into tracing.
pub fn report_to_observer(
    observer: Option<&Arc<dyn ViolationObserver>>,
    violation: &RuntimeViolation,
) {
    TracingObserver.on_violation(violation);
    if let Some(obs) = observer {
        obs.on_violation(violation);
    }
}

/// Reports a violation of the runtime's own rules.
///
/// Always logs via [`TracingObserver`]; an optional first argument routes the
/// violation to a session-owned observer as well.
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::RuntimeViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::RuntimeViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// A failed invariant check, with an optional details string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    /// The component whose invariant failed.
    pub component: &'static str,
    /// Which invariant failed.
    pub invariant: String,
    /// Optional context (field values).
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates a new invariant violation for `component`.
    #[must_use]
    pub fn new(component: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            component,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Attaches context to the violation.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            Some(details) => {
                write!(f, "{}: {} ({})", self.component, self.invariant, details)
            },
            None => write!(f, "{}: {}", self.component, self.invariant),
        }
    }
}

/// Implemented by stateful subsystems so tests (and the `paranoid` feature) can
/// verify their internal invariants at any point.
pub trait InvariantChecker {
    /// Returns the first violated invariant, or `Ok(())` if all hold.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn collecting_observer_stores_violations() {
        let observer = CollectingObserver::new();
        let violation = RuntimeViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::FrameSync,
            "input frame behind confirmed horizon",
            "telemetry.rs:1",
        );
        observer.on_violation(&violation);
        observer.on_violation(&violation);

        assert_eq!(observer.violations().len(), 2);
        assert_eq!(observer.drain().len(), 2);
        assert!(observer.violations().is_empty());
    }

    #[test]
    fn severities_are_ordered() {
        assert!(ViolationSeverity::Info < ViolationSeverity::Warning);
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn report_macro_formats_arguments() {
        // Only checks that both macro arms expand and run.
        report_violation!(
            ViolationSeverity::Info,
            ViolationKind::Diagnostics,
            "plain message"
        );
        report_violation!(
            ViolationSeverity::Info,
            ViolationKind::Diagnostics,
            "formatted {} message {}",
            1,
            "two"
        );
    }

    #[test]
    fn invariant_violation_display() {
        let violation = InvariantViolation::new("SnapshotRing", "ring length exceeded")
            .with_details("len=61, cap=60");
        let msg = violation.to_string();
        assert!(msg.contains("SnapshotRing"));
        assert!(msg.contains("len=61"));
    }

    #[test]
    fn report_to_observer_routes() {
        let observer: Arc<dyn ViolationObserver> = Arc::new(CollectingObserver::new());
        let violation = RuntimeViolation::new(
            ViolationSeverity::Error,
            ViolationKind::Migration,
            "state transfer timed out",
            "telemetry.rs:2",
        );
        report_to_observer(Some(&observer), &violation);
        report_to_observer(None, &violation);
    }
}
