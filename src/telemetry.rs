//! Structured reporting of protocol anomalies and broken invariants.
//!
//! Instead of sprinkling `tracing::warn!` calls, the engine builds a [`Violation`] and hands
//! it to a [`ViolationObserver`]. By default that is the [`TracingObserver`], which logs
//! the violation with structured fields. Sessions accept a custom observer through
//! [`SessionBuilder::with_violation_observer`](crate::SessionBuilder::with_violation_observer);
//! tests usually plug in a [`CollectingObserver`] and assert on what it saw.
//!
//! ```
//! use rampart_rollback::telemetry::{CollectingObserver, ViolationKind, ViolationObserver};
//! use rampart_rollback::report_violation_to;
//! use rampart_rollback::telemetry::ViolationSeverity;
//! use std::sync::Arc;
//!
//! let collector = Arc::new(CollectingObserver::new());
//! let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
//! report_violation_to!(&observer, ViolationSeverity::Warning, ViolationKind::NetworkProtocol,
//!     "dropped {} datagrams", 3);
//! assert!(collector.has_violation(ViolationKind::NetworkProtocol));
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[cfg(feature = "json")]
mod frame_serializer {
    use crate::Frame;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(frame: &Option<Frame>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match frame {
            Some(f) if f.is_valid() => serializer.serialize_i32(f.as_i32()),
            _ => serializer.serialize_none(),
        }
    }
}

/// Severity of a violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable; the operation continued.
    Warning,
    /// Serious issue; behavior may be degraded.
    Error,
    /// A core invariant is broken and state may be corrupted.
    Critical,
}

impl ViolationSeverity {
    /// Returns a label suitable for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem in which a violation was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Frame bookkeeping went wrong, e.g. an input for the wrong frame.
    FrameSync,
    /// Input queue sequencing or capacity problems.
    InputQueue,
    /// Saving or loading state failed.
    StateManagement,
    /// Malformed or unexpected packets, transport overflow.
    NetworkProtocol,
    /// Handshake anomalies such as excessive retries.
    Synchronization,
    /// A configuration value was rejected or adjusted.
    Configuration,
    /// A library bug.
    InternalError,
    /// A type's runtime invariant check failed.
    Invariant,
}

impl ViolationKind {
    /// Returns a label suitable for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FrameSync => "frame_sync",
            Self::InputQueue => "input_queue",
            Self::StateManagement => "state_management",
            Self::NetworkProtocol => "network_protocol",
            Self::Synchronization => "synchronization",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
            Self::Invariant => "invariant",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation with everything needed to diagnose it.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "json", derive(serde::Serialize))]
pub struct Violation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Where it happened.
    pub kind: ViolationKind,
    /// Human-readable description.
    pub message: String,
    /// Source location (`file:line`) that reported it.
    pub location: &'static str,
    /// The frame the violation relates to, if any.
    #[cfg_attr(
        feature = "json",
        serde(serialize_with = "frame_serializer::serialize")
    )]
    pub frame: Option<Frame>,
    /// Additional key/value context.
    pub context: BTreeMap<String, String>,
}

impl Violation {
    /// Creates a new violation without frame or context.
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
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches the frame at which the violation occurred.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Adds a context key/value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes the violation to JSON.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives violations. Observers may be shared with the background receive thread of
/// [`ThreadedUdpSocket`](crate::ThreadedUdpSocket), hence `Send + Sync`.
pub trait ViolationObserver: Send + Sync {
    /// Called for every reported violation. Keep it cheap; it runs on hot paths.
    fn on_violation(&self, violation: &Violation);
}

/// Default observer: logs through `tracing`.
///
/// `Warning` maps to `tracing::warn!`, `Error` and `Critical` to `tracing::error!`.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn format_frame(frame: Option<Frame>) -> String {
        frame
            .filter(|f| f.is_valid())
            .map_or_else(|| String::from("null"), |f| f.as_i32().to_string())
    }

    fn format_context(context: &BTreeMap<String, String>) -> String {
        let mut out = String::from("{");
        for (i, (key, value)) in context.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out.push('}');
        out
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &Violation) {
        // `tracing` needs the level at compile time, so both arms spell out the same fields.
        macro_rules! emit {
            ($level:ident) => {
                tracing::$level!(
                    severity = violation.severity.as_str(),
                    kind = violation.kind.as_str(),
                    location = violation.location,
                    frame = %Self::format_frame(violation.frame),
                    context = %Self::format_context(&violation.context),
                    "{}",
                    violation.message
                )
            };
        }

        if violation.severity == ViolationSeverity::Warning {
            emit!(warn);
        } else {
            emit!(error);
        }
    }
}

/// Observer that stores every violation, for tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<Violation>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    /// Number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns true if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Returns true if any violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Returns every violation at or above `min_severity`.
    #[must_use]
    pub fn violations_at_severity(&self, min_severity: ViolationSeverity) -> Vec<Violation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.severity >= min_severity)
            .cloned()
            .collect()
    }

    /// Forgets everything collected so far.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Reports `violation` to `observer`, or to [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &Violation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation through the default [`TracingObserver`], tagging it with the
/// current source location.
///
/// ```
/// use rampart_rollback::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// report_violation!(ViolationSeverity::Warning, ViolationKind::FrameSync,
///     "frame mismatch: expected={}, actual={}", 10, 15);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Like [`report_violation!`], but goes to an `Option<Arc<dyn ViolationObserver>>` and
/// falls back to [`TracingObserver`] when it is `None`.
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

/// Asserts that a [`CollectingObserver`] saw no violations.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "observer collected {} unexpected violation(s): {:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Asserts that a [`CollectingObserver`] saw a violation of the given kind.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "no {:?} violation among {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}

// ==========================================
// Runtime Invariant Checking
// ==========================================

/// Describes a broken invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Type whose invariant broke.
    pub type_name: &'static str,
    /// The invariant that does not hold.
    pub invariant: String,
    /// Extra diagnostic detail.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates a new invariant violation.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Adds details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}: {} [{details}]", self.type_name, self.invariant),
            None => write!(f, "{}: {}", self.type_name, self.invariant),
        }
    }
}

/// Types with internal invariants that can be checked at runtime.
pub trait InvariantChecker {
    /// Returns the first broken invariant, if any.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Checks invariants in debug builds (or with the `paranoid` feature) and reports
/// failures as critical violations. Compiles to nothing otherwise.
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "broken invariant in {}: {}",
                $context,
                violation
            );
        }
    }};
}

/// No-op version for release builds without `paranoid`.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr) => {{}};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn sample(kind: ViolationKind, severity: ViolationSeverity) -> Violation {
        Violation::new(severity, kind, "sample", "telemetry.rs:1")
    }

    #[test]
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn violation_display_contains_frame_and_context() {
        let violation = sample(ViolationKind::FrameSync, ViolationSeverity::Warning)
            .with_frame(Frame::new(100))
            .with_context("expected", "10");
        let text = violation.to_string();
        assert!(text.contains("warning/frame_sync"));
        assert!(text.contains("frame=100"));
        assert!(text.contains("expected"));
    }

    #[test]
    fn collecting_observer_filters() {
        let observer = CollectingObserver::new();
        observer.on_violation(&sample(ViolationKind::InputQueue, ViolationSeverity::Warning));
        observer.on_violation(&sample(
            ViolationKind::StateManagement,
            ViolationSeverity::Critical,
        ));

        assert_eq!(observer.len(), 2);
        assert!(observer.has_violation(ViolationKind::InputQueue));
        assert!(!observer.has_violation(ViolationKind::Configuration));
        assert_eq!(
            observer
                .violations_at_severity(ViolationSeverity::Error)
                .len(),
            1
        );

        observer.clear();
        assert!(observer.is_empty());
        assert_no_violations!(observer);
    }

    #[test]
    fn report_violation_to_routes_to_observer() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            &observer,
            ViolationSeverity::Error,
            ViolationKind::Synchronization,
            "retries: {}",
            7
        );
        assert_violation!(collector, ViolationKind::Synchronization);
        assert_eq!(collector.violations()[0].message, "retries: 7");
    }

    #[test]
    fn report_violation_to_falls_back_to_tracing() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            &observer,
            ViolationSeverity::Warning,
            ViolationKind::FrameSync,
            "goes to tracing"
        );
        report_violation!(
            ViolationSeverity::Warning,
            ViolationKind::FrameSync,
            "also tracing {}",
            1
        );
    }

    #[test]
    fn tracing_observer_formats_null_frame() {
        assert_eq!(TracingObserver::format_frame(None), "null");
        assert_eq!(TracingObserver::format_frame(Some(Frame::NULL)), "null");
        assert_eq!(TracingObserver::format_frame(Some(Frame::new(4))), "4");
    }

    #[test]
    fn invariant_violation_display() {
        let violation = InvariantViolation::new("InputQueue", "length exceeds capacity")
            .with_details("length=9, capacity=8");
        assert_eq!(
            violation.to_string(),
            "InputQueue: length exceeds capacity [length=9, capacity=8]"
        );
    }

    #[cfg(feature = "json")]
    #[test]
    fn violation_serializes_to_json() {
        let json = sample(ViolationKind::FrameSync, ViolationSeverity::Warning)
            .with_frame(Frame::new(42))
            .to_json()
            .unwrap();
        assert!(json.contains(r#""kind":"frame_sync""#));
        assert!(json.contains(r#""frame":42"#));
    }
}
