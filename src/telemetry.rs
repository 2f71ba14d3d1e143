//! Structured reporting of protocol violations.
//!
//! Conditions the engine recovers from but that point at a misbehaving peer, a lossy link or
//! a host bug (an input gap wider than the send window, a restore with nothing to restore,
//! a failing socket) are reported as [`ProtocolViolation`] values instead of bare log lines.
//! By default they are logged through `tracing`; a session can be given its own
//! [`ViolationObserver`] to collect or forward them.
//!
//! ```
//! use netplay_rollback::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! // hand `observer.clone()` to SessionBuilder::with_violation_observer, run the session ...
//! assert!(!observer.has_violation(ViolationKind::InputHistory));
//! ```

use crate::Tick;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Serializes `Option<Tick>` as a plain integer, or `null` for `None` and [`Tick::NULL`].
mod tick_serializer {
    use crate::Tick;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(tick: &Option<Tick>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match tick {
            Some(t) if t.is_valid() => serializer.serialize_i64(t.as_i64()),
            _ => serializer.serialize_none(),
        }
    }
}

/// How bad a violation is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Recovered from; the session continued normally.
    Warning,
    /// The session continued, but its results may be affected.
    Error,
    /// The session can no longer produce correct results.
    Critical,
}

impl ViolationSeverity {
    /// Label used in logs.
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

/// The subsystem a violation was detected in.
///
/// This enum is marked `#[non_exhaustive]`; always include a wildcard arm when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Tick bookkeeping, e.g. remote input far ahead of the local simulation.
    TickSync,
    /// Input windows, e.g. ticks skipped between two received windows.
    InputHistory,
    /// Snapshot save and restore.
    StateManagement,
    /// Transport and packet handling.
    NetworkProtocol,
    /// The checksum audit found diverged peers.
    ChecksumMismatch,
    /// Configuration constraints.
    Configuration,
}

impl ViolationKind {
    /// Label used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TickSync => "tick_sync",
            Self::InputHistory => "input_history",
            Self::StateManagement => "state_management",
            Self::NetworkProtocol => "network_protocol",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reported violation, with where and when it happened.
///
/// ```
/// use netplay_rollback::telemetry::{ProtocolViolation, ViolationKind, ViolationSeverity};
/// use netplay_rollback::Tick;
///
/// let violation = ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::InputHistory,
///     "input gap",
///     "p2p_session.rs:1",
/// )
/// .with_tick(Tick::new(40))
/// .with_context("missing", "7");
///
/// assert_eq!(violation.tick, Some(Tick::new(40)));
/// assert!(violation.to_string().contains("tick=40"));
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProtocolViolation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Where it was detected.
    pub kind: ViolationKind,
    /// Human-readable description.
    pub message: String,
    /// `file:line` of the report.
    pub location: &'static str,
    /// The tick the violation relates to, if any.
    #[serde(serialize_with = "tick_serializer::serialize")]
    pub tick: Option<Tick>,
    /// Additional key-value diagnostics.
    pub context: BTreeMap<String, String>,
}

impl ProtocolViolation {
    /// Creates a violation without tick or context.
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
            tick: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches the tick the violation relates to.
    #[must_use]
    pub fn with_tick(mut self, tick: Tick) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Adds one context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes the violation to a JSON object. Ticks are plain integers or `null`.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(tick) = self.tick {
            write!(f, ", tick={tick}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives every violation a session reports.
///
/// Called synchronously from inside [`P2PSession::update`](crate::P2PSession::update), so
/// implementations should return quickly.
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Called once per reported violation.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Receives every violation a session reports.
///
/// Called synchronously from inside [`P2PSession::update`](crate::P2PSession::update), so
/// implementations should return quickly.
#[cfg(not(feature = "sync-send"))]
pub trait ViolationObserver {
    /// Called once per reported violation.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Logs violations through `tracing`: warnings with `warn!`, everything else with `error!`.
///
/// Severity, kind, location, tick and context are emitted as structured fields.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates the observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let tick = match violation.tick {
            Some(t) if t.is_valid() => t.as_i64().to_string(),
            _ => "null".to_owned(),
        };
        let context = violation
            .context
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");

        match violation.severity {
            ViolationSeverity::Warning => tracing::warn!(
                severity,
                kind,
                location,
                tick = %tick,
                context = %context,
                "{}",
                violation.message
            ),
            ViolationSeverity::Error | ViolationSeverity::Critical => tracing::error!(
                severity,
                kind,
                location,
                tick = %tick,
                context = %context,
                "{}",
                violation.message
            ),
        }
    }
}

/// Stores every violation in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All violations collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().clone()
    }

    /// Number of violations collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Whether nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Whether a violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// All collected violations of `kind`.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<ProtocolViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Forgets everything collected so far.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Reports a violation to `observer`, or to a [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ProtocolViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation through `tracing`, recording the call site.
///
/// ```
/// use netplay_rollback::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// report_violation!(
///     ViolationSeverity::Warning,
///     ViolationKind::NetworkProtocol,
///     "send failed: {}",
///     "connection refused"
/// );
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Reports a prepared [`ProtocolViolation`] through an `Option<Arc<dyn ViolationObserver>>`,
/// falling back to `tracing`.
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $violation:expr) => {{
        $crate::telemetry::report_to_observer($observer.as_ref(), &$violation);
    }};
}

/// Panics unless `observer` collected nothing.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Panics unless `observer` collected a violation of `kind`.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};
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

    fn violation(kind: ViolationKind) -> ProtocolViolation {
        ProtocolViolation::new(ViolationSeverity::Warning, kind, "test", "test.rs:1")
    }

    #[test]
    fn severities_are_ordered() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn display_includes_tick_and_context() {
        let text = violation(ViolationKind::InputHistory)
            .with_tick(Tick::new(12))
            .with_context("missing", "3")
            .to_string();
        assert!(text.starts_with("[warning/input_history] test (at test.rs:1"));
        assert!(text.contains("tick=12"));
        assert!(text.contains("missing"));
    }

    #[test]
    fn display_without_tick() {
        assert_eq!(
            violation(ViolationKind::TickSync).to_string(),
            "[warning/tick_sync] test (at test.rs:1)"
        );
    }

    #[test]
    fn collecting_observer_filters_by_kind() {
        let observer = CollectingObserver::new();
        observer.on_violation(&violation(ViolationKind::InputHistory));
        observer.on_violation(&violation(ViolationKind::NetworkProtocol));
        observer.on_violation(&violation(ViolationKind::InputHistory));
        assert_eq!(observer.len(), 3);
        assert_eq!(observer.violations_of_kind(ViolationKind::InputHistory).len(), 2);
        assert!(!observer.has_violation(ViolationKind::ChecksumMismatch));
        assert_violation!(observer, ViolationKind::NetworkProtocol);
        observer.clear();
        assert_no_violations!(observer);
    }

    #[test]
    fn report_to_observer_prefers_the_given_observer() {
        let observer = Arc::new(CollectingObserver::new());
        report_to_observer(Some(&observer), &violation(ViolationKind::StateManagement));
        report_to_observer(None::<&Arc<CollectingObserver>>, &violation(ViolationKind::StateManagement));
        assert_eq!(observer.len(), 1);
    }

    #[test]
    fn report_violation_to_accepts_dyn_observers() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(observer, violation(ViolationKind::TickSync));
        assert!(collector.has_violation(ViolationKind::TickSync));
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_uses_plain_ticks() {
        let json = violation(ViolationKind::InputHistory)
            .with_tick(Tick::new(7))
            .to_json()
            .unwrap();
        assert!(json.contains(r#""tick":7"#));
        assert!(json.contains(r#""kind":"input_history""#));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["tick"], serde_json::json!(7));
        let json = violation(ViolationKind::InputHistory)
            .with_tick(Tick::NULL)
            .to_json()
            .unwrap();
        assert!(json.contains(r#""tick":null"#));
    }
}
