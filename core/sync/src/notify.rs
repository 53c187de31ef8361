//! User-facing sync notifications.
//!
//! The engine reports what happened through [`Notifier`]; deciding whether
//! an event is worth showing is a table lookup in [`VisibilityMatrix`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// What started a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncTrigger {
    Manual,
    Startup,
    Reconnect,
    FileChange,
    Interval,
}

impl SyncTrigger {
    /// Rank used when coalescing queued requests; higher wins.
    pub fn priority(self) -> u8 {
        match self {
            SyncTrigger::Manual => 4,
            SyncTrigger::Startup => 3,
            SyncTrigger::Reconnect => 2,
            SyncTrigger::FileChange => 1,
            SyncTrigger::Interval => 0,
        }
    }

    /// The higher-priority of two triggers.
    pub fn max(self, other: SyncTrigger) -> SyncTrigger {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::Manual => "manual",
            SyncTrigger::Startup => "startup",
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::FileChange => "file-change",
            SyncTrigger::Interval => "interval",
        };
        f.write_str(name)
    }
}

/// How much the user wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

/// Events raised by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyEvent {
    SyncStarted,
    UpToDate,
    PullComplete,
    PushComplete,
    MergeApplied,
    ConflictForked,
    LockDeferred,
    SyncFailed,
    SafetyHalt,
    ScanComplete,
    ScanPaused,
    IndexRecovered,
    IndexRebuilt,
}

impl NotifyEvent {
    /// Stable key for message lookup.
    pub fn key(self) -> &'static str {
        match self {
            NotifyEvent::SyncStarted => "sync-started",
            NotifyEvent::UpToDate => "up-to-date",
            NotifyEvent::PullComplete => "pull-complete",
            NotifyEvent::PushComplete => "push-complete",
            NotifyEvent::MergeApplied => "merge-applied",
            NotifyEvent::ConflictForked => "conflict-forked",
            NotifyEvent::LockDeferred => "lock-deferred",
            NotifyEvent::SyncFailed => "sync-failed",
            NotifyEvent::SafetyHalt => "safety-halt",
            NotifyEvent::ScanComplete => "scan-complete",
            NotifyEvent::ScanPaused => "scan-paused",
            NotifyEvent::IndexRecovered => "index-recovered",
            NotifyEvent::IndexRebuilt => "index-rebuilt",
        }
    }
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Receives engine notifications.
pub trait Notifier: Send + Sync {
    /// Report an event raised during a pass started by `trigger`.
    fn notify(&self, event: NotifyEvent, trigger: SyncTrigger, detail: Option<&str>);
}

/// One row of the visibility table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityRule {
    pub event: NotifyEvent,
    /// None matches every trigger.
    pub trigger: Option<SyncTrigger>,
    pub min_verbosity: Verbosity,
}

const fn rule(
    event: NotifyEvent,
    trigger: Option<SyncTrigger>,
    min_verbosity: Verbosity,
) -> VisibilityRule {
    VisibilityRule {
        event,
        trigger,
        min_verbosity,
    }
}

/// Default rows. The first matching row wins, so trigger-specific rows
/// precede the catch-all row for the same event.
const DEFAULT_RULES: &[VisibilityRule] = &[
    rule(NotifyEvent::SyncFailed, None, Verbosity::Quiet),
    rule(NotifyEvent::SafetyHalt, None, Verbosity::Quiet),
    rule(NotifyEvent::ConflictForked, None, Verbosity::Quiet),
    rule(NotifyEvent::IndexRecovered, None, Verbosity::Quiet),
    rule(NotifyEvent::UpToDate, Some(SyncTrigger::Manual), Verbosity::Normal),
    rule(NotifyEvent::UpToDate, None, Verbosity::Verbose),
    rule(NotifyEvent::SyncStarted, Some(SyncTrigger::Manual), Verbosity::Normal),
    rule(NotifyEvent::SyncStarted, None, Verbosity::Verbose),
    rule(NotifyEvent::PullComplete, None, Verbosity::Normal),
    rule(NotifyEvent::PushComplete, None, Verbosity::Normal),
    rule(NotifyEvent::MergeApplied, None, Verbosity::Normal),
    rule(NotifyEvent::ScanComplete, None, Verbosity::Normal),
    rule(NotifyEvent::IndexRebuilt, None, Verbosity::Normal),
    rule(NotifyEvent::LockDeferred, None, Verbosity::Verbose),
    rule(NotifyEvent::ScanPaused, None, Verbosity::Verbose),
];

/// Lookup table deciding which notifications reach the user.
#[derive(Debug, Clone)]
pub struct VisibilityMatrix {
    rules: Vec<VisibilityRule>,
}

impl VisibilityMatrix {
    /// Create a matrix from explicit rows.
    pub fn new(rules: Vec<VisibilityRule>) -> Self {
        Self { rules }
    }

    /// Minimum verbosity at which an event is shown.
    ///
    /// Events without a row are shown only at `Verbose`.
    pub fn min_verbosity(&self, event: NotifyEvent, trigger: SyncTrigger) -> Verbosity {
        self.rules
            .iter()
            .find(|r| r.event == event && r.trigger.map_or(true, |t| t == trigger))
            .map(|r| r.min_verbosity)
            .unwrap_or(Verbosity::Verbose)
    }

    /// Whether an event should be surfaced at the given verbosity.
    pub fn is_visible(&self, event: NotifyEvent, trigger: SyncTrigger, verbosity: Verbosity) -> bool {
        verbosity >= self.min_verbosity(event, trigger)
    }
}

impl Default for VisibilityMatrix {
    fn default() -> Self {
        Self::new(DEFAULT_RULES.to_vec())
    }
}

/// Notifier that writes visible events at `info` and the rest at `debug`.
#[derive(Debug, Clone)]
pub struct TracingNotifier {
    matrix: VisibilityMatrix,
    verbosity: Verbosity,
}

impl TracingNotifier {
    /// Create a new notifier with the default visibility matrix.
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            matrix: VisibilityMatrix::default(),
            verbosity,
        }
    }

    /// Replace the visibility matrix.
    pub fn with_matrix(mut self, matrix: VisibilityMatrix) -> Self {
        self.matrix = matrix;
        self
    }
}

impl Notifier for TracingNotifier {
    fn notify(&self, event: NotifyEvent, trigger: SyncTrigger, detail: Option<&str>) {
        let detail = detail.unwrap_or("");
        if self.matrix.is_visible(event, trigger, self.verbosity) {
            info!(event = %event, trigger = %trigger, "{}", detail);
        } else {
            debug!(event = %event, trigger = %trigger, "{}", detail);
        }
    }
}

/// Notifier that remembers every event, for assertions in tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    events: std::sync::Mutex<Vec<(NotifyEvent, SyncTrigger, Option<String>)>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn events(&self) -> Vec<NotifyEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(e, _, _)| *e)
            .collect()
    }

    pub(crate) fn details(&self, event: NotifyEvent) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _, _)| *e == event)
            .filter_map(|(_, _, d)| d.clone())
            .collect()
    }

    pub(crate) fn triggers(&self, event: NotifyEvent) -> Vec<SyncTrigger> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _, _)| *e == event)
            .map(|(_, t, _)| *t)
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn notify(&self, event: NotifyEvent, trigger: SyncTrigger, detail: Option<&str>) {
        self.events
            .lock()
            .unwrap()
            .push((event, trigger, detail.map(String::from)));
    }
}
