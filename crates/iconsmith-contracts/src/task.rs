use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Created,
    QuotaChecked,
    Submitted,
    Polling,
    Completed,
    Failed,
    Cancelled,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::QuotaChecked => "quota_checked",
            Self::Submitted => "submitted",
            Self::Polling => "polling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Human-readable label for progress displays.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "Preparing request",
            Self::QuotaChecked => "Quota confirmed",
            Self::Submitted => "Submitted to provider",
            Self::Polling => "Generating",
            Self::Completed => "Done",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque id the backend assigns on submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteTaskHandle(String);

impl RemoteTaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a finished asset, usually the backend's `resultURL`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRef(String);

impl ResultRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle record of one generation.
///
/// Only the orchestrator that owns it mutates a `TaskState`. Every mutator refuses to act once
/// the phase is terminal and reports whether it applied, so late poll responses fall through
/// without touching the state. Progress only ever moves up.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    phase: TaskPhase,
    progress_fraction: f64,
    last_polled_at: Option<DateTime<Utc>>,
    result_ref: Option<ResultRef>,
    failure_reason: Option<FailureKind>,
    polls: u32,
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            phase: TaskPhase::Created,
            progress_fraction: 0.0,
            last_polled_at: None,
            result_ref: None,
            failure_reason: None,
            polls: 0,
        }
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn progress_fraction(&self) -> f64 {
        self.progress_fraction
    }

    pub fn last_polled_at(&self) -> Option<DateTime<Utc>> {
        self.last_polled_at
    }

    pub fn result_ref(&self) -> Option<&ResultRef> {
        self.result_ref.as_ref()
    }

    pub fn failure_reason(&self) -> Option<FailureKind> {
        self.failure_reason
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Moves to a non-terminal phase. Terminal phases go through `complete`, `fail`, `cancel`.
    pub fn advance(&mut self, phase: TaskPhase) -> bool {
        if self.is_terminal() || phase.is_terminal() {
            return false;
        }
        self.phase = phase;
        true
    }

    pub fn raise_progress(&mut self, fraction: f64) -> bool {
        if self.is_terminal() || !fraction.is_finite() {
            return false;
        }
        let clamped = fraction.clamp(0.0, 1.0);
        if clamped <= self.progress_fraction {
            return false;
        }
        self.progress_fraction = clamped;
        true
    }

    pub fn record_poll(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.polls = self.polls.saturating_add(1);
        self.last_polled_at = Some(at);
        true
    }

    pub fn complete(&mut self, result_ref: ResultRef) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.phase = TaskPhase::Completed;
        self.progress_fraction = 1.0;
        self.result_ref = Some(result_ref);
        true
    }

    pub fn fail(&mut self, reason: FailureKind) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.phase = TaskPhase::Failed;
        self.failure_reason = Some(reason);
        true
    }

    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.phase = TaskPhase::Cancelled;
        true
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            phase: self.phase,
            progress_fraction: self.progress_fraction,
            phase_label: self.phase.label().to_string(),
            polls: self.polls,
            last_polled_at: self.last_polled_at,
            result_ref: self.result_ref.clone(),
            failure_reason: self.failure_reason,
        }
    }
}

/// Immutable copy of a `TaskState` handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub phase: TaskPhase,
    pub progress_fraction: f64,
    pub phase_label: String,
    pub polls: u32,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub result_ref: Option<ResultRef>,
    pub failure_reason: Option<FailureKind>,
}

impl Default for TaskSnapshot {
    fn default() -> Self {
        TaskState::new().snapshot()
    }
}

/// One `(phase, progress)` push from an orchestrator or batch coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    /// Slot index inside a batch, `None` for standalone runs.
    pub slot: Option<usize>,
    pub phase: TaskPhase,
    pub progress_fraction: f64,
    pub phase_label: String,
    pub polls: u32,
}
