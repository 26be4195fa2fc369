//! Bead domain model: the atomic, retryable unit of work.
//!
//! A bead carries its own dependency list, attempt accounting and a
//! status-shaped outcome payload. The status state machine is defined here
//! (`BeadStatus::can_transition_to`); enforcing it on every write is the
//! ledger's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle status of a bead.
///
/// The only legal path is
/// `backlog -> queued -> assigned -> in_progress -> verifying -> {completed | failed}`,
/// with `failed -> requeued -> queued` for retries, forced returns to
/// `queued` for crash recovery, and forced moves to `failed` from any
/// non-terminal status for aborts and exhausted dispatch budgets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Backlog,
    Queued,
    Assigned,
    InProgress,
    Verifying,
    Requeued,
    Completed,
    Failed,
}

impl BeadStatus {
    /// Whether the state machine permits moving to `target`.
    pub fn can_transition_to(&self, target: BeadStatus) -> bool {
        use BeadStatus::*;
        matches!(
            (self, target),
            (Backlog, Queued)
                | (Queued, Assigned)
                // claim rolled back after a lost capacity race
                | (Assigned, Queued)
                | (Assigned, InProgress)
                // dispatch failed before the runtime ran
                | (Assigned, Requeued)
                | (InProgress, Verifying)
                | (InProgress, Requeued)
                // crash recovery forces the bead back to the queue
                | (InProgress, Queued)
                | (Verifying, Completed)
                | (Verifying, Requeued)
                | (Requeued, Queued)
                | (Failed, Requeued)
                // forced failure: aborts and exhausted budgets reach
                // `failed` from every non-terminal status
                | (Backlog, Failed)
                | (Queued, Failed)
                | (Assigned, Failed)
                | (InProgress, Failed)
                | (Verifying, Failed)
                | (Requeued, Failed)
        )
    }

    /// Terminal statuses never leave via the dispatcher.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BeadStatus::Completed | BeadStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BeadStatus::Backlog => "backlog",
            BeadStatus::Queued => "queued",
            BeadStatus::Assigned => "assigned",
            BeadStatus::InProgress => "in_progress",
            BeadStatus::Verifying => "verifying",
            BeadStatus::Requeued => "requeued",
            BeadStatus::Completed => "completed",
            BeadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "backlog" => Ok(BeadStatus::Backlog),
            "queued" => Ok(BeadStatus::Queued),
            "assigned" => Ok(BeadStatus::Assigned),
            "in_progress" => Ok(BeadStatus::InProgress),
            "verifying" => Ok(BeadStatus::Verifying),
            "requeued" => Ok(BeadStatus::Requeued),
            "completed" => Ok(BeadStatus::Completed),
            "failed" => Ok(BeadStatus::Failed),
            other => Err(Error::validation(format!("unknown bead status: {other}"))),
        }
    }
}

/// Scheduling priority. Critical beads bypass load-adjusted scoring and
/// take the highest-weight runtime unconditionally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BeadPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl BeadPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeadPriority::Critical => "critical",
            BeadPriority::High => "high",
            BeadPriority::Medium => "medium",
            BeadPriority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(BeadPriority::Critical),
            "high" => Ok(BeadPriority::High),
            "medium" => Ok(BeadPriority::Medium),
            "low" => Ok(BeadPriority::Low),
            other => Err(Error::validation(format!("unknown priority: {other}"))),
        }
    }
}

/// A single file touched by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub kind: FileChangeKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Added,
    Modified,
    Deleted,
}

/// What a runtime produced for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecutionResult {
    pub output: String,
    pub file_changes: Vec<FileChange>,
    /// Checkpoint ref recorded after the attempt, if any
    pub patch_ref: Option<String>,
}

/// Outcome of the rig's verification policy for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VerificationReport {
    pub passed: bool,
    pub errors: Vec<String>,
}

/// Outcome payload, shaped by status: each variant carries only the data
/// valid in that state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BeadOutcome {
    #[default]
    Pending,
    Verifying {
        execution: ExecutionResult,
    },
    /// Last attempt failed but the bead is back in the queue; terminal
    /// failure data lives in `Failed` only.
    Retrying {
        reason: String,
        verification_errors: Vec<String>,
    },
    Completed {
        execution: ExecutionResult,
        verification: VerificationReport,
    },
    Failed {
        reason: String,
        verification_errors: Vec<String>,
    },
}

impl BeadOutcome {
    pub fn execution(&self) -> Option<&ExecutionResult> {
        match self {
            BeadOutcome::Verifying { execution } | BeadOutcome::Completed { execution, .. } => {
                Some(execution)
            }
            _ => None,
        }
    }
}

/// Atomic, attemptable work unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bead {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: BeadStatus,
    pub priority: BeadPriority,
    /// Role a runtime must support to execute this bead
    pub role: String,
    /// Dependency bead ids; all must be `completed` before dispatch
    pub dependencies: Vec<Uuid>,
    pub assigned_polecat: Option<Uuid>,
    pub convoy_id: Option<Uuid>,
    pub outcome: BeadOutcome,
    /// Number of failed attempts so far
    pub attempt: u32,
    pub max_attempts: u32,
    /// Optional beads do not count against overall convoy success
    pub optional: bool,
    /// Requeue backoff gate: not eligible for dispatch before this instant
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bead {
    pub fn builder() -> BeadBuilder {
        BeadBuilder::new()
    }

    /// Whether the attempt budget still permits a requeue.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Whether the backoff gate has passed as of `now`.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map(|t| t <= now).unwrap_or(true)
    }

    fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::validation("Bead title cannot be empty"));
        }
        if self.role.trim().is_empty() {
            return Err(Error::validation("Bead role cannot be empty"));
        }
        if self.max_attempts == 0 {
            return Err(Error::validation("Bead max_attempts must be at least 1"));
        }
        if self.dependencies.contains(&self.id) {
            return Err(Error::validation("Bead cannot depend on itself"));
        }
        Ok(())
    }
}

/// Builder for constructing beads with validation.
#[derive(Debug, Clone)]
pub struct BeadBuilder {
    id: Uuid,
    title: Option<String>,
    description: String,
    priority: BeadPriority,
    role: Option<String>,
    dependencies: Vec<Uuid>,
    convoy_id: Option<Uuid>,
    max_attempts: u32,
    optional: bool,
}

impl Default for BeadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BeadBuilder {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            title: None,
            description: String::new(),
            priority: BeadPriority::Medium,
            role: None,
            dependencies: Vec::new(),
            convoy_id: None,
            max_attempts: 3,
            optional: false,
        }
    }

    /// Fix the bead id up front so dependency edges can reference it
    /// before the bead is built.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn title<S: Into<String>>(mut self, title: S) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    pub fn priority(mut self, priority: BeadPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn role<S: Into<String>>(mut self, role: S) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn dependency(mut self, dep: Uuid) -> Self {
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
        self
    }

    pub fn convoy(mut self, convoy_id: Uuid) -> Self {
        self.convoy_id = Some(convoy_id);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn build(self) -> Result<Bead> {
        let now = Utc::now();
        let bead = Bead {
            id: self.id,
            title: self
                .title
                .ok_or_else(|| Error::validation("Bead title is required"))?,
            description: self.description,
            status: BeadStatus::Backlog,
            priority: self.priority,
            role: self
                .role
                .ok_or_else(|| Error::validation("Bead role is required"))?,
            dependencies: self.dependencies,
            assigned_polecat: None,
            convoy_id: self.convoy_id,
            outcome: BeadOutcome::Pending,
            attempt: 0,
            max_attempts: self.max_attempts,
            optional: self.optional,
            not_before: None,
            created_at: now,
            updated_at: now,
        };
        bead.validate()?;
        Ok(bead)
    }
}
