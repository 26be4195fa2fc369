//! Convoy domain model: a named, ordered bundle of beads tracked as one unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bead::BeadStatus;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConvoyStatus {
    Planning,
    Active,
    Completed,
    Failed,
}

impl ConvoyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConvoyStatus::Completed | ConvoyStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConvoyStatus::Planning => "planning",
            ConvoyStatus::Active => "active",
            ConvoyStatus::Completed => "completed",
            ConvoyStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "planning" => Ok(ConvoyStatus::Planning),
            "active" => Ok(ConvoyStatus::Active),
            "completed" => Ok(ConvoyStatus::Completed),
            "failed" => Ok(ConvoyStatus::Failed),
            other => Err(Error::validation(format!("unknown convoy status: {other}"))),
        }
    }
}

/// Progress summary recomputed from member bead statuses on demand.
///
/// Invariant: `completed + failed + in_progress + queued == total`.
/// Assigned/in-progress/verifying beads count as in-progress; backlog,
/// queued and requeued beads count as queued.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConvoyProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub queued: usize,
    pub percent_complete: f64,
}

impl ConvoyProgress {
    pub fn from_statuses(statuses: &[BeadStatus]) -> Self {
        let total = statuses.len();
        let mut completed = 0;
        let mut failed = 0;
        let mut in_progress = 0;
        let mut queued = 0;

        for status in statuses {
            match status {
                BeadStatus::Completed => completed += 1,
                BeadStatus::Failed => failed += 1,
                BeadStatus::Assigned | BeadStatus::InProgress | BeadStatus::Verifying => {
                    in_progress += 1
                }
                BeadStatus::Backlog | BeadStatus::Queued | BeadStatus::Requeued => queued += 1,
            }
        }

        let percent_complete = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64) * 100.0
        };

        Self {
            total,
            completed,
            failed,
            in_progress,
            queued,
            percent_complete,
        }
    }

    /// Convoy status derived from member statuses.
    pub fn derive_status(statuses: &[BeadStatus]) -> ConvoyStatus {
        if statuses.is_empty() || statuses.iter().all(|s| *s == BeadStatus::Backlog) {
            return ConvoyStatus::Planning;
        }
        if statuses.iter().all(|s| *s == BeadStatus::Completed) {
            return ConvoyStatus::Completed;
        }
        if statuses.iter().any(|s| !s.is_terminal()) {
            return ConvoyStatus::Active;
        }
        ConvoyStatus::Failed
    }
}

/// A bundled, ordered set of beads created by the planner or a human.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Convoy {
    pub id: Uuid,
    pub name: String,
    pub bead_ids: Vec<Uuid>,
    pub status: ConvoyStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Convoy {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        name: S1,
        created_by: S2,
        bead_ids: Vec<Uuid>,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation("Convoy name cannot be empty"));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            bead_ids,
            status: ConvoyStatus::Planning,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn contains(&self, bead_id: Uuid) -> bool {
        self.bead_ids.contains(&bead_id)
    }
}
