//! Polecat domain model: a worker identity plus its current session.
//!
//! The identity is persistent and survives restarts; it is destroyed only
//! by explicit retirement. The session is ephemeral and torn down on
//! completion, crash or timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Persistent part of a polecat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolecatIdentity {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub sessions_started: u64,
    pub beads_completed: u64,
    pub beads_failed: u64,
    /// Roles this polecat has completed work for, most recent last
    pub specializations: Vec<String>,
    /// Rolling success ratio in [0, 1]
    pub performance_score: f64,
    pub retired: bool,
}

impl PolecatIdentity {
    pub fn new<S: Into<String>>(name: S) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation("Polecat name cannot be empty"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            created_at: Utc::now(),
            sessions_started: 0,
            beads_completed: 0,
            beads_failed: 0,
            specializations: Vec::new(),
            performance_score: 1.0,
            retired: false,
        })
    }

    pub fn record_session_start(&mut self) {
        self.sessions_started += 1;
    }

    pub fn record_bead_completed(&mut self, role: &str) {
        self.beads_completed += 1;
        if !self.specializations.iter().any(|r| r == role) {
            self.specializations.push(role.to_string());
        }
        self.recompute_score();
    }

    pub fn record_bead_failed(&mut self) {
        self.beads_failed += 1;
        self.recompute_score();
    }

    fn recompute_score(&mut self) {
        let total = self.beads_completed + self.beads_failed;
        if total > 0 {
            self.performance_score = self.beads_completed as f64 / total as f64;
        }
    }

    /// Explicit retirement is the only way an identity goes away.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn is_active(&self) -> bool {
        !self.retired
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Provisioning,
    Running,
    Completed,
    Crashed,
    TimedOut,
}

/// Ephemeral part of a polecat: one session bound to one bead and one hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolecatSession {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub bead_id: Uuid,
    pub hook_id: Uuid,
    pub workspace_path: PathBuf,
    pub branch: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl PolecatSession {
    pub fn new(
        identity_id: Uuid,
        bead_id: Uuid,
        hook_id: Uuid,
        workspace_path: PathBuf,
        branch: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            identity_id,
            bead_id,
            hook_id,
            workspace_path,
            branch,
            status: SessionStatus::Provisioning,
            started_at: now,
            last_heartbeat: now,
        }
    }

    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    /// A session with no heartbeat inside `timeout` is treated as crashed.
    pub fn is_stale(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            SessionStatus::Provisioning | SessionStatus::Running
        ) && now.signed_duration_since(self.last_heartbeat) > timeout
    }
}
