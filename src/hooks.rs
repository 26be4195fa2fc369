//! Workspace store: persistent, checkpointable working directories
//! ("hooks") backed by isolated git worktrees.
//!
//! A hook is bound to one (rig, polecat) pair. It survives suspension and
//! session crashes; it goes away only on explicit teardown or after a
//! successful merge and archive. Records are persisted as JSON next to the
//! manifest so `discover` can rebuild state after a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::git::GitBackend;
use crate::model::Rig;

/// Branch namespace for hook working copies.
pub const BRANCH_PREFIX: &str = "rigyard/";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HookState {
    Active,
    Suspended,
    Archived,
    Errored,
}

/// One recorded checkpoint: a commit the working copy can be reset to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub commit: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Serialized task state carried by a hook across suspensions and crashes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HookTaskState {
    pub task_description: String,
    pub modified_files: Vec<String>,
    pub verification_errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hook {
    pub id: Uuid,
    pub rig_id: Uuid,
    /// Unknown for records reconstructed by `discover`
    pub polecat_id: Option<Uuid>,
    pub path: PathBuf,
    pub branch: String,
    pub state: HookState,
    pub checkpoints: Vec<Checkpoint>,
    pub task: HookTaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Hook {
    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, HookState::Archived)
    }
}

/// Result of a `repair` pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RepairOutcome {
    pub recovered_hooks: usize,
    pub pruned_working_copies: usize,
}

/// Owns hook records and drives the git backend.
pub struct HookStore {
    git: Arc<dyn GitBackend>,
    records: RwLock<HashMap<Uuid, Hook>>,
    /// Directory for persisted hook records; `None` keeps records in memory
    records_dir: Option<PathBuf>,
}

impl HookStore {
    pub fn new(git: Arc<dyn GitBackend>) -> Self {
        Self {
            git,
            records: RwLock::new(HashMap::new()),
            records_dir: None,
        }
    }

    /// Persist hook records as JSON files under `dir`, one per hook.
    pub fn with_records_dir(mut self, dir: PathBuf) -> Self {
        self.records_dir = Some(dir);
        self
    }

    /// Load previously persisted records. Called once at startup.
    pub async fn load_records(&self) -> Result<usize> {
        let Some(dir) = &self.records_dir else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let mut loaded = 0;
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut records = self.records.write().await;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Hook>(&raw) {
                Ok(hook) => {
                    records.insert(hook.id, hook);
                    loaded += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable hook record"),
            }
        }
        info!(count = loaded, "Loaded hook records");
        Ok(loaded)
    }

    async fn persist(&self, hook: &Hook) -> Result<()> {
        let Some(dir) = &self.records_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.json", hook.id));
        let json = serde_json::to_string_pretty(hook)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn unpersist(&self, hook_id: Uuid) -> Result<()> {
        let Some(dir) = &self.records_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{hook_id}.json"));
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    pub async fn get(&self, hook_id: Uuid) -> Result<Hook> {
        self.records
            .read()
            .await
            .get(&hook_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Hook", hook_id.to_string()))
    }

    /// An existing non-terminal hook for this (rig, polecat) pair, if any.
    pub async fn find_for(&self, rig_id: Uuid, polecat_id: Uuid) -> Option<Hook> {
        self.records
            .read()
            .await
            .values()
            .find(|h| {
                h.rig_id == rig_id && h.polecat_id == Some(polecat_id) && !h.is_terminal()
            })
            .cloned()
    }

    pub async fn list_for_rig(&self, rig_id: Uuid) -> Vec<Hook> {
        self.records
            .read()
            .await
            .values()
            .filter(|h| h.rig_id == rig_id)
            .cloned()
            .collect()
    }

    /// Provision an isolated working copy on a fresh branch derived from
    /// `base_branch`.
    pub async fn create(&self, rig: &Rig, polecat_id: Uuid, base_branch: &str) -> Result<Hook> {
        let clean = self
            .git
            .is_clean(&rig.local_path)
            .await
            .map_err(|e| Error::provisioning(&rig.name, e.to_string()))?;
        if !clean {
            return Err(Error::provisioning(
                &rig.name,
                format!("base branch {base_branch} has uncommitted changes"),
            ));
        }

        let id = Uuid::new_v4();
        let short = &id.simple().to_string()[..8];
        let branch = format!("{BRANCH_PREFIX}{short}");
        let path = rig.worktree_root().join(short);

        self.git
            .create_working_copy(&rig.local_path, &path, &branch, base_branch)
            .await
            .map_err(|e| Error::provisioning(&rig.name, e.to_string()))?;

        let now = Utc::now();
        let hook = Hook {
            id,
            rig_id: rig.id,
            polecat_id: Some(polecat_id),
            path,
            branch: branch.clone(),
            state: HookState::Active,
            checkpoints: Vec::new(),
            task: HookTaskState::default(),
            created_at: now,
            updated_at: now,
        };

        self.records.write().await.insert(id, hook.clone());
        self.persist(&hook).await?;
        info!(hook_id = %id, rig = %rig.name, branch = %branch, "Provisioned hook");
        Ok(hook)
    }

    /// Commit all pending changes and record a checkpoint entry. When the
    /// working copy is already clean the checkpoint points at HEAD.
    pub async fn checkpoint(&self, hook_id: Uuid, message: &str) -> Result<Checkpoint> {
        let hook = self.get(hook_id).await?;

        let commit = match self.git.commit_all(&hook.path, message).await {
            Ok(Some(hash)) => hash,
            Ok(None) => self
                .git
                .head(&hook.path)
                .await
                .map_err(|e| Error::checkpoint(hook_id.to_string(), e.to_string()))?,
            Err(e) => return Err(Error::checkpoint(hook_id.to_string(), e.to_string())),
        };

        let checkpoint = Checkpoint {
            commit,
            message: message.to_string(),
            created_at: Utc::now(),
        };

        let updated = self
            .update(hook_id, |h| {
                h.checkpoints.push(checkpoint.clone());
            })
            .await?;
        self.persist(&updated).await?;
        debug!(hook_id = %hook_id, commit = %checkpoint.commit, "Recorded checkpoint");
        Ok(checkpoint)
    }

    /// Reset the working copy to exactly the checkpoint's content,
    /// discarding later changes and later checkpoint entries.
    pub async fn rollback(&self, hook_id: Uuid, commit: &str) -> Result<()> {
        let hook = self.get(hook_id).await?;
        let position = hook
            .checkpoints
            .iter()
            .position(|c| c.commit == commit)
            .ok_or_else(|| {
                Error::rollback(hook_id.to_string(), format!("unknown checkpoint {commit}"))
            })?;

        self.git
            .reset_hard(&hook.path, commit)
            .await
            .map_err(|e| Error::rollback(hook_id.to_string(), e.to_string()))?;

        let updated = self
            .update(hook_id, |h| {
                h.checkpoints.truncate(position + 1);
            })
            .await?;
        self.persist(&updated).await?;
        info!(hook_id = %hook_id, commit = %commit, "Rolled back hook");
        Ok(())
    }

    pub async fn suspend(&self, hook_id: Uuid) -> Result<()> {
        let updated = self
            .transition(hook_id, HookState::Suspended, &[HookState::Active, HookState::Errored])
            .await?;
        self.persist(&updated).await
    }

    pub async fn resume(&self, hook_id: Uuid) -> Result<()> {
        let updated = self
            .transition(hook_id, HookState::Active, &[HookState::Suspended, HookState::Errored])
            .await?;
        self.persist(&updated).await
    }

    /// Terminal: called after a successful merge.
    pub async fn archive(&self, hook_id: Uuid) -> Result<()> {
        let updated = self
            .update(hook_id, |h| {
                h.state = HookState::Archived;
            })
            .await?;
        self.persist(&updated).await
    }

    /// Mark the hook errored after repeated workspace-layer failures.
    pub async fn mark_errored(&self, hook_id: Uuid) -> Result<()> {
        let updated = self
            .update(hook_id, |h| {
                h.state = HookState::Errored;
            })
            .await?;
        self.persist(&updated).await
    }

    /// Remove the working copy and the record unconditionally.
    pub async fn destroy(&self, hook_id: Uuid, rig: &Rig) -> Result<()> {
        let hook = self.get(hook_id).await?;
        self.git
            .remove_working_copy(&rig.local_path, &hook.path)
            .await?;
        self.records.write().await.remove(&hook_id);
        self.unpersist(hook_id).await?;
        info!(hook_id = %hook_id, "Destroyed hook");
        Ok(())
    }

    /// Update the serialized task state carried by the hook.
    pub async fn record_task(
        &self,
        hook_id: Uuid,
        description: &str,
        modified_files: Vec<String>,
    ) -> Result<()> {
        let updated = self
            .update(hook_id, |h| {
                h.task.task_description = description.to_string();
                for f in modified_files {
                    if !h.task.modified_files.contains(&f) {
                        h.task.modified_files.push(f);
                    }
                }
            })
            .await?;
        self.persist(&updated).await
    }

    pub async fn record_verification_errors(
        &self,
        hook_id: Uuid,
        errors: &[String],
    ) -> Result<()> {
        let updated = self
            .update(hook_id, |h| {
                h.task.verification_errors.extend(errors.iter().cloned());
            })
            .await?;
        self.persist(&updated).await
    }

    /// Scan the rig for working copies lacking a matching record, e.g.
    /// after a crash, and reconstruct minimal records. Idempotent.
    pub async fn discover(&self, rig: &Rig) -> Result<Vec<Uuid>> {
        let copies = self.git.list_working_copies(&rig.local_path).await?;
        let mut recovered = Vec::new();

        for wc in copies {
            if !wc.branch.starts_with(BRANCH_PREFIX) {
                continue;
            }
            let known = {
                let records = self.records.read().await;
                records.values().any(|h| h.path == wc.path)
            };
            if known {
                continue;
            }

            let now = Utc::now();
            let hook = Hook {
                id: Uuid::new_v4(),
                rig_id: rig.id,
                polecat_id: None,
                path: wc.path.clone(),
                branch: wc.branch.clone(),
                state: HookState::Suspended,
                checkpoints: Vec::new(),
                task: HookTaskState::default(),
                created_at: now,
                updated_at: now,
            };
            info!(
                hook_id = %hook.id,
                path = %wc.path.display(),
                branch = %wc.branch,
                "Recovered orphaned working copy"
            );
            self.records.write().await.insert(hook.id, hook.clone());
            self.persist(&hook).await?;
            recovered.push(hook.id);
        }

        Ok(recovered)
    }

    /// Prune working copies whose branch no longer exists and re-attach
    /// orphaned-but-valid ones. Idempotent: a second run finds nothing new.
    pub async fn repair(&self, rig: &Rig) -> Result<RepairOutcome> {
        let mut outcome = RepairOutcome::default();

        let copies = self.git.list_working_copies(&rig.local_path).await?;
        for wc in copies {
            if !wc.branch.starts_with(BRANCH_PREFIX) {
                continue;
            }
            if self.git.branch_exists(&rig.local_path, &wc.branch).await? {
                continue;
            }
            warn!(
                path = %wc.path.display(),
                branch = %wc.branch,
                "Pruning working copy with missing branch"
            );
            self.git
                .remove_working_copy(&rig.local_path, &wc.path)
                .await?;
            let stale: Vec<Uuid> = {
                let records = self.records.read().await;
                records
                    .values()
                    .filter(|h| h.path == wc.path)
                    .map(|h| h.id)
                    .collect()
            };
            for id in stale {
                self.records.write().await.remove(&id);
                self.unpersist(id).await?;
            }
            outcome.pruned_working_copies += 1;
        }

        self.git.prune(&rig.local_path).await?;
        outcome.recovered_hooks = self.discover(rig).await?.len();
        Ok(outcome)
    }
}

impl HookStore {
    async fn update<F>(&self, hook_id: Uuid, mutate: F) -> Result<Hook>
    where
        F: FnOnce(&mut Hook),
    {
        let mut records = self.records.write().await;
        let hook = records
            .get_mut(&hook_id)
            .ok_or_else(|| Error::not_found("Hook", hook_id.to_string()))?;
        mutate(hook);
        hook.updated_at = Utc::now();
        Ok(hook.clone())
    }

    async fn transition(
        &self,
        hook_id: Uuid,
        target: HookState,
        allowed_from: &[HookState],
    ) -> Result<Hook> {
        let mut records = self.records.write().await;
        let hook = records
            .get_mut(&hook_id)
            .ok_or_else(|| Error::not_found("Hook", hook_id.to_string()))?;
        if !allowed_from.contains(&hook.state) {
            return Err(Error::validation(format!(
                "hook {hook_id} cannot move from {:?} to {target:?}",
                hook.state
            )));
        }
        hook.state = target;
        hook.updated_at = Utc::now();
        Ok(hook.clone())
    }
}
