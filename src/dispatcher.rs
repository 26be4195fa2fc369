//! Fleet dispatcher: drives beads from the queue through execution and
//! verification to a terminal status.
//!
//! The dispatcher is the single writer for polecat identities and session
//! bookkeeping. A tick is one scheduling pass: reap stale sessions, match
//! the ready set against the registry, claim beads, provision or resume
//! hooks, run the matched beads concurrently, then apply every outcome
//! sequentially. Runtime invocations are the only thing that runs in
//! parallel; all ledger and registry writes happen on the tick task.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hooks::{HookState, HookStore};
use crate::ledger::WorkLedger;
use crate::model::{
    Bead, BeadOutcome, BeadStatus, ExecutionResult, PolecatIdentity, PolecatSession, Rig,
    SessionStatus,
};
use crate::registry::CapabilityRegistry;
use crate::runtime::{RuntimeOutcome, RuntimeTask, WorkerRuntime};

/// What one scheduling pass did, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    pub reaped: usize,
}

/// Session bookkeeping held for the duration of one execution.
struct ActiveSession {
    session: PolecatSession,
    runtime_key: String,
}

/// Everything needed to apply an execution outcome after the join.
struct DispatchContext {
    session_id: Uuid,
    runtime_key: String,
    hook_id: Uuid,
    identity_id: Uuid,
    role: String,
}

pub struct FleetDispatcher {
    ledger: Arc<dyn WorkLedger>,
    registry: Arc<CapabilityRegistry>,
    hooks: Arc<HookStore>,
    runtime: Arc<dyn WorkerRuntime>,
    config: Config,
    identities: Mutex<HashMap<Uuid, PolecatIdentity>>,
    sessions: Mutex<HashMap<Uuid, ActiveSession>>,
}

impl FleetDispatcher {
    pub fn new(
        ledger: Arc<dyn WorkLedger>,
        registry: Arc<CapabilityRegistry>,
        hooks: Arc<HookStore>,
        runtime: Arc<dyn WorkerRuntime>,
        config: Config,
    ) -> Self {
        Self {
            ledger,
            registry,
            hooks,
            runtime,
            config,
            identities: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn identities(&self) -> Vec<PolecatIdentity> {
        self.identities.lock().await.values().cloned().collect()
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Move every backlog bead of the convoy into the queue and mark the
    /// convoy active.
    pub async fn enqueue_convoy(&self, convoy_id: Uuid) -> Result<()> {
        let beads = self.ledger.list_convoy_beads(convoy_id).await?;
        for bead in beads {
            if bead.status == BeadStatus::Backlog {
                self.ledger
                    .transition_bead(bead.id, BeadStatus::Queued)
                    .await?;
            }
        }
        self.ledger.refresh_convoy_status(convoy_id).await?;
        Ok(())
    }

    /// Drive the convoy until its derived status is terminal.
    pub async fn run_convoy(&self, convoy_id: Uuid, rig: &Rig) -> Result<()> {
        self.enqueue_convoy(convoy_id).await?;
        loop {
            self.tick(convoy_id, rig).await?;
            let status = self.ledger.refresh_convoy_status(convoy_id).await?;
            if status.is_terminal() {
                info!(convoy_id = %convoy_id, status = status.as_str(), "Convoy finished");
                return Ok(());
            }
            tokio::time::sleep(self.config.tick_interval()).await;
        }
    }

    /// One scheduling pass at the current instant.
    pub async fn tick(&self, convoy_id: Uuid, rig: &Rig) -> Result<TickSummary> {
        self.tick_at(convoy_id, rig, Utc::now()).await
    }

    /// One scheduling pass with an injected clock.
    pub async fn tick_at(
        &self,
        convoy_id: Uuid,
        rig: &Rig,
        now: DateTime<Utc>,
    ) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        summary.reaped = self.reap_stale_sessions(now).await?;

        let ready = self.ledger.ready_beads(convoy_id, now).await?;
        if ready.is_empty() {
            return Ok(summary);
        }
        let assignments = self.registry.match_beads(&ready, &[]).await;

        let mut executions: JoinSet<(Uuid, Result<RuntimeOutcome>)> = JoinSet::new();
        let mut contexts: HashMap<Uuid, DispatchContext> = HashMap::new();

        for bead in &ready {
            let Some(key) = assignments.get(&bead.id) else {
                continue;
            };
            // Capacity promised during matching can be gone by now; losing
            // the race leaves the bead queued for the next pass
            if !self.registry.acquire_session(key).await? {
                debug!(bead_id = %bead.id, key = %key, "Lost capacity race, bead stays queued");
                continue;
            }
            if !self.ledger.claim_bead(bead.id).await? {
                self.registry.release_session(key).await?;
                continue;
            }

            match self.start_execution(bead, rig, key).await {
                Ok((context, hook)) => {
                    let runtime = Arc::clone(&self.runtime);
                    let timeout = self.config.invoke_timeout();
                    let task = RuntimeTask {
                        bead_id: bead.id,
                        description: bead.description.clone(),
                        role: bead.role.clone(),
                        workspace_path: hook.path.clone(),
                        verification_command: rig.settings.verification_command.clone(),
                    };
                    contexts.insert(bead.id, context);
                    summary.dispatched += 1;
                    executions.spawn(async move {
                        let result =
                            match tokio::time::timeout(timeout, runtime.invoke(&task)).await {
                                Ok(result) => result,
                                Err(_) => Err(Error::runtime_execution(format!(
                                    "worker invocation exceeded {}ms",
                                    timeout.as_millis()
                                ))),
                            };
                        (task.bead_id, result)
                    });
                }
                Err(e) => {
                    // Workspace-layer failure: return capacity, then put
                    // the miss through attempt accounting so a rig that
                    // can never provision still fails the bead
                    warn!(bead_id = %bead.id, error = %e, "Could not start execution");
                    self.registry.release_session(key).await?;
                    match self
                        .record_failure(
                            bead.id,
                            format!("could not start execution: {e}"),
                            Vec::new(),
                            now,
                        )
                        .await?
                    {
                        Settlement::Requeued => summary.requeued += 1,
                        Settlement::Failed => summary.failed += 1,
                        Settlement::Completed => {}
                    }
                }
            }
        }

        while let Some(joined) = executions.join_next().await {
            let (bead_id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Execution task panicked");
                    continue;
                }
            };
            let context = contexts
                .remove(&bead_id)
                .ok_or_else(|| Error::Internal(format!("no context for bead {bead_id}")))?;
            let settled = match self.settle(bead_id, result, &context, rig, now).await {
                Ok(settlement) => Ok(settlement),
                Err(e) => {
                    // Settlement infrastructure broke mid-flight; the hook
                    // is in an unknown state, so park it errored and count
                    // the attempt
                    error!(bead_id = %bead_id, error = %e, "Settlement failed");
                    if let Err(mark) = self.hooks.mark_errored(context.hook_id).await {
                        warn!(hook_id = %context.hook_id, error = %mark, "Could not mark hook errored");
                    }
                    self.fail_attempt(bead_id, &context, e.to_string(), Vec::new(), now)
                        .await
                }
            };
            // Capacity comes back before any error propagates
            self.finish_session(&context).await?;
            match settled? {
                Settlement::Completed => summary.completed += 1,
                Settlement::Requeued => summary.requeued += 1,
                Settlement::Failed => summary.failed += 1,
            }
        }

        self.ledger.refresh_convoy_status(convoy_id).await?;
        Ok(summary)
    }

    /// Abort the convoy: every non-terminal bead is failed so no later
    /// tick can dispatch it, and hooks are suspended but never destroyed.
    pub async fn abort_convoy(&self, convoy_id: Uuid, reason: &str) -> Result<()> {
        info!(convoy_id = %convoy_id, reason = %reason, "Aborting convoy");
        let beads = self.ledger.list_convoy_beads(convoy_id).await?;
        for bead in beads {
            if bead.status.is_terminal() {
                continue;
            }
            self.ledger
                .transition_bead(bead.id, BeadStatus::Failed)
                .await?;
            self.ledger
                .store_outcome(
                    bead.id,
                    BeadOutcome::Failed {
                        reason: format!("convoy aborted: {reason}"),
                        verification_errors: Vec::new(),
                    },
                )
                .await?;
        }

        let drained: Vec<ActiveSession> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<Uuid> = sessions.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id))
                .collect()
        };
        for active in drained {
            self.registry.release_session(&active.runtime_key).await?;
            if let Ok(hook) = self.hooks.get(active.session.hook_id).await {
                if hook.state == HookState::Active {
                    self.hooks.suspend(hook.id).await?;
                }
            }
        }

        self.ledger
            .set_convoy_status(convoy_id, crate::model::ConvoyStatus::Failed)
            .await?;
        Ok(())
    }

    /// Crash recovery at startup: beads stranded mid-flight with no live
    /// session are forced back into the queue. Hooks are left alone; their
    /// working copies carry the partial work.
    pub async fn recover(&self, convoy_id: Uuid) -> Result<usize> {
        let beads = self.ledger.list_convoy_beads(convoy_id).await?;
        let sessions = self.sessions.lock().await;
        let live: Vec<Uuid> = sessions.values().map(|a| a.session.bead_id).collect();
        drop(sessions);

        let mut recovered = 0;
        for bead in beads {
            if live.contains(&bead.id) {
                continue;
            }
            match bead.status {
                BeadStatus::Assigned | BeadStatus::InProgress => {
                    self.ledger
                        .transition_bead(bead.id, BeadStatus::Queued)
                        .await?;
                    self.ledger.assign_polecat(bead.id, None).await?;
                    recovered += 1;
                }
                BeadStatus::Verifying => {
                    self.ledger
                        .transition_bead(bead.id, BeadStatus::Requeued)
                        .await?;
                    self.ledger
                        .transition_bead(bead.id, BeadStatus::Queued)
                        .await?;
                    self.ledger.assign_polecat(bead.id, None).await?;
                    recovered += 1;
                }
                _ => {}
            }
        }
        if recovered > 0 {
            info!(convoy_id = %convoy_id, count = recovered, "Recovered stranded beads");
        }
        Ok(recovered)
    }

    /// Record a heartbeat for a running session.
    pub async fn heartbeat(&self, session_id: Uuid) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let active = sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::not_found("PolecatSession", session_id.to_string()))?;
        active.session.heartbeat();
        Ok(())
    }

    /// Sessions with no heartbeat inside the timeout are treated as
    /// crashed: the bead goes back to the queue without burning an
    /// attempt, capacity is returned, the hook survives suspended.
    async fn reap_stale_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = self.config.heartbeat_timeout();
        let stale: Vec<Uuid> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|a| a.session.is_stale(timeout, now))
                .map(|a| a.session.id)
                .collect()
        };

        let mut reaped = 0;
        for session_id in stale {
            let Some(mut active) = self.sessions.lock().await.remove(&session_id) else {
                continue;
            };
            active.session.status = SessionStatus::Crashed;
            warn!(
                session_id = %session_id,
                bead_id = %active.session.bead_id,
                "Reaping crashed session"
            );

            let bead = self.ledger.get_bead(active.session.bead_id).await?;
            if matches!(bead.status, BeadStatus::Assigned | BeadStatus::InProgress) {
                self.ledger
                    .transition_bead(bead.id, BeadStatus::Queued)
                    .await?;
                self.ledger.assign_polecat(bead.id, None).await?;
            }
            self.registry.release_session(&active.runtime_key).await?;
            if let Ok(hook) = self.hooks.get(active.session.hook_id).await {
                if hook.state == HookState::Active {
                    self.hooks.suspend(hook.id).await?;
                }
            }
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Provision everything one execution needs: a polecat identity, a
    /// hook (reused when the pair already has one), and a session.
    async fn start_execution(
        &self,
        bead: &Bead,
        rig: &Rig,
        runtime_key: &str,
    ) -> Result<(DispatchContext, crate::hooks::Hook)> {
        let identity_id = self.pick_identity().await;

        let hook = match self.hooks.find_for(rig.id, identity_id).await {
            Some(existing) => {
                if matches!(existing.state, HookState::Suspended | HookState::Errored) {
                    if let Err(e) = self.hooks.resume(existing.id).await {
                        self.hooks.mark_errored(existing.id).await?;
                        return Err(e);
                    }
                }
                existing
            }
            None => self.provision_hook(rig, identity_id).await?,
        };

        self.ledger.assign_polecat(bead.id, Some(identity_id)).await?;
        self.ledger
            .transition_bead(bead.id, BeadStatus::InProgress)
            .await?;

        let mut session = PolecatSession::new(
            identity_id,
            bead.id,
            hook.id,
            hook.path.clone(),
            hook.branch.clone(),
        );
        session.status = SessionStatus::Running;
        let session_id = session.id;

        {
            let mut identities = self.identities.lock().await;
            if let Some(identity) = identities.get_mut(&identity_id) {
                identity.record_session_start();
            }
        }
        self.sessions.lock().await.insert(
            session_id,
            ActiveSession {
                session,
                runtime_key: runtime_key.to_string(),
            },
        );

        debug!(
            bead_id = %bead.id,
            session_id = %session_id,
            hook_id = %hook.id,
            runtime = %runtime_key,
            "Dispatched bead"
        );
        let context = DispatchContext {
            session_id,
            runtime_key: runtime_key.to_string(),
            hook_id: hook.id,
            identity_id,
            role: bead.role.clone(),
        };
        Ok((context, hook))
    }

    /// Hook creation with bounded local retries; workspace-layer errors
    /// are transient more often than not.
    async fn provision_hook(&self, rig: &Rig, identity_id: Uuid) -> Result<crate::hooks::Hook> {
        let mut last_err = None;
        for attempt in 0..=self.config.workspace_retry_limit {
            match self
                .hooks
                .create(rig, identity_id, &rig.default_branch)
                .await
            {
                Ok(hook) => return Ok(hook),
                Err(e) => {
                    warn!(rig = %rig.name, attempt, error = %e, "Hook provisioning failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::provisioning(&rig.name, "hook provisioning failed with no error")
        }))
    }

    /// Reuse an idle active identity, or mint a new one.
    async fn pick_identity(&self) -> Uuid {
        let busy: Vec<Uuid> = {
            let sessions = self.sessions.lock().await;
            sessions.values().map(|a| a.session.identity_id).collect()
        };
        let mut identities = self.identities.lock().await;
        if let Some(identity) = identities
            .values()
            .find(|i| i.is_active() && !busy.contains(&i.id))
        {
            return identity.id;
        }
        let name = format!("polecat-{:02}", identities.len() + 1);
        // Name is generated, validation cannot fail
        let identity = PolecatIdentity::new(name).unwrap_or_else(|_| unreachable!());
        let id = identity.id;
        identities.insert(id, identity);
        id
    }

    /// Apply one execution outcome: verification, checkpointing, retry
    /// accounting and identity bookkeeping.
    async fn settle(
        &self,
        bead_id: Uuid,
        result: Result<RuntimeOutcome>,
        context: &DispatchContext,
        rig: &Rig,
        now: DateTime<Utc>,
    ) -> Result<Settlement> {
        let outcome = match result {
            Ok(outcome) if outcome.success => outcome,
            Ok(outcome) => {
                let reason = outcome
                    .error
                    .unwrap_or_else(|| "worker reported failure".to_string());
                return self
                    .fail_attempt(bead_id, context, reason, Vec::new(), now)
                    .await;
            }
            Err(e) => {
                return self
                    .fail_attempt(bead_id, context, e.to_string(), Vec::new(), now)
                    .await;
            }
        };

        let hook = self.hooks.get(context.hook_id).await?;
        let bead = self.ledger.get_bead(bead_id).await?;
        self.hooks
            .record_task(
                context.hook_id,
                &bead.description,
                outcome.file_changes.iter().map(|f| f.path.clone()).collect(),
            )
            .await?;

        let execution = ExecutionResult {
            output: outcome.output,
            file_changes: outcome.file_changes,
            patch_ref: None,
        };
        self.ledger
            .transition_bead(bead_id, BeadStatus::Verifying)
            .await?;
        self.ledger
            .store_outcome(
                bead_id,
                BeadOutcome::Verifying {
                    execution: execution.clone(),
                },
            )
            .await?;

        let task = RuntimeTask {
            bead_id,
            description: bead.description.clone(),
            role: context.role.clone(),
            workspace_path: hook.path.clone(),
            verification_command: rig.settings.verification_command.clone(),
        };
        // A verifier that cannot run is an attempt failure, not a tick
        // failure; the session must come back either way
        let report = match self.runtime.verify(&task).await {
            Ok(report) => report,
            Err(e) => {
                warn!(bead_id = %bead_id, error = %e, "Verifier failed to run");
                return self
                    .fail_attempt(
                        bead_id,
                        context,
                        format!("verifier failed to run: {e}"),
                        Vec::new(),
                        now,
                    )
                    .await;
            }
        };

        if report.passed {
            let checkpoint = self
                .hooks
                .checkpoint(context.hook_id, &format!("bead {}: {}", bead_id, bead.title))
                .await?;
            let execution = ExecutionResult {
                patch_ref: Some(checkpoint.commit),
                ..execution
            };
            self.ledger
                .transition_bead(bead_id, BeadStatus::Completed)
                .await?;
            self.ledger
                .store_outcome(
                    bead_id,
                    BeadOutcome::Completed {
                        execution,
                        verification: report,
                    },
                )
                .await?;
            self.hooks.archive(context.hook_id).await?;

            let mut identities = self.identities.lock().await;
            if let Some(identity) = identities.get_mut(&context.identity_id) {
                identity.record_bead_completed(&context.role);
            }
            info!(bead_id = %bead_id, "Bead completed");
            return Ok(Settlement::Completed);
        }

        // Failed verification: record the errors on the hook, restore the
        // working copy to the last good checkpoint, then do attempt
        // accounting
        self.hooks
            .record_verification_errors(context.hook_id, &report.errors)
            .await?;
        if let Some(last) = self.hooks.get(context.hook_id).await?.last_checkpoint() {
            let commit = last.commit.clone();
            if let Err(e) = self.hooks.rollback(context.hook_id, &commit).await {
                warn!(hook_id = %context.hook_id, error = %e, "Rollback after failed verification");
            }
        }
        self.fail_attempt(
            bead_id,
            context,
            "verification failed".to_string(),
            report.errors,
            now,
        )
        .await
    }

    /// Attempt accounting for a failed execution or verification: debit
    /// the identity, record the failure, suspend the hook with the
    /// partial work.
    async fn fail_attempt(
        &self,
        bead_id: Uuid,
        context: &DispatchContext,
        reason: String,
        verification_errors: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Settlement> {
        {
            let mut identities = self.identities.lock().await;
            if let Some(identity) = identities.get_mut(&context.identity_id) {
                identity.record_bead_failed();
            }
        }
        let settlement = self
            .record_failure(bead_id, reason, verification_errors, now)
            .await?;
        if let Ok(hook) = self.hooks.get(context.hook_id).await {
            if hook.state == HookState::Active {
                self.hooks.suspend(context.hook_id).await?;
            }
        }
        Ok(settlement)
    }

    /// Retry-or-fail core shared by runtime failures and dispatch
    /// failures that never produced a session: requeue behind a backoff
    /// gate while the budget lasts, fail terminally once it is spent.
    async fn record_failure(
        &self,
        bead_id: Uuid,
        reason: String,
        verification_errors: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Settlement> {
        let bead = self.ledger.get_bead(bead_id).await?;
        if bead.can_retry() {
            let attempt = bead.attempt + 1;
            let delay = self.config.requeue_delay(attempt);
            let gate = now
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(0));
            self.ledger
                .store_outcome(
                    bead_id,
                    BeadOutcome::Retrying {
                        reason: reason.clone(),
                        verification_errors,
                    },
                )
                .await?;
            self.ledger
                .transition_bead(bead_id, BeadStatus::Requeued)
                .await?;
            self.ledger
                .set_retry_state(bead_id, attempt, Some(gate))
                .await?;
            self.ledger
                .transition_bead(bead_id, BeadStatus::Queued)
                .await?;
            self.ledger.assign_polecat(bead_id, None).await?;
            info!(
                bead_id = %bead_id,
                attempt,
                not_before = %gate,
                reason = %reason,
                "Bead requeued"
            );
            Ok(Settlement::Requeued)
        } else {
            self.ledger
                .store_outcome(
                    bead_id,
                    BeadOutcome::Failed {
                        reason: reason.clone(),
                        verification_errors,
                    },
                )
                .await?;
            self.ledger
                .transition_bead(bead_id, BeadStatus::Failed)
                .await?;
            warn!(bead_id = %bead_id, reason = %reason, "Bead failed terminally");
            Ok(Settlement::Failed)
        }
    }

    /// Tear down session bookkeeping and return capacity.
    async fn finish_session(&self, context: &DispatchContext) -> Result<()> {
        if let Some(mut active) = self.sessions.lock().await.remove(&context.session_id) {
            active.session.status = SessionStatus::Completed;
        }
        self.registry.release_session(&context.runtime_key).await
    }
}

enum Settlement {
    Completed,
    Requeued,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{GitBackend, WorkingCopy};
    use crate::ledger::InMemoryLedger;
    use crate::model::{BeadPriority, Convoy, VerificationReport};
    use crate::registry::RuntimeRegistration;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    /// Git fake shared with the hook store tests in spirit: enough state
    /// to provision, checkpoint and list working copies.
    #[derive(Default)]
    struct FakeGit {
        commits: StdMutex<u64>,
        dirty: StdMutex<bool>,
    }

    impl FakeGit {
        fn set_dirty(&self, dirty: bool) {
            *self.dirty.lock().unwrap() = dirty;
        }
    }

    #[async_trait]
    impl GitBackend for FakeGit {
        async fn create_working_copy(
            &self,
            _repo: &Path,
            _worktree_path: &Path,
            _branch: &str,
            _base_branch: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn commit_all(&self, _worktree: &Path, _message: &str) -> Result<Option<String>> {
            let mut commits = self.commits.lock().unwrap();
            *commits += 1;
            Ok(Some(format!("commit-{commits}")))
        }

        async fn reset_hard(&self, _worktree: &Path, _commit: &str) -> Result<()> {
            Ok(())
        }

        async fn head(&self, _worktree: &Path) -> Result<String> {
            Ok(format!("commit-{}", self.commits.lock().unwrap()))
        }

        async fn is_clean(&self, _repo: &Path) -> Result<bool> {
            Ok(!*self.dirty.lock().unwrap())
        }

        async fn branch_exists(&self, _repo: &Path, _branch: &str) -> Result<bool> {
            Ok(true)
        }

        async fn list_working_copies(&self, _repo: &Path) -> Result<Vec<WorkingCopy>> {
            Ok(Vec::new())
        }

        async fn remove_working_copy(&self, _repo: &Path, _worktree_path: &Path) -> Result<()> {
            Ok(())
        }

        async fn prune(&self, _repo: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Scripted runtime: invocation outcomes pop off a queue, and
    /// verification results off another. Empty queues mean success.
    #[derive(Default)]
    struct FakeRuntime {
        outcomes: StdMutex<VecDeque<Result<RuntimeOutcome>>>,
        reports: StdMutex<VecDeque<Result<VerificationReport>>>,
        hang_invocations: StdMutex<u32>,
    }

    impl FakeRuntime {
        fn push_outcome(&self, outcome: Result<RuntimeOutcome>) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        fn push_report(&self, report: VerificationReport) {
            self.reports.lock().unwrap().push_back(Ok(report));
        }

        fn push_verify_error(&self, reason: &str) {
            self.reports
                .lock()
                .unwrap()
                .push_back(Err(Error::runtime_execution(reason)));
        }

        /// The next invocation never returns.
        fn hang_next(&self) {
            *self.hang_invocations.lock().unwrap() += 1;
        }

        fn success() -> RuntimeOutcome {
            RuntimeOutcome {
                success: true,
                output: "ok".into(),
                file_changes: Vec::new(),
                error: None,
            }
        }

        fn failure(reason: &str) -> RuntimeOutcome {
            RuntimeOutcome {
                success: false,
                output: String::new(),
                file_changes: Vec::new(),
                error: Some(reason.into()),
            }
        }
    }

    #[async_trait]
    impl WorkerRuntime for FakeRuntime {
        async fn invoke(&self, _task: &RuntimeTask) -> Result<RuntimeOutcome> {
            let hang = {
                let mut hangs = self.hang_invocations.lock().unwrap();
                if *hangs > 0 {
                    *hangs -= 1;
                    true
                } else {
                    false
                }
            };
            if hang {
                std::future::pending::<()>().await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Self::success()))
        }

        async fn verify(&self, _task: &RuntimeTask) -> Result<VerificationReport> {
            self.reports
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(VerificationReport {
                        passed: true,
                        errors: Vec::new(),
                    })
                })
        }
    }

    struct Harness {
        dispatcher: FleetDispatcher,
        ledger: Arc<InMemoryLedger>,
        registry: Arc<CapabilityRegistry>,
        runtime: Arc<FakeRuntime>,
        hooks: Arc<HookStore>,
        git: Arc<FakeGit>,
        rig: Rig,
        convoy: Convoy,
    }

    async fn harness(max_concurrency: u32) -> Harness {
        harness_with_config(max_concurrency, Config::default()).await
    }

    async fn harness_with_config(max_concurrency: u32, config: Config) -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(CapabilityRegistry::new());
        registry
            .register(
                RuntimeRegistration::new(
                    "default",
                    "default",
                    vec!["backend".into()],
                    max_concurrency,
                )
                .unwrap(),
            )
            .await
            .unwrap();
        let git = Arc::new(FakeGit::default());
        let hooks = Arc::new(HookStore::new(git.clone()));
        let runtime = Arc::new(FakeRuntime::default());
        let rig = Rig::new(
            "api",
            "https://example.com/api.git",
            "/srv/repos/api".into(),
            "main",
        )
        .unwrap();
        let convoy = Convoy::new("work", "test", vec![]).unwrap();
        ledger.create_convoy(convoy.clone()).await.unwrap();

        let dispatcher = FleetDispatcher::new(
            ledger.clone() as Arc<dyn WorkLedger>,
            registry.clone(),
            hooks.clone(),
            runtime.clone() as Arc<dyn WorkerRuntime>,
            config,
        );
        Harness {
            dispatcher,
            ledger,
            registry,
            runtime,
            hooks,
            git,
            rig,
            convoy,
        }
    }

    async fn add_bead(h: &Harness, title: &str, max_attempts: u32) -> Bead {
        let bead = Bead::builder()
            .title(title)
            .role("backend")
            .convoy(h.convoy.id)
            .max_attempts(max_attempts)
            .build()
            .unwrap();
        h.ledger.create_bead(bead.clone()).await.unwrap();
        h.ledger
            .transition_bead(bead.id, BeadStatus::Queued)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tick_completes_successful_bead() {
        let h = harness(2).await;
        let bead = add_bead(&h, "add endpoint", 3).await;

        let summary = h.dispatcher.tick(h.convoy.id, &h.rig).await.unwrap();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.completed, 1);

        let bead = h.ledger.get_bead(bead.id).await.unwrap();
        assert_eq!(bead.status, BeadStatus::Completed);
        assert!(matches!(bead.outcome, BeadOutcome::Completed { .. }));
        // Checkpoint ref recorded on the completed outcome
        assert!(bead.outcome.execution().unwrap().patch_ref.is_some());

        // Capacity returned, session gone, identity credited
        assert_eq!(h.registry.get("default").await.unwrap().active_sessions, 0);
        assert_eq!(h.dispatcher.active_session_count().await, 0);
        let identities = h.dispatcher.identities().await;
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].beads_completed, 1);
    }

    #[tokio::test]
    async fn test_capacity_serializes_dispatch() {
        let h = harness(1).await;
        let a = add_bead(&h, "first", 3).await;
        let b = add_bead(&h, "second", 3).await;

        let summary = h.dispatcher.tick(h.convoy.id, &h.rig).await.unwrap();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.completed, 1);

        let summary = h.dispatcher.tick(h.convoy.id, &h.rig).await.unwrap();
        assert_eq!(summary.dispatched, 1);

        assert_eq!(
            h.ledger.get_bead(a.id).await.unwrap().status,
            BeadStatus::Completed
        );
        assert_eq!(
            h.ledger.get_bead(b.id).await.unwrap().status,
            BeadStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_failure_requeues_with_backoff_then_terminal() {
        let h = harness(2).await;
        let bead = add_bead(&h, "flaky", 2).await;
        h.runtime.push_outcome(Ok(FakeRuntime::failure("boom")));
        h.runtime.push_outcome(Ok(FakeRuntime::failure("boom")));
        h.runtime.push_outcome(Ok(FakeRuntime::failure("boom")));

        let t0 = Utc::now();
        let summary = h.dispatcher.tick_at(h.convoy.id, &h.rig, t0).await.unwrap();
        assert_eq!(summary.requeued, 1);
        let after = h.ledger.get_bead(bead.id).await.unwrap();
        assert_eq!(after.status, BeadStatus::Queued);
        assert_eq!(after.attempt, 1);
        assert!(after.not_before.unwrap() > t0);

        // Backoff gate holds: an immediate pass dispatches nothing
        let summary = h.dispatcher.tick_at(h.convoy.id, &h.rig, t0).await.unwrap();
        assert_eq!(summary.dispatched, 0);

        // Past the gate the bead runs, fails and requeues again
        let t1 = after.not_before.unwrap();
        let summary = h.dispatcher.tick_at(h.convoy.id, &h.rig, t1).await.unwrap();
        assert_eq!(summary.requeued, 1);
        let after = h.ledger.get_bead(bead.id).await.unwrap();
        assert_eq!(after.attempt, 2);

        // Attempt budget exhausted: the next failure is terminal
        let t2 = after.not_before.unwrap();
        let summary = h.dispatcher.tick_at(h.convoy.id, &h.rig, t2).await.unwrap();
        assert_eq!(summary.failed, 1);
        let after = h.ledger.get_bead(bead.id).await.unwrap();
        assert_eq!(after.status, BeadStatus::Failed);
        assert!(matches!(after.outcome, BeadOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_failed_verification_rolls_back_and_requeues() {
        let h = harness(2).await;
        let bead = add_bead(&h, "breaks tests", 3).await;
        h.runtime.push_report(VerificationReport {
            passed: false,
            errors: vec!["2 tests failed".into()],
        });

        let summary = h.dispatcher.tick(h.convoy.id, &h.rig).await.unwrap();
        assert_eq!(summary.requeued, 1);

        let after = h.ledger.get_bead(bead.id).await.unwrap();
        assert_eq!(after.status, BeadStatus::Queued);
        // Requeued beads carry a retrying outcome, not a terminal one
        match &after.outcome {
            BeadOutcome::Retrying {
                verification_errors,
                ..
            } => assert_eq!(verification_errors, &vec!["2 tests failed".to_string()]),
            other => panic!("unexpected outcome {other:?}"),
        }

        // The hook survives the failed attempt, suspended with the errors
        let hooks = h.hooks.list_for_rig(h.rig.id).await;
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].state, HookState::Suspended);
        assert_eq!(hooks[0].task.verification_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_recover_requeues_stranded_beads() {
        let h = harness(2).await;
        let stranded = add_bead(&h, "stranded", 3).await;
        h.ledger.claim_bead(stranded.id).await.unwrap();
        h.ledger
            .transition_bead(stranded.id, BeadStatus::InProgress)
            .await
            .unwrap();

        let recovered = h.dispatcher.recover(h.convoy.id).await.unwrap();
        assert_eq!(recovered, 1);
        let after = h.ledger.get_bead(stranded.id).await.unwrap();
        assert_eq!(after.status, BeadStatus::Queued);
        assert_eq!(after.assigned_polecat, None);
        // No attempt burned on crash recovery
        assert_eq!(after.attempt, 0);
    }

    #[tokio::test]
    async fn test_abort_fails_every_nonterminal_bead_and_stops_dispatch() {
        let h = harness(2).await;
        let queued = add_bead(&h, "queued", 3).await;
        let inflight = add_bead(&h, "inflight", 3).await;
        h.ledger.claim_bead(inflight.id).await.unwrap();
        h.ledger
            .transition_bead(inflight.id, BeadStatus::InProgress)
            .await
            .unwrap();

        h.dispatcher
            .abort_convoy(h.convoy.id, "operator request")
            .await
            .unwrap();

        // Queued members fail too; nothing stays dispatch-eligible
        for id in [queued.id, inflight.id] {
            let bead = h.ledger.get_bead(id).await.unwrap();
            assert_eq!(bead.status, BeadStatus::Failed);
            match &bead.outcome {
                BeadOutcome::Failed { reason, .. } => {
                    assert!(reason.contains("operator request"))
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(
            h.ledger.get_convoy(h.convoy.id).await.unwrap().status,
            crate::model::ConvoyStatus::Failed
        );

        // A tick after the abort has nothing to run and cannot flip the
        // derived status back to active
        let summary = h.dispatcher.tick(h.convoy.id, &h.rig).await.unwrap();
        assert_eq!(summary.dispatched, 0);
        assert_eq!(
            h.ledger
                .refresh_convoy_status(h.convoy.id)
                .await
                .unwrap(),
            crate::model::ConvoyStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_identity_reused_across_beads() {
        let h = harness(1).await;
        add_bead(&h, "first", 3).await;
        add_bead(&h, "second", 3).await;

        h.dispatcher.tick(h.convoy.id, &h.rig).await.unwrap();
        h.dispatcher.tick(h.convoy.id, &h.rig).await.unwrap();

        let identities = h.dispatcher.identities().await;
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].sessions_started, 2);
        assert_eq!(identities[0].beads_completed, 2);
    }

    #[tokio::test]
    async fn test_critical_bead_dispatched_before_low() {
        let h = harness(1).await;
        let low = Bead::builder()
            .title("low")
            .role("backend")
            .priority(BeadPriority::Low)
            .convoy(h.convoy.id)
            .build()
            .unwrap();
        h.ledger.create_bead(low.clone()).await.unwrap();
        h.ledger
            .transition_bead(low.id, BeadStatus::Queued)
            .await
            .unwrap();
        let critical = Bead::builder()
            .title("critical")
            .role("backend")
            .priority(BeadPriority::Critical)
            .convoy(h.convoy.id)
            .build()
            .unwrap();
        h.ledger.create_bead(critical.clone()).await.unwrap();
        h.ledger
            .transition_bead(critical.id, BeadStatus::Queued)
            .await
            .unwrap();

        h.dispatcher.tick(h.convoy.id, &h.rig).await.unwrap();
        assert_eq!(
            h.ledger.get_bead(critical.id).await.unwrap().status,
            BeadStatus::Completed
        );
        assert_eq!(
            h.ledger.get_bead(low.id).await.unwrap().status,
            BeadStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_provisioning_failure_burns_attempts_until_terminal() {
        let h = harness(2).await;
        // Every create() refuses the dirty base, so each tick exhausts
        // the bounded workspace retries
        h.git.set_dirty(true);
        let bead = add_bead(&h, "no workspace", 1).await;

        let t0 = Utc::now();
        let summary = h.dispatcher.tick_at(h.convoy.id, &h.rig, t0).await.unwrap();
        assert_eq!(summary.requeued, 1);
        let after = h.ledger.get_bead(bead.id).await.unwrap();
        assert_eq!(after.status, BeadStatus::Queued);
        assert_eq!(after.attempt, 1);
        assert!(after.not_before.unwrap() > t0);
        // Capacity came back with the failed dispatch
        assert_eq!(h.registry.get("default").await.unwrap().active_sessions, 0);

        // Budget spent: the next miss is terminal and the convoy finishes
        let t1 = after.not_before.unwrap();
        let summary = h.dispatcher.tick_at(h.convoy.id, &h.rig, t1).await.unwrap();
        assert_eq!(summary.failed, 1);
        let after = h.ledger.get_bead(bead.id).await.unwrap();
        assert_eq!(after.status, BeadStatus::Failed);
        match &after.outcome {
            BeadOutcome::Failed { reason, .. } => {
                assert!(reason.contains("could not start execution"))
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            h.ledger.get_convoy(h.convoy.id).await.unwrap().status,
            crate::model::ConvoyStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_verifier_error_fails_attempt_and_frees_session() {
        let h = harness(2).await;
        let bead = add_bead(&h, "verifier breaks", 3).await;
        h.runtime.push_verify_error("sh: not found");

        // An erroring verifier is an attempt failure, not a tick error
        let summary = h.dispatcher.tick(h.convoy.id, &h.rig).await.unwrap();
        assert_eq!(summary.requeued, 1);

        let after = h.ledger.get_bead(bead.id).await.unwrap();
        assert_eq!(after.status, BeadStatus::Queued);
        assert_eq!(after.attempt, 1);
        assert!(matches!(after.outcome, BeadOutcome::Retrying { .. }));

        assert_eq!(h.registry.get("default").await.unwrap().active_sessions, 0);
        assert_eq!(h.dispatcher.active_session_count().await, 0);
    }

    #[tokio::test]
    async fn test_hung_invocation_times_out_and_requeues() {
        let config = Config {
            invoke_timeout_ms: 20,
            ..Config::default()
        };
        let h = harness_with_config(2, config).await;
        let bead = add_bead(&h, "hangs forever", 3).await;
        h.runtime.hang_next();

        let summary = h.dispatcher.tick(h.convoy.id, &h.rig).await.unwrap();
        assert_eq!(summary.requeued, 1);

        let after = h.ledger.get_bead(bead.id).await.unwrap();
        assert_eq!(after.status, BeadStatus::Queued);
        assert_eq!(after.attempt, 1);
        match &after.outcome {
            BeadOutcome::Retrying { reason, .. } => assert!(reason.contains("exceeded")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.registry.get("default").await.unwrap().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_reaper_requeues_bead_and_frees_capacity() {
        let h = harness(1).await;
        let bead = add_bead(&h, "orphaned", 3).await;
        h.ledger.claim_bead(bead.id).await.unwrap();
        h.ledger
            .transition_bead(bead.id, BeadStatus::InProgress)
            .await
            .unwrap();

        // A session whose worker died: capacity held, heartbeats stopped
        assert!(h.registry.acquire_session("default").await.unwrap());
        let hook = h.hooks.create(&h.rig, Uuid::new_v4(), "main").await.unwrap();
        let mut session = PolecatSession::new(
            Uuid::new_v4(),
            bead.id,
            hook.id,
            hook.path.clone(),
            hook.branch.clone(),
        );
        session.status = SessionStatus::Running;
        let session_id = session.id;
        h.dispatcher.sessions.lock().await.insert(
            session_id,
            ActiveSession {
                session,
                runtime_key: "default".to_string(),
            },
        );

        let later = Utc::now() + Config::default().heartbeat_timeout() + chrono::Duration::seconds(1);
        let reaped = h.dispatcher.reap_stale_sessions(later).await.unwrap();
        assert_eq!(reaped, 1);

        // Bead back in the queue with no attempt burned, hook preserved
        let after = h.ledger.get_bead(bead.id).await.unwrap();
        assert_eq!(after.status, BeadStatus::Queued);
        assert_eq!(after.attempt, 0);
        assert_eq!(after.assigned_polecat, None);
        assert_eq!(h.hooks.get(hook.id).await.unwrap().state, HookState::Suspended);
        assert_eq!(h.registry.get("default").await.unwrap().active_sessions, 0);
        assert_eq!(h.dispatcher.active_session_count().await, 0);

        // The reaped session is gone; late heartbeats for it are rejected
        assert!(h
            .dispatcher
            .heartbeat(session_id)
            .await
            .unwrap_err()
            .to_string()
            .contains("not found"));
    }
}
