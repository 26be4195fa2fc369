//! Shared test doubles: an in-memory git backend and a scripted worker
//! runtime.

use async_trait::async_trait;
use rigyard::error::{Error, Result};
use rigyard::git::{GitBackend, WorkingCopy};
use rigyard::model::VerificationReport;
use rigyard::runtime::{RuntimeOutcome, RuntimeTask, WorkerRuntime};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeGit {
    pub state: Mutex<FakeGitState>,
}

#[derive(Default)]
pub struct FakeGitState {
    pub branches: HashSet<String>,
    pub worktrees: Vec<WorkingCopy>,
    pub commits: u64,
    pub dirty: bool,
}

#[async_trait]
impl GitBackend for FakeGit {
    async fn create_working_copy(
        &self,
        _repo: &Path,
        worktree_path: &Path,
        branch: &str,
        _base_branch: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.branches.insert(branch.to_string());
        state.worktrees.push(WorkingCopy {
            path: worktree_path.to_path_buf(),
            branch: branch.to_string(),
        });
        Ok(())
    }

    async fn commit_all(&self, _worktree: &Path, _message: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        state.commits += 1;
        Ok(Some(format!("commit-{}", state.commits)))
    }

    async fn reset_hard(&self, _worktree: &Path, commit: &str) -> Result<()> {
        let state = self.state.lock().unwrap();
        let n: u64 = commit
            .strip_prefix("commit-")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if n == 0 || n > state.commits {
            return Err(Error::Internal(format!("unknown commit {commit}")));
        }
        Ok(())
    }

    async fn head(&self, _worktree: &Path) -> Result<String> {
        Ok(format!("commit-{}", self.state.lock().unwrap().commits))
    }

    async fn is_clean(&self, _repo: &Path) -> Result<bool> {
        Ok(!self.state.lock().unwrap().dirty)
    }

    async fn branch_exists(&self, _repo: &Path, branch: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().branches.contains(branch))
    }

    async fn list_working_copies(&self, _repo: &Path) -> Result<Vec<WorkingCopy>> {
        Ok(self.state.lock().unwrap().worktrees.clone())
    }

    async fn remove_working_copy(&self, _repo: &Path, worktree_path: &Path) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .worktrees
            .retain(|wc| wc.path != worktree_path);
        Ok(())
    }

    async fn prune(&self, _repo: &Path) -> Result<()> {
        Ok(())
    }
}

/// Runtime whose invocation outcomes and verification reports pop off
/// scripted queues; empty queues default to success.
#[derive(Default)]
pub struct ScriptedRuntime {
    pub outcomes: Mutex<VecDeque<Result<RuntimeOutcome>>>,
    pub reports: Mutex<VecDeque<VerificationReport>>,
    pub invocations: Mutex<Vec<String>>,
}

impl ScriptedRuntime {
    pub fn push_outcome(&self, outcome: Result<RuntimeOutcome>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn push_report(&self, report: VerificationReport) {
        self.reports.lock().unwrap().push_back(report);
    }

    pub fn success() -> RuntimeOutcome {
        RuntimeOutcome {
            success: true,
            output: "done".into(),
            file_changes: Vec::new(),
            error: None,
        }
    }

    pub fn failure(reason: &str) -> RuntimeOutcome {
        RuntimeOutcome {
            success: false,
            output: String::new(),
            file_changes: Vec::new(),
            error: Some(reason.into()),
        }
    }
}

#[async_trait]
impl WorkerRuntime for ScriptedRuntime {
    async fn invoke(&self, task: &RuntimeTask) -> Result<RuntimeOutcome> {
        self.invocations
            .lock()
            .unwrap()
            .push(task.description.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Self::success()))
    }

    async fn verify(&self, _task: &RuntimeTask) -> Result<VerificationReport> {
        Ok(self
            .reports
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(VerificationReport {
                passed: true,
                errors: Vec::new(),
            }))
    }
}
