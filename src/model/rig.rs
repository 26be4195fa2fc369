//! Rig domain model: a registered repository under management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Per-rig policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RigSettings {
    /// Command run in the hook's working copy during the `verifying` phase.
    /// When unset, verification trusts the runtime's own report.
    pub verification_command: Option<String>,
    /// Overrides the workspace default attempt cap for beads on this rig
    pub max_attempts: Option<u32>,
}

/// A registered repository. Owns its hooks and polecats by reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rig {
    pub id: Uuid,
    pub name: String,
    pub repo_url: String,
    pub local_path: PathBuf,
    pub default_branch: String,
    pub settings: RigSettings,
    pub hook_ids: Vec<Uuid>,
    pub polecat_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Rig {
    pub fn new<S1, S2, S3>(
        name: S1,
        repo_url: S2,
        local_path: PathBuf,
        default_branch: S3,
    ) -> Result<Self>
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        let name = name.into();
        let repo_url = repo_url.into();
        let default_branch = default_branch.into();

        if name.trim().is_empty() {
            return Err(Error::validation("Rig name cannot be empty"));
        }
        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::validation(
                "Rig name can only contain alphanumeric characters, hyphens, and underscores",
            ));
        }
        if repo_url.trim().is_empty() {
            return Err(Error::validation("Rig repo URL cannot be empty"));
        }
        if local_path.as_os_str().is_empty() {
            return Err(Error::validation("Rig local path cannot be empty"));
        }
        if default_branch.trim().is_empty() {
            return Err(Error::validation("Rig default branch cannot be empty"));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            repo_url,
            local_path,
            default_branch,
            settings: RigSettings::default(),
            hook_ids: Vec::new(),
            polecat_ids: Vec::new(),
            created_at: Utc::now(),
        })
    }

    /// Directory where this rig's hook working copies are provisioned,
    /// a sibling of the checkout so worktrees never nest inside it.
    pub fn worktree_root(&self) -> PathBuf {
        let parent = self
            .local_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.local_path.clone());
        parent.join(format!("{}-hooks", self.name))
    }

    pub fn attach_hook(&mut self, hook_id: Uuid) {
        if !self.hook_ids.contains(&hook_id) {
            self.hook_ids.push(hook_id);
        }
    }

    pub fn detach_hook(&mut self, hook_id: Uuid) {
        self.hook_ids.retain(|id| *id != hook_id);
    }

    pub fn attach_polecat(&mut self, polecat_id: Uuid) {
        if !self.polecat_ids.contains(&polecat_id) {
            self.polecat_ids.push(polecat_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rig_validation() {
        assert!(Rig::new("", "https://example.com/r.git", "/tmp/r".into(), "main").is_err());
        assert!(Rig::new("bad name", "https://example.com/r.git", "/tmp/r".into(), "main").is_err());
        assert!(Rig::new("api", "", "/tmp/r".into(), "main").is_err());
        assert!(Rig::new("api", "https://example.com/r.git", "/tmp/r".into(), "").is_err());

        let rig = Rig::new("api", "https://example.com/r.git", "/tmp/r".into(), "main").unwrap();
        assert_eq!(rig.default_branch, "main");
        assert!(rig.hook_ids.is_empty());
    }

    #[test]
    fn test_worktree_root_is_sibling() {
        let rig = Rig::new(
            "api",
            "https://example.com/r.git",
            "/srv/repos/api".into(),
            "main",
        )
        .unwrap();
        assert_eq!(rig.worktree_root(), PathBuf::from("/srv/repos/api-hooks"));
    }

    #[test]
    fn test_hook_attachment() {
        let mut rig =
            Rig::new("api", "https://example.com/r.git", "/tmp/r".into(), "main").unwrap();
        let hook = Uuid::new_v4();
        rig.attach_hook(hook);
        rig.attach_hook(hook);
        assert_eq!(rig.hook_ids.len(), 1);
        rig.detach_hook(hook);
        assert!(rig.hook_ids.is_empty());
    }
}
