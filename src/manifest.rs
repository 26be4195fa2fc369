//! Workspace manifest: the single JSON document describing a workspace.
//!
//! Rigs and configuration are written through on every mutation so a
//! restarted process reconstructs the workspace from disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::Rig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceManifest {
    pub id: Uuid,
    pub name: String,
    pub root_path: PathBuf,
    pub config: Config,
    pub rigs: Vec<Rig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceManifest {
    pub fn new<S: Into<String>>(name: S, root_path: PathBuf, config: Config) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation("Workspace name cannot be empty"));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            root_path,
            config,
            rigs: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn rig(&self, rig_id: Uuid) -> Option<&Rig> {
        self.rigs.iter().find(|r| r.id == rig_id)
    }

    pub fn rig_mut(&mut self, rig_id: Uuid) -> Option<&mut Rig> {
        self.rigs.iter_mut().find(|r| r.id == rig_id)
    }

    pub fn rig_by_name(&self, name: &str) -> Option<&Rig> {
        self.rigs.iter().find(|r| r.name == name)
    }

    pub fn add_rig(&mut self, rig: Rig) -> Result<()> {
        if self.rigs.iter().any(|r| r.name == rig.name) {
            return Err(Error::validation(format!(
                "Rig '{}' is already registered",
                rig.name
            )));
        }
        self.rigs.push(rig);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn remove_rig(&mut self, rig_id: Uuid) -> Result<Rig> {
        let position = self
            .rigs
            .iter()
            .position(|r| r.id == rig_id)
            .ok_or_else(|| Error::not_found("Rig", rig_id.to_string()))?;
        self.updated_at = Utc::now();
        Ok(self.rigs.remove(position))
    }
}

/// Manifest persistence seam.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self) -> Result<Option<WorkspaceManifest>>;
    async fn save(&self, manifest: &WorkspaceManifest) -> Result<()>;
}

/// Pretty-printed JSON file at a fixed path.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load(&self) -> Result<Option<WorkspaceManifest>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let manifest = serde_json::from_str(&raw)?;
        Ok(Some(manifest))
    }

    async fn save(&self, manifest: &WorkspaceManifest) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(manifest)?;
        tokio::fs::write(&self.path, json).await?;
        info!(path = %self.path.display(), "Saved workspace manifest");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> WorkspaceManifest {
        WorkspaceManifest::new("yard", PathBuf::from("/srv/yard"), Config::default()).unwrap()
    }

    fn rig(name: &str) -> Rig {
        Rig::new(
            name,
            format!("https://example.com/{name}.git"),
            format!("/srv/repos/{name}").into(),
            "main",
        )
        .unwrap()
    }

    #[test]
    fn test_rig_registration_rejects_duplicates() {
        let mut m = manifest();
        m.add_rig(rig("api")).unwrap();
        assert!(m.add_rig(rig("api")).is_err());
        assert!(m.rig_by_name("api").is_some());

        let id = m.rigs[0].id;
        let removed = m.remove_rig(id).unwrap();
        assert_eq!(removed.name, "api");
        assert!(m.rigs.is_empty());
        assert!(m.remove_rig(id).is_err());
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("manifest.json"));
        assert!(store.load().await.unwrap().is_none());

        let mut m = manifest();
        m.add_rig(rig("api")).unwrap();
        store.save(&m).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, m);
        assert_eq!(loaded.rigs.len(), 1);
    }
}
