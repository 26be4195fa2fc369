//! Workspace manager: the top-level handle that owns the manifest, the
//! ledger, the registry, the hook store and the dispatcher.
//!
//! Every mutation of workspace shape (rigs, config) is written through to
//! the manifest immediately; scheduler state lives in the ledger.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::{Config, LedgerBackend};
use crate::dispatcher::FleetDispatcher;
use crate::error::{Error, Result};
use crate::git::GitCli;
use crate::hooks::{HookStore, RepairOutcome};
use crate::ledger::{InMemoryLedger, SqliteLedger, WorkLedger};
use crate::manifest::{DocumentStore, JsonFileStore, WorkspaceManifest};
use crate::model::{BeadStatus, ConvoyProgress, ConvoyStatus, Rig};
use crate::planner::{ConvoyReport, Planner};
use crate::registry::{CapabilityRegistry, RuntimeRegistration};
use crate::runtime::WorkerRuntime;

/// Point-in-time workspace summary.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceStatus {
    pub workspace: String,
    pub rigs: usize,
    pub registrations: usize,
    pub total_capacity: usize,
    pub active_sessions: usize,
    pub polecats: usize,
    pub convoys: Vec<ConvoySummary>,
    pub bead_counts: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvoySummary {
    pub id: Uuid,
    pub name: String,
    pub status: ConvoyStatus,
    pub progress: ConvoyProgress,
}

/// What a workspace-wide repair pass found and fixed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    pub recovered_hooks: usize,
    pub pruned_working_copies: usize,
    pub requeued_beads: usize,
}

pub struct WorkspaceManager {
    config: Config,
    store: Arc<dyn DocumentStore>,
    manifest: RwLock<WorkspaceManifest>,
    ledger: Arc<dyn WorkLedger>,
    registry: Arc<CapabilityRegistry>,
    hooks: Arc<HookStore>,
    dispatcher: FleetDispatcher,
    planner: Planner,
}

impl WorkspaceManager {
    /// Open (or initialize) the workspace rooted at `config.state_dir`,
    /// with the production git backend and the configured ledger.
    pub async fn open<S: Into<String>>(
        name: S,
        config: Config,
        runtime: Arc<dyn WorkerRuntime>,
    ) -> Result<Self> {
        let ledger: Arc<dyn WorkLedger> = match config.ledger_backend {
            LedgerBackend::Memory => Arc::new(InMemoryLedger::new()),
            LedgerBackend::Sqlite => {
                tokio::fs::create_dir_all(&config.state_dir).await?;
                Arc::new(SqliteLedger::connect(&config.database_url()).await?)
            }
        };
        let hooks = Arc::new(
            HookStore::new(Arc::new(GitCli)).with_records_dir(config.hooks_dir()),
        );
        hooks.load_records().await?;
        let store = Arc::new(JsonFileStore::new(config.manifest_path()));
        Self::assemble(name, config, store, ledger, hooks, runtime).await
    }

    /// Wire the manager from pre-built parts. Used by tests and by
    /// embedders that bring their own backends.
    pub async fn assemble<S: Into<String>>(
        name: S,
        config: Config,
        store: Arc<dyn DocumentStore>,
        ledger: Arc<dyn WorkLedger>,
        hooks: Arc<HookStore>,
        runtime: Arc<dyn WorkerRuntime>,
    ) -> Result<Self> {
        let manifest = match store.load().await? {
            Some(existing) => {
                info!(workspace = %existing.name, rigs = existing.rigs.len(), "Loaded workspace");
                existing
            }
            None => {
                let fresh = WorkspaceManifest::new(
                    name,
                    config.state_dir.clone(),
                    config.clone(),
                )?;
                store.save(&fresh).await?;
                fresh
            }
        };

        let registry = Arc::new(CapabilityRegistry::new());
        let dispatcher = FleetDispatcher::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&hooks),
            runtime,
            config.clone(),
        );
        let planner = Planner::new(Arc::clone(&ledger), config.default_max_attempts);

        Ok(Self {
            config,
            store,
            manifest: RwLock::new(manifest),
            ledger,
            registry,
            hooks,
            dispatcher,
            planner,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hooks(&self) -> &HookStore {
        &self.hooks
    }

    pub fn dispatcher(&self) -> &FleetDispatcher {
        &self.dispatcher
    }

    pub async fn register_runtime(&self, registration: RuntimeRegistration) -> Result<()> {
        self.registry.register(registration).await
    }

    pub async fn add_rig(&self, rig: Rig) -> Result<Rig> {
        let mut manifest = self.manifest.write().await;
        manifest.add_rig(rig.clone())?;
        self.store.save(&manifest).await?;
        info!(rig = %rig.name, "Registered rig");
        Ok(rig)
    }

    /// Remove a rig. Refused while the rig still has active hooks; the
    /// caller suspends or destroys them first.
    pub async fn remove_rig(&self, name: &str) -> Result<Rig> {
        let rig_id = {
            let manifest = self.manifest.read().await;
            manifest
                .rig_by_name(name)
                .map(|r| r.id)
                .ok_or_else(|| Error::not_found("Rig", name))?
        };
        let active = self
            .hooks
            .list_for_rig(rig_id)
            .await
            .into_iter()
            .filter(|h| h.state == crate::hooks::HookState::Active)
            .count();
        if active > 0 {
            return Err(Error::validation(format!(
                "Rig '{name}' still has {active} active hook(s)"
            )));
        }

        let mut manifest = self.manifest.write().await;
        let removed = manifest.remove_rig(rig_id)?;
        self.store.save(&manifest).await?;
        info!(rig = %name, "Removed rig");
        Ok(removed)
    }

    pub async fn rig_by_name(&self, name: &str) -> Result<Rig> {
        self.manifest
            .read()
            .await
            .rig_by_name(name)
            .cloned()
            .ok_or_else(|| Error::not_found("Rig", name))
    }

    pub async fn list_rigs(&self) -> Vec<Rig> {
        self.manifest.read().await.rigs.clone()
    }

    /// The front door: plan the request into a convoy, drive it to a
    /// terminal status, and return the report.
    pub async fn submit_request(
        &self,
        rig_name: &str,
        convoy_name: &str,
        request: &str,
        created_by: &str,
    ) -> Result<ConvoyReport> {
        let rig = self.rig_by_name(rig_name).await?;
        let plan = self
            .planner
            .plan(&rig, convoy_name, request, created_by)
            .await?;
        info!(
            convoy_id = %plan.convoy.id,
            beads = plan.beads.len(),
            risk = ?plan.risk,
            "Submitted convoy"
        );
        self.dispatcher.run_convoy(plan.convoy.id, &rig).await?;
        self.planner.report(plan.convoy.id).await
    }

    /// Abort a running convoy by id.
    pub async fn abort_convoy(&self, convoy_id: Uuid, reason: &str) -> Result<ConvoyReport> {
        self.dispatcher.abort_convoy(convoy_id, reason).await?;
        self.planner.report(convoy_id).await
    }

    pub async fn status(&self) -> Result<WorkspaceStatus> {
        let manifest = self.manifest.read().await;
        let mut convoys = Vec::new();
        for convoy in self.ledger.list_convoys().await? {
            let progress = self.ledger.calculate_progress(convoy.id).await?;
            convoys.push(ConvoySummary {
                id: convoy.id,
                name: convoy.name,
                status: convoy.status,
                progress,
            });
        }
        let bead_counts = self
            .ledger
            .bead_counts()
            .await?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();

        Ok(WorkspaceStatus {
            workspace: manifest.name.clone(),
            rigs: manifest.rigs.len(),
            registrations: self.registry.snapshot().await.len(),
            total_capacity: self.registry.total_capacity().await,
            active_sessions: self.dispatcher.active_session_count().await,
            polecats: self.dispatcher.identities().await.len(),
            convoys,
            bead_counts,
        })
    }

    /// Workspace-wide repair: reconcile every rig's working copies with
    /// the hook records, then requeue beads stranded by a crash.
    pub async fn repair(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        for rig in self.list_rigs().await {
            let outcome: RepairOutcome = self.hooks.repair(&rig).await?;
            report.recovered_hooks += outcome.recovered_hooks;
            report.pruned_working_copies += outcome.pruned_working_copies;
        }
        for convoy in self.ledger.list_convoys().await? {
            if !convoy.status.is_terminal() {
                report.requeued_beads += self.dispatcher.recover(convoy.id).await?;
            }
        }
        info!(
            recovered_hooks = report.recovered_hooks,
            pruned = report.pruned_working_copies,
            requeued = report.requeued_beads,
            "Repair pass finished"
        );
        Ok(report)
    }

    /// Counts by status, for quick health checks.
    pub async fn bead_counts(&self) -> Result<HashMap<BeadStatus, usize>> {
        self.ledger.bead_counts().await
    }
}
