//! In-memory ledger backend: the default, and the test double.
//!
//! One mutex guards both tables, which makes every bead write linearizable
//! per id for free; single-workspace dispatch volume does not justify finer
//! locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{dependencies_satisfied, WorkLedger};
use crate::error::{Error, Result};
use crate::model::{Bead, BeadOutcome, BeadStatus, Convoy, ConvoyStatus};

#[derive(Default)]
struct Tables {
    beads: HashMap<Uuid, Bead>,
    convoys: HashMap<Uuid, Convoy>,
}

#[derive(Default)]
pub struct InMemoryLedger {
    tables: Mutex<Tables>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkLedger for InMemoryLedger {
    async fn create_bead(&self, bead: Bead) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.beads.contains_key(&bead.id) {
            return Err(Error::validation(format!("bead {} already exists", bead.id)));
        }
        tables.beads.insert(bead.id, bead);
        Ok(())
    }

    async fn get_bead(&self, id: Uuid) -> Result<Bead> {
        self.tables
            .lock()
            .await
            .beads
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("Bead", id.to_string()))
    }

    async fn list_convoy_beads(&self, convoy_id: Uuid) -> Result<Vec<Bead>> {
        let tables = self.tables.lock().await;
        let convoy = tables
            .convoys
            .get(&convoy_id)
            .ok_or_else(|| Error::not_found("Convoy", convoy_id.to_string()))?;
        let mut beads = Vec::with_capacity(convoy.bead_ids.len());
        for id in &convoy.bead_ids {
            if let Some(bead) = tables.beads.get(id) {
                beads.push(bead.clone());
            }
        }
        // Membership set in the convoy record wins, but beads created with
        // a convoy id and never listed there still belong to it
        for bead in tables.beads.values() {
            if bead.convoy_id == Some(convoy_id) && !convoy.bead_ids.contains(&bead.id) {
                beads.push(bead.clone());
            }
        }
        Ok(beads)
    }

    async fn transition_bead(&self, id: Uuid, to: BeadStatus) -> Result<Bead> {
        let mut tables = self.tables.lock().await;
        let bead = tables
            .beads
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Bead", id.to_string()))?;
        if !bead.status.can_transition_to(to) {
            return Err(Error::invalid_transition(bead.status.as_str(), to.as_str()));
        }
        debug!(bead_id = %id, from = bead.status.as_str(), to = to.as_str(), "Bead transition");
        bead.status = to;
        bead.updated_at = Utc::now();
        Ok(bead.clone())
    }

    async fn claim_bead(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let bead = tables
            .beads
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Bead", id.to_string()))?;
        if bead.status != BeadStatus::Queued {
            return Ok(false);
        }
        bead.status = BeadStatus::Assigned;
        bead.updated_at = Utc::now();
        Ok(true)
    }

    async fn ready_beads(&self, convoy_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Bead>> {
        let tables = self.tables.lock().await;
        let statuses: HashMap<Uuid, BeadStatus> =
            tables.beads.iter().map(|(id, b)| (*id, b.status)).collect();

        let mut ready: Vec<Bead> = tables
            .beads
            .values()
            .filter(|b| {
                b.convoy_id == Some(convoy_id)
                    && b.status == BeadStatus::Queued
                    && b.is_eligible_at(now)
                    && dependencies_satisfied(b, &statuses)
            })
            .cloned()
            .collect();
        ready.sort_by_key(|b| (b.priority, b.created_at));
        Ok(ready)
    }

    async fn assign_polecat(&self, id: Uuid, polecat: Option<Uuid>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let bead = tables
            .beads
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Bead", id.to_string()))?;
        bead.assigned_polecat = polecat;
        bead.updated_at = Utc::now();
        Ok(())
    }

    async fn store_outcome(&self, id: Uuid, outcome: BeadOutcome) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let bead = tables
            .beads
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Bead", id.to_string()))?;
        bead.outcome = outcome;
        bead.updated_at = Utc::now();
        Ok(())
    }

    async fn set_retry_state(
        &self,
        id: Uuid,
        attempt: u32,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let bead = tables
            .beads
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Bead", id.to_string()))?;
        bead.attempt = attempt;
        bead.not_before = not_before;
        bead.updated_at = Utc::now();
        Ok(())
    }

    async fn create_convoy(&self, convoy: Convoy) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.convoys.contains_key(&convoy.id) {
            return Err(Error::validation(format!(
                "convoy {} already exists",
                convoy.id
            )));
        }
        tables.convoys.insert(convoy.id, convoy);
        Ok(())
    }

    async fn get_convoy(&self, id: Uuid) -> Result<Convoy> {
        self.tables
            .lock()
            .await
            .convoys
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("Convoy", id.to_string()))
    }

    async fn list_convoys(&self) -> Result<Vec<Convoy>> {
        Ok(self.tables.lock().await.convoys.values().cloned().collect())
    }

    async fn set_convoy_status(&self, id: Uuid, status: ConvoyStatus) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let convoy = tables
            .convoys
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("Convoy", id.to_string()))?;
        convoy.status = status;
        convoy.updated_at = Utc::now();
        Ok(())
    }

    async fn bead_counts(&self) -> Result<HashMap<BeadStatus, usize>> {
        let tables = self.tables.lock().await;
        let mut counts = HashMap::new();
        for bead in tables.beads.values() {
            *counts.entry(bead.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
