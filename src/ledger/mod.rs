//! Work ledger: the system of record for beads and convoys.
//!
//! The ledger owns the bead state machine. Every status write goes through
//! [`WorkLedger::transition_bead`], which validates the edge and applies it
//! linearizably per bead id, so two dispatch passes can never both claim
//! the same queued bead. Persistence is swappable: the in-memory backend is
//! the default and the test double, the SQLite backend the durable option.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryLedger;
pub use sqlite::SqliteLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Bead, BeadOutcome, BeadStatus, Convoy, ConvoyProgress, ConvoyStatus};

#[async_trait]
pub trait WorkLedger: Send + Sync {
    async fn create_bead(&self, bead: Bead) -> Result<()>;

    async fn get_bead(&self, id: Uuid) -> Result<Bead>;

    async fn list_convoy_beads(&self, convoy_id: Uuid) -> Result<Vec<Bead>>;

    /// Validated, linearizable status change. Rejects any edge outside the
    /// state machine with `InvalidTransition`.
    async fn transition_bead(&self, id: Uuid, to: BeadStatus) -> Result<Bead>;

    /// Compare-and-swap claim: `queued -> assigned`, returning false when
    /// another pass won the race.
    async fn claim_bead(&self, id: Uuid) -> Result<bool>;

    /// Beads eligible for dispatch: status `queued`, every dependency
    /// `completed`, and the requeue backoff gate passed.
    async fn ready_beads(&self, convoy_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Bead>>;

    async fn assign_polecat(&self, id: Uuid, polecat: Option<Uuid>) -> Result<()>;

    async fn store_outcome(&self, id: Uuid, outcome: BeadOutcome) -> Result<()>;

    /// Record a failed attempt and the backoff gate for the next one.
    async fn set_retry_state(
        &self,
        id: Uuid,
        attempt: u32,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn create_convoy(&self, convoy: Convoy) -> Result<()>;

    async fn get_convoy(&self, id: Uuid) -> Result<Convoy>;

    async fn list_convoys(&self) -> Result<Vec<Convoy>>;

    async fn set_convoy_status(&self, id: Uuid, status: ConvoyStatus) -> Result<()>;

    /// Bead counts by status, for workspace reporting.
    async fn bead_counts(&self) -> Result<HashMap<BeadStatus, usize>>;

    /// Recompute progress from member statuses; nothing is cached, so the
    /// partition invariant holds at every observation point.
    async fn calculate_progress(&self, convoy_id: Uuid) -> Result<ConvoyProgress> {
        let statuses: Vec<BeadStatus> = self
            .list_convoy_beads(convoy_id)
            .await?
            .iter()
            .map(|b| b.status)
            .collect();
        Ok(ConvoyProgress::from_statuses(&statuses))
    }

    /// Derive the convoy status from member beads and persist it.
    async fn refresh_convoy_status(&self, convoy_id: Uuid) -> Result<ConvoyStatus> {
        let statuses: Vec<BeadStatus> = self
            .list_convoy_beads(convoy_id)
            .await?
            .iter()
            .map(|b| b.status)
            .collect();
        let status = ConvoyProgress::derive_status(&statuses);
        self.set_convoy_status(convoy_id, status).await?;
        Ok(status)
    }
}

/// Dependency-eligibility check shared by ledger backends.
pub(crate) fn dependencies_satisfied(bead: &Bead, by_id: &HashMap<Uuid, BeadStatus>) -> bool {
    bead.dependencies
        .iter()
        .all(|dep| by_id.get(dep) == Some(&BeadStatus::Completed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BeadPriority;

    fn bead_with_deps(deps: Vec<Uuid>) -> Bead {
        let mut builder = Bead::builder().title("work").role("backend");
        for d in deps {
            builder = builder.dependency(d);
        }
        builder.build().unwrap()
    }

    async fn queued_bead(ledger: &dyn WorkLedger, convoy: Uuid, deps: Vec<Uuid>) -> Bead {
        let mut b = bead_with_deps(deps);
        b.convoy_id = Some(convoy);
        ledger.create_bead(b.clone()).await.unwrap();
        ledger.transition_bead(b.id, BeadStatus::Queued).await.unwrap()
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_edges() {
        let ledger = InMemoryLedger::new();
        let b = bead_with_deps(vec![]);
        ledger.create_bead(b.clone()).await.unwrap();

        let err = ledger
            .transition_bead(b.id, BeadStatus::Completed)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "invalid_transition");

        // Legal path all the way through
        for to in [
            BeadStatus::Queued,
            BeadStatus::Assigned,
            BeadStatus::InProgress,
            BeadStatus::Verifying,
            BeadStatus::Completed,
        ] {
            ledger.transition_bead(b.id, to).await.unwrap();
        }
        // Terminal: nothing leaves completed
        assert!(ledger.transition_bead(b.id, BeadStatus::Queued).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let ledger = InMemoryLedger::new();
        let convoy = Convoy::new("c", "test", vec![]).unwrap();
        ledger.create_convoy(convoy.clone()).await.unwrap();
        let b = queued_bead(&ledger, convoy.id, vec![]).await;

        assert!(ledger.claim_bead(b.id).await.unwrap());
        // Second claim loses the race
        assert!(!ledger.claim_bead(b.id).await.unwrap());
        assert_eq!(
            ledger.get_bead(b.id).await.unwrap().status,
            BeadStatus::Assigned
        );
    }

    #[tokio::test]
    async fn test_ready_beads_respect_dependencies_and_backoff() {
        let ledger = InMemoryLedger::new();
        let convoy = Convoy::new("c", "test", vec![]).unwrap();
        ledger.create_convoy(convoy.clone()).await.unwrap();

        let dep = queued_bead(&ledger, convoy.id, vec![]).await;
        let blocked = queued_bead(&ledger, convoy.id, vec![dep.id]).await;

        let now = Utc::now();
        let ready = ledger.ready_beads(convoy.id, now).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, dep.id);

        // Complete the dependency; the blocked bead becomes ready
        for to in [
            BeadStatus::Assigned,
            BeadStatus::InProgress,
            BeadStatus::Verifying,
            BeadStatus::Completed,
        ] {
            ledger.transition_bead(dep.id, to).await.unwrap();
        }
        let ready = ledger.ready_beads(convoy.id, now).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, blocked.id);

        // Backoff gate keeps it out until the window passes
        let gate = now + chrono::Duration::seconds(60);
        ledger
            .set_retry_state(blocked.id, 1, Some(gate))
            .await
            .unwrap();
        assert!(ledger.ready_beads(convoy.id, now).await.unwrap().is_empty());
        assert_eq!(
            ledger.ready_beads(convoy.id, gate).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_progress_partition_holds() {
        let ledger = InMemoryLedger::new();
        let convoy = Convoy::new("c", "test", vec![]).unwrap();
        ledger.create_convoy(convoy.clone()).await.unwrap();

        let a = queued_bead(&ledger, convoy.id, vec![]).await;
        let _b = queued_bead(&ledger, convoy.id, vec![]).await;
        ledger.claim_bead(a.id).await.unwrap();

        let progress = ledger.calculate_progress(convoy.id).await.unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(
            progress.completed + progress.failed + progress.in_progress + progress.queued,
            progress.total
        );
        assert_eq!(progress.in_progress, 1);
        assert_eq!(progress.queued, 1);

        let status = ledger.refresh_convoy_status(convoy.id).await.unwrap();
        assert_eq!(status, ConvoyStatus::Active);
    }

    #[tokio::test]
    async fn test_bead_counts() {
        let ledger = InMemoryLedger::new();
        let convoy = Convoy::new("c", "test", vec![]).unwrap();
        ledger.create_convoy(convoy.clone()).await.unwrap();
        let _a = queued_bead(&ledger, convoy.id, vec![]).await;
        let _b = queued_bead(&ledger, convoy.id, vec![]).await;

        let counts = ledger.bead_counts().await.unwrap();
        assert_eq!(counts.get(&BeadStatus::Queued), Some(&2));
    }

    #[tokio::test]
    async fn test_priority_ordering_in_ready_set() {
        let ledger = InMemoryLedger::new();
        let convoy = Convoy::new("c", "test", vec![]).unwrap();
        ledger.create_convoy(convoy.clone()).await.unwrap();

        let mut low = Bead::builder()
            .title("low")
            .role("backend")
            .priority(BeadPriority::Low)
            .build()
            .unwrap();
        low.convoy_id = Some(convoy.id);
        let mut critical = Bead::builder()
            .title("critical")
            .role("backend")
            .priority(BeadPriority::Critical)
            .build()
            .unwrap();
        critical.convoy_id = Some(convoy.id);

        ledger.create_bead(low.clone()).await.unwrap();
        ledger.create_bead(critical.clone()).await.unwrap();
        ledger.transition_bead(low.id, BeadStatus::Queued).await.unwrap();
        ledger
            .transition_bead(critical.id, BeadStatus::Queued)
            .await
            .unwrap();

        let ready = ledger.ready_beads(convoy.id, Utc::now()).await.unwrap();
        assert_eq!(ready[0].id, critical.id);
        assert_eq!(ready[1].id, low.id);
    }
}
