//! SQLite ledger backend.
//!
//! Uses runtime-bound queries throughout; dependency lists and outcome
//! payloads are stored as JSON text, ids and timestamps as text. Claims and
//! transitions are conditional updates (`... WHERE status = ?`), which is
//! what makes bead-status writes linearizable per id across dispatch
//! passes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::{dependencies_satisfied, WorkLedger};
use crate::error::{Error, Result};
use crate::model::{
    Bead, BeadOutcome, BeadPriority, BeadStatus, Convoy, ConvoyStatus,
};

pub type DbPool = Pool<Sqlite>;

pub struct SqliteLedger {
    pool: DbPool,
}

impl SqliteLedger {
    /// Connect (creating the database file if needed) and initialize the
    /// schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::Database(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.init_schema().await?;
        info!(url = %database_url, "Connected ledger database");
        Ok(ledger)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS beads (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                role TEXT NOT NULL,
                dependencies TEXT NOT NULL,
                assigned_polecat TEXT,
                convoy_id TEXT,
                outcome TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                optional INTEGER NOT NULL,
                not_before TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS convoys (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                bead_ids TEXT NOT NULL,
                status TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_beads_convoy ON beads (convoy_id, status)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn bead_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Bead> {
        let parse_uuid = |s: String| {
            Uuid::parse_str(&s).map_err(|e| Error::Database(format!("bad uuid in ledger: {e}")))
        };
        let parse_time = |s: String| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::Database(format!("bad timestamp in ledger: {e}")))
        };

        let deps_json: String = row.try_get("dependencies")?;
        let dependencies: Vec<Uuid> = serde_json::from_str(&deps_json)?;
        let outcome_json: String = row.try_get("outcome")?;
        let outcome: BeadOutcome = serde_json::from_str(&outcome_json)?;

        Ok(Bead {
            id: parse_uuid(row.try_get("id")?)?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            status: BeadStatus::parse(&row.try_get::<String, _>("status")?)?,
            priority: BeadPriority::parse(&row.try_get::<String, _>("priority")?)?,
            role: row.try_get("role")?,
            dependencies,
            assigned_polecat: row
                .try_get::<Option<String>, _>("assigned_polecat")?
                .map(parse_uuid)
                .transpose()?,
            convoy_id: row
                .try_get::<Option<String>, _>("convoy_id")?
                .map(parse_uuid)
                .transpose()?,
            outcome,
            attempt: row.try_get::<i64, _>("attempt")? as u32,
            max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
            optional: row.try_get::<i64, _>("optional")? != 0,
            not_before: row
                .try_get::<Option<String>, _>("not_before")?
                .map(parse_time)
                .transpose()?,
            created_at: parse_time(row.try_get("created_at")?)?,
            updated_at: parse_time(row.try_get("updated_at")?)?,
        })
    }

    fn convoy_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Convoy> {
        let ids_json: String = row.try_get("bead_ids")?;
        let bead_ids: Vec<Uuid> = serde_json::from_str(&ids_json)?;
        let parse_time = |s: String| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::Database(format!("bad timestamp in ledger: {e}")))
        };
        Ok(Convoy {
            id: Uuid::parse_str(&row.try_get::<String, _>("id")?)
                .map_err(|e| Error::Database(e.to_string()))?,
            name: row.try_get("name")?,
            bead_ids,
            status: ConvoyStatus::parse(&row.try_get::<String, _>("status")?)?,
            created_by: row.try_get("created_by")?,
            created_at: parse_time(row.try_get("created_at")?)?,
            updated_at: parse_time(row.try_get("updated_at")?)?,
        })
    }

    async fn fetch_bead(&self, id: Uuid) -> Result<Bead> {
        let row = sqlx::query("SELECT * FROM beads WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Bead", id.to_string()))?;
        Self::bead_from_row(&row)
    }
}

#[async_trait]
impl WorkLedger for SqliteLedger {
    async fn create_bead(&self, bead: Bead) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO beads (
                id, title, description, status, priority, role, dependencies,
                assigned_polecat, convoy_id, outcome, attempt, max_attempts,
                optional, not_before, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(bead.id.to_string())
        .bind(&bead.title)
        .bind(&bead.description)
        .bind(bead.status.as_str())
        .bind(bead.priority.as_str())
        .bind(&bead.role)
        .bind(serde_json::to_string(&bead.dependencies)?)
        .bind(bead.assigned_polecat.map(|id| id.to_string()))
        .bind(bead.convoy_id.map(|id| id.to_string()))
        .bind(serde_json::to_string(&bead.outcome)?)
        .bind(bead.attempt as i64)
        .bind(bead.max_attempts as i64)
        .bind(bead.optional as i64)
        .bind(bead.not_before.map(|t| t.to_rfc3339()))
        .bind(bead.created_at.to_rfc3339())
        .bind(bead.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_bead(&self, id: Uuid) -> Result<Bead> {
        self.fetch_bead(id).await
    }

    async fn list_convoy_beads(&self, convoy_id: Uuid) -> Result<Vec<Bead>> {
        let rows = sqlx::query("SELECT * FROM beads WHERE convoy_id = ?1 ORDER BY created_at")
            .bind(convoy_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::bead_from_row).collect()
    }

    async fn transition_bead(&self, id: Uuid, to: BeadStatus) -> Result<Bead> {
        // CAS loop: validate against the observed status, then update only
        // if the row still carries it.
        for _ in 0..3 {
            let bead = self.fetch_bead(id).await?;
            if !bead.status.can_transition_to(to) {
                return Err(Error::invalid_transition(bead.status.as_str(), to.as_str()));
            }
            let updated = sqlx::query(
                "UPDATE beads SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            )
            .bind(to.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .bind(bead.status.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
            if updated == 1 {
                debug!(bead_id = %id, from = bead.status.as_str(), to = to.as_str(), "Bead transition");
                return self.fetch_bead(id).await;
            }
        }
        Err(Error::Database(format!(
            "bead {id} status contended beyond retry budget"
        )))
    }

    async fn claim_bead(&self, id: Uuid) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE beads SET status = 'assigned', updated_at = ?1 WHERE id = ?2 AND status = 'queued'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn ready_beads(&self, convoy_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Bead>> {
        // Dependencies are JSON text, so eligibility is filtered here
        // rather than in SQL.
        let all = self.list_convoy_beads(convoy_id).await?;
        let statuses: HashMap<Uuid, BeadStatus> = all.iter().map(|b| (b.id, b.status)).collect();
        let mut ready: Vec<Bead> = all
            .into_iter()
            .filter(|b| {
                b.status == BeadStatus::Queued
                    && b.is_eligible_at(now)
                    && dependencies_satisfied(b, &statuses)
            })
            .collect();
        ready.sort_by_key(|b| (b.priority, b.created_at));
        Ok(ready)
    }

    async fn assign_polecat(&self, id: Uuid, polecat: Option<Uuid>) -> Result<()> {
        sqlx::query("UPDATE beads SET assigned_polecat = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(polecat.map(|p| p.to_string()))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn store_outcome(&self, id: Uuid, outcome: BeadOutcome) -> Result<()> {
        sqlx::query("UPDATE beads SET outcome = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(serde_json::to_string(&outcome)?)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_retry_state(
        &self,
        id: Uuid,
        attempt: u32,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE beads SET attempt = ?1, not_before = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(attempt as i64)
        .bind(not_before.map(|t| t.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_convoy(&self, convoy: Convoy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO convoys (id, name, bead_ids, status, created_by, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(convoy.id.to_string())
        .bind(&convoy.name)
        .bind(serde_json::to_string(&convoy.bead_ids)?)
        .bind(convoy.status.as_str())
        .bind(&convoy.created_by)
        .bind(convoy.created_at.to_rfc3339())
        .bind(convoy.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_convoy(&self, id: Uuid) -> Result<Convoy> {
        let row = sqlx::query("SELECT * FROM convoys WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Convoy", id.to_string()))?;
        Self::convoy_from_row(&row)
    }

    async fn list_convoys(&self) -> Result<Vec<Convoy>> {
        let rows = sqlx::query("SELECT * FROM convoys ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::convoy_from_row).collect()
    }

    async fn set_convoy_status(&self, id: Uuid, status: ConvoyStatus) -> Result<()> {
        sqlx::query("UPDATE convoys SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bead_counts(&self) -> Result<HashMap<BeadStatus, usize>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM beads GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = HashMap::new();
        for row in rows {
            let status = BeadStatus::parse(&row.try_get::<String, _>("status")?)?;
            let n: i64 = row.try_get("n")?;
            counts.insert(status, n as usize);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_ledger() -> (SqliteLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("ledger.db").display());
        (SqliteLedger::connect(&url).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn test_bead_round_trip() {
        let (ledger, _dir) = temp_ledger().await;
        let dep = Uuid::new_v4();
        let bead = Bead::builder()
            .title("persisted")
            .description("round trip")
            .role("backend")
            .dependency(dep)
            .max_attempts(5)
            .optional(true)
            .build()
            .unwrap();
        ledger.create_bead(bead.clone()).await.unwrap();

        let loaded = ledger.get_bead(bead.id).await.unwrap();
        assert_eq!(loaded.title, "persisted");
        assert_eq!(loaded.dependencies, vec![dep]);
        assert_eq!(loaded.max_attempts, 5);
        assert!(loaded.optional);
        assert_eq!(loaded.status, BeadStatus::Backlog);
    }

    #[tokio::test]
    async fn test_transition_and_claim_semantics() {
        let (ledger, _dir) = temp_ledger().await;
        let bead = Bead::builder().title("x").role("backend").build().unwrap();
        ledger.create_bead(bead.clone()).await.unwrap();

        assert!(ledger
            .transition_bead(bead.id, BeadStatus::InProgress)
            .await
            .is_err());
        ledger.transition_bead(bead.id, BeadStatus::Queued).await.unwrap();

        assert!(ledger.claim_bead(bead.id).await.unwrap());
        assert!(!ledger.claim_bead(bead.id).await.unwrap());
        assert_eq!(
            ledger.get_bead(bead.id).await.unwrap().status,
            BeadStatus::Assigned
        );
    }

    #[tokio::test]
    async fn test_convoy_round_trip_and_progress() {
        let (ledger, _dir) = temp_ledger().await;
        let mut bead = Bead::builder().title("x").role("backend").build().unwrap();
        let convoy = Convoy::new("c", "test", vec![bead.id]).unwrap();
        bead.convoy_id = Some(convoy.id);
        ledger.create_convoy(convoy.clone()).await.unwrap();
        ledger.create_bead(bead.clone()).await.unwrap();

        let loaded = ledger.get_convoy(convoy.id).await.unwrap();
        assert_eq!(loaded.bead_ids, vec![bead.id]);

        ledger.transition_bead(bead.id, BeadStatus::Queued).await.unwrap();
        let progress = ledger.calculate_progress(convoy.id).await.unwrap();
        assert_eq!(progress.total, 1);
        assert_eq!(progress.queued, 1);

        let status = ledger.refresh_convoy_status(convoy.id).await.unwrap();
        assert_eq!(status, ConvoyStatus::Active);
    }

    #[tokio::test]
    async fn test_outcome_payload_persists() {
        let (ledger, _dir) = temp_ledger().await;
        let bead = Bead::builder().title("x").role("backend").build().unwrap();
        ledger.create_bead(bead.clone()).await.unwrap();

        let outcome = BeadOutcome::Failed {
            reason: "verification".into(),
            verification_errors: vec!["tests failed".into()],
        };
        ledger.store_outcome(bead.id, outcome.clone()).await.unwrap();
        assert_eq!(ledger.get_bead(bead.id).await.unwrap().outcome, outcome);
    }
}
