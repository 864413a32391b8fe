//! SQLite automation store.
//!
//! Implements `AutomationStore` from `waypoint-core` using sqlx with split
//! read/write pools. Instance data, step results and interaction stamps are
//! stored as JSON text. Step lock transitions run on the single writer
//! connection inside a transaction, which makes each of them atomic with
//! respect to every other advancer sharing the database file.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use uuid::Uuid;
use waypoint_core::repository::AutomationStore;
use waypoint_types::actor::InteractionRequirement;
use waypoint_types::automation::{AutomationData, AutomationRecord};
use waypoint_types::error::RepositoryError;
use waypoint_types::step::StepRecord;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `AutomationStore`.
#[derive(Clone)]
pub struct SqliteAutomationStore {
    pool: DatabasePool,
}

impl SqliteAutomationStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct AutomationRow {
    id: String,
    automation_class: String,
    finished: bool,
    data: String,
    paused_until: Option<String>,
    unique_key: String,
    created_at: String,
    updated_at: String,
}

impl AutomationRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            automation_class: row.try_get("automation_class")?,
            finished: row.try_get("finished")?,
            data: row.try_get("data")?,
            paused_until: row.try_get("paused_until")?,
            unique_key: row.try_get("unique_key")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<AutomationRecord, RepositoryError> {
        let data: AutomationData = serde_json::from_str(&self.data)
            .map_err(|e| RepositoryError::Query(format!("invalid automation data JSON: {e}")))?;

        Ok(AutomationRecord {
            id: parse_uuid(&self.id)?,
            automation_class: self.automation_class,
            finished: self.finished,
            data,
            paused_until: self.paused_until.as_deref().map(parse_datetime).transpose()?,
            unique_key: self.unique_key,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    id: String,
    automation_id: String,
    previous_id: Option<String>,
    node_name: String,
    lock_count: i32,
    requires_interaction: bool,
    interaction: String,
    created_at: String,
    finished_at: Option<String>,
    message: String,
    result: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            automation_id: row.try_get("automation_id")?,
            previous_id: row.try_get("previous_id")?,
            node_name: row.try_get("node_name")?,
            lock_count: row.try_get("lock_count")?,
            requires_interaction: row.try_get("requires_interaction")?,
            interaction: row.try_get("interaction")?,
            created_at: row.try_get("created_at")?,
            finished_at: row.try_get("finished_at")?,
            message: row.try_get("message")?,
            result: row.try_get("result")?,
        })
    }

    fn into_step(self) -> Result<StepRecord, RepositoryError> {
        let interaction: InteractionRequirement = serde_json::from_str(&self.interaction)
            .map_err(|e| RepositoryError::Query(format!("invalid interaction JSON: {e}")))?;
        let result: Value = serde_json::from_str(&self.result)
            .map_err(|e| RepositoryError::Query(format!("invalid step result JSON: {e}")))?;

        Ok(StepRecord {
            id: parse_uuid(&self.id)?,
            automation_id: parse_uuid(&self.automation_id)?,
            previous_id: self.previous_id.as_deref().map(parse_uuid).transpose()?,
            node_name: self.node_name,
            lock_count: self.lock_count,
            requires_interaction: self.requires_interaction,
            interaction,
            created_at: parse_datetime(&self.created_at)?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
            message: self.message,
            result,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamp; lexical order equals chronological order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

/// `previous_id` as compared against `COALESCE(previous_id, '')`.
fn previous_key(previous_id: Option<&Uuid>) -> String {
    previous_id.map(Uuid::to_string).unwrap_or_default()
}

fn automations_from_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<AutomationRecord>, RepositoryError> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let r = AutomationRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        records.push(r.into_record()?);
    }
    Ok(records)
}

fn steps_from_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<StepRecord>, RepositoryError> {
    let mut steps = Vec::with_capacity(rows.len());
    for row in rows {
        let r = StepRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        steps.push(r.into_step()?);
    }
    Ok(steps)
}

fn step_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StepRecord, RepositoryError> {
    StepRow::from_row(row)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .into_step()
}

async fn require_automation(conn: &mut SqliteConnection, id: &Uuid) -> Result<(), RepositoryError> {
    let exists = sqlx::query("SELECT 1 FROM automations WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    match exists {
        Some(_) => Ok(()),
        None => Err(RepositoryError::NotFound),
    }
}

/// Insert the step identified by `(automation_id, previous_id, node_name)`
/// unless it already exists.
async fn insert_step_if_absent(
    conn: &mut SqliteConnection,
    automation_id: &Uuid,
    previous_id: Option<&Uuid>,
    node_name: &str,
) -> Result<(), RepositoryError> {
    let fresh = StepRecord::new(*automation_id, previous_id.copied(), node_name);

    sqlx::query(
        r#"INSERT INTO automation_steps
           (id, automation_id, previous_id, node_name, lock_count, requires_interaction,
            interaction, created_at, finished_at, message, result)
           VALUES (?, ?, ?, ?, 0, 0, ?, ?, NULL, '', 'null')
           ON CONFLICT DO NOTHING"#,
    )
    .bind(fresh.id.to_string())
    .bind(automation_id.to_string())
    .bind(previous_id.map(Uuid::to_string))
    .bind(node_name)
    .bind(to_json(&fresh.interaction)?)
    .bind(format_datetime(&fresh.created_at))
    .execute(&mut *conn)
    .await
    .map_err(|e| RepositoryError::Query(e.to_string()))?;

    Ok(())
}

// ---------------------------------------------------------------------------
// AutomationStore impl
// ---------------------------------------------------------------------------

impl AutomationStore for SqliteAutomationStore {
    async fn create_automation(&self, record: &AutomationRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO automations
               (id, automation_class, finished, data, paused_until, unique_key, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(&record.automation_class)
        .bind(record.finished)
        .bind(to_json(&record.data)?)
        .bind(record.paused_until.as_ref().map(format_datetime))
        .bind(&record.unique_key)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("automation {} already exists", record.id)),
            ),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn get_automation(&self, id: &Uuid) -> Result<Option<AutomationRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM automations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = AutomationRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn find_automation_by_key(
        &self,
        key: &str,
    ) -> Result<Option<AutomationRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM automations WHERE unique_key = ?")
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = AutomationRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list_automations(
        &self,
        automation_class: Option<&str>,
        unfinished_only: bool,
    ) -> Result<Vec<AutomationRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM automations
               WHERE (? IS NULL OR automation_class = ?)
                 AND (? = 0 OR finished = 0)
               ORDER BY created_at ASC, id ASC"#,
        )
        .bind(automation_class)
        .bind(automation_class)
        .bind(unfinished_only)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        automations_from_rows(&rows)
    }

    async fn list_runnable(&self, now: DateTime<Utc>) -> Result<Vec<AutomationRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM automations
               WHERE finished = 0 AND (paused_until IS NULL OR paused_until <= ?)
               ORDER BY created_at ASC, id ASC"#,
        )
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        automations_from_rows(&rows)
    }

    async fn save_data(&self, id: &Uuid, data: &AutomationData) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE automations SET data = ?, updated_at = ? WHERE id = ?")
            .bind(to_json(data)?)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn set_finished(&self, id: &Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE automations SET finished = 1, updated_at = ? WHERE id = ?")
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn lower_paused_until(
        &self,
        id: &Uuid,
        until: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let until = format_datetime(&until);
        let result = sqlx::query(
            r#"UPDATE automations
               SET paused_until = CASE
                     WHEN paused_until IS NULL OR paused_until > ? THEN ?
                     ELSE paused_until
                   END,
                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&until)
        .bind(&until)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn clear_elapsed_pause(&self, id: &Uuid, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"UPDATE automations SET paused_until = NULL, updated_at = ?
               WHERE id = ? AND paused_until IS NOT NULL AND paused_until <= ?"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn delete_automation(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM automations WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_history(&self, older_than: DateTime<Utc>) -> Result<(u64, u64), RepositoryError> {
        let cutoff = format_datetime(&older_than);
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let (steps,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM automation_steps WHERE automation_id IN
                 (SELECT id FROM automations WHERE finished = 1 AND updated_at < ?)"#,
        )
        .bind(&cutoff)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let deleted = sqlx::query("DELETE FROM automations WHERE finished = 1 AND updated_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok((deleted.rows_affected(), steps as u64))
    }

    async fn enter_step(
        &self,
        automation_id: &Uuid,
        previous_id: Option<&Uuid>,
        node_name: &str,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        require_automation(&mut tx, automation_id).await?;
        insert_step_if_absent(&mut tx, automation_id, previous_id, node_name).await?;

        let row = sqlx::query(
            r#"UPDATE automation_steps SET lock_count = lock_count + 1
               WHERE automation_id = ? AND COALESCE(previous_id, '') = ? AND node_name = ?
                 AND lock_count = 0
               RETURNING *"#,
        )
        .bind(automation_id.to_string())
        .bind(previous_key(previous_id))
        .bind(node_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(step_from_row).transpose()
    }

    async fn create_step(
        &self,
        automation_id: &Uuid,
        previous_id: Option<&Uuid>,
        node_name: &str,
    ) -> Result<StepRecord, RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        require_automation(&mut tx, automation_id).await?;
        insert_step_if_absent(&mut tx, automation_id, previous_id, node_name).await?;

        let row = sqlx::query(
            r#"SELECT * FROM automation_steps
               WHERE automation_id = ? AND COALESCE(previous_id, '') = ? AND node_name = ?"#,
        )
        .bind(automation_id.to_string())
        .bind(previous_key(previous_id))
        .bind(node_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        step_from_row(&row)
    }

    async fn release_step(&self, step_id: &Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE automation_steps SET lock_count = MAX(lock_count - 1, 0) WHERE id = ?",
        )
        .bind(step_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn finish_step(&self, step_id: &Uuid) -> Result<StepRecord, RepositoryError> {
        let row = sqlx::query(
            r#"UPDATE automation_steps
               SET finished_at = COALESCE(finished_at, ?), lock_count = 0
               WHERE id = ?
               RETURNING *"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(step_id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => step_from_row(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn record_outcome(
        &self,
        step_id: &Uuid,
        message: &str,
        result: &Value,
    ) -> Result<(), RepositoryError> {
        let updated = sqlx::query("UPDATE automation_steps SET message = ?, result = ? WHERE id = ?")
            .bind(message)
            .bind(to_json(result)?)
            .bind(step_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn mark_interaction(&self, step: &StepRecord) -> Result<(), RepositoryError> {
        let updated = sqlx::query(
            "UPDATE automation_steps SET requires_interaction = ?, interaction = ? WHERE id = ?",
        )
        .bind(step.requires_interaction)
        .bind(to_json(&step.interaction)?)
        .bind(step.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_step(&self, step_id: &Uuid) -> Result<Option<StepRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM automation_steps WHERE id = ?")
            .bind(step_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(step_from_row).transpose()
    }

    async fn list_steps(&self, automation_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM automation_steps WHERE automation_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(automation_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        steps_from_rows(&rows)
    }

    async fn list_open_steps(&self, automation_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM automation_steps
               WHERE automation_id = ? AND finished_at IS NULL
               ORDER BY created_at ASC, id ASC"#,
        )
        .bind(automation_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        steps_from_rows(&rows)
    }

    async fn list_open_interactions(&self) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT s.* FROM automation_steps s
               JOIN automations a ON a.id = s.automation_id
               WHERE s.requires_interaction = 1 AND s.finished_at IS NULL AND a.finished = 0
               ORDER BY s.created_at ASC, s.id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        steps_from_rows(&rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use serde_json::json;
    use waypoint_core::automation::{Engine, Node, Registry, RunOutcome, WorkflowDefinition};
    use waypoint_types::config::EngineConfig;

    use super::*;
    use crate::sqlite::pool::{database_url, DatabasePool};

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let url = database_url(dir.path());
        // Leak tempdir so it lives for the test
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    async fn store_with_automation() -> (SqliteAutomationStore, AutomationRecord) {
        let store = SqliteAutomationStore::new(test_pool().await);
        let record = AutomationRecord::new("billing", AutomationData::new());
        store.create_automation(&record).await.unwrap();
        (store, record)
    }

    fn payload() -> AutomationData {
        match json!({"email": "a@example.com", "attempts": 2, "tags": ["x", "y"]}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_automation() {
        let store = SqliteAutomationStore::new(test_pool().await);
        let record = AutomationRecord::new("billing", payload());
        store.create_automation(&record).await.unwrap();

        let loaded = store.get_automation(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);

        let by_key = store
            .find_automation_by_key(&record.unique_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_key.id, record.id);
        assert!(store.find_automation_by_key("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_is_conflict() {
        let (store, record) = store_with_automation().await;
        let err = store.create_automation(&record).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_automations_filters() {
        let (store, billing) = store_with_automation().await;
        let support = AutomationRecord::new("support", AutomationData::new());
        store.create_automation(&support).await.unwrap();
        store.set_finished(&support.id).await.unwrap();

        assert_eq!(store.list_automations(None, false).await.unwrap().len(), 2);
        let open = store.list_automations(None, true).await.unwrap();
        assert_eq!(open.iter().map(|a| a.id).collect::<Vec<_>>(), [billing.id]);
        assert!(store.list_automations(Some("support"), true).await.unwrap().is_empty());
        assert_eq!(store.list_automations(Some("support"), false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_data_and_missing_automation() {
        let (store, record) = store_with_automation().await;
        store.save_data(&record.id, &payload()).await.unwrap();
        let loaded = store.get_automation(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.data, payload());
        assert!(loaded.updated_at >= record.updated_at);

        let err = store.save_data(&Uuid::now_v7(), &payload()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_lower_paused_until_keeps_earliest() {
        let (store, record) = store_with_automation().await;
        let now = Utc::now();

        store.lower_paused_until(&record.id, now + Duration::hours(2)).await.unwrap();
        store.lower_paused_until(&record.id, now + Duration::hours(1)).await.unwrap();
        store.lower_paused_until(&record.id, now + Duration::hours(3)).await.unwrap();

        let loaded = store.get_automation(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.paused_until, Some(now + Duration::hours(1)));

        assert!(store.list_runnable(now).await.unwrap().is_empty());
        store.clear_elapsed_pause(&record.id, now).await.unwrap();
        assert!(store.get_automation(&record.id).await.unwrap().unwrap().paused_until.is_some());

        let later = now + Duration::hours(1);
        assert_eq!(store.list_runnable(later).await.unwrap().len(), 1);
        store.clear_elapsed_pause(&record.id, later).await.unwrap();
        assert!(store.get_automation(&record.id).await.unwrap().unwrap().paused_until.is_none());
    }

    #[tokio::test]
    async fn test_enter_step_locks_once() {
        let (store, record) = store_with_automation().await;

        let first = store.enter_step(&record.id, None, "start").await.unwrap();
        assert_eq!(first.as_ref().map(|s| s.lock_count), Some(1));
        let second = store.enter_step(&record.id, None, "start").await.unwrap();
        assert!(second.is_none(), "locked step must not be entered twice");

        let steps = store.list_steps(&record.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].previous_id.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_enter_yields_single_winner() {
        let (store, record) = store_with_automation().await;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let id = record.id;
            handles.push(tokio::spawn(async move {
                store.enter_step(&id, None, "start").await.unwrap().is_some()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.list_steps(&record.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_allows_reentry_and_finish_seals() {
        let (store, record) = store_with_automation().await;
        let step = store.enter_step(&record.id, None, "wait").await.unwrap().unwrap();
        store.release_step(&step.id).await.unwrap();

        let again = store.enter_step(&record.id, None, "wait").await.unwrap().unwrap();
        assert_eq!(again.id, step.id);

        let sealed = store.finish_step(&step.id).await.unwrap();
        assert!(sealed.is_finished());
        assert_eq!(sealed.lock_count, 0);
        let resealed = store.finish_step(&step.id).await.unwrap();
        assert_eq!(resealed.finished_at, sealed.finished_at);
        assert!(store.list_open_steps(&record.id).await.unwrap().is_empty());

        let err = store.release_step(&Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_create_step_is_idempotent_and_unlocked() {
        let (store, record) = store_with_automation().await;
        let root = store.enter_step(&record.id, None, "fork").await.unwrap().unwrap();

        let a = store.create_step(&record.id, Some(&root.id), "a").await.unwrap();
        let again = store.create_step(&record.id, Some(&root.id), "a").await.unwrap();
        assert_eq!(a.id, again.id);
        assert!(!a.is_locked());

        let entered = store.enter_step(&record.id, Some(&root.id), "a").await.unwrap().unwrap();
        assert_eq!(entered.id, a.id);
    }

    #[tokio::test]
    async fn test_record_outcome_and_interaction() {
        let (store, record) = store_with_automation().await;
        let mut step = store.enter_step(&record.id, None, "approve").await.unwrap().unwrap();

        store
            .record_outcome(&step.id, "OK", &json!({"total": 3}))
            .await
            .unwrap();
        step.requires_interaction = true;
        step.interaction.group = Some("ops".into());
        step.interaction.permissions = vec!["approve".into()];
        store.mark_interaction(&step).await.unwrap();

        let loaded = store.get_step(&step.id).await.unwrap().unwrap();
        assert_eq!(loaded.message, "OK");
        assert_eq!(loaded.result, json!({"total": 3}));
        assert!(loaded.requires_interaction);
        assert_eq!(loaded.interaction, step.interaction);

        assert_eq!(store.list_open_interactions().await.unwrap().len(), 1);
        store.set_finished(&record.id).await.unwrap();
        assert!(store.list_open_interactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_through_step_tree() {
        let (store, record) = store_with_automation().await;
        let fork = store.enter_step(&record.id, None, "fork").await.unwrap().unwrap();
        let a = store.create_step(&record.id, Some(&fork.id), "a").await.unwrap();
        let b = store.create_step(&record.id, Some(&fork.id), "b").await.unwrap();
        store.create_step(&record.id, Some(&a.id), "join").await.unwrap();
        store.create_step(&record.id, Some(&b.id), "join").await.unwrap();
        assert_eq!(store.list_steps(&record.id).await.unwrap().len(), 5);

        assert!(store.delete_automation(&record.id).await.unwrap());
        assert!(store.list_steps(&record.id).await.unwrap().is_empty());
        assert!(!store.delete_automation(&record.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_history_only_removes_finished() {
        let store = SqliteAutomationStore::new(test_pool().await);
        let done = AutomationRecord::new("billing", AutomationData::new());
        let open = AutomationRecord::new("billing", AutomationData::new());
        store.create_automation(&done).await.unwrap();
        store.create_automation(&open).await.unwrap();
        store.enter_step(&done.id, None, "start").await.unwrap();
        store.enter_step(&open.id, None, "start").await.unwrap();
        store.set_finished(&done.id).await.unwrap();

        let cutoff = Utc::now() + Duration::seconds(1);
        assert_eq!(store.delete_history(cutoff).await.unwrap(), (1, 1));
        assert!(store.get_automation(&open.id).await.unwrap().is_some());
        assert_eq!(store.list_steps(&open.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enter_unknown_automation_is_not_found() {
        let store = SqliteAutomationStore::new(test_pool().await);
        let err = store.enter_step(&Uuid::now_v7(), None, "start").await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_engine_runs_fork_join_on_sqlite() {
        let definition = WorkflowDefinition::builder("parallel")
            .autorun(false)
            .node("split", Node::fork().next("left").next("right"))
            .node("left", Node::noop().next("merge"))
            .node("right", Node::noop().next("merge"))
            .node("merge", Node::join())
            .node("done", Node::end())
            .build()
            .unwrap();
        let registry = Registry::new();
        registry.register(definition);
        let config = EngineConfig {
            detached_actions: false,
            ..EngineConfig::default()
        };
        let engine = Engine::new(SqliteAutomationStore::new(test_pool().await), registry, config);

        let automation = engine.create("parallel", AutomationData::new()).await.unwrap();
        assert_eq!(automation.run().await.unwrap(), RunOutcome::Finished);

        let steps = automation.steps().await.unwrap();
        let merges = steps.iter().filter(|s| s.node_name == "merge").count();
        let done = steps.iter().filter(|s| s.node_name == "done").count();
        assert_eq!(merges, 2);
        assert_eq!(done, 1);
        assert!(steps.iter().all(|s| s.is_finished()));
        assert!(automation.is_finished().await.unwrap());
    }
}
