//! PostgreSQL implementation of the store traits.
//!
//! Schema lives in `migrations/`. All writes are single statements, so a
//! crash can never leave a half-written step record behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::{ExecutionStore, HistoryStore, TimerStore};
use crate::error::{Error, Result};
use crate::types::{
    ErrorInfo, Execution, ExecutionListFilter, InvocationEdge, StepOutcome, StepRecord, Timer,
};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn execution_from_row(row: &PgRow) -> Result<Execution> {
    let error: Option<JsonValue> = row.try_get("error")?;
    let error = error
        .map(serde_json::from_value::<ErrorInfo>)
        .transpose()?;

    let parent_id: Option<String> = row.try_get("parent_execution_id")?;
    let parent_index: Option<i32> = row.try_get("parent_step_index")?;
    let parent = match (parent_id, parent_index) {
        (Some(execution_id), Some(step_index)) => Some(InvocationEdge {
            execution_id,
            step_index: step_index as u32,
        }),
        _ => None,
    };

    let depth: i32 = row.try_get("depth")?;

    Ok(Execution {
        id: row.try_get("id")?,
        workflow_name: row.try_get("workflow_name")?,
        args: row.try_get("args")?,
        status: row.try_get("status")?,
        result: row.try_get("result")?,
        error,
        parent,
        depth: depth as u32,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<StepRecord> {
    let index: i32 = row.try_get("step_index")?;
    let outcome: JsonValue = row.try_get("outcome")?;

    Ok(StepRecord {
        index: index as u32,
        kind: row.try_get("kind")?,
        input: row.try_get("input")?,
        outcome: serde_json::from_value(outcome)?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn timer_from_row(row: &PgRow) -> Result<Timer> {
    let step_index: i32 = row.try_get("step_index")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;

    Ok(Timer {
        promise_id: row.try_get("promise_id")?,
        execution_id: row.try_get("execution_id")?,
        step_index: step_index as u32,
        fire_at: row.try_get("fire_at")?,
        duration_ms: duration_ms.max(0) as u64,
    })
}

#[async_trait]
impl HistoryStore for PostgresStore {
    async fn append(&self, execution_id: &str, record: StepRecord) -> Result<()> {
        let outcome = serde_json::to_value(&record.outcome)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO step_records (execution_id, step_index, kind, input, outcome, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (execution_id, step_index) DO NOTHING
            "#,
        )
        .bind(execution_id)
        .bind(record.index as i32)
        .bind(record.kind)
        .bind(&record.input)
        .bind(&outcome)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(());
        }

        // A record already exists at this index; identical content is a no-op
        let row = sqlx::query(
            r#"
            SELECT step_index, kind, input, outcome, completed_at
            FROM step_records
            WHERE execution_id = $1 AND step_index = $2
            "#,
        )
        .bind(execution_id)
        .bind(record.index as i32)
        .fetch_one(&self.pool)
        .await?;

        let existing = record_from_row(&row)?;
        if existing.same_content(&record) {
            Ok(())
        } else {
            Err(Error::Conflict {
                execution_id: execution_id.to_string(),
                index: record.index,
            })
        }
    }

    async fn read(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT step_index, kind, input, outcome, completed_at
            FROM step_records
            WHERE execution_id = $1
            ORDER BY step_index ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl ExecutionStore for PostgresStore {
    async fn create_execution(&self, execution: Execution) -> Result<(Execution, bool)> {
        let (parent_id, parent_index) = match &execution.parent {
            Some(edge) => (Some(edge.execution_id.clone()), Some(edge.step_index as i32)),
            None => (None, None),
        };

        // Single round trip; on conflict nothing is returned and we read the winner
        let inserted = sqlx::query(
            r#"
            INSERT INTO executions (
                id, workflow_name, args, status,
                parent_execution_id, parent_step_index, depth, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.workflow_name)
        .bind(&execution.args)
        .bind(execution.status)
        .bind(parent_id)
        .bind(parent_index)
        .bind(execution.depth as i32)
        .bind(execution.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((execution_from_row(&row)?, true));
        }

        let existing = self
            .get_execution(&execution.id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution.id.clone()))?;
        Ok((existing, false))
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    async fn finish_execution(
        &self,
        execution_id: &str,
        outcome: &StepOutcome,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let (status, result, error) = match outcome {
            StepOutcome::Success(value) => ("completed", Some(value.clone()), None),
            StepOutcome::Failure(error) => ("failed", None, Some(serde_json::to_value(error)?)),
        };

        let updated = sqlx::query(
            r#"
            UPDATE executions
            SET status = $1,
                result = $2,
                error = $3,
                completed_at = $4
            WHERE id = $5
              AND status = 'running'
            "#,
        )
        .bind(status)
        .bind(result)
        .bind(error)
        .bind(completed_at)
        .bind(execution_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 && self.get_execution(execution_id).await?.is_none() {
            return Err(Error::ExecutionNotFound(execution_id.to_string()));
        }

        Ok(updated == 1)
    }

    async fn list_executions(&self, filter: ExecutionListFilter) -> Result<Vec<Execution>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR workflow_name = $2)
            ORDER BY created_at DESC, id ASC
            LIMIT $3
            "#,
        )
        .bind(filter.status)
        .bind(filter.workflow_name)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Execution>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE parent_execution_id = $1
            ORDER BY parent_step_index ASC
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn claim_execution(
        &self,
        execution_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        // The row lock taken by UPDATE serializes competing claimers
        let claimed = sqlx::query(
            r#"
            UPDATE executions
            SET claimed_by = $2,
                claim_expires_at = $4
            WHERE id = $1
              AND (claimed_by IS NULL OR claimed_by = $2 OR claim_expires_at < $3)
            "#,
        )
        .bind(execution_id)
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed == 0 && self.get_execution(execution_id).await?.is_none() {
            return Err(Error::ExecutionNotFound(execution_id.to_string()));
        }

        Ok(claimed == 1)
    }

    async fn release_execution(&self, execution_id: &str, owner: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET claimed_by = NULL,
                claim_expires_at = NULL
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(execution_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TimerStore for PostgresStore {
    async fn schedule_timer(&self, timer: Timer) -> Result<Timer> {
        sqlx::query(
            r#"
            INSERT INTO timers (promise_id, execution_id, step_index, fire_at, duration_ms)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (promise_id) DO NOTHING
            "#,
        )
        .bind(&timer.promise_id)
        .bind(&timer.execution_id)
        .bind(timer.step_index as i32)
        .bind(timer.fire_at)
        .bind(i64::try_from(timer.duration_ms).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM timers WHERE promise_id = $1")
            .bind(&timer.promise_id)
            .fetch_one(&self.pool)
            .await?;

        timer_from_row(&row)
    }

    async fn due_timers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM timers
            WHERE fire_at <= $1
            ORDER BY fire_at ASC, promise_id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(timer_from_row).collect()
    }

    async fn delete_timer(&self, promise_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM timers WHERE promise_id = $1")
            .bind(promise_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_timers_for_execution(&self, execution_id: &str) -> Result<usize> {
        let deleted = sqlx::query("DELETE FROM timers WHERE execution_id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted as usize)
    }

    async fn next_fire_at(&self) -> Result<Option<DateTime<Utc>>> {
        let next: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT MIN(fire_at) FROM timers")
            .fetch_one(&self.pool)
            .await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{run_input, StepKind};
    use serde_json::json;

    async fn test_store() -> PostgresStore {
        let config = crate::config::Config::load().unwrap();
        let pool = crate::db::create_pool(&config.database).await.unwrap();
        crate::db::migrate(&pool).await.unwrap();
        PostgresStore::new(pool)
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database to be running
    async fn test_history_round_trip_and_conflict() {
        let store = test_store().await;
        let execution_id = format!("pg-{}", uuid::Uuid::new_v4());

        let record = StepRecord {
            index: 0,
            kind: StepKind::Run,
            input: run_input("notify", &json!(["http://x", "Countdown: 3"])),
            outcome: StepOutcome::Success(json!(null)),
            completed_at: Utc::now(),
        };
        store.append(&execution_id, record.clone()).await.unwrap();
        store.append(&execution_id, record.clone()).await.unwrap();

        let mut different = record.clone();
        different.outcome = StepOutcome::Success(json!("other"));
        let err = store.append(&execution_id, different).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let records = store.read(&execution_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].same_content(&record));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database to be running
    async fn test_execution_lifecycle() {
        let store = test_store().await;
        let id = format!("pg-{}", uuid::Uuid::new_v4());

        let (_, created) = store
            .create_execution(Execution::new(&id, "factorial", json!([3])))
            .await
            .unwrap();
        assert!(created);

        let (_, created) = store
            .create_execution(Execution::new(&id, "factorial", json!([3])))
            .await
            .unwrap();
        assert!(!created);

        assert!(store
            .finish_execution(&id, &StepOutcome::Success(json!(6)), Utc::now())
            .await
            .unwrap());
        let execution = store.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.result, Some(json!(6)));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database to be running
    async fn test_claim_is_exclusive_across_owners() {
        let store = test_store().await;
        let id = format!("pg-{}", uuid::Uuid::new_v4());
        store
            .create_execution(Execution::new(&id, "factorial", json!([3])))
            .await
            .unwrap();

        let now = Utc::now();
        let lease = now + chrono::Duration::seconds(30);
        assert!(store.claim_execution(&id, "runtime-a", now, lease).await.unwrap());
        assert!(!store.claim_execution(&id, "runtime-b", now, lease).await.unwrap());

        store.release_execution(&id, "runtime-a").await.unwrap();
        assert!(store.claim_execution(&id, "runtime-b", now, lease).await.unwrap());
    }
}
