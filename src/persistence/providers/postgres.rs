use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::domain::events::{EventKind, RunEvent};
use crate::domain::runs::{Run, RunStatus};
use crate::domain::threads::{Thread, ThreadStatus};
use crate::persistence::{EventLog, MetadataStore};

/// Statuses that freeze a run row; `update_run_status` refuses to move past
/// any of these.
const TERMINAL_STATUSES: [&str; 4] = ["completed", "failed", "cancelled", "interrupted"];

#[derive(Debug)]
pub struct PostgresProvider {
    pool: PgPool,
}

impl PostgresProvider {
    pub async fn new(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }

    fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<Run> {
        let status: String = row.try_get("status")?;
        Ok(Run {
            run_id: row.try_get("run_id")?,
            thread_id: row.try_get("thread_id")?,
            assistant_id: row.try_get("assistant_id")?,
            status: RunStatus::parse(&status)
                .with_context(|| format!("unknown run status in store: {status}"))?,
            input: row.try_get("input")?,
            config: row.try_get("config")?,
            output: row.try_get("output")?,
            error_message: row.try_get("error_message")?,
            user_id: row.try_get("user_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<RunEvent> {
        let kind: String = row.try_get("kind")?;
        let sequence: i64 = row.try_get("sequence")?;
        Ok(RunEvent {
            run_id: row.try_get("run_id")?,
            sequence: u64::try_from(sequence)?,
            kind: EventKind::parse(&kind)
                .with_context(|| format!("unknown event kind in store: {kind}"))?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl MetadataStore for PostgresProvider {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs
                (run_id, thread_id, assistant_id, status, input, config, user_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.thread_id)
        .bind(&run.assistant_id)
        .bind(run.status.as_str())
        .bind(&run.input)
        .bind(&run.config)
        .bind(&run.user_id)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::run_from_row(&r)).transpose()
    }

    async fn list_runs(&self, user_id: &str) -> Result<Vec<Run>> {
        let rows = sqlx::query("SELECT * FROM runs WHERE user_id = $1 ORDER BY created_at")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = $2,
                output = COALESCE($3, output),
                error_message = COALESCE($4, error_message),
                updated_at = NOW()
            WHERE run_id = $1 AND status <> ALL($5)
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(TERMINAL_STATUSES.map(String::from).to_vec())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                run_id,
                requested = status.as_str(),
                "status update skipped (missing run or terminal status)"
            );
        }
        Ok(())
    }

    async fn upsert_thread(&self, thread: &Thread) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO threads (thread_id, status, metadata, user_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (thread_id) DO UPDATE SET
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            "#,
        )
        .bind(&thread.thread_id)
        .bind(thread.status.as_str())
        .bind(&thread.metadata)
        .bind(&thread.user_id)
        .bind(thread.created_at)
        .bind(thread.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        let row = sqlx::query("SELECT * FROM threads WHERE thread_id = $1")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let status: String = r.try_get("status")?;
            Ok(Thread {
                thread_id: r.try_get("thread_id")?,
                status: ThreadStatus::parse(&status)
                    .with_context(|| format!("unknown thread status in store: {status}"))?,
                metadata: r.try_get("metadata")?,
                user_id: r.try_get("user_id")?,
                created_at: r.try_get("created_at")?,
                updated_at: r.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> Result<()> {
        sqlx::query("UPDATE threads SET status = $2, updated_at = NOW() WHERE thread_id = $1")
            .bind(thread_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EventLog for PostgresProvider {
    async fn append(
        &self,
        run_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<RunEvent> {
        // Sequence assignment races under concurrent appends for the same
        // run; the (run_id, sequence) primary key catches the loser, which
        // retries with a fresh MAX.
        for _ in 0..8 {
            let result = sqlx::query(
                r#"
                INSERT INTO run_events (run_id, sequence, kind, payload, created_at)
                SELECT $1, COALESCE(MAX(sequence), 0) + 1, $2, $3, NOW()
                FROM run_events WHERE run_id = $1
                RETURNING sequence, created_at
                "#,
            )
            .bind(run_id)
            .bind(kind.as_str())
            .bind(&payload)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => {
                    let sequence: i64 = row.try_get("sequence")?;
                    let created_at: DateTime<Utc> = row.try_get("created_at")?;
                    return Ok(RunEvent {
                        run_id: run_id.to_string(),
                        sequence: u64::try_from(sequence)?,
                        kind,
                        payload,
                        created_at,
                    });
                }
                Err(e) => {
                    let unique_violation = e
                        .as_database_error()
                        .is_some_and(|db| db.is_unique_violation());
                    if !unique_violation {
                        return Err(e.into());
                    }
                }
            }
        }
        bail!("could not assign event sequence for run {run_id} after retries");
    }

    async fn read_since(&self, run_id: &str, last_sequence: Option<u64>) -> Result<Vec<RunEvent>> {
        let floor = i64::try_from(last_sequence.unwrap_or(0))?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM run_events
            WHERE run_id = $1 AND sequence > $2
            ORDER BY sequence
            "#,
        )
        .bind(run_id)
        .bind(floor)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::event_from_row).collect()
    }

    async fn read_all(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        self.read_since(run_id, None).await
    }

    async fn purge(&self, run_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM run_events WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, ttl: Duration) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM run_events WHERE created_at < NOW() - make_interval(secs => $1)")
                .bind(ttl.as_secs_f64())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
