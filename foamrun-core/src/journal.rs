//! Persistent record of container runs.

use crate::error::Result;
use chrono::{DateTime, Utc};
use foamrun_model::{RunRecord, RunStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    case_name TEXT NOT NULL,
    tutorial TEXT NOT NULL,
    command TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration REAL
)";

/// Journal of container runs backed by a local SQLite file. Rows are
/// inserted when a container starts and finalized exactly once when its
/// stream terminates.
#[derive(Debug, Clone)]
pub struct RunJournal {
    pool: SqlitePool,
}

impl RunJournal {
    /// Open (creating if necessary) the journal database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory journal for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a new `Running` row, returning its id.
    pub async fn record_start(
        &self,
        case_name: &str,
        tutorial: &str,
        command: &str,
        start_time: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO runs (case_name, tutorial, command, status, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(case_name)
        .bind(tutorial)
        .bind(command)
        .bind(RunStatus::Running.as_str())
        .bind(start_time)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Finalize a run with its terminal status, end time, and duration in
    /// seconds.
    pub async fn record_end(
        &self,
        id: i64,
        status: RunStatus,
        end_time: DateTime<Utc>,
        duration: f64,
    ) -> Result<()> {
        sqlx::query("UPDATE runs SET status = ?1, end_time = ?2, duration = ?3 WHERE id = ?4")
            .bind(status.as_str())
            .bind(end_time)
            .bind(duration)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All runs, newest first.
    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            "SELECT id, case_name, tutorial, command, status, start_time, end_time, duration
             FROM runs ORDER BY start_time DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RunRecord {
                id: row.get("id"),
                case_name: row.get("case_name"),
                tutorial: row.get("tutorial"),
                command: row.get("command"),
                status: row
                    .get::<String, _>("status")
                    .parse()
                    .unwrap_or(RunStatus::Failed),
                start_time: row.get("start_time"),
                end_time: row.get("end_time"),
                duration: row.get("duration"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn start_then_finalize_round_trip() {
        let journal = RunJournal::open_in_memory().await.unwrap();
        let start = Utc::now();
        let id = journal
            .record_start("cavity", "incompressible/cavity", "./Allrun", start)
            .await
            .unwrap();

        let end = start + Duration::seconds(30);
        journal
            .record_end(id, RunStatus::Completed, end, 30.0)
            .await
            .unwrap();

        let runs = journal.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.id, id);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.end_time.is_some());
        assert_eq!(run.duration, Some(30.0));
    }

    #[tokio::test]
    async fn failed_exit_is_recorded() {
        let journal = RunJournal::open_in_memory().await.unwrap();
        let start = Utc::now();
        let id = journal
            .record_start("cavity", "incompressible/cavity", "foamRun", start)
            .await
            .unwrap();
        journal
            .record_end(
                id,
                RunStatus::from_exit_code(137),
                start + Duration::seconds(1),
                1.0,
            )
            .await
            .unwrap();

        let runs = journal.list_runs().await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn listing_is_newest_first() {
        let journal = RunJournal::open_in_memory().await.unwrap();
        let base = Utc::now();
        journal
            .record_start("older", "t/older", "blockMesh", base - Duration::minutes(10))
            .await
            .unwrap();
        journal
            .record_start("newer", "t/newer", "blockMesh", base)
            .await
            .unwrap();

        let runs = journal.list_runs().await.unwrap();
        assert_eq!(runs[0].case_name, "newer");
        assert_eq!(runs[1].case_name, "older");
        assert_eq!(runs[1].status, RunStatus::Running);
        assert!(runs[1].end_time.is_none());
    }

    #[tokio::test]
    async fn opens_database_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("runs.db");
        let journal = RunJournal::open(&db).await.unwrap();
        journal
            .record_start("c", "t", "blockMesh", Utc::now())
            .await
            .unwrap();
        assert!(db.exists());
    }
}
