use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::{
    error::{Result, ScanError},
    models::{FindingRecord, FindingStatus, JobKind, JobStatus, MonitoredTarget, ScanJob},
};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn create_pool(url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    Ok(SqlitePoolOptions::new().connect_with(options).await?)
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Narrow key/value interface the scheduler persists its state through.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, sqlx::Error>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), sqlx::Error>;
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub target: String,
    pub kind: JobKind,
    pub config: serde_json::Value,
    pub log_path: Option<String>,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFinish {
    pub exit_code: Option<i64>,
    pub failure_kind: Option<String>,
    pub failure_reason: Option<String>,
    pub inserted: i64,
    pub updated: i64,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct FindingFilter {
    pub severity: Option<String>,
    pub status: Option<FindingStatus>,
    pub scan_id: Option<String>,
    pub limit: Option<i64>,
}

impl FindingFilter {
    /// Stable cache key; every key starts with `findings`.
    pub fn cache_key(&self) -> String {
        format!(
            "findings:{}:{}:{}:{}",
            self.severity.as_deref().unwrap_or("*"),
            self.status.map(FindingStatus::as_str).unwrap_or("*"),
            self.scan_id.as_deref().unwrap_or("*"),
            self.limit.unwrap_or(500)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// A private in-memory database with migrations applied. A single
    /// connection keeps every query on the same memory instance.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn add_target(&self, address: &str) -> Result<MonitoredTarget> {
        let inserted = sqlx::query(
            "INSERT INTO monitored_targets(address, scheduler_enabled, tool_enabled, total_findings_count, created_at) VALUES(?, 1, 0, 0, ?) ON CONFLICT(address) DO NOTHING",
        )
        .bind(address)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(ScanError::Validation(format!("target already monitored: {address}")));
        }
        self.target(inserted.last_insert_rowid()).await
    }

    pub async fn target(&self, id: i64) -> Result<MonitoredTarget> {
        sqlx::query_as::<_, MonitoredTarget>("SELECT * FROM monitored_targets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("target {id}")))
    }

    pub async fn target_by_address(&self, address: &str) -> Result<Option<MonitoredTarget>> {
        Ok(
            sqlx::query_as::<_, MonitoredTarget>("SELECT * FROM monitored_targets WHERE address = ?")
                .bind(address)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_targets(&self) -> Result<Vec<MonitoredTarget>> {
        Ok(
            sqlx::query_as::<_, MonitoredTarget>("SELECT * FROM monitored_targets ORDER BY address ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Targets eligible for scheduled runs, least recently scanned first.
    pub async fn scheduler_targets(&self) -> Result<Vec<MonitoredTarget>> {
        Ok(sqlx::query_as::<_, MonitoredTarget>(
            "SELECT * FROM monitored_targets WHERE scheduler_enabled = 1 ORDER BY COALESCE(last_scan_date, '') ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn set_scheduler_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.update_target_flag("scheduler_enabled", id, enabled).await
    }

    pub async fn set_tool_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.update_target_flag("tool_enabled", id, enabled).await
    }

    async fn update_target_flag(&self, column: &'static str, id: i64, enabled: bool) -> Result<()> {
        let res = sqlx::query(&format!("UPDATE monitored_targets SET {column} = ? WHERE id = ?"))
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(ScanError::NotFound(format!("target {id}")));
        }
        Ok(())
    }

    pub async fn delete_target(&self, id: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM monitored_targets WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(ScanError::NotFound(format!("target {id}")));
        }
        Ok(())
    }

    /// Stamps the last scan time and recounts the findings attributed to the
    /// target. Addresses that are not monitored are ignored.
    pub async fn record_target_scan(&self, address: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE monitored_targets SET last_scan_date = ?, total_findings_count = (SELECT COUNT(*) FROM findings f JOIN scan_jobs j ON f.scan_id = j.id WHERE j.target = monitored_targets.address) WHERE address = ?",
        )
        .bind(at)
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_job(&self, job: &NewJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO scan_jobs(id, target, kind, status, config, start_time, log_path, output_path) VALUES(?, ?, ?, 'queued', ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.target)
        .bind(job.kind.as_str())
        .bind(job.config.to_string())
        .bind(Utc::now())
        .bind(&job.log_path)
        .bind(&job.output_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_running(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE scan_jobs SET status = 'running', start_time = ? WHERE id = ? AND status = 'queued'")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves a job into a terminal state. Jobs that already finished are left
    /// untouched; returns whether this call performed the transition.
    pub async fn finish_job(&self, id: &str, status: JobStatus, finish: &JobFinish) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let res = sqlx::query(
            "UPDATE scan_jobs SET status = ?, end_time = ?, exit_code = ?, failure_kind = ?, failure_reason = ?, inserted_count = ?, updated_count = ? WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(finish.exit_code)
        .bind(&finish.failure_kind)
        .bind(&finish.failure_reason)
        .bind(finish.inserted)
        .bind(finish.updated)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Jobs left queued or running by a previous process can never finish;
    /// mark them failed so they stay queryable.
    pub async fn fail_interrupted_jobs(&self) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE scan_jobs SET status = 'failed', end_time = ?, failure_kind = 'process', failure_reason = 'interrupted by restart' WHERE status IN ('queued', 'running')",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn job(&self, id: &str) -> Result<ScanJob> {
        sqlx::query_as::<_, ScanJob>("SELECT * FROM scan_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("job {id}")))
    }

    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<ScanJob>> {
        Ok(
            sqlx::query_as::<_, ScanJob>("SELECT * FROM scan_jobs ORDER BY start_time DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn finding(&self, id: i64) -> Result<FindingRecord> {
        sqlx::query_as::<_, FindingRecord>("SELECT * FROM findings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("finding {id}")))
    }

    pub async fn list_findings(&self, filter: &FindingFilter) -> Result<Vec<FindingRecord>> {
        Ok(sqlx::query_as::<_, FindingRecord>(
            "SELECT * FROM findings WHERE (?1 IS NULL OR severity = ?1) AND (?2 IS NULL OR status = ?2) AND (?3 IS NULL OR scan_id = ?3) ORDER BY id DESC LIMIT ?4",
        )
        .bind(&filter.severity)
        .bind(filter.status.map(FindingStatus::as_str))
        .bind(&filter.scan_id)
        .bind(filter.limit.unwrap_or(500))
        .fetch_all(&self.pool)
        .await?)
    }

    /// Names of the findings first seen by `scan_id`.
    pub async fn new_finding_names(&self, scan_id: &str) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT name FROM findings WHERE scan_id = ? AND first_seen = last_seen ORDER BY id ASC",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn count_findings(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM findings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn set_finding_status(&self, id: i64, status: FindingStatus) -> Result<()> {
        let res = sqlx::query("UPDATE findings SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(ScanError::NotFound(format!("finding {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for Database {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO settings(key, value) VALUES(?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn targets_are_unique_and_toggleable() {
        let db = Database::in_memory().await.unwrap();
        let t = db.add_target("example.com").await.unwrap();
        assert!(t.scheduler_enabled);
        assert!(!t.tool_enabled);
        assert!(matches!(
            db.add_target("example.com").await,
            Err(ScanError::Validation(_))
        ));

        db.set_scheduler_enabled(t.id, false).await.unwrap();
        assert!(db.scheduler_targets().await.unwrap().is_empty());
        assert!(matches!(
            db.set_tool_enabled(999, true).await,
            Err(ScanError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn scheduler_targets_prefer_oldest_scan() {
        let db = Database::in_memory().await.unwrap();
        let a = db.add_target("a.test").await.unwrap();
        db.add_target("b.test").await.unwrap();
        db.record_target_scan("a.test", Utc::now()).await.unwrap();

        let order: Vec<String> = db
            .scheduler_targets()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.address)
            .collect();
        assert_eq!(order, vec!["b.test", "a.test"]);
        assert!(db.target(a.id).await.unwrap().last_scan_date.is_some());
    }

    #[tokio::test]
    async fn terminal_jobs_are_immutable() {
        let db = Database::in_memory().await.unwrap();
        db.insert_job(&NewJob {
            id: "job-1".into(),
            target: "a.test".into(),
            kind: JobKind::Scan,
            config: serde_json::json!({}),
            log_path: None,
            output_path: None,
        })
        .await
        .unwrap();
        db.mark_running("job-1").await.unwrap();
        assert!(db
            .finish_job("job-1", JobStatus::Stopped, &JobFinish::default())
            .await
            .unwrap());
        assert!(!db
            .finish_job("job-1", JobStatus::Completed, &JobFinish::default())
            .await
            .unwrap());
        assert_eq!(db.job("job-1").await.unwrap().status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn settings_upsert_preserves_other_keys() {
        let db = Database::in_memory().await.unwrap();
        db.set_setting("a", "1").await.unwrap();
        db.set_setting("b", "2").await.unwrap();
        db.set_setting("a", "3").await.unwrap();
        assert_eq!(db.get_setting("a").await.unwrap().as_deref(), Some("3"));
        assert_eq!(db.get_setting("b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(db.get_setting("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn interrupted_jobs_fail_on_recovery() {
        let db = Database::in_memory().await.unwrap();
        db.insert_job(&NewJob {
            id: "job-2".into(),
            target: "a.test".into(),
            kind: JobKind::Scan,
            config: serde_json::json!({}),
            log_path: None,
            output_path: None,
        })
        .await
        .unwrap();
        assert_eq!(db.fail_interrupted_jobs().await.unwrap(), 1);
        let job = db.job("job-2").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some("interrupted by restart"));
    }
}
