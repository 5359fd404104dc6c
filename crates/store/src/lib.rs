//! Durable relational storage for Users, ApiKeys, and Jobs.
//!
//! This crate owns the only SQL in the workspace. It exposes a narrow set of
//! primitive operations per entity and no business logic: callers (the
//! `sandbox` controller, the `auth` authenticator, the `api` handlers)
//! decide what the data means. Every operation is one transaction.

use std::{path::Path, str::FromStr, sync::Once};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyPoolOptions, migrate::MigrateError, AnyPool, Row};
use thiserror::Error;
use uuid::Uuid;

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Supported database backends for the persistence layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseDriver {
    Sqlite,
    Postgres,
}

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: AnyPool,
    driver: DatabaseDriver,
}

impl Database {
    /// Establishes (or creates) a connection pool for the given database URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        static DRIVERS: Once = Once::new();
        DRIVERS.call_once(|| {
            sqlx::any::install_default_drivers();
        });

        let driver = if database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://")
        {
            DatabaseDriver::Postgres
        } else {
            DatabaseDriver::Sqlite
        };

        let max_connections = match driver {
            DatabaseDriver::Sqlite if database_url.contains(":memory:") => 1,
            _ => 8,
        };

        let pool = AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        if driver == DatabaseDriver::Sqlite {
            sqlx::query("PRAGMA busy_timeout = ?; PRAGMA foreign_keys = ON;")
                .bind(SQLITE_BUSY_TIMEOUT_MS as i64)
                .execute(&pool)
                .await
                .ok();
        }

        let migration_result = match driver {
            DatabaseDriver::Sqlite => sqlx::migrate!("./migrations").run(&pool).await,
            DatabaseDriver::Postgres => sqlx::migrate!("./migrations_postgres").run(&pool).await,
        };
        if let Err(err) = migration_result {
            match &err {
                MigrateError::Execute(sqlx::Error::Database(db_err))
                    if db_err
                        .code()
                        .map(|code| matches!(code.as_ref(), "2067" | "1555" | "23505"))
                        .unwrap_or(false) => {}
                _ => return Err(err.into()),
            }
        }

        Ok(Self { pool, driver })
    }

    /// Connects to a file path via `sqlite://` scheme, creating the file if absent.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        Self::connect(&url).await
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn driver(&self) -> DatabaseDriver {
        self.driver
    }

    // ---------------------------------------------------------------- users

    pub async fn create_user(&self, new: NewUser<'_>) -> Result<UserRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO users (id, display_name, email, created_at, is_active) VALUES (?, ?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO users (id, display_name, email, created_at, is_active) VALUES ($1, $2, $3, $4, $5)"
            }
        };
        let result = sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(new.display_name)
            .bind(new.email)
            .bind(encode_datetime(now))
            .bind(true)
            .execute(&self.pool)
            .await;

        if let Err(sqlx::Error::Database(db_err)) = &result {
            if is_unique_violation_db(db_err.as_ref()) {
                return Err(
                    StoreError::Conflict(format!("email '{}' already in use", new.email)).into(),
                );
            }
        }
        result?;

        self.get_user(id)
            .await?
            .ok_or_else(|| anyhow!("user inserted but missing when reloaded ({id})"))
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<UserRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM users WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM users WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user).transpose()
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM users WHERE email = ?",
            DatabaseDriver::Postgres => "SELECT * FROM users WHERE email = $1",
        };
        let row = sqlx::query(select)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_user).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(map_user).collect()
    }

    pub async fn set_user_active(&self, id: Uuid, active: bool) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => "UPDATE users SET is_active = ? WHERE id = ?",
            DatabaseDriver::Postgres => "UPDATE users SET is_active = $1 WHERE id = $2",
        };
        sqlx::query(update)
            .bind(active)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------- api keys

    pub async fn create_api_key(&self, new: NewApiKey<'_>) -> Result<ApiKeyRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
                INSERT INTO api_keys (id, user_id, key_hash, name, created_at, last_used_at, is_active)
                VALUES (?, ?, ?, ?, ?, NULL, ?)
                "#
            }
            DatabaseDriver::Postgres => {
                r#"
                INSERT INTO api_keys (id, user_id, key_hash, name, created_at, last_used_at, is_active)
                VALUES ($1, $2, $3, $4, $5, NULL, $6)
                "#
            }
        };
        let result = sqlx::query(insert)
            .bind(encode_uuid(id))
            .bind(encode_uuid(new.user_id))
            .bind(new.key_hash)
            .bind(new.name)
            .bind(encode_datetime(now))
            .bind(true)
            .execute(&self.pool)
            .await;

        if let Err(sqlx::Error::Database(db_err)) = &result {
            if is_unique_violation_db(db_err.as_ref()) {
                return Err(StoreError::Conflict("key_hash collision".into()).into());
            }
        }
        result?;

        self.get_api_key(id)
            .await?
            .ok_or_else(|| anyhow!("api key inserted but missing when reloaded ({id})"))
    }

    async fn get_api_key(&self, id: Uuid) -> Result<Option<ApiKeyRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM api_keys WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM api_keys WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_api_key).transpose()
    }

    pub async fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM api_keys WHERE key_hash = ?",
            DatabaseDriver::Postgres => "SELECT * FROM api_keys WHERE key_hash = $1",
        };
        let row = sqlx::query(select)
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_api_key).transpose()
    }

    pub async fn list_api_keys_by_user(&self, user_id: Uuid) -> Result<Vec<ApiKeyRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM api_keys WHERE user_id = ? ORDER BY created_at DESC"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM api_keys WHERE user_id = $1 ORDER BY created_at DESC"
            }
        };
        let rows = sqlx::query(select)
            .bind(encode_uuid(user_id))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(map_api_key).collect()
    }

    pub async fn revoke_api_key(&self, id: Uuid) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => "UPDATE api_keys SET is_active = ? WHERE id = ?",
            DatabaseDriver::Postgres => "UPDATE api_keys SET is_active = $1 WHERE id = $2",
        };
        sqlx::query(update)
            .bind(false)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_api_key_last_used(&self, id: Uuid, timestamp: DateTime<Utc>) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => "UPDATE api_keys SET last_used_at = ? WHERE id = ?",
            DatabaseDriver::Postgres => "UPDATE api_keys SET last_used_at = $1 WHERE id = $2",
        };
        sqlx::query(update)
            .bind(encode_datetime(timestamp))
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------ jobs

    /// Creates a job in `queued` status. This is the only Job write the API
    /// performs directly; every subsequent transition belongs to the
    /// Controller.
    pub async fn create_job(&self, new: NewJob<'_>) -> Result<JobRecord> {
        let now = Utc::now();
        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
                INSERT INTO jobs (
                    id, status, success, start_time, end_time,
                    sandbox_id, archive_path, user_id, created_at
                ) VALUES (?, 'queued', NULL, NULL, NULL, NULL, ?, ?, ?)
                "#
            }
            DatabaseDriver::Postgres => {
                r#"
                INSERT INTO jobs (
                    id, status, success, start_time, end_time,
                    sandbox_id, archive_path, user_id, created_at
                ) VALUES ($1, 'queued', NULL, NULL, NULL, NULL, $2, $3, $4)
                "#
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(new.id))
            .bind(new.archive_path)
            .bind(encode_uuid(new.user_id))
            .bind(encode_datetime(now))
            .execute(&self.pool)
            .await?;

        self.get_job(new.id)
            .await?
            .ok_or_else(|| anyhow!("job inserted but missing when reloaded ({})", new.id))
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM jobs WHERE id = ?",
            DatabaseDriver::Postgres => "SELECT * FROM jobs WHERE id = $1",
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_job).transpose()
    }

    /// Transitions a job's status. Missing rows are a silent no-op: the
    /// Controller always re-reads before acting, so this keeps reconciliation
    /// idempotent rather than forcing every caller to branch on existence.
    pub async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        start_time: Option<DateTime<Utc>>,
        sandbox_id: Option<&str>,
    ) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
                UPDATE jobs
                SET status = ?,
                    start_time = COALESCE(?, start_time),
                    sandbox_id = COALESCE(?, sandbox_id)
                WHERE id = ?
                "#
            }
            DatabaseDriver::Postgres => {
                r#"
                UPDATE jobs
                SET status = $1,
                    start_time = COALESCE($2, start_time),
                    sandbox_id = COALESCE($3, sandbox_id)
                WHERE id = $4
                "#
            }
        };
        sqlx::query(update)
            .bind(status.as_str())
            .bind(start_time.map(encode_datetime))
            .bind(sandbox_id)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Freezes a job's terminal outcome. `status` must already be one of the
    /// terminal statuses; callers pass it explicitly so the Store stays free
    /// of business logic about which terminal status applies.
    pub async fn complete_job(
        &self,
        id: Uuid,
        status: JobStatus,
        success: bool,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE jobs SET status = ?, success = ?, end_time = ? WHERE id = ?"
            }
            DatabaseDriver::Postgres => {
                "UPDATE jobs SET status = $1, success = $2, end_time = $3 WHERE id = $4"
            }
        };
        sqlx::query(update)
            .bind(status.as_str())
            .bind(success)
            .bind(encode_datetime(end_time))
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All jobs, newest first by `start_time` (nulls — still-queued jobs — last).
    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let query = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM jobs ORDER BY (start_time IS NULL), start_time DESC"
            }
            DatabaseDriver::Postgres => "SELECT * FROM jobs ORDER BY start_time DESC NULLS LAST",
        };
        let rows = sqlx::query(query).fetch_all(&self.pool).await?;
        rows.into_iter().map(map_job).collect()
    }

    pub async fn list_jobs_by_user(&self, user_id: Uuid) -> Result<Vec<JobRecord>> {
        let query = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM jobs WHERE user_id = ? ORDER BY (start_time IS NULL), start_time DESC"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM jobs WHERE user_id = $1 ORDER BY start_time DESC NULLS LAST"
            }
        };
        let rows = sqlx::query(query)
            .bind(encode_uuid(user_id))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(map_job).collect()
    }
}

// ------------------------------------------------------------------- errors

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
}

fn is_unique_violation_db(db_err: &(dyn sqlx::error::DatabaseError + 'static)) -> bool {
    if let Some(code) = db_err.code() {
        matches!(code.as_ref(), "2067" | "1555" | "23505")
    } else {
        db_err.message().contains("UNIQUE") || db_err.message().contains("unique")
    }
}

// ----------------------------------------------------------------- records

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

pub struct NewUser<'a> {
    pub display_name: &'a str,
    pub email: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub key_hash: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

pub struct NewApiKey<'a> {
    pub user_id: Uuid,
    pub key_hash: &'a str,
    pub name: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(anyhow!("unknown job status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: JobStatus,
    pub success: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub sandbox_id: Option<String>,
    pub archive_path: Option<String>,
    pub user_id: Option<Uuid>,
}

impl JobRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

pub struct NewJob<'a> {
    pub id: Uuid,
    pub archive_path: &'a str,
    pub user_id: Uuid,
}

// ------------------------------------------------------------------ mapping

fn encode_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn encode_uuid(value: Uuid) -> String {
    value.to_string()
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{value}': {err}"))
}

fn parse_uuid(value: String) -> Result<Uuid> {
    Uuid::parse_str(&value).map_err(|err| anyhow!("invalid UUID '{value}': {err}"))
}

fn decode_bool(row: &sqlx::any::AnyRow, column: &str) -> Result<bool> {
    match row.try_get::<bool, _>(column) {
        Ok(value) => Ok(value),
        Err(_) => {
            let raw: i64 = row.try_get(column)?;
            Ok(raw != 0)
        }
    }
}

fn decode_optional_datetime(
    row: &sqlx::any::AnyRow,
    column: &str,
) -> Result<Option<DateTime<Utc>>> {
    row.try_get::<Option<String>, _>(column)?
        .map(parse_datetime)
        .transpose()
}

fn decode_optional_string(row: &sqlx::any::AnyRow, column: &str) -> Result<Option<String>> {
    Ok(row.try_get::<Option<String>, _>(column)?)
}

fn map_user(row: sqlx::any::AnyRow) -> Result<UserRecord> {
    Ok(UserRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        display_name: row.try_get("display_name")?,
        email: row.try_get("email")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        is_active: decode_bool(&row, "is_active")?,
    })
}

fn map_api_key(row: sqlx::any::AnyRow) -> Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        user_id: parse_uuid(row.try_get::<String, _>("user_id")?)?,
        key_hash: row.try_get("key_hash")?,
        name: decode_optional_string(&row, "name")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        last_used_at: decode_optional_datetime(&row, "last_used_at")?,
        is_active: decode_bool(&row, "is_active")?,
    })
}

fn map_job(row: sqlx::any::AnyRow) -> Result<JobRecord> {
    let status: String = row.try_get("status")?;
    Ok(JobRecord {
        id: parse_uuid(row.try_get::<String, _>("id")?)?,
        status: JobStatus::from_str(&status)?,
        success: row.try_get::<Option<bool>, _>("success")?,
        start_time: decode_optional_datetime(&row, "start_time")?,
        end_time: decode_optional_datetime(&row, "end_time")?,
        sandbox_id: decode_optional_string(&row, "sandbox_id")?,
        archive_path: decode_optional_string(&row, "archive_path")?,
        user_id: row
            .try_get::<Option<String>, _>("user_id")?
            .map(parse_uuid)
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Database {
        Database::connect("sqlite::memory:").await.expect("connect")
    }

    #[tokio::test]
    async fn create_and_fetch_user() {
        let db = memory_db().await;
        let user = db
            .create_user(NewUser {
                display_name: "Alice",
                email: "alice@example.com",
            })
            .await
            .expect("create user");

        let fetched = db
            .get_user(user.id)
            .await
            .expect("get user")
            .expect("present");
        assert_eq!(fetched.email, "alice@example.com");
        assert!(fetched.is_active);

        let by_email = db
            .get_user_by_email("alice@example.com")
            .await
            .expect("get by email")
            .expect("present");
        assert_eq!(by_email.id, user.id);
    }

    #[tokio::test]
    async fn duplicate_email_is_conflict() {
        let db = memory_db().await;
        db.create_user(NewUser {
            display_name: "Alice",
            email: "alice@example.com",
        })
        .await
        .expect("first create");

        let err = db
            .create_user(NewUser {
                display_name: "Alice Two",
                email: "alice@example.com",
            })
            .await
            .expect_err("duplicate email should fail");
        assert!(err.downcast_ref::<StoreError>().is_some());
    }

    #[tokio::test]
    async fn api_key_lookup_by_hash() {
        let db = memory_db().await;
        let user = db
            .create_user(NewUser {
                display_name: "Alice",
                email: "alice@example.com",
            })
            .await
            .expect("create user");

        let key = db
            .create_api_key(NewApiKey {
                user_id: user.id,
                key_hash: "deadbeef",
                name: Some("laptop"),
            })
            .await
            .expect("create key");

        let found = db
            .get_api_key_by_hash("deadbeef")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(found.id, key.id);
        assert!(found.is_active);

        db.revoke_api_key(key.id).await.expect("revoke");
        let revoked = db
            .get_api_key_by_hash("deadbeef")
            .await
            .expect("lookup")
            .expect("present");
        assert!(!revoked.is_active);
    }

    #[tokio::test]
    async fn job_lifecycle_round_trip() {
        let db = memory_db().await;
        let user = db
            .create_user(NewUser {
                display_name: "Alice",
                email: "alice@example.com",
            })
            .await
            .expect("create user");

        let job_id = Uuid::new_v4();
        let created = db
            .create_job(NewJob {
                id: job_id,
                archive_path: "/tmp/ci_job_x.zip",
                user_id: user.id,
            })
            .await
            .expect("create job");
        assert_eq!(created.status, JobStatus::Queued);
        assert!(created.success.is_none());
        assert!(!created.is_terminal());

        let start_time = Utc::now();
        db.update_job_status(
            job_id,
            JobStatus::Running,
            Some(start_time),
            Some("prefix_abc"),
        )
        .await
        .expect("update status");

        let running = db.get_job(job_id).await.expect("get").expect("present");
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.sandbox_id.as_deref(), Some("prefix_abc"));
        assert!(running.start_time.is_some());

        let end_time = Utc::now();
        db.complete_job(job_id, JobStatus::Completed, true, end_time)
            .await
            .expect("complete");

        let completed = db.get_job(job_id).await.expect("get").expect("present");
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.success, Some(true));
        assert!(completed.end_time.is_some());
        assert!(completed.is_terminal());
    }

    #[tokio::test]
    async fn list_jobs_by_user_scopes_correctly() {
        let db = memory_db().await;
        let alice = db
            .create_user(NewUser {
                display_name: "Alice",
                email: "alice@example.com",
            })
            .await
            .expect("create alice");
        let bob = db
            .create_user(NewUser {
                display_name: "Bob",
                email: "bob@example.com",
            })
            .await
            .expect("create bob");

        db.create_job(NewJob {
            id: Uuid::new_v4(),
            archive_path: "/tmp/a.zip",
            user_id: alice.id,
        })
        .await
        .expect("create job a");
        db.create_job(NewJob {
            id: Uuid::new_v4(),
            archive_path: "/tmp/b.zip",
            user_id: bob.id,
        })
        .await
        .expect("create job b");

        let alice_jobs = db.list_jobs_by_user(alice.id).await.expect("list");
        assert_eq!(alice_jobs.len(), 1);
        assert_eq!(alice_jobs[0].user_id, Some(alice.id));

        let all = db.list_jobs().await.expect("list all");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn update_status_on_missing_job_is_noop() {
        let db = memory_db().await;
        let result = db
            .update_job_status(Uuid::new_v4(), JobStatus::Running, None, None)
            .await;
        assert!(result.is_ok());
    }
}
