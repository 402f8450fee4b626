//! SQLite implementation of `FeedbackRepository`.
//!
//! This provides persistent storage that survives service restarts.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.
//!
//! # Layout
//!
//! Records are stored as JSON in `record_json`, with the fields the engine
//! queries on (business, status, revision, deadline) extracted into indexed
//! columns. When adding fields to `FeedbackRecord`, use `#[serde(default)]`
//! so old rows still deserialize. All timestamps are i64 milliseconds.
//!
//! # Atomicity
//!
//! Redemption, quota-checked creation, compare-and-set and job claiming each
//! run inside one `BEGIN IMMEDIATE` transaction, which takes SQLite's write
//! lock up front so concurrent writers serialize instead of deadlocking on
//! lock upgrade.

mod jobs;
mod records;
mod requests;


use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::warn;
use verdict_core::{
    BusinessId, FeedbackRecord, FeedbackRequest, Plan, PlanTier, RecordId, RequestToken,
};

use super::{
    CasOutcome, CreateRecordOutcome, FeedbackRepository, InsertRequestOutcome, PlanSource,
    RedeemOutcome, RepositoryError,
};
use crate::jobs::{Job, JobCounts, JobState, NewJob};

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 2;

/// SQLite-backed feedback repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteRepository {
    /// Database connection. Exposed as `pub(crate)` for test access to
    /// manipulate rows directly.
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Create a new SQLite repository at the given path.
    ///
    /// Creates the database file and schema if they don't exist.
    /// Runs any pending migrations if the database exists but has an older schema.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for better concurrency and crash safety
    /// - `synchronous = FULL` for maximum durability (survives OS/power failure)
    /// - `busy_timeout = 5000ms` so lock contention waits instead of failing
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();

        // Ensure parent directory exists (unless it's :memory: or empty path)
        let path_str = path_ref.to_string_lossy();
        if path_str != ":memory:" && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;

                    // Customer contacts live in this directory, including in
                    // the WAL/SHM files SQLite creates with the default umask.
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let dir_permissions = std::fs::Permissions::from_mode(0o700);
                        if let Err(e) = std::fs::set_permissions(parent, dir_permissions) {
                            warn!(
                                "Failed to set restrictive permissions on state directory: {}",
                                e
                            );
                        }
                    }
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        #[cfg(unix)]
        if path_str != ":memory:" && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite can silently keep DELETE mode on filesystems without shared
        // memory support, so the returned journal mode must be checked.
        // In-memory databases report "memory", which is expected.
        let is_in_memory = path_str == ":memory:";
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'. \
                     This can happen on filesystems that don't support shared memory \
                     (e.g., some network filesystems).",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        #[cfg(unix)]
        if path_str != ":memory:" && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);

            for suffix in ["-wal", "-shm"] {
                let sidecar = format!("{}{}", path_str, suffix);
                if Path::new(&sidecar).exists() {
                    if let Err(e) = std::fs::set_permissions(&sidecar, permissions.clone()) {
                        warn!(
                            "Failed to set restrictive permissions on {}: {}",
                            sidecar, e
                        );
                    }
                }
            }
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        // 0 if the table is empty (fresh database)
        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // Version 1: requests, records and plans
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS feedback_requests (
                    token TEXT PRIMARY KEY,
                    business_id TEXT NOT NULL,
                    order_id TEXT NOT NULL,
                    customer_contact TEXT NOT NULL,
                    status TEXT NOT NULL,
                    expires_at INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    responded_at INTEGER,
                    UNIQUE (business_id, order_id, customer_contact)
                );

                CREATE INDEX IF NOT EXISTS idx_requests_pending_expiry
                    ON feedback_requests(expires_at) WHERE status = 'pending';

                CREATE TABLE IF NOT EXISTS feedback_records (
                    id TEXT PRIMARY KEY,
                    business_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    revision INTEGER NOT NULL,
                    auto_publish_at INTEGER,
                    order_key TEXT UNIQUE,
                    request_token TEXT UNIQUE,
                    created_at INTEGER NOT NULL,
                    record_json TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_records_business
                    ON feedback_records(business_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_records_due
                    ON feedback_records(auto_publish_at) WHERE status = 'pending_moderation';

                CREATE TABLE IF NOT EXISTS plans (
                    business_id TEXT PRIMARY KEY,
                    tier TEXT NOT NULL,
                    review_limit INTEGER NOT NULL
                );
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        // Version 2: durable job queue for auto-publish, reminders and notifications
        if from_version < 2 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    dedupe_key TEXT NOT NULL UNIQUE,
                    kind_json TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'queued',
                    run_at INTEGER NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    lease_until INTEGER,
                    last_error TEXT,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(state, run_at);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Create a new in-memory SQLite repository (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }

    /// Like `with_conn`, inside a `BEGIN IMMEDIATE` transaction that commits
    /// when `f` returns `Ok`.
    async fn with_write_tx<T, F>(
        &self,
        operation: &'static str,
        f: F,
    ) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        self.with_conn(operation, move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err(operation))?;
            let value = f(&tx)?;
            tx.commit().map_err(sql_err(operation))?;
            Ok(value)
        })
        .await
    }
}

// =============================================================================
// Conversion helpers
// =============================================================================

pub(super) fn sql_err(operation: &'static str) -> impl Fn(rusqlite::Error) -> RepositoryError {
    move |e| RepositoryError::storage(operation, e.to_string())
}

pub(super) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(super) fn from_millis(millis: i64, what: &str) -> Result<DateTime<Utc>, RepositoryError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| RepositoryError::corruption(format!("{} timestamp {}", what, millis)))
}

/// Convert a usize limit to i64 for SQLite LIMIT clause.
///
/// Very large usize values would wrap to negative i64 with `as`, which
/// SQLite treats as "no limit".
pub(super) fn usize_to_i64_limit(
    limit: usize,
    operation: &'static str,
) -> Result<i64, RepositoryError> {
    i64::try_from(limit).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("limit {} exceeds maximum storable value ({})", limit, i64::MAX),
        )
    })
}

// =============================================================================
// FeedbackRepository trait implementation
// =============================================================================

#[async_trait]
impl FeedbackRepository for SqliteRepository {
    async fn insert_request(
        &self,
        request: &FeedbackRequest,
        jobs: &[NewJob],
    ) -> Result<InsertRequestOutcome, RepositoryError> {
        let request = request.clone();
        let jobs = jobs.to_vec();
        self.with_write_tx("insert request", move |conn| {
            let outcome = requests::insert_request_sync(conn, &request)?;
            if outcome == InsertRequestOutcome::Inserted {
                jobs::enqueue_sync(conn, &jobs, request.created_at)?;
            }
            Ok(outcome)
        })
        .await
    }

    async fn get_request(
        &self,
        token: &RequestToken,
    ) -> Result<Option<FeedbackRequest>, RepositoryError> {
        let token = token.clone();
        self.with_conn("get request", move |conn| {
            requests::get_request_sync(conn, &token)
        })
        .await
    }

    async fn expire_request(
        &self,
        token: &RequestToken,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let token = token.clone();
        self.with_conn("expire request", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE feedback_requests SET status = 'expired'
                     WHERE token = ?1 AND status = 'pending' AND expires_at < ?2",
                    params![token.0, to_millis(now)],
                )
                .map_err(sql_err("expire request"))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn expire_stale_requests(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
        self.with_conn("expire stale requests", move |conn| {
            conn.execute(
                "UPDATE feedback_requests SET status = 'expired'
                 WHERE status = 'pending' AND expires_at < ?1",
                params![to_millis(now)],
            )
            .map_err(sql_err("expire stale requests"))
        })
        .await
    }

    async fn mark_request_invalid(&self, token: &RequestToken) -> Result<bool, RepositoryError> {
        let token = token.clone();
        self.with_conn("mark request invalid", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE feedback_requests SET status = 'invalid'
                     WHERE token = ?1 AND status = 'pending'",
                    params![token.0],
                )
                .map_err(sql_err("mark request invalid"))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn redeem_request(
        &self,
        token: &RequestToken,
        record: &FeedbackRecord,
        now: DateTime<Utc>,
        review_limit: u32,
        jobs: &[NewJob],
    ) -> Result<RedeemOutcome, RepositoryError> {
        let token = token.clone();
        let record = record.clone();
        let jobs = jobs.to_vec();
        self.with_write_tx("redeem request", move |conn| {
            requests::redeem_sync(conn, &token, &record, now, review_limit, &jobs)
        })
        .await
    }

    async fn create_record(
        &self,
        record: &FeedbackRecord,
        review_limit: u32,
        jobs: &[NewJob],
    ) -> Result<CreateRecordOutcome, RepositoryError> {
        let record = record.clone();
        let jobs = jobs.to_vec();
        self.with_write_tx("create record", move |conn| {
            records::create_sync(conn, &record, review_limit, &jobs)
        })
        .await
    }

    async fn get_record(&self, id: RecordId) -> Result<Option<FeedbackRecord>, RepositoryError> {
        self.with_conn("get record", move |conn| records::get_sync(conn, id))
            .await
    }

    async fn compare_and_set(
        &self,
        expected: &FeedbackRecord,
        updated: &FeedbackRecord,
        jobs: &[NewJob],
    ) -> Result<CasOutcome, RepositoryError> {
        let expected = expected.clone();
        let updated = updated.clone();
        let jobs = jobs.to_vec();
        self.with_write_tx("compare and set", move |conn| {
            records::compare_and_set_sync(conn, &expected, &updated, &jobs)
        })
        .await
    }

    async fn list_due_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FeedbackRecord>, RepositoryError> {
        let limit = usize_to_i64_limit(limit, "list due pending")?;
        self.with_conn("list due pending", move |conn| {
            records::list_due_pending_sync(conn, now, limit)
        })
        .await
    }

    async fn list_business_records(
        &self,
        business: &BusinessId,
    ) -> Result<Vec<FeedbackRecord>, RepositoryError> {
        let business = business.clone();
        self.with_conn("list business records", move |conn| {
            records::list_business_sync(conn, &business)
        })
        .await
    }

    async fn count_business_records(&self, business: &BusinessId) -> Result<u64, RepositoryError> {
        let business = business.clone();
        self.with_conn("count business records", move |conn| {
            records::count_business_sync(conn, &business)
        })
        .await
    }

    async fn put_plan(&self, business: &BusinessId, plan: Plan) -> Result<(), RepositoryError> {
        let business = business.clone();
        self.with_conn("put plan", move |conn| {
            conn.execute(
                "INSERT INTO plans (business_id, tier, review_limit) VALUES (?1, ?2, ?3)
                 ON CONFLICT(business_id) DO UPDATE SET
                     tier = excluded.tier,
                     review_limit = excluded.review_limit",
                params![business.0, plan.tier.as_str(), plan.review_limit],
            )
            .map_err(sql_err("put plan"))?;
            Ok(())
        })
        .await
    }

    async fn enqueue_jobs(
        &self,
        jobs: &[NewJob],
        now: DateTime<Utc>,
    ) -> Result<usize, RepositoryError> {
        let jobs = jobs.to_vec();
        self.with_write_tx("enqueue jobs", move |conn| {
            jobs::enqueue_sync(conn, &jobs, now)
        })
        .await
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Job>, RepositoryError> {
        let limit = usize_to_i64_limit(limit, "claim due jobs")?;
        self.with_write_tx("claim due jobs", move |conn| {
            jobs::claim_due_sync(conn, now, limit, now + lease)
        })
        .await
    }

    async fn complete_job(&self, id: i64) -> Result<(), RepositoryError> {
        self.with_conn("complete job", move |conn| {
            jobs::update_job_sync(
                conn,
                "complete job",
                "UPDATE jobs SET state = 'done', lease_until = NULL WHERE id = ?1",
                params![id],
            )
        })
        .await
    }

    async fn retry_job(
        &self,
        id: i64,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), RepositoryError> {
        let error = error.to_string();
        self.with_conn("retry job", move |conn| {
            jobs::update_job_sync(
                conn,
                "retry job",
                "UPDATE jobs SET state = 'queued', attempts = attempts + 1, run_at = ?2,
                     lease_until = NULL, last_error = ?3
                 WHERE id = ?1",
                params![id, to_millis(run_at), error],
            )
        })
        .await
    }

    async fn release_job(&self, id: i64, run_at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.with_conn("release job", move |conn| {
            jobs::update_job_sync(
                conn,
                "release job",
                "UPDATE jobs SET state = 'queued', run_at = ?2, lease_until = NULL WHERE id = ?1",
                params![id, to_millis(run_at)],
            )
        })
        .await
    }

    async fn bury_job(&self, id: i64, error: &str) -> Result<(), RepositoryError> {
        let error = error.to_string();
        self.with_conn("bury job", move |conn| {
            jobs::update_job_sync(
                conn,
                "bury job",
                "UPDATE jobs SET state = 'buried', attempts = attempts + 1,
                     lease_until = NULL, last_error = ?2
                 WHERE id = ?1",
                params![id, error],
            )
        })
        .await
    }

    async fn job_counts(&self) -> Result<JobCounts, RepositoryError> {
        self.with_conn("job counts", |conn| jobs::counts_sync(conn))
            .await
    }

    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, RepositoryError> {
        let limit = usize_to_i64_limit(limit, "list jobs")?;
        self.with_conn("list jobs", move |conn| {
            jobs::list_sync(conn, state, limit)
        })
        .await
    }
}

#[async_trait]
impl PlanSource for SqliteRepository {
    async fn plan_for(&self, business: &BusinessId) -> Result<Option<Plan>, RepositoryError> {
        let business = business.clone();
        self.with_conn("get plan", move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT tier, review_limit FROM plans WHERE business_id = ?1",
                    params![business.0],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql_err("get plan"))?;

            match row {
                Some((tier, review_limit)) => {
                    let tier: PlanTier = tier
                        .parse()
                        .map_err(|_| RepositoryError::corruption(format!("plan tier '{}'", tier)))?;
                    let review_limit = u32::try_from(review_limit).map_err(|_| {
                        RepositoryError::corruption(format!("review limit {}", review_limit))
                    })?;
                    Ok(Some(Plan { tier, review_limit }))
                }
                None => Ok(None),
            }
        })
        .await
    }
}
