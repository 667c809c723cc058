//! Turso database storage
//!
//! Persists dead-letter jobs, circuit breaker transitions and recovery metrics
//! to a local SQLite file or a remote Turso database, creating the schema on
//! open. Timestamps are RFC 3339 text with fixed microsecond precision so that
//! string comparison orders them correctly.

use super::{
    CircuitBreakerEventRecord, CircuitEventStore, DeadLetterStore, RecoveryMetricRecord,
    RecoveryMetricsStore,
};
use crate::dead_letter::models::{DeadLetterJob, JobFilter, StatsFilter, StoreStats};
use crate::error::{ResilienceError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Row, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Turso database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TursoConfig {
    /// `file:` path for local SQLite or `libsql://` URL for remote Turso
    pub database_url: String,
    /// Authentication token, required for remote databases
    pub auth_token: String,
}

impl Default for TursoConfig {
    fn default() -> Self {
        Self {
            database_url: "file:resilience.db".to_string(),
            auth_token: String::new(),
        }
    }
}

const JOB_COLUMNS: &str = "id, original_job_id, job_type, job_data, failure_reason, error_message, \
     retry_count, max_retries, first_failed_at, last_failed_at, next_retry_at, priority, \
     company_id, recovery_attempts, auto_recovery_enabled, metadata, created_at, updated_at";

/// Storage backed by libsql
pub struct TursoStore {
    _database: Arc<Database>,
    connection: Arc<RwLock<Connection>>,
}

impl TursoStore {
    /// Open the database and create tables and indexes if missing
    pub async fn open(config: &TursoConfig) -> Result<Self> {
        info!("Opening Turso store at {}", config.database_url);

        let database = if config.database_url.starts_with("libsql://") {
            if config.auth_token.is_empty() {
                return Err(ResilienceError::config(
                    "Auth token required for remote Turso database",
                ));
            }
            libsql::Builder::new_remote(config.database_url.clone(), config.auth_token.clone())
                .build()
                .await
                .map_err(|e| ResilienceError::storage(format!("Failed to connect to Turso: {e}")))?
        } else {
            let path = config
                .database_url
                .strip_prefix("file:")
                .unwrap_or(&config.database_url)
                .to_string();
            libsql::Builder::new_local(path)
                .build()
                .await
                .map_err(|e| ResilienceError::storage(format!("Failed to open local database: {e}")))?
        };

        let connection = database
            .connect()
            .map_err(|e| ResilienceError::storage(format!("Failed to create connection: {e}")))?;

        let store = Self {
            _database: Arc::new(database),
            connection: Arc::new(RwLock::new(connection)),
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        debug!("Initializing resilience schema");
        let conn = self.connection.write().await;

        let tables = [
            r#"
            CREATE TABLE IF NOT EXISTS dead_letter_jobs (
                id TEXT PRIMARY KEY,
                original_job_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                job_data TEXT NOT NULL,
                failure_reason TEXT NOT NULL,
                error_message TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                first_failed_at TEXT NOT NULL,
                last_failed_at TEXT NOT NULL,
                next_retry_at TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                company_id TEXT,
                recovery_attempts INTEGER NOT NULL DEFAULT 0,
                auto_recovery_enabled INTEGER NOT NULL DEFAULT 1,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS circuit_breaker_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                circuit_name TEXT NOT NULL,
                previous_state TEXT NOT NULL,
                new_state TEXT NOT NULL,
                trigger_reason TEXT NOT NULL,
                failure_count INTEGER NOT NULL,
                success_count INTEGER NOT NULL,
                timeout_ms INTEGER,
                recovery_timeout_ms INTEGER NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                company_id TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS recovery_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_name TEXT NOT NULL,
                operation_type TEXT,
                error_category TEXT,
                error_code TEXT,
                recovery_strategy TEXT NOT NULL,
                success INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                circuit_breaker_state TEXT,
                error_message TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                company_id TEXT,
                user_id TEXT,
                request_id TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        ];

        for sql in &tables {
            conn.execute(sql, ())
                .await
                .map_err(|e| ResilienceError::storage(format!("Failed to create table: {e}")))?;
        }

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_dlq_pending ON dead_letter_jobs(auto_recovery_enabled, next_retry_at)",
            "CREATE INDEX IF NOT EXISTS idx_dlq_priority ON dead_letter_jobs(priority DESC, created_at ASC)",
            "CREATE INDEX IF NOT EXISTS idx_dlq_company ON dead_letter_jobs(company_id)",
            "CREATE INDEX IF NOT EXISTS idx_dlq_job_type ON dead_letter_jobs(job_type)",
            "CREATE INDEX IF NOT EXISTS idx_cb_events_circuit ON circuit_breaker_events(circuit_name, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_recovery_metrics_service ON recovery_metrics(service_name, created_at DESC)",
        ];

        for index_sql in &indexes {
            if let Err(e) = conn.execute(index_sql, ()).await {
                warn!("Failed to create index: {} - {}", index_sql, e);
            }
        }

        info!("Resilience schema initialized");
        Ok(())
    }

    async fn query_jobs(&self, sql: &str, params: Vec<Value>) -> Result<Vec<DeadLetterJob>> {
        let conn = self.connection.read().await;
        let mut rows = conn
            .prepare(sql)
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to prepare query: {e}")))?
            .query(params)
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to execute query: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to fetch row: {e}")))?
        {
            jobs.push(job_from_row(&row)?);
        }
        Ok(jobs)
    }
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ResilienceError::storage(format!("Invalid timestamp '{value}': {e}")))
}

fn opt_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |v| Value::Text(v.to_string()))
}

fn text_column(row: &Row, idx: i32, name: &str) -> Result<String> {
    row.get::<String>(idx)
        .map_err(|e| ResilienceError::storage(format!("Failed to get {name}: {e}")))
}

fn int_column(row: &Row, idx: i32, name: &str) -> Result<i64> {
    row.get::<i64>(idx)
        .map_err(|e| ResilienceError::storage(format!("Failed to get {name}: {e}")))
}

fn opt_column(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Text(s) => Ok(Some(s)),
        _ => Ok(None),
    }
}

fn json_column(row: &Row, idx: i32, name: &str) -> Result<serde_json::Value> {
    let raw = text_column(row, idx, name)?;
    Ok(serde_json::from_str(&raw)?)
}

fn job_from_row(row: &Row) -> Result<DeadLetterJob> {
    let id = text_column(row, 0, "id")?;
    Ok(DeadLetterJob {
        id: Uuid::parse_str(&id)
            .map_err(|e| ResilienceError::storage(format!("Invalid job id '{id}': {e}")))?,
        original_job_id: text_column(row, 1, "original_job_id")?,
        job_type: text_column(row, 2, "job_type")?,
        job_data: json_column(row, 3, "job_data")?,
        failure_reason: text_column(row, 4, "failure_reason")?,
        error_message: text_column(row, 5, "error_message")?,
        retry_count: int_column(row, 6, "retry_count")? as u32,
        max_retries: int_column(row, 7, "max_retries")? as u32,
        first_failed_at: parse_timestamp(&text_column(row, 8, "first_failed_at")?)?,
        last_failed_at: parse_timestamp(&text_column(row, 9, "last_failed_at")?)?,
        next_retry_at: parse_timestamp(&text_column(row, 10, "next_retry_at")?)?,
        priority: int_column(row, 11, "priority")? as i32,
        company_id: opt_column(row, 12)?,
        recovery_attempts: int_column(row, 13, "recovery_attempts")? as u32,
        auto_recovery_enabled: int_column(row, 14, "auto_recovery_enabled")? != 0,
        metadata: json_column(row, 15, "metadata")?,
        created_at: parse_timestamp(&text_column(row, 16, "created_at")?)?,
        updated_at: parse_timestamp(&text_column(row, 17, "updated_at")?)?,
    })
}

/// `WHERE` fragment and parameters for tenant / job type scoping
fn scope_clause(
    company_id: Option<&str>,
    job_type: Option<&str>,
    params: &mut Vec<Value>,
) -> String {
    let mut clauses = Vec::new();
    if let Some(company) = company_id {
        params.push(Value::Text(company.to_string()));
        clauses.push(format!("company_id = ?{}", params.len()));
    }
    if let Some(job_type) = job_type {
        params.push(Value::Text(job_type.to_string()));
        clauses.push(format!("job_type = ?{}", params.len()));
    }
    clauses.join(" AND ")
}

#[async_trait::async_trait]
impl DeadLetterStore for TursoStore {
    async fn insert_job(&self, job: &DeadLetterJob) -> Result<()> {
        let conn = self.connection.write().await;
        let sql = format!(
            "INSERT INTO dead_letter_jobs ({JOB_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
        );

        conn.execute(
            &sql,
            vec![
                Value::Text(job.id.to_string()),
                Value::Text(job.original_job_id.clone()),
                Value::Text(job.job_type.clone()),
                Value::Text(serde_json::to_string(&job.job_data)?),
                Value::Text(job.failure_reason.clone()),
                Value::Text(job.error_message.clone()),
                Value::Integer(i64::from(job.retry_count)),
                Value::Integer(i64::from(job.max_retries)),
                Value::Text(timestamp(job.first_failed_at)),
                Value::Text(timestamp(job.last_failed_at)),
                Value::Text(timestamp(job.next_retry_at)),
                Value::Integer(i64::from(job.priority)),
                opt_text(job.company_id.as_deref()),
                Value::Integer(i64::from(job.recovery_attempts)),
                Value::Integer(i64::from(job.auto_recovery_enabled)),
                Value::Text(serde_json::to_string(&job.metadata)?),
                Value::Text(timestamp(job.created_at)),
                Value::Text(timestamp(job.updated_at)),
            ],
        )
        .await
        .map_err(|e| ResilienceError::storage(format!("Failed to insert dead-letter job: {e}")))?;

        debug!(job_id = %job.id, "Inserted dead-letter job");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<DeadLetterJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM dead_letter_jobs WHERE id = ?1");
        Ok(self
            .query_jobs(&sql, vec![Value::Text(id.to_string())])
            .await?
            .into_iter()
            .next())
    }

    async fn update_job(&self, job: &DeadLetterJob) -> Result<()> {
        let conn = self.connection.write().await;
        let sql = r#"
            UPDATE dead_letter_jobs SET
                failure_reason = ?2,
                error_message = ?3,
                retry_count = ?4,
                max_retries = ?5,
                last_failed_at = ?6,
                next_retry_at = ?7,
                priority = ?8,
                recovery_attempts = ?9,
                auto_recovery_enabled = ?10,
                metadata = ?11,
                updated_at = ?12
            WHERE id = ?1
        "#;

        let changed = conn
            .execute(
                sql,
                vec![
                    Value::Text(job.id.to_string()),
                    Value::Text(job.failure_reason.clone()),
                    Value::Text(job.error_message.clone()),
                    Value::Integer(i64::from(job.retry_count)),
                    Value::Integer(i64::from(job.max_retries)),
                    Value::Text(timestamp(job.last_failed_at)),
                    Value::Text(timestamp(job.next_retry_at)),
                    Value::Integer(i64::from(job.priority)),
                    Value::Integer(i64::from(job.recovery_attempts)),
                    Value::Integer(i64::from(job.auto_recovery_enabled)),
                    Value::Text(serde_json::to_string(&job.metadata)?),
                    Value::Text(timestamp(job.updated_at)),
                ],
            )
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to update dead-letter job: {e}")))?;

        if changed == 0 {
            return Err(ResilienceError::not_found(format!("dead-letter job {}", job.id)));
        }
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool> {
        let conn = self.connection.write().await;
        let changed = conn
            .execute(
                "DELETE FROM dead_letter_jobs WHERE id = ?1",
                libsql::params![id.to_string()],
            )
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to delete dead-letter job: {e}")))?;
        Ok(changed > 0)
    }

    async fn fetch_pending(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeadLetterJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM dead_letter_jobs \
             WHERE auto_recovery_enabled = 1 AND next_retry_at <= ?1 \
             ORDER BY priority DESC, created_at ASC LIMIT ?2"
        );
        self.query_jobs(
            &sql,
            vec![Value::Text(timestamp(now)), Value::Integer(limit as i64)],
        )
        .await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<DeadLetterJob>> {
        let mut params = Vec::new();
        let mut where_clause =
            scope_clause(filter.company_id.as_deref(), filter.job_type.as_deref(), &mut params);
        if let Some(enabled) = filter.auto_recovery_enabled {
            params.push(Value::Integer(i64::from(enabled)));
            if !where_clause.is_empty() {
                where_clause.push_str(" AND ");
            }
            where_clause.push_str(&format!("auto_recovery_enabled = ?{}", params.len()));
        }

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM dead_letter_jobs");
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause);
        }
        sql.push_str(" ORDER BY priority DESC, created_at ASC");
        if let Some(limit) = filter.limit {
            params.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }

        self.query_jobs(&sql, params).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.connection.write().await;
        let removed = conn
            .execute(
                "DELETE FROM dead_letter_jobs WHERE created_at < ?1",
                libsql::params![timestamp(cutoff)],
            )
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to delete old jobs: {e}")))?;
        Ok(removed)
    }

    async fn stats(&self, filter: &StatsFilter, now: DateTime<Utc>) -> Result<StoreStats> {
        let mut params = vec![Value::Text(timestamp(now))];
        let scope = scope_clause(filter.company_id.as_deref(), filter.job_type.as_deref(), &mut params);
        let where_clause = if scope.is_empty() {
            String::new()
        } else {
            format!(" WHERE {scope}")
        };

        let conn = self.connection.read().await;

        let totals_sql = format!(
            "SELECT COUNT(*), \
             COALESCE(SUM(CASE WHEN auto_recovery_enabled = 1 AND next_retry_at <= ?1 THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN auto_recovery_enabled = 1 AND next_retry_at > ?1 THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN auto_recovery_enabled = 0 THEN 1 ELSE 0 END), 0), \
             COALESCE(AVG(retry_count), 0.0), \
             MIN(first_failed_at) \
             FROM dead_letter_jobs{where_clause}"
        );
        let mut rows = conn
            .prepare(&totals_sql)
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to prepare stats query: {e}")))?
            .query(params)
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to execute stats query: {e}")))?;

        let mut stats = StoreStats::default();
        if let Some(row) = rows
            .next()
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to fetch row: {e}")))?
        {
            stats.total = int_column(&row, 0, "total")? as u64;
            stats.pending = int_column(&row, 1, "pending")? as u64;
            stats.scheduled = int_column(&row, 2, "scheduled")? as u64;
            stats.exhausted = int_column(&row, 3, "exhausted")? as u64;
            stats.average_retry_count = match row.get_value(4)? {
                Value::Real(avg) => avg,
                Value::Integer(avg) => avg as f64,
                _ => 0.0,
            };
            stats.oldest_failed_at = opt_column(&row, 5)?
                .map(|s| parse_timestamp(&s))
                .transpose()?;
        }

        let mut type_params = Vec::new();
        let type_scope = scope_clause(
            filter.company_id.as_deref(),
            filter.job_type.as_deref(),
            &mut type_params,
        );
        let by_type_sql = if type_scope.is_empty() {
            "SELECT job_type, COUNT(*) FROM dead_letter_jobs GROUP BY job_type".to_string()
        } else {
            format!("SELECT job_type, COUNT(*) FROM dead_letter_jobs WHERE {type_scope} GROUP BY job_type")
        };
        let mut rows = conn
            .prepare(&by_type_sql)
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to prepare stats query: {e}")))?
            .query(type_params)
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to execute stats query: {e}")))?;

        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| ResilienceError::storage(format!("Failed to fetch row: {e}")))?
        {
            let job_type = text_column(&row, 0, "job_type")?;
            let count = int_column(&row, 1, "count")?;
            stats.by_job_type.insert(job_type, count as u64);
        }

        Ok(stats)
    }
}

#[async_trait::async_trait]
impl CircuitEventStore for TursoStore {
    async fn record_transition(&self, event: CircuitBreakerEventRecord) -> Result<()> {
        let conn = self.connection.write().await;
        conn.execute(
            r#"
            INSERT INTO circuit_breaker_events (
                circuit_name, previous_state, new_state, trigger_reason, failure_count,
                success_count, timeout_ms, recovery_timeout_ms, metadata, company_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            vec![
                Value::Text(event.circuit_name),
                Value::Text(event.previous_state.as_str().to_string()),
                Value::Text(event.new_state.as_str().to_string()),
                Value::Text(event.trigger_reason),
                Value::Integer(i64::from(event.failure_count)),
                Value::Integer(i64::from(event.success_count)),
                event
                    .timeout_ms
                    .map_or(Value::Null, |ms| Value::Integer(ms as i64)),
                Value::Integer(event.recovery_timeout_ms as i64),
                Value::Text(serde_json::to_string(&event.metadata)?),
                opt_text(event.company_id.as_deref()),
                Value::Text(timestamp(event.created_at)),
            ],
        )
        .await
        .map_err(|e| ResilienceError::storage(format!("Failed to record transition: {e}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecoveryMetricsStore for TursoStore {
    async fn record_metric(&self, metric: RecoveryMetricRecord) -> Result<()> {
        let conn = self.connection.write().await;
        conn.execute(
            r#"
            INSERT INTO recovery_metrics (
                service_name, operation_type, error_category, error_code, recovery_strategy,
                success, attempts, duration_ms, circuit_breaker_state, error_message, metadata,
                company_id, user_id, request_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            vec![
                Value::Text(metric.service_name),
                opt_text(metric.operation_type.as_deref()),
                opt_text(metric.error_category.as_deref()),
                opt_text(metric.error_code.as_deref()),
                Value::Text(metric.recovery_strategy),
                Value::Integer(i64::from(metric.success)),
                Value::Integer(i64::from(metric.attempts)),
                Value::Integer(metric.duration_ms as i64),
                opt_text(metric.circuit_breaker_state.map(|s| s.as_str())),
                opt_text(metric.error_message.as_deref()),
                Value::Text(serde_json::to_string(&metric.metadata)?),
                opt_text(metric.company_id.as_deref()),
                opt_text(metric.user_id.as_deref()),
                opt_text(metric.request_id.as_deref()),
                Value::Text(timestamp(metric.created_at)),
            ],
        )
        .await
        .map_err(|e| ResilienceError::storage(format!("Failed to record recovery metric: {e}")))?;
        Ok(())
    }
}
