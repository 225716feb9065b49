//! src/services/queue_service.rs
//!
//! QueueService — shared state and operations for the tiered retry queue,
//! backed by SQLite for durable metadata (templates, dead letters) and an
//! in-process TieredQueue for pending items. The queue itself is not
//! durable; abandoned items are, so nothing that failed repeatedly is
//! silently lost.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    models::{
        dead_letter::DeadLetter,
        template::QueryTemplate,
        work_item::{Priority, WorkItem},
    },
    services::tiered_queue::{TierDepths, TieredQueue},
};

const TEMPLATE_NAME_MAX_LEN: usize = 64;
const DEAD_LETTER_DEFAULT_LIMIT: usize = 100;
const DEAD_LETTER_MAX_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("template `{0}` not found")]
    UnknownTemplate(String),
    #[error("template `{name}` invalid: {reason}")]
    InvalidTemplate { name: String, reason: String },
    #[error("template `{template}` takes {expected} params, got {got}")]
    ParamArity {
        template: String,
        expected: i64,
        got: usize,
    },
    #[error("dead letter `{0}` not found")]
    DeadLetterNotFound(Uuid),
    #[error("stored params are not a JSON array: {0}")]
    CorruptParams(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Tuning knobs the worker and service share. All come from config.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Failures allowed before an item is dead-lettered.
    pub max_retries: u32,
    /// Backoff unit: a retried item waits `backoff_step * retry_count`.
    pub backoff_step: ChronoDuration,
    /// Maximum items per popped batch.
    pub batch_max: usize,
    /// How long a pop blocks before re-checking eligibility.
    pub pop_timeout: Duration,
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    retried: AtomicU64,
    abandoned: AtomicU64,
    // Unix millis of the worker's last loop iteration; 0 = never.
    heartbeat_ms: AtomicI64,
}

/// Snapshot returned by `GET /stats`.
#[derive(Debug, serde::Serialize)]
pub struct QueueStats {
    pub depths: TierDepths,
    pub executed: u64,
    pub retried: u64,
    pub abandoned: u64,
    pub dead_letters: i64,
    pub worker_heartbeat: Option<DateTime<Utc>>,
}

/// QueueService provides the queue's operational surface:
/// - Register / list query templates (durable, SQLite)
/// - Enqueue work items (validated against their template)
/// - Stats snapshot for observability
/// - Dead-letter listing and operator requeue
///
/// The struct is cheap to clone; all state is behind Arcs so handlers and
/// the worker share one queue and one set of counters.
#[derive(Clone)]
pub struct QueueService {
    /// Shared SQLite pool for templates, dead letters, and item execution.
    pub db: Arc<SqlitePool>,

    /// The in-process tiered queue the worker drains.
    pub queue: Arc<TieredQueue>,

    pub settings: WorkerSettings,

    counters: Arc<Counters>,
}

impl QueueService {
    pub fn new(db: Arc<SqlitePool>, settings: WorkerSettings) -> Self {
        let queue = Arc::new(TieredQueue::new(settings.backoff_step));
        Self {
            db,
            queue,
            settings,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Template name validation: short, lowercase, no whitespace.
    ///
    /// Keeps names safe to embed in logs and URLs without escaping.
    fn ensure_template_name_safe(&self, name: &str) -> QueueResult<()> {
        if name.is_empty() || name.len() > TEMPLATE_NAME_MAX_LEN {
            return Err(QueueError::InvalidTemplate {
                name: name.to_string(),
                reason: format!("must be 1-{} characters", TEMPLATE_NAME_MAX_LEN),
            });
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-'))
        {
            return Err(QueueError::InvalidTemplate {
                name: name.to_string(),
                reason: "allowed characters are lowercase letters, digits, underscore, and hyphen"
                    .into(),
            });
        }
        Ok(())
    }

    /// Register or replace a query template.
    ///
    /// `param_count` must match the number of `?` placeholders in the SQL.
    /// The placeholder count is a plain character scan; templates whose
    /// string literals contain `?` are not supported.
    pub async fn register_template(
        &self,
        name: &str,
        sql: &str,
        param_count: i64,
        solo: bool,
    ) -> QueueResult<QueryTemplate> {
        self.ensure_template_name_safe(name)?;

        let placeholders = sql.matches('?').count() as i64;
        if placeholders != param_count {
            return Err(QueueError::InvalidTemplate {
                name: name.to_string(),
                reason: format!(
                    "declares {} params but SQL has {} placeholders",
                    param_count, placeholders
                ),
            });
        }

        let template = sqlx::query_as::<_, QueryTemplate>(
            r#"
            INSERT INTO templates (name, sql, param_count, solo, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                sql = excluded.sql,
                param_count = excluded.param_count,
                solo = excluded.solo
            RETURNING name, sql, param_count, solo, created_at
            "#,
        )
        .bind(name)
        .bind(sql)
        .bind(param_count)
        .bind(solo)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        Ok(template)
    }

    /// List all registered templates, ordered by name.
    pub async fn list_templates(&self) -> QueueResult<Vec<QueryTemplate>> {
        let templates = sqlx::query_as::<_, QueryTemplate>(
            "SELECT name, sql, param_count, solo, created_at FROM templates ORDER BY name",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(templates)
    }

    /// Fetch one template by name. Returns UnknownTemplate if missing.
    pub async fn fetch_template(&self, name: &str) -> QueueResult<QueryTemplate> {
        sqlx::query_as::<_, QueryTemplate>(
            "SELECT name, sql, param_count, solo, created_at FROM templates WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => QueueError::UnknownTemplate(name.to_string()),
            other => QueueError::Sqlx(other),
        })
    }

    /// Enqueue a work item into its priority tier.
    ///
    /// Validates that the template exists and that the param array length
    /// matches the template's arity, so the worker never pops an item it
    /// cannot bind.
    pub async fn enqueue(
        &self,
        template: &str,
        params: Vec<serde_json::Value>,
        priority: Priority,
    ) -> QueueResult<Uuid> {
        let tpl = self.fetch_template(template).await?;
        if params.len() as i64 != tpl.param_count {
            return Err(QueueError::ParamArity {
                template: template.to_string(),
                expected: tpl.param_count,
                got: params.len(),
            });
        }

        let item = WorkItem::new(tpl.name, params, priority);
        let id = item.id;
        debug!(item = %id, template, priority = priority.as_str(), "enqueued work item");
        self.queue.push(item);
        Ok(id)
    }

    /// Stats snapshot: queue depths, lifetime counters, dead-letter count,
    /// and the worker's last heartbeat.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let dead_letters = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&*self.db)
            .await?;

        Ok(QueueStats {
            depths: self.queue.depths(),
            executed: self.counters.executed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            dead_letters,
            worker_heartbeat: self.heartbeat(),
        })
    }

    /// Newest-first page of abandoned items.
    pub async fn dead_letters(&self, limit: Option<usize>) -> QueueResult<Vec<DeadLetter>> {
        let limit = limit
            .unwrap_or(DEAD_LETTER_DEFAULT_LIMIT)
            .clamp(1, DEAD_LETTER_MAX_LIMIT);
        let rows = sqlx::query_as::<_, DeadLetter>(
            "SELECT id, template, params, priority, retry_count, error, enqueued_at, abandoned_at
             FROM dead_letters ORDER BY abandoned_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Persist an abandoned item. Called by the worker after the retry
    /// budget is exhausted.
    pub async fn abandon(&self, item: &WorkItem, error: &str) -> QueueResult<()> {
        let params = serde_json::Value::Array(item.params.clone()).to_string();
        sqlx::query(
            "INSERT INTO dead_letters
                 (id, template, params, priority, retry_count, error, enqueued_at, abandoned_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(item.id)
        .bind(&item.template)
        .bind(&params)
        .bind(item.priority)
        .bind(item.retry_count as i64)
        .bind(error)
        .bind(item.enqueued_at)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Move one dead letter back into the live queue.
    ///
    /// Deletes the durable row and re-enqueues the item under its
    /// original id with the retry count reset to zero, so the item stays
    /// traceable across its dead-letter history. The delete and the
    /// re-read run in one transaction so a concurrent requeue of the
    /// same id cannot enqueue the item twice.
    pub async fn requeue_dead_letter(&self, id: Uuid) -> QueueResult<Uuid> {
        let mut tx = self.db.begin().await?;

        let row = sqlx::query_as::<_, DeadLetter>(
            "SELECT id, template, params, priority, retry_count, error, enqueued_at, abandoned_at
             FROM dead_letters WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => QueueError::DeadLetterNotFound(id),
            other => QueueError::Sqlx(other),
        })?;

        let deleted = sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(QueueError::DeadLetterNotFound(id));
        }

        let params: Vec<serde_json::Value> = serde_json::from_str(&row.params)?;
        tx.commit().await?;

        let item = WorkItem {
            id: row.id,
            template: row.template,
            params,
            priority: row.priority,
            retry_count: 0,
            enqueued_at: Utc::now(),
            last_attempt: None,
        };
        self.queue.push(item);
        Ok(id)
    }

    pub fn record_executed(&self, count: usize) {
        self.counters
            .executed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_retried(&self, count: usize) {
        self.counters
            .retried
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Stamp the worker heartbeat with the current time.
    pub fn beat(&self) {
        self.counters
            .heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Last worker heartbeat, or None if the worker never ran.
    pub fn heartbeat(&self) -> Option<DateTime<Utc>> {
        match self.counters.heartbeat_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}
