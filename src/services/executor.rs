//! src/services/executor.rs
//!
//! Batch execution against the backing store. One batch = items sharing a
//! template, executed inside a single transaction: all statements commit
//! together or none do. Transient `database is locked` errors are retried
//! in place with bounded exponential backoff before the batch is declared
//! failed; that inner retry is separate from the item-level retry policy
//! the worker applies.

use sqlx::{Sqlite, SqlitePool, query::Query, sqlite::SqliteArguments};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::{
    models::{template::QueryTemplate, work_item::WorkItem},
    services::queue_service::{QueueError, QueueResult},
};

/// Total time budget for in-place retries on a locked database.
const MAX_LOCK_WAIT: Duration = Duration::from_millis(2000);
const LOCK_BACKOFF_INITIAL_MS: u64 = 10;
const LOCK_BACKOFF_MAX_MS: u64 = 1000;

/// Execute every item of a batch in one transaction.
///
/// All items must share `template` (the worker's grouping guarantees
/// this). Param arity is re-checked per item so a template edited after
/// enqueue fails cleanly instead of binding garbage.
pub async fn execute_batch(
    db: &SqlitePool,
    template: &QueryTemplate,
    items: &[WorkItem],
) -> QueueResult<()> {
    for item in items {
        if item.params.len() as i64 != template.param_count {
            return Err(QueueError::ParamArity {
                template: template.name.clone(),
                expected: template.param_count,
                got: item.params.len(),
            });
        }
    }

    let start = Instant::now();
    let mut backoff_ms = LOCK_BACKOFF_INITIAL_MS;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match try_execute(db, template, items).await {
            Ok(()) => return Ok(()),
            Err(err) if is_lock_error(&err) && start.elapsed() < MAX_LOCK_WAIT => {
                warn!(
                    template = %template.name,
                    attempt,
                    backoff_ms,
                    "database locked, retrying batch in place"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(LOCK_BACKOFF_MAX_MS);
            }
            Err(err) => return Err(QueueError::Sqlx(err)),
        }
    }
}

async fn try_execute(
    db: &SqlitePool,
    template: &QueryTemplate,
    items: &[WorkItem],
) -> Result<(), sqlx::Error> {
    let mut tx = db.begin().await?;
    for item in items {
        let mut query = sqlx::query(&template.sql);
        for value in &item.params {
            query = bind_value(query, value);
        }
        query.execute(&mut *tx).await?;
    }
    tx.commit().await
}

/// Bind one JSON param value to the next placeholder.
///
/// Nulls bind as SQL NULL, numbers as INTEGER when they fit in i64 and
/// REAL otherwise, arrays and objects as their JSON text.
fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q serde_json::Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    use serde_json::Value;
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

/// Return true if a SQLx error is SQLite's transient lock error.
fn is_lock_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().contains("database is locked")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::work_item::Priority;
    use chrono::Utc;
    use serde_json::json;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    async fn test_pool() -> SqlitePool {
        // Single connection so every statement sees the same :memory: db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    fn template(sql: &str, param_count: i64) -> QueryTemplate {
        QueryTemplate {
            name: "insert_event".into(),
            sql: sql.into(),
            param_count,
            solo: false,
            created_at: Utc::now(),
        }
    }

    fn item(params: Vec<serde_json::Value>) -> WorkItem {
        WorkItem::new("insert_event".into(), params, Priority::Medium)
    }

    #[tokio::test]
    async fn batch_commits_all_items() {
        let pool = test_pool().await;
        let tpl = template("INSERT INTO events (id, kind) VALUES (?, ?)", 2);
        let items = vec![
            item(vec![json!(1), json!("created")]),
            item(vec![json!(2), json!("updated")]),
            item(vec![json!(3), json!("deleted")]),
        ];

        execute_batch(&pool, &tpl, &items).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn failed_batch_rolls_back_entirely() {
        let pool = test_pool().await;
        let tpl = template("INSERT INTO events (id, kind) VALUES (?, ?)", 2);
        let items = vec![
            item(vec![json!(1), json!("a")]),
            // Duplicate primary key fails the second statement.
            item(vec![json!(1), json!("b")]),
        ];

        let result = execute_batch(&pool, &tpl, &items).await;
        assert!(result.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn arity_mismatch_fails_before_touching_db() {
        let pool = test_pool().await;
        let tpl = template("INSERT INTO events (id, kind) VALUES (?, ?)", 2);
        let items = vec![item(vec![json!(1)])];

        match execute_batch(&pool, &tpl, &items).await {
            Err(QueueError::ParamArity { expected, got, .. }) => {
                assert_eq!(expected, 2);
                assert_eq!(got, 1);
            }
            other => panic!("expected ParamArity, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn locked_database_is_retried_until_free() {
        // A file-backed db with two connections and no busy timeout, so a
        // concurrent writer surfaces `database is locked` immediately and
        // the in-place retry loop has to carry the batch through.
        let path = std::env::temp_dir().join(format!("sql-relay-lock-{}.db", uuid::Uuid::new_v4()));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true)
                    .busy_timeout(Duration::ZERO),
            )
            .await
            .unwrap();
        sqlx::query("CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();

        // Hold the write lock on one pool connection for a while.
        let mut holder = pool.acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *holder)
            .await
            .unwrap();
        sqlx::query("INSERT INTO events (id, kind) VALUES (100, 'held')")
            .execute(&mut *holder)
            .await
            .unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            sqlx::query("COMMIT").execute(&mut *holder).await.unwrap();
        });

        let tpl = template("INSERT INTO events (id, kind) VALUES (?, ?)", 2);
        let items = vec![item(vec![json!(1), json!("queued")])];
        execute_batch(&pool, &tpl, &items).await.unwrap();
        release.await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);

        drop(pool);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn null_and_float_params_bind() {
        let pool = test_pool().await;
        sqlx::query("CREATE TABLE readings (v REAL, note TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        let tpl = QueryTemplate {
            name: "insert_reading".into(),
            sql: "INSERT INTO readings (v, note) VALUES (?, ?)".into(),
            param_count: 2,
            solo: false,
            created_at: Utc::now(),
        };
        let items = vec![item(vec![json!(1.5), serde_json::Value::Null])];

        execute_batch(&pool, &tpl, &items).await.unwrap();

        let v: f64 = sqlx::query_scalar("SELECT v FROM readings")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(v, 1.5);
    }
}
