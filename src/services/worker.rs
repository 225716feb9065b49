//! src/services/worker.rs
//!
//! The background drain loop: pop a batch, group it by template, execute
//! each group, and apply the retry policy to failures. Runs until the
//! shutdown flag flips, finishing the in-flight batch before exiting.

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    models::work_item::WorkItem,
    services::{
        executor,
        queue_service::{QueueError, QueueService},
    },
};

/// Run the worker until `shutdown` becomes true.
///
/// The loop stamps the service heartbeat on every iteration, so readiness
/// checks can tell a live-but-idle worker from a stuck one.
pub async fn run(service: QueueService, shutdown: watch::Receiver<bool>) {
    info!(
        batch_max = service.settings.batch_max,
        max_retries = service.settings.max_retries,
        "worker started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }
        service.beat();

        let batch = service
            .queue
            .pop_batch(service.settings.batch_max, service.settings.pop_timeout)
            .await;
        if batch.is_empty() {
            continue;
        }

        for (template_name, items) in group_by_template(batch) {
            // Each group can burn the executor's full lock-retry budget;
            // beat per group so a slow batch never reads as a stuck worker.
            service.beat();
            execute_group(&service, &template_name, items).await;
        }
    }

    info!("worker stopped");
}

/// Group popped items by template name, preserving pop order both across
/// groups (first-seen) and within each group.
fn group_by_template(items: Vec<WorkItem>) -> Vec<(String, Vec<WorkItem>)> {
    let mut groups: Vec<(String, Vec<WorkItem>)> = Vec::new();
    for item in items {
        match groups.iter_mut().find(|(name, _)| *name == item.template) {
            Some((_, group)) => group.push(item),
            None => groups.push((item.template.clone(), vec![item])),
        }
    }
    groups
}

/// Execute one template group, splitting solo templates into singleton
/// transactions so one bad item cannot fail its neighbors.
async fn execute_group(service: &QueueService, template_name: &str, items: Vec<WorkItem>) {
    let template = match service.fetch_template(template_name).await {
        Ok(tpl) => tpl,
        Err(err) => {
            // Template vanished after enqueue; the items get the normal
            // retry treatment in case it is re-registered.
            warn!(template = template_name, error = %err, "failed to load template for batch");
            apply_retry_policy(service, items, &err).await;
            return;
        }
    };

    if template.solo {
        for item in items {
            match executor::execute_batch(&service.db, &template, std::slice::from_ref(&item)).await
            {
                Ok(()) => {
                    service.record_executed(1);
                    debug!(template = template_name, item = %item.id, "executed solo item");
                }
                Err(err) => {
                    warn!(template = template_name, item = %item.id, error = %err, "solo item failed");
                    apply_retry_policy(service, vec![item], &err).await;
                }
            }
        }
        return;
    }

    let count = items.len();
    match executor::execute_batch(&service.db, &template, &items).await {
        Ok(()) => {
            service.record_executed(count);
            debug!(template = template_name, count, "executed batch");
        }
        Err(err) => {
            warn!(template = template_name, count, error = %err, "batch failed");
            apply_retry_policy(service, items, &err).await;
        }
    }
}

/// The retry policy: every item of a failed batch gets its retry count
/// bumped and its attempt time stamped. Items still under the retry
/// budget go back into their tier (gated by the backoff rule); the rest
/// are dead-lettered.
async fn apply_retry_policy(service: &QueueService, items: Vec<WorkItem>, err: &QueueError) {
    let now = Utc::now();
    let error_text = err.to_string();

    for mut item in items {
        item.record_failure(now);
        if item.retry_count < service.settings.max_retries {
            debug!(
                item = %item.id,
                template = %item.template,
                retry_count = item.retry_count,
                "re-enqueueing failed item"
            );
            service.record_retried(1);
            service.queue.push(item);
        } else {
            error!(
                item = %item.id,
                template = %item.template,
                retry_count = item.retry_count,
                error = %error_text,
                "abandoning item after max retries"
            );
            if let Err(db_err) = service.abandon(&item, &error_text).await {
                error!(item = %item.id, error = %db_err, "failed to persist dead letter");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::work_item::Priority;
    use crate::services::queue_service::WorkerSettings;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use std::{sync::Arc, time::Duration};

    const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

    async fn test_service(max_retries: u32) -> QueueService {
        let pool: SqlitePool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for stmt in INIT_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        sqlx::query("CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();

        QueueService::new(
            Arc::new(pool),
            WorkerSettings {
                max_retries,
                backoff_step: ChronoDuration::zero(),
                batch_max: 16,
                pop_timeout: Duration::from_millis(10),
            },
        )
    }

    async fn run_worker_for(service: &QueueService, millis: u64) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(service.clone(), rx));
        tokio::time::sleep(Duration::from_millis(millis)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn grouping_preserves_first_seen_order() {
        let items = vec![
            WorkItem::new("a".into(), vec![], Priority::High),
            WorkItem::new("b".into(), vec![], Priority::High),
            WorkItem::new("a".into(), vec![], Priority::Low),
        ];
        let groups = group_by_template(items);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "a");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "b");
    }

    #[tokio::test]
    async fn worker_drains_and_executes_items() {
        let service = test_service(3).await;
        service
            .register_template(
                "insert_event",
                "INSERT INTO events (id, kind) VALUES (?, ?)",
                2,
                false,
            )
            .await
            .unwrap();

        for i in 0..5i64 {
            service
                .enqueue("insert_event", vec![json!(i), json!("tick")], Priority::Medium)
                .await
                .unwrap();
        }

        run_worker_for(&service, 100).await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&*service.db)
            .await
            .unwrap();
        assert_eq!(count, 5);

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.executed, 5);
        assert_eq!(stats.abandoned, 0);
        assert_eq!(stats.depths.total(), 0);
        assert!(stats.worker_heartbeat.is_some());
    }

    #[tokio::test]
    async fn failing_item_is_dead_lettered_after_max_retries() {
        let service = test_service(2).await;
        // References a table that does not exist, so every attempt fails.
        service
            .register_template("bad", "INSERT INTO missing (v) VALUES (?)", 1, false)
            .await
            .unwrap();
        service
            .enqueue("bad", vec![json!(1)], Priority::High)
            .await
            .unwrap();

        run_worker_for(&service, 200).await;

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.dead_letters, 1);
        assert_eq!(stats.depths.total(), 0);
        // One retry before abandonment with max_retries = 2.
        assert_eq!(stats.retried, 1);

        let letters = service.dead_letters(None).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].template, "bad");
        assert_eq!(letters[0].retry_count, 2);
        assert!(!letters[0].error.is_empty());
    }

    #[tokio::test]
    async fn solo_template_isolates_bad_items() {
        let service = test_service(1).await;
        service
            .register_template(
                "insert_solo",
                "INSERT INTO events (id, kind) VALUES (?, ?)",
                2,
                true,
            )
            .await
            .unwrap();

        // Same primary key twice: batched execution would roll both back,
        // solo execution commits the first and dead-letters the second.
        service
            .enqueue("insert_solo", vec![json!(1), json!("a")], Priority::High)
            .await
            .unwrap();
        service
            .enqueue("insert_solo", vec![json!(1), json!("b")], Priority::High)
            .await
            .unwrap();

        run_worker_for(&service, 100).await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&*service.db)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.abandoned, 1);
    }

    #[tokio::test]
    async fn requeued_dead_letter_executes() {
        let service = test_service(1).await;
        service
            .register_template("late", "INSERT INTO latecomers (v) VALUES (?)", 1, false)
            .await
            .unwrap();
        service
            .enqueue("late", vec![json!(7)], Priority::Low)
            .await
            .unwrap();

        // Table missing: the item dead-letters on first failure.
        run_worker_for(&service, 100).await;
        let letters = service.dead_letters(None).await.unwrap();
        assert_eq!(letters.len(), 1);

        // Create the table, requeue, and the item goes through.
        sqlx::query("CREATE TABLE latecomers (v INTEGER)")
            .execute(&*service.db)
            .await
            .unwrap();
        service.requeue_dead_letter(letters[0].id).await.unwrap();

        run_worker_for(&service, 100).await;

        let v: i64 = sqlx::query_scalar("SELECT v FROM latecomers")
            .fetch_one(&*service.db)
            .await
            .unwrap();
        assert_eq!(v, 7);
        assert_eq!(service.stats().await.unwrap().dead_letters, 0);
    }
}
