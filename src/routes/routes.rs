//! Defines routes for the queue's operational surface.
//!
//! ## Structure
//! - **Template endpoints**
//!   - `GET  /templates` — list registered templates
//!   - `POST /templates` — register or replace a template
//!
//! - **Queue endpoints**
//!   - `POST /items` — enqueue a work item
//!   - `GET  /stats` — queue depths, counters, worker heartbeat
//!
//! - **Dead-letter endpoints**
//!   - `GET  /dead-letters` — list abandoned items (supports ?limit=)
//!   - `POST /dead-letters/{id}/requeue` — requeue one abandoned item

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        queue_handlers::{
            enqueue_item, get_stats, list_dead_letters, list_templates, register_template,
            requeue_dead_letter,
        },
    },
    services::queue_service::QueueService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for the queue API.
///
/// The router carries shared state (`QueueService`) to all handlers; the
/// same service instance backs the worker loop.
pub fn routes() -> Router<QueueService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Template endpoints
        .route("/templates", get(list_templates).post(register_template))
        // Queue endpoints
        .route("/items", post(enqueue_item))
        .route("/stats", get(get_stats))
        // Dead-letter endpoints
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/{id}/requeue", post(requeue_dead_letter))
}
