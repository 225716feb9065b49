//! HTTP handlers for template and queue operations.
//! Thin JSON layer; all validation and queue concerns live in
//! `QueueService`.

use crate::{
    errors::AppError,
    models::work_item::Priority,
    services::queue_service::QueueService,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// Request body for `POST /templates`.
#[derive(Debug, Deserialize)]
pub struct RegisterTemplateReq {
    pub name: String,
    pub sql: String,
    pub param_count: i64,
    #[serde(default)]
    pub solo: bool,
}

/// Request body for `POST /items`.
#[derive(Debug, Deserialize)]
pub struct EnqueueReq {
    pub template: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
    #[serde(default = "default_priority")]
    pub priority: Priority,
}

fn default_priority() -> Priority {
    Priority::Medium
}

/// Query params accepted by `GET /dead-letters`.
#[derive(Debug, Deserialize)]
pub struct DeadLettersQuery {
    pub limit: Option<usize>,
}

/// POST `/templates` — register or replace a query template.
pub async fn register_template(
    State(service): State<QueueService>,
    Json(req): Json<RegisterTemplateReq>,
) -> Result<impl IntoResponse, AppError> {
    let template = service
        .register_template(&req.name, &req.sql, req.param_count, req.solo)
        .await?;
    Ok((StatusCode::CREATED, Json(template)))
}

/// GET `/templates` — list registered templates.
pub async fn list_templates(
    State(service): State<QueueService>,
) -> Result<impl IntoResponse, AppError> {
    let templates = service.list_templates().await?;
    Ok(Json(templates))
}

/// POST `/items` — enqueue a work item; 202 with the assigned id.
pub async fn enqueue_item(
    State(service): State<QueueService>,
    Json(req): Json<EnqueueReq>,
) -> Result<impl IntoResponse, AppError> {
    let id = service
        .enqueue(&req.template, req.params, req.priority)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))))
}

/// GET `/stats` — queue depths, counters, and worker heartbeat.
pub async fn get_stats(
    State(service): State<QueueService>,
) -> Result<impl IntoResponse, AppError> {
    let stats = service.stats().await?;
    Ok(Json(stats))
}

/// GET `/dead-letters` — newest-first page of abandoned items.
pub async fn list_dead_letters(
    State(service): State<QueueService>,
    Query(q): Query<DeadLettersQuery>,
) -> Result<impl IntoResponse, AppError> {
    let letters = service.dead_letters(q.limit).await?;
    Ok(Json(letters))
}

/// POST `/dead-letters/{id}/requeue` — move an abandoned item back into
/// the live queue with a fresh retry budget.
pub async fn requeue_dead_letter(
    State(service): State<QueueService>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let new_id = service.requeue_dead_letter(id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": new_id }))))
}
