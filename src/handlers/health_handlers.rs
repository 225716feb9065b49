//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and the
//!   worker heartbeat

use crate::services::queue_service::QueueService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;

/// Heartbeat older than this marks the worker as stuck. Generous next to
/// the pop timeout so an idle worker never trips it.
const HEARTBEAT_STALE_SECS: i64 = 10;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Checks that the worker heartbeat exists and is fresh.
///
/// Returns JSON describing each check. HTTP 200 when all checks pass,
/// HTTP 503 when any check fails.
pub async fn readyz(State(service): State<QueueService>) -> impl IntoResponse {
    // 1) SQLite check
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.db)
        .await
    {
        Ok(v) if v == 1 => (true, None::<String>),
        Ok(v) => (false, Some(format!("unexpected result: {}", v))),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    // 2) Worker heartbeat check
    let worker_check = match service.heartbeat() {
        Some(beat) => {
            let age = Utc::now().signed_duration_since(beat).num_seconds();
            if age <= HEARTBEAT_STALE_SECS {
                (true, None::<String>)
            } else {
                (false, Some(format!("heartbeat stale by {}s", age)))
            }
        }
        None => (false, Some("worker has not started".to_string())),
    };

    // Build response JSON
    let sqlite_ok = sqlite_check.0;
    let worker_ok = worker_check.0;
    let overall_ok = sqlite_ok && worker_ok;

    let mut checks = HashMap::new();
    checks.insert(
        "sqlite",
        CheckStatus {
            ok: sqlite_ok,
            error: sqlite_check.1,
        },
    );
    checks.insert(
        "worker",
        CheckStatus {
            ok: worker_ok,
            error: worker_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
