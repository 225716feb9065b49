//! Represents an abandoned work item persisted for inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::work_item::Priority;

/// A work item that exhausted its retries and was taken out of rotation.
///
/// Dead letters are the only durable form of a work item. The original
/// params are stored as their JSON text so an operator can requeue the
/// item unchanged.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct DeadLetter {
    /// The abandoned item's id.
    pub id: Uuid,

    /// Template name the item was executing.
    pub template: String,

    /// JSON-encoded parameter array, verbatim from the item.
    pub params: String,

    /// Tier the item was queued in.
    pub priority: Priority,

    /// Retry count at the moment of abandonment.
    pub retry_count: i64,

    /// Message of the failure that exhausted the last retry.
    pub error: String,

    /// When the item was first enqueued.
    pub enqueued_at: DateTime<Utc>,

    /// When the item was abandoned.
    pub abandoned_at: DateTime<Utc>,
}
