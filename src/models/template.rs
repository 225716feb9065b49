//! Represents a registered query template.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A named, parameterized SQL statement that work items refer to by name.
///
/// Templates are registered once and persisted; items carry only the
/// template name plus bound parameter values. Grouping by template is
/// what makes batched execution possible.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct QueryTemplate {
    /// Unique template name (e.g. "insert_event").
    pub name: String,

    /// The SQL text with `?` placeholders.
    pub sql: String,

    /// Number of `?` placeholders each item must bind.
    pub param_count: i64,

    /// Solo templates are never batched with other items; each item
    /// runs alone in its own transaction.
    pub solo: bool,

    /// When this template was registered.
    pub created_at: DateTime<Utc>,
}
