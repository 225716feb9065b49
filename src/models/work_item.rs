//! Represents a queued unit of work and its priority tier.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority tier of a work item. Higher tiers are always drained first.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// All tiers, highest first. Pop order iterates this slice.
    pub const ORDERED: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// A single queued execution of a query template.
///
/// Work items are in-memory only while queued; they become durable rows
/// only when abandoned (see `DeadLetter`).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkItem {
    /// Identifier assigned at enqueue time.
    pub id: Uuid,

    /// Name of the registered template this item executes.
    pub template: String,

    /// Parameter values bound to the template's placeholders, in order.
    pub params: Vec<serde_json::Value>,

    /// Tier this item is queued in (and re-enqueued into on retry).
    pub priority: Priority,

    /// Number of failed execution attempts so far.
    pub retry_count: u32,

    /// When the item was first enqueued.
    pub enqueued_at: DateTime<Utc>,

    /// When the item last failed an execution attempt, if ever.
    pub last_attempt: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(template: String, params: Vec<serde_json::Value>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            template,
            params,
            priority,
            retry_count: 0,
            enqueued_at: Utc::now(),
            last_attempt: None,
        }
    }

    /// Whether this item may be executed at `now`.
    ///
    /// A retried item is gated until `last_attempt + step * retry_count`
    /// has elapsed. Fresh items are always eligible.
    pub fn eligible_at(&self, now: DateTime<Utc>, backoff_step: Duration) -> bool {
        match self.last_attempt {
            Some(last) => now >= last + backoff_step * self.retry_count as i32,
            None => true,
        }
    }

    /// Stamp a failed attempt: bump the retry count and record the time.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_attempt = Some(now);
    }
}
