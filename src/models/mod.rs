//! Core data models for the tiered retry queue.
//!
//! Templates and dead letters map to SQLite tables via `sqlx::FromRow`;
//! work items live only in the in-process queue and serialize as JSON
//! via `serde` for the HTTP surface.

pub mod dead_letter;
pub mod template;
pub mod work_item;
