pub mod health_handlers;
pub mod queue_handlers;
