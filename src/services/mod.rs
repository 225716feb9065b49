pub mod executor;
pub mod queue_service;
pub mod tiered_queue;
pub mod worker;
