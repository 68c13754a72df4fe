//! Durable async job queue, worker pool, and handler registry (spec §4.2-4.4,
//! C2-C4).

pub mod handler;
pub mod mem;
pub mod pg;
pub mod queue;
pub mod worker;

pub use handler::{Handler, HandlerRegistry};
pub use mem::InMemoryJobQueue;
pub use pg::PgJobQueue;
pub use queue::JobQueue;
pub use worker::{JobHandle, WorkerPool};
