//! Shared data model, error taxonomy, configuration, and store trait for the
//! QNTX server core. Every other `qntx-*` crate depends on this one; it
//! depends on nothing in the workspace.

pub mod config;
pub mod error;
pub mod model;
pub mod pg;
pub mod store;

pub use config::AppConfig;
pub use error::{QntxError, QntxResult};
pub use store::Store;
