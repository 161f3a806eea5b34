//! Propboard backend library.
//!
//! Exposes the core modules for the binary and the integration tests.

pub mod api;
pub mod config;
pub mod ensemble;
pub mod explain;
pub mod ingest;
pub mod models;
pub mod store;
pub mod supervisor;

pub use api::AppState;
pub use config::Config;
