//! # Anonymizer Library
//!
//! Resumable, checkpointed export of stored resources into a de-identified
//! destination collection: the rule engine, the job orchestrator and worker,
//! SeaORM persistence and the HTTP API that enqueues and tracks jobs.

pub mod anonymizer;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod models;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub use migration;
