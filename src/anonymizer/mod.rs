//! # De-identification
//!
//! Configuration model, rule engine, search index extraction and the
//! per-resource transform operations used by export jobs.

pub mod configuration;
pub mod engine;
pub mod indexer;
pub mod operation;

pub use configuration::{
    AnonymizationMethod, AnonymizerConfiguration, AnonymizerParameters, ConfigurationError,
    PathRule,
};
pub use engine::{AnonymizeError, AnonymizerEngine};
pub use indexer::{FlatteningSearchIndexer, SearchIndexer};
pub use operation::{
    AnonymizationOperation, AnonymizeOperation, ConfigurationStore, OperationFactory,
    PassthroughOperation,
};
