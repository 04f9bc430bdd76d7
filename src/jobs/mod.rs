//! # Anonymize Jobs
//!
//! Job records and progress, the collaborator seams, the orchestrator that
//! drives one export and the worker that schedules them.

pub mod error;
pub mod orchestrator;
pub mod query;
pub mod record;
pub mod scope;
pub mod traits;
pub mod worker;

pub use error::JobError;
pub use orchestrator::{AnonymizeJobTask, AnonymizeJobTaskFactory};
pub use query::{QueryParameters, SearchParameters};
pub use record::{FailureDetails, JobOutcome, JobProgress, JobRecord, JobStatus, VersionToken};
pub use scope::{ScopeFactory, Scoped};
pub use traits::{
    JobStore, ResourceStore, ResourceWrapper, SaveOutcome, SearchIndexEntry, SearchResult,
    SearchService, UpsertOptions, UpsertOutcome,
};
pub use worker::JobWorker;
