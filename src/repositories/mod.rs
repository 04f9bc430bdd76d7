//! # Repository Layer
//!
//! SeaORM implementations of the job, configuration, resource and search
//! collaborators used by the anonymize pipeline.

pub mod configuration;
pub mod job;
pub mod resource;
pub mod search;

pub use configuration::ConfigurationRepository;
pub use job::JobRepository;
pub use resource::ResourceRepository;
pub use search::ResourceSearchService;
