//! # Data Models
//!
//! SeaORM entities backing the anonymizer service.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod anonymization_configuration;
pub mod anonymize_job;
pub mod resource;
pub mod resource_collection;

pub use anonymization_configuration::Entity as AnonymizationConfiguration;
pub use anonymize_job::Entity as AnonymizeJob;
pub use resource::Entity as Resource;
pub use resource_collection::Entity as ResourceCollection;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "anonymizer".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
