//! De-identification configuration
//!
//! A configuration is an ordered list of path rules plus the keys some
//! methods need. Rules are evaluated in order and the first rule that reaches
//! a node decides what happens to it.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use utoipa::ToSchema;

/// Default maximum date shift in either direction.
pub const DEFAULT_DATE_SHIFT_RANGE_DAYS: u32 = 50;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnonymizerConfiguration {
    #[serde(default)]
    pub path_rules: Vec<PathRule>,
    #[serde(default)]
    pub parameters: AnonymizerParameters,
}

/// Applies `method` to every node reached by `path`.
///
/// Paths are dot separated field names. Arrays are traversed implicitly, `*`
/// matches any field, and a leading segment starting with an uppercase letter
/// restricts the rule to resources of that `resourceType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
    #[schema(example = "Patient.name")]
    pub path: String,
    pub method: AnonymizationMethod,
    /// Replacement value for `substitute`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub replace_with: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum AnonymizationMethod {
    Keep,
    Redact,
    CryptoHash,
    DateShift,
    Substitute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnonymizerParameters {
    /// HMAC key for `cryptoHash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_hash_key: Option<String>,
    /// HMAC key deriving the per-resource offset for `dateShift`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_shift_key: Option<String>,
    #[serde(default = "default_date_shift_range_days")]
    pub date_shift_range_days: u32,
}

fn default_date_shift_range_days() -> u32 {
    DEFAULT_DATE_SHIFT_RANGE_DAYS
}

impl Default for AnonymizerParameters {
    fn default() -> Self {
        Self {
            crypto_hash_key: None,
            date_shift_key: None,
            date_shift_range_days: DEFAULT_DATE_SHIFT_RANGE_DAYS,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("rule {index} has an empty path")]
    EmptyPath { index: usize },

    #[error("rule {index} path '{path}' contains an empty segment")]
    EmptySegment { index: usize, path: String },

    #[error("rule {index} path '{path}' names a resource type but no field")]
    TypeOnlyPath { index: usize, path: String },

    #[error("rule {index} uses substitute without replaceWith")]
    MissingReplacement { index: usize },

    #[error("cryptoHash rules require parameters.cryptoHashKey")]
    MissingCryptoHashKey,

    #[error("dateShift rules require parameters.dateShiftKey")]
    MissingDateShiftKey,

    #[error("dateShiftRangeDays must be between 1 and 3650, got {value}")]
    InvalidDateShiftRange { value: u32 },
}

impl AnonymizerConfiguration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (index, rule) in self.path_rules.iter().enumerate() {
            if rule.path.trim().is_empty() {
                return Err(ConfigurationError::EmptyPath { index });
            }
            if rule.path.split('.').any(|s| s.trim().is_empty()) {
                return Err(ConfigurationError::EmptySegment {
                    index,
                    path: rule.path.clone(),
                });
            }
            if !rule.path.contains('.') && is_type_segment(&rule.path) {
                return Err(ConfigurationError::TypeOnlyPath {
                    index,
                    path: rule.path.clone(),
                });
            }

            match rule.method {
                AnonymizationMethod::Substitute if rule.replace_with.is_none() => {
                    return Err(ConfigurationError::MissingReplacement { index });
                }
                AnonymizationMethod::CryptoHash
                    if blank(self.parameters.crypto_hash_key.as_deref()) =>
                {
                    return Err(ConfigurationError::MissingCryptoHashKey);
                }
                AnonymizationMethod::DateShift => {
                    if blank(self.parameters.date_shift_key.as_deref()) {
                        return Err(ConfigurationError::MissingDateShiftKey);
                    }
                    let range = self.parameters.date_shift_range_days;
                    if !(1..=3650).contains(&range) {
                        return Err(ConfigurationError::InvalidDateShiftRange { value: range });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// True when a path segment names a resource type rather than a field.
pub(crate) fn is_type_segment(segment: &str) -> bool {
    segment.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}
