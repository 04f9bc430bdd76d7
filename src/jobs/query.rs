//! Search query parameters exchanged between the job and the search service.
//!
//! The job builds an ordered list of name/value pairs; search implementations
//! parse it back with [`SearchParameters::parse`].

use chrono::{DateTime, SecondsFormat, Utc};

use super::error::JobError;

/// Page size parameter.
pub const COUNT: &str = "_count";
/// Last-updated bound parameter; the job always sends `le<timestamp>`.
pub const LAST_UPDATED: &str = "_lastUpdated";
/// Continuation token parameter.
pub const CONTINUATION_TOKEN: &str = "ct";

/// Ordered search query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParameters(Vec<(String, String)>);

impl QueryParameters {
    /// Parameters for an export scan: a page size and a snapshot bound so
    /// resources updated after `snapshot` are never returned.
    pub fn for_export(page_size: u32, snapshot: DateTime<Utc>) -> Self {
        Self(vec![
            (COUNT.to_string(), page_size.to_string()),
            (
                LAST_UPDATED.to_string(),
                format!("le{}", snapshot.to_rfc3339_opts(SecondsFormat::Micros, true)),
            ),
        ])
    }

    /// Sets the continuation token, replacing any previous one.
    pub fn set_continuation_token(&mut self, token: &str) {
        match self.0.iter_mut().find(|(name, _)| name == CONTINUATION_TOKEN) {
            Some(entry) => entry.1 = token.to_string(),
            None => self.0.push((CONTINUATION_TOKEN.to_string(), token.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn as_slice(&self) -> &[(String, String)] {
        &self.0
    }
}

/// Search parameters understood by the resource search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchParameters {
    pub count: Option<u32>,
    /// Inclusive upper bound on last-updated time.
    pub last_updated_le: Option<DateTime<Utc>>,
    pub continuation_token: Option<String>,
}

impl SearchParameters {
    /// Parses raw parameters, rejecting unknown names and malformed values.
    pub fn parse(parameters: &[(String, String)]) -> Result<Self, JobError> {
        let mut parsed = SearchParameters::default();

        for (name, value) in parameters {
            match name.as_str() {
                COUNT => {
                    let count = value
                        .parse::<u32>()
                        .ok()
                        .filter(|c| *c > 0)
                        .ok_or_else(|| invalid(name, "expected a positive integer"))?;
                    parsed.count = Some(count);
                }
                LAST_UPDATED => {
                    let raw = value
                        .strip_prefix("le")
                        .ok_or_else(|| invalid(name, "only the 'le' prefix is supported"))?;
                    let bound = DateTime::parse_from_rfc3339(raw)
                        .map_err(|e| invalid(name, &e.to_string()))?;
                    parsed.last_updated_le = Some(bound.with_timezone(&Utc));
                }
                CONTINUATION_TOKEN => parsed.continuation_token = Some(value.clone()),
                _ => return Err(invalid(name, "unsupported parameter")),
            }
        }

        Ok(parsed)
    }
}

fn invalid(name: &str, reason: &str) -> JobError {
    JobError::InvalidSearchParameter {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
