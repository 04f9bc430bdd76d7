//! # Continuation Tokens
//!
//! Encoding and decoding of the opaque continuation tokens handed out by the
//! resource search. A token is base64 of a small JSON document naming the last
//! row of the previous page; decoding validates every layer before trusting it.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::jobs::JobError;

const MAX_TOKEN_LEN: usize = 512;
const MAX_DECODED_LEN: usize = 256;

/// Position of a paged scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationData {
    /// Surrogate id of the last row returned; the next page starts after it.
    pub after: i32,
}

/// Encode continuation data as an opaque base64 string
pub fn encode_continuation_token(data: &ContinuationData) -> Result<String, JobError> {
    let json = serde_json::to_vec(data)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}

/// Decode continuation data from an opaque base64 string with validation
pub fn decode_continuation_token(token: &str) -> Result<ContinuationData, JobError> {
    if token.is_empty() {
        return Err(invalid("token cannot be empty"));
    }

    if token.len() > MAX_TOKEN_LEN {
        return Err(invalid("token is too long"));
    }

    if !token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
    {
        return Err(invalid("token contains invalid characters"));
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|_| invalid("token is not valid base64"))?;

    if decoded.is_empty() {
        return Err(invalid("token is empty after decoding"));
    }

    if decoded.len() > MAX_DECODED_LEN {
        return Err(invalid("decoded token is too large"));
    }

    let json = String::from_utf8(decoded).map_err(|_| invalid("token contains invalid UTF-8 data"))?;

    let data: ContinuationData =
        serde_json::from_str(&json).map_err(|_| invalid("token contains invalid JSON structure"))?;

    if data.after < 0 {
        return Err(invalid("token position is negative"));
    }

    Ok(data)
}

fn invalid(reason: &str) -> JobError {
    JobError::InvalidContinuationToken(reason.to_string())
}
