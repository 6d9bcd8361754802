use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{AuthError, AuthResult};

/// Claim names recognized by the adapter.
pub const CLAIM_API_PRODUCT_LIST: &str = "api_product_list";
pub const CLAIM_AUDIENCE: &str = "audience";
pub const CLAIM_CLIENT_ID: &str = "client_id";
pub const CLAIM_APPLICATION_NAME: &str = "application_name";
pub const CLAIM_SCOPES: &str = "scopes";
pub const CLAIM_EXPIRES: &str = "exp";
pub const CLAIM_ACCESS_TOKEN: &str = "access_token";
pub const CLAIM_DEVELOPER_EMAIL: &str = "application_developeremail";

pub type ClaimsMap = serde_json::Map<String, Value>;

/// Required string claim; missing or non-string values reject the claims.
pub fn require_string(claims: &ClaimsMap, key: &'static str) -> AuthResult<String> {
    match claims.get(key) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
        Some(other) => Err(AuthError::InvalidClaim(key, other.to_string())),
        None => Err(AuthError::InvalidClaim(key, "<missing>".to_string())),
    }
}

pub fn optional_string(claims: &ClaimsMap, key: &str) -> Option<String> {
    match claims.get(key) {
        Some(Value::String(value)) if !value.is_empty() => Some(value.clone()),
        _ => None,
    }
}

/// List claims arrive either as a native JSON array of strings or as a
/// JSON-encoded list inside a string. Missing claims decode as empty.
pub fn string_list(claims: &ClaimsMap, key: &'static str) -> AuthResult<Vec<String>> {
    match claims.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(value) => Ok(value.clone()),
                other => Err(AuthError::InvalidClaim(key, other.to_string())),
            })
            .collect(),
        Some(Value::String(encoded)) => {
            if encoded.trim().is_empty() {
                return Ok(Vec::new());
            }
            serde_json::from_str::<Vec<String>>(encoded)
                .map_err(|_| AuthError::InvalidClaim(key, encoded.clone()))
        }
        Some(other) => Err(AuthError::InvalidClaim(key, other.to_string())),
    }
}

/// `exp` accepts numeric seconds since epoch or a numeric string; anything
/// else rejects the claims.
pub fn parse_exp(claims: &ClaimsMap) -> AuthResult<DateTime<Utc>> {
    let value = claims
        .get(CLAIM_EXPIRES)
        .ok_or(AuthError::InvalidClaim(CLAIM_EXPIRES, String::new()))?;
    let seconds = match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| AuthError::InvalidClaim(CLAIM_EXPIRES, number.to_string()))?,
        Value::String(text) => text
            .parse::<f64>()
            .map_err(|_| AuthError::InvalidClaim(CLAIM_EXPIRES, text.clone()))?,
        other => return Err(AuthError::InvalidClaim(CLAIM_EXPIRES, other.to_string())),
    };
    Utc.timestamp_opt(seconds as i64, 0)
        .single()
        .ok_or_else(|| AuthError::InvalidClaim(CLAIM_EXPIRES, seconds.to_string()))
}
