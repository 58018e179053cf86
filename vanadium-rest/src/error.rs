//! REST error types.

use std::collections::HashMap;
use thiserror::Error;

/// Errors surfaced by the request pipeline.
#[derive(Debug, Error)]
pub enum RestError {
    /// Discord answered with a JSON error body.
    #[error("Discord API error {code} ({status}): {message}")]
    Api {
        /// HTTP status of the response.
        status: u16,
        /// Discord error code (e.g. 50013 Missing Permissions).
        code: u32,
        /// Top-level error message.
        message: String,
        /// Validation errors flattened to `path.to.field` keys.
        errors: Vec<(String, String)>,
        /// Response headers at the time of the error.
        headers: HashMap<String, String>,
    },

    /// Non-2xx response without a parseable JSON body.
    #[error("HTTP {status} on {method} {path}")]
    Http {
        /// HTTP status of the response.
        status: u16,
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// The request kept failing at the transport level past `retry_limit`.
    #[error("network error after {attempts} attempts: {source}")]
    Network {
        /// Number of attempts made.
        attempts: u32,
        /// The final transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The request did not complete within the configured timeout.
    #[error("request timed out after {attempts} attempts")]
    Timeout {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Request construction failed (before anything was sent).
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A header value could not be encoded.
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
}

/// Discord API error response body.
#[derive(Debug, serde::Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Option<serde_json::Value>,
}

/// Flatten Discord's nested validation-error tree into
/// `("path.to.field", "message")` pairs.
///
/// The tree nests objects keyed by field name (or array index) down to
/// `_errors` arrays holding `{code, message}` leaves.
pub fn flatten_errors(value: &serde_json::Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    walk(value, String::new(), &mut out);
    out
}

fn walk(value: &serde_json::Value, prefix: String, out: &mut Vec<(String, String)>) {
    let Some(map) = value.as_object() else {
        return;
    };

    for (key, child) in map {
        if key == "_errors" {
            if let Some(leaves) = child.as_array() {
                for leaf in leaves {
                    let message = leaf
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error");
                    out.push((prefix.clone(), message.to_string()));
                }
            }
            continue;
        }

        let next = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        walk(child, next, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_nested_validation_tree() {
        let body = json!({
            "content": {"_errors": [{"code": "BASE_TYPE_REQUIRED", "message": "This field is required"}]},
            "embeds": {"0": {"fields": {"1": {"name": {"_errors": [
                {"code": "BASE_TYPE_MAX_LENGTH", "message": "Must be 256 or fewer in length."}
            ]}}}}}
        });

        let mut flat = flatten_errors(&body);
        flat.sort();

        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].0, "content");
        assert_eq!(flat[0].1, "This field is required");
        assert_eq!(flat[1].0, "embeds.0.fields.1.name");
    }

    #[test]
    fn flatten_ignores_non_objects() {
        assert!(flatten_errors(&json!("nope")).is_empty());
        assert!(flatten_errors(&json!(null)).is_empty());
    }
}
