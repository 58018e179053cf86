//! Route classification for rate-limit bucketing.
//!
//! Discord scopes its per-route rate limits by `(bucket hash, major
//! parameter)`. Until a hash has been learned from response headers, the
//! route *template* stands in for it: the request path with every ID
//! replaced by `:id` and reaction suffixes collapsed, so that
//! `/channels/10/messages/11` and `/channels/10/messages/12` share one
//! bucket while `/channels/10/…` and `/channels/20/…` do not.

use std::time::{SystemTime, UNIX_EPOCH};
use vanadium_model::Snowflake;

/// Message deletes younger than this are sub-limited separately.
const MESSAGE_NEW_THRESHOLD_MS: u64 = 10_000;

/// Message deletes older than this (two weeks) are sub-limited separately.
const MESSAGE_OLD_THRESHOLD_MS: u64 = 14 * 24 * 60 * 60 * 1000;

/// Sentinel major parameter for routes with no channel/guild/webhook ID.
pub const MAJOR_GLOBAL: &str = "global";

/// The rate-limit identity of one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    /// Request method, part of the bucket identity.
    pub method: reqwest::Method,
    /// Route template (plus `;new`/`;old` age tag for message deletes).
    pub bucket: String,
    /// Major parameter value, or [`MAJOR_GLOBAL`].
    pub major: String,
}

impl RouteKey {
    /// Classify a method + path into its rate-limit identity.
    pub fn classify(method: reqwest::Method, path: &str) -> Self {
        Self::classify_at(method, path, now_ms())
    }

    /// Classification with an explicit clock, for the message-age tags.
    fn classify_at(method: reqwest::Method, path: &str, now_ms: u64) -> Self {
        let mut template = String::with_capacity(path.len());
        let mut major = None;
        let mut last_id = None;
        let mut prev_segment = "";

        let mut segments = path.trim_start_matches('/').split('/');
        while let Some(segment) = segments.next() {
            template.push('/');

            if segment == "reactions" {
                // Everything under /reactions/* shares one bucket: emoji
                // are user-controlled and would explode the bucket map.
                template.push_str("reactions/:id");
                break;
            }

            if is_id(segment) {
                template.push_str(":id");
                last_id = segment.parse::<u64>().ok();
                if major.is_none()
                    && matches!(prev_segment, "channels" | "guilds" | "webhooks")
                {
                    major = Some(segment.to_string());
                }
            } else {
                template.push_str(segment);
            }

            prev_segment = segment;
        }

        // Recent and two-week-old message deletes carry stricter
        // sub-limits, discriminated by the snowflake's age.
        if method == reqwest::Method::DELETE && template == "/channels/:id/messages/:id" {
            if let Some(id) = last_id {
                let age = now_ms.saturating_sub(Snowflake::new(id).created_at_ms());
                if age <= MESSAGE_NEW_THRESHOLD_MS {
                    template.push_str(";new");
                } else if age >= MESSAGE_OLD_THRESHOLD_MS {
                    template.push_str(";old");
                }
            }
        }

        Self {
            method,
            bucket: template,
            major: major.unwrap_or_else(|| MAJOR_GLOBAL.to_string()),
        }
    }
}

/// Whether a path segment is a numeric ID.
///
/// Snowflakes run 17-19 digits today, but shorter numeric segments only
/// ever appear as IDs in API paths, so any all-digit segment qualifies.
fn is_id(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Typed responses the runtime itself needs
// ============================================================================

/// Response from `GET /gateway/bot`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct GatewayBot {
    /// Gateway WebSocket URL.
    pub url: String,

    /// Recommended number of shards.
    pub shards: u16,

    /// Session start limit information.
    pub session_start_limit: SessionStartLimit,
}

/// Session start limit from `/gateway/bot`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SessionStartLimit {
    /// Total number of session starts allowed per window.
    pub total: u32,

    /// Remaining session starts.
    pub remaining: u32,

    /// Milliseconds until the limit resets.
    pub reset_after: u64,

    /// Maximum number of concurrent identify operations.
    pub max_concurrency: u16,
}

/// Response from `GET /gateway`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gateway {
    /// Gateway WebSocket URL.
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    #[test]
    fn template_and_major() {
        let key = RouteKey::classify(
            Method::GET,
            "/channels/175928847299117063/messages/175928847299117064",
        );
        assert_eq!(key.bucket, "/channels/:id/messages/:id");
        assert_eq!(key.major, "175928847299117063");
    }

    #[test]
    fn major_defaults_to_global() {
        let key = RouteKey::classify(Method::GET, "/users/@me/guilds");
        assert_eq!(key.bucket, "/users/@me/guilds");
        assert_eq!(key.major, MAJOR_GLOBAL);
    }

    #[test]
    fn reactions_collapse() {
        let key = RouteKey::classify(
            Method::PUT,
            "/channels/175928847299117063/messages/175928847299117064/reactions/%F0%9F%98%80/@me",
        );
        assert_eq!(key.bucket, "/channels/:id/messages/:id/reactions/:id");
        assert_eq!(key.major, "175928847299117063");
    }

    #[test]
    fn delete_fresh_message_gets_new_tag() {
        // A snowflake minted five seconds before "now".
        let now = 1_700_000_000_000u64;
        let id = (now - 5_000 - vanadium_model::snowflake::DISCORD_EPOCH_MS) << 22;
        let key = RouteKey::classify_at(
            Method::DELETE,
            &format!("/channels/1234567890/messages/{id}"),
            now,
        );
        assert_eq!(key.bucket, "/channels/:id/messages/:id;new");
        assert_eq!(key.major, "1234567890");
    }

    #[test]
    fn delete_stale_message_gets_old_tag() {
        let now = 1_700_000_000_000u64;
        let id =
            (now - 15 * 24 * 60 * 60 * 1000 - vanadium_model::snowflake::DISCORD_EPOCH_MS) << 22;
        let key = RouteKey::classify_at(
            Method::DELETE,
            &format!("/channels/1234567890/messages/{id}"),
            now,
        );
        assert_eq!(key.bucket, "/channels/:id/messages/:id;old");
    }

    #[test]
    fn delete_middle_aged_message_untagged() {
        let now = 1_700_000_000_000u64;
        let id = (now - 60_000 - vanadium_model::snowflake::DISCORD_EPOCH_MS) << 22;
        let key = RouteKey::classify_at(
            Method::DELETE,
            &format!("/channels/1234567890/messages/{id}"),
            now,
        );
        assert_eq!(key.bucket, "/channels/:id/messages/:id");
    }

    #[test]
    fn classification_is_idempotent() {
        for path in [
            "/channels/175928847299117063/messages/175928847299117064",
            "/guilds/41771983423143937/members/80351110224678912/roles/165511591545143296",
            "/channels/175928847299117063/messages/175928847299117064/reactions/x/@me",
            "/gateway/bot",
        ] {
            let once = RouteKey::classify(Method::GET, path);
            let twice = RouteKey::classify(Method::GET, &once.bucket);
            assert_eq!(once.bucket, twice.bucket);
        }
    }
}
