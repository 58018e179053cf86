//! Vanadium REST - rate-limited Discord API request pipeline
#![deny(unsafe_code)]
//!
//! This crate is the single road to Discord's HTTP API: a typed request
//! primitive behind a rate limiter that honors per-route buckets, hash
//! aliasing, and the global limit, driving its schedule entirely from the
//! `X-RateLimit-*` headers of previous responses.
//!
//! It is deliberately not a general HTTP client; the ~200 one-line
//! endpoint wrappers of a full library live above this crate and call
//! [`RestClient::request`].
//!
//! # Example
//!
//! ```ignore
//! use vanadium_rest::{RestClient, RequestOptions, Method};
//!
//! let rest = RestClient::new("token")?;
//! let msg = rest
//!     .request(
//!         Method::POST,
//!         "/channels/175928847299117063/messages",
//!         RequestOptions::json(serde_json::json!({"content": "hello"})),
//!     )
//!     .await?;
//! ```

mod client;
mod error;
mod multipart;
mod ratelimit;
mod routes;

pub use client::{RestClient, RestOptions, RequestOptions, DEFAULT_BASE_URL, REST_VERSION};
pub use error::{flatten_errors, RestError};
pub use multipart::FileAttachment;
pub use ratelimit::{RateLimiter, RouteBucket};
pub use routes::{Gateway, GatewayBot, RouteKey, SessionStartLimit, MAJOR_GLOBAL};

pub use reqwest::Method;
