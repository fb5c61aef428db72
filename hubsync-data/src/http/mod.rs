//! HTTP implementations of the Core API and blob storage sources.
//!
//! # Architecture
//!
//! The [`hubsync_core::CoreClient`] and [`hubsync_core::BlobStorage`] traits
//! are synchronous so the sync manager can run on plain threads. The clients
//! here bridge to async `reqwest` calls by blocking on a Tokio runtime they
//! own, or on the caller's multi-threaded runtime when there is one.
//!
//! Responses are mapped onto [`hubsync_core::RemoteError`]: rate limits
//! (honouring `Retry-After`), server errors, timeouts and connection failures
//! are transient; other client errors are rejected; bodies that do not decode
//! are malformed.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use hubsync_core::{CoreClient, CoreEntity};
//! use hubsync_data::http::{HttpClientConfig, HttpCoreClient};
//!
//! let config = HttpClientConfig::new("https://core.example.com")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_bearer_token("secret");
//! let client = HttpCoreClient::with_config(config)?;
//! let total = client.count(CoreEntity::Transaction)?;
//! println!("{total} transactions");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod blob;
mod config;
mod core_api;
mod transport;
mod wire;

pub use blob::HttpBlobStorage;
pub use config::{ClientBuildError, DEFAULT_USER_AGENT, HttpClientConfig};
pub use core_api::HttpCoreClient;
