//! Error types for schema registry client operations.
//!
//! This module defines every error the cache, the facade and the transports can
//! surface. Errors are categorized by how a caller should react to them.
//!
//! ## Error Handling Strategy
//!
//! - **Fatal at construction**: `Configuration`
//! - **Expected negatives**: `NotFound` (never retried, never cached)
//! - **Retriable errors**: `Transport`, `Timeout`
//! - **Client errors**: `Rejected`, `InvalidArgument`
//! - **Per-call failures**: `CacheOverflow`, `Serialization`, `Internal`
//!
//! `RegistryError` is `Clone`: a single in-flight registry call may be awaited by
//! many callers, and every one of them receives the same terminal error.
//!
//! ## Examples
//!
//! ```ignore
//! use schemagate_client::{CachedSchemaRegistryClient, RegistryError};
//!
//! match client.get_schema_by_id("orders-value", 42).await {
//!     Ok(schema) => println!("schema: {}", schema.schema),
//!     Err(RegistryError::NotFound { resource, .. }) => {
//!         eprintln!("registry has no {}", resource);
//!     }
//!     Err(e) if e.is_retryable() => eprintln!("registry unavailable: {}", e),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Convenience type alias for `Result<T, RegistryError>`.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Error type for schema registry client operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    /// Invalid client configuration.
    ///
    /// Raised only while building a client; no partially-usable client is
    /// ever returned.
    ///
    /// ## Causes
    /// - No configuration supplied to the builder
    /// - `schema.registry.url` missing or empty
    /// - Unknown subject name strategy or security protocol token
    /// - SSL requested without a loadable keystore
    ///
    /// ## Resolution
    /// - Review the configuration properties named in the message
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The registry has no such subject, version or schema.
    ///
    /// This is a legitimate negative answer, not a failure. It is surfaced
    /// immediately and never cached, so a later call observes registry-side
    /// fixes.
    ///
    /// `error_code` carries the Confluent error code when the registry sent
    /// one (40401 subject, 40402 version, 40403 schema).
    #[error("Not found: {resource}: {message}")]
    NotFound {
        resource: String,
        error_code: Option<i32>,
        message: String,
    },

    /// Connection failure or server-side error.
    ///
    /// ## Causes
    /// - Registry endpoint unreachable
    /// - HTTP 5xx, 408 or 429 response
    ///
    /// ## Resolution
    /// - Retried with backoff and endpoint failover before being surfaced
    /// - Check registry health and network connectivity
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation exceeded its configured timeout.
    ///
    /// Waiters sharing the timed-out call all receive this error and the
    /// in-flight slot is released for a later retry.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The configured cache ceiling would be exceeded.
    ///
    /// Fatal for the triggering call only; existing entries are untouched.
    ///
    /// ## Resolution
    /// - Raise `schema.registry.max.cached.schemas`
    /// - Check for callers generating unbounded distinct schemas
    #[error("Schema cache is full (capacity {capacity})")]
    CacheOverflow { capacity: usize },

    /// The registry refused the request.
    ///
    /// ## Causes
    /// - Incompatible schema (409)
    /// - Invalid schema (422)
    /// - Authentication or authorization failure (401/403)
    #[error("Registry rejected request with status {status}: {message}")]
    Rejected {
        status: u16,
        error_code: Option<i32>,
        message: String,
    },

    /// The caller passed arguments the operation cannot use.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Registry response body could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error that shouldn't normally occur.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Whether repeating the call can succeed without any other change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Transport(_) | RegistryError::Timeout(_))
    }

    /// Whether this is the registry saying "no such thing".
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }

    /// A registry-style "no such thing" with its numeric error code.
    pub(crate) fn not_found(
        resource: impl Into<String>,
        error_code: i32,
        message: impl Into<String>,
    ) -> Self {
        RegistryError::NotFound {
            resource: resource.into(),
            error_code: Some(error_code),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Serialization(e.to_string())
    }
}
