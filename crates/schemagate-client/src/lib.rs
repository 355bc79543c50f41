//! Schemagate Client - cached schema registry access
//!
//! This crate provides a caching client for Confluent-compatible schema
//! registries. Producers and consumers use it to turn schemas into registry
//! IDs and back without a network round trip on every message.
//!
//! - Bidirectional subject-scoped schema/ID cache with single-flight misses
//! - Subject naming strategies (`Topic`, `Record`, `TopicRecord`)
//! - Property-map configuration validated at construction
//! - HTTP transport with endpoint failover, retry, basic auth and TLS
//! - In-memory registry for tests and offline use
//!
//! # Examples
//!
//! ```ignore
//! use schemagate_client::{CachedSchemaRegistryClient, Schema, SchemaRegistryConfig, SubjectRole};
//!
//! let client = CachedSchemaRegistryClient::new(
//!     SchemaRegistryConfig::new().url("http://registry-1:8081,http://registry-2:8081"),
//! )?;
//!
//! let schema = Schema::avro(r#"{"type":"record","name":"Order","fields":[]}"#);
//! let id = client.register("orders", SubjectRole::Value, &schema, None).await?;
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod memory;
pub mod retry;
pub mod single_flight;
pub mod subject;
pub mod transport;
pub mod types;

pub use cache::{CacheSettings, SchemaCache};
pub use client::{CachedSchemaRegistryClient, CachedSchemaRegistryClientBuilder};
pub use config::{ClientSettings, SchemaRegistryConfig, SecurityProtocol};
pub use error::{RegistryError, Result};
pub use http::HttpTransport;
pub use memory::{MemoryRegistry, Operation};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use subject::{SubjectNameResolver, SubjectNameStrategy, SubjectRole};
pub use transport::{EndpointRotation, RegistryTransport};
pub use types::{
    Canonicalizer, JsonCanonicalizer, RegisteredSchema, Schema, SchemaFormat, SchemaKey,
    SchemaReference, SchemaVersion,
};
