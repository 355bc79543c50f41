//! Registry transport contract.
//!
//! The cache only ever talks to the registry through [`RegistryTransport`].
//! Implementations are expected to:
//!
//! - pick endpoints through an [`EndpointRotation`], advancing on
//!   connection-level failures
//! - apply authentication and TLS configured at construction
//! - classify responses into success, [`RegistryError::NotFound`], or a
//!   transport/server error
//! - retry transport/server errors a bounded number of times before
//!   returning them
//!
//! [`RegistryError::NotFound`]: crate::error::RegistryError::NotFound

use crate::error::Result;
use crate::types::{RegisteredSchema, Schema, SchemaVersion};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Operations a schema registry exposes to the client.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Register `schema` under `subject`, returning its global ID.
    ///
    /// Registering an already-known schema returns the existing ID.
    async fn register_schema(&self, subject: &str, schema: &Schema) -> Result<i32>;

    /// Fetch a schema by its global ID, optionally scoped to a subject.
    async fn get_schema_by_id(&self, id: i32, subject: Option<&str>) -> Result<Schema>;

    /// Look up an already-registered schema under `subject` without
    /// registering it.
    async fn lookup_schema(&self, subject: &str, schema: &Schema) -> Result<RegisteredSchema>;

    /// Fetch a specific version, or the latest one, of a subject.
    async fn get_schema_by_version(
        &self,
        subject: &str,
        version: SchemaVersion,
    ) -> Result<RegisteredSchema>;

    /// Test `schema` against a version of `subject`.
    async fn check_compatibility(
        &self,
        subject: &str,
        schema: &Schema,
        version: SchemaVersion,
    ) -> Result<bool>;

    async fn get_subjects(&self) -> Result<Vec<String>>;

    async fn get_subject_versions(&self, subject: &str) -> Result<Vec<i32>>;
}

/// Deterministic endpoint order with a shared failover cursor.
///
/// Every request walks all endpoints once, starting at the cursor. The cursor
/// only moves on failover, so a healthy endpoint keeps serving until it fails.
/// Races on the cursor only affect which endpoint is tried first.
#[derive(Debug)]
pub struct EndpointRotation {
    endpoints: Vec<String>,
    cursor: AtomicUsize,
}

impl EndpointRotation {
    /// `endpoints` must not be empty; configuration validation guarantees it.
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Endpoints in the order the next request should try them.
    pub fn ordered(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        let len = self.endpoints.len();
        let start = if len == 0 {
            0
        } else {
            self.cursor.load(Ordering::Relaxed) % len
        };
        (0..len).map(move |offset| {
            let index = (start + offset) % len;
            (index, self.endpoints[index].as_str())
        })
    }

    /// Record that the endpoint at `failed` is unreachable.
    ///
    /// Moves the cursor past it unless another caller already did.
    pub fn advance_past(&self, failed: usize) {
        let len = self.endpoints.len();
        if len < 2 {
            return;
        }
        let _ = self.cursor.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            (current % len == failed).then_some((failed + 1) % len)
        });
    }
}
