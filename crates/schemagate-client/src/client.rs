//! Cached schema registry client.
//!
//! The public entry point of the crate. A [`CachedSchemaRegistryClient`]
//! owns a validated [`ClientSettings`], a [`SchemaCache`] and the transport
//! behind it. It is `Send + Sync`; share it behind an `Arc` and call it from
//! any number of tasks.
//!
//! ## Example
//!
//! ```ignore
//! use schemagate_client::{CachedSchemaRegistryClient, Schema, SchemaRegistryConfig, SubjectRole};
//!
//! let config = SchemaRegistryConfig::new().url("http://localhost:8081");
//! let client = CachedSchemaRegistryClient::new(config)?;
//!
//! let schema = Schema::avro(r#"{"type":"record","name":"Order","fields":[]}"#);
//! let id = client.register("orders", SubjectRole::Value, &schema, None).await?;
//! let same = client.get_schema_by_id("orders-value", id).await?;
//! ```

use crate::cache::{CacheSettings, SchemaCache};
use crate::config::{ClientSettings, SchemaRegistryConfig};
use crate::error::{RegistryError, Result};
use crate::http::HttpTransport;
use crate::subject::{SubjectNameResolver, SubjectRole};
use crate::transport::RegistryTransport;
use crate::types::{Canonicalizer, JsonCanonicalizer, RegisteredSchema, Schema, SchemaVersion};
use std::sync::Arc;
use tracing::info;

/// Caching client for a Confluent-compatible schema registry.
///
/// Every lookup is answered from the cache when possible. Misses go to the
/// registry once per key no matter how many tasks ask concurrently.
pub struct CachedSchemaRegistryClient {
    settings: ClientSettings,
    cache: Arc<SchemaCache>,
}

impl CachedSchemaRegistryClient {
    /// Create a builder for a client.
    pub fn builder() -> CachedSchemaRegistryClientBuilder {
        CachedSchemaRegistryClientBuilder::new()
    }

    /// Build a client that talks HTTP to the registry named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Configuration`] if the configuration is
    /// invalid. No network I/O is performed.
    pub fn new(config: SchemaRegistryConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Validated settings this client was built with.
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn subject_name_resolver(&self) -> &SubjectNameResolver {
        &self.settings.subject_names
    }

    /// Subject under which a topic's key schema is registered.
    pub fn construct_key_subject_name(&self, topic: &str, record_name: &str) -> String {
        self.settings.subject_names.key_subject_name(topic, record_name)
    }

    /// Subject under which a topic's value schema is registered.
    pub fn construct_value_subject_name(&self, topic: &str, record_name: &str) -> String {
        self.settings.subject_names.value_subject_name(topic, record_name)
    }

    /// Register `schema` for the key or value of `topic`.
    ///
    /// The subject comes from the configured naming strategy for `role`.
    /// Record-based strategies use `record_name`, or the name declared by the
    /// schema itself when `record_name` is `None`.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidArgument`] if the strategy needs a record
    ///   name and none was given or derivable
    /// - any error from [`register_by_subject`](Self::register_by_subject)
    pub async fn register(
        &self,
        topic: &str,
        role: SubjectRole,
        schema: &Schema,
        record_name: Option<&str>,
    ) -> Result<i32> {
        let subject = self.subject_for(topic, role, schema, record_name)?;
        self.register_by_subject(&subject, schema).await
    }

    /// Register `schema` under `subject` unless it is already cached.
    pub async fn register_by_subject(&self, subject: &str, schema: &Schema) -> Result<i32> {
        self.cache.get_or_register_id(subject, schema).await
    }

    /// Schema with global `id`, scoped to `subject`.
    pub async fn get_schema_by_id(&self, subject: &str, id: i32) -> Result<Schema> {
        self.cache.get_schema_by_id(subject, id).await
    }

    /// ID of a schema already registered under `subject`.
    ///
    /// Never registers. Returns [`RegistryError::NotFound`] if the registry
    /// does not know the schema under that subject.
    pub async fn get_id_by_subject_and_schema(&self, subject: &str, schema: &Schema) -> Result<i32> {
        self.cache.get_id_by_schema(subject, schema).await
    }

    pub async fn get_schema_by_version(
        &self,
        subject: &str,
        version: i32,
    ) -> Result<RegisteredSchema> {
        self.cache.get_schema_by_version(subject, version).await
    }

    /// Latest version of `subject`. Cached only when `latest.cache.ttl.secs`
    /// is set.
    pub async fn get_latest_schema(&self, subject: &str) -> Result<RegisteredSchema> {
        self.cache.get_latest_schema(subject).await
    }

    pub async fn is_compatible(
        &self,
        subject: &str,
        schema: &Schema,
        version: impl Into<SchemaVersion>,
    ) -> Result<bool> {
        self.cache
            .is_compatible(subject, schema, version.into())
            .await
    }

    pub async fn get_subjects(&self) -> Result<Vec<String>> {
        self.cache.get_subjects().await
    }

    pub async fn get_subject_versions(&self, subject: &str) -> Result<Vec<i32>> {
        self.cache.get_subject_versions(subject).await
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of cached id pairs and compatibility verdicts.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    fn subject_for(
        &self,
        topic: &str,
        role: SubjectRole,
        schema: &Schema,
        record_name: Option<&str>,
    ) -> Result<String> {
        let strategy = self.settings.subject_names.strategy(role);
        if !strategy.uses_record_name() {
            return Ok(strategy.subject_name(topic, "", role));
        }

        let record_name = match record_name {
            Some(name) => name.to_string(),
            None => schema.record_name().ok_or_else(|| {
                RegistryError::InvalidArgument(format!(
                    "{} needs a record name and none could be derived from the {} schema",
                    strategy,
                    schema.schema_type.as_str()
                ))
            })?,
        };
        Ok(strategy.subject_name(topic, &record_name, role))
    }
}

impl std::fmt::Debug for CachedSchemaRegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedSchemaRegistryClient")
            .field("endpoints", &self.settings.endpoints)
            .field("cached_entries", &self.cache.len())
            .finish()
    }
}

/// Builder for [`CachedSchemaRegistryClient`].
///
/// `config` is required. `transport` replaces the HTTP transport (for
/// example with a [`MemoryRegistry`](crate::memory::MemoryRegistry));
/// the configuration is still validated in full.
#[derive(Default)]
pub struct CachedSchemaRegistryClientBuilder {
    config: Option<SchemaRegistryConfig>,
    transport: Option<Arc<dyn RegistryTransport>>,
    canonicalizer: Option<Arc<dyn Canonicalizer>>,
}

impl CachedSchemaRegistryClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client configuration (required).
    pub fn config(mut self, config: SchemaRegistryConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn RegistryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Decide which schemas count as equal for caching (default: JSON
    /// canonical form).
    pub fn canonicalizer(mut self, canonicalizer: Arc<dyn Canonicalizer>) -> Self {
        self.canonicalizer = Some(canonicalizer);
        self
    }

    /// Validate the configuration and build the client.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Configuration`] if no configuration was set
    /// or it fails validation.
    pub fn build(self) -> Result<CachedSchemaRegistryClient> {
        let config = self
            .config
            .ok_or_else(|| RegistryError::Configuration("configuration is required".to_string()))?;
        let settings = ClientSettings::from_config(&config)?;

        let transport: Arc<dyn RegistryTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&settings)?),
        };
        let canonicalizer = self
            .canonicalizer
            .unwrap_or_else(|| Arc::new(JsonCanonicalizer));

        let cache = Arc::new(SchemaCache::new(
            transport,
            canonicalizer,
            CacheSettings::from(&settings),
        ));

        info!(
            endpoints = ?settings.endpoints,
            security_protocol = settings.security_protocol.as_str(),
            key_strategy = %settings.subject_names.key,
            value_strategy = %settings.subject_names.value,
            "Schema registry client initialized"
        );

        Ok(CachedSchemaRegistryClient { settings, cache })
    }
}
