//! Schema/ID cache.
//!
//! Bidirectional, subject-scoped cache in front of a [`RegistryTransport`]:
//!
//! - `(subject, schema) → id`
//! - `(subject, id) → schema`
//! - `subject → {version → id}`
//! - `subject → latest` (only with a TTL)
//! - `(subject, schema, version) → compatible`
//!
//! ## Consistency
//!
//! All maps live behind one `RwLock`. A registry result is committed under a
//! single write guard, so readers see both directions of an id pair or
//! neither. Cache hits take only the read guard and never suspend.
//!
//! Misses go through a [`SingleFlight`] group per operation: one registry call
//! per key at a time, shared by every concurrent caller. Failures leave the
//! cache untouched and are never remembered; the next call retries from
//! scratch.
//!
//! ## Capacity
//!
//! Entries are never evicted. With a configured ceiling, a commit that would
//! grow the cache past it fails with [`RegistryError::CacheOverflow`] and
//! changes nothing.

use crate::config::ClientSettings;
use crate::error::{RegistryError, Result};
use crate::single_flight::SingleFlight;
use crate::transport::RegistryTransport;
use crate::types::{Canonicalizer, RegisteredSchema, Schema, SchemaKey, SchemaVersion};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Cache tuning, usually taken from [`ClientSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Ceiling on cached id pairs plus compatibility verdicts
    pub max_entries: Option<usize>,
    /// How long a fetched latest version may be served from cache
    pub latest_ttl: Option<Duration>,
    /// Bound on every registry call made by the cache
    pub operation_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: None,
            latest_ttl: None,
            operation_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ClientSettings> for CacheSettings {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            max_entries: settings.max_cached_schemas,
            latest_ttl: settings.latest_cache_ttl,
            operation_timeout: settings.operation_timeout,
        }
    }
}

type CompatibilityKey = (String, SchemaKey, i32);

#[derive(Default)]
struct CacheState {
    ids: HashMap<String, HashMap<SchemaKey, i32>>,
    /// The key is kept next to the schema so a replaced pair can be unlinked
    schemas: HashMap<String, HashMap<i32, (SchemaKey, Schema)>>,
    versions: HashMap<String, BTreeMap<i32, i32>>,
    latest: HashMap<String, (RegisteredSchema, Instant)>,
    compatibility: HashMap<CompatibilityKey, bool>,
    pairs: usize,
    /// Bumped by every clear; results fetched under an older generation are
    /// returned but not committed.
    generation: u64,
}

impl CacheState {
    fn id_for(&self, subject: &str, key: &SchemaKey) -> Option<i32> {
        self.ids.get(subject)?.get(key).copied()
    }

    fn schema_for(&self, subject: &str, id: i32) -> Option<&Schema> {
        self.schemas.get(subject)?.get(&id).map(|(_, schema)| schema)
    }

    fn registered(&self, subject: &str, version: i32) -> Option<RegisteredSchema> {
        let id = *self.versions.get(subject)?.get(&version)?;
        let schema = self.schema_for(subject, id)?.clone();
        Some(RegisteredSchema {
            subject: subject.to_string(),
            id,
            version,
            schema,
        })
    }

    fn fresh_latest(&self, subject: &str, ttl: Option<Duration>) -> Option<RegisteredSchema> {
        let ttl = ttl?;
        let (latest, fetched_at) = self.latest.get(subject)?;
        (fetched_at.elapsed() < ttl).then(|| latest.clone())
    }

    fn entries(&self) -> usize {
        self.pairs + self.compatibility.len()
    }

    fn ensure_room(&self, max_entries: Option<usize>) -> Result<()> {
        match max_entries {
            Some(capacity) if self.entries() >= capacity => {
                Err(RegistryError::CacheOverflow { capacity })
            }
            _ => Ok(()),
        }
    }

    /// Link `key` and `id` in both directions for `subject`.
    ///
    /// A pair replacing a stale link (same key with another id, or same id with
    /// another key) unlinks the stale partner so the directions stay inverse.
    fn insert_pair(
        &mut self,
        subject: &str,
        key: SchemaKey,
        id: i32,
        schema: Schema,
        max_entries: Option<usize>,
    ) -> Result<()> {
        if self.id_for(subject, &key) == Some(id) {
            return Ok(());
        }
        let grows = self.id_for(subject, &key).is_none() && self.schema_for(subject, id).is_none();
        if grows {
            self.ensure_room(max_entries)?;
        }

        let ids = self.ids.entry(subject.to_string()).or_default();
        let schemas = self.schemas.entry(subject.to_string()).or_default();

        if let Some(old_id) = ids.insert(key.clone(), id) {
            schemas.remove(&old_id);
            self.pairs -= 1;
        }
        if let Some((old_key, _)) = schemas.insert(id, (key.clone(), schema)) {
            if old_key != key {
                ids.remove(&old_key);
                self.pairs -= 1;
            }
        }
        self.pairs += 1;
        Ok(())
    }

    fn record_version(&mut self, subject: &str, version: i32, id: i32) {
        self.versions
            .entry(subject.to_string())
            .or_default()
            .insert(version, id);
    }

    /// Commit a subject/version lookup result.
    fn insert_registered(
        &mut self,
        registered: &RegisteredSchema,
        key: SchemaKey,
        max_entries: Option<usize>,
    ) -> Result<()> {
        self.insert_pair(
            &registered.subject,
            key,
            registered.id,
            registered.schema.clone(),
            max_entries,
        )?;
        self.record_version(&registered.subject, registered.version, registered.id);
        Ok(())
    }

    /// Side-populate the id pair and version from a read. A full cache skips
    /// the insert instead of failing the read. Returns whether it fit.
    fn remember_registered(
        &mut self,
        registered: &RegisteredSchema,
        key: SchemaKey,
        max_entries: Option<usize>,
    ) -> bool {
        match self.insert_registered(registered, key, max_entries) {
            Ok(()) => true,
            Err(error) => {
                debug!(
                    subject = %registered.subject,
                    version = registered.version,
                    error = %error,
                    "Not caching schema version"
                );
                false
            }
        }
    }
}

/// State shared between the cache handle and its in-flight registry calls.
struct CacheCore {
    transport: Arc<dyn RegistryTransport>,
    canonicalizer: Arc<dyn Canonicalizer>,
    state: RwLock<CacheState>,
    settings: CacheSettings,
}

impl CacheCore {
    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access for committing a result fetched under `generation`, or
    /// `None` when the cache was cleared since.
    fn commit(&self, generation: u64) -> Option<RwLockWriteGuard<'_, CacheState>> {
        let state = self.write();
        if state.generation == generation {
            Some(state)
        } else {
            debug!(generation = generation, "Cache cleared during fetch, result not cached");
            None
        }
    }

    /// Run a registry call under the operation timeout.
    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.settings.operation_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| RegistryError::Timeout(limit))?
    }
}

/// Concurrency-safe schema/ID cache.
pub struct SchemaCache {
    core: Arc<CacheCore>,
    registrations: SingleFlight<(String, SchemaKey), i32>,
    lookups: SingleFlight<(String, SchemaKey), i32>,
    by_id: SingleFlight<(String, i32), Schema>,
    by_version: SingleFlight<(String, i32), RegisteredSchema>,
    latest: SingleFlight<String, RegisteredSchema>,
    compatibility: SingleFlight<CompatibilityKey, bool>,
}

impl SchemaCache {
    pub fn new(
        transport: Arc<dyn RegistryTransport>,
        canonicalizer: Arc<dyn Canonicalizer>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            core: Arc::new(CacheCore {
                transport,
                canonicalizer,
                state: RwLock::new(CacheState::default()),
                settings,
            }),
            registrations: SingleFlight::new(),
            lookups: SingleFlight::new(),
            by_id: SingleFlight::new(),
            by_version: SingleFlight::new(),
            latest: SingleFlight::new(),
            compatibility: SingleFlight::new(),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.core.settings
    }

    /// ID of `schema` under `subject`, registering it on a miss.
    pub async fn get_or_register_id(&self, subject: &str, schema: &Schema) -> Result<i32> {
        let key = self.core.canonicalizer.key(schema);
        if let Some(id) = self.core.read().id_for(subject, &key) {
            debug!(subject = subject, schema_id = id, "Schema id cache hit");
            return Ok(id);
        }

        let core = Arc::clone(&self.core);
        let (owned_subject, owned_key, owned_schema) =
            (subject.to_string(), key.clone(), schema.clone());
        let generation = self.core.read().generation;

        self.registrations
            .run(
                (subject.to_string(), key.clone()),
                || self.core.read().id_for(subject, &key),
                move || async move {
                    let id = core
                        .bounded(core.transport.register_schema(&owned_subject, &owned_schema))
                        .await?;
                    if let Some(mut state) = core.commit(generation) {
                        state.insert_pair(
                            &owned_subject,
                            owned_key,
                            id,
                            owned_schema,
                            core.settings.max_entries,
                        )?;
                        debug!(subject = %owned_subject, schema_id = id, "Cached registered schema");
                    }
                    Ok(id)
                },
            )
            .await
    }

    /// ID of an already-registered `schema` under `subject`, without
    /// registering it.
    pub async fn get_id_by_schema(&self, subject: &str, schema: &Schema) -> Result<i32> {
        let key = self.core.canonicalizer.key(schema);
        if let Some(id) = self.core.read().id_for(subject, &key) {
            debug!(subject = subject, schema_id = id, "Schema id cache hit");
            return Ok(id);
        }

        let core = Arc::clone(&self.core);
        let (owned_subject, owned_key, owned_schema) =
            (subject.to_string(), key.clone(), schema.clone());
        let generation = self.core.read().generation;

        self.lookups
            .run(
                (subject.to_string(), key.clone()),
                || self.core.read().id_for(subject, &key),
                move || async move {
                    let registered = core
                        .bounded(core.transport.lookup_schema(&owned_subject, &owned_schema))
                        .await?;
                    if let Some(mut state) = core.commit(generation) {
                        state.insert_pair(
                            &owned_subject,
                            owned_key,
                            registered.id,
                            owned_schema,
                            core.settings.max_entries,
                        )?;
                        state.record_version(&owned_subject, registered.version, registered.id);
                        debug!(
                            subject = %owned_subject,
                            schema_id = registered.id,
                            version = registered.version,
                            "Cached looked-up schema"
                        );
                    }
                    Ok(registered.id)
                },
            )
            .await
    }

    /// Schema with global `id`, as seen under `subject`.
    pub async fn get_schema_by_id(&self, subject: &str, id: i32) -> Result<Schema> {
        if let Some(schema) = self.core.read().schema_for(subject, id) {
            debug!(subject = subject, schema_id = id, "Schema cache hit");
            return Ok(schema.clone());
        }

        let core = Arc::clone(&self.core);
        let owned_subject = subject.to_string();
        let generation = self.core.read().generation;

        self.by_id
            .run(
                (subject.to_string(), id),
                || self.core.read().schema_for(subject, id).cloned(),
                move || async move {
                    let schema = core
                        .bounded(core.transport.get_schema_by_id(id, Some(&owned_subject)))
                        .await?;
                    let key = core.canonicalizer.key(&schema);
                    if let Some(mut state) = core.commit(generation) {
                        state.insert_pair(
                            &owned_subject,
                            key,
                            id,
                            schema.clone(),
                            core.settings.max_entries,
                        )?;
                        debug!(subject = %owned_subject, schema_id = id, "Cached schema by id");
                    }
                    Ok(schema)
                },
            )
            .await
    }

    /// A specific version of `subject`.
    pub async fn get_schema_by_version(
        &self,
        subject: &str,
        version: i32,
    ) -> Result<RegisteredSchema> {
        if let Some(registered) = self.core.read().registered(subject, version) {
            debug!(subject = subject, version = version, "Schema version cache hit");
            return Ok(registered);
        }

        let core = Arc::clone(&self.core);
        let owned_subject = subject.to_string();
        let generation = self.core.read().generation;

        self.by_version
            .run(
                (subject.to_string(), version),
                || self.core.read().registered(subject, version),
                move || async move {
                    let registered = core
                        .bounded(
                            core.transport
                                .get_schema_by_version(&owned_subject, SchemaVersion::Number(version)),
                        )
                        .await?;
                    let key = core.canonicalizer.key(&registered.schema);
                    if let Some(mut state) = core.commit(generation) {
                        state.remember_registered(&registered, key, core.settings.max_entries);
                    }
                    Ok(registered)
                },
            )
            .await
    }

    /// Latest version of `subject`.
    ///
    /// Goes to the registry unless a latest TTL is configured and the cached
    /// entry is younger than it.
    pub async fn get_latest_schema(&self, subject: &str) -> Result<RegisteredSchema> {
        let ttl = self.core.settings.latest_ttl;
        if let Some(latest) = self.core.read().fresh_latest(subject, ttl) {
            debug!(subject = subject, version = latest.version, "Latest schema cache hit");
            return Ok(latest);
        }

        let core = Arc::clone(&self.core);
        let owned_subject = subject.to_string();
        let generation = self.core.read().generation;

        self.latest
            .run(
                subject.to_string(),
                || self.core.read().fresh_latest(subject, ttl),
                move || async move {
                    let registered = core
                        .bounded(
                            core.transport
                                .get_schema_by_version(&owned_subject, SchemaVersion::Latest),
                        )
                        .await?;
                    let key = core.canonicalizer.key(&registered.schema);

                    if let Some(mut state) = core.commit(generation) {
                        let fits =
                            state.remember_registered(&registered, key, core.settings.max_entries);
                        if fits && ttl.is_some() {
                            state
                                .latest
                                .insert(owned_subject.clone(), (registered.clone(), Instant::now()));
                        }
                    }
                    debug!(
                        subject = %owned_subject,
                        schema_id = registered.id,
                        version = registered.version,
                        "Fetched latest schema"
                    );
                    Ok(registered)
                },
            )
            .await
    }

    /// Whether `schema` is compatible with `version` of `subject`.
    ///
    /// Verdicts against a numbered version never change and are cached.
    /// Verdicts against `latest` always go to the registry.
    pub async fn is_compatible(
        &self,
        subject: &str,
        schema: &Schema,
        version: SchemaVersion,
    ) -> Result<bool> {
        let number = match version {
            SchemaVersion::Number(number) => number,
            SchemaVersion::Latest => {
                return self
                    .core
                    .bounded(self.core.transport.check_compatibility(subject, schema, version))
                    .await;
            }
        };

        let cache_key: CompatibilityKey =
            (subject.to_string(), self.core.canonicalizer.key(schema), number);
        if let Some(verdict) = self.core.read().compatibility.get(&cache_key) {
            return Ok(*verdict);
        }

        let core = Arc::clone(&self.core);
        let (owned_subject, owned_schema, owned_key) =
            (subject.to_string(), schema.clone(), cache_key.clone());
        let generation = self.core.read().generation;

        self.compatibility
            .run(
                cache_key.clone(),
                || self.core.read().compatibility.get(&cache_key).copied(),
                move || async move {
                    let verdict = core
                        .bounded(core.transport.check_compatibility(
                            &owned_subject,
                            &owned_schema,
                            version,
                        ))
                        .await?;
                    if let Some(mut state) = core.commit(generation) {
                        state.ensure_room(core.settings.max_entries)?;
                        state.compatibility.insert(owned_key, verdict);
                    }
                    Ok(verdict)
                },
            )
            .await
    }

    /// All subjects known to the registry. Not cached.
    pub async fn get_subjects(&self) -> Result<Vec<String>> {
        self.core.bounded(self.core.transport.get_subjects()).await
    }

    /// Versions registered under `subject`. Not cached.
    pub async fn get_subject_versions(&self, subject: &str) -> Result<Vec<i32>> {
        self.core
            .bounded(self.core.transport.get_subject_versions(subject))
            .await
    }

    /// Drop every cached entry. Calls already in flight when this runs
    /// still return their result but do not cache it.
    pub fn clear(&self) {
        let mut state = self.core.write();
        let generation = state.generation + 1;
        *state = CacheState {
            generation,
            ..CacheState::default()
        };
        debug!(generation = generation, "Schema cache cleared");
    }

    /// Cached id pairs plus compatibility verdicts.
    pub fn len(&self) -> usize {
        self.core.read().entries()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRegistry, Operation};
    use crate::types::JsonCanonicalizer;

    fn user_schema() -> Schema {
        Schema::avro(r#"{"type": "record", "name": "User", "fields": [{"name": "id", "type": "int"}]}"#)
    }

    fn numbered_schema(n: usize) -> Schema {
        Schema::avro(format!(
            r#"{{"type": "record", "name": "R{}", "fields": [{{"name": "id", "type": "int"}}]}}"#,
            n
        ))
    }

    fn cache_with(registry: &Arc<MemoryRegistry>, settings: CacheSettings) -> SchemaCache {
        SchemaCache::new(
            Arc::clone(registry) as Arc<dyn RegistryTransport>,
            Arc::new(JsonCanonicalizer),
            settings,
        )
    }

    fn cache(registry: &Arc<MemoryRegistry>) -> SchemaCache {
        cache_with(registry, CacheSettings::default())
    }

    impl SchemaCache {
        /// Every (subject, key) → id maps back through (subject, id) → key, and
        /// vice versa.
        fn assert_consistent(&self) {
            let state = self.core.read();
            let mut pairs = 0;
            for (subject, ids) in &state.ids {
                for (key, id) in ids {
                    let (back, _) = &state.schemas[subject][id];
                    assert_eq!(back, key, "{} id {} does not map back", subject, id);
                    pairs += 1;
                }
            }
            for (subject, schemas) in &state.schemas {
                for (id, (key, _)) in schemas {
                    assert_eq!(state.ids[subject].get(key), Some(id));
                }
            }
            assert_eq!(pairs, state.pairs);
        }
    }

    #[tokio::test]
    async fn test_register_hit_avoids_transport() {
        let registry = Arc::new(MemoryRegistry::new());
        let cache = cache(&registry);

        let id = cache.get_or_register_id("users-value", &user_schema()).await.unwrap();
        let again = cache.get_or_register_id("users-value", &user_schema()).await.unwrap();

        assert_eq!(id, again);
        assert_eq!(registry.calls(Operation::Register), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_canonically_equal_schema_hits() {
        let registry = Arc::new(MemoryRegistry::new());
        let cache = cache(&registry);
        let reformatted = Schema::avro(
            "{ \"fields\" : [ {\"type\":\"int\",\"name\":\"id\"} ],\n \"name\" : \"User\", \"type\" : \"record\" }",
        );

        let id = cache.get_or_register_id("s", &user_schema()).await.unwrap();
        assert_eq!(cache.get_or_register_id("s", &reformatted).await.unwrap(), id);
        assert_eq!(registry.calls(Operation::Register), 1);
    }

    #[tokio::test]
    async fn test_register_then_get_by_id_round_trip() {
        let registry = Arc::new(MemoryRegistry::new());
        let cache = cache(&registry);

        let id = cache.get_or_register_id("s", &user_schema()).await.unwrap();
        let schema = cache.get_schema_by_id("s", id).await.unwrap();

        assert_eq!(schema, user_schema());
        assert_eq!(registry.calls(Operation::GetById), 0);
        cache.assert_consistent();
    }

    #[tokio::test]
    async fn test_get_by_id_populates_reverse_direction() {
        let registry = Arc::new(MemoryRegistry::new());
        let id = registry.register_schema("s", &user_schema()).await.unwrap();
        let cache = cache(&registry);

        cache.get_schema_by_id("s", id).await.unwrap();
        assert_eq!(cache.get_or_register_id("s", &user_schema()).await.unwrap(), id);
        assert_eq!(cache.get_id_by_schema("s", &user_schema()).await.unwrap(), id);
        assert_eq!(registry.calls(Operation::Register), 1); // the direct one above
        assert_eq!(registry.calls(Operation::Lookup), 0);
    }

    #[tokio::test]
    async fn test_subjects_are_separate_namespaces() {
        let registry = Arc::new(MemoryRegistry::new());
        let cache = cache(&registry);

        let a = cache.get_or_register_id("a-value", &user_schema()).await.unwrap();
        let b = cache.get_or_register_id("b-value", &user_schema()).await.unwrap();

        // Same global id, but each subject needed its own registration
        assert_eq!(a, b);
        assert_eq!(registry.calls(Operation::Register), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached() {
        let registry = Arc::new(MemoryRegistry::new());
        let cache = cache(&registry);

        let err = cache.get_schema_by_id("s", 1).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(cache.is_empty());

        // Registry-side fix
        registry.register_schema("s", &user_schema()).await.unwrap();

        assert_eq!(cache.get_schema_by_id("s", 1).await.unwrap(), user_schema());
        assert_eq!(registry.calls(Operation::GetById), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_cache_unchanged() {
        let registry = Arc::new(MemoryRegistry::new());
        let cache = cache(&registry);
        registry.fail_next(RegistryError::Transport("registry down".into()));

        let err = cache.get_or_register_id("s", &user_schema()).await.unwrap_err();
        assert_eq!(err, RegistryError::Transport("registry down".into()));
        assert!(cache.is_empty());

        assert_eq!(cache.get_or_register_id("s", &user_schema()).await.unwrap(), 1);
        assert_eq!(registry.calls(Operation::Register), 2);
    }

    #[tokio::test]
    async fn test_lookup_records_version() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register_schema("s", &numbered_schema(0)).await.unwrap();
        registry.register_schema("s", &user_schema()).await.unwrap();
        let cache = cache(&registry);

        let id = cache.get_id_by_schema("s", &user_schema()).await.unwrap();
        let v2 = cache.get_schema_by_version("s", 2).await.unwrap();

        assert_eq!(v2.id, id);
        assert_eq!(v2.schema, user_schema());
        assert_eq!(registry.calls(Operation::GetByVersion), 0);
    }

    #[tokio::test]
    async fn test_lookup_of_unregistered_schema_is_not_found() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register_schema("s", &numbered_schema(0)).await.unwrap();
        let cache = cache(&registry);

        assert!(cache
            .get_id_by_schema("s", &user_schema())
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(registry.calls(Operation::Register), 1);
    }

    #[tokio::test]
    async fn test_get_by_version_cached() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register_schema("s", &user_schema()).await.unwrap();
        let cache = cache(&registry);

        let first = cache.get_schema_by_version("s", 1).await.unwrap();
        let second = cache.get_schema_by_version("s", 1).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.calls(Operation::GetByVersion), 1);

        // The version fetch also fills the id pair
        cache.get_schema_by_id("s", first.id).await.unwrap();
        assert_eq!(registry.calls(Operation::GetById), 0);
    }

    #[tokio::test]
    async fn test_latest_without_ttl_always_fetches() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register_schema("s", &user_schema()).await.unwrap();
        let cache = cache(&registry);

        let v1 = cache.get_latest_schema("s").await.unwrap();
        assert_eq!(v1.version, 1);

        registry.register_schema("s", &numbered_schema(1)).await.unwrap();
        let v2 = cache.get_latest_schema("s").await.unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(registry.calls(Operation::GetByVersion), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_with_ttl_served_until_expiry() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register_schema("s", &user_schema()).await.unwrap();
        let cache = cache_with(
            &registry,
            CacheSettings {
                latest_ttl: Some(Duration::from_millis(200)),
                ..Default::default()
            },
        );

        assert_eq!(cache.get_latest_schema("s").await.unwrap().version, 1);
        registry.register_schema("s", &numbered_schema(1)).await.unwrap();
        assert_eq!(cache.get_latest_schema("s").await.unwrap().version, 1);
        assert_eq!(registry.calls(Operation::GetByVersion), 1);

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(cache.get_latest_schema("s").await.unwrap().version, 2);
        assert_eq!(registry.calls(Operation::GetByVersion), 2);
    }

    #[tokio::test]
    async fn test_compatibility_cached_for_numbered_versions_only() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register_schema("s", &user_schema()).await.unwrap();
        let cache = cache(&registry);
        let candidate = numbered_schema(1);

        assert!(cache.is_compatible("s", &candidate, 1.into()).await.unwrap());
        assert!(cache.is_compatible("s", &candidate, 1.into()).await.unwrap());
        assert_eq!(registry.calls(Operation::CheckCompatibility), 1);

        registry.set_compatible(false);
        assert!(!cache
            .is_compatible("s", &candidate, SchemaVersion::Latest)
            .await
            .unwrap());
        assert!(!cache
            .is_compatible("s", &candidate, SchemaVersion::Latest)
            .await
            .unwrap());
        assert_eq!(registry.calls(Operation::CheckCompatibility), 3);
    }

    #[tokio::test]
    async fn test_capacity_overflow_is_per_call() {
        let registry = Arc::new(MemoryRegistry::new());
        let cache = cache_with(
            &registry,
            CacheSettings {
                max_entries: Some(2),
                ..Default::default()
            },
        );

        let a = cache.get_or_register_id("s", &numbered_schema(1)).await.unwrap();
        let b = cache.get_or_register_id("s", &numbered_schema(2)).await.unwrap();

        let err = cache.get_or_register_id("s", &numbered_schema(3)).await.unwrap_err();
        assert_eq!(err, RegistryError::CacheOverflow { capacity: 2 });

        // Existing entries are intact and still served without I/O
        assert_eq!(cache.get_or_register_id("s", &numbered_schema(1)).await.unwrap(), a);
        assert_eq!(cache.get_schema_by_id("s", b).await.unwrap(), numbered_schema(2));
        assert_eq!(registry.calls(Operation::Register), 3);
        assert_eq!(cache.len(), 2);
        cache.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot() {
        let registry = Arc::new(MemoryRegistry::new());
        let cache = cache_with(
            &registry,
            CacheSettings {
                operation_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );
        registry.set_latency(Some(Duration::from_secs(1)));
        let schema = user_schema();

        let (a, b) = tokio::join!(
            cache.get_or_register_id("s", &schema),
            cache.get_or_register_id("s", &schema),
        );
        assert_eq!(a.unwrap_err(), RegistryError::Timeout(Duration::from_millis(100)));
        assert_eq!(b.unwrap_err(), RegistryError::Timeout(Duration::from_millis(100)));
        assert_eq!(registry.calls(Operation::Register), 1);
        assert!(cache.is_empty());

        registry.set_latency(None);
        assert_eq!(cache.get_or_register_id("s", &user_schema()).await.unwrap(), 1);
        assert_eq!(registry.calls(Operation::Register), 2);
    }

    #[tokio::test]
    async fn test_clear_forgets_everything() {
        let registry = Arc::new(MemoryRegistry::new());
        let cache = cache(&registry);

        let id = cache.get_or_register_id("s", &user_schema()).await.unwrap();
        cache.clear();
        assert!(cache.is_empty());

        cache.get_schema_by_id("s", id).await.unwrap();
        assert_eq!(registry.calls(Operation::GetById), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discards_in_flight_result() {
        let registry = Arc::new(MemoryRegistry::new());
        let cache = cache(&registry);
        registry.set_latency(Some(Duration::from_millis(200)));
        let schema = user_schema();

        let (id, ()) = tokio::join!(cache.get_or_register_id("s", &schema), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cache.clear();
        });

        // The caller still gets the registry's answer
        assert_eq!(id.unwrap(), 1);
        assert!(cache.is_empty());

        registry.set_latency(None);
        cache.get_or_register_id("s", &schema).await.unwrap();
        assert_eq!(registry.calls(Operation::Register), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_reads_succeed_when_cache_is_full() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register_schema("b", &numbered_schema(2)).await.unwrap();
        let cache = cache_with(
            &registry,
            CacheSettings {
                max_entries: Some(1),
                latest_ttl: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        );
        cache.get_or_register_id("a", &numbered_schema(1)).await.unwrap();

        let latest = cache.get_latest_schema("b").await.unwrap();
        assert_eq!((latest.version, latest.schema), (1, numbered_schema(2)));
        let v1 = cache.get_schema_by_version("b", 1).await.unwrap();
        assert_eq!(v1.schema, numbered_schema(2));

        // Nothing from "b" fit, so neither the version nor the latest entry stuck
        assert_eq!(cache.len(), 1);
        cache.get_latest_schema("b").await.unwrap();
        cache.get_schema_by_version("b", 1).await.unwrap();
        assert_eq!(registry.calls(Operation::GetByVersion), 4);
        cache.assert_consistent();
    }

    #[tokio::test]
    async fn test_latest_without_ttl_succeeds_when_cache_is_full() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register_schema("b", &numbered_schema(2)).await.unwrap();
        let cache = cache_with(
            &registry,
            CacheSettings {
                max_entries: Some(1),
                ..Default::default()
            },
        );
        cache.get_or_register_id("a", &numbered_schema(1)).await.unwrap();

        assert_eq!(cache.get_latest_schema("b").await.unwrap().version, 1);
        assert_eq!(cache.get_schema_by_version("b", 1).await.unwrap().id, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_insert_pair_replaces_stale_links() {
        let canon = JsonCanonicalizer;
        let mut state = CacheState::default();
        let a = numbered_schema(1);
        let b = numbered_schema(2);

        state.insert_pair("s", canon.key(&a), 1, a.clone(), None).unwrap();
        // Registry reassigned a new id to the same schema
        state.insert_pair("s", canon.key(&a), 5, a.clone(), None).unwrap();
        assert_eq!(state.id_for("s", &canon.key(&a)), Some(5));
        assert!(state.schema_for("s", 1).is_none());
        assert_eq!(state.pairs, 1);

        // Id 5 now claimed by a different schema
        state.insert_pair("s", canon.key(&b), 5, b.clone(), None).unwrap();
        assert_eq!(state.id_for("s", &canon.key(&a)), None);
        assert_eq!(state.schema_for("s", 5), Some(&b));
        assert_eq!(state.pairs, 1);
    }
}
