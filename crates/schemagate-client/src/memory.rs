//! In-memory registry.
//!
//! [`MemoryRegistry`] implements [`RegistryTransport`] without any network:
//! IDs are global and assigned from a counter, versions are per subject, and
//! registering a schema that is already known (up to canonical equality)
//! returns the existing ID, as a real registry does.
//!
//! It counts calls per operation and can inject latency and transient
//! failures, which makes it the workhorse of the cache tests. It is also
//! usable as an offline registry in application tests.

use crate::error::{RegistryError, Result};
use crate::transport::RegistryTransport;
use crate::types::{
    Canonicalizer, JsonCanonicalizer, RegisteredSchema, Schema, SchemaKey, SchemaVersion,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Registry operations, for call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Register,
    GetById,
    Lookup,
    GetByVersion,
    CheckCompatibility,
    ListSubjects,
    ListVersions,
}

const OPERATIONS: usize = 7;

impl Operation {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct RegistryState {
    next_id: i32,
    ids: HashMap<SchemaKey, i32>,
    schemas: HashMap<i32, Schema>,
    /// Subject -> (version, id), in version order
    subjects: HashMap<String, Vec<(i32, i32)>>,
}

/// In-memory [`RegistryTransport`].
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
    canonicalizer: Arc<dyn Canonicalizer>,
    calls: [AtomicUsize; OPERATIONS],
    latency: Mutex<Option<Duration>>,
    failures: Mutex<VecDeque<RegistryError>>,
    compatible: AtomicBool,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_canonicalizer(Arc::new(JsonCanonicalizer))
    }

    pub fn with_canonicalizer(canonicalizer: Arc<dyn Canonicalizer>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: 1,
                ..Default::default()
            }),
            canonicalizer,
            calls: Default::default(),
            latency: Mutex::new(None),
            failures: Mutex::new(VecDeque::new()),
            compatible: AtomicBool::new(true),
        }
    }

    /// Number of calls made for `op`, including failed ones.
    pub fn calls(&self, op: Operation) -> usize {
        self.calls[op.index()].load(Ordering::SeqCst)
    }

    /// Total calls across every operation.
    pub fn total_calls(&self) -> usize {
        self.calls.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Fail the next call (of any operation) with `error`. Queued errors are
    /// consumed in order.
    pub fn fail_next(&self, error: RegistryError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Verdict returned by `check_compatibility`.
    pub fn set_compatible(&self, compatible: bool) {
        self.compatible.store(compatible, Ordering::SeqCst);
    }

    /// Remove a subject and all its versions. Schema IDs stay resolvable
    /// globally, as on a real registry after a soft delete.
    pub fn delete_subject(&self, subject: &str) -> Vec<i32> {
        self.lock_state()
            .subjects
            .remove(subject)
            .map(|versions| versions.into_iter().map(|(v, _)| v).collect())
            .unwrap_or_default()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, apply latency and injected failures.
    async fn enter(&self, op: Operation) -> Result<()> {
        self.calls[op.index()].fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn subject_not_found(subject: &str) -> RegistryError {
        RegistryError::not_found(
            format!("subject '{}'", subject),
            40401,
            format!("Subject '{}' not found.", subject),
        )
    }

    fn registered(
        state: &RegistryState,
        subject: &str,
        version: i32,
        id: i32,
    ) -> Result<RegisteredSchema> {
        let schema = state
            .schemas
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::Internal(format!("dangling schema id {}", id)))?;
        Ok(RegisteredSchema {
            subject: subject.to_string(),
            id,
            version,
            schema,
        })
    }
}

#[async_trait]
impl RegistryTransport for MemoryRegistry {
    async fn register_schema(&self, subject: &str, schema: &Schema) -> Result<i32> {
        self.enter(Operation::Register).await?;
        let key = self.canonicalizer.key(schema);

        let mut state = self.lock_state();
        let existing = state.ids.get(&key).copied();
        let id = match existing {
            Some(id) => id,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                state.ids.insert(key, id);
                state.schemas.insert(id, schema.clone());
                id
            }
        };

        let versions = state.subjects.entry(subject.to_string()).or_default();
        if !versions.iter().any(|(_, existing)| *existing == id) {
            let version = versions.last().map(|(v, _)| v + 1).unwrap_or(1);
            versions.push((version, id));
            tracing::debug!(id = id, subject = subject, version = version, "Schema registered");
        }

        Ok(id)
    }

    async fn get_schema_by_id(&self, id: i32, subject: Option<&str>) -> Result<Schema> {
        self.enter(Operation::GetById).await?;
        let state = self.lock_state();

        if let Some(subject) = subject {
            let in_subject = state
                .subjects
                .get(subject)
                .map(|versions| versions.iter().any(|(_, existing)| *existing == id))
                .unwrap_or(false);
            if !in_subject {
                return Err(RegistryError::not_found(
                    format!("schema id {} under subject '{}'", id, subject),
                    40403,
                    "Schema not found",
                ));
            }
        }

        state
            .schemas
            .get(&id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(
                format!("schema id {}", id),
                40403,
                "Schema not found",
            ))
    }

    async fn lookup_schema(&self, subject: &str, schema: &Schema) -> Result<RegisteredSchema> {
        self.enter(Operation::Lookup).await?;
        let key = self.canonicalizer.key(schema);
        let state = self.lock_state();

        let versions = state
            .subjects
            .get(subject)
            .ok_or_else(|| Self::subject_not_found(subject))?;
        let found = state
            .ids
            .get(&key)
            .and_then(|id| versions.iter().find(|(_, existing)| existing == id));

        match found {
            Some((version, id)) => Self::registered(&state, subject, *version, *id),
            None => Err(RegistryError::not_found(
                format!("schema under subject '{}'", subject),
                40403,
                "Schema not found",
            )),
        }
    }

    async fn get_schema_by_version(
        &self,
        subject: &str,
        version: SchemaVersion,
    ) -> Result<RegisteredSchema> {
        self.enter(Operation::GetByVersion).await?;
        let state = self.lock_state();

        let versions = state
            .subjects
            .get(subject)
            .ok_or_else(|| Self::subject_not_found(subject))?;
        let found = match version {
            SchemaVersion::Latest => versions.last(),
            SchemaVersion::Number(n) => versions.iter().find(|(v, _)| *v == n),
        };

        match found {
            Some((v, id)) => Self::registered(&state, subject, *v, *id),
            None => Err(RegistryError::not_found(
                format!("subject '{}' version {}", subject, version),
                40402,
                "Version not found.",
            )),
        }
    }

    async fn check_compatibility(
        &self,
        subject: &str,
        _schema: &Schema,
        version: SchemaVersion,
    ) -> Result<bool> {
        self.enter(Operation::CheckCompatibility).await?;
        let state = self.lock_state();

        let versions = state
            .subjects
            .get(subject)
            .ok_or_else(|| Self::subject_not_found(subject))?;
        let exists = match version {
            SchemaVersion::Latest => !versions.is_empty(),
            SchemaVersion::Number(n) => versions.iter().any(|(v, _)| *v == n),
        };
        if !exists {
            return Err(RegistryError::not_found(
                format!("subject '{}' version {}", subject, version),
                40402,
                "Version not found.",
            ));
        }

        Ok(self.compatible.load(Ordering::SeqCst))
    }

    async fn get_subjects(&self) -> Result<Vec<String>> {
        self.enter(Operation::ListSubjects).await?;
        let mut subjects: Vec<String> = self.lock_state().subjects.keys().cloned().collect();
        subjects.sort();
        Ok(subjects)
    }

    async fn get_subject_versions(&self, subject: &str) -> Result<Vec<i32>> {
        self.enter(Operation::ListVersions).await?;
        self.lock_state()
            .subjects
            .get(subject)
            .map(|versions| versions.iter().map(|(v, _)| *v).collect())
            .ok_or_else(|| Self::subject_not_found(subject))
    }
}
