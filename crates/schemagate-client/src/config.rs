//! Client configuration.
//!
//! [`SchemaRegistryConfig`] is a string property map using the
//! `schema.registry.*` keys familiar from Confluent clients, with typed
//! builder-style setters on top. Nothing is interpreted until
//! [`ClientSettings::from_config`] validates the whole map once, when the
//! client is built. Every problem found there is a
//! [`RegistryError::Configuration`].
//!
//! ```ignore
//! let config = SchemaRegistryConfig::new()
//!     .url("http://registry-1:8081,http://registry-2:8081")
//!     .value_subject_name_strategy(SubjectNameStrategy::TopicRecord)
//!     .max_cached_schemas(10_000);
//! ```

use crate::error::{RegistryError, Result};
use crate::retry::RetryPolicy;
use crate::subject::{SubjectNameResolver, SubjectNameStrategy};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Property names understood by [`SchemaRegistryConfig`].
pub mod keys {
    pub const URL: &str = "schema.registry.url";
    pub const KEY_SUBJECT_NAME_STRATEGY: &str = "schema.registry.key.subject.name.strategy";
    pub const VALUE_SUBJECT_NAME_STRATEGY: &str = "schema.registry.value.subject.name.strategy";
    pub const SECURITY_PROTOCOL: &str = "schema.registry.security.protocol";
    pub const SSL_KEYSTORE_LOCATION: &str = "schema.registry.ssl.keystore.location";
    pub const SSL_CA_LOCATION: &str = "schema.registry.ssl.ca.location";
    pub const BASIC_AUTH_USER_INFO: &str = "schema.registry.basic.auth.user.info";
    pub const REQUEST_TIMEOUT_MS: &str = "schema.registry.request.timeout.ms";
    pub const OPERATION_TIMEOUT_MS: &str = "schema.registry.operation.timeout.ms";
    pub const MAX_CACHED_SCHEMAS: &str = "schema.registry.max.cached.schemas";
    pub const LATEST_CACHE_TTL_SECS: &str = "schema.registry.latest.cache.ttl.secs";
    pub const MAX_RETRIES: &str = "schema.registry.max.retries";
    pub const RETRIES_WAIT_MS: &str = "schema.registry.retries.wait.ms";
    pub const RETRIES_MAX_WAIT_MS: &str = "schema.registry.retries.max.wait.ms";
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_RETRIES_WAIT: Duration = Duration::from_millis(100);
const DEFAULT_RETRIES_MAX_WAIT: Duration = Duration::from_secs(5);

/// Transport security for registry connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
        }
    }

    fn default_scheme(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "http",
            SecurityProtocol::Ssl => "https",
        }
    }
}

impl fmt::Display for SecurityProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityProtocol {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plaintext" => Ok(SecurityProtocol::Plaintext),
            "ssl" => Ok(SecurityProtocol::Ssl),
            _ => Err(RegistryError::Configuration(format!(
                "unknown security protocol '{}' (expected plaintext or ssl)",
                s
            ))),
        }
    }
}

/// Raw schema registry client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRegistryConfig {
    properties: BTreeMap<String, String>,
}

impl SchemaRegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(key, value)` pairs, e.g. a section of an application
    /// config file.
    pub fn from_properties<I, K, V>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Set a raw property. Values are validated when the client is built.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// One or more comma-separated endpoint URLs.
    pub fn url(self, url: impl Into<String>) -> Self {
        self.with(keys::URL, url)
    }

    pub fn key_subject_name_strategy(self, strategy: SubjectNameStrategy) -> Self {
        self.with(keys::KEY_SUBJECT_NAME_STRATEGY, strategy.as_str())
    }

    pub fn value_subject_name_strategy(self, strategy: SubjectNameStrategy) -> Self {
        self.with(keys::VALUE_SUBJECT_NAME_STRATEGY, strategy.as_str())
    }

    pub fn security_protocol(self, protocol: SecurityProtocol) -> Self {
        self.with(keys::SECURITY_PROTOCOL, protocol.as_str())
    }

    /// PEM file holding the client certificate chain and private key.
    pub fn ssl_keystore_location(self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.with(keys::SSL_KEYSTORE_LOCATION, path)
    }

    /// PEM file holding additional trusted root certificates.
    pub fn ssl_ca_location(self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.with(keys::SSL_CA_LOCATION, path)
    }

    pub fn basic_auth(self, username: &str, password: &str) -> Self {
        self.with(keys::BASIC_AUTH_USER_INFO, format!("{}:{}", username, password))
    }

    pub fn request_timeout(self, timeout: Duration) -> Self {
        self.with(keys::REQUEST_TIMEOUT_MS, timeout.as_millis().to_string())
    }

    pub fn operation_timeout(self, timeout: Duration) -> Self {
        self.with(keys::OPERATION_TIMEOUT_MS, timeout.as_millis().to_string())
    }

    pub fn max_cached_schemas(self, capacity: usize) -> Self {
        self.with(keys::MAX_CACHED_SCHEMAS, capacity.to_string())
    }

    pub fn latest_cache_ttl(self, ttl: Duration) -> Self {
        self.with(keys::LATEST_CACHE_TTL_SECS, ttl.as_secs().to_string())
    }

    pub fn max_retries(self, retries: usize) -> Self {
        self.with(keys::MAX_RETRIES, retries.to_string())
    }

    pub fn retry_backoff(self, initial: Duration, max: Duration) -> Self {
        self.with(keys::RETRIES_WAIT_MS, initial.as_millis().to_string())
            .with(keys::RETRIES_MAX_WAIT_MS, max.as_millis().to_string())
    }

    fn parse_number<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                RegistryError::Configuration(format!(
                    "{} must be a non-negative integer, got '{}'",
                    key, raw
                ))
            }),
        }
    }
}

/// PEM material loaded for SSL connections.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub identity_pem: Vec<u8>,
    pub ca_pem: Option<Vec<u8>>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("identity_pem", &format_args!("<{} bytes>", self.identity_pem.len()))
            .field("ca_pem", &self.ca_pem.as_ref().map(Vec::len))
            .finish()
    }
}

/// Validated client settings.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Normalized endpoint base URLs, in failover order
    pub endpoints: Vec<String>,
    pub subject_names: SubjectNameResolver,
    pub security_protocol: SecurityProtocol,
    pub tls: Option<TlsMaterial>,
    pub basic_auth: Option<(String, String)>,
    /// Bound on a single HTTP attempt
    pub request_timeout: Duration,
    /// Bound on one transport call (all attempts) as seen by the cache
    pub operation_timeout: Duration,
    pub max_cached_schemas: Option<usize>,
    /// `None` means latest lookups always go to the registry
    pub latest_cache_ttl: Option<Duration>,
    pub retry: RetryPolicy,
}

impl ClientSettings {
    /// Validate a configuration. Reads credential files but performs no
    /// network I/O.
    pub fn from_config(config: &SchemaRegistryConfig) -> Result<Self> {
        let security_protocol = match config.get(keys::SECURITY_PROTOCOL) {
            Some(token) => token.parse()?,
            None => SecurityProtocol::default(),
        };

        let endpoints = parse_endpoints(config.get(keys::URL), security_protocol)?;

        let subject_names = SubjectNameResolver::new(
            parse_strategy(config, keys::KEY_SUBJECT_NAME_STRATEGY)?,
            parse_strategy(config, keys::VALUE_SUBJECT_NAME_STRATEGY)?,
        );

        let tls = match security_protocol {
            SecurityProtocol::Ssl => Some(load_tls_material(config)?),
            SecurityProtocol::Plaintext => None,
        };

        let basic_auth = match config.get(keys::BASIC_AUTH_USER_INFO) {
            None => None,
            Some(info) => {
                let (user, password) = info.split_once(':').ok_or_else(|| {
                    RegistryError::Configuration(format!(
                        "{} must have the form 'user:password'",
                        keys::BASIC_AUTH_USER_INFO
                    ))
                })?;
                Some((user.to_string(), password.to_string()))
            }
        };

        let request_timeout = config
            .parse_number::<u64>(keys::REQUEST_TIMEOUT_MS)?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let operation_timeout = config
            .parse_number::<u64>(keys::OPERATION_TIMEOUT_MS)?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_OPERATION_TIMEOUT);

        let max_cached_schemas = config.parse_number::<usize>(keys::MAX_CACHED_SCHEMAS)?;
        let latest_cache_ttl = config
            .parse_number::<u64>(keys::LATEST_CACHE_TTL_SECS)?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let retry = RetryPolicy::new(
            config
                .parse_number::<usize>(keys::MAX_RETRIES)?
                .unwrap_or(DEFAULT_MAX_RETRIES),
            config
                .parse_number::<u64>(keys::RETRIES_WAIT_MS)?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRIES_WAIT),
            config
                .parse_number::<u64>(keys::RETRIES_MAX_WAIT_MS)?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRIES_MAX_WAIT),
            2.0,
        );

        Ok(Self {
            endpoints,
            subject_names,
            security_protocol,
            tls,
            basic_auth,
            request_timeout,
            operation_timeout,
            max_cached_schemas,
            latest_cache_ttl,
            retry,
        })
    }
}

fn parse_strategy(config: &SchemaRegistryConfig, key: &str) -> Result<SubjectNameStrategy> {
    match config.get(key) {
        None => Ok(SubjectNameStrategy::default()),
        Some(token) => token.parse().map_err(|_| {
            RegistryError::Configuration(format!(
                "{}: unknown subject name strategy '{}' (expected Topic, Record or TopicRecord)",
                key, token
            ))
        }),
    }
}

fn parse_endpoints(raw: Option<&str>, protocol: SecurityProtocol) -> Result<Vec<String>> {
    let raw = raw.ok_or_else(|| {
        RegistryError::Configuration(format!("{} must be specified", keys::URL))
    })?;

    let mut endpoints = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let url = if part.contains("://") {
            part.to_string()
        } else {
            format!("{}://{}", protocol.default_scheme(), part)
        };
        let url = url.trim_end_matches('/').to_string();

        reqwest::Url::parse(&url).map_err(|e| {
            RegistryError::Configuration(format!("invalid registry url '{}': {}", part, e))
        })?;
        endpoints.push(url);
    }

    if endpoints.is_empty() {
        return Err(RegistryError::Configuration(format!(
            "{} must contain at least one url",
            keys::URL
        )));
    }
    Ok(endpoints)
}

fn load_tls_material(config: &SchemaRegistryConfig) -> Result<TlsMaterial> {
    let keystore = config
        .get(keys::SSL_KEYSTORE_LOCATION)
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| {
            RegistryError::Configuration(format!(
                "{} is required when {} is ssl",
                keys::SSL_KEYSTORE_LOCATION,
                keys::SECURITY_PROTOCOL
            ))
        })?;

    let identity_pem = read_pem(keys::SSL_KEYSTORE_LOCATION, keystore)?;
    reqwest::Identity::from_pem(&identity_pem).map_err(|e| {
        RegistryError::Configuration(format!(
            "{} '{}' is not a PEM certificate and private key: {}",
            keys::SSL_KEYSTORE_LOCATION,
            keystore,
            e
        ))
    })?;

    let ca_pem = match config.get(keys::SSL_CA_LOCATION) {
        None => None,
        Some(location) => {
            let pem = read_pem(keys::SSL_CA_LOCATION, location)?;
            reqwest::Certificate::from_pem(&pem).map_err(|e| {
                RegistryError::Configuration(format!(
                    "{} '{}' is not a PEM certificate: {}",
                    keys::SSL_CA_LOCATION,
                    location,
                    e
                ))
            })?;
            Some(pem)
        }
    };

    Ok(TlsMaterial {
        identity_pem,
        ca_pem,
    })
}

fn read_pem(key: &str, location: &str) -> Result<Vec<u8>> {
    let path = PathBuf::from(location);
    std::fs::read(&path).map_err(|e| {
        RegistryError::Configuration(format!(
            "{} '{}' could not be read: {}",
            key,
            path.display(),
            e
        ))
    })
}
