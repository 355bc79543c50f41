//! HTTP transport for Confluent-compatible schema registries.
//!
//! Maps each [`RegistryTransport`] operation onto one REST call:
//!
//! | operation               | request                                                  |
//! |-------------------------|----------------------------------------------------------|
//! | `register_schema`       | `POST /subjects/{subject}/versions`                      |
//! | `get_schema_by_id`      | `GET /schemas/ids/{id}[?subject=]`                       |
//! | `lookup_schema`         | `POST /subjects/{subject}`                               |
//! | `get_schema_by_version` | `GET /subjects/{subject}/versions/{version}`             |
//! | `check_compatibility`   | `POST /compatibility/subjects/{subject}/versions/{ver}`  |
//! | `get_subjects`          | `GET /subjects`                                          |
//! | `get_subject_versions`  | `GET /subjects/{subject}/versions`                       |
//!
//! Each call walks the configured endpoints (failing over on connection
//! errors, timeouts and 5xx) and the whole walk is retried per the
//! [`RetryPolicy`].

use crate::config::ClientSettings;
use crate::error::{RegistryError, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::transport::{EndpointRotation, RegistryTransport};
use crate::types::{RegisteredSchema, Schema, SchemaFormat, SchemaReference, SchemaVersion};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const SCHEMA_REGISTRY_CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

/// Schema registration response
#[derive(Debug, Deserialize)]
struct RegisterSchemaResponse {
    id: i32,
}

/// Subject/version lookup response
#[derive(Debug, Deserialize)]
struct SubjectVersionResponse {
    subject: String,
    id: i32,
    version: i32,
    schema: String,

    #[serde(rename = "schemaType", default)]
    schema_type: SchemaFormat,

    #[serde(default)]
    references: Vec<SchemaReference>,
}

impl From<SubjectVersionResponse> for RegisteredSchema {
    fn from(r: SubjectVersionResponse) -> Self {
        RegisteredSchema {
            subject: r.subject,
            id: r.id,
            version: r.version,
            schema: Schema {
                schema: r.schema,
                schema_type: r.schema_type,
                references: r.references,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompatibilityResponse {
    is_compatible: bool,
}

/// Error body sent by the registry on non-2xx responses
#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    error_code: Option<i32>,
    message: Option<String>,
}

/// One REST request, independent of which endpoint serves it.
struct Request<'a> {
    method: Method,
    path: Vec<String>,
    query: Option<(&'static str, &'a str)>,
    body: Option<Vec<u8>>,
    /// What a 404 means, for the error message
    resource: String,
}

/// reqwest-backed [`RegistryTransport`].
pub struct HttpTransport {
    endpoints: EndpointRotation,
    http_client: reqwest::Client,
    basic_auth: Option<(String, String)>,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl HttpTransport {
    /// Build the HTTP client from validated settings. Performs no I/O.
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(settings.request_timeout);

        if let Some(tls) = &settings.tls {
            let identity = reqwest::Identity::from_pem(&tls.identity_pem).map_err(|e| {
                RegistryError::Configuration(format!("invalid client identity: {}", e))
            })?;
            builder = builder.identity(identity);

            if let Some(ca) = &tls.ca_pem {
                let certificate = reqwest::Certificate::from_pem(ca).map_err(|e| {
                    RegistryError::Configuration(format!("invalid CA certificate: {}", e))
                })?;
                builder = builder.add_root_certificate(certificate);
            }
        }

        let http_client = builder.build().map_err(|e| {
            RegistryError::Configuration(format!("failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            endpoints: EndpointRotation::new(settings.endpoints.clone()),
            http_client,
            basic_auth: settings.basic_auth.clone(),
            request_timeout: settings.request_timeout,
            retry: settings.retry.clone(),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        self.endpoints.endpoints()
    }

    async fn execute<T: DeserializeOwned>(&self, request: Request<'_>) -> Result<T> {
        retry_with_backoff(&self.retry, || self.try_endpoints(&request)).await
    }

    /// One attempt: every endpoint at most once, in rotation order.
    async fn try_endpoints<T: DeserializeOwned>(&self, request: &Request<'_>) -> Result<T> {
        let mut last_error = None;

        for (index, base) in self.endpoints.ordered() {
            match self.send_once(base, request).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!(
                        endpoint = %base,
                        error = %e,
                        "Registry endpoint failed, trying next"
                    );
                    self.endpoints.advance_past(index);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| RegistryError::Internal("no registry endpoints".to_string())))
    }

    async fn send_once<T: DeserializeOwned>(&self, base: &str, request: &Request<'_>) -> Result<T> {
        let url = build_url(base, &request.path, request.query)?;

        let mut builder = self
            .http_client
            .request(request.method.clone(), url)
            .header(ACCEPT, SCHEMA_REGISTRY_CONTENT_TYPE);
        if let Some((user, password)) = &self.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, SCHEMA_REGISTRY_CONTENT_TYPE)
                .body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        if status.is_success() {
            return serde_json::from_slice(&bytes).map_err(|e| {
                RegistryError::Serialization(format!(
                    "Failed to parse registry response: {}",
                    e
                ))
            });
        }

        Err(classify_failure(
            status.as_u16(),
            &bytes,
            &request.resource,
        ))
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> RegistryError {
        if e.is_timeout() {
            RegistryError::Timeout(self.request_timeout)
        } else {
            RegistryError::Transport(e.to_string())
        }
    }
}

fn build_url(base: &str, path: &[String], query: Option<(&str, &str)>) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| RegistryError::Internal(format!("invalid endpoint '{}': {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| RegistryError::Internal(format!("endpoint '{}' cannot be a base", base)))?
        .pop_if_empty()
        .extend(path);
    if let Some((key, value)) = query {
        url.query_pairs_mut().append_pair(key, value);
    }
    Ok(url)
}

/// Turn a non-2xx response into an error.
fn classify_failure(status: u16, body: &[u8], resource: &str) -> RegistryError {
    let parsed: ErrorResponse = serde_json::from_slice(body).unwrap_or_default();
    let message = parsed
        .message
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());

    match status {
        404 => RegistryError::NotFound {
            resource: resource.to_string(),
            error_code: parsed.error_code,
            message,
        },
        408 | 429 | 500..=599 => RegistryError::Transport(format!(
            "registry returned status {}: {}",
            status, message
        )),
        _ => RegistryError::Rejected {
            status,
            error_code: parsed.error_code,
            message,
        },
    }
}

fn subject_resource(subject: &str) -> String {
    format!("subject '{}'", subject)
}

#[async_trait]
impl RegistryTransport for HttpTransport {
    async fn register_schema(&self, subject: &str, schema: &Schema) -> Result<i32> {
        let response: RegisterSchemaResponse = self
            .execute(Request {
                method: Method::POST,
                path: vec!["subjects".into(), subject.into(), "versions".into()],
                query: None,
                body: Some(serde_json::to_vec(schema)?),
                resource: subject_resource(subject),
            })
            .await?;

        debug!(
            schema_id = response.id,
            subject = subject,
            format = ?schema.schema_type,
            "Schema registered successfully"
        );
        Ok(response.id)
    }

    async fn get_schema_by_id(&self, id: i32, subject: Option<&str>) -> Result<Schema> {
        let schema: Schema = self
            .execute(Request {
                method: Method::GET,
                path: vec!["schemas".into(), "ids".into(), id.to_string()],
                query: subject.map(|s| ("subject", s)),
                body: None,
                resource: format!("schema id {}", id),
            })
            .await?;

        debug!(schema_id = id, "Schema retrieved successfully");
        Ok(schema)
    }

    async fn lookup_schema(&self, subject: &str, schema: &Schema) -> Result<RegisteredSchema> {
        let response: SubjectVersionResponse = self
            .execute(Request {
                method: Method::POST,
                path: vec!["subjects".into(), subject.into()],
                query: None,
                body: Some(serde_json::to_vec(schema)?),
                resource: format!("schema under {}", subject_resource(subject)),
            })
            .await?;
        Ok(response.into())
    }

    async fn get_schema_by_version(
        &self,
        subject: &str,
        version: SchemaVersion,
    ) -> Result<RegisteredSchema> {
        let response: SubjectVersionResponse = self
            .execute(Request {
                method: Method::GET,
                path: vec![
                    "subjects".into(),
                    subject.into(),
                    "versions".into(),
                    version.to_string(),
                ],
                query: None,
                body: None,
                resource: format!("{} version {}", subject_resource(subject), version),
            })
            .await?;

        debug!(
            schema_id = response.id,
            subject = subject,
            version = response.version,
            "Schema version retrieved successfully"
        );
        Ok(response.into())
    }

    async fn check_compatibility(
        &self,
        subject: &str,
        schema: &Schema,
        version: SchemaVersion,
    ) -> Result<bool> {
        let response: CompatibilityResponse = self
            .execute(Request {
                method: Method::POST,
                path: vec![
                    "compatibility".into(),
                    "subjects".into(),
                    subject.into(),
                    "versions".into(),
                    version.to_string(),
                ],
                query: None,
                body: Some(serde_json::to_vec(schema)?),
                resource: format!("{} version {}", subject_resource(subject), version),
            })
            .await?;

        debug!(
            subject = subject,
            version = %version,
            is_compatible = response.is_compatible,
            "Compatibility test completed"
        );
        Ok(response.is_compatible)
    }

    async fn get_subjects(&self) -> Result<Vec<String>> {
        self.execute(Request {
            method: Method::GET,
            path: vec!["subjects".into()],
            query: None,
            body: None,
            resource: "subjects".to_string(),
        })
        .await
    }

    async fn get_subject_versions(&self, subject: &str) -> Result<Vec<i32>> {
        self.execute(Request {
            method: Method::GET,
            path: vec!["subjects".into(), subject.into(), "versions".into()],
            query: None,
            body: None,
            resource: subject_resource(subject),
        })
        .await
    }
}
