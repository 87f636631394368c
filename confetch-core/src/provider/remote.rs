//! Remote secret/config store provider.
//!
//! Fetches the flat key/value set for a project/environment over an
//! authenticated HTTP API. Responses are cached per scope keyed by the
//! server's `ETag`; a `304 Not Modified` answer serves the cached copy
//! instead of being treated as an error.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;

use super::transport::{CircuitState, Transport};
use super::{Provider, Scope};
use crate::error::{Error, Result};
use crate::map::FlatMap;

pub const DEFAULT_API_URL: &str = "https://api.confetch.io/v1";

const MAX_ERROR_BODY: usize = 1024;

#[derive(Debug, Deserialize)]
struct SecretsResponse {
    secrets: HashMap<String, SecretEntry>,
}

#[derive(Debug, Deserialize)]
struct SecretEntry {
    raw: String,
}

#[derive(Debug, Default)]
struct ScopeCache {
    etag: Option<String>,
    values: FlatMap,
}

pub struct RemoteProvider {
    token: String,
    scope: Scope,
    api_url: String,
    transport: Transport,
    cache: Mutex<HashMap<String, ScopeCache>>,
}

impl RemoteProvider {
    /// Creates a provider for the given default scope. The token may
    /// be a service token that already encodes the scope, in which
    /// case the scope fields can be left empty.
    pub fn new(token: impl Into<String>, scope: Scope) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(Error::Provider("remote token is required".to_owned()));
        }

        Ok(Self {
            token,
            scope,
            api_url: DEFAULT_API_URL.to_owned(),
            transport: Transport::new("remote-config")?,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Replaces the default resilient transport, e.g. with custom
    /// timeout, retry or breaker settings.
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.transport.circuit_state()
    }

    /// Health probe: fails fast while the circuit is open, otherwise
    /// verifies end-to-end connectivity with a real fetch.
    pub async fn check(&self) -> Result<()> {
        if self.circuit_state() == CircuitState::Open {
            return Err(Error::CircuitOpen("remote-config".to_owned()));
        }
        self.fetch().await.map(|_| ())
    }

    fn cached_etag(&self, key: &str) -> Option<String> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(key).and_then(|entry| entry.etag.clone())
    }

    fn cached_values(&self, key: &str) -> FlatMap {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(key).map(|entry| entry.values.clone()).unwrap_or_default()
    }

    fn store(&self, key: String, etag: Option<String>, values: FlatMap) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(key, ScopeCache { etag, values });
    }
}

#[async_trait]
impl Provider for RemoteProvider {
    fn name(&self) -> &str {
        "remote"
    }

    async fn fetch(&self) -> Result<FlatMap> {
        let scope = self.scope.clone();
        self.fetch_scoped(&scope).await
    }

    async fn fetch_scoped(&self, scope: &Scope) -> Result<FlatMap> {
        let cache_key = scope.cache_key();
        let url = format!("{}/configs/secrets", self.api_url);

        let mut request = self
            .transport
            .client()
            .get(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json");

        if !scope.project.is_empty() {
            request = request.query(&[("project", scope.project.as_str())]);
        }
        if !scope.environment.is_empty() {
            request = request.query(&[("environment", scope.environment.as_str())]);
        }
        if let Some(etag) = self.cached_etag(&cache_key) {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }

        let response = self.transport.send(request).await.map_err(|err| {
            tracing::warn!(
                error = %err,
                project = %scope.project,
                environment = %scope.environment,
                "remote API request failed"
            );
            err
        })?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            tracing::debug!(
                project = %scope.project,
                environment = %scope.environment,
                "remote cache hit (ETag match)"
            );
            return Ok(self.cached_values(&cache_key));
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let body = if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!("{}...", &body[..cut])
            } else {
                body
            };
            return Err(Error::RemoteStatus { status, body });
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let payload: SecretsResponse = response
            .json()
            .await
            .map_err(|err| Error::Provider(format!("failed to decode remote response: {err}")))?;

        let values: FlatMap = payload
            .secrets
            .into_iter()
            .map(|(key, entry)| (key, entry.raw))
            .collect();

        self.store(cache_key, etag, values.clone());
        Ok(values)
    }

    fn version(&self) -> Option<String> {
        self.cached_etag(&self.scope.cache_key())
    }
}
