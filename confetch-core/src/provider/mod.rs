//! Configuration source providers.
//!
//! Every source (the remote API, a local JSON fallback file, the
//! process environment, an in-memory test double) implements the same
//! [`Provider`] contract and hands the loader a flat key/value map.
//! Providers must be safe for concurrent calls.

pub mod env;
pub mod file;
pub mod remote;
pub mod transport;

use async_trait::async_trait;

use crate::error::Result;
use crate::map::FlatMap;

/// Identifies one project/environment pair in the remote store. Used
/// both as a provider's default and as the per-tenant selector for
/// scoped fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub project: String,
    pub environment: String,
}

impl Scope {
    pub fn new(project: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
        }
    }

    pub(crate) fn cache_key(&self) -> String {
        format!("{}/{}", self.project, self.environment)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project, self.environment)
    }
}

/// Uniform fetch contract over heterogeneous config backends.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider name for metadata and logging.
    fn name(&self) -> &str;

    /// Retrieves all config values from the source.
    async fn fetch(&self) -> Result<FlatMap>;

    /// Retrieves config values for a specific scope. Providers without
    /// scoping (file, env) ignore the selector.
    async fn fetch_scoped(&self, scope: &Scope) -> Result<FlatMap>;

    /// The version/caching token of the last successful fetch, when
    /// the backend supplies one.
    fn version(&self) -> Option<String> {
        None
    }

    /// Releases any resources held by the provider.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
