//! Bootstrap settings read from the process environment.
//!
//! These are the handful of values the engine needs before it can load
//! anything else: where the remote store is, which scope to ask for,
//! where the fallback snapshot lives, and how strict to be when a
//! source is unavailable.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::map::FieldValue;
use crate::provider::Scope;

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(30);

/// What the loader does when the primary source (and fallback, if any)
/// cannot produce values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Surface the source error to the caller.
    Fail,
    /// Build the config object from schema defaults alone.
    #[default]
    Fallback,
    /// Like `Fallback`, but the degradation is logged and recorded in
    /// the load metadata.
    Warn,
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "fallback" | "" => Ok(Self::Fallback),
            "warn" => Ok(Self::Warn),
            other => Err(Error::Provider(format!(
                "unknown failure policy {other:?}, expected fail, fallback or warn"
            ))),
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Fail => "fail",
            Self::Fallback => "fallback",
            Self::Warn => "warn",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    pub token: String,
    pub api_url: Option<String>,
    pub project: String,
    pub environment: String,
    pub fallback_path: Option<PathBuf>,
    pub watch_enabled: bool,
    pub watch_interval: Duration,
    pub failure_policy: FailurePolicy,
}

impl Bootstrap {
    /// Reads bootstrap settings from `CONFETCH_*` environment
    /// variables. Everything is optional; a configuration with neither
    /// token nor fallback path is rejected at load time, not here.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let watch_interval = match get("CONFETCH_WATCH_INTERVAL") {
            Some(raw) => <Duration as FieldValue>::coerce(&raw).map_err(|reason| {
                Error::Provider(format!("invalid CONFETCH_WATCH_INTERVAL: {reason}"))
            })?,
            None => DEFAULT_WATCH_INTERVAL,
        };

        let failure_policy = match get("CONFETCH_FAILURE_POLICY") {
            Some(raw) => raw.parse()?,
            None => FailurePolicy::default(),
        };

        let watch_enabled = get("CONFETCH_WATCH_ENABLED")
            .map(|raw| <bool as FieldValue>::coerce(&raw).unwrap_or(false))
            .unwrap_or(false);

        Ok(Self {
            token: get("CONFETCH_TOKEN").unwrap_or_default(),
            api_url: get("CONFETCH_API_URL"),
            project: get("CONFETCH_PROJECT").unwrap_or_default(),
            environment: get("CONFETCH_ENVIRONMENT").unwrap_or_default(),
            fallback_path: get("CONFETCH_FALLBACK_PATH").map(PathBuf::from),
            watch_enabled,
            watch_interval,
            failure_policy,
        })
    }

    pub fn is_remote_enabled(&self) -> bool {
        !self.token.is_empty()
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback_path.is_some()
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.project.clone(), self.environment.clone())
    }
}
