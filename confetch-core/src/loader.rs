//! The resolver: fetch, map, commit.
//!
//! [`Loader`] owns the current typed snapshot of one config type. A
//! load pulls a flat map from the primary provider (falling back to the
//! secondary on failure), maps it through the type's schema and only
//! then swaps the published snapshot. Readers never see a half-built
//! config. Rule validation is a separate caller-invoked step
//! ([`crate::validate::validate`]); the loader never runs it.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::bootstrap::{Bootstrap, FailurePolicy};
use crate::error::{Error, Result};
use crate::map::{map_config, FlatMap, FromFlatMap};
use crate::provider::file::FileProvider;
use crate::provider::remote::RemoteProvider;
use crate::provider::{Provider, Scope};

/// Describes where and when the current snapshot came from.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub source: String,
    pub loaded_at: DateTime<Utc>,
    pub project: String,
    pub environment: String,
    pub version: Option<String>,
    pub key_count: usize,
    pub warnings: Vec<String>,
}

type ChangeCallback<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

struct State<T> {
    current: Option<Arc<T>>,
    metadata: Option<Metadata>,
    callbacks: Vec<ChangeCallback<T>>,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            current: None,
            metadata: None,
            callbacks: Vec::new(),
        }
    }
}

pub struct Loader<T> {
    primary: Option<Box<dyn Provider>>,
    fallback: Option<Box<dyn Provider>>,
    policy: FailurePolicy,
    scope: Scope,
    // Serializes loads without blocking readers of `state`.
    load_gate: tokio::sync::Mutex<()>,
    state: RwLock<State<T>>,
}

impl<T> Loader<T>
where
    T: FromFlatMap + Send + Sync + 'static,
{
    /// Builds a loader from bootstrap settings: a remote provider when
    /// a token is present, a file provider when a fallback path is
    /// present. At least one source is required.
    pub fn from_bootstrap(bootstrap: &Bootstrap) -> Result<Self> {
        let primary: Option<Box<dyn Provider>> = if bootstrap.is_remote_enabled() {
            let mut remote = RemoteProvider::new(bootstrap.token.clone(), bootstrap.scope())?;
            if let Some(url) = &bootstrap.api_url {
                remote = remote.api_url(url.clone());
            }
            Some(Box::new(remote))
        } else {
            None
        };

        let fallback: Option<Box<dyn Provider>> = bootstrap
            .fallback_path
            .as_ref()
            .map(|path| Box::new(FileProvider::new(path)) as Box<dyn Provider>);

        if primary.is_none() && fallback.is_none() {
            return Err(Error::NoSource);
        }

        Ok(Self {
            primary,
            fallback,
            policy: bootstrap.failure_policy,
            scope: bootstrap.scope(),
            load_gate: tokio::sync::Mutex::new(()),
            state: RwLock::new(State::default()),
        })
    }

    /// Builds a loader over explicit providers, mainly for tests and
    /// embedders with their own sources.
    pub fn with_providers(
        primary: Option<Box<dyn Provider>>,
        fallback: Option<Box<dyn Provider>>,
    ) -> Result<Self> {
        if primary.is_none() && fallback.is_none() {
            return Err(Error::NoSource);
        }
        Ok(Self {
            primary,
            fallback,
            policy: FailurePolicy::default(),
            scope: Scope::default(),
            load_gate: tokio::sync::Mutex::new(()),
            state: RwLock::new(State::default()),
        })
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Performs the initial load. Also usable as a manual refresh.
    pub async fn load(&self) -> Result<Arc<T>> {
        self.load_inner(false).await
    }

    /// Reloads and, when values actually replaced an existing
    /// snapshot, fires the registered change callbacks.
    pub async fn reload(&self) -> Result<Arc<T>> {
        self.load_inner(true).await
    }

    async fn load_inner(&self, is_reload: bool) -> Result<Arc<T>> {
        let _gate = self.load_gate.lock().await;

        let mut source_error: Option<Error> = None;
        let mut fetched: Option<(FlatMap, String, Option<String>)> = None;

        if let Some(primary) = &self.primary {
            match primary.fetch().await {
                Ok(values) => {
                    fetched = Some((values, primary.name().to_owned(), primary.version()));
                }
                Err(err) => {
                    tracing::warn!(
                        provider = primary.name(),
                        error = %err,
                        "primary config source failed"
                    );
                    source_error = Some(err);
                }
            }
        }

        if fetched.is_none() {
            if let Some(fallback) = &self.fallback {
                match fallback.fetch().await {
                    Ok(values) => {
                        tracing::info!(provider = fallback.name(), "using fallback config source");
                        fetched = Some((values, fallback.name().to_owned(), fallback.version()));
                    }
                    Err(err) => {
                        tracing::warn!(
                            provider = fallback.name(),
                            error = %err,
                            "fallback config source failed"
                        );
                        if source_error.is_none() {
                            source_error = Some(err);
                        }
                    }
                }
            }
        }

        let mut policy_warning = None;
        let (values, source, version) = match fetched {
            Some(parts) => parts,
            None => match self.policy {
                FailurePolicy::Fail => {
                    return Err(source_error.unwrap_or(Error::NoSource));
                }
                FailurePolicy::Fallback => (FlatMap::new(), "defaults".to_owned(), None),
                FailurePolicy::Warn => {
                    let reason = source_error
                        .as_ref()
                        .map(|err| err.to_string())
                        .unwrap_or_else(|| "no configured source".to_owned());
                    tracing::warn!(
                        error = %reason,
                        "all config sources failed, continuing on schema defaults"
                    );
                    policy_warning =
                        Some(format!("all sources failed, using defaults: {reason}"));
                    (FlatMap::new(), "defaults".to_owned(), None)
                }
            },
        };

        let key_count = values.len();
        let (config, mut warnings) = map_config::<T>(&values)?;

        if let Some(warning) = policy_warning {
            warnings.insert(0, warning);
        }
        for warning in &warnings {
            tracing::warn!(warning = %warning, "config mapping warning");
        }

        let metadata = Metadata {
            source,
            loaded_at: Utc::now(),
            project: self.scope.project.clone(),
            environment: self.scope.environment.clone(),
            version,
            key_count,
            warnings,
        };

        let snapshot = Arc::new(config);

        // Swap under the write lock, fire callbacks outside it.
        let (previous, callbacks) = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let previous = state.current.replace(Arc::clone(&snapshot));
            state.metadata = Some(metadata);
            (previous, state.callbacks.clone())
        };

        if is_reload {
            if let Some(previous) = previous {
                for callback in &callbacks {
                    callback(&previous, &snapshot);
                }
            }
        }

        Ok(snapshot)
    }

    /// Current snapshot, if a load has succeeded.
    pub fn current(&self) -> Option<Arc<T>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.current.clone()
    }

    pub fn metadata(&self) -> Option<Metadata> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.metadata.clone()
    }

    /// Registers a callback invoked with `(old, new)` after each
    /// successful reload. Callbacks run in registration order on the
    /// reloading task; keep them fast.
    pub fn on_change(&self, callback: impl Fn(&T, &T) + Send + Sync + 'static) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.callbacks.push(Arc::new(callback));
    }

    /// Releases provider resources. All close failures are collected
    /// rather than stopping at the first.
    pub async fn close(&self) -> Result<()> {
        let mut failures = Vec::new();
        if let Some(primary) = &self.primary {
            if let Err(err) = primary.close().await {
                failures.push(format!("{}: {err}", primary.name()));
            }
        }
        if let Some(fallback) = &self.fallback {
            if let Err(err) = fallback.close().await {
                failures.push(format!("{}: {err}", fallback.name()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Close(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::map::Mapper;
    use crate::schema::{FieldSpec, TypeSpec};
    use crate::testing::MemoryProvider;
    use crate::validate::{validate, FieldValidator, Validatable};

    #[derive(Debug, PartialEq)]
    struct AppConfig {
        name: String,
        port: u16,
    }

    impl FromFlatMap for AppConfig {
        fn type_spec() -> &'static TypeSpec {
            static SPEC: std::sync::OnceLock<TypeSpec> = std::sync::OnceLock::new();
            SPEC.get_or_init(|| {
                TypeSpec::new(
                    "AppConfig",
                    vec![
                        FieldSpec::new("name").key("APP_NAME").default_value("app"),
                        FieldSpec::new("port").key("PORT").default_value("8080"),
                    ],
                )
            })
        }

        fn map(mapper: &mut Mapper) -> crate::error::Result<Self> {
            let spec = Self::type_spec();
            Ok(Self {
                name: mapper.resolve(spec.field("name"))?,
                port: mapper.resolve(spec.field("port"))?,
            })
        }
    }

    impl Validatable for AppConfig {
        fn visit_fields(&self, visitor: &mut FieldValidator) {
            let spec = Self::type_spec();
            visitor.field(spec.field("name"), &self.name);
            visitor.field(spec.field("port"), &self.port);
        }
    }

    #[derive(Debug)]
    struct StrictConfig {
        port: u32,
    }

    impl FromFlatMap for StrictConfig {
        fn type_spec() -> &'static TypeSpec {
            static SPEC: std::sync::OnceLock<TypeSpec> = std::sync::OnceLock::new();
            SPEC.get_or_init(|| {
                TypeSpec::new(
                    "StrictConfig",
                    vec![FieldSpec::new("port")
                        .key("PORT")
                        .default_value("8080")
                        .rules("port")],
                )
            })
        }

        fn map(mapper: &mut Mapper) -> crate::error::Result<Self> {
            let spec = Self::type_spec();
            Ok(Self {
                port: mapper.resolve(spec.field("port"))?,
            })
        }
    }

    impl Validatable for StrictConfig {
        fn visit_fields(&self, visitor: &mut FieldValidator) {
            visitor.field(Self::type_spec().field("port"), &self.port);
        }
    }

    #[derive(Debug)]
    struct RequiredConfig {
        token: String,
    }

    impl FromFlatMap for RequiredConfig {
        fn type_spec() -> &'static TypeSpec {
            static SPEC: std::sync::OnceLock<TypeSpec> = std::sync::OnceLock::new();
            SPEC.get_or_init(|| {
                TypeSpec::new(
                    "RequiredConfig",
                    vec![FieldSpec::new("token").key("TOKEN").required()],
                )
            })
        }

        fn map(mapper: &mut Mapper) -> crate::error::Result<Self> {
            Ok(Self {
                token: mapper.resolve(Self::type_spec().field("token"))?,
            })
        }
    }

    fn provider(pairs: &[(&str, &str)]) -> Box<dyn Provider> {
        Box::new(MemoryProvider::from_pairs("memory", pairs))
    }

    fn failing(message: &str) -> Box<dyn Provider> {
        Box::new(MemoryProvider::new("broken").with_error(message))
    }

    #[tokio::test]
    async fn load_prefers_the_primary_source() {
        let loader = Loader::<AppConfig>::with_providers(
            Some(provider(&[("APP_NAME", "primary"), ("PORT", "9000")])),
            Some(provider(&[("APP_NAME", "fallback")])),
        )
        .unwrap();

        let config = loader.load().await.unwrap();
        assert_eq!(config.name, "primary");
        assert_eq!(config.port, 9000);
        assert_eq!(loader.metadata().unwrap().source, "memory");
        assert_eq!(loader.metadata().unwrap().key_count, 2);
    }

    #[tokio::test]
    async fn fallback_source_covers_a_primary_failure() {
        let loader = Loader::<AppConfig>::with_providers(
            Some(failing("remote down")),
            Some(provider(&[("APP_NAME", "from-file")])),
        )
        .unwrap();

        let config = loader.load().await.unwrap();
        assert_eq!(config.name, "from-file");
        assert_eq!(config.port, 8080);
    }

    #[tokio::test]
    async fn fail_policy_surfaces_the_source_error() {
        let loader = Loader::<AppConfig>::with_providers(Some(failing("remote down")), None)
            .unwrap()
            .policy(FailurePolicy::Fail);

        let err = loader.load().await.unwrap_err();
        assert!(err.to_string().contains("remote down"));
        assert!(loader.current().is_none());
        assert!(loader.metadata().is_none());
    }

    #[tokio::test]
    async fn fallback_policy_builds_defaults_only_config() {
        let loader = Loader::<AppConfig>::with_providers(Some(failing("remote down")), None)
            .unwrap()
            .policy(FailurePolicy::Fallback);

        let config = loader.load().await.unwrap();
        assert_eq!(config.name, "app");
        assert_eq!(config.port, 8080);

        let metadata = loader.metadata().unwrap();
        assert_eq!(metadata.source, "defaults");
        assert_eq!(metadata.key_count, 0);
        assert!(metadata.warnings.is_empty());
    }

    #[tokio::test]
    async fn warn_policy_records_the_degradation() {
        let loader = Loader::<AppConfig>::with_providers(Some(failing("remote down")), None)
            .unwrap()
            .policy(FailurePolicy::Warn);

        loader.load().await.unwrap();

        let metadata = loader.metadata().unwrap();
        assert_eq!(metadata.source, "defaults");
        assert_eq!(metadata.warnings.len(), 1);
        assert!(metadata.warnings[0].contains("remote down"));
    }

    #[tokio::test]
    async fn load_never_runs_validation() {
        // A value that maps cleanly but violates its declared rule
        // must still load; rule checking happens only when the caller
        // asks for it.
        let source = MemoryProvider::from_pairs("memory", &[("PORT", "70000")]);
        let loader =
            Loader::<StrictConfig>::with_providers(Some(Box::new(source.clone_handle())), None)
                .unwrap();

        let config = loader.load().await.unwrap();
        assert_eq!(config.port, 70000);
        assert_eq!(loader.current().unwrap().port, 70000);

        let errors = validate(&*config).expect_err("explicit validation must flag the port");
        assert!(errors.to_string().contains("65535"));
    }

    #[tokio::test]
    async fn mapping_error_aborts_regardless_of_policy() {
        // Failure policies only cover source failures; a missing
        // required field is fatal even under `Fallback`.
        let loader = Loader::<RequiredConfig>::with_providers(Some(provider(&[])), None)
            .unwrap()
            .policy(FailurePolicy::Fallback);

        let err = loader.load().await.unwrap_err();
        assert!(matches!(err, Error::MissingRequired { .. }));
        assert!(loader.current().is_none());
        assert!(loader.metadata().is_none());
    }

    #[tokio::test]
    async fn callbacks_fire_on_reload_but_not_initial_load() {
        let source = MemoryProvider::from_pairs("memory", &[("PORT", "8080")]);
        let loader =
            Loader::<AppConfig>::with_providers(Some(Box::new(source.clone_handle())), None)
                .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let fired = Arc::clone(&fired);
            let seen = Arc::clone(&seen);
            loader.on_change(move |old, new| {
                fired.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push((old.port, new.port));
            });
        }

        loader.load().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        source.set_value("PORT", "9090");
        loader.reload().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().as_slice(), &[(8080, 9090)]);
    }

    #[tokio::test]
    async fn callbacks_run_in_registration_order() {
        let source = MemoryProvider::from_pairs("memory", &[]);
        let loader =
            Loader::<AppConfig>::with_providers(Some(Box::new(source.clone_handle())), None)
                .unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for id in 0..3 {
            let order = Arc::clone(&order);
            loader.on_change(move |_, _| order.lock().unwrap().push(id));
        }

        loader.load().await.unwrap();
        loader.reload().await.unwrap();
        assert_eq!(order.lock().unwrap().as_slice(), &[0, 1, 2]);
    }

    #[tokio::test]
    async fn loader_requires_at_least_one_source() {
        let result = Loader::<AppConfig>::with_providers(None, None);
        assert!(matches!(result, Err(Error::NoSource)));
    }
}
