//! Multi-tenant resolver.
//!
//! One environment-level config plus one config per tenant project,
//! all fetched through the same provider with per-project scopes. A
//! tenant whose refresh fails keeps serving its last good snapshot;
//! tenants never take each other down.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::DEFAULT_WATCH_INTERVAL;
use crate::error::{Error, Result};
use crate::map::{map_config, FromFlatMap};
use crate::provider::{Provider, Scope};

/// Membership changes produced by one [`MultiTenantLoader::sync_projects`]
/// sweep. Code lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

fn diff_between(before: &BTreeSet<String>, after: &BTreeSet<String>) -> ReloadDiff {
    ReloadDiff {
        added: after.difference(before).cloned().collect(),
        removed: before.difference(after).cloned().collect(),
        unchanged: before.intersection(after).cloned().collect(),
    }
}

/// Result of a sync sweep: membership diff plus codes whose load
/// failed (retained with stale values when they already existed).
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub diff: ReloadDiff,
    pub failed: Vec<String>,
}

type EnvCallback<E> = Arc<dyn Fn(&E, &E) + Send + Sync>;
type ProjectCallback<P> = Arc<dyn Fn(&str, &P, &P) + Send + Sync>;

struct MtState<E, P> {
    env: Option<Arc<E>>,
    projects: BTreeMap<String, Arc<P>>,
    env_callbacks: Vec<EnvCallback<E>>,
    project_callbacks: Vec<ProjectCallback<P>>,
}

impl<E, P> Default for MtState<E, P> {
    fn default() -> Self {
        Self {
            env: None,
            projects: BTreeMap::new(),
            env_callbacks: Vec::new(),
            project_callbacks: Vec::new(),
        }
    }
}

pub struct MultiTenantLoader<E, P> {
    provider: Box<dyn Provider>,
    scope: Scope,
    load_gate: tokio::sync::Mutex<()>,
    state: RwLock<MtState<E, P>>,
}

impl<E, P> MultiTenantLoader<E, P>
where
    E: FromFlatMap + Send + Sync + 'static,
    P: FromFlatMap + Send + Sync + 'static,
{
    /// `scope.environment` is shared by every tenant; `scope.project`
    /// is only used for the environment-level config.
    pub fn new(provider: Box<dyn Provider>, scope: Scope) -> Self {
        Self {
            provider,
            scope,
            load_gate: tokio::sync::Mutex::new(()),
            state: RwLock::new(MtState::default()),
        }
    }

    fn project_scope(&self, code: &str) -> Scope {
        Scope::new(code, self.scope.environment.clone())
    }

    async fn fetch_mapped<T>(&self, scope: &Scope) -> Result<Arc<T>>
    where
        T: FromFlatMap,
    {
        let values = self.provider.fetch_scoped(scope).await?;
        let (config, warnings) = map_config::<T>(&values)?;
        for warning in &warnings {
            tracing::warn!(scope = %scope, warning = %warning, "config mapping warning");
        }
        Ok(Arc::new(config))
    }

    /// Loads or refreshes the environment-level config.
    pub async fn load_env(&self) -> Result<Arc<E>> {
        let _gate = self.load_gate.lock().await;
        let snapshot = self.fetch_mapped::<E>(&self.scope).await?;

        let (previous, callbacks) = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let previous = state.env.replace(Arc::clone(&snapshot));
            (previous, state.env_callbacks.clone())
        };
        if let Some(previous) = previous {
            for callback in &callbacks {
                callback(&previous, &snapshot);
            }
        }
        Ok(snapshot)
    }

    /// Loads or refreshes one tenant's config.
    pub async fn load_project(&self, code: &str) -> Result<Arc<P>> {
        let _gate = self.load_gate.lock().await;
        self.load_project_locked(code).await
    }

    async fn load_project_locked(&self, code: &str) -> Result<Arc<P>> {
        let scope = self.project_scope(code);
        let snapshot = self.fetch_mapped::<P>(&scope).await?;

        let (previous, callbacks) = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let previous = state.projects.insert(code.to_owned(), Arc::clone(&snapshot));
            (previous, state.project_callbacks.clone())
        };
        if let Some(previous) = previous {
            for callback in &callbacks {
                callback(code, &previous, &snapshot);
            }
        }
        Ok(snapshot)
    }

    /// Loads a batch of tenants, stopping at the first failure.
    pub async fn load_all_projects(&self, codes: &[&str]) -> Result<()> {
        let _gate = self.load_gate.lock().await;
        for code in codes {
            self.load_project_locked(code).await?;
        }
        Ok(())
    }

    /// Refreshes every currently known tenant. A failing tenant keeps
    /// its previous snapshot and is reported in the outcome's failed
    /// list. Membership does not change, so the diff lists every code
    /// as unchanged.
    pub async fn reload_projects(&self) -> SweepOutcome {
        let _gate = self.load_gate.lock().await;

        let codes: BTreeSet<String> = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state.projects.keys().cloned().collect()
        };

        let mut failed = Vec::new();
        for code in &codes {
            if let Err(err) = self.load_project_locked(code).await {
                tracing::warn!(
                    project = %code,
                    error = %err,
                    "tenant reload failed, keeping previous snapshot"
                );
                failed.push(code.clone());
            }
        }
        if !failed.is_empty() {
            tracing::error!(
                failed = failed.len(),
                total = codes.len(),
                "tenant reload sweep finished with failures"
            );
        }

        SweepOutcome {
            diff: diff_between(&codes, &codes),
            failed,
        }
    }

    /// Reconciles the tenant set against an authoritative list of
    /// codes: new codes are loaded, codes no longer listed are
    /// dropped, and listed codes that fail to load are retained with
    /// their previous snapshot when one exists.
    pub async fn sync_projects(&self, codes: &[&str]) -> SweepOutcome {
        let _gate = self.load_gate.lock().await;

        let before: BTreeSet<String> = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state.projects.keys().cloned().collect()
        };
        let target: BTreeSet<String> = codes.iter().map(|c| (*c).to_owned()).collect();

        let mut failed = Vec::new();
        for code in &target {
            if let Err(err) = self.load_project_locked(code).await {
                let existed = before.contains(code);
                tracing::warn!(
                    project = %code,
                    error = %err,
                    retained = existed,
                    "tenant sync load failed"
                );
                failed.push(code.clone());
            }
        }

        // Drop tenants that left the authoritative list.
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.projects.retain(|code, _| target.contains(code));
        }

        let after: BTreeSet<String> = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state.projects.keys().cloned().collect()
        };

        SweepOutcome {
            diff: diff_between(&before, &after),
            failed,
        }
    }

    pub fn env(&self) -> Option<Arc<E>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.env.clone()
    }

    pub fn project(&self, code: &str) -> Option<Arc<P>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.projects.get(code).cloned()
    }

    pub fn projects(&self) -> BTreeMap<String, Arc<P>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.projects.clone()
    }

    pub fn project_codes(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.projects.keys().cloned().collect()
    }

    pub fn on_env_change(&self, callback: impl Fn(&E, &E) + Send + Sync + 'static) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.env_callbacks.push(Arc::new(callback));
    }

    pub fn on_project_change(&self, callback: impl Fn(&str, &P, &P) + Send + Sync + 'static) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.project_callbacks.push(Arc::new(callback));
    }

    pub async fn close(&self) -> Result<()> {
        self.provider
            .close()
            .await
            .map_err(|err| Error::Close(format!("{}: {err}", self.provider.name())))
    }
}

struct MtRunHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polling watcher over a [`MultiTenantLoader`]: each tick refreshes
/// the environment config and sweeps the known tenants. There is no
/// failure ceiling; tenants are expected to come and go.
pub struct MultiTenantWatcher<E, P> {
    loader: Arc<MultiTenantLoader<E, P>>,
    interval: Duration,
    shutdown: CancellationToken,
    inner: Mutex<Option<MtRunHandle>>,
}

impl<E, P> MultiTenantWatcher<E, P>
where
    E: FromFlatMap + Send + Sync + 'static,
    P: FromFlatMap + Send + Sync + 'static,
{
    pub fn new(loader: Arc<MultiTenantLoader<E, P>>) -> Self {
        Self {
            loader,
            interval: DEFAULT_WATCH_INTERVAL,
            shutdown: CancellationToken::new(),
            inner: Mutex::new(None),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(run) = inner.as_ref() {
            if !run.handle.is_finished() {
                return;
            }
        }

        let cancel = self.shutdown.child_token();
        let loader = Arc::clone(&self.loader);
        let interval = self.interval;
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                if let Err(err) = loader.load_env().await {
                    tracing::warn!(error = %err, "environment config reload failed");
                }
                let outcome = loader.reload_projects().await;
                if outcome.failed.is_empty() {
                    tracing::debug!("tenant configs reloaded");
                }
            }
        });

        tracing::info!(interval = ?self.interval, "multi-tenant config watcher started");
        *inner = Some(MtRunHandle { cancel, handle });
    }

    pub async fn stop(&self) {
        let run = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.take()
        };
        if let Some(run) = run {
            run.cancel.cancel();
            let _ = run.handle.await;
            tracing::info!("multi-tenant config watcher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .as_ref()
            .map(|run| !run.handle.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::map::Mapper;
    use crate::schema::{FieldSpec, TypeSpec};
    use crate::testing::MemoryProvider;

    #[derive(Debug)]
    struct EnvConfig {
        region: String,
    }

    impl FromFlatMap for EnvConfig {
        fn type_spec() -> &'static TypeSpec {
            static SPEC: std::sync::OnceLock<TypeSpec> = std::sync::OnceLock::new();
            SPEC.get_or_init(|| {
                TypeSpec::new(
                    "EnvConfig",
                    vec![FieldSpec::new("region").key("REGION").default_value("eu-1")],
                )
            })
        }

        fn map(mapper: &mut Mapper) -> crate::error::Result<Self> {
            Ok(Self {
                region: mapper.resolve(Self::type_spec().field("region"))?,
            })
        }
    }

    #[derive(Debug)]
    struct ProjectConfig {
        quota: u64,
    }

    impl FromFlatMap for ProjectConfig {
        fn type_spec() -> &'static TypeSpec {
            static SPEC: std::sync::OnceLock<TypeSpec> = std::sync::OnceLock::new();
            SPEC.get_or_init(|| {
                TypeSpec::new(
                    "ProjectConfig",
                    vec![FieldSpec::new("quota").key("QUOTA").default_value("100")],
                )
            })
        }

        fn map(mapper: &mut Mapper) -> crate::error::Result<Self> {
            Ok(Self {
                quota: mapper.resolve(Self::type_spec().field("quota"))?,
            })
        }
    }

    type TestLoader = MultiTenantLoader<EnvConfig, ProjectConfig>;

    fn loader_over(source: &MemoryProvider) -> TestLoader {
        MultiTenantLoader::new(
            Box::new(source.clone_handle()),
            Scope::new("platform", "prod"),
        )
    }

    #[tokio::test]
    async fn tenants_resolve_through_their_own_scope() {
        let source = MemoryProvider::from_pairs("memory", &[("REGION", "us-2")]);
        source.set_scoped(&Scope::new("acme", "prod"), &[("QUOTA", "500")]);
        source.set_scoped(&Scope::new("globex", "prod"), &[("QUOTA", "900")]);

        let loader = loader_over(&source);
        loader.load_env().await.unwrap();
        loader.load_all_projects(&["acme", "globex"]).await.unwrap();

        assert_eq!(loader.env().unwrap().region, "us-2");
        assert_eq!(loader.project("acme").unwrap().quota, 500);
        assert_eq!(loader.project("globex").unwrap().quota, 900);
        assert_eq!(loader.project_codes(), vec!["acme", "globex"]);
        assert!(loader.project("unknown").is_none());
    }

    #[tokio::test]
    async fn failed_tenant_keeps_its_previous_snapshot() {
        let source = MemoryProvider::from_pairs("memory", &[]);
        source.set_scoped(&Scope::new("acme", "prod"), &[("QUOTA", "500")]);

        let loader = loader_over(&source);
        loader.load_project("acme").await.unwrap();

        source.set_error("store offline");
        let outcome = loader.reload_projects().await;

        assert_eq!(outcome.failed, vec!["acme"]);
        assert_eq!(outcome.diff.unchanged, vec!["acme"]);
        assert_eq!(loader.project("acme").unwrap().quota, 500);
    }

    #[tokio::test]
    async fn sync_reports_membership_changes() {
        let source = MemoryProvider::from_pairs("memory", &[]);
        for code in ["a", "b", "c"] {
            source.set_scoped(&Scope::new(code, "prod"), &[("QUOTA", "1")]);
        }

        let loader = loader_over(&source);
        loader.load_all_projects(&["a", "b"]).await.unwrap();

        let outcome = loader.sync_projects(&["b", "c"]).await;
        assert_eq!(outcome.diff.added, vec!["c"]);
        assert_eq!(outcome.diff.removed, vec!["a"]);
        assert_eq!(outcome.diff.unchanged, vec!["b"]);
        assert!(outcome.failed.is_empty());

        assert!(loader.project("a").is_none());
        assert!(loader.project("b").is_some());
        assert!(loader.project("c").is_some());
    }

    #[tokio::test]
    async fn sync_retains_failing_tenants_that_already_existed() {
        let source = MemoryProvider::from_pairs("memory", &[]);
        source.set_scoped(&Scope::new("a", "prod"), &[("QUOTA", "10")]);

        let loader = loader_over(&source);
        loader.load_project("a").await.unwrap();

        source.set_error("store offline");
        let outcome = loader.sync_projects(&["a", "b"]).await;

        assert_eq!(outcome.failed, vec!["a", "b"]);
        // "a" keeps serving stale values; "b" never existed.
        assert_eq!(loader.project("a").unwrap().quota, 10);
        assert!(loader.project("b").is_none());
        assert_eq!(outcome.diff.unchanged, vec!["a"]);
        assert!(outcome.diff.added.is_empty());
    }

    #[tokio::test]
    async fn project_callbacks_carry_the_tenant_code() {
        let source = MemoryProvider::from_pairs("memory", &[]);
        source.set_scoped(&Scope::new("acme", "prod"), &[("QUOTA", "500")]);

        let loader = loader_over(&source);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            loader.on_project_change(move |code, old, new| {
                seen.lock().unwrap().push((code.to_owned(), old.quota, new.quota));
            });
        }

        loader.load_project("acme").await.unwrap();
        assert!(seen.lock().unwrap().is_empty());

        source.set_scoped(&Scope::new("acme", "prod"), &[("QUOTA", "750")]);
        loader.load_project("acme").await.unwrap();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("acme".to_owned(), 500, 750)]
        );
    }

    #[tokio::test]
    async fn env_callbacks_fire_only_on_replacement() {
        let source = MemoryProvider::from_pairs("memory", &[("REGION", "eu-1")]);
        let loader = loader_over(&source);

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            loader.on_env_change(move |_, _| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        loader.load_env().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        loader.load_env().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_sweeps_env_and_tenants() {
        let source = MemoryProvider::from_pairs("memory", &[("REGION", "eu-1")]);
        source.set_scoped(&Scope::new("acme", "prod"), &[("QUOTA", "500")]);

        let loader = Arc::new(loader_over(&source));
        loader.load_env().await.unwrap();
        loader.load_project("acme").await.unwrap();

        let watcher =
            MultiTenantWatcher::new(Arc::clone(&loader)).interval(Duration::from_secs(1));
        watcher.start();

        source.set_values(&[("REGION", "us-2")]);
        source.set_scoped(&Scope::new("acme", "prod"), &[("QUOTA", "750")]);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        tokio::task::yield_now().await;

        assert_eq!(loader.env().unwrap().region, "us-2");
        assert_eq!(loader.project("acme").unwrap().quota, 750);
        watcher.stop().await;
    }
}
