//! Polling reload watcher.
//!
//! Spawns a background task that calls [`Loader::reload`] on a fixed
//! interval. Consecutive failures are counted; hitting the configured
//! ceiling stops the watcher so a dead source does not hammer the API
//! forever. A successful reload resets the counter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::DEFAULT_WATCH_INTERVAL;
use crate::loader::Loader;
use crate::map::FromFlatMap;

struct RunHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Watcher<T> {
    loader: Arc<Loader<T>>,
    interval: Duration,
    max_failures: u32,
    shutdown: CancellationToken,
    failures: Arc<AtomicU32>,
    inner: Mutex<Option<RunHandle>>,
}

impl<T> Watcher<T>
where
    T: FromFlatMap + Send + Sync + 'static,
{
    pub fn new(loader: Arc<Loader<T>>) -> Self {
        Self {
            loader,
            interval: DEFAULT_WATCH_INTERVAL,
            max_failures: 0,
            shutdown: CancellationToken::new(),
            failures: Arc::new(AtomicU32::new(0)),
            inner: Mutex::new(None),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Consecutive-failure ceiling after which the watcher stops
    /// itself. Zero means keep trying forever.
    pub fn max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Ties the watcher to an external shutdown token, e.g. the
    /// process-wide one.
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Starts the polling task. Calling start on a running watcher is
    /// a no-op.
    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(run) = inner.as_ref() {
            if !run.handle.is_finished() {
                return;
            }
        }

        // A fresh run starts with a clean slate, even after a
        // failure-ceiling self-stop.
        self.failures.store(0, Ordering::SeqCst);

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.loader),
            self.interval,
            self.max_failures,
            Arc::clone(&self.failures),
            cancel.clone(),
        ));

        tracing::info!(interval = ?self.interval, "config watcher started");
        *inner = Some(RunHandle { cancel, handle });
    }

    /// Stops the polling task and waits for it to exit. Idempotent.
    pub async fn stop(&self) {
        let run = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.take()
        };
        if let Some(run) = run {
            run.cancel.cancel();
            let _ = run.handle.await;
            tracing::info!("config watcher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .as_ref()
            .map(|run| !run.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

async fn run_loop<T>(
    loader: Arc<Loader<T>>,
    interval: Duration,
    max_failures: u32,
    failures: Arc<AtomicU32>,
    cancel: CancellationToken,
) where
    T: FromFlatMap + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it so the first
    // reload happens one interval after start.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match loader.reload().await {
            Ok(_) => {
                failures.store(0, Ordering::SeqCst);
                tracing::debug!("config reloaded");
            }
            Err(err) => {
                let count = failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(error = %err, consecutive_failures = count, "config reload failed");
                if max_failures > 0 && count >= max_failures {
                    tracing::error!(
                        consecutive_failures = count,
                        "reload failure ceiling reached, stopping watcher"
                    );
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Mapper;
    use crate::schema::{FieldSpec, TypeSpec};
    use crate::testing::MemoryProvider;

    #[derive(Debug)]
    struct TickConfig {
        value: String,
    }

    impl FromFlatMap for TickConfig {
        fn type_spec() -> &'static TypeSpec {
            static SPEC: std::sync::OnceLock<TypeSpec> = std::sync::OnceLock::new();
            SPEC.get_or_init(|| {
                TypeSpec::new(
                    "TickConfig",
                    vec![FieldSpec::new("value").key("VALUE").default_value("v0")],
                )
            })
        }

        fn map(mapper: &mut Mapper) -> crate::error::Result<Self> {
            Ok(Self {
                value: mapper.resolve(Self::type_spec().field("value"))?,
            })
        }
    }

    fn watcher_over(source: &MemoryProvider) -> Watcher<TickConfig> {
        let loader =
            Loader::<TickConfig>::with_providers(Some(Box::new(source.clone_handle())), None)
                .unwrap()
                .policy(crate::bootstrap::FailurePolicy::Fail);
        Watcher::new(Arc::new(loader))
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_the_failure_ceiling() {
        let source = MemoryProvider::from_pairs("memory", &[("VALUE", "v1")]);
        let watcher = watcher_over(&source).interval(Duration::from_secs(1)).max_failures(3);

        source.set_error("source offline");
        watcher.start();
        assert!(watcher.is_running());

        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert!(!watcher.is_running());
        assert_eq!(watcher.failure_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn a_successful_reload_resets_the_counter() {
        let source = MemoryProvider::from_pairs("memory", &[("VALUE", "v1")]);
        let watcher = watcher_over(&source).interval(Duration::from_secs(1)).max_failures(5);

        watcher.start();

        source.set_error("blip");
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        tokio::task::yield_now().await;
        assert_eq!(watcher.failure_count(), 2);

        source.clear_error();
        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(watcher.failure_count(), 0);
        assert!(watcher.is_running());

        watcher.stop().await;
        assert!(!watcher.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn reloads_pick_up_new_values() {
        let source = MemoryProvider::from_pairs("memory", &[("VALUE", "v1")]);
        let loader = Arc::new(
            Loader::<TickConfig>::with_providers(Some(Box::new(source.clone_handle())), None)
                .unwrap(),
        );
        loader.load().await.unwrap();

        let watcher = Watcher::new(Arc::clone(&loader)).interval(Duration::from_secs(1));
        watcher.start();

        source.set_value("VALUE", "v2");
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        tokio::task::yield_now().await;

        assert_eq!(loader.current().unwrap().value, "v2");
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_ceiling_stop_begins_with_a_clean_counter() {
        let source = MemoryProvider::from_pairs("memory", &[("VALUE", "v1")]);
        let watcher = watcher_over(&source).interval(Duration::from_secs(1)).max_failures(2);

        source.set_error("source offline");
        watcher.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(!watcher.is_running());
        assert_eq!(watcher.failure_count(), 2);

        // The new run gets the full ceiling again, not one strike.
        watcher.start();
        assert_eq!(watcher.failure_count(), 0);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        tokio::task::yield_now().await;
        assert!(watcher.is_running());
        assert_eq!(watcher.failure_count(), 1);

        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let source = MemoryProvider::from_pairs("memory", &[("VALUE", "v1")]);
        let watcher = watcher_over(&source).interval(Duration::from_secs(1));

        watcher.start();
        watcher.start();
        assert!(watcher.is_running());

        watcher.stop().await;
        watcher.stop().await;
        assert!(!watcher.is_running());
    }
}
