//! Test doubles for provider-driven code.
//!
//! [`MemoryProvider`] is a scriptable in-memory source whose handles
//! share state, so a test can mutate values or inject failures while a
//! loader holds the provider. [`RecordingProvider`] wraps any provider
//! and logs the calls made against it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::map::FlatMap;
use crate::provider::{Provider, Scope};

#[derive(Default)]
struct MemoryInner {
    values: FlatMap,
    scoped: HashMap<String, FlatMap>,
    error: Option<String>,
}

/// In-memory provider for tests. Cloned handles observe the same
/// state, so mutations are visible to every holder.
pub struct MemoryProvider {
    name: String,
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(MemoryInner::default())),
        }
    }

    pub fn from_pairs(name: impl Into<String>, pairs: &[(&str, &str)]) -> Self {
        let provider = Self::new(name);
        provider.set_values(pairs);
        provider
    }

    pub fn with_error(self, message: impl Into<String>) -> Self {
        self.set_error(message);
        self
    }

    /// A second handle onto the same provider state.
    pub fn clone_handle(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: Arc::clone(&self.inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_value(&self, key: &str, value: &str) {
        self.lock().values.insert(key.to_owned(), value.to_owned());
    }

    /// Replaces the unscoped value set.
    pub fn set_values(&self, pairs: &[(&str, &str)]) {
        let values = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        self.lock().values = values;
    }

    /// Replaces the value set served for one scope.
    pub fn set_scoped(&self, scope: &Scope, pairs: &[(&str, &str)]) {
        let values = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        self.lock().scoped.insert(scope.cache_key(), values);
    }

    /// Makes every subsequent fetch fail with the given message.
    pub fn set_error(&self, message: impl Into<String>) {
        self.lock().error = Some(message.into());
    }

    pub fn clear_error(&self) {
        self.lock().error = None;
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.values.clear();
        inner.scoped.clear();
        inner.error = None;
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<FlatMap> {
        let inner = self.lock();
        if let Some(message) = &inner.error {
            return Err(Error::Provider(message.clone()));
        }
        Ok(inner.values.clone())
    }

    async fn fetch_scoped(&self, scope: &Scope) -> Result<FlatMap> {
        let inner = self.lock();
        if let Some(message) = &inner.error {
            return Err(Error::Provider(message.clone()));
        }
        match inner.scoped.get(&scope.cache_key()) {
            Some(values) => Ok(values.clone()),
            None => Ok(inner.values.clone()),
        }
    }
}

/// One observed call against a [`RecordingProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// `None` for plain fetches, `Some` for scoped ones.
    pub scope: Option<Scope>,
    pub succeeded: bool,
}

/// Wraps a provider and records every fetch made through it.
pub struct RecordingProvider {
    inner: Box<dyn Provider>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingProvider {
    pub fn new(inner: Box<dyn Provider>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn record(&self, scope: Option<Scope>, succeeded: bool) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall { scope, succeeded });
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(&self) -> Result<FlatMap> {
        let outcome = self.inner.fetch().await;
        self.record(None, outcome.is_ok());
        outcome
    }

    async fn fetch_scoped(&self, scope: &Scope) -> Result<FlatMap> {
        let outcome = self.inner.fetch_scoped(scope).await;
        self.record(Some(scope.clone()), outcome.is_ok());
        outcome
    }

    fn version(&self) -> Option<String> {
        self.inner.version()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
