//! Process-environment provider, mostly useful for local development
//! and tests. With a prefix set, only matching variables are returned
//! and the prefix is stripped from the key.

use async_trait::async_trait;

use super::{Provider, Scope};
use crate::error::Result;
use crate::map::FlatMap;

pub struct EnvProvider {
    prefix: String,
    name: String,
}

impl EnvProvider {
    pub fn new() -> Self {
        Self {
            prefix: String::new(),
            name: "env".to_owned(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let name = if prefix.is_empty() {
            "env".to_owned()
        } else {
            format!("env:{prefix}*")
        };
        Self { prefix, name }
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for EnvProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<FlatMap> {
        let values = std::env::vars()
            .filter_map(|(key, value)| {
                if self.prefix.is_empty() {
                    Some((key, value))
                } else {
                    key.strip_prefix(&self.prefix)
                        .map(|stripped| (stripped.to_owned(), value))
                }
            })
            .collect();
        Ok(values)
    }

    async fn fetch_scoped(&self, _scope: &Scope) -> Result<FlatMap> {
        self.fetch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_filters_and_strips() {
        std::env::set_var("CONFETCH_ENVTEST_FOO", "bar");
        std::env::set_var("UNRELATED_ENVTEST_BAZ", "qux");

        let provider = EnvProvider::with_prefix("CONFETCH_ENVTEST_");
        let values = provider.fetch().await.unwrap();

        assert_eq!(values.get("FOO").map(String::as_str), Some("bar"));
        assert!(!values.contains_key("UNRELATED_ENVTEST_BAZ"));
        assert!(!values.contains_key("BAZ"));

        std::env::remove_var("CONFETCH_ENVTEST_FOO");
        std::env::remove_var("UNRELATED_ENVTEST_BAZ");
    }

    #[tokio::test]
    async fn unprefixed_provider_returns_everything() {
        std::env::set_var("CONFETCH_ENVTEST_ALL", "1");
        let provider = EnvProvider::new();
        let values = provider.fetch().await.unwrap();
        assert_eq!(values.get("CONFETCH_ENVTEST_ALL").map(String::as_str), Some("1"));
        std::env::remove_var("CONFETCH_ENVTEST_ALL");
    }
}
