//! JSON fallback file provider.
//!
//! Reads a local snapshot written by [`write_fallback_file`] (or by
//! hand) and flattens nested JSON into the flat key space the mapper
//! consumes: `{"database": {"host": "x"}}` becomes `DATABASE_HOST=x`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::{Provider, Scope};
use crate::error::{Error, Result};
use crate::map::FlatMap;

pub struct FileProvider {
    path: PathBuf,
    name: String,
}

impl FileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("file:{}", path.display());
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<FlatMap> {
        let raw = std::fs::read_to_string(&self.path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::Provider(format!("fallback file not found: {}", self.path.display()))
            } else {
                Error::Provider(format!(
                    "failed to read fallback file {}: {err}",
                    self.path.display()
                ))
            }
        })?;

        let root: Value = serde_json::from_str(&raw).map_err(|err| {
            Error::Provider(format!(
                "invalid JSON in fallback file {}: {err}",
                self.path.display()
            ))
        })?;

        let Value::Object(fields) = root else {
            return Err(Error::Provider(format!(
                "fallback file {} must contain a JSON object at the top level",
                self.path.display()
            )));
        };

        let mut values = FlatMap::new();
        for (key, value) in fields {
            flatten(&key, &value, &mut values);
        }
        Ok(values)
    }
}

/// Flattens one JSON value into the flat map. Nested object keys are
/// joined with `_`, arrays become comma-separated strings, and `null`
/// renders as the empty string.
fn flatten(key: &str, value: &Value, out: &mut FlatMap) {
    match value {
        Value::Object(fields) => {
            for (name, nested) in fields {
                let child = format!("{key}_{name}");
                flatten(&child, nested, out);
            }
        }
        other => {
            out.insert(key.to_owned(), render(other));
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(render)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => String::new(),
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<FlatMap> {
        self.read()
    }

    async fn fetch_scoped(&self, _scope: &Scope) -> Result<FlatMap> {
        self.read()
    }
}

/// Writes the current flat config as a pretty-printed JSON snapshot,
/// suitable for later use as a [`FileProvider`] source. On unix the
/// file is created owner-readable only since it may contain secrets.
pub fn write_fallback_file(path: impl AsRef<Path>, values: &FlatMap) -> Result<()> {
    let path = path.as_ref();
    let ordered: std::collections::BTreeMap<&String, &String> = values.iter().collect();
    let body = serde_json::to_string_pretty(&ordered)
        .map_err(|err| Error::Provider(format!("failed to encode fallback snapshot: {err}")))?;

    std::fs::write(path, body).map_err(|err| {
        Error::Provider(format!(
            "failed to write fallback file {}: {err}",
            path.display()
        ))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(|err| {
            Error::Provider(format!(
                "failed to restrict permissions on {}: {err}",
                path.display()
            ))
        })?;
    }

    Ok(())
}
