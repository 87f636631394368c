//! The field mapper: flat string keyspace -> typed config object.
//!
//! Resolution order per leaf field: source key lookup, default
//! substitution when the value is absent or empty, a fatal error for a
//! still-missing required field, zero value otherwise. Coercion
//! failures are non-fatal: the field keeps its zero value and a
//! warning is recorded. Strict on presence, lenient on parse: a
//! malformed optional field must not take down the whole configuration.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::schema::{FieldSpec, TypeSpec};
use crate::secret::Secret;

/// The universal exchange format between providers and the mapper.
pub type FlatMap = HashMap<String, String>;

/// A config type that can be populated from a [`FlatMap`] through its
/// declared [`TypeSpec`].
pub trait FromFlatMap: Sized {
    /// The type's field schema, built once and cached.
    fn type_spec() -> &'static TypeSpec;

    /// Maps the type's fields through the given mapper.
    fn map(mapper: &mut Mapper<'_>) -> Result<Self>;
}

/// A leaf field type the mapper knows how to coerce from a string.
pub trait FieldValue: Sized {
    /// The value a field takes when no source value, default, or
    /// successful coercion applies.
    fn zero() -> Self;

    fn coerce(raw: &str) -> std::result::Result<Self, String>;
}

impl FieldValue for String {
    fn zero() -> Self {
        String::new()
    }

    fn coerce(raw: &str) -> std::result::Result<Self, String> {
        Ok(raw.to_owned())
    }
}

macro_rules! int_field_value {
    ($($ty:ty),*) => {
        $(impl FieldValue for $ty {
            fn zero() -> Self {
                0
            }

            fn coerce(raw: &str) -> std::result::Result<Self, String> {
                raw.parse::<$ty>()
                    .map_err(|_| format!("invalid integer: {raw}"))
            }
        })*
    };
}

int_field_value!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

macro_rules! float_field_value {
    ($($ty:ty),*) => {
        $(impl FieldValue for $ty {
            fn zero() -> Self {
                0.0
            }

            fn coerce(raw: &str) -> std::result::Result<Self, String> {
                raw.parse::<$ty>().map_err(|_| format!("invalid float: {raw}"))
            }
        })*
    };
}

float_field_value!(f32, f64);

impl FieldValue for bool {
    fn zero() -> Self {
        false
    }

    fn coerce(raw: &str) -> std::result::Result<Self, String> {
        match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "on" | "enabled" | "1" => Ok(true),
            "false" | "no" | "n" | "off" | "disabled" | "0" => Ok(false),
            _ => Err(format!("invalid boolean: {raw}")),
        }
    }
}

impl FieldValue for Duration {
    fn zero() -> Self {
        Duration::ZERO
    }

    /// Accepts humantime strings ("30s", "1h30m"); a bare integer is
    /// treated as whole seconds.
    fn coerce(raw: &str) -> std::result::Result<Self, String> {
        if let Ok(duration) = humantime::parse_duration(raw) {
            return Ok(duration);
        }
        raw.parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| format!("invalid duration: {raw}"))
    }
}

impl FieldValue for Vec<String> {
    fn zero() -> Self {
        Vec::new()
    }

    fn coerce(raw: &str) -> std::result::Result<Self, String> {
        Ok(raw.split(',').map(|part| part.trim().to_owned()).collect())
    }
}

impl FieldValue for Secret {
    fn zero() -> Self {
        Secret::default()
    }

    fn coerce(raw: &str) -> std::result::Result<Self, String> {
        Ok(Secret::new(raw))
    }
}

/// Walks a config type's fields against a flat map, tracking the key
/// prefix for nested sub-objects and the field path for diagnostics.
pub struct Mapper<'a> {
    values: &'a FlatMap,
    key_prefix: String,
    path: Vec<&'static str>,
    warnings: Vec<String>,
}

impl<'a> Mapper<'a> {
    pub fn new(values: &'a FlatMap) -> Self {
        Self {
            values,
            key_prefix: String::new(),
            path: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Resolves one leaf field.
    pub fn resolve<T: FieldValue>(&mut self, spec: &FieldSpec) -> Result<T> {
        let key = format!("{}{}", self.key_prefix, spec.source_key());

        let mut raw = self
            .values
            .get(&key)
            .map(String::as_str)
            .filter(|v| !v.is_empty());
        if raw.is_none() {
            raw = spec.default().filter(|v| !v.is_empty());
        }

        let Some(raw) = raw else {
            if spec.is_required() {
                return Err(Error::MissingRequired {
                    field: self.field_path(spec.name()),
                    key,
                });
            }
            return Ok(T::zero());
        };

        match T::coerce(raw) {
            Ok(value) => Ok(value),
            Err(reason) => {
                self.warnings
                    .push(format!("failed to set {}: {reason}", self.field_path(spec.name())));
                Ok(T::zero())
            }
        }
    }

    /// Maps a shared field group at the current prefix, so its keys
    /// read exactly as the group type declares them.
    pub fn embed<T: FromFlatMap>(&mut self) -> Result<T> {
        T::map(self)
    }

    /// Maps a nested sub-object. `key_prefix` is prepended to every
    /// key the nested type declares; pass `""` to use the nested
    /// type's keys as-is. The prefixing rule is always explicit at the
    /// call site so one flat map can populate deep structures without
    /// collisions.
    pub fn nested<T: FromFlatMap>(&mut self, name: &'static str, key_prefix: &str) -> Result<T> {
        self.path.push(name);
        let saved = self.key_prefix.len();
        self.key_prefix.push_str(key_prefix);

        let result = T::map(self);

        self.key_prefix.truncate(saved);
        self.path.pop();
        result
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings
    }

    fn field_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{name}", self.path.join("."))
        }
    }
}

/// Maps a flat map into a typed config object, returning the object
/// and any non-fatal coercion warnings.
pub fn map_config<T: FromFlatMap>(values: &FlatMap) -> Result<(T, Vec<String>)> {
    let mut mapper = Mapper::new(values);
    let config = T::map(&mut mapper)?;
    Ok((config, mapper.into_warnings()))
}
