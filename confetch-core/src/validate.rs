//! Declarative validation over typed config objects.
//!
//! Validation is a separate, explicit step after mapping, never run
//! implicitly. A [`ValidationEngine`] applies each field's rule list
//! (declared in its [`FieldSpec`]) and collects every failure across
//! the whole object into one [`ValidationErrors`] set instead of
//! failing fast, so a single call reports every violation at once.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;

use crate::schema::{FieldSpec, Rule};
use crate::secret::Secret;

/// One failed check: the field path, the offending value and a
/// human-readable reason.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub value: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (value: {})", self.field, self.message, self.value)
    }
}

/// Every failure found in one validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn push(&mut self, error: ValidationError) {
        self.0.push(error);
    }

    pub fn add(&mut self, field: impl Into<String>, value: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationError {
            field: field.into(),
            value: value.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "no validation errors"),
            [single] => write!(f, "{single}"),
            errors => {
                writeln!(f, "{} validation errors:", errors.len())?;
                for (i, error) in errors.iter().enumerate() {
                    writeln!(f, "  {}. {error}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ValidationErrors {}

/// A borrowed, type-erased view of one leaf field value, the shape the
/// rule checks operate on.
#[derive(Debug, Clone, Copy)]
pub enum ValueView<'a> {
    Text(&'a str),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    List(&'a [String]),
    Secret(&'a Secret),
    Duration(Duration),
}

impl ValueView<'_> {
    fn is_empty(&self) -> bool {
        match *self {
            ValueView::Text(s) => s.is_empty(),
            ValueView::Int(i) => i == 0,
            ValueView::Uint(u) => u == 0,
            ValueView::Float(f) => f == 0.0,
            ValueView::Bool(b) => !b,
            ValueView::List(l) => l.is_empty(),
            ValueView::Secret(s) => s.is_empty(),
            ValueView::Duration(d) => d.is_zero(),
        }
    }

    fn render(&self) -> Option<String> {
        match *self {
            ValueView::Text(s) => Some(s.to_owned()),
            ValueView::Int(i) => Some(i.to_string()),
            ValueView::Uint(u) => Some(u.to_string()),
            ValueView::Float(f) => Some(f.to_string()),
            ValueView::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Conversion from a concrete field type to its [`ValueView`].
pub trait AsValueView {
    fn as_view(&self) -> ValueView<'_>;
}

impl AsValueView for String {
    fn as_view(&self) -> ValueView<'_> {
        ValueView::Text(self)
    }
}

macro_rules! int_as_view {
    ($($ty:ty),*) => {
        $(impl AsValueView for $ty {
            fn as_view(&self) -> ValueView<'_> {
                ValueView::Int(*self as i64)
            }
        })*
    };
}

int_as_view!(i8, i16, i32, i64);

macro_rules! uint_as_view {
    ($($ty:ty),*) => {
        $(impl AsValueView for $ty {
            fn as_view(&self) -> ValueView<'_> {
                ValueView::Uint(*self as u64)
            }
        })*
    };
}

uint_as_view!(u8, u16, u32, u64, usize);

impl AsValueView for f32 {
    fn as_view(&self) -> ValueView<'_> {
        ValueView::Float(*self as f64)
    }
}

impl AsValueView for f64 {
    fn as_view(&self) -> ValueView<'_> {
        ValueView::Float(*self)
    }
}

impl AsValueView for bool {
    fn as_view(&self) -> ValueView<'_> {
        ValueView::Bool(*self)
    }
}

impl AsValueView for Vec<String> {
    fn as_view(&self) -> ValueView<'_> {
        ValueView::List(self)
    }
}

impl AsValueView for Secret {
    fn as_view(&self) -> ValueView<'_> {
        ValueView::Secret(self)
    }
}

impl AsValueView for Duration {
    fn as_view(&self) -> ValueView<'_> {
        ValueView::Duration(*self)
    }
}

/// A config type that exposes its fields to the validation engine.
pub trait Validatable {
    fn visit_fields(&self, v: &mut FieldValidator<'_>);

    /// Custom checks run after the declarative rules; their errors
    /// merge into the same set. Invoked on the top-level object only.
    fn custom_checks(&self, _errors: &mut ValidationErrors) {}
}

/// Owns the compiled-regex cache and runs validation passes.
#[derive(Default)]
pub struct ValidationEngine {
    regex_cache: Mutex<HashMap<String, Regex>>,
}

impl ValidationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a whole object, returning every violation found.
    pub fn validate<T: Validatable>(&self, config: &T) -> Result<(), ValidationErrors> {
        let mut visitor = FieldValidator {
            engine: self,
            path: Vec::new(),
            errors: ValidationErrors::default(),
        };
        config.visit_fields(&mut visitor);

        let mut errors = visitor.errors;
        config.custom_checks(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn check(&self, rule: &Rule, view: &ValueView<'_>, field: &str) -> Option<ValidationError> {
        match rule {
            Rule::Min(min) => self.check_bound(view, field, *min, true),
            Rule::Max(max) => self.check_bound(view, field, *max, false),
            Rule::Port => self.check_port(view, field),
            Rule::Url => self.check_url(view, field),
            Rule::Host => self.check_host(view, field),
            Rule::Email => self.check_email(view, field),
            Rule::OneOf(options) => self.check_oneof(view, field, options),
            Rule::Regex(pattern) => self.check_regex(view, field, pattern),
            Rule::Invalid { raw, reason } => Some(ValidationError {
                field: field.to_owned(),
                value: raw.clone(),
                message: reason.clone(),
            }),
        }
    }

    // min/max compare numerics directly and strings by length, not
    // lexical order.
    fn check_bound(
        &self,
        view: &ValueView<'_>,
        field: &str,
        bound: i64,
        is_min: bool,
    ) -> Option<ValidationError> {
        let value = match *view {
            ValueView::Int(i) => i,
            ValueView::Uint(u) => i64::try_from(u).unwrap_or(i64::MAX),
            ValueView::Text(s) => s.len() as i64,
            _ => return None,
        };

        let failed = if is_min { value < bound } else { value > bound };
        if !failed {
            return None;
        }

        Some(ValidationError {
            field: field.to_owned(),
            value: value.to_string(),
            message: if is_min {
                format!("must be at least {bound}")
            } else {
                format!("must be at most {bound}")
            },
        })
    }

    fn check_port(&self, view: &ValueView<'_>, field: &str) -> Option<ValidationError> {
        let port = match *view {
            ValueView::Int(i) => i,
            ValueView::Uint(u) => i64::try_from(u).unwrap_or(i64::MAX),
            ValueView::Text(s) => match s.parse::<i64>() {
                Ok(p) => p,
                Err(_) => {
                    return Some(ValidationError {
                        field: field.to_owned(),
                        value: s.to_owned(),
                        message: "invalid port number".to_owned(),
                    })
                }
            },
            _ => return None,
        };

        if (1..=65535).contains(&port) {
            None
        } else {
            Some(ValidationError {
                field: field.to_owned(),
                value: port.to_string(),
                message: "port must be between 1 and 65535".to_owned(),
            })
        }
    }

    fn check_url(&self, view: &ValueView<'_>, field: &str) -> Option<ValidationError> {
        let ValueView::Text(s) = *view else {
            return None;
        };

        if url::Url::parse(s).is_ok() {
            None
        } else {
            Some(ValidationError {
                field: field.to_owned(),
                value: s.to_owned(),
                message: "invalid URL".to_owned(),
            })
        }
    }

    fn check_host(&self, view: &ValueView<'_>, field: &str) -> Option<ValidationError> {
        let ValueView::Text(s) = *view else {
            return None;
        };

        if is_valid_host(s) {
            None
        } else {
            Some(ValidationError {
                field: field.to_owned(),
                value: s.to_owned(),
                message: "invalid hostname".to_owned(),
            })
        }
    }

    fn check_email(&self, view: &ValueView<'_>, field: &str) -> Option<ValidationError> {
        let ValueView::Text(s) = *view else {
            return None;
        };

        static EMAIL: OnceLock<Regex> = OnceLock::new();
        let email = EMAIL.get_or_init(|| {
            Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("email pattern")
        });

        if email.is_match(s) {
            None
        } else {
            Some(ValidationError {
                field: field.to_owned(),
                value: s.to_owned(),
                message: "invalid email address".to_owned(),
            })
        }
    }

    fn check_oneof(
        &self,
        view: &ValueView<'_>,
        field: &str,
        options: &[String],
    ) -> Option<ValidationError> {
        let value = view.render()?;

        if options.iter().any(|opt| *opt == value) {
            None
        } else {
            Some(ValidationError {
                field: field.to_owned(),
                value,
                message: format!("must be one of: {}", options.join("|")),
            })
        }
    }

    fn check_regex(
        &self,
        view: &ValueView<'_>,
        field: &str,
        pattern: &str,
    ) -> Option<ValidationError> {
        let ValueView::Text(s) = *view else {
            return None;
        };

        let mut cache = self.regex_cache.lock().unwrap_or_else(|e| e.into_inner());
        if !cache.contains_key(pattern) {
            match Regex::new(pattern) {
                Ok(re) => {
                    cache.insert(pattern.to_owned(), re);
                }
                Err(_) => {
                    return Some(ValidationError {
                        field: field.to_owned(),
                        value: pattern.to_owned(),
                        message: "invalid regex pattern".to_owned(),
                    })
                }
            }
        }
        let compiled = &cache[pattern];

        if compiled.is_match(s) {
            None
        } else {
            Some(ValidationError {
                field: field.to_owned(),
                value: s.to_owned(),
                message: format!("must match pattern: {pattern}"),
            })
        }
    }

    #[cfg(test)]
    fn cached_patterns(&self) -> usize {
        self.regex_cache.lock().unwrap().len()
    }
}

/// Accepts an IP literal, a single-label name (service discovery), or
/// an RFC 1123 dotted hostname, optionally suffixed with `:port`.
fn is_valid_host(input: &str) -> bool {
    if input.parse::<IpAddr>().is_ok() {
        return true;
    }

    let host = match input.rsplit_once(':') {
        Some((host, port)) => {
            if port.is_empty() || port.parse::<u16>().is_err() {
                return false;
            }
            // A bracketed IPv6 literal keeps its colons inside [..].
            if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
                return inner.parse::<IpAddr>().is_ok();
            }
            if host.contains(':') {
                return false;
            }
            host
        }
        None => input,
    };

    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    is_valid_hostname(host)
}

fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }

    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// Field visitor for one validation pass; tracks the field path for
/// error reporting.
pub struct FieldValidator<'e> {
    engine: &'e ValidationEngine,
    path: Vec<&'static str>,
    errors: ValidationErrors,
}

impl FieldValidator<'_> {
    /// Checks one leaf field. The `required` flag fires on emptiness;
    /// all other rules run only when the value is non-empty.
    pub fn field<V: AsValueView>(&mut self, spec: &FieldSpec, value: &V) {
        let view = value.as_view();
        let field = self.field_path(spec.name());

        if view.is_empty() {
            if spec.is_required() {
                self.errors.push(ValidationError {
                    field,
                    value: String::new(),
                    message: "required field is missing or empty".to_owned(),
                });
            }
            return;
        }

        for rule in spec.rule_list() {
            if let Some(error) = self.engine.check(rule, &view, &field) {
                self.errors.push(error);
            }
        }
    }

    /// Descends into a nested sub-object, extending the field path.
    pub fn nested<T: Validatable>(&mut self, name: &'static str, value: &T) {
        self.path.push(name);
        value.visit_fields(self);
        self.path.pop();
    }

    fn field_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{name}", self.path.join("."))
        }
    }
}

/// Validates with a process-wide shared engine. The shared regex cache
/// lives for the life of the process; tests that need isolation build
/// their own [`ValidationEngine`].
pub fn validate<T: Validatable>(config: &T) -> Result<(), ValidationErrors> {
    static SHARED: OnceLock<ValidationEngine> = OnceLock::new();
    SHARED.get_or_init(ValidationEngine::new).validate(config)
}
