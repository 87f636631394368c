//! Per-type field schemas.
//!
//! A config type declares one [`TypeSpec`] — an ordered list of
//! [`FieldSpec`]s — built once and cached behind a `OnceLock` in its
//! [`FromFlatMap::type_spec`](crate::map::FromFlatMap::type_spec)
//! implementation. The mapper and the validation engine both read the
//! same descriptors, so the source key, default, required flag and
//! rule list for a field live in exactly one place.

/// A single declarative validation rule, parsed from a rule list such
/// as `"port"` or `"min=1,max=100"`.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Min(i64),
    Max(i64),
    Port,
    Url,
    Host,
    Email,
    OneOf(Vec<String>),
    Regex(String),
    /// A rule whose parameter failed to parse. Kept so the mistake
    /// surfaces as a validation error instead of being dropped.
    Invalid { raw: String, reason: String },
}

fn parse_rule(raw: &str) -> Option<Rule> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (name, param) = match raw.split_once('=') {
        Some((name, param)) => (name, Some(param)),
        None => (raw, None),
    };

    let rule = match (name, param) {
        ("min", Some(p)) => match p.parse::<i64>() {
            Ok(min) => Rule::Min(min),
            Err(_) => Rule::Invalid {
                raw: raw.to_owned(),
                reason: format!("min parameter '{p}' is not a valid integer"),
            },
        },
        ("max", Some(p)) => match p.parse::<i64>() {
            Ok(max) => Rule::Max(max),
            Err(_) => Rule::Invalid {
                raw: raw.to_owned(),
                reason: format!("max parameter '{p}' is not a valid integer"),
            },
        },
        ("port", None) => Rule::Port,
        ("url", None) => Rule::Url,
        ("host", None) => Rule::Host,
        ("email", None) => Rule::Email,
        ("oneof", Some(p)) => Rule::OneOf(p.split('|').map(str::to_owned).collect()),
        ("regex", Some(p)) => Rule::Regex(p.to_owned()),
        _ => Rule::Invalid {
            raw: raw.to_owned(),
            reason: format!("unknown validation rule '{name}'"),
        },
    };

    Some(rule)
}

/// Descriptor for one leaf field of a config type.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    name: &'static str,
    key: Option<&'static str>,
    default: Option<&'static str>,
    required: bool,
    secret: bool,
    rules: Vec<Rule>,
}

impl FieldSpec {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            key: None,
            default: None,
            required: false,
            secret: false,
            rules: Vec::new(),
        }
    }

    /// Sets the source key to look up in the flat map. Without this,
    /// the field's own name is used.
    pub fn key(mut self, key: &'static str) -> Self {
        self.key = Some(key);
        self
    }

    /// Sets the default, substituted when the source value is absent
    /// or empty.
    pub fn default_value(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    /// Attaches a comma-separated validation rule list, e.g.
    /// `"host"` or `"min=1,max=65535"`. Parsed once, here.
    pub fn rules(mut self, list: &str) -> Self {
        self.rules = list.split(',').filter_map(parse_rule).collect();
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source_key(&self) -> &'static str {
        self.key.unwrap_or(self.name)
    }

    pub fn default(&self) -> Option<&'static str> {
        self.default
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_secret(&self) -> bool {
        self.secret
    }

    pub fn rule_list(&self) -> &[Rule] {
        &self.rules
    }
}

/// The ordered field schema of one config type.
#[derive(Debug)]
pub struct TypeSpec {
    type_name: &'static str,
    fields: Vec<FieldSpec>,
}

impl TypeSpec {
    pub fn new(type_name: &'static str, fields: Vec<FieldSpec>) -> Self {
        Self { type_name, fields }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Looks up a field descriptor by field name.
    ///
    /// Panics when the name is not declared: the lookup string sits
    /// next to the declaration in the same `impl`, so a mismatch is a
    /// programming error caught by any test that touches the type.
    pub fn field(&self, name: &str) -> &FieldSpec {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("type {} declares no field '{name}'", self.type_name))
    }
}
