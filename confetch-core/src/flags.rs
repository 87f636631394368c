//! Feature flags layered over the flat config map.
//!
//! Flags are plain config keys under a prefix (`FEATURE_` by default)
//! interpreted as booleans, with typed accessors for the occasional
//! numeric or list-valued flag. Lookups are cached until the next
//! [`FeatureFlags::update`].

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::Result;
use crate::map::{FieldValue, FlatMap, FromFlatMap, Mapper};
use crate::schema::{FieldSpec, TypeSpec};

pub const DEFAULT_FLAG_PREFIX: &str = "FEATURE_";

struct FlagState {
    values: FlatMap,
    cache: HashMap<String, bool>,
}

pub struct FeatureFlags {
    prefix: String,
    state: RwLock<FlagState>,
}

impl FeatureFlags {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: RwLock::new(FlagState {
                values: FlatMap::new(),
                cache: HashMap::new(),
            }),
        }
    }

    pub fn from_values(values: FlatMap) -> Self {
        let flags = Self::new(DEFAULT_FLAG_PREFIX);
        flags.update(values);
        flags
    }

    /// `"new-billing flow"` becomes `FEATURE_NEW_BILLING_FLOW`.
    fn build_key(&self, name: &str) -> String {
        let normalized: String = name
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' | '.' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{normalized}", self.prefix)
    }

    fn raw_value(&self, key: &str) -> Option<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if let Some(value) = state.values.get(key) {
            return Some(value.clone());
        }
        // Tolerate casing drift in the stored keys.
        state
            .values
            .iter()
            .find(|(stored, _)| stored.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.clone())
    }

    /// Whether the named flag is on. Unknown flags and values that do
    /// not parse as booleans are off.
    pub fn is_enabled(&self, name: &str) -> bool {
        let key = self.build_key(name);
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = state.cache.get(&key) {
                return *cached;
            }
        }

        let enabled = self
            .raw_value(&key)
            .and_then(|raw| <bool as FieldValue>::coerce(&raw).ok())
            .unwrap_or(false);

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.cache.insert(key, enabled);
        enabled
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        !self.is_enabled(name)
    }

    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        self.typed(name).unwrap_or(default)
    }

    pub fn get_float(&self, name: &str, default: f64) -> f64 {
        self.typed(name).unwrap_or(default)
    }

    pub fn get_string(&self, name: &str, default: &str) -> String {
        self.raw_value(&self.build_key(name))
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn get_list(&self, name: &str) -> Vec<String> {
        self.typed(name).unwrap_or_default()
    }

    fn typed<V: FieldValue>(&self, name: &str) -> Option<V> {
        self.raw_value(&self.build_key(name))
            .and_then(|raw| V::coerce(&raw).ok())
    }

    /// Replaces the backing values and clears the lookup cache. Wire
    /// this to a loader change callback to keep flags current.
    pub fn update(&self, values: FlatMap) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.values = values;
        state.cache.clear();
    }
}

/// Percentage rollout with explicit allow and block lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RolloutConfig {
    pub percentage: u8,
    pub allowed_users: Vec<String>,
    pub blocked_users: Vec<String>,
}

impl FromFlatMap for RolloutConfig {
    fn type_spec() -> &'static TypeSpec {
        static SPEC: std::sync::OnceLock<TypeSpec> = std::sync::OnceLock::new();
        SPEC.get_or_init(|| {
            TypeSpec::new(
                "RolloutConfig",
                vec![
                    FieldSpec::new("percentage")
                        .key("ROLLOUT_PERCENTAGE")
                        .default_value("0")
                        .rules("min=0,max=100"),
                    FieldSpec::new("allowed_users").key("ROLLOUT_ALLOWED_USERS"),
                    FieldSpec::new("blocked_users").key("ROLLOUT_BLOCKED_USERS"),
                ],
            )
        })
    }

    fn map(mapper: &mut Mapper) -> Result<Self> {
        let spec = Self::type_spec();
        Ok(Self {
            percentage: mapper.resolve(spec.field("percentage"))?,
            allowed_users: mapper.resolve(spec.field("allowed_users"))?,
            blocked_users: mapper.resolve(spec.field("blocked_users"))?,
        })
    }
}

impl RolloutConfig {
    /// Block list wins over the allow list; everyone else falls into
    /// the percentage bucket. The same user id always lands in the
    /// same bucket.
    pub fn should_enable(&self, user_id: &str) -> bool {
        if self.blocked_users.iter().any(|u| u == user_id) {
            return false;
        }
        if self.allowed_users.iter().any(|u| u == user_id) {
            return true;
        }
        if self.percentage >= 100 {
            return true;
        }
        if self.percentage == 0 {
            return false;
        }
        (stable_hash(user_id) % 100) < u64::from(self.percentage)
    }
}

// FNV-1a, so bucket assignment is stable across processes.
fn stable_hash(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::map_config;

    fn flags(pairs: &[(&str, &str)]) -> FeatureFlags {
        let values = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        FeatureFlags::from_values(values)
    }

    #[test]
    fn names_normalize_to_flag_keys() {
        let flags = flags(&[("FEATURE_NEW_BILLING_FLOW", "true")]);
        assert!(flags.is_enabled("new-billing-flow"));
        assert!(flags.is_enabled("new billing flow"));
        assert!(flags.is_enabled("NEW_BILLING_FLOW"));
        assert!(flags.is_disabled("other"));
    }

    #[test]
    fn boolean_aliases_apply() {
        let flags = flags(&[
            ("FEATURE_A", "yes"),
            ("FEATURE_B", "off"),
            ("FEATURE_C", "definitely"),
        ]);
        assert!(flags.is_enabled("a"));
        assert!(!flags.is_enabled("b"));
        // Unparseable values are off, not errors.
        assert!(!flags.is_enabled("c"));
    }

    #[test]
    fn typed_accessors_fall_back_to_defaults() {
        let flags = flags(&[
            ("FEATURE_BATCH_SIZE", "250"),
            ("FEATURE_SAMPLE_RATE", "0.25"),
            ("FEATURE_MODE", "canary"),
            ("FEATURE_REGIONS", "eu-1, us-2"),
        ]);

        assert_eq!(flags.get_int("batch-size", 50), 250);
        assert_eq!(flags.get_int("missing", 50), 50);
        assert!((flags.get_float("sample-rate", 1.0) - 0.25).abs() < f64::EPSILON);
        assert_eq!(flags.get_string("mode", "steady"), "canary");
        assert_eq!(flags.get_string("missing", "steady"), "steady");
        assert_eq!(flags.get_list("regions"), vec!["eu-1", "us-2"]);
        assert!(flags.get_list("missing").is_empty());
    }

    #[test]
    fn update_invalidates_cached_answers() {
        let flags = flags(&[("FEATURE_X", "true")]);
        assert!(flags.is_enabled("x"));

        flags.update(
            [("FEATURE_X".to_owned(), "false".to_owned())]
                .into_iter()
                .collect(),
        );
        assert!(!flags.is_enabled("x"));
    }

    #[test]
    fn rollout_maps_from_flat_values() {
        let values: FlatMap = [
            ("ROLLOUT_PERCENTAGE", "25"),
            ("ROLLOUT_ALLOWED_USERS", "vip-1,vip-2"),
            ("ROLLOUT_BLOCKED_USERS", "banned-1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

        let (rollout, warnings) = map_config::<RolloutConfig>(&values).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(rollout.percentage, 25);
        assert_eq!(rollout.allowed_users, vec!["vip-1", "vip-2"]);
        assert_eq!(rollout.blocked_users, vec!["banned-1"]);
    }

    #[test]
    fn rollout_lists_take_precedence_over_percentage() {
        let rollout = RolloutConfig {
            percentage: 0,
            allowed_users: vec!["vip".to_owned()],
            blocked_users: vec!["banned".to_owned()],
        };
        assert!(rollout.should_enable("vip"));
        assert!(!rollout.should_enable("banned"));
        assert!(!rollout.should_enable("random"));
    }

    #[test]
    fn rollout_bucketing_is_deterministic_and_bounded() {
        let all = RolloutConfig { percentage: 100, ..Default::default() };
        let none = RolloutConfig { percentage: 0, ..Default::default() };
        let half = RolloutConfig { percentage: 50, ..Default::default() };

        assert!(all.should_enable("anyone"));
        assert!(!none.should_enable("anyone"));

        let first = half.should_enable("user-42");
        for _ in 0..10 {
            assert_eq!(half.should_enable("user-42"), first);
        }

        // With enough users both buckets are populated.
        let enabled = (0..1_000)
            .filter(|i| half.should_enable(&format!("user-{i}")))
            .count();
        assert!(enabled > 0 && enabled < 1_000);
    }
}
