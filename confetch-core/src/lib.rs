pub mod bootstrap;
pub mod error;
pub mod flags;
pub mod loader;
pub mod logging;
pub mod map;
pub mod multitenant;
pub mod provider;
pub mod schema;
pub mod secret;
pub mod testing;
pub mod validate;
pub mod watcher;

pub use bootstrap::{Bootstrap, FailurePolicy};
pub use error::{Error, Result};
pub use flags::{FeatureFlags, RolloutConfig};
pub use loader::{Loader, Metadata};
pub use map::{map_config, FieldValue, FlatMap, FromFlatMap, Mapper};
pub use multitenant::{MultiTenantLoader, MultiTenantWatcher, ReloadDiff, SweepOutcome};
pub use provider::env::EnvProvider;
pub use provider::file::{write_fallback_file, FileProvider};
pub use provider::remote::RemoteProvider;
pub use provider::{Provider, Scope};
pub use schema::{FieldSpec, Rule, TypeSpec};
pub use secret::Secret;
pub use validate::{validate, FieldValidator, Validatable, ValidationEngine, ValidationError, ValidationErrors};
pub use watcher::Watcher;
