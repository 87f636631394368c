use thiserror::Error;

use crate::validate::ValidationErrors;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no configuration source: set CONFETCH_TOKEN or CONFETCH_FALLBACK_PATH")]
    NoSource,

    #[error("provider error: {0}")]
    Provider(String),

    #[error("remote API returned status {status}: {body}")]
    RemoteStatus { status: u16, body: String },

    #[error("circuit breaker is open for '{0}'")]
    CircuitOpen(String),

    #[error("required field {field} (key: {key}) is missing or empty")]
    MissingRequired { field: String, key: String },

    /// For `FromFlatMap` implementations with mapping failures beyond
    /// what [`Error::MissingRequired`] covers.
    #[error("mapping error: {0}")]
    Mapping(String),

    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("close errors: {0}")]
    Close(String),
}

impl Error {
    /// True for errors raised by a source fetch (as opposed to mapping
    /// or validation), which are the ones the loader's failure policy
    /// applies to.
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            Error::Provider(_) | Error::RemoteStatus { .. } | Error::CircuitOpen(_)
        )
    }
}
