//! Top-level error taxonomy.
//!
//! Each component (identity, session, locks, ...) defines its own narrow
//! `thiserror` enum for its public contract. `HubError` exists only at the
//! wiring boundary (axum handlers, sweepers, `main`) to let `?` flow between
//! components without every call site matching on a dozen different types.

use crate::identity::IdentityError;
use crate::session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("persistence I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type HubResult<T> = std::result::Result<T, HubError>;
