//! Error taxonomy for the identifier pipeline.
//!
//! Every operation returns [`IgsnError`]; "not found" and "not supported" are
//! ordinary variants rather than panics or default values. Task-level retry
//! decisions are driven by [`IgsnError::is_retryable`].

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, IgsnError>;

#[derive(Debug, Error)]
pub enum IgsnError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("schema not supported: {0}")]
    SchemaNotSupported(String),

    #[error("transformer not found: {from} -> {to}")]
    TransformerNotFound { from: String, to: String },

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("transform {from} -> {to} failed: {reason}")]
    TransformFailed {
        from: String,
        to: String,
        reason: String,
    },

    #[error("transient access conflict: {0}")]
    TransientConflict(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("version content already exists for record {record_id} in schema {schema}")]
    VersionContentAlreadyExists { record_id: Uuid, schema: String },

    #[error("invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("registrar error: {0}")]
    Registrar(#[from] RegistrarError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IgsnError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the task layer may re-queue the failed task.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientConflict(_) => true,
            Self::Registrar(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } | Self::TransformerNotFound { .. } => 404,
            Self::SchemaNotSupported(_) => 415,
            Self::ValidationFailed(_) | Self::TransformFailed { .. } => 422,
            Self::Forbidden(_) => 403,
            Self::Conflict(_)
            | Self::TransientConflict(_)
            | Self::VersionContentAlreadyExists { .. }
            | Self::InvalidTransition { .. } => 409,
            Self::Registrar(_) => 502,
            Self::Configuration(_) | Self::Io(_) | Self::Internal(_) => 500,
        }
    }
}

/// Failure talking to the minting registrar.
#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("service unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl RegistrarError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Render an error with its full `source()` chain, outermost first.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        // Variants that embed their source in Display would otherwise repeat it.
        let text = cause.to_string();
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}
