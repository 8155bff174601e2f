use thiserror::Error;

pub type Result<T, E = RegistryError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{context}: identifier already exists: {identifier}")]
    DuplicateIdentifier { context: String, identifier: String },
    #[error("{context}: expected an identifier or {expected}, got {found}")]
    TypeMismatch {
        context: String,
        expected: &'static str,
        found: String,
    },
    #[error("{context}: unknown identifier: {identifier}")]
    UnknownIdentifier { context: String, identifier: String },
    #[error("{context}: action argument must be an identifier or {expected}")]
    InvalidArgumentType {
        context: String,
        expected: &'static str,
    },
    #[error("context not found: {0}")]
    MissingContext(String),
    #[error("context already exists: {0}")]
    DuplicateContext(String),
    #[error("no parser bound for context: {0}")]
    MissingParser(String),
    #[error("{context}.{identifier}: {reason}")]
    InvalidFragment {
        context: String,
        identifier: String,
        reason: String,
    },
    #[error("invalid configuration document: {0}")]
    InvalidDocument(String),
    #[error(transparent)]
    Device(#[from] anyhow::Error),
}

impl RegistryError {
    pub fn invalid_fragment(
        context: &str,
        identifier: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidFragment {
            context: context.to_string(),
            identifier: identifier.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unknown(context: &str, identifier: &str) -> Self {
        Self::UnknownIdentifier {
            context: context.to_string(),
            identifier: identifier.to_string(),
        }
    }
}
