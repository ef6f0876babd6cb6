//! Error types for Compass.
//!
//! Every fallible operation in the library returns [`CompassError`]. The
//! gateway maps errors onto transport status codes through [`ErrorKind`].

use std::time::Duration;
use thiserror::Error;

use crate::queryexpr::ExprError;

/// Main error type for the Compass library.
#[derive(Debug, Error)]
pub enum CompassError {
    // Lookup errors
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    // Create-path conflicts
    #[error("asset with urn {urn:?} already exists")]
    UrnExists { urn: String },

    #[error("probe with id {id:?} already exists")]
    ProbeExists { id: String },

    #[error("{resource} already exists: {key}")]
    AlreadyExists { resource: &'static str, key: String },

    #[error("asset already deleted: {identifier}")]
    AlreadyDeleted { identifier: String },

    // Input validation
    #[error(transparent)]
    Invalid(#[from] InvalidError),

    #[error("asset id cannot be empty")]
    EmptyId,

    #[error("asset urn cannot be empty")]
    EmptyUrn,

    #[error("query expression cannot be empty")]
    EmptyQuery,

    #[error("services cannot be empty")]
    EmptyServices,

    #[error("unknown type: {0:?}")]
    UnknownType(String),

    #[error("asset cannot be nil")]
    NilAsset,

    #[error("conflicting filter on {field}: queries and filters disagree")]
    ConflictingFilter { field: String },

    // Delete expression validation
    #[error("must exists these identifiers: refreshed_at, type, and service")]
    MissRequiredIdentifier,

    #[error("identifier type and service must be equals (==) or IN operator")]
    TypeOrServiceHasWrongOperator,

    #[error("{0} is not a valid identifier")]
    InvalidIdentifier(String),

    #[error(transparent)]
    Expression(#[from] ExprError),

    // Search index errors
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    // Infrastructure errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Job queue error: {message}")]
    Queue { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Compass operations.
pub type Result<T> = std::result::Result<T, CompassError>;

/// Identifier that failed to match an existing row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotFoundError {
    #[error("no such record: {0:?}")]
    AssetId(String),

    #[error("could not find asset with urn = {0}")]
    Urn(String),

    #[error("could not find user with email = {0}")]
    Email(String),

    #[error("could not find user with id = {0}")]
    UserId(String),

    #[error("could not find version {version} of asset {identifier}")]
    Version { identifier: String, version: String },

    #[error("could not find asset")]
    Asset,
}

/// Malformed input rejected before touching any store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidError {
    #[error("invalid asset id: {0:?}")]
    AssetId(String),

    #[error("invalid range: {0}")]
    Range(String),

    #[error("invalid asset version: {0:?}")]
    Version(String),

    #[error("{0} is required")]
    Required(&'static str),

    #[error("invalid {field}: {message}")]
    Field { field: String, message: String },
}

/// Failure reported by the search index, with operation context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryError {
    pub op: String,
    pub id: String,
    pub index: String,
    pub es_code: String,
    pub cause: String,
}

impl DiscoveryError {
    pub fn new(op: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            cause: cause.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    pub fn with_es_code(mut self, code: impl Into<String>) -> Self {
        self.es_code = code.into();
        self
    }
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "discovery error")?;
        if !self.op.is_empty() {
            write!(f, ": {}", self.op)?;
        }
        if !self.id.is_empty() {
            write!(f, ": doc ID '{}'", self.id)?;
        }
        if !self.index.is_empty() {
            write!(f, ": index '{}'", self.index)?;
        }
        if !self.es_code.is_empty() {
            write!(f, ": elasticsearch code '{}'", self.es_code)?;
        }
        write!(f, ": {}", self.cause)
    }
}

impl std::error::Error for DiscoveryError {}

/// Coarse classification used by transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    Unavailable,
    Internal,
}

// Conversion implementations for common error types

impl From<rusqlite::Error> for CompassError {
    fn from(err: rusqlite::Error) -> Self {
        CompassError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CompassError {
    fn from(err: serde_json::Error) -> Self {
        CompassError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<std::io::Error> for CompassError {
    fn from(err: std::io::Error) -> Self {
        CompassError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for CompassError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CompassError::Timeout(Duration::from_secs(0))
        } else {
            CompassError::Network {
                message: err.to_string(),
                cause: err.url().map(|u| u.to_string()),
            }
        }
    }
}

impl CompassError {
    /// Create a database error that carries no driver error.
    pub fn database(message: impl Into<String>) -> Self {
        CompassError::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Classify the error for transport mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompassError::NotFound(_) => ErrorKind::NotFound,
            CompassError::UrnExists { .. }
            | CompassError::ProbeExists { .. }
            | CompassError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            CompassError::AlreadyDeleted { .. } => ErrorKind::FailedPrecondition,
            CompassError::Invalid(_)
            | CompassError::EmptyId
            | CompassError::EmptyUrn
            | CompassError::EmptyQuery
            | CompassError::EmptyServices
            | CompassError::UnknownType(_)
            | CompassError::NilAsset
            | CompassError::ConflictingFilter { .. }
            | CompassError::MissRequiredIdentifier
            | CompassError::TypeOrServiceHasWrongOperator
            | CompassError::InvalidIdentifier(_)
            | CompassError::Expression(_) => ErrorKind::InvalidArgument,
            CompassError::Network { .. } | CompassError::Timeout(_) => ErrorKind::Unavailable,
            CompassError::Discovery(_)
            | CompassError::Database { .. }
            | CompassError::Json { .. }
            | CompassError::Io { .. }
            | CompassError::Queue { .. }
            | CompassError::Config { .. }
            | CompassError::Cancelled
            | CompassError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            CompassError::Network { .. }
            | CompassError::Timeout(_)
            | CompassError::Discovery(_)
            | CompassError::Queue { .. } => true,
            CompassError::Database { source, .. } => matches!(
                source,
                Some(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy
                        || e.code == rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
