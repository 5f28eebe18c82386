//! Error types for the run engine.
//!
//! Per-sample failures never leave the pool as `Err`: they are rendered into a
//! prefixed string on the `SampleResult` and later bucketed by
//! [`category::classify`]. Only run-level failures surface as [`EngineError`].

pub mod category;

pub use category::ErrorCategory;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry-relevant class of a [`ScoringError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    RateLimit,
    ServerError,
    Network,
    ClientError,
    Validation,
    Crash,
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::Network => "network",
            Self::ClientError => "client_error",
            Self::Validation => "validation",
            Self::Crash => "crash",
            Self::Other => "other",
        }
    }
}

/// Failure of a single metric invocation (one call to the scoring service).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoringError {
    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("llm_error: rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("llm_error: server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("llm_error: request rejected {status}: {message}")]
    Client { status: u16, message: String },

    #[error("llm_error: network error: {message}")]
    Network { message: String },

    #[error("validation: {message}")]
    Validation { message: String },

    #[error("crash: {message}")]
    Crashed { message: String },

    #[error("{message}")]
    Other { message: String },
}

impl ScoringError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    pub fn client(status: u16, message: impl Into<String>) -> Self {
        Self::Client {
            status,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::Crashed {
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Map an HTTP status from the scoring service onto the taxonomy.
    /// 429 and 5xx are transient; every other non-success status is permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            429 => Self::RateLimited { retry_after: None },
            408 | 504 => Self::timeout(message),
            500..=599 => Self::server(status, message),
            _ => Self::client(status, message),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::RateLimited { .. } => ErrorClass::RateLimit,
            Self::Server { .. } => ErrorClass::ServerError,
            Self::Client { .. } => ErrorClass::ClientError,
            Self::Network { .. } => ErrorClass::Network,
            Self::Validation { .. } => ErrorClass::Validation,
            Self::Crashed { .. } => ErrorClass::Crash,
            Self::Other { .. } => ErrorClass::Other,
        }
    }

    pub fn is_retryable(&self, retryable: &[ErrorClass]) -> bool {
        retryable.contains(&self.class())
    }
}

impl From<anyhow::Error> for ScoringError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ScoringError>() {
            Ok(scoring) => scoring,
            Err(other) => Self::other(format!("{:#}", other)),
        }
    }
}

/// Failures of the component registry. Fatal only to the registering caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown component type: {kind}")]
    UnknownKind { kind: String },

    #[error("component '{name}' does not implement {expected} (it is a {found})")]
    MissingCapability {
        name: String,
        expected: String,
        found: String,
    },

    #[error("failed to load component '{name}': {reason}")]
    Load { name: String, reason: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },
}

/// Configuration loading and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);

/// Run-level errors returned by the [`crate::engine::Engine`] façade.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open dataset: {message}")]
    Dataset { message: String },

    #[error(transparent)]
    Component(#[from] RegistryError),

    #[error("run not found: {run_id}")]
    NotFound { run_id: String },

    #[error("timed out after {waited_ms}ms waiting for run {run_id}")]
    Timeout { run_id: String, waited_ms: u64 },

    #[error("run {run_id} stopped before replying")]
    Shutdown { run_id: String },
}

impl EngineError {
    pub fn not_found(run_id: impl Into<String>) -> Self {
        Self::NotFound {
            run_id: run_id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
