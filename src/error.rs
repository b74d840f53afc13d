//! Error types for the advice orchestrator

use crate::models::ModelAccess;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    SchemaValidation(#[from] SchemaValidationError),

    #[error("Model not configured: {0}")]
    ModelUnavailable(ModelAccess),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Message that is safe to show to an end user.
    ///
    /// Model errors already carry a sanitized message; everything else
    /// collapses to a generic apology so internals stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            OrchestrationError::Model(err) => err.user_message.clone(),
            OrchestrationError::InvalidRequest(reason) => reason.clone(),
            _ => AiErrorKind::Unknown.user_message().to_string(),
        }
    }
}

/// Provider failure classes surfaced above the model client layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiErrorKind {
    RateLimit,
    AuthError,
    ProviderError,
    Timeout,
    Unknown,
}

impl AiErrorKind {
    pub fn user_message(&self) -> &'static str {
        match self {
            AiErrorKind::RateLimit => {
                "Our AI advisor is handling a lot of requests right now. Please try again shortly."
            }
            AiErrorKind::AuthError => {
                "The AI advisor is temporarily unavailable. Please try again later."
            }
            AiErrorKind::ProviderError => {
                "The AI advisor is temporarily unavailable. Please try again in a few minutes."
            }
            AiErrorKind::Timeout => {
                "That request took too long to answer. Try asking a simpler question."
            }
            AiErrorKind::Unknown => {
                "Something went wrong while preparing your answer. Please try again."
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AiErrorKind::RateLimit => "rate_limit",
            AiErrorKind::AuthError => "auth_error",
            AiErrorKind::ProviderError => "provider_error",
            AiErrorKind::Timeout => "timeout",
            AiErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified backend failure.
///
/// `Display` only ever renders the user-safe message; the raw provider
/// text is logged where the failure is classified and then dropped.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{user_message}")]
pub struct ModelError {
    pub kind: AiErrorKind,
    pub backend: ModelAccess,
    pub status: Option<u16>,
    pub user_message: String,
}

impl ModelError {
    pub fn new(kind: AiErrorKind, backend: ModelAccess, status: Option<u16>) -> Self {
        Self {
            kind,
            backend,
            status,
            user_message: kind.user_message().to_string(),
        }
    }
}

/// Structured output did not satisfy its domain schema.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{orchestrator} output failed schema validation: {reason}")]
pub struct SchemaValidationError {
    pub orchestrator: &'static str,
    pub reason: String,
}

impl SchemaValidationError {
    pub fn new(orchestrator: &'static str, reason: impl Into<String>) -> Self {
        Self {
            orchestrator,
            reason: reason.into(),
        }
    }
}
