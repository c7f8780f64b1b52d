use thiserror::Error;

use crate::artifact::{Diagnostic, Stage};
use crate::session::SessionId;

/// Errors raised by the generative text capability.
#[derive(Error, Debug)]
pub enum ModelError {
    /// The endpoint could not be reached at all.
    #[error("Model endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("HTTP Error: {0}")]
    HttpError(String),

    #[error("Model endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Model returned an empty response")]
    EmptyResponse,

    #[error("Response Format Error: {message}. Raw response: '{raw_response}'")]
    ResponseFormatError {
        message: String,
        raw_response: String,
    },

    #[error("Model is not configured: {0}")]
    NotConfigured(String),
}

impl ModelError {
    /// True when retrying with different code cannot help.
    pub fn is_environment(&self) -> bool {
        match self {
            ModelError::Unreachable(_) | ModelError::NotConfigured(_) => true,
            ModelError::Status { status, .. } => matches!(status, 401 | 403 | 404),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            ModelError::Unreachable(err.to_string())
        } else if err.is_decode() {
            ModelError::ResponseFormatError {
                message: err.to_string(),
                raw_response: String::new(),
            }
        } else {
            ModelError::HttpError(err.to_string())
        }
    }
}

/// Error taxonomy of the pipeline and its session store.
#[derive(Error, Debug)]
pub enum StudioError {
    #[error("Generation failed: {0}")]
    GenerationFailed(Diagnostic),

    #[error("Validation failed: {0}")]
    ValidationFailed(Diagnostic),

    #[error("Render failed: {0}")]
    RenderFailed(Diagnostic),

    #[error("{stage} repair budget exhausted after {attempts} attempts; last error: {last}")]
    RepairExhausted {
        stage: Stage,
        attempts: u32,
        last: Diagnostic,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    #[error("Model Error: {0}")]
    Model(#[from] ModelError),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration Error: {0}")]
    Config(String),
}

pub type StudioResult<T> = Result<T, StudioError>;

/// Who has to act on a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The requested animation could not be produced; the user should
    /// simplify or rephrase.
    Code,
    /// Tooling or configuration on the backend is broken.
    Environment,
    /// The request itself was malformed or referenced an unknown session.
    Request,
}

impl StudioError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StudioError::GenerationFailed(d) | StudioError::RenderFailed(d) => {
                if d.is_environment() {
                    ErrorClass::Environment
                } else {
                    ErrorClass::Code
                }
            }
            StudioError::ValidationFailed(_) | StudioError::RepairExhausted { .. } => {
                ErrorClass::Code
            }
            StudioError::SessionNotFound(_) | StudioError::InvalidRequest(_) => {
                ErrorClass::Request
            }
            StudioError::Model(e) => {
                if e.is_environment() {
                    ErrorClass::Environment
                } else {
                    ErrorClass::Code
                }
            }
            StudioError::Io(_) | StudioError::Config(_) => ErrorClass::Environment,
        }
    }

    /// Human-readable text telling the caller what to do next.
    pub fn user_message(&self) -> String {
        match self.class() {
            ErrorClass::Code => format!(
                "{self}. The animation could not be produced; please try simplifying your request."
            ),
            ErrorClass::Environment => format!(
                "{self}. The backend environment is misconfigured; check the status endpoint for missing tooling."
            ),
            ErrorClass::Request => self.to_string(),
        }
    }
}
