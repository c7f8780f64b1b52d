//! The generative text capability behind generation, repair and improvement.

use async_trait::async_trait;
use std::fmt;

use crate::chat::ChatMessage;
use crate::error::ModelError;

mod openai;
pub use openai::{OpenAiCompatConfig, OpenAiCompatModel};

/// What a model call is for. Used for logging and by callers that route
/// different purposes to different behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Generate,
    Repair,
    Improve,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Purpose::Generate => "generate",
            Purpose::Repair => "repair",
            Purpose::Improve => "improve",
        })
    }
}

/// A system instruction plus an ordered conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequest {
    pub purpose: Purpose,
    pub system: String,
    pub messages: Vec<ChatMessage>,
}

/// Text generation from prompt + context. Implementations must be stateless
/// with respect to sessions; all context travels in the request.
#[async_trait]
pub trait CodeModel: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError>;
}
