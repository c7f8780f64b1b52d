//! Session-aware pipeline that turns natural-language requests into rendered
//! Manim animations.
//!
//! A request flows through [`orchestrator::Orchestrator`]: a [`model::CodeModel`]
//! writes a candidate scene, [`validator`] checks it statically, the repair
//! loop fixes what it can, a [`render::Renderer`] produces the video and an
//! optional improvement pass refines the result. Every step is recorded in a
//! [`session::SessionStore`] so follow-up requests see the conversation.

pub mod artifact;
pub mod chat;
pub mod config;
pub mod error;
pub mod generator;
pub mod improve;
pub mod model;
pub mod orchestrator;
pub mod prompt;
pub mod render;
pub mod repair;
pub mod session;
pub mod validator;

pub use artifact::{AttemptMetadata, CodeArtifact, Diagnostic, DiagnosticKind, Stage, VideoArtifact};
pub use config::{StudioConfig, load_config};
pub use error::{ErrorClass, ModelError, StudioError, StudioResult};
pub use model::{CodeModel, ModelRequest, OpenAiCompatModel, Purpose};
pub use orchestrator::{
    GenerateRequest, ImproveOutcome, ImproveRequest, Orchestrator, PipelineSettings, RenderRequest,
    RunOutcome,
};
pub use render::{ManimRenderer, Renderer, ToolStatus, ToolingStatus};
pub use session::{InMemorySessionStore, SessionId, SessionInfo, SessionStore};
pub use validator::Validation;
