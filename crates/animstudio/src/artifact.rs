//! Values that flow through the pipeline: candidate source, diagnostics,
//! rendered videos and per-run attempt counters.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

// Top-level classes only; nested classes cannot be rendered by name.
static SCENE_CLASS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^class[ \t]+([A-Za-z_][A-Za-z0-9_]*)[ \t]*\([^)]*Scene[^)]*\)[ \t]*:")
        .expect("scene class name regex")
});

static CLASS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^class[ \t]+([A-Za-z_][A-Za-z0-9_]*)").expect("class name regex")
});

/// Fallback name for sources that do not declare any class.
pub const DEFAULT_SCENE_NAME: &str = "Scene";

/// Pipeline stage a [`Diagnostic`] originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Generation,
    Validation,
    Render,
    Improve,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Generation => "generation",
            Stage::Validation => "validation",
            Stage::Render => "render",
            Stage::Improve => "improve",
        };
        f.write_str(name)
    }
}

/// Whether a failure can be addressed by changing the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    /// A defect in the candidate source; repair may help.
    Fixable,
    /// Missing tooling or an unreachable dependency; repair cannot help.
    Environment,
}

/// Structured failure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub stage: Stage,
    pub kind: DiagnosticKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl Diagnostic {
    pub fn fixable(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: DiagnosticKind::Fixable,
            message: message.into(),
            raw_output: None,
        }
    }

    pub fn environment(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: DiagnosticKind::Environment,
            message: message.into(),
            raw_output: None,
        }
    }

    pub fn with_raw_output(mut self, raw: impl Into<String>) -> Self {
        self.raw_output = Some(raw.into());
        self
    }

    pub fn is_environment(&self) -> bool {
        self.kind == DiagnosticKind::Environment
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.message)
    }
}

/// One candidate animation program.
///
/// Artifacts are immutable: a fix or an improvement always produces a new
/// artifact. The name is the first declared class, which for Manim sources is
/// the scene handed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeArtifact {
    source: String,
    name: String,
}

impl CodeArtifact {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let name = derive_name(&source);
        Self { source, name }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.source.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.source.trim().is_empty()
    }

    /// Source with line endings unified and surrounding whitespace removed.
    pub fn normalized(&self) -> String {
        self.source.replace("\r\n", "\n").trim().to_string()
    }

    /// True when both artifacts carry the same program modulo whitespace at
    /// the edges and line-ending style.
    pub fn same_as(&self, other: &CodeArtifact) -> bool {
        self.normalized() == other.normalized()
    }

    /// Stable 64-bit content hash over the normalised source and scene name.
    pub fn content_hash(&self) -> u64 {
        let mut data = self.normalized().into_bytes();
        data.push(0);
        data.extend_from_slice(self.name.as_bytes());
        rapidhash::v3::rapidhash_v3(&data)
    }

    pub fn into_source(self) -> String {
        self.source
    }
}

/// The first top-level class deriving from a Scene type, else the first
/// top-level class.
fn derive_name(source: &str) -> String {
    SCENE_CLASS_NAME
        .captures(source)
        .or_else(|| CLASS_NAME.captures(source))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| DEFAULT_SCENE_NAME.to_string())
}

/// A successfully rendered video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoArtifact {
    pub file_name: String,
    pub path: PathBuf,
    pub url: String,
}

impl VideoArtifact {
    /// Deterministic file name for the video rendered from `code`.
    pub fn file_name_for(code: &CodeArtifact) -> String {
        format!("{}_{:016x}.mp4", code.name(), code.content_hash())
    }

    /// Public URL under which the service exposes a video file.
    pub fn public_url(base_url: &str, file_name: &str) -> String {
        format!("{}/animations/{}", base_url.trim_end_matches('/'), file_name)
    }
}

/// Counters describing how much work one orchestration run needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptMetadata {
    pub generation_attempts: u32,
    pub rendering_attempts: u32,
    pub was_code_fixed: bool,
    pub was_improved: bool,
}
