//! Turning validated code into a video file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact::{CodeArtifact, Diagnostic, VideoArtifact};

mod manim;
pub use manim::{ManimRenderer, RenderSettings};

/// Manim quality preset, passed as `-q<flag>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// 480p15
    #[default]
    Low,
    /// 720p30
    Medium,
    /// 1080p60
    High,
    /// 1440p60
    Production,
    /// 2160p60
    #[serde(rename = "4k")]
    FourK,
}

impl Quality {
    pub fn flag(&self) -> char {
        match self {
            Quality::Low => 'l',
            Quality::Medium => 'm',
            Quality::High => 'h',
            Quality::Production => 'p',
            Quality::FourK => 'k',
        }
    }
}

/// Presence and version of one external tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStatus {
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ToolStatus {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn found(version: Option<String>) -> Self {
        Self {
            installed: true,
            version,
        }
    }
}

/// What the renderer needs from the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolingStatus {
    pub manim: ToolStatus,
    pub ffmpeg: ToolStatus,
}

impl ToolingStatus {
    pub fn all_requirements_met(&self) -> bool {
        self.manim.installed && self.ffmpeg.installed
    }

    /// Actionable hints for whatever is missing.
    pub fn recommendations(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.manim.installed {
            out.push("Install Manim Community Edition: pip install manim".to_string());
        }
        if !self.ffmpeg.installed {
            out.push("Install FFmpeg and make sure it is on PATH".to_string());
        }
        out
    }
}

/// Executes validated code and produces a video, or a diagnostic saying why not.
///
/// Failures carry a [`DiagnosticKind`](crate::artifact::DiagnosticKind): fixable
/// ones are worth a repair attempt, environment ones are not.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, code: &CodeArtifact) -> Result<VideoArtifact, Diagnostic>;

    /// Reports the availability of the external tooling this renderer needs.
    async fn probe(&self) -> ToolingStatus;
}
