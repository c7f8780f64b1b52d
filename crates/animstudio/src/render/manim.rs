use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{Quality, Renderer, ToolStatus, ToolingStatus};
use crate::artifact::{CodeArtifact, Diagnostic, DiagnosticKind, Stage, VideoArtifact};

/// Bytes of tool output kept on a diagnostic.
const RAW_OUTPUT_LIMIT: usize = 4096;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lowercased fragments of tool output that point at the host, not the scene.
const ENVIRONMENT_MARKERS: &[&str] = &[
    "no module named 'manim'",
    "no module named manim",
    "couldn't find ffmpeg",
    "ffmpeg: not found",
    "ffmpeg was not found",
    "no such file or directory: 'ffmpeg'",
    "no such file or directory: 'latex'",
    "latex: not found",
    "latex error converting to dvi",
    "dvisvgm: not found",
    "no space left on device",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    pub manim_bin: String,
    pub ffmpeg_bin: String,
    pub quality: Quality,
    /// Where finished videos are stored and served from.
    pub output_dir: PathBuf,
    /// Parent of the per-render scratch directories.
    pub work_dir: PathBuf,
    pub timeout: Duration,
    /// Prefix for the public URL of a video.
    pub base_url: String,
}

/// Renders scenes with the Manim CLI.
pub struct ManimRenderer {
    settings: RenderSettings,
}

impl ManimRenderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    fn artifact(&self, file_name: String) -> VideoArtifact {
        VideoArtifact {
            url: VideoArtifact::public_url(&self.settings.base_url, &file_name),
            path: self.settings.output_dir.join(&file_name),
            file_name,
        }
    }

    async fn run_manim(&self, scratch: &Path, code: &CodeArtifact, stem: &str) -> Result<(), Diagnostic> {
        let mut cmd = Command::new(&self.settings.manim_bin);
        cmd.arg("render")
            .arg(format!("-q{}", self.settings.quality.flag()))
            .arg("--media_dir")
            .arg(scratch)
            .arg("-o")
            .arg(stem)
            .arg("scene.py")
            .arg(code.name())
            .current_dir(scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.settings.timeout, cmd.output()).await {
            Err(_) => {
                return Err(Diagnostic::fixable(
                    Stage::Render,
                    format!(
                        "render exceeded {}s; the scene is likely too long or too complex",
                        self.settings.timeout.as_secs()
                    ),
                ));
            }
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(Diagnostic::environment(
                    Stage::Render,
                    format!(
                        "manim executable '{}' not found; install Manim Community Edition",
                        self.settings.manim_bin
                    ),
                ));
            }
            Ok(Err(e)) => {
                return Err(Diagnostic::environment(
                    Stage::Render,
                    format!("failed to start manim: {e}"),
                ));
            }
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            return Ok(());
        }

        let mut combined = String::from_utf8_lossy(&output.stderr).into_owned();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            combined.push('\n');
            combined.push_str(&stdout);
        }
        Err(diagnose_failure(&combined, output.status.code()))
    }
}

/// Builds a render diagnostic from the tool's output.
pub(crate) fn diagnose_failure(output: &str, exit_code: Option<i32>) -> Diagnostic {
    let summary = summary_line(output).unwrap_or_else(|| match exit_code {
        Some(code) => format!("manim exited with status {code}"),
        None => "manim was terminated by a signal".to_string(),
    });
    let diagnostic = match classify(output) {
        DiagnosticKind::Environment => Diagnostic::environment(Stage::Render, summary),
        DiagnosticKind::Fixable => Diagnostic::fixable(Stage::Render, summary),
    };
    diagnostic.with_raw_output(tail(output, RAW_OUTPUT_LIMIT))
}

pub(crate) fn classify(output: &str) -> DiagnosticKind {
    let lower = output.to_lowercase();
    if ENVIRONMENT_MARKERS.iter().any(|m| lower.contains(m)) {
        DiagnosticKind::Environment
    } else {
        DiagnosticKind::Fixable
    }
}

/// The last line that names an error, or the last non-empty line.
fn summary_line(output: &str) -> Option<String> {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    lines
        .iter()
        .rev()
        .find(|l| l.contains("Error") || l.contains("Exception"))
        .or_else(|| lines.last())
        .map(|l| l.to_string())
}

/// Last `limit` bytes of `text`, cut on a char boundary.
fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn find_file(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file(&path, file_name) {
                return Some(found);
            }
        } else if path.file_name().and_then(|n| n.to_str()) == Some(file_name) {
            return Some(path);
        }
    }
    None
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems.
    copy_into_place(from, to).await?;
    tokio::fs::remove_file(from).await
}

/// Copies next to `to` under a hidden temporary name, then renames into
/// place. `to` never exists in a partially written state.
async fn copy_into_place(from: &Path, to: &Path) -> std::io::Result<()> {
    let file_name = to.file_name().and_then(|n| n.to_str()).unwrap_or("video");
    let part = to.with_file_name(format!(".{file_name}.{}.part", Uuid::new_v4().simple()));
    let copied = match tokio::fs::copy(from, &part).await {
        Ok(_) => tokio::fs::rename(&part, to).await,
        Err(e) => Err(e),
    };
    if copied.is_err() {
        let _ = tokio::fs::remove_file(&part).await;
    }
    copied
}

async fn probe_tool(bin: &str, version_flag: &str) -> ToolStatus {
    if which::which(bin).is_err() {
        return ToolStatus::missing();
    }
    let output = Command::new(bin)
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(PROBE_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            let version = text
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string);
            ToolStatus::found(version)
        }
        Ok(Ok(_)) | Ok(Err(_)) => ToolStatus::missing(),
        Err(_) => {
            warn!(bin, "version probe timed out");
            ToolStatus::found(None)
        }
    }
}

#[async_trait]
impl Renderer for ManimRenderer {
    #[instrument(name = "renderer.render", skip_all, fields(scene = code.name()))]
    async fn render(&self, code: &CodeArtifact) -> Result<VideoArtifact, Diagnostic> {
        let file_name = VideoArtifact::file_name_for(code);
        let artifact = self.artifact(file_name);
        if tokio::fs::try_exists(&artifact.path).await.unwrap_or(false) {
            debug!(file = %artifact.file_name, "reusing existing video");
            return Ok(artifact);
        }

        let host_error =
            |what: &str, e: std::io::Error| Diagnostic::environment(Stage::Render, format!("{what}: {e}"));

        tokio::fs::create_dir_all(&self.settings.output_dir)
            .await
            .map_err(|e| host_error("cannot create output directory", e))?;
        let scratch = self.settings.work_dir.join(format!("render-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| host_error("cannot create scratch directory", e))?;

        let result = async {
            tokio::fs::write(scratch.join("scene.py"), code.source())
                .await
                .map_err(|e| host_error("cannot write scene file", e))?;

            let stem = artifact.file_name.trim_end_matches(".mp4").to_string();
            self.run_manim(&scratch, code, &stem).await?;

            let wanted = format!("{stem}.mp4");
            let search_root = scratch.clone();
            let produced = tokio::task::spawn_blocking(move || find_file(&search_root, &wanted))
                .await
                .ok()
                .flatten()
                .ok_or_else(|| {
                    Diagnostic::fixable(
                        Stage::Render,
                        "manim finished without producing a video; make sure construct() plays at least one animation",
                    )
                })?;

            move_file(&produced, &artifact.path)
                .await
                .map_err(|e| host_error("cannot store rendered video", e))
        }
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!(error = %e, dir = %scratch.display(), "failed to remove scratch directory");
        }

        result?;
        info!(file = %artifact.file_name, "rendered video");
        Ok(artifact)
    }

    async fn probe(&self) -> ToolingStatus {
        let (manim, ffmpeg) = tokio::join!(
            probe_tool(&self.settings.manim_bin, "--version"),
            probe_tool(&self.settings.ffmpeg_bin, "-version"),
        );
        ToolingStatus { manim, ffmpeg }
    }
}
