//! TOML configuration for the studio and its service.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. String values may reference environment variables with
//! `${VAR}` or `${VAR:-default}`.

use anyhow::{Context, Result, anyhow};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::OpenAiCompatConfig;
use crate::orchestrator::PipelineSettings;
use crate::render::{Quality, RenderSettings};
use crate::session::SessionPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudioConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Public origin used to build video URLs.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// When set, every `/api` route requires `Authorization: Bearer <key>`.
    #[serde(default)]
    pub auth_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            base_url: default_base_url(),
            auth_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(default = "default_model_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_model_base_url(),
            model: default_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: None,
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderConfig {
    #[serde(default = "default_manim_bin")]
    pub manim_bin: String,
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_render_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            manim_bin: default_manim_bin(),
            ffmpeg_bin: default_ffmpeg_bin(),
            quality: Quality::default(),
            output_dir: default_output_dir(),
            work_dir: default_work_dir(),
            timeout_secs: default_render_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_attempts")]
    pub max_generation_attempts: u32,
    #[serde(default = "default_attempts")]
    pub max_render_attempts: u32,
    #[serde(default = "default_true")]
    pub auto_improve: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_generation_attempts: default_attempts(),
            max_render_attempts: default_attempts(),
            auto_improve: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Turns of conversation handed to the model as context.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_ttl_secs: default_idle_ttl_secs(),
            max_history: default_max_history(),
            context_turns: default_context_turns(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_addr() -> String {
    "0.0.0.0:3001".into()
}

fn default_base_url() -> String {
    "http://localhost:3001".into()
}

fn default_model_base_url() -> String {
    "http://localhost:11434/v1".into()
}

fn default_model() -> String {
    "qwen2.5-coder:7b".into()
}

fn default_temperature() -> Option<f32> {
    Some(0.2)
}

fn default_model_timeout_secs() -> u64 {
    120
}

fn default_manim_bin() -> String {
    "manim".into()
}

fn default_ffmpeg_bin() -> String {
    "ffmpeg".into()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("animations")
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("animstudio")
}

fn default_render_timeout_secs() -> u64 {
    180
}

fn default_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_sessions() -> usize {
    1000
}

fn default_idle_ttl_secs() -> u64 {
    60 * 60
}

fn default_max_history() -> usize {
    200
}

fn default_context_turns() -> usize {
    6
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl StudioConfig {
    /// Parses TOML after environment interpolation and validates the result.
    pub fn from_toml(content: &str) -> Result<Self> {
        let processed = interpolate_env_vars(content)?;
        let config: StudioConfig =
            toml::from_str(&processed).with_context(|| "Failed to parse studio config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_generation_attempts == 0 {
            return Err(anyhow!("pipeline.max_generation_attempts must be at least 1"));
        }
        if self.pipeline.max_render_attempts == 0 {
            return Err(anyhow!("pipeline.max_render_attempts must be at least 1"));
        }
        if self.sessions.max_sessions == 0 {
            return Err(anyhow!("sessions.max_sessions must be at least 1"));
        }
        if self.sessions.max_history == 0 {
            return Err(anyhow!("sessions.max_history must be at least 1"));
        }
        if self.sessions.sweep_interval_secs == 0 {
            return Err(anyhow!("sessions.sweep_interval_secs must be at least 1"));
        }
        if self.render.timeout_secs == 0 || self.model.timeout_secs == 0 {
            return Err(anyhow!("timeouts must be at least one second"));
        }
        if self.model.model.trim().is_empty() {
            return Err(anyhow!("model.model must not be empty"));
        }
        Ok(())
    }

    pub fn model_settings(&self) -> OpenAiCompatConfig {
        OpenAiCompatConfig {
            base_url: self.model.base_url.clone(),
            model: self.model.model.clone(),
            api_key: self.model.api_key.clone().filter(|k| !k.is_empty()),
            temperature: self.model.temperature,
            max_tokens: self.model.max_tokens,
            timeout: Duration::from_secs(self.model.timeout_secs),
        }
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            manim_bin: self.render.manim_bin.clone(),
            ffmpeg_bin: self.render.ffmpeg_bin.clone(),
            quality: self.render.quality,
            output_dir: self.render.output_dir.clone(),
            work_dir: self.render.work_dir.clone(),
            timeout: Duration::from_secs(self.render.timeout_secs),
            base_url: self.server.base_url.clone(),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_generation_attempts: self.pipeline.max_generation_attempts,
            max_render_attempts: self.pipeline.max_render_attempts,
            auto_improve: self.pipeline.auto_improve,
            context_turns: self.sessions.context_turns,
        }
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            max_sessions: self.sessions.max_sessions,
            idle_ttl: Duration::from_secs(self.sessions.idle_ttl_secs),
            max_history: self.sessions.max_history,
        }
    }
}

/// Load configuration from a TOML file.
pub async fn load_config(path: impl AsRef<Path>) -> Result<StudioConfig> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    StudioConfig::from_toml(&content)
}

/// Interpolate environment variables in config content
/// Supports ${VAR} and ${VAR:-default} syntax
pub fn interpolate_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
        .context("Failed to compile env var regex")?;

    let mut missing = Vec::new();
    let result = re.replace_all(content, |caps: &Captures| {
        let var_name = &caps[1];
        match (std::env::var(var_name), caps.get(2)) {
            (Ok(val), _) => val,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.push(var_name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(anyhow!(
            "Required environment variables not set: {}",
            missing.join(", ")
        ));
    }
    Ok(result.into_owned())
}
