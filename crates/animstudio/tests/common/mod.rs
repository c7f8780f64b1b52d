#![allow(dead_code)]

use animstudio::artifact::{CodeArtifact, Diagnostic, VideoArtifact};
use animstudio::render::{Renderer, ToolStatus, ToolingStatus};
use animstudio::{
    CodeModel, InMemorySessionStore, ModelError, ModelRequest, Orchestrator, PipelineSettings,
    Purpose,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub const BLUE_CIRCLE: &str = "from manim import *\n\nclass BlueCircle(Scene):\n    def construct(self):\n        circle = Circle(color=BLUE)\n        self.play(Create(circle))\n        self.wait(1)\n";

pub fn fenced(code: &str) -> String {
    format!("```python\n{code}```")
}

/// Model double that answers per purpose: queued replies first, then a
/// fixed fallback. Purposes with neither fail with `EmptyResponse`.
#[derive(Default)]
pub struct ScriptedModel {
    queued: Mutex<HashMap<Purpose, VecDeque<Result<String, ModelError>>>>,
    fallback: HashMap<Purpose, String>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always(mut self, purpose: Purpose, reply: impl Into<String>) -> Self {
        self.fallback.insert(purpose, reply.into());
        self
    }

    pub fn then(self, purpose: Purpose, reply: Result<String, ModelError>) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(purpose)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn calls(&self, purpose: Purpose) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.purpose == purpose)
            .count()
    }

    pub fn requests(&self, purpose: Purpose) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.purpose == purpose)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CodeModel for ScriptedModel {
    async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        self.requests.lock().unwrap().push(request.clone());
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&request.purpose)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(reply) => reply,
            None => self
                .fallback
                .get(&request.purpose)
                .cloned()
                .ok_or(ModelError::EmptyResponse),
        }
    }
}

/// Renderer double: plays queued failures, then succeeds.
#[derive(Default)]
pub struct StubRenderer {
    failures: Mutex<VecDeque<Diagnostic>>,
    rendered: Mutex<Vec<String>>,
}

impl StubRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(self, diagnostic: Diagnostic) -> Self {
        self.failures.lock().unwrap().push_back(diagnostic);
        self
    }

    pub fn rendered(&self) -> Vec<String> {
        self.rendered.lock().unwrap().clone()
    }
}

pub fn video_for(code: &CodeArtifact) -> VideoArtifact {
    let file_name = VideoArtifact::file_name_for(code);
    VideoArtifact {
        url: VideoArtifact::public_url("http://localhost:3001", &file_name),
        path: PathBuf::from("animations").join(&file_name),
        file_name,
    }
}

#[async_trait]
impl Renderer for StubRenderer {
    async fn render(&self, code: &CodeArtifact) -> Result<VideoArtifact, Diagnostic> {
        self.rendered.lock().unwrap().push(code.source().to_string());
        if let Some(diagnostic) = self.failures.lock().unwrap().pop_front() {
            return Err(diagnostic);
        }
        Ok(video_for(code))
    }

    async fn probe(&self) -> ToolingStatus {
        ToolingStatus {
            manim: ToolStatus::found(Some("Manim Community v0.18.1".into())),
            ffmpeg: ToolStatus::found(Some("ffmpeg version 6.1".into())),
        }
    }
}

pub fn settings() -> PipelineSettings {
    PipelineSettings::default()
}

pub fn studio(
    model: Arc<dyn CodeModel>,
    renderer: Arc<dyn Renderer>,
    settings: PipelineSettings,
) -> (Orchestrator, Arc<InMemorySessionStore>) {
    let store = Arc::new(InMemorySessionStore::new());
    let orchestrator = Orchestrator::new(store.clone(), model, renderer, settings);
    (orchestrator, store)
}
