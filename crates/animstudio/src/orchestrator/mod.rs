//! Drives generate → validate → repair → render → improve for one session.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::artifact::{AttemptMetadata, CodeArtifact, Diagnostic, Stage, VideoArtifact};
use crate::error::{StudioError, StudioResult};
use crate::generator::CodeGenerator;
use crate::improve::ImproveEngine;
use crate::model::CodeModel;
use crate::render::{Renderer, ToolingStatus};
use crate::repair::RepairEngine;
use crate::session::{
    Operation, RunRecord, SessionContext, SessionEntry, SessionId, SessionInfo, SessionStore, Turn,
};
use crate::validator::{self, Validation};

mod machine;
pub use machine::{Budget, Machine, PipelineState, RepairContext};

/// Tunables of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub max_generation_attempts: u32,
    pub max_render_attempts: u32,
    pub auto_improve: bool,
    pub context_turns: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_generation_attempts: 3,
            max_render_attempts: 3,
            auto_improve: true,
            context_turns: 6,
        }
    }
}

impl PipelineSettings {
    fn budget(&self) -> Budget {
        Budget {
            max_generation_attempts: self.max_generation_attempts,
            max_render_attempts: self.max_render_attempts,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub prompt: String,
    pub session_id: SessionId,
    /// Merged into the session before generation starts.
    pub preferences: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
    pub code: String,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Default)]
pub struct ImproveRequest {
    pub code: String,
    pub feedback: String,
    pub session_id: SessionId,
}

/// A finished generate or render run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub session_id: SessionId,
    pub code: CodeArtifact,
    pub video: VideoArtifact,
    pub metadata: AttemptMetadata,
    pub session: SessionInfo,
}

/// A finished explicit improvement.
#[derive(Debug, Clone)]
pub struct ImproveOutcome {
    pub session_id: SessionId,
    pub original: CodeArtifact,
    pub code: CodeArtifact,
    pub feedback: String,
    pub was_improved: bool,
    pub session: SessionInfo,
}

/// One lock per session id; runs against the same session queue here.
#[derive(Default)]
struct SessionGates {
    gates: StdMutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl SessionGates {
    async fn acquire(&self, session_id: &SessionId) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop gates nobody holds or waits on.
            gates.retain(|_, gate| Arc::strong_count(gate) > 1);
            gates.entry(session_id.clone()).or_default().clone()
        };
        gate.lock_owned().await
    }
}

pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    generator: CodeGenerator,
    repairer: RepairEngine,
    improver: ImproveEngine,
    renderer: Arc<dyn Renderer>,
    settings: PipelineSettings,
    gates: SessionGates,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        model: Arc<dyn CodeModel>,
        renderer: Arc<dyn Renderer>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            generator: CodeGenerator::new(model.clone()),
            repairer: RepairEngine::new(model.clone()),
            improver: ImproveEngine::new(model),
            renderer,
            settings,
            gates: SessionGates::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    /// Static validation only; touches no session.
    pub fn validate(&self, code: &str) -> Validation {
        validator::validate(&CodeArtifact::new(code))
    }

    pub async fn status(&self) -> ToolingStatus {
        self.renderer.probe().await
    }

    /// Prompt to video, with repair and one optional improvement pass.
    #[instrument(name = "orchestrator.generate", skip_all, fields(session = %request.session_id))]
    pub async fn generate(&self, request: GenerateRequest) -> StudioResult<RunOutcome> {
        if request.prompt.trim().is_empty() {
            return Err(StudioError::InvalidRequest("prompt must not be empty".into()));
        }
        let id = request.session_id;
        let _gate = self.gates.acquire(&id).await;
        let _lease = self.store.lease(&id).await?;

        if !request.preferences.is_empty() {
            self.store.set_preferences(&id, request.preferences).await?;
        }
        let context = self.store.get_or_create(&id).await?.context(self.settings.context_turns);
        self.store
            .append(&id, SessionEntry::Turn(Turn::user(request.prompt.clone())))
            .await?;

        let (mut machine, state) = Machine::for_generation(self.settings.budget());
        let result = self
            .drive(&id, &context, Some(&request.prompt), &mut machine, state)
            .await;

        let reply = match &result {
            Ok((code, video)) => format!(
                "Rendered scene {} as {} ({} generation attempt(s), {} render attempt(s)).",
                code.name(),
                video.file_name,
                machine.metadata().generation_attempts,
                machine.metadata().rendering_attempts
            ),
            Err(err) => err.user_message(),
        };
        self.store
            .append(&id, SessionEntry::Turn(Turn::assistant(reply)))
            .await?;

        let (code, video) = result?;
        self.finish(id, Operation::Generate, code, video, machine.metadata())
            .await
    }

    /// Caller-supplied code to video. Starts at validation with no generation attempts.
    #[instrument(name = "orchestrator.render", skip_all, fields(session = %request.session_id))]
    pub async fn render(&self, request: RenderRequest) -> StudioResult<RunOutcome> {
        let code = CodeArtifact::new(request.code);
        if code.is_empty() {
            return Err(StudioError::InvalidRequest("code must not be empty".into()));
        }
        let id = request.session_id;
        let _gate = self.gates.acquire(&id).await;
        let _lease = self.store.lease(&id).await?;

        let context = self.store.get_or_create(&id).await?.context(self.settings.context_turns);
        self.store.append(&id, SessionEntry::Code(code.clone())).await?;

        let (mut machine, state) = Machine::for_code(self.settings.budget(), code);
        let (code, video) = self.drive(&id, &context, None, &mut machine, state).await?;
        self.finish(id, Operation::Render, code, video, machine.metadata())
            .await
    }

    /// Applies user feedback to working code. No rendering.
    #[instrument(name = "orchestrator.improve", skip_all, fields(session = %request.session_id))]
    pub async fn improve(&self, request: ImproveRequest) -> StudioResult<ImproveOutcome> {
        let original = CodeArtifact::new(request.code);
        if original.is_empty() {
            return Err(StudioError::InvalidRequest("code must not be empty".into()));
        }
        let feedback = request.feedback.trim().to_string();
        if feedback.is_empty() {
            return Err(StudioError::InvalidRequest("feedback must not be empty".into()));
        }
        let id = request.session_id;
        let _gate = self.gates.acquire(&id).await;
        let _lease = self.store.lease(&id).await?;

        let context = self.store.get_or_create(&id).await?.context(self.settings.context_turns);
        let improvement = match self.improver.improve(&original, Some(&feedback), &context).await {
            Ok(improvement) => improvement,
            Err(err) => {
                self.store
                    .append_all(
                        &id,
                        vec![
                            SessionEntry::Turn(Turn::user(feedback)),
                            SessionEntry::Diagnostic(failure_diagnostic(Stage::Improve, &err)),
                            SessionEntry::Turn(Turn::assistant(err.user_message())),
                        ],
                    )
                    .await?;
                return Err(err);
            }
        };

        let reply = if improvement.was_improved {
            format!("Updated scene {} based on your feedback.", improvement.code.name())
        } else {
            "The scene already satisfies this feedback; no changes were made.".to_string()
        };
        let mut entries = vec![SessionEntry::Turn(Turn::user(feedback.clone()))];
        if improvement.was_improved {
            entries.push(SessionEntry::Code(improvement.code.clone()));
        }
        entries.push(SessionEntry::Turn(Turn::assistant(reply)));
        self.store.append_all(&id, entries).await?;

        info!(was_improved = improvement.was_improved, "applied feedback");
        Ok(ImproveOutcome {
            session: self.store.get(&id).await?.info(),
            session_id: id,
            original,
            code: improvement.code,
            feedback,
            was_improved: improvement.was_improved,
        })
    }

    async fn finish(
        &self,
        id: SessionId,
        operation: Operation,
        code: CodeArtifact,
        video: VideoArtifact,
        metadata: AttemptMetadata,
    ) -> StudioResult<RunOutcome> {
        let record = RunRecord {
            operation,
            metadata,
            code_name: code.name().to_string(),
            video_file_name: video.file_name.clone(),
            at: OffsetDateTime::now_utc(),
        };
        self.store.append(&id, SessionEntry::Run(record)).await?;
        info!(
            scene = code.name(),
            video = %video.file_name,
            generation_attempts = metadata.generation_attempts,
            rendering_attempts = metadata.rendering_attempts,
            was_code_fixed = metadata.was_code_fixed,
            was_improved = metadata.was_improved,
            "run completed"
        );
        Ok(RunOutcome {
            session: self.store.get(&id).await?.info(),
            session_id: id,
            code,
            video,
            metadata,
        })
    }

    /// Steps the machine until it reaches a terminal state, recording every
    /// candidate and diagnostic in the session on the way.
    async fn drive(
        &self,
        id: &SessionId,
        context: &SessionContext,
        prompt: Option<&str>,
        machine: &mut Machine,
        mut state: PipelineState,
    ) -> StudioResult<(CodeArtifact, VideoArtifact)> {
        loop {
            debug!(state = state.name(), "pipeline step");
            state = match state {
                PipelineState::Generating => {
                    let Some(prompt) = prompt else {
                        return Err(StudioError::InvalidRequest(
                            "generation requires a prompt".into(),
                        ));
                    };
                    let attempt = machine.metadata().generation_attempts;
                    let result = self.generator.generate(prompt, context, attempt).await;
                    match &result {
                        Ok(code) => self.record(id, SessionEntry::Code(code.clone())).await?,
                        Err(err) => {
                            self.record(
                                id,
                                SessionEntry::Diagnostic(failure_diagnostic(Stage::Generation, err)),
                            )
                            .await?
                        }
                    }
                    machine.on_generated(result)
                }
                PipelineState::Validating(code) => {
                    let validation = validator::validate(&code);
                    if let Validation::Invalid(diagnostic) = &validation {
                        self.record(id, SessionEntry::Diagnostic(diagnostic.clone()))
                            .await?;
                    }
                    machine.on_validated(code, validation)
                }
                PipelineState::Repairing {
                    context: repair_context,
                    code,
                    diagnostic,
                } => {
                    let attempt = machine.attempts(repair_context);
                    let result = self
                        .repairer
                        .repair(&code, &diagnostic, context, attempt)
                        .await;
                    match &result {
                        Ok(fixed) => self.record(id, SessionEntry::Code(fixed.clone())).await?,
                        Err(err) => {
                            self.record(
                                id,
                                SessionEntry::Diagnostic(failure_diagnostic(
                                    repair_context.stage(),
                                    err,
                                )),
                            )
                            .await?
                        }
                    }
                    machine.on_repaired(repair_context, code, diagnostic, result)
                }
                PipelineState::Rendering(code) => {
                    let result = self.renderer.render(&code).await;
                    if let Err(diagnostic) = &result {
                        self.record(id, SessionEntry::Diagnostic(diagnostic.clone()))
                            .await?;
                    }
                    machine.on_rendered(code, result)
                }
                PipelineState::Improving { code, video } => {
                    let (code, video) = self.auto_improve(id, context, machine, code, video).await?;
                    PipelineState::Done { code, video }
                }
                PipelineState::Done { code, video } => return Ok((code, video)),
                PipelineState::Failed(err) => {
                    warn!(error = %err, "pipeline failed");
                    return Err(err);
                }
            };
        }
    }

    /// One unprompted refinement pass. The refined code must validate and
    /// render before it replaces the working result; any failure keeps the
    /// original.
    async fn auto_improve(
        &self,
        id: &SessionId,
        context: &SessionContext,
        machine: &mut Machine,
        code: CodeArtifact,
        video: VideoArtifact,
    ) -> StudioResult<(CodeArtifact, VideoArtifact)> {
        if !self.settings.auto_improve {
            return Ok((code, video));
        }

        let improvement = match self.improver.improve(&code, None, context).await {
            Ok(improvement) if improvement.was_improved => improvement,
            Ok(_) => return Ok((code, video)),
            Err(err) => {
                warn!(error = %err, "improvement failed; keeping working code");
                self.record(id, SessionEntry::Diagnostic(failure_diagnostic(Stage::Improve, &err)))
                    .await?;
                return Ok((code, video));
            }
        };

        if let Validation::Invalid(diagnostic) = validator::validate(&improvement.code) {
            debug!(%diagnostic, "improved code failed validation; keeping working code");
            self.record(id, SessionEntry::Diagnostic(retag(diagnostic))).await?;
            return Ok((code, video));
        }

        match self.renderer.render(&improvement.code).await {
            Ok(improved_video) => {
                self.record(id, SessionEntry::Code(improvement.code.clone()))
                    .await?;
                machine.mark_improved();
                Ok((improvement.code, improved_video))
            }
            Err(diagnostic) => {
                debug!(%diagnostic, "improved code failed to render; keeping working code");
                self.record(id, SessionEntry::Diagnostic(retag(diagnostic))).await?;
                Ok((code, video))
            }
        }
    }

    async fn record(&self, id: &SessionId, entry: SessionEntry) -> StudioResult<()> {
        self.store.append(id, entry).await
    }
}

/// Attributes a diagnostic from re-checking improved code to the improve stage.
fn retag(mut diagnostic: Diagnostic) -> Diagnostic {
    diagnostic.stage = Stage::Improve;
    diagnostic
}

/// The diagnostic an error carries, or a synthesized one for errors that carry none.
fn failure_diagnostic(stage: Stage, err: &StudioError) -> Diagnostic {
    match err {
        StudioError::GenerationFailed(d)
        | StudioError::ValidationFailed(d)
        | StudioError::RenderFailed(d) => d.clone(),
        StudioError::RepairExhausted { last, .. } => last.clone(),
        StudioError::Model(e) => crate::generator::model_diagnostic(stage, e),
        other => match other.class() {
            crate::error::ErrorClass::Environment => Diagnostic::environment(stage, other.to_string()),
            _ => Diagnostic::fixable(stage, other.to_string()),
        },
    }
}
