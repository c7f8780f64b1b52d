use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::artifact::{CodeArtifact, Diagnostic, Stage};
use crate::error::{ModelError, StudioError, StudioResult};
use crate::model::CodeModel;
use crate::prompt::{extract_code, generation_request};
use crate::session::SessionContext;

/// Turns a natural-language request into a candidate scene.
pub struct CodeGenerator {
    model: Arc<dyn CodeModel>,
}

pub(crate) fn model_diagnostic(stage: Stage, err: &ModelError) -> Diagnostic {
    if err.is_environment() {
        Diagnostic::environment(stage, err.to_string())
    } else {
        Diagnostic::fixable(stage, err.to_string())
    }
}

impl CodeGenerator {
    pub fn new(model: Arc<dyn CodeModel>) -> Self {
        Self { model }
    }

    /// One generation attempt. No retries happen here; the orchestrator owns
    /// the attempt budget.
    #[instrument(name = "generator.generate", skip_all, fields(attempt = attempt))]
    pub async fn generate(
        &self,
        prompt: &str,
        context: &SessionContext,
        attempt: u32,
    ) -> StudioResult<CodeArtifact> {
        if prompt.trim().is_empty() {
            return Err(StudioError::InvalidRequest("prompt must not be empty".into()));
        }

        let request = generation_request(prompt, context, attempt);
        let reply = self.model.complete(&request).await.map_err(|e| {
            warn!(error = %e, "model call failed during generation");
            StudioError::GenerationFailed(model_diagnostic(Stage::Generation, &e))
        })?;

        match extract_code(&reply) {
            Some(source) if !source.trim().is_empty() => {
                let code = CodeArtifact::new(source);
                debug!(scene = code.name(), chars = code.len(), "generated candidate");
                Ok(code)
            }
            _ => Err(StudioError::GenerationFailed(
                Diagnostic::fixable(Stage::Generation, "model response did not contain animation code")
                    .with_raw_output(reply),
            )),
        }
    }
}
