use std::sync::Arc;
use tracing::{debug, instrument};

use crate::artifact::{CodeArtifact, Diagnostic, Stage};
use crate::error::{StudioError, StudioResult};
use crate::model::CodeModel;
use crate::prompt::{extract_code, improve_request};
use crate::session::SessionContext;

/// A refined candidate and whether it differs from its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Improvement {
    pub code: CodeArtifact,
    pub was_improved: bool,
}

/// Proposes a refined version of working code, either unprompted or guided by
/// user feedback.
pub struct ImproveEngine {
    model: Arc<dyn CodeModel>,
}

impl ImproveEngine {
    pub fn new(model: Arc<dyn CodeModel>) -> Self {
        Self { model }
    }

    #[instrument(name = "improve.improve", skip_all, fields(guided = feedback.is_some()))]
    pub async fn improve(
        &self,
        code: &CodeArtifact,
        feedback: Option<&str>,
        context: &SessionContext,
    ) -> StudioResult<Improvement> {
        let reply = self
            .model
            .complete(&improve_request(code, feedback, context))
            .await?;

        let source = extract_code(&reply)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                StudioError::GenerationFailed(
                    Diagnostic::fixable(Stage::Improve, "model response did not contain animation code")
                        .with_raw_output(reply.clone()),
                )
            })?;

        let candidate = CodeArtifact::new(source);
        let was_improved = !candidate.same_as(code);
        debug!(was_improved, "improvement proposed");
        Ok(Improvement {
            code: if was_improved { candidate } else { code.clone() },
            was_improved,
        })
    }
}
