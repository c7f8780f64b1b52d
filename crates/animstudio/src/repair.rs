use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::artifact::{CodeArtifact, Diagnostic, Stage};
use crate::error::{StudioError, StudioResult};
use crate::model::CodeModel;
use crate::prompt::{extract_code, repair_request};
use crate::session::SessionContext;
use crate::validator::has_manim_import;

const MANIM_IMPORT_LINE: &str = "from manim import *";

/// Produces a corrected candidate from failing code and its diagnostic.
pub struct RepairEngine {
    model: Arc<dyn CodeModel>,
}

/// Deterministic fixes that need no model round trip.
pub fn local_fix(code: &CodeArtifact, diagnostic: &Diagnostic) -> Option<CodeArtifact> {
    if diagnostic.stage == Stage::Validation && !has_manim_import(code.source()) {
        return Some(CodeArtifact::new(format!(
            "{MANIM_IMPORT_LINE}\n\n{}",
            code.source().trim_start()
        )));
    }
    None
}

impl RepairEngine {
    pub fn new(model: Arc<dyn CodeModel>) -> Self {
        Self { model }
    }

    /// One repair attempt.
    ///
    /// Fails with `RepairExhausted` when no different candidate can be
    /// proposed. Environment-class model failures surface as `Model` errors so
    /// the caller can stop immediately.
    #[instrument(name = "repair.repair", skip_all, fields(stage = %diagnostic.stage, attempt = attempt))]
    pub async fn repair(
        &self,
        code: &CodeArtifact,
        diagnostic: &Diagnostic,
        context: &SessionContext,
        attempt: u32,
    ) -> StudioResult<CodeArtifact> {
        if let Some(fixed) = local_fix(code, diagnostic) {
            debug!("applied local fix");
            return Ok(fixed);
        }

        // `last` explains why this attempt produced nothing usable.
        let exhausted = |reason: String| StudioError::RepairExhausted {
            stage: diagnostic.stage,
            attempts: attempt,
            last: Diagnostic::fixable(
                diagnostic.stage,
                format!("repair attempt {attempt} failed: {reason}"),
            ),
        };

        let reply = match self.model.complete(&repair_request(code, diagnostic, context)).await {
            Ok(reply) => reply,
            Err(e) if e.is_environment() => return Err(StudioError::Model(e)),
            Err(e) => {
                warn!(error = %e, "model call failed during repair");
                return Err(exhausted(e.to_string()));
            }
        };

        let Some(source) = extract_code(&reply).filter(|s| !s.trim().is_empty()) else {
            warn!("repair reply contained no code");
            return Err(exhausted("the model reply contained no code".into()));
        };
        let fixed = CodeArtifact::new(source);
        if fixed.same_as(code) {
            warn!("repair returned the code unchanged");
            return Err(exhausted("the model returned the code unchanged".into()));
        }
        Ok(fixed)
    }
}
