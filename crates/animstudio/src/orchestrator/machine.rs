//! Pure state transitions of one orchestration run.
//!
//! The machine owns the attempt counters and decides, from the outcome of each
//! stage, which state comes next. It performs no I/O, so every retry and
//! budget rule is testable without a model or a renderer.

use crate::artifact::{AttemptMetadata, CodeArtifact, Diagnostic, Stage, VideoArtifact};
use crate::error::{ErrorClass, StudioError};
use crate::validator::Validation;

/// Which loop a repair belongs to; decides the budget it draws from and where
/// the fixed code goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairContext {
    Validation,
    Render,
}

impl RepairContext {
    pub fn stage(&self) -> Stage {
        match self {
            RepairContext::Validation => Stage::Validation,
            RepairContext::Render => Stage::Render,
        }
    }
}

#[derive(Debug)]
pub enum PipelineState {
    Generating,
    Validating(CodeArtifact),
    Repairing {
        context: RepairContext,
        code: CodeArtifact,
        diagnostic: Diagnostic,
    },
    Rendering(CodeArtifact),
    Improving {
        code: CodeArtifact,
        video: VideoArtifact,
    },
    Done {
        code: CodeArtifact,
        video: VideoArtifact,
    },
    Failed(StudioError),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done { .. } | PipelineState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Generating => "generating",
            PipelineState::Validating(_) => "validating",
            PipelineState::Repairing { .. } => "repairing",
            PipelineState::Rendering(_) => "rendering",
            PipelineState::Improving { .. } => "improving",
            PipelineState::Done { .. } => "done",
            PipelineState::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub max_generation_attempts: u32,
    pub max_render_attempts: u32,
}

/// Attempt counters plus the transition rules.
#[derive(Debug, Clone)]
pub struct Machine {
    budget: Budget,
    metadata: AttemptMetadata,
}

impl Machine {
    /// A run that starts from a prompt. The first generation counts as attempt one.
    pub fn for_generation(budget: Budget) -> (Self, PipelineState) {
        let machine = Self {
            budget,
            metadata: AttemptMetadata {
                generation_attempts: 1,
                ..AttemptMetadata::default()
            },
        };
        (machine, PipelineState::Generating)
    }

    /// A run that starts from caller-supplied code; no generation happened.
    pub fn for_code(budget: Budget, code: CodeArtifact) -> (Self, PipelineState) {
        let machine = Self {
            budget,
            metadata: AttemptMetadata::default(),
        };
        (machine, PipelineState::Validating(code))
    }

    pub fn metadata(&self) -> AttemptMetadata {
        self.metadata
    }

    pub fn mark_improved(&mut self) {
        self.metadata.was_improved = true;
    }

    /// Counter value for the loop `context` belongs to.
    pub fn attempts(&self, context: RepairContext) -> u32 {
        match context {
            RepairContext::Validation => self.metadata.generation_attempts,
            RepairContext::Render => self.metadata.rendering_attempts,
        }
    }

    /// Consumes one attempt from the loop's budget if any is left.
    fn take_attempt(&mut self, context: RepairContext) -> bool {
        let (used, max) = match context {
            RepairContext::Validation => (
                &mut self.metadata.generation_attempts,
                self.budget.max_generation_attempts,
            ),
            RepairContext::Render => (
                &mut self.metadata.rendering_attempts,
                self.budget.max_render_attempts,
            ),
        };
        if *used < max {
            *used += 1;
            true
        } else {
            false
        }
    }

    pub fn on_generated(&mut self, result: Result<CodeArtifact, StudioError>) -> PipelineState {
        match result {
            Ok(code) => PipelineState::Validating(code),
            Err(err) if err.class() != ErrorClass::Code => PipelineState::Failed(err),
            Err(err) => {
                if self.take_attempt(RepairContext::Validation) {
                    PipelineState::Generating
                } else {
                    PipelineState::Failed(err)
                }
            }
        }
    }

    pub fn on_validated(&mut self, code: CodeArtifact, validation: Validation) -> PipelineState {
        match validation {
            Validation::Valid => {
                if self.metadata.rendering_attempts == 0 {
                    self.metadata.rendering_attempts = 1;
                }
                PipelineState::Rendering(code)
            }
            Validation::Invalid(diagnostic) => {
                self.repair_or_exhaust(RepairContext::Validation, code, diagnostic)
            }
        }
    }

    pub fn on_repaired(
        &mut self,
        context: RepairContext,
        code: CodeArtifact,
        diagnostic: Diagnostic,
        result: Result<CodeArtifact, StudioError>,
    ) -> PipelineState {
        match result {
            Ok(fixed) => {
                self.metadata.was_code_fixed = true;
                match context {
                    RepairContext::Validation => PipelineState::Validating(fixed),
                    RepairContext::Render => PipelineState::Rendering(fixed),
                }
            }
            Err(err) if err.class() == ErrorClass::Environment => PipelineState::Failed(err),
            Err(_) => self.repair_or_exhaust(context, code, diagnostic),
        }
    }

    pub fn on_rendered(
        &mut self,
        code: CodeArtifact,
        result: Result<VideoArtifact, Diagnostic>,
    ) -> PipelineState {
        match result {
            Ok(video) => PipelineState::Improving { code, video },
            Err(diagnostic) if diagnostic.is_environment() => {
                PipelineState::Failed(StudioError::RenderFailed(diagnostic))
            }
            Err(diagnostic) => self.repair_or_exhaust(RepairContext::Render, code, diagnostic),
        }
    }

    fn repair_or_exhaust(
        &mut self,
        context: RepairContext,
        code: CodeArtifact,
        diagnostic: Diagnostic,
    ) -> PipelineState {
        if self.take_attempt(context) {
            PipelineState::Repairing {
                context,
                code,
                diagnostic,
            }
        } else {
            PipelineState::Failed(StudioError::RepairExhausted {
                stage: context.stage(),
                attempts: self.attempts(context),
                last: diagnostic,
            })
        }
    }
}
