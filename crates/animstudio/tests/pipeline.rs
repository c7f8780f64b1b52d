mod common;

use animstudio::artifact::{CodeArtifact, Diagnostic, Stage, VideoArtifact};
use animstudio::render::{Renderer, ToolingStatus};
use animstudio::session::SessionStore;
use animstudio::{
    ErrorClass, GenerateRequest, ImproveRequest, ModelError, PipelineSettings, Purpose,
    RenderRequest, SessionId, StudioError,
};
use async_trait::async_trait;
use common::{BLUE_CIRCLE, ScriptedModel, StubRenderer, fenced, settings, studio, video_for};
use mockall::mock;
use serde_json::json;
use std::sync::Arc;

mock! {
    pub Renderer {}

    #[async_trait]
    impl Renderer for Renderer {
        async fn render(&self, code: &CodeArtifact) -> Result<VideoArtifact, Diagnostic>;
        async fn probe(&self) -> ToolingStatus;
    }
}

fn generate(prompt: &str, session: &str) -> GenerateRequest {
    GenerateRequest {
        prompt: prompt.into(),
        session_id: SessionId::from(session),
        ..Default::default()
    }
}

fn no_improve() -> PipelineSettings {
    PipelineSettings {
        auto_improve: false,
        ..settings()
    }
}

#[tokio::test]
async fn blue_circle_renders_first_time() {
    let model = Arc::new(
        ScriptedModel::new()
            .always(Purpose::Generate, fenced(BLUE_CIRCLE))
            .always(Purpose::Improve, fenced(BLUE_CIRCLE)),
    );
    let renderer = Arc::new(StubRenderer::new());
    let (studio, store) = studio(model.clone(), renderer.clone(), settings());

    let outcome = studio
        .generate(generate("Create a blue circle", "fresh"))
        .await
        .unwrap();

    assert_eq!(outcome.metadata.generation_attempts, 1);
    assert_eq!(outcome.metadata.rendering_attempts, 1);
    assert!(!outcome.metadata.was_code_fixed);
    assert!(!outcome.metadata.was_improved);
    assert_eq!(outcome.code.name(), "BlueCircle");
    assert_eq!(outcome.video.file_name, VideoArtifact::file_name_for(&outcome.code));
    assert_eq!(renderer.rendered().len(), 1);
    assert_eq!(model.calls(Purpose::Repair), 0);

    assert_eq!(store.list().await.unwrap(), vec![SessionId::from("fresh")]);
    let session = store.get(&SessionId::from("fresh")).await.unwrap();
    assert_eq!(session.conversation.len(), 2);
    assert_eq!(session.conversation[0].content, "Create a blue circle");
    assert_eq!(session.code_history.len(), 1);
    assert!(session.error_history.is_empty());
    assert_eq!(session.runs.len(), 1);
    assert_eq!(outcome.session.conversation_length, Some(2));
}

#[tokio::test]
async fn always_invalid_code_exhausts_generation_budget() {
    let invalid = BLUE_CIRCLE.replace("def construct(self)", "def build(self)");
    let model = Arc::new(
        ScriptedModel::new()
            .always(Purpose::Generate, fenced(&invalid))
            .always(Purpose::Repair, fenced(&invalid)),
    );
    let renderer = Arc::new(StubRenderer::new());
    let (studio, store) = studio(model.clone(), renderer.clone(), settings());

    let err = studio.generate(generate("a circle", "s")).await.unwrap_err();

    match err {
        StudioError::RepairExhausted { stage, attempts, last } => {
            assert_eq!(stage, Stage::Validation);
            assert_eq!(attempts, 3);
            assert!(last.message.contains("construct"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(model.calls(Purpose::Repair), 2);
    assert!(renderer.rendered().is_empty());

    let session = store.get(&SessionId::from("s")).await.unwrap();
    assert_eq!(session.conversation.len(), 2);
    assert!(session.conversation[1].content.contains("simplifying"));
    assert!(session.runs.is_empty());
    // One validation failure, then one entry per failed repair attempt.
    let messages: Vec<_> = session.error_history.iter().map(|d| d.message.as_str()).collect();
    assert_eq!(messages.len(), 3);
    assert!(messages[0].contains("construct"));
    assert!(messages[1].starts_with("repair attempt 2 failed"));
    assert!(messages[2].starts_with("repair attempt 3 failed"));
    assert!(session.error_history.iter().all(|d| d.stage == Stage::Validation));
}

#[tokio::test]
async fn render_failure_is_repaired_once() {
    let repaired = BLUE_CIRCLE.replace("self.wait(1)", "self.wait(0.5)");
    let model = Arc::new(
        ScriptedModel::new()
            .always(Purpose::Generate, fenced(BLUE_CIRCLE))
            .always(Purpose::Repair, fenced(&repaired)),
    );
    let renderer = Arc::new(StubRenderer::new().failing_with(
        Diagnostic::fixable(Stage::Render, "NameError: name 'Foo' is not defined"),
    ));
    let (studio, store) = studio(model.clone(), renderer.clone(), no_improve());

    let outcome = studio.generate(generate("a circle", "s")).await.unwrap();

    assert_eq!(outcome.metadata.generation_attempts, 1);
    assert_eq!(outcome.metadata.rendering_attempts, 2);
    assert!(outcome.metadata.was_code_fixed);
    assert!(outcome.code.source().contains("wait(0.5)"));
    assert_eq!(renderer.rendered().len(), 2);

    let repair_prompt = &model.requests(Purpose::Repair)[0].messages[0].content;
    assert!(repair_prompt.contains("NameError"));

    let session = store.get(&SessionId::from("s")).await.unwrap();
    assert_eq!(session.error_history.len(), 1);
    assert_eq!(session.error_history[0].stage, Stage::Render);
    assert_eq!(session.code_history.len(), 2);
}

#[tokio::test]
async fn environment_render_failure_is_not_retried() {
    let model = Arc::new(ScriptedModel::new().always(Purpose::Generate, fenced(BLUE_CIRCLE)));
    let mut renderer = MockRenderer::new();
    renderer.expect_render().times(1).returning(|_| {
        Err(Diagnostic::environment(
            Stage::Render,
            "manim executable 'manim' not found; install Manim Community Edition",
        ))
    });
    let (studio, _store) = studio(model.clone(), Arc::new(renderer), settings());

    let err = studio.generate(generate("a circle", "s")).await.unwrap_err();

    assert!(matches!(err, StudioError::RenderFailed(ref d) if d.is_environment()));
    assert_eq!(err.class(), ErrorClass::Environment);
    assert_eq!(model.calls(Purpose::Repair), 0);
}

#[tokio::test]
async fn failing_improvement_keeps_working_code() {
    let model = Arc::new(
        ScriptedModel::new()
            .always(Purpose::Generate, fenced(BLUE_CIRCLE))
            .then(Purpose::Improve, Err(ModelError::HttpError("overloaded".into()))),
    );
    let renderer = Arc::new(StubRenderer::new());
    let (studio, store) = studio(model.clone(), renderer.clone(), settings());

    let outcome = studio.generate(generate("a circle", "s")).await.unwrap();

    assert!(!outcome.metadata.was_improved);
    assert!(outcome.code.same_as(&CodeArtifact::new(BLUE_CIRCLE)));
    assert_eq!(model.calls(Purpose::Improve), 1);
    let session = store.get(&SessionId::from("s")).await.unwrap();
    assert_eq!(session.error_history.len(), 1);
    assert_eq!(session.error_history[0].stage, Stage::Improve);
}

#[tokio::test]
async fn improvement_that_fails_to_render_is_discarded() {
    let improved = BLUE_CIRCLE.replace("self.wait(1)", "self.play(FadeOut(circle))");
    let model = Arc::new(
        ScriptedModel::new()
            .always(Purpose::Generate, fenced(BLUE_CIRCLE))
            .always(Purpose::Improve, fenced(&improved)),
    );
    let mut renderer = MockRenderer::new();
    renderer
        .expect_render()
        .withf(|code| !code.source().contains("FadeOut"))
        .times(1)
        .returning(|code| Ok(video_for(code)));
    renderer
        .expect_render()
        .withf(|code| code.source().contains("FadeOut"))
        .times(1)
        .returning(|_| Err(Diagnostic::fixable(Stage::Render, "TypeError: bad argument")));
    let (studio, _store) = studio(model, Arc::new(renderer), settings());

    let outcome = studio.generate(generate("a circle", "s")).await.unwrap();

    assert!(!outcome.metadata.was_improved);
    assert_eq!(outcome.metadata.rendering_attempts, 1);
    assert!(!outcome.code.source().contains("FadeOut"));
}

#[tokio::test]
async fn accepted_improvement_replaces_result() {
    let improved = BLUE_CIRCLE.replace("self.wait(1)", "self.play(FadeOut(circle))");
    let model = Arc::new(
        ScriptedModel::new()
            .always(Purpose::Generate, fenced(BLUE_CIRCLE))
            .always(Purpose::Improve, fenced(&improved)),
    );
    let renderer = Arc::new(StubRenderer::new());
    let (studio, store) = studio(model, renderer.clone(), settings());

    let outcome = studio.generate(generate("a circle", "s")).await.unwrap();

    assert!(outcome.metadata.was_improved);
    assert!(outcome.code.source().contains("FadeOut"));
    assert_eq!(outcome.video.file_name, VideoArtifact::file_name_for(&outcome.code));
    // The improvement render is not counted.
    assert_eq!(outcome.metadata.rendering_attempts, 1);
    assert_eq!(renderer.rendered().len(), 2);
    let session = store.get(&SessionId::from("s")).await.unwrap();
    assert_eq!(session.code_history.len(), 2);
    assert!(session.runs[0].metadata.was_improved);
}

#[tokio::test]
async fn missing_import_is_fixed_without_the_model() {
    let without_import = BLUE_CIRCLE.replace("from manim import *\n\n", "");
    let model = Arc::new(ScriptedModel::new().always(Purpose::Generate, fenced(&without_import)));
    let (studio, _store) = studio(model.clone(), Arc::new(StubRenderer::new()), no_improve());

    let outcome = studio.generate(generate("a circle", "s")).await.unwrap();

    assert!(outcome.code.source().starts_with("from manim import *"));
    assert!(outcome.metadata.was_code_fixed);
    assert_eq!(outcome.metadata.generation_attempts, 2);
    assert_eq!(model.calls(Purpose::Repair), 0);
}

#[tokio::test]
async fn unusable_generation_output_is_retried_then_fails() {
    let model = Arc::new(ScriptedModel::new().always(Purpose::Generate, "I would rather not."));
    let (studio, store) = studio(model.clone(), Arc::new(StubRenderer::new()), settings());

    let err = studio.generate(generate("a circle", "s")).await.unwrap_err();

    assert!(matches!(err, StudioError::GenerationFailed(_)));
    assert_eq!(model.calls(Purpose::Generate), 3);
    let session = store.get(&SessionId::from("s")).await.unwrap();
    assert_eq!(session.error_history.len(), 3);
    assert_eq!(session.conversation.len(), 2);
    // Retries after unusable output ask for a complete module.
    let retry = &model.requests(Purpose::Generate)[1];
    assert!(retry.messages.last().unwrap().content.contains("previous answer"));
}

#[tokio::test]
async fn unreachable_model_fails_without_retry() {
    let model = Arc::new(
        ScriptedModel::new().then(Purpose::Generate, Err(ModelError::Unreachable("refused".into()))),
    );
    let (studio, _store) = studio(model.clone(), Arc::new(StubRenderer::new()), settings());

    let err = studio.generate(generate("a circle", "s")).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::Environment);
    assert_eq!(model.calls(Purpose::Generate), 1);
}

#[tokio::test]
async fn render_starts_from_supplied_code() {
    let model = Arc::new(ScriptedModel::new());
    let renderer = Arc::new(StubRenderer::new());
    let (studio, store) = studio(model.clone(), renderer.clone(), no_improve());

    let outcome = studio
        .render(RenderRequest {
            code: BLUE_CIRCLE.into(),
            session_id: SessionId::from("r"),
        })
        .await
        .unwrap();

    assert_eq!(outcome.metadata.generation_attempts, 0);
    assert_eq!(outcome.metadata.rendering_attempts, 1);
    assert_eq!(model.calls(Purpose::Generate), 0);
    let session = store.get(&SessionId::from("r")).await.unwrap();
    assert_eq!(session.code_history.len(), 1);
    assert!(session.conversation.is_empty());
    assert_eq!(session.runs.len(), 1);
}

#[tokio::test]
async fn render_rejects_empty_code() {
    let (studio, store) = studio(Arc::new(ScriptedModel::new()), Arc::new(StubRenderer::new()), settings());
    let err = studio
        .render(RenderRequest {
            code: "   ".into(),
            session_id: SessionId::from("r"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StudioError::InvalidRequest(_)));
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn preferences_and_history_reach_the_model() {
    let model = Arc::new(
        ScriptedModel::new()
            .always(Purpose::Generate, fenced(BLUE_CIRCLE))
            .always(Purpose::Improve, fenced(BLUE_CIRCLE)),
    );
    let (studio, store) = studio(model.clone(), Arc::new(StubRenderer::new()), settings());

    studio.generate(generate("a circle", "s")).await.unwrap();
    let mut follow_up = generate("make it red", "s");
    follow_up.preferences = json!({"style": "minimal"}).as_object().cloned().unwrap();
    studio.generate(follow_up).await.unwrap();

    let second = &model.requests(Purpose::Generate)[1];
    // Prior prompt and reply are replayed, then the new request.
    assert_eq!(second.messages.len(), 3);
    let last = &second.messages[2].content;
    assert!(last.contains("- style: minimal"));
    assert!(last.contains("class BlueCircle(Scene)"));
    assert!(last.contains("make it red"));

    let session = store.get(&SessionId::from("s")).await.unwrap();
    assert_eq!(session.conversation.len(), 4);
    assert_eq!(session.preferences["style"], "minimal");
}

#[tokio::test]
async fn explicit_improve_applies_feedback() {
    let slower = BLUE_CIRCLE.replace("self.wait(1)", "self.wait(3)");
    let model = Arc::new(ScriptedModel::new().always(Purpose::Improve, fenced(&slower)));
    let (studio, store) = studio(model.clone(), Arc::new(StubRenderer::new()), settings());

    let outcome = studio
        .improve(ImproveRequest {
            code: BLUE_CIRCLE.into(),
            feedback: "hold the final frame longer".into(),
            session_id: SessionId::from("i"),
        })
        .await
        .unwrap();

    assert!(outcome.was_improved);
    assert!(outcome.code.source().contains("wait(3)"));
    assert_eq!(outcome.original.source(), BLUE_CIRCLE);
    let request = &model.requests(Purpose::Improve)[0];
    assert!(request.messages.last().unwrap().content.contains("hold the final frame longer"));
    let session = store.get(&SessionId::from("i")).await.unwrap();
    assert_eq!(session.conversation.len(), 2);
    assert_eq!(session.code_history.len(), 1);
}

#[tokio::test]
async fn explicit_improve_requires_feedback() {
    let (studio, _store) = studio(Arc::new(ScriptedModel::new()), Arc::new(StubRenderer::new()), settings());
    let err = studio
        .improve(ImproveRequest {
            code: BLUE_CIRCLE.into(),
            feedback: " ".into(),
            session_id: SessionId::from("i"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StudioError::InvalidRequest(_)));
}

#[tokio::test]
async fn validation_is_idempotent_and_sessionless() {
    let (studio, store) = studio(Arc::new(ScriptedModel::new()), Arc::new(StubRenderer::new()), settings());
    let broken = "from manim import *\nclass A(Scene):\n    def construct(self):\n        x = Circle(\n";
    let first = studio.validate(broken);
    let second = studio.validate(broken);
    assert_eq!(first, second);
    assert!(!first.is_valid());
    assert!(studio.validate(BLUE_CIRCLE).is_valid());
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn status_reports_renderer_probe() {
    let (studio, _store) = studio(Arc::new(ScriptedModel::new()), Arc::new(StubRenderer::new()), settings());
    let status = studio.status().await;
    assert!(status.all_requirements_met());
    assert!(status.recommendations().is_empty());
}
