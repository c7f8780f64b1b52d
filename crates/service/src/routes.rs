use animstudio::{
    AttemptMetadata, ErrorClass, GenerateRequest, ImproveRequest, Orchestrator, RenderRequest,
    RunOutcome, SessionId, SessionInfo, StudioError, Validation,
};
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

pub type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub auth_key: Option<String>,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_preferences: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImproveBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ValidateBody {
    #[serde(default)]
    pub code: String,
}

#[derive(Deserialize)]
pub struct PreferencesBody {
    #[serde(default)]
    pub preferences: Map<String, Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    success: bool,
    code: String,
    video_path: String,
    video_file_name: String,
    video_url: String,
    session_id: SessionId,
    session_info: SessionInfo,
    metadata: AttemptMetadata,
}

impl From<RunOutcome> for RunResponse {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            success: true,
            video_path: format!("/animations/{}", outcome.video.file_name),
            video_file_name: outcome.video.file_name,
            video_url: outcome.video.url,
            code: outcome.code.into_source(),
            session_id: outcome.session_id,
            session_info: outcome.session,
            metadata: outcome.metadata,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImproveResponse {
    success: bool,
    code: String,
    original_code: String,
    feedback: String,
    was_improved: bool,
    session_id: SessionId,
    session_info: SessionInfo,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/generate", post(handle_generate))
        .route("/render", post(handle_render))
        .route("/improve", post(handle_improve))
        .route("/validate", post(handle_validate))
        .route("/status", get(handle_status))
        .route("/session", get(handle_list_sessions))
        .route(
            "/session/{id}",
            get(handle_get_session).delete(handle_clear_session),
        )
        .route("/session/{id}/preferences", post(handle_set_preferences));

    Router::new()
        .nest("/api/manim", api)
        .route("/health", get(handle_health))
        .with_state(state)
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(key) = &state.auth_key else {
        return Ok(());
    };
    let unauthorized = |msg: &str| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": msg })),
        )
    };
    let auth_header = headers
        .get("Authorization")
        .ok_or_else(|| unauthorized("Missing authorization"))?;
    let auth_str = auth_header
        .to_str()
        .map_err(|_| unauthorized("Invalid authorization header"))?;
    if auth_str.strip_prefix("Bearer ") != Some(key.as_str()) {
        warn!("unauthorized request");
        return Err(unauthorized("Invalid API key"));
    }
    Ok(())
}

fn bad_request(msg: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": msg })),
    )
}

/// Unwraps a JSON body, reporting malformed input in the API's error shape.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "rejected request body");
            Err(bad_request(&rejection.body_text()))
        }
    }
}

/// Maps a pipeline error to the wire shape. Terminal pipeline failures are
/// reported in-band with 200; broken tooling is 503.
fn pipeline_failure(err: &StudioError, session_id: &SessionId) -> ApiError {
    let status = match (err.class(), err) {
        (ErrorClass::Request, StudioError::SessionNotFound(_)) => StatusCode::NOT_FOUND,
        (ErrorClass::Request, _) => StatusCode::BAD_REQUEST,
        (ErrorClass::Environment, _) => StatusCode::SERVICE_UNAVAILABLE,
        (ErrorClass::Code, _) => StatusCode::OK,
    };
    (
        status,
        Json(json!({
            "success": false,
            "error": err.to_string(),
            "message": err.user_message(),
            "sessionId": session_id,
        })),
    )
}

async fn handle_generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    let body = json_body(body)?;
    if body.prompt.trim().is_empty() {
        return Err(bad_request("Prompt is required"));
    }
    let session_id = SessionId::or_default(body.session_id.as_deref());
    info!(session = %session_id, "generate requested");

    let request = GenerateRequest {
        prompt: body.prompt,
        session_id: session_id.clone(),
        preferences: body.user_preferences.unwrap_or_default(),
    };
    let outcome = state
        .orchestrator
        .generate(request)
        .await
        .map_err(|e| pipeline_failure(&e, &session_id))?;
    Ok(Json(RunResponse::from(outcome)).into_response())
}

async fn handle_render(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RenderBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    let body = json_body(body)?;
    if body.code.trim().is_empty() {
        return Err(bad_request("Code is required"));
    }
    let session_id = SessionId::or_default(body.session_id.as_deref());
    info!(session = %session_id, "render requested");

    let request = RenderRequest {
        code: body.code,
        session_id: session_id.clone(),
    };
    let outcome = state
        .orchestrator
        .render(request)
        .await
        .map_err(|e| pipeline_failure(&e, &session_id))?;
    Ok(Json(RunResponse::from(outcome)).into_response())
}

async fn handle_improve(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ImproveBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    let body = json_body(body)?;
    if body.code.trim().is_empty() || body.feedback.trim().is_empty() {
        return Err(bad_request("Code and feedback are required"));
    }
    let session_id = SessionId::or_default(body.session_id.as_deref());

    let request = ImproveRequest {
        code: body.code,
        feedback: body.feedback,
        session_id: session_id.clone(),
    };
    let outcome = state
        .orchestrator
        .improve(request)
        .await
        .map_err(|e| pipeline_failure(&e, &session_id))?;
    Ok(Json(ImproveResponse {
        success: true,
        code: outcome.code.into_source(),
        original_code: outcome.original.into_source(),
        feedback: outcome.feedback,
        was_improved: outcome.was_improved,
        session_id: outcome.session_id,
        session_info: outcome.session,
    })
    .into_response())
}

async fn handle_validate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ValidateBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    let body = json_body(body)?;
    if body.code.trim().is_empty() {
        return Err(bad_request("Code is required"));
    }
    let response = match state.orchestrator.validate(&body.code) {
        Validation::Valid => json!({ "success": true, "valid": true }),
        Validation::Invalid(diagnostic) => json!({
            "success": true,
            "valid": false,
            "error": diagnostic.message,
        }),
    };
    Ok(Json(response).into_response())
}

async fn handle_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    let tooling = state.orchestrator.status().await;
    Ok(Json(json!({
        "success": true,
        "requirements": {
            "manim": tooling.manim,
            "ffmpeg": tooling.ffmpeg,
            "allRequirementsMet": tooling.all_requirements_met(),
        },
        "environment": {
            "serviceVersion": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
            "tempDir": state.work_dir.display().to_string(),
            "outputDir": state.output_dir.display().to_string(),
        },
        "recommendations": tooling.recommendations(),
    }))
    .into_response())
}

async fn handle_list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    let ids = state
        .orchestrator
        .store()
        .list()
        .await
        .map_err(|e| pipeline_failure(&e, &SessionId::or_default(None)))?;
    Ok(Json(json!({ "success": true, "activeSessions": ids })).into_response())
}

async fn handle_get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    let session_id = SessionId::from(id);
    match state.orchestrator.store().get(&session_id).await {
        Ok(session) => Ok(Json(json!({
            "success": true,
            "sessionId": session_id,
            "sessionInfo": session.info(),
        }))
        .into_response()),
        Err(StudioError::SessionNotFound(_)) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": "Session not found",
                "sessionId": session_id,
                "sessionInfo": SessionInfo::missing(),
            })),
        )),
        Err(e) => Err(pipeline_failure(&e, &session_id)),
    }
}

async fn handle_clear_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    let session_id = SessionId::from(id);
    let cleared = state
        .orchestrator
        .store()
        .clear(&session_id)
        .await
        .map_err(|e| pipeline_failure(&e, &session_id))?;
    info!(session = %session_id, cleared, "session cleared");
    Ok(Json(json!({
        "success": true,
        "sessionId": session_id,
        "cleared": cleared,
    }))
    .into_response())
}

async fn handle_set_preferences(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<PreferencesBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    let body = json_body(body)?;
    let session_id = SessionId::from(id);
    let session = state
        .orchestrator
        .store()
        .set_preferences(&session_id, body.preferences)
        .await
        .map_err(|e| pipeline_failure(&e, &session_id))?;
    Ok(Json(json!({
        "success": true,
        "sessionId": session_id,
        "sessionInfo": session.info(),
        "preferences": session.preferences,
    }))
    .into_response())
}

async fn handle_health() -> Json<Value> {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    Json(json!({ "success": true, "status": "ok", "timestamp": timestamp }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use animstudio::artifact::{Diagnostic, Stage, VideoArtifact};
    use animstudio::{
        CodeArtifact, CodeModel, InMemorySessionStore, ModelError, ModelRequest,
        PipelineSettings, Purpose, Renderer, ToolStatus, ToolingStatus,
    };
    use async_trait::async_trait;
    use axum::extract::FromRequest;
    use axum::http::HeaderValue;

    const SCENE: &str = "from manim import *\n\nclass BlueCircle(Scene):\n    def construct(self):\n        self.play(Create(Circle(color=BLUE)))\n";

    struct SceneModel;

    #[async_trait]
    impl CodeModel for SceneModel {
        async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
            match request.purpose {
                // Improvement proposes nothing new.
                Purpose::Generate | Purpose::Improve => Ok(format!("```python\n{SCENE}```")),
                Purpose::Repair => Err(ModelError::EmptyResponse),
            }
        }
    }

    struct FakeRenderer {
        missing_tooling: bool,
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn render(&self, code: &CodeArtifact) -> Result<VideoArtifact, Diagnostic> {
            if self.missing_tooling {
                return Err(Diagnostic::environment(Stage::Render, "manim executable 'manim' not found"));
            }
            let file_name = VideoArtifact::file_name_for(code);
            Ok(VideoArtifact {
                url: VideoArtifact::public_url("http://localhost:3001", &file_name),
                path: PathBuf::from(&file_name),
                file_name,
            })
        }

        async fn probe(&self) -> ToolingStatus {
            ToolingStatus {
                manim: ToolStatus::found(Some("Manim Community v0.18.1".into())),
                ffmpeg: ToolStatus::missing(),
            }
        }
    }

    fn state_with(missing_tooling: bool, auth_key: Option<&str>) -> AppState {
        let orchestrator = Orchestrator::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(SceneModel),
            Arc::new(FakeRenderer { missing_tooling }),
            PipelineSettings::default(),
        );
        AppState {
            orchestrator: Arc::new(orchestrator),
            auth_key: auth_key.map(str::to_string),
            output_dir: PathBuf::from("animations"),
            work_dir: PathBuf::from("/tmp/animstudio"),
        }
    }

    fn state() -> AppState {
        state_with(false, None)
    }

    async fn json_of(response: impl IntoResponse) -> (StatusCode, Value) {
        let response = response.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn generate_body(
        prompt: &str,
        session_id: Option<&str>,
    ) -> Result<Json<GenerateBody>, JsonRejection> {
        Ok(Json(GenerateBody {
            prompt: prompt.into(),
            session_id: session_id.map(str::to_string),
            user_preferences: None,
        }))
    }

    async fn extract_json<T: serde::de::DeserializeOwned>(
        raw: &'static str,
    ) -> Result<Json<T>, JsonRejection> {
        let request = axum::http::Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(raw))
            .unwrap();
        Json::<T>::from_request(request, &()).await
    }

    #[tokio::test]
    async fn generate_creates_session_and_reports_metadata() {
        let state = state();
        let result = handle_generate(
            State(state.clone()),
            HeaderMap::new(),
            generate_body("Create a blue circle", Some("fresh")),
        )
        .await;
        let (status, body) = json_of(result).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["sessionId"], "fresh");
        assert_eq!(body["metadata"]["generationAttempts"], 1);
        assert_eq!(body["metadata"]["renderingAttempts"], 1);
        assert_eq!(body["metadata"]["wasCodeFixed"], false);
        assert_eq!(body["metadata"]["wasImproved"], false);
        assert_eq!(body["sessionInfo"]["conversationLength"], 2);
        assert!(body["videoFileName"].as_str().unwrap().starts_with("BlueCircle_"));
        assert!(body["videoPath"].as_str().unwrap().starts_with("/animations/"));

        let ids = state.orchestrator.store().list().await.unwrap();
        assert_eq!(ids, vec![SessionId::from("fresh")]);
    }

    #[tokio::test]
    async fn generate_defaults_session_id() {
        let result = handle_generate(State(state()), HeaderMap::new(), generate_body("a dot", None)).await;
        let (_, body) = json_of(result).await;
        assert_eq!(body["sessionId"], "default");
    }

    #[tokio::test]
    async fn empty_prompt_is_bad_request() {
        let result = handle_generate(State(state()), HeaderMap::new(), generate_body("  ", None)).await;
        let (status, body) = json_of(result).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn missing_tooling_is_service_unavailable() {
        let result = handle_generate(
            State(state_with(true, None)),
            HeaderMap::new(),
            generate_body("a dot", Some("s")),
        )
        .await;
        let (status, body) = json_of(result).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("misconfigured"));
        assert_eq!(body["sessionId"], "s");
    }

    #[tokio::test]
    async fn render_starts_from_supplied_code() {
        let result = handle_render(
            State(state()),
            HeaderMap::new(),
            Ok(Json(RenderBody {
                code: SCENE.into(),
                session_id: Some("r".into()),
            })),
        )
        .await;
        let (status, body) = json_of(result).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["metadata"]["generationAttempts"], 0);
        assert_eq!(body["metadata"]["renderingAttempts"], 1);
        assert_eq!(body["code"], SCENE);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found_but_clear_succeeds() {
        let state = state();
        let (status, body) = json_of(
            handle_get_session(State(state.clone()), HeaderMap::new(), Path("nope".into())).await,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["sessionInfo"], json!({ "exists": false }));

        let (status, body) = json_of(
            handle_clear_session(State(state), HeaderMap::new(), Path("nope".into())).await,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "sessionId": "nope", "cleared": false }));
    }

    #[tokio::test]
    async fn preferences_are_merged() {
        let state = state();
        for prefs in [json!({"color": "blue", "speed": "slow"}), json!({"speed": "fast"})] {
            let body = PreferencesBody {
                preferences: prefs.as_object().cloned().unwrap(),
            };
            let result =
                handle_set_preferences(State(state.clone()), HeaderMap::new(), Path("p".into()), Ok(Json(body)))
                    .await;
            assert!(result.is_ok());
        }
        let session = state.orchestrator.store().get(&SessionId::from("p")).await.unwrap();
        assert_eq!(session.preferences["color"], "blue");
        assert_eq!(session.preferences["speed"], "fast");
    }

    #[tokio::test]
    async fn validate_reports_first_problem() {
        let body = ValidateBody {
            code: SCENE.replace("from manim import *\n", ""),
        };
        let (status, body) = json_of(handle_validate(State(state()), HeaderMap::new(), Ok(Json(body))).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], false);
        assert!(body["error"].as_str().unwrap().contains("manim import"));
    }

    #[tokio::test]
    async fn status_lists_missing_tools() {
        let (_, body) = json_of(handle_status(State(state()), HeaderMap::new()).await).await;
        assert_eq!(body["requirements"]["manim"]["installed"], true);
        assert_eq!(body["requirements"]["ffmpeg"]["installed"], false);
        assert_eq!(body["requirements"]["allRequirementsMet"], false);
        assert_eq!(body["recommendations"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn auth_key_is_enforced() {
        let state = state_with(false, Some("secret"));
        let (status, _) = json_of(handle_status(State(state.clone()), HeaderMap::new()).await).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer wrong"));
        let (status, _) = json_of(handle_status(State(state.clone()), headers).await).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer secret"));
        let (status, _) = json_of(handle_status(State(state), headers).await).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_json_uses_error_shape() {
        let body = extract_json::<GenerateBody>("{\"prompt\": ").await;
        assert!(body.is_err());
        let (status, body) = json_of(handle_generate(State(state()), HeaderMap::new(), body).await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().is_some());

        let body = extract_json::<RenderBody>("{\"code\": 7}").await;
        let (status, body) = json_of(handle_render(State(state()), HeaderMap::new(), body).await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let Json(body) = handle_health().await;
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].as_str().is_some());
    }
}
