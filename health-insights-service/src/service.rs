use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::Json,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use futures::Stream;
use panel_flow::{
    AnalysisClient, CaseState, CaseStore, ChatEvent, ChatHandle, ChatTranscript, Orchestrator,
    OrchestratorConfig, PanelError, ReportStatus, prompts,
};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info};
use uuid::Uuid;

use crate::models::{CaseResponse, ChatMessageRequest, SubmitCaseRequest, SubmitCaseResponse};

type ApiResult<T> = Result<Json<T>, ApiError>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "case_id": id
        })),
    )
}

fn conflict_error(message: &str) -> ApiError {
    (StatusCode::CONFLICT, Json(json!({ "error": message })))
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<CaseStore>,
    pub client: Arc<dyn AnalysisClient>,
    chats: Arc<DashMap<String, Arc<dyn ChatHandle>>>,
}

impl AppState {
    pub fn new(client: Arc<dyn AnalysisClient>, config: OrchestratorConfig) -> Self {
        let store = Arc::new(CaseStore::new());
        let orchestrator = Arc::new(Orchestrator::new(client.clone(), store.clone(), config));
        Self {
            orchestrator,
            store,
            client,
            chats: Arc::new(DashMap::new()),
        }
    }
}

/// Middleware to add a correlation ID span to all requests
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();

    request.headers_mut().insert(
        "x-correlation-id",
        HeaderValue::from_str(&correlation_id).unwrap_or(HeaderValue::from_static("invalid")),
    );

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/cases", post(submit_case))
        .route("/cases/{case_id}", get(get_case))
        .route("/cases/{case_id}/chat", post(chat_message).get(get_transcript))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(from_fn(correlation_id_middleware)),
        )
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Health Insights Analysis Service",
        "version": "1.0.0",
        "description": "Multi-specialist AI case analysis with consensus synthesis and follow-up chat",
        "endpoints": {
            "POST /cases": "Submit a case for specialist panel analysis",
            "GET /cases/{case_id}": "Get the case snapshot (per-specialist status and final report)",
            "POST /cases/{case_id}/chat": "Send a chat message, response streamed as SSE",
            "GET /cases/{case_id}/chat": "Get the chat transcript",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn submit_case(
    State(state): State<AppState>,
    Json(request): Json<SubmitCaseRequest>,
) -> Result<(StatusCode, Json<SubmitCaseResponse>), ApiError> {
    let submission = request.submission;

    if let Some(image) = &submission.image {
        if BASE64.decode(&image.data).is_err() {
            return Err(bad_request_error("Attached image is not valid base64"));
        }
        if image.mime_type.trim().is_empty() {
            return Err(bad_request_error("Attached image needs a MIME type"));
        }
    }

    match state.orchestrator.submit(submission) {
        Ok(case_id) => {
            info!(case_id = %case_id, "case submitted");
            // Any chat session belongs to the case it was opened for.
            state.chats.clear();
            Ok((
                StatusCode::ACCEPTED,
                Json(SubmitCaseResponse {
                    case_id,
                    status: "dispatched".to_string(),
                }),
            ))
        }
        Err(PanelError::EmptySubmission(message)) => Err(bad_request_error(&message)),
        Err(e) => {
            error!(error = %e, "failed to submit case");
            Err(internal_error("Failed to submit case", &e.to_string()))
        }
    }
}

async fn get_case(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
) -> ApiResult<CaseResponse> {
    match state.store.snapshot_of(&case_id) {
        Some(case) => Ok(Json(CaseResponse::from(case))),
        None => Err(not_found_error("Case not found", &case_id)),
    }
}

fn chat_ready_case(state: &AppState, case_id: &str) -> Result<CaseState, ApiError> {
    let case = state
        .store
        .snapshot_of(case_id)
        .ok_or_else(|| not_found_error("Case not found", case_id))?;
    if case.final_report.status != ReportStatus::Complete {
        return Err(conflict_error(
            "Chat becomes available once the final report is complete",
        ));
    }
    Ok(case)
}

async fn get_or_open_chat(
    state: &AppState,
    case: &CaseState,
) -> Result<Arc<dyn ChatHandle>, ApiError> {
    if let Some(handle) = state.chats.get(&case.id) {
        return Ok(handle.clone());
    }
    let context = prompts::chat_context(case);
    let handle = state.client.open_chat(context).await.map_err(|e| {
        error!(case_id = %case.id, error = %e, "failed to open chat session");
        internal_error("Failed to open chat session", &e.to_string())
    })?;
    let handle: Arc<dyn ChatHandle> = Arc::from(handle);
    let entry = state.chats.entry(case.id.clone()).or_insert(handle);
    Ok(entry.value().clone())
}

async fn chat_message(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    Json(request): Json<ChatMessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(bad_request_error("Message cannot be empty"));
    }

    let case = chat_ready_case(&state, &case_id)?;
    let handle = get_or_open_chat(&state, &case).await?;

    let (tx, rx) = mpsc::channel::<ChatEvent>(64);
    let message = request.message.clone();
    tokio::spawn(async move {
        handle.send(&message, tx).await;
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let sse = match &event {
            ChatEvent::Delta(chunk) => Event::default().event("delta").data(chunk.clone()),
            ChatEvent::Done => Event::default().event("done").data(""),
            ChatEvent::Error(message) => Event::default().event("error").data(message.clone()),
        };
        Ok::<_, Infallible>(sse)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn get_transcript(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
) -> ApiResult<ChatTranscript> {
    chat_ready_case(&state, &case_id)?;
    match state.chats.get(&case_id) {
        Some(handle) => Ok(Json(handle.transcript().await)),
        // No message sent yet: the transcript is just the greeting.
        None => Ok(Json(ChatTranscript::with_greeting())),
    }
}
