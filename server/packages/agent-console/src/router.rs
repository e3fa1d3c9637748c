use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agent_console_error::{ConsoleError, ErrorType, ProblemDetails};
use axum::extract::{Path, State};
use axum::http::{header, HeaderName, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::OpenApi;
use uuid::Uuid;

use crate::service::AgentService;

mod types;

pub use types::*;

#[derive(Debug, Clone)]
pub struct AppState {
    service: AgentService,
}

impl AppState {
    pub fn new(service: AgentService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &AgentService {
        &self.service
    }
}

pub fn build_router(service: AgentService) -> Router {
    build_router_with_state(Arc::new(AppState::new(service))).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let api_router = Router::new()
        .route("/health", get(get_health))
        .route("/users", get(list_users).post(create_user))
        .route("/users/:user_id/sessions", get(list_user_sessions))
        .route("/sessions", post(create_session))
        .route("/sessions/:session_id", get(get_session).delete(delete_session))
        .route("/sessions/:session_id/messages", get(list_messages))
        .route("/sessions/:session_id/logs", get(list_logs))
        .route("/sessions/:session_id/interrupt", post(interrupt_session))
        .route(
            "/sessions/:session_id/messages/stream",
            post(post_message_stream),
        )
        .route("/openapi.json", get(get_openapi))
        .with_state(shared.clone());

    let mut router = Router::new().nest("/api", api_router);

    let http_logging = match std::env::var("AGENT_CONSOLE_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::debug!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

pub async fn shutdown(state: &Arc<AppState>) {
    state.service.shutdown().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_users,
        create_user,
        list_user_sessions,
        create_session,
        get_session,
        delete_session,
        list_messages,
        list_logs,
        interrupt_session,
        post_message_stream
    ),
    components(
        schemas(
            HealthResponse,
            UserCreate,
            UserRead,
            SessionCreate,
            SessionRead,
            MessageRead,
            SessionLogRead,
            PromptRequest,
            StreamEnvelope,
            StreamErrorPayload,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "users", description = "User management"),
        (name = "sessions", description = "Agent sessions and turns")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Console(#[from] ConsoleError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Console(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ConsoleError::invalid_request(format!("invalid {what} id: {raw}")).into())
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/api/users",
    responses((status = 200, body = Vec<UserRead>)),
    tag = "users"
)]
async fn list_users(State(state): State<Arc<AppState>>) -> Result<Json<Vec<UserRead>>, ApiError> {
    let users = state.service.list_users().await?;
    Ok(Json(users.into_iter().map(UserRead::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/users",
    request_body = UserCreate,
    responses(
        (status = 201, body = UserRead),
        (status = 400, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "users"
)]
async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UserCreate>,
) -> Result<(StatusCode, Json<UserRead>), ApiError> {
    let user = state
        .service
        .create_user(&request.username, &request.display_name)
        .await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

#[utoipa::path(
    get,
    path = "/api/users/{user_id}/sessions",
    params(("user_id" = String, Path, description = "User id")),
    responses(
        (status = 200, body = Vec<SessionRead>),
        (status = 404, body = ProblemDetails)
    ),
    tag = "users"
)]
async fn list_user_sessions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<SessionRead>>, ApiError> {
    let user_id = parse_id(&user_id, "user")?;
    let sessions = state.service.list_sessions(user_id).await?;
    Ok(Json(sessions.into_iter().map(SessionRead::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/sessions",
    request_body = SessionCreate,
    responses(
        (status = 201, body = SessionRead),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SessionCreate>,
) -> Result<(StatusCode, Json<SessionRead>), ApiError> {
    let session = state.service.create_session(request.into()).await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

#[utoipa::path(
    get,
    path = "/api/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionRead),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionRead>, ApiError> {
    let session_id = parse_id(&session_id, "session")?;
    let session = state.service.get_session(session_id).await?;
    Ok(Json(session.into()))
}

#[utoipa::path(
    delete,
    path = "/api/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 204, description = "Session deleted"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session_id = parse_id(&session_id, "session")?;
    state.service.delete_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/sessions/{session_id}/messages",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = Vec<MessageRead>),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<MessageRead>>, ApiError> {
    let session_id = parse_id(&session_id, "session")?;
    let messages = state.service.list_messages(session_id).await?;
    Ok(Json(messages.into_iter().map(MessageRead::from).collect()))
}

#[utoipa::path(
    get,
    path = "/api/sessions/{session_id}/logs",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = Vec<SessionLogRead>),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn list_logs(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<SessionLogRead>>, ApiError> {
    let session_id = parse_id(&session_id, "session")?;
    let logs = state.service.list_logs(session_id).await?;
    Ok(Json(logs.into_iter().map(SessionLogRead::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/interrupt",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 204, description = "Interrupt requested"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn interrupt_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session_id = parse_id(&session_id, "session")?;
    state.service.interrupt_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/messages/stream",
    request_body = PromptRequest,
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "SSE stream of StreamEnvelope frames"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn post_message_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<PromptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = parse_id(&session_id, "session")?;
    let turn = state
        .service
        .stream_prompt(session_id, &request.prompt)
        .await?;
    let headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    Ok((headers, Sse::new(envelope_events(turn))))
}

fn envelope_events(
    turn: crate::service::TurnStream,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    turn.filter_map(|event| async move {
        let envelope = StreamEnvelope::from(event);
        match serde_json::to_string(&envelope) {
            Ok(data) => Some(Ok(Event::default().data(data))),
            Err(err) => {
                tracing::error!(error = %err, "router: failed to encode stream envelope");
                None
            }
        }
    })
}
