use crate::auth::{require_auth, AuthState, AuthUser, TokenVerifier};
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::DocumentGateway;
use crate::persistence::DocumentRecord;
use crate::ratelimit::{rate_limit_middleware, RateLimitLayer, RateLimiter, RouteClass};
use crate::upstream::{AskPayload, SummaryPayload, UpstreamHealth};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, MethodRouter},
    Extension, Json, Router,
};
use axum_extra::extract::Multipart;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<DocumentGateway>,
    pub verifier: Arc<TokenVerifier>,
    pub limiter: Arc<RateLimiter>,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    question: String,
}

#[derive(Debug, Serialize)]
pub struct ContentList {
    content: Vec<DocumentRecord>,
}

#[derive(Debug, Serialize)]
pub struct QuizResponse {
    questions: Vec<crate::gateway::QuizQuestion>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    ai_service_status: UpstreamHealth,
}

/// API Routes
pub fn routes(state: AppState) -> Router {
    let limited = |method: MethodRouter<AppState>, class: RouteClass| {
        method.layer(middleware::from_fn_with_state(
            RateLimitLayer::new(state.limiter.clone(), state.verifier.clone(), class),
            rate_limit_middleware,
        ))
    };

    let content = Router::new()
        .route("/content", limited(get(list_content), RouteClass::Generic))
        .route("/content/upload", limited(post(upload_content), RouteClass::Upload))
        .route("/content/queue", limited(get(queue_status), RouteClass::Generic))
        .route("/content/:id", limited(delete(delete_content), RouteClass::Generic))
        .route("/content/:id/summarize", limited(post(summarize_content), RouteClass::Summarize))
        .route("/content/:id/quiz", limited(post(quiz_content), RouteClass::Quiz))
        .route("/content/:id/ask", limited(post(ask_content), RouteClass::Ask))
        .route_layer(middleware::from_fn_with_state(
            AuthState {
                verifier: state.verifier.clone(),
                limiter: state.limiter.clone(),
            },
            require_auth,
        ));

    Router::new()
        .route("/", limited(get(root), RouteClass::Generic))
        .route("/health", limited(get(health), RouteClass::Health))
        .route("/metrics", limited(get(metrics), RouteClass::Generic))
        .merge(content)
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "StudyGate",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Per-user sequential gateway to the study AI service"
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ai_service_status: state.gateway.health().await,
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = crate::metrics::global().render(state.gateway.queue().active_users());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn upload_content(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    mut multipart: Multipart,
) -> GatewayResult<(StatusCode, Json<DocumentRecord>)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::InvalidRequest(format!("malformed multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            debug!("Skipping multipart field {:?}", field.name());
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let record = state
            .gateway
            .upload(&user, &filename, &content_type, field)
            .await?;
        return Ok((StatusCode::CREATED, Json(record)));
    }

    Err(GatewayError::InvalidRequest("multipart field 'file' is required".into()))
}

async fn list_content(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> GatewayResult<Json<ContentList>> {
    let content = state.gateway.list(&user).await?;
    Ok(Json(ContentList { content }))
}

async fn queue_status(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "pending": state.gateway.queue_size(&user) }))
}

async fn summarize_content(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
) -> GatewayResult<Json<SummaryPayload>> {
    Ok(Json(state.gateway.summarize(&user, &id).await?))
}

async fn quiz_content(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
) -> GatewayResult<Json<QuizResponse>> {
    let questions = state.gateway.generate_quiz(&user, &id).await?;
    Ok(Json(QuizResponse { questions }))
}

async fn ask_content(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> GatewayResult<Json<AskPayload>> {
    let Json(request) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    Ok(Json(state.gateway.ask(&user, &id, &request.question).await?))
}

async fn delete_content(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
) -> GatewayResult<StatusCode> {
    state.gateway.delete(&user, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
