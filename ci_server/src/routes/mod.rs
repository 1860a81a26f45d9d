//! CI platform HTTP routes: REST API, webhook, WebSocket.

pub mod api;
pub mod webhook;
pub mod websocket;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::context::AppContext;
use crate::dashboard::kpi::{self, ProjectStats};
use crate::error::{CiError, CiResult};
use crate::models::build::{CiBuild, LogSnapshot, TriggerRequest};
use crate::models::project::{CiProject, CiProjectUpdate, NewCiProject};
use crate::services::{build_service, project_service};
use crate::store::ProjectFilter;
use api::{ApiResponse, HealthJson, ListBuildsQuery, ServiceInfo};

/// Build the CI platform's Axum router.
pub fn ci_router(ctx: Arc<AppContext>) -> Router {
    let cors = cors_layer(&ctx.config.frontend_url);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        // Project API
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{project_id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/api/projects/{project_id}/stats", get(project_stats))
        // Build API
        .route("/api/builds", get(list_builds))
        .route("/api/builds/trigger", post(trigger_build))
        .route("/api/builds/{build_id}", get(get_build).delete(delete_build))
        .route("/api/builds/{build_id}/logs", get(build_logs))
        .route("/api/builds/{build_id}/cancel", post(cancel_build))
        // Webhook
        .route("/api/webhooks/github", post(webhook_handler))
        // Observers
        .route("/ws", get(websocket::ws_handler))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::PUT, Method::DELETE];
    match frontend_url.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(methods)
            .allow_headers(Any),
        Err(_) => {
            tracing::warn!("Invalid CI_FRONTEND_URL '{frontend_url}', allowing any origin");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(methods)
                .allow_headers(Any)
        }
    }
}

type ApiResult<T> = CiResult<Json<ApiResponse<T>>>;

// ── Service ──

async fn index() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        message: "CI/CD Dashboard API",
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
        timestamp: Utc::now(),
    })
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<HealthJson> {
    Json(HealthJson {
        status: "OK",
        timestamp: Utc::now(),
        uptime_secs: ctx.started_at.elapsed().as_secs(),
        active_builds: ctx.dispatcher.active_count(),
    })
}

async fn not_found(method: Method, uri: axum::http::Uri) -> Response {
    let body = serde_json::json!({
        "success": false,
        "message": format!("Route {method} {} not found", uri.path()),
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

// ── Project API ──

async fn list_projects(
    State(ctx): State<Arc<AppContext>>,
    Query(filter): Query<ProjectFilter>,
) -> ApiResult<Vec<CiProject>> {
    let projects = project_service::list_projects(ctx.repo.as_ref(), &filter).await?;
    Ok(Json(ApiResponse::data(projects)))
}

async fn create_project(
    State(ctx): State<Arc<AppContext>>,
    Json(new_project): Json<NewCiProject>,
) -> CiResult<(StatusCode, Json<ApiResponse<CiProject>>)> {
    let project = project_service::create_project(ctx.repo.as_ref(), new_project).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::data(project).with_message("Project created")),
    ))
}

async fn get_project(
    State(ctx): State<Arc<AppContext>>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<CiProject> {
    let project = project_service::get_project(ctx.repo.as_ref(), project_id).await?;
    Ok(Json(ApiResponse::data(project)))
}

async fn update_project(
    State(ctx): State<Arc<AppContext>>,
    Path(project_id): Path<Uuid>,
    Json(update): Json<CiProjectUpdate>,
) -> ApiResult<CiProject> {
    let project =
        project_service::update_project(ctx.repo.as_ref(), &ctx.aggregator, project_id, update)
            .await?;
    Ok(Json(ApiResponse::data(project).with_message("Project updated")))
}

async fn delete_project(
    State(ctx): State<Arc<AppContext>>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<()> {
    let removed = ctx.dispatcher.delete_project(project_id).await?;
    Ok(Json(ApiResponse::message(format!(
        "Project deleted along with {removed} build(s)"
    ))))
}

async fn project_stats(
    State(ctx): State<Arc<AppContext>>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<ProjectStats> {
    let stats = kpi::query_project_stats(ctx.repo.as_ref(), project_id).await?;
    Ok(Json(ApiResponse::data(stats)))
}

// ── Build API ──

async fn list_builds(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListBuildsQuery>,
) -> ApiResult<Vec<CiBuild>> {
    let page =
        build_service::list_builds(ctx.repo.as_ref(), &query.filter(), query.pagination()).await?;
    Ok(Json(ApiResponse::from(page)))
}

async fn get_build(
    State(ctx): State<Arc<AppContext>>,
    Path(build_id): Path<Uuid>,
) -> ApiResult<CiBuild> {
    let build = build_service::get_build(ctx.repo.as_ref(), build_id).await?;
    Ok(Json(ApiResponse::data(build)))
}

async fn trigger_build(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<TriggerRequest>,
) -> CiResult<(StatusCode, Json<ApiResponse<CiBuild>>)> {
    let build = ctx.dispatcher.trigger(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::data(build).with_message("Build triggered")),
    ))
}

async fn build_logs(
    State(ctx): State<Arc<AppContext>>,
    Path(build_id): Path<Uuid>,
) -> ApiResult<LogSnapshot> {
    let snapshot = build_service::get_logs(ctx.repo.as_ref(), build_id).await?;
    Ok(Json(ApiResponse::data(snapshot)))
}

async fn cancel_build(
    State(ctx): State<Arc<AppContext>>,
    Path(build_id): Path<Uuid>,
) -> ApiResult<CiBuild> {
    let build = ctx.dispatcher.cancel(build_id).await?;
    Ok(Json(ApiResponse::data(build).with_message("Build cancelled")))
}

async fn delete_build(
    State(ctx): State<Arc<AppContext>>,
    Path(build_id): Path<Uuid>,
) -> ApiResult<()> {
    ctx.dispatcher.delete_build(build_id).await?;
    Ok(Json(ApiResponse::message("Build deleted")))
}

// ── Webhook ──

async fn webhook_handler(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, CiError> {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    );

    webhook::handle_webhook(&ctx, &headers, body).await
}
