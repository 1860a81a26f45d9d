//! GitHub webhook handler: receives push events, creates builds.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::context::AppContext;
use crate::error::{CiError, CiResult};
use crate::models::project::ProjectStatus;
use crate::routes::api::ApiResponse;
use crate::services::github_service::{self, PushEvent};
use crate::services::project_service;

/// Handle an incoming GitHub webhook payload.
pub async fn handle_webhook(
    ctx: &AppContext,
    headers: &HeaderMap,
    body: Bytes,
) -> CiResult<Response> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !github_service::validate_signature(&ctx.config.github_webhook_secret, &body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return Err(CiError::Unauthorized);
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    match event_type {
        "push" => handle_push(ctx, &body).await,
        "ping" => {
            tracing::info!("Received GitHub ping webhook");
            Ok(acknowledge("pong"))
        }
        _ => {
            tracing::debug!("Ignoring webhook event: {}", event_type);
            Ok(acknowledge(format!("event '{event_type}' ignored")))
        }
    }
}

async fn handle_push(ctx: &AppContext, body: &[u8]) -> CiResult<Response> {
    let event: PushEvent = serde_json::from_slice(body)
        .map_err(|e| CiError::invalid("payload", format!("malformed push event: {e}")))?;

    let Some(branch) = event.branch().map(str::to_string) else {
        return Ok(acknowledge("not a branch push"));
    };
    if event.deleted {
        return Ok(acknowledge("branch deletion ignored"));
    }

    let mut project = None;
    for url in event.repository_urls() {
        project = project_service::find_by_repository(ctx.repo.as_ref(), &url).await?;
        if project.is_some() {
            break;
        }
    }
    let Some(project) = project else {
        tracing::debug!("No project registered for repo: {}", event.repository.full_name);
        return Ok(acknowledge("no project registered for repository"));
    };
    if project.status != ProjectStatus::Active {
        tracing::info!(project_id = %project.id, status = ?project.status, "Skipping push for inactive project");
        return Ok(acknowledge("project is not active"));
    }

    let build = ctx.dispatcher.trigger(event.into_trigger(project.id)).await?;
    tracing::info!(
        build_id = %build.id,
        branch = %branch,
        "Build created from push webhook"
    );

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::data(build).with_message("Build triggered")),
    )
        .into_response())
}

fn acknowledge(message: impl Into<String>) -> Response {
    (StatusCode::OK, Json(ApiResponse::message(message))).into_response()
}
