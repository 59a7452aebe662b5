use std::{collections::HashMap, sync::Arc};

use axum::{
    Json,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use futures_util::{StreamExt, stream::BoxStream};
use serde::Serialize;

use super::{ApiError, ApiState};
use crate::{
    orchestrator::{
        AppInfo,
        status::Status,
        stream::{Progress, StreamEvent},
    },
    render::sse::{SseErrorData, SseEvent, SseStream},
};

#[derive(Serialize)]
pub struct ListAppsResponse {
    apps: Vec<AppInfo>,
}

#[derive(Serialize)]
struct Message<'a> {
    message: &'a str,
}

pub async fn list_apps(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<ListAppsResponse>, ApiError> {
    let filter = match query.get("status") {
        Some(status) => Some(
            status
                .parse::<Status>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        ),
        None => None,
    };
    let apps = state.orchestrator.list_apps(filter).await?;
    Ok(Json(ListAppsResponse { apps }))
}

pub async fn app_details(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<AppInfo>, ApiError> {
    let app = state.load_app(&id)?;
    Ok(Json(state.orchestrator.app_details(&app).await?))
}

/// Status changes of every app, until the client goes away.
pub async fn app_events(State(state): State<Arc<ApiState>>) -> Response {
    let (sse, body) = SseStream::open(&state.shutdown);
    let mut events = state.orchestrator.status_events();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sse.stopped() => break,
                event = events.next() => match event {
                    Some(Ok(info)) => sse.send(SseEvent::new("app", info)).await,
                    Some(Err(e)) => {
                        log::error!("App status events failed: {e}");
                        sse.send_error(SseErrorData::internal(e.to_string())).await;
                        break;
                    }
                    None => break,
                },
            }
        }
        sse.close().await;
    });

    body.into_response()
}

pub async fn start_app(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let app = state.load_app(&id)?;
    Ok(relay_operation(&state, state.orchestrator.start(app)))
}

pub async fn stop_app(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let app = state.load_app(&id)?;
    Ok(relay_operation(&state, state.orchestrator.stop(app)))
}

pub async fn restart_app(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let app = state.load_app(&id)?;
    Ok(relay_operation(&state, state.orchestrator.restart(app)))
}

fn operation_event(event: StreamEvent) -> SseEvent {
    match event {
        StreamEvent::Progress(Progress { name, progress }) => {
            SseEvent::new("progress", serde_json::json!({ "name": name, "progress": progress }))
        }
        StreamEvent::Info(line) => SseEvent::new("message", Message { message: &line }),
        StreamEvent::Error(e) => SseEvent::error(SseErrorData::internal(e.to_string())),
    }
}

/// Drive `operation` to completion in its own task, streaming every event to
/// the client. A client that disconnects does not cancel the operation.
fn relay_operation(
    state: &ApiState,
    mut operation: BoxStream<'static, StreamEvent>,
) -> Response {
    let (sse, body) = SseStream::open(&state.shutdown);

    tokio::spawn(async move {
        while let Some(event) = operation.next().await {
            if let StreamEvent::Error(e) = &event {
                log::error!("Operation failed: {e}");
            }
            sse.send(operation_event(event)).await;
        }
        sse.close().await;
    });

    body.into_response()
}
