use std::{collections::HashMap, sync::Arc};

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use super::{ApiError, ApiState, package_matcher};
use crate::{
    render::sse::{SseErrorData, SseEvent, SseStream},
    update::{
        apt::UpgradablePackage,
        event::{EventKind, UpgradeEvent},
    },
};

#[derive(Serialize)]
struct UpdateCheckResponse {
    updates: Vec<UpgradablePackage>,
}

pub async fn check_upgradable(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let matcher = package_matcher(&query)?;
    let updates = state.updates.list_upgradable_packages(matcher).await?;
    if updates.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(Json(UpdateCheckResponse { updates }).into_response())
}

pub async fn apply_update(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let matcher = package_matcher(&query)?;
    let packages = state.updates.list_upgradable_packages(matcher).await?;
    if packages.is_empty() {
        log::info!("System is up to date, no upgradable packages found");
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    state.updates.upgrade_packages(packages)?;
    Ok((StatusCode::ACCEPTED, Json("Upgrade started")).into_response())
}

fn upgrade_event(event: UpgradeEvent) -> SseEvent {
    match event.kind() {
        EventKind::Error => SseEvent::error(SseErrorData::internal(event.data())),
        kind => SseEvent::new(kind.as_str(), event.data()),
    }
}

/// Upgrade progress, for as long as the client listens.
pub async fn update_events(State(state): State<Arc<ApiState>>) -> Response {
    let (sse, body) = SseStream::open(&state.shutdown);
    let mut subscription = state.updates.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sse.stopped() => break,
                event = subscription.recv() => match event {
                    Some(event) => sse.send(upgrade_event(event)).await,
                    None => {
                        log::info!("Upgrade event channel closed, stopping SSE stream");
                        break;
                    }
                },
            }
        }
        state.updates.unsubscribe(subscription);
        sse.close().await;
    });

    body.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::{call, idle_packages, state};
    use crate::orchestrator::tests::Fixture;
    use crate::update::tests::FakePackages;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_check_lists_matching_packages() {
        let fixture = Fixture::new("true", None);
        let state = state(&fixture, idle_packages());

        let (status, body) = call(
            state.clone(),
            "GET",
            "/v1/system/update/check?only-first-party=true",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["updates"].as_array().unwrap().len(), 1);
        assert_eq!(json["updates"][0]["name"], "arduino-router");

        let (status, _) = call(
            state,
            "GET",
            "/v1/system/update/check?only-first-party=maybe",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_apply_while_upgrading_is_a_conflict() {
        let fixture = Fixture::new("true", None);
        let gate = Arc::new(Notify::new());
        let state = state(
            &fixture,
            FakePackages {
                upgrade_script: "echo working",
                restart_gate: Some(gate.clone()),
            },
        );

        let (status, body) = call(state.clone(), "PUT", "/v1/system/update/apply").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, r#""Upgrade started""#);

        let (status, body) = call(state.clone(), "PUT", "/v1/system/update/apply").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.contains("already in progress"));

        let (status, _) = call(state.clone(), "GET", "/v1/system/update/check").await;
        assert_eq!(status, StatusCode::CONFLICT);

        gate.notify_one();
    }

    #[tokio::test]
    async fn test_events_follow_the_upgrade() {
        let fixture = Fixture::new("true", None);
        let state = state(&fixture, idle_packages());

        let request = axum::http::Request::builder()
            .uri("/v1/system/update/events")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = crate::api::router(state.clone())
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The handler subscribes before returning the response.
        state
            .updates
            .upgrade_packages(vec![crate::update::tests::package("libc6")])
            .unwrap();

        let mut body = response.into_body();
        let mut received = String::new();
        while !received.contains("event: done") {
            let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
                .await
                .expect("Upgrade events should arrive")
                .expect("Body ended early")
                .unwrap();
            if let Ok(data) = frame.into_data() {
                received.push_str(std::str::from_utf8(&data).unwrap());
            }
        }
        assert!(received.starts_with("event: starting\n"));
        assert!(received.contains("event: log\ndata: \"upgraded\"\n\n"));
        assert!(received.contains("event: restarting\ndata: \"Upgrade completed. Restarting ...\"\n\n"));
    }
}
