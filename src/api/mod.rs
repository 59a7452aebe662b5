//! HTTP API of the daemon.

mod apps;
mod update;

use std::{collections::HashMap, future::Future, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::{
    config::{Config, ConfigDirectories},
    orchestrator::{
        Orchestrator, OrchestratorError,
        app::{App, AppError},
        engine::EngineError,
    },
    render::{error_response, sse::ShutdownSignal},
    update::{
        UpdateService, UpgradeError,
        apt::{PackageMatcher, match_all_packages, match_first_party_packages},
    },
};

const ONLY_FIRST_PARTY: &str = "only-first-party";

/// State shared across axum handlers.
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub updates: Arc<UpdateService>,
    pub config: Arc<Config>,
    pub shutdown: ShutdownSignal,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid id")]
    InvalidId(#[source] AppError),
    #[error("unable to find the app")]
    AppNotLoaded(#[source] AppError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidId(_) => StatusCode::PRECONDITION_FAILED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upgrade(UpgradeError::AlreadyInProgress) => StatusCode::CONFLICT,
            ApiError::AppNotLoaded(_)
            | ApiError::Engine(_)
            | ApiError::Orchestrator(_)
            | ApiError::Upgrade(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            match std::error::Error::source(&self) {
                Some(source) => log::error!("{self}: {source}"),
                None => log::error!("{self}"),
            }
        }
        error_response(status, self.to_string())
    }
}

impl ApiState {
    fn load_app(&self, encoded_id: &str) -> Result<App, ApiError> {
        let id = self
            .orchestrator
            .ids()
            .from_encoded(encoded_id)
            .map_err(ApiError::InvalidId)?;
        self.orchestrator.load_app(&id).map_err(|e| {
            log::error!("Unable to load app at {:?}: {e}", id.path());
            ApiError::AppNotLoaded(e)
        })
    }
}

/// Matcher selected by the `only-first-party` query flag.
fn package_matcher(query: &HashMap<String, String>) -> Result<PackageMatcher, ApiError> {
    let Some(value) = query.get(ONLY_FIRST_PARTY) else {
        return Ok(match_all_packages);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(match_first_party_packages),
        "false" => Ok(match_all_packages),
        _ => Err(ApiError::BadRequest(format!(
            "{ONLY_FIRST_PARTY} must be true or false, got {value:?}"
        ))),
    }
}

#[derive(Serialize)]
struct ConfigResponse {
    directories: ConfigDirectories,
}

async fn get_config(State(state): State<Arc<ApiState>>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        directories: ConfigDirectories::from(state.config.as_ref()),
    })
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/apps", get(apps::list_apps))
        .route("/v1/apps/events", get(apps::app_events))
        .route("/v1/apps/{id}", get(apps::app_details))
        .route("/v1/apps/{id}/start", post(apps::start_app))
        .route("/v1/apps/{id}/stop", post(apps::stop_app))
        .route("/v1/apps/{id}/restart", post(apps::restart_app))
        .route("/v1/system/update/check", get(update::check_upgradable))
        .route("/v1/system/update/apply", put(update::apply_update))
        .route("/v1/system/update/events", get(update::update_events))
        .route("/v1/config", get(get_config))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves. Open event streams are closed
/// before the server waits for in-flight responses.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ApiState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Listening on {addr}");
    }
    let app = router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("Closing open event streams");
            state.shutdown.trigger();
        })
        .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::orchestrator::tests::Fixture;
    use crate::update::tests::{FakePackages, service};
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    pub(crate) fn state(fixture: &Fixture, packages: FakePackages) -> Arc<ApiState> {
        let config = Arc::new(Config::with_dirs(
            fixture.tmp.path().join("apps"),
            fixture.tmp.path().join("data"),
        ));
        Arc::new(ApiState {
            orchestrator: fixture.orchestrator.clone(),
            updates: service(packages, Duration::from_secs(30)),
            config,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub(crate) fn idle_packages() -> FakePackages {
        FakePackages {
            upgrade_script: "echo upgraded",
            restart_gate: None,
        }
    }

    pub(crate) async fn call(
        state: Arc<ApiState>,
        method: &str,
        uri: &str,
    ) -> (StatusCode, String) {
        let request = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_package_matcher_flag() {
        let query = |v: &str| HashMap::from([(ONLY_FIRST_PARTY.to_string(), v.to_string())]);
        assert!(package_matcher(&HashMap::new()).is_ok());
        assert!(package_matcher(&query("TRUE")).is_ok());
        assert!(package_matcher(&query("false")).is_ok());
        assert!(matches!(
            package_matcher(&query("yes")),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_stops_with_an_event_stream_open() {
        let fixture = Fixture::new("true", None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(
            listener,
            state(&fixture, idle_packages()),
            async {
                let _ = stopped.await;
            },
        ));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /v1/system/update/events HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&received).contains("200 OK") {
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .expect("Response head should arrive")
                .unwrap();
            assert!(n > 0, "Connection closed before the response");
            received.extend_from_slice(&buf[..n]);
        }

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("Server should stop while a client is connected")
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .expect("Connection should be closed")
            .unwrap();
        let received = String::from_utf8_lossy(&received);
        assert!(received.contains("SERVER_CLOSED"));
        assert!(received.contains("event: close"));
    }

    #[tokio::test]
    async fn test_config_lists_directories() {
        let fixture = Fixture::new("true", None);
        let (status, body) = call(state(&fixture, idle_packages()), "GET", "/v1/config").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(
            json["directories"]["examples"]
                .as_str()
                .unwrap()
                .ends_with("data/examples")
        );
    }
}
