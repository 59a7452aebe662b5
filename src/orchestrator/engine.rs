//! Container engine access through bollard.
//!
//! App containers are recognised by labels written into the generated compose
//! file, so listing and watching never needs the compose CLI.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use bollard::{
    Docker,
    query_parameters::{EventsOptionsBuilder, ListContainersOptionsBuilder},
};
use futures_util::{StreamExt, stream::BoxStream};

use super::status::{ContainerObservation, EngineState};

/// Set to `true` on every container belonging to an app.
pub const APP_LABEL: &str = "appctl.app";
/// Absolute path of the app directory a container belongs to.
pub const APP_PATH_LABEL: &str = "appctl.app.path";

const WATCHED_ACTIONS: [&str; 7] = [
    "create", "start", "stop", "die", "restart", "destroy", "delete",
];

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// Something happened to a container of the app at `app_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub app_path: PathBuf,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// One observation per app container, stopped ones included.
    async fn app_containers(&self) -> Result<Vec<ContainerObservation>, EngineError>;

    /// Lifecycle events of app containers. Ends when the engine closes the
    /// connection.
    fn events(&self) -> BoxStream<'static, Result<EngineEvent, EngineError>>;
}

#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects using the local defaults (unix socket on Linux).
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

fn app_label_filter() -> String {
    format!("{APP_LABEL}=true")
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn app_containers(&self) -> Result<Vec<ContainerObservation>, EngineError> {
        let label = app_label_filter();
        let mut filters: HashMap<&str, Vec<&str>> = HashMap::new();
        filters.insert("label", vec![label.as_str()]);
        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();

        let containers = self.docker.list_containers(Some(options)).await?;

        let mut observations = Vec::with_capacity(containers.len());
        for container in containers {
            let Some(app_path) = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(APP_PATH_LABEL))
            else {
                log::warn!(
                    "Container {:?} has no {APP_PATH_LABEL} label, skipping",
                    container.id
                );
                continue;
            };
            let raw_state = container.state.map(|s| s.to_string()).unwrap_or_default();
            let Some(state) = EngineState::parse(&raw_state) else {
                log::warn!(
                    "Container {:?} is in unknown state {raw_state:?}, skipping",
                    container.id
                );
                continue;
            };
            observations.push(ContainerObservation {
                app_path: PathBuf::from(app_path),
                state,
            });
        }
        Ok(observations)
    }

    fn events(&self) -> BoxStream<'static, Result<EngineEvent, EngineError>> {
        let docker = self.docker.clone();
        async_stream::stream! {
            let label = app_label_filter();
            let mut filters: HashMap<&str, Vec<&str>> = HashMap::new();
            filters.insert("type", vec!["container"]);
            filters.insert("label", vec![label.as_str()]);
            filters.insert("event", WATCHED_ACTIONS.to_vec());
            let options = EventsOptionsBuilder::new().filters(&filters).build();

            let mut events = std::pin::pin!(docker.events(Some(options)));
            while let Some(event) = events.next().await {
                match event {
                    Ok(message) => {
                        let app_path = message
                            .actor
                            .and_then(|actor| actor.attributes)
                            .and_then(|mut attributes| attributes.remove(APP_PATH_LABEL));
                        match app_path {
                            Some(app_path) => yield Ok(EngineEvent {
                                app_path: PathBuf::from(app_path),
                            }),
                            None => log::debug!("Ignoring event without app path: {:?}", message.action),
                        }
                    }
                    Err(e) => {
                        yield Err(EngineError::Docker(e));
                        break;
                    }
                }
            }
        }
        .boxed()
    }
}
