//! Aggregation of container states into one status per app.
//!
//! An app is made of one or more containers that all carry the
//! [`APP_PATH_LABEL`](super::engine::APP_PATH_LABEL) label. The status of the
//! app as a whole is derived from the states of those containers on every
//! query; it is never stored.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Starting,
        Status::Running,
        Status::Stopping,
        Status::Stopped,
        Status::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
        }
    }

    /// Running or on its way there.
    pub fn is_active(self) -> bool {
        matches!(self, Status::Running | Status::Starting)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("status should be one of starting, running, stopping, stopped, failed; got {0:?}")]
pub struct InvalidStatus(String);

impl FromStr for Status {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| InvalidStatus(s.to_string()))
    }
}

/// Raw state reported by the container engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl EngineState {
    pub fn parse(state: &str) -> Option<Self> {
        match state {
            "created" => Some(EngineState::Created),
            "running" => Some(EngineState::Running),
            "paused" => Some(EngineState::Paused),
            "restarting" => Some(EngineState::Restarting),
            "removing" => Some(EngineState::Removing),
            "exited" => Some(EngineState::Exited),
            "dead" => Some(EngineState::Dead),
            _ => None,
        }
    }
}

impl From<EngineState> for Status {
    fn from(state: EngineState) -> Self {
        match state {
            EngineState::Running => Status::Running,
            EngineState::Restarting => Status::Starting,
            EngineState::Removing => Status::Stopping,
            EngineState::Created | EngineState::Exited | EngineState::Paused => Status::Stopped,
            EngineState::Dead => Status::Failed,
        }
    }
}

/// One container seen during a poll of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerObservation {
    pub app_path: PathBuf,
    pub state: EngineState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppStatusInfo {
    pub app_path: PathBuf,
    pub status: Status,
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("No containers found for app {0:?}")]
    NotFound(PathBuf),
}

/// Collapse the states of the containers of a single app.
///
/// Precedence, in order: all running, all stopped, any failed, any stopping,
/// any starting. A mix of running and stopped containers only is a partially
/// running app and is reported as failed.
pub fn aggregate_states(states: &[Status]) -> Status {
    assert!(
        !states.is_empty(),
        "An app status group always has at least one container"
    );

    if states.iter().all(|s| *s == Status::Running) {
        return Status::Running;
    }
    if states.iter().all(|s| *s == Status::Stopped) {
        return Status::Stopped;
    }
    [Status::Failed, Status::Stopping, Status::Starting]
        .into_iter()
        .find(|wanted| states.contains(wanted))
        .unwrap_or(Status::Failed)
}

/// One [`AppStatusInfo`] per distinct app path, in order of first appearance.
pub fn aggregate(observations: &[ContainerObservation]) -> Vec<AppStatusInfo> {
    let mut index: HashMap<&Path, usize> = HashMap::new();
    let mut groups: Vec<(&Path, Vec<Status>)> = Vec::new();

    for observation in observations {
        let path = observation.app_path.as_path();
        let slot = *index.entry(path).or_insert_with(|| {
            groups.push((path, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(observation.state.into());
    }

    groups
        .into_iter()
        .map(|(path, states)| AppStatusInfo {
            app_path: path.to_path_buf(),
            status: aggregate_states(&states),
        })
        .collect()
}

/// The app currently occupying the board, if any.
pub fn running_app(statuses: &[AppStatusInfo]) -> Option<&AppStatusInfo> {
    statuses.iter().find(|info| info.status.is_active())
}

pub fn app_status<'a>(
    statuses: &'a [AppStatusInfo],
    app_path: &Path,
) -> Result<&'a AppStatusInfo, StatusError> {
    statuses
        .iter()
        .find(|info| info.app_path == app_path)
        .ok_or_else(|| StatusError::NotFound(app_path.to_path_buf()))
}
