use serde::Serialize;

use super::{app::AppError, engine::EngineError, provision::ProvisionError};
use crate::process::ProcessError;

/// Completion of a named step, `progress` in `0.0..=100.0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub name: String,
    pub progress: f32,
}

impl Progress {
    pub fn done(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            progress: 100.0,
        }
    }
}

/// One item of an operation sequence. `Error` is terminal.
#[derive(Debug)]
pub enum StreamEvent {
    Progress(Progress),
    Info(String),
    Error(OperationError),
}

impl StreamEvent {
    pub fn info(line: impl Into<String>) -> Self {
        Self::Info(line.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    App(#[from] AppError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("Failed to provision app: {0}")]
    Provision(#[from] ProvisionError),
    #[error("{0}")]
    Registry(String),
    #[error("App {0:?} is already running, stop it first")]
    AnotherAppRunning(String),
}

const UNAUTHORIZED_HINT: &str = "Please make sure to be authorized to download from it or flash the board with the latest Arduino Linux image.";
const NETWORK_HINT: &str =
    "Please check your internet connection or flash the board with the latest Arduino Linux image.";

/// Friendly error for an output line reporting that the image registry could
/// not be reached.
pub fn registry_error(line: &str) -> Option<OperationError> {
    let hint = if line.contains("unauthorized") {
        UNAUTHORIZED_HINT
    } else if line.contains("connection refused") || line.contains("no such host") {
        NETWORK_HINT
    } else {
        return None;
    };
    Some(OperationError::Registry(format!(
        "could not reach the Docker registry to download base image. {hint} Details: {line}"
    )))
}
