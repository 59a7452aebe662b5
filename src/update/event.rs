use std::{fmt, sync::Arc};

use super::UpgradeError;

/// One step of the package upgrade workflow, broadcast to every subscriber.
#[derive(Debug, Clone)]
pub enum UpgradeEvent {
    Starting(String),
    Log(String),
    Restarting(String),
    Done(String),
    Error {
        message: String,
        error: Option<Arc<UpgradeError>>,
    },
}

impl UpgradeEvent {
    pub fn error(error: UpgradeError) -> Self {
        Self::Error {
            message: error.to_string(),
            error: Some(Arc::new(error)),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Starting(_) => EventKind::Starting,
            Self::Log(_) => EventKind::Log,
            Self::Restarting(_) => EventKind::Restarting,
            Self::Done(_) => EventKind::Done,
            Self::Error { .. } => EventKind::Error,
        }
    }

    pub fn data(&self) -> &str {
        match self {
            Self::Starting(data)
            | Self::Log(data)
            | Self::Restarting(data)
            | Self::Done(data) => data,
            Self::Error { message, .. } => message,
        }
    }

    /// Whether the workflow ends with this event.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Starting,
    Log,
    Restarting,
    Done,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Starting => "starting",
            EventKind::Log => "log",
            EventKind::Restarting => "restarting",
            EventKind::Done => "done",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
