//! Terminal rendering of operations for the command line.

use std::io::Write;

use futures_util::{StreamExt, stream::BoxStream};

use crate::{
    config::ConfigError,
    orchestrator::{
        AppInfo, OrchestratorError,
        app::AppError,
        engine::EngineError,
        stream::{OperationError, StreamEvent},
    },
    update::{
        UpgradeError,
        apt::UpgradablePackage,
        broker::Subscription,
        event::{EventKind, UpgradeEvent},
    },
};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    App(#[from] AppError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),
    #[error("{0}")]
    UpgradeFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Print every event of an operation as it arrives. The first error ends the
/// operation and is returned.
pub async fn print_operation<W: Write>(
    mut events: BoxStream<'static, StreamEvent>,
    out: &mut W,
) -> Result<(), CliError> {
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Progress(progress) => {
                writeln!(out, "Progress[{}]: {:.0}%", progress.name, progress.progress)?
            }
            StreamEvent::Info(line) => writeln!(out, "[INFO] {line}")?,
            StreamEvent::Error(e) => return Err(e.into()),
        }
        out.flush()?;
    }
    Ok(())
}

/// Print upgrade events until the workflow finishes.
pub async fn print_upgrade<W: Write>(
    mut subscription: Subscription<UpgradeEvent>,
    out: &mut W,
) -> Result<(), CliError> {
    while let Some(event) = subscription.recv().await {
        if event.kind() == EventKind::Error {
            return Err(CliError::UpgradeFailed(event.data().to_string()));
        }
        writeln!(out, "[INFO] {}", event.data())?;
        out.flush()?;
        if event.is_final() {
            break;
        }
    }
    Ok(())
}

pub fn print_apps<W: Write>(apps: &[AppInfo], out: &mut W) -> std::io::Result<()> {
    for app in apps {
        let mut flags = Vec::new();
        if app.example {
            flags.push("example");
        }
        if app.default {
            flags.push("default");
        }
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            app.id,
            app.name,
            app.status,
            flags.join(",")
        )?;
    }
    Ok(())
}

pub fn print_packages<W: Write>(packages: &[UpgradablePackage], out: &mut W) -> std::io::Result<()> {
    if packages.is_empty() {
        return writeln!(out, "System is up to date");
    }
    for package in packages {
        writeln!(
            out,
            "{} {} -> {}",
            package.name, package.from_version, package.to_version
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::stream::Progress;
    use crate::update::broker::EventBroker;

    fn events(events: Vec<StreamEvent>) -> BoxStream<'static, StreamEvent> {
        futures_util::stream::iter(events).boxed()
    }

    #[tokio::test]
    async fn test_print_operation() {
        let mut out = Vec::new();
        print_operation(
            events(vec![
                StreamEvent::info("Provisioning app..."),
                StreamEvent::Progress(Progress {
                    name: "pull".to_string(),
                    progress: 42.4,
                }),
                StreamEvent::Progress(Progress::done("")),
            ]),
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "[INFO] Provisioning app...\nProgress[pull]: 42%\nProgress[]: 100%\n"
        );
    }

    #[tokio::test]
    async fn test_print_operation_stops_at_error() {
        let mut out = Vec::new();
        let err = print_operation(
            events(vec![
                StreamEvent::info("Starting app..."),
                StreamEvent::Error(OperationError::AnotherAppRunning("/apps/x".into())),
                StreamEvent::info("never printed"),
            ]),
            &mut out,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            CliError::Operation(OperationError::AnotherAppRunning(_))
        ));
        assert_eq!(String::from_utf8(out).unwrap(), "[INFO] Starting app...\n");
    }

    #[tokio::test]
    async fn test_print_upgrade_until_done() {
        let broker = EventBroker::new();
        let sub = broker.subscribe();
        broker.publish(UpgradeEvent::Starting("Upgrading 1 packages: libc6".into()));
        broker.publish(UpgradeEvent::Log("Unpacking".into()));
        broker.publish(UpgradeEvent::Done("Upgrade completed".into()));
        broker.publish(UpgradeEvent::Log("ignored".into()));

        let mut out = Vec::new();
        print_upgrade(sub, &mut out).await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "[INFO] Upgrading 1 packages: libc6\n[INFO] Unpacking\n[INFO] Upgrade completed\n"
        );
    }

    #[tokio::test]
    async fn test_print_upgrade_error() {
        let broker = EventBroker::new();
        let sub = broker.subscribe();
        broker.publish(UpgradeEvent::error(UpgradeError::AlreadyInProgress));

        let err = print_upgrade(sub, &mut Vec::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "an operation is already in progress");
    }
}
