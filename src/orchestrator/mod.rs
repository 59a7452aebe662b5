//! App lifecycle on top of the container engine.
//!
//! Lifecycle operations are lazy [`BoxStream`]s of [`StreamEvent`]s. Nothing
//! happens until the stream is polled, and dropping it kills whatever compose
//! process is running at that point.

pub mod app;
pub mod engine;
pub mod provision;
pub mod status;
pub mod stream;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_stream::stream;
use futures_util::{StreamExt, stream::BoxStream};
use serde::Serialize;

use crate::{config::Config, process::CommandSpec};
use app::{App, AppError, AppId, IdProvider, is_app_dir};
use engine::{ContainerEngine, EngineError};
use provision::{Provisioner, compose_file};
use status::{AppStatusInfo, Status, StatusError, app_status, running_app};
use stream::{OperationError, Progress, StreamEvent, registry_error};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    App(#[from] AppError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What clients see of an app.
#[derive(Debug, Clone, Serialize)]
pub struct AppInfo {
    pub id: AppId,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub status: Status,
    pub example: bool,
    pub default: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    ids: IdProvider,
    engine: Arc<dyn ContainerEngine>,
    provisioner: Arc<dyn Provisioner>,
    compose: CommandSpec,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<dyn ContainerEngine>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        let compose = CommandSpec::new(&config.docker_bin).arg("compose");
        Self {
            ids: IdProvider::new(config.clone()),
            config,
            engine,
            provisioner,
            compose,
        }
    }

    #[cfg(test)]
    fn with_compose_command(mut self, compose: CommandSpec) -> Self {
        self.compose = compose;
        self
    }

    pub fn ids(&self) -> &IdProvider {
        &self.ids
    }

    pub fn load_app(&self, id: &AppId) -> Result<App, AppError> {
        App::load(id.clone())
    }

    /// One aggregation pass over every app container.
    pub async fn statuses(&self) -> Result<Vec<AppStatusInfo>, EngineError> {
        let observations = self.engine.app_containers().await?;
        Ok(status::aggregate(&observations))
    }

    /// Path stored in the default app pointer file, if any.
    pub fn default_app_path(&self) -> Option<PathBuf> {
        let file = self.config.default_app_file();
        match std::fs::read_to_string(&file) {
            Ok(contents) => {
                let path = contents.trim();
                (!path.is_empty()).then(|| PathBuf::from(path))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("Unable to read default app from {file:?}: {e}");
                None
            }
        }
    }

    fn app_info(&self, app: &App, statuses: &[AppStatusInfo], default: Option<&Path>) -> AppInfo {
        let status = app_status(statuses, app.path())
            .map(|info| info.status)
            .unwrap_or(Status::Stopped);
        AppInfo {
            id: app.id.clone(),
            name: app.name().to_string(),
            description: app.descriptor.description.clone(),
            icon: app.descriptor.icon.clone(),
            status,
            example: app.id.is_example(),
            default: default == Some(app.path()),
        }
    }

    pub async fn app_details(&self, app: &App) -> Result<AppInfo, EngineError> {
        let statuses = self.statuses().await?;
        let default = self.default_app_path();
        Ok(self.app_info(app, &statuses, default.as_deref()))
    }

    /// Every user app followed by every example, optionally only those in
    /// `filter` status.
    pub async fn list_apps(&self, filter: Option<Status>) -> Result<Vec<AppInfo>, OrchestratorError> {
        let statuses = self.statuses().await?;
        let default = self.default_app_path();

        let mut apps = Vec::new();
        for root in [self.config.apps_dir.clone(), self.config.examples_dir()] {
            for dir in app_dirs(&root)? {
                let app = match self.ids.from_path(&dir).and_then(App::load) {
                    Ok(app) => app,
                    Err(e) => {
                        log::error!("Unable to load app at {dir:?}: {e}");
                        continue;
                    }
                };
                let info = self.app_info(&app, &statuses, default.as_deref());
                if filter.is_none_or(|wanted| wanted == info.status) {
                    apps.push(info);
                }
            }
        }
        Ok(apps)
    }

    /// A fresh [`AppInfo`] every time a container of an app changes state.
    pub fn status_events(&self) -> BoxStream<'static, Result<AppInfo, OrchestratorError>> {
        let this = self.clone();
        stream! {
            let mut events = this.engine.events();
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(e.into());
                        break;
                    }
                };
                let app = match this.ids.from_path(&event.app_path).and_then(App::load) {
                    Ok(app) => app,
                    Err(e) => {
                        log::warn!("Ignoring event for {:?}: {e}", event.app_path);
                        continue;
                    }
                };
                match this.app_details(&app).await {
                    Ok(info) => yield Ok(info),
                    Err(e) => {
                        yield Err(e.into());
                        break;
                    }
                }
            }
        }
        .boxed()
    }

    fn compose_command(&self, file: &Path) -> CommandSpec {
        self.compose.clone().arg("-f").arg(file)
    }

    pub fn start(&self, app: App) -> BoxStream<'static, StreamEvent> {
        let this = self.clone();
        stream! {
            let statuses = match this.statuses().await {
                Ok(statuses) => statuses,
                Err(e) => {
                    yield StreamEvent::Error(e.into());
                    return;
                }
            };
            if let Some(running) = running_app(&statuses) {
                if running.app_path == app.path() {
                    yield StreamEvent::info("App is already running");
                    yield StreamEvent::Progress(Progress::done(""));
                } else {
                    yield StreamEvent::Error(OperationError::AnotherAppRunning(
                        running.app_path.display().to_string(),
                    ));
                }
                return;
            }

            if !app.has_containers() {
                yield StreamEvent::info("App has no python component, nothing to start");
                yield StreamEvent::Progress(Progress::done(""));
                return;
            }

            yield StreamEvent::info("Provisioning app...");
            let compose = match this.provisioner.provision(&app).await {
                Ok(compose) => compose,
                Err(e) => {
                    let err = registry_error(&e.to_string()).unwrap_or(e.into());
                    yield StreamEvent::Error(err);
                    return;
                }
            };

            yield StreamEvent::info("Starting app...");
            let up = this.compose_command(&compose).args(["up", "-d", "--remove-orphans"]);
            let mut relay = relay_lines(up);
            while let Some(event) = relay.next().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
            yield StreamEvent::Progress(Progress::done(""));
        }
        .boxed()
    }

    pub fn stop(&self, app: App) -> BoxStream<'static, StreamEvent> {
        let this = self.clone();
        stream! {
            let statuses = match this.statuses().await {
                Ok(statuses) => statuses,
                Err(e) => {
                    yield StreamEvent::Error(e.into());
                    return;
                }
            };
            let status = match app_status(&statuses, app.path()) {
                Ok(info) => info.status,
                Err(StatusError::NotFound(_)) => Status::Stopped,
            };
            if status == Status::Stopped {
                yield StreamEvent::info("App is not running");
                yield StreamEvent::Progress(Progress::done(""));
                return;
            }

            yield StreamEvent::info("Stopping app...");
            let stop = this.compose_command(&compose_file(&app)).arg("stop");
            let mut relay = relay_lines(stop);
            while let Some(event) = relay.next().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
            yield StreamEvent::Progress(Progress::done(""));
        }
        .boxed()
    }

    /// Stop then start. A failing stop is only logged.
    pub fn restart(&self, app: App) -> BoxStream<'static, StreamEvent> {
        let this = self.clone();
        stream! {
            let mut stop = this.stop(app.clone());
            while let Some(event) = stop.next().await {
                match event {
                    StreamEvent::Info(line) => yield StreamEvent::Info(line),
                    StreamEvent::Progress(_) => {}
                    StreamEvent::Error(e) => {
                        log::warn!("Failed to stop app {:?} before restart: {e}", app.path());
                        break;
                    }
                }
            }
            drop(stop);

            let mut start = this.start(app);
            while let Some(event) = start.next().await {
                yield event;
            }
        }
        .boxed()
    }

    /// Stop the app and remove its containers.
    pub fn destroy(&self, app: App) -> BoxStream<'static, StreamEvent> {
        let this = self.clone();
        stream! {
            let compose = compose_file(&app);
            if !compose.is_file() {
                yield StreamEvent::info("App has no containers");
                yield StreamEvent::Progress(Progress::done(""));
                return;
            }

            yield StreamEvent::info("Destroying app...");
            let down = this.compose_command(&compose).args(["down", "--remove-orphans"]);
            let mut relay = relay_lines(down);
            while let Some(event) = relay.next().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
            yield StreamEvent::Progress(Progress::done(""));
        }
        .boxed()
    }
}

/// Every output line of `command` as an `Info`, then an `Error` if it fails.
/// A registry failure seen in the output takes precedence over the exit
/// status.
fn relay_lines(command: CommandSpec) -> BoxStream<'static, StreamEvent> {
    stream! {
        let mut relay = match command.spawn_lines() {
            Ok(relay) => relay,
            Err(e) => {
                yield StreamEvent::Error(e.into());
                return;
            }
        };

        let mut registry_failure = None;
        loop {
            match relay.next_line().await {
                Ok(Some(line)) => {
                    if registry_failure.is_none() {
                        registry_failure = registry_error(&line);
                    }
                    yield StreamEvent::Info(line);
                }
                Ok(None) => break,
                Err(e) => {
                    yield StreamEvent::Error(e.into());
                    return;
                }
            }
        }

        if let Err(e) = relay.wait().await {
            yield StreamEvent::Error(registry_failure.unwrap_or(e.into()));
        }
    }
    .boxed()
}

/// Subdirectories of `root` that hold an app, sorted by name.
fn app_dirs(root: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() && is_app_dir(&path) {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::orchestrator::{
        app::tests::write_app,
        engine::EngineEvent,
        provision::ProvisionError,
        status::{ContainerObservation, EngineState},
    };
    use crate::process::tests::wait_until_dead;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    pub(crate) struct FakeEngine {
        pub containers: Mutex<Vec<ContainerObservation>>,
        pub events: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    }

    impl FakeEngine {
        pub fn set(&self, app_path: &Path, states: &[EngineState]) {
            let mut containers = self.containers.lock().unwrap();
            containers.retain(|c| c.app_path != app_path);
            containers.extend(states.iter().map(|state| ContainerObservation {
                app_path: app_path.to_path_buf(),
                state: *state,
            }));
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn app_containers(&self) -> Result<Vec<ContainerObservation>, EngineError> {
            Ok(self.containers.lock().unwrap().clone())
        }

        fn events(&self) -> BoxStream<'static, Result<EngineEvent, EngineError>> {
            let rx = self.events.lock().unwrap().take();
            stream! {
                if let Some(mut rx) = rx {
                    while let Some(event) = rx.recv().await {
                        yield Ok(event);
                    }
                }
            }
            .boxed()
        }
    }

    pub(crate) struct FakeProvisioner {
        pub failure: Option<&'static str>,
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn provision(&self, app: &App) -> Result<PathBuf, ProvisionError> {
            match self.failure {
                Some(msg) => Err(ProvisionError::Io(std::io::Error::other(msg))),
                None => Ok(compose_file(app)),
            }
        }
    }

    pub(crate) struct Fixture {
        pub tmp: tempfile::TempDir,
        pub engine: Arc<FakeEngine>,
        pub orchestrator: Orchestrator,
    }

    impl Fixture {
        /// `compose_script` stands in for `docker compose`; `$3` is the
        /// compose subcommand.
        pub fn new(compose_script: &str, provision_failure: Option<&'static str>) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let config = Config::with_dirs(tmp.path().join("apps"), tmp.path().join("data"));
            config.ensure_dirs().unwrap();

            let script = tmp.path().join("compose.sh");
            std::fs::write(&script, compose_script).unwrap();

            let engine = Arc::new(FakeEngine::default());
            let orchestrator = Orchestrator::new(
                Arc::new(config),
                engine.clone(),
                Arc::new(FakeProvisioner {
                    failure: provision_failure,
                }),
            )
            .with_compose_command(CommandSpec::new("sh").arg(&script));
            Self {
                tmp,
                engine,
                orchestrator,
            }
        }

        pub fn app(&self, name: &str, python: bool) -> App {
            let dir = write_app(&self.tmp.path().join("apps"), name, python);
            let id = self.orchestrator.ids().from_path(&dir).unwrap();
            self.orchestrator.load_app(&id).unwrap()
        }
    }

    const OK_COMPOSE: &str = r#"
case "$3" in
  up) echo "Container main Creating"; echo "Container main Started" 1>&2 ;;
  stop) echo "Container main Stopped" ;;
  down) echo "Container main Removed" ;;
esac
"#;

    pub(crate) fn describe(event: &StreamEvent) -> String {
        match event {
            StreamEvent::Progress(p) => format!("progress[{}]:{}", p.name, p.progress),
            StreamEvent::Info(line) => format!("info:{line}"),
            StreamEvent::Error(e) => format!("error:{e}"),
        }
    }

    async fn run(stream: BoxStream<'static, StreamEvent>) -> Vec<String> {
        stream.map(|event| describe(&event)).collect().await
    }

    #[tokio::test]
    async fn test_start_emits_steps_in_order() {
        let fixture = Fixture::new(OK_COMPOSE, None);
        let app = fixture.app("vision", true);

        let mut events = run(fixture.orchestrator.start(app)).await;
        assert_eq!(events[0], "info:Provisioning app...");
        assert_eq!(events[1], "info:Starting app...");
        assert_eq!(events.pop().as_deref(), Some("progress[]:100"));

        let mut lines = events[2..].to_vec();
        lines.sort();
        assert_eq!(
            lines,
            vec!["info:Container main Creating", "info:Container main Started"]
        );
    }

    #[tokio::test]
    async fn test_failed_provisioning_emits_one_error() {
        let fixture = Fixture::new(OK_COMPOSE, Some("disk full"));
        let app = fixture.app("vision", true);

        let events = run(fixture.orchestrator.start(app)).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], "info:Provisioning app...");
        assert!(events[1].starts_with("error:") && events[1].contains("disk full"));
    }

    #[tokio::test]
    async fn test_failed_compose_up_reports_registry_error() {
        let fixture = Fixture::new(
            r#"echo 'main Error Head "https://ghcr.io/v2/": unauthorized'; exit 1"#,
            None,
        );
        let app = fixture.app("vision", true);

        let events = run(fixture.orchestrator.start(app)).await;
        let errors: Vec<_> = events.iter().filter(|e| e.starts_with("error:")).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("could not reach the Docker registry"));
        assert!(events.last().unwrap().starts_with("error:"));
        assert!(!events.iter().any(|e| e.starts_with("progress")));
    }

    #[tokio::test]
    async fn test_failed_compose_up_without_registry_hint() {
        let fixture = Fixture::new("echo broken; exit 2", None);
        let app = fixture.app("vision", true);

        let events = run(fixture.orchestrator.start(app)).await;
        assert_eq!(events[2], "info:broken");
        assert!(events[3].starts_with("error:sh exited with"));
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn test_start_already_running_app() {
        let fixture = Fixture::new(OK_COMPOSE, None);
        let app = fixture.app("vision", true);
        fixture.engine.set(app.path(), &[EngineState::Running]);

        let events = run(fixture.orchestrator.start(app)).await;
        assert_eq!(events, vec!["info:App is already running", "progress[]:100"]);
    }

    #[tokio::test]
    async fn test_start_while_another_app_runs() {
        let fixture = Fixture::new(OK_COMPOSE, None);
        let other = fixture.app("other", true);
        let app = fixture.app("vision", true);
        fixture.engine.set(other.path(), &[EngineState::Restarting]);

        let events = run(fixture.orchestrator.start(app)).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("error:App"), "{events:?}");
        assert!(events[0].contains("already running"));
    }

    #[tokio::test]
    async fn test_sketch_only_app_still_completes() {
        let fixture = Fixture::new(OK_COMPOSE, None);
        let app = fixture.app("blink", false);

        let events = run(fixture.orchestrator.start(app)).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("info:"));
        assert_eq!(events[1], "progress[]:100");
    }

    #[tokio::test]
    async fn test_stop_app_not_running() {
        let fixture = Fixture::new(OK_COMPOSE, None);
        let app = fixture.app("vision", true);
        fixture.engine.set(app.path(), &[EngineState::Exited]);

        let events = run(fixture.orchestrator.stop(app)).await;
        assert_eq!(events, vec!["info:App is not running", "progress[]:100"]);
    }

    #[tokio::test]
    async fn test_stop_running_app() {
        let fixture = Fixture::new(OK_COMPOSE, None);
        let app = fixture.app("vision", true);
        fixture.engine.set(app.path(), &[EngineState::Running]);

        let events = run(fixture.orchestrator.stop(app)).await;
        assert_eq!(
            events,
            vec![
                "info:Stopping app...",
                "info:Container main Stopped",
                "progress[]:100"
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_ignores_stop_failure() {
        let fixture = Fixture::new(
            r#"
case "$3" in
  stop) echo "cannot stop"; exit 1 ;;
  up) echo "up again" ;;
esac
"#,
            None,
        );
        let app = fixture.app("vision", true);
        fixture.engine.set(app.path(), &[EngineState::Dead]);

        let events = run(fixture.orchestrator.restart(app)).await;
        assert_eq!(
            events,
            vec![
                "info:Stopping app...",
                "info:cannot stop",
                "info:Provisioning app...",
                "info:Starting app...",
                "info:up again",
                "progress[]:100"
            ]
        );
    }

    #[tokio::test]
    async fn test_destroy() {
        let fixture = Fixture::new(OK_COMPOSE, None);
        let app = fixture.app("vision", true);

        let events = run(fixture.orchestrator.destroy(app.clone())).await;
        assert_eq!(events, vec!["info:App has no containers", "progress[]:100"]);

        provision::write_compose_file(&app, "python:3.12").unwrap();
        let events = run(fixture.orchestrator.destroy(app)).await;
        assert_eq!(
            events,
            vec![
                "info:Destroying app...",
                "info:Container main Removed",
                "progress[]:100"
            ]
        );
    }

    #[tokio::test]
    async fn test_dropping_the_stream_kills_compose() {
        let fixture = Fixture::new(r#"echo "pid $$"; exec sleep 30"#, None);
        let app = fixture.app("vision", true);

        let mut events = fixture.orchestrator.start(app);
        let pid = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.next())
                .await
                .expect("Compose output should arrive")
                .expect("Stream ended early");
            if let StreamEvent::Info(line) = event
                && let Some(pid) = line.strip_prefix("pid ")
            {
                break pid.parse::<u32>().unwrap();
            }
        };

        drop(events);
        assert!(wait_until_dead(pid).await, "Compose process {pid} survived");
    }

    #[tokio::test]
    async fn test_list_apps_joins_statuses() {
        let fixture = Fixture::new(OK_COMPOSE, None);
        let vision = fixture.app("vision", true);
        let _blink = fixture.app("blink", false);
        write_app(&fixture.tmp.path().join("data/examples"), "pose", true);
        fixture.engine.set(vision.path(), &[EngineState::Running]);
        std::fs::write(
            fixture.tmp.path().join("data/default-app"),
            vision.path().display().to_string(),
        )
        .unwrap();

        let apps = fixture.orchestrator.list_apps(None).await.unwrap();
        let summary: Vec<_> = apps
            .iter()
            .map(|a| (a.name.as_str(), a.status, a.example, a.default))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("blink", Status::Stopped, false, false),
                ("vision", Status::Running, false, true),
                ("pose", Status::Stopped, true, false),
            ]
        );

        let running = fixture
            .orchestrator
            .list_apps(Some(Status::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "vision");
    }

    #[tokio::test]
    async fn test_status_events_follow_the_engine() {
        let fixture = Fixture::new(OK_COMPOSE, None);
        let app = fixture.app("vision", true);
        let (tx, rx) = mpsc::unbounded_channel();
        *fixture.engine.events.lock().unwrap() = Some(rx);

        let mut events = fixture.orchestrator.status_events();

        fixture.engine.set(app.path(), &[EngineState::Running]);
        tx.send(EngineEvent {
            app_path: app.path().to_path_buf(),
        })
        .unwrap();
        let info = events.next().await.unwrap().unwrap();
        assert_eq!(info.name, "vision");
        assert_eq!(info.status, Status::Running);

        fixture.engine.set(app.path(), &[]);
        tx.send(EngineEvent {
            app_path: app.path().to_path_buf(),
        })
        .unwrap();
        let info = events.next().await.unwrap().unwrap();
        assert_eq!(info.status, Status::Stopped);

        drop(tx);
        assert!(events.next().await.is_none());
    }
}
