//! Materialisation of the compose project of an app.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bollard::{
    Docker,
    query_parameters::{CreateImageOptions, CreateImageOptionsBuilder},
};
use futures_util::StreamExt;
use serde::Serialize;

use super::{
    app::App,
    engine::{APP_LABEL, APP_PATH_LABEL},
};

const CACHE_DIR: &str = ".cache";
const COMPOSE_FILE: &str = "app-compose.yaml";
const MAIN_SERVICE: &str = "main";
const APP_MOUNT: &str = "/app";

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to serialize compose file: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("App {0:?} has no python component")]
    NoPythonComponent(PathBuf),
}

/// Location of the generated compose file of an app.
pub fn compose_file(app: &App) -> PathBuf {
    app.path().join(CACHE_DIR).join(COMPOSE_FILE)
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Make the app ready for `compose up` and return its compose file.
    async fn provision(&self, app: &App) -> Result<PathBuf, ProvisionError>;
}

#[derive(Debug, Serialize)]
struct ComposeProject {
    name: String,
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    working_dir: String,
    command: Vec<String>,
    volumes: Vec<String>,
    labels: BTreeMap<String, String>,
    restart: String,
}

fn compose_project(app: &App, image: &str) -> Result<ComposeProject, ProvisionError> {
    let main = app
        .main_python_file
        .as_deref()
        .and_then(|file| file.strip_prefix(app.path()).ok())
        .ok_or_else(|| ProvisionError::NoPythonComponent(app.path().to_path_buf()))?;

    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), "true".to_string());
    labels.insert(
        APP_PATH_LABEL.to_string(),
        app.path().display().to_string(),
    );

    let service = ComposeService {
        image: image.to_string(),
        working_dir: APP_MOUNT.to_string(),
        command: vec![
            "python".to_string(),
            Path::new(APP_MOUNT).join(main).display().to_string(),
        ],
        volumes: vec![format!("{}:{APP_MOUNT}", app.path().display())],
        labels,
        restart: "unless-stopped".to_string(),
    };

    Ok(ComposeProject {
        name: app.project_name(),
        services: BTreeMap::from([(MAIN_SERVICE.to_string(), service)]),
    })
}

/// Write the compose file of `app` running on `image`.
pub fn write_compose_file(app: &App, image: &str) -> Result<PathBuf, ProvisionError> {
    let project = compose_project(app, image)?;
    let path = compose_file(app);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_yaml::to_string(&project)?)?;
    log::debug!("Wrote compose file {path:?}");
    Ok(path)
}

/// Pulls the python base image when missing and writes the compose file.
pub struct ComposeProvisioner {
    docker: Docker,
    image: String,
}

impl ComposeProvisioner {
    pub fn new(docker: Docker, image: impl Into<String>) -> Self {
        Self {
            docker,
            image: image.into(),
        }
    }

    async fn ensure_image(&self) -> Result<(), ProvisionError> {
        match self.docker.inspect_image(&self.image).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => self.pull_image().await,
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self) -> Result<(), ProvisionError> {
        log::info!("Pulling image: {}", self.image);
        let (image, tag) = parse_image_reference(&self.image);

        let options: CreateImageOptions = CreateImageOptionsBuilder::new()
            .from_image(image)
            .tag(tag)
            .build();

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        log::debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    log::error!("Failed to pull image {}: {}", self.image, e);
                    return Err(e.into());
                }
            }
        }

        log::info!("Image {} pulled successfully", self.image);
        Ok(())
    }
}

#[async_trait]
impl Provisioner for ComposeProvisioner {
    async fn provision(&self, app: &App) -> Result<PathBuf, ProvisionError> {
        self.ensure_image().await?;
        write_compose_file(app, &self.image)
    }
}

/// Split an image reference into name and tag (or digest).
fn parse_image_reference(image: &str) -> (&str, &str) {
    if let Some(at_pos) = image.find('@') {
        return (&image[..at_pos], &image[at_pos..]);
    }

    // A colon followed by a slash belongs to a registry port.
    if let Some(colon_pos) = image.rfind(':') {
        let after_colon = &image[colon_pos + 1..];
        if !after_colon.contains('/') {
            return (&image[..colon_pos], after_colon);
        }
    }

    (image, "latest")
}
