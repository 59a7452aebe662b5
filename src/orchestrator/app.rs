use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize, Serializer};

use crate::config::Config;

const USER_PREFIX: &str = "user";
const EXAMPLES_PREFIX: &str = "examples";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("not a valid id")]
    InvalidId,
    #[error("not a valid id: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("{0:?} is not an app: no app.yaml found")]
    NotAnApp(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid app descriptor {path:?}: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Opaque identifier of an app, stable across restarts of the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppId {
    path: PathBuf,
    encoded: String,
    is_example: bool,
}

impl AppId {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_example(&self) -> bool {
        self.is_example
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl Serialize for AppId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.encoded)
    }
}

/// Maps app directories to ids and back, relative to the configured apps and
/// examples directories.
#[derive(Debug, Clone)]
pub struct IdProvider {
    config: Arc<Config>,
}

impl IdProvider {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn from_encoded(&self, id: &str) -> Result<AppId, AppError> {
        let decoded = URL_SAFE_NO_PAD.decode(id)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AppError::InvalidId)?;
        self.parse(&decoded)
    }

    /// Accepts either an encoded id or a path to an app directory.
    pub fn from_cli_arg(&self, arg: &str) -> Result<AppId, AppError> {
        let path = Path::new(arg);
        if path.is_dir() {
            return self.from_path(path);
        }
        self.from_encoded(arg)
    }

    pub fn from_path(&self, path: &Path) -> Result<AppId, AppError> {
        if !path.exists() {
            return Err(AppError::InvalidId);
        }
        let path = std::path::absolute(path)?;

        let apps_dir = &self.config.apps_dir;
        let examples_dir = self.config.examples_dir();
        let (raw, is_example) = if let Ok(rel) = path.strip_prefix(apps_dir) {
            (format!("{USER_PREFIX}:{}", rel.display()), false)
        } else if let Ok(rel) = path.strip_prefix(&examples_dir) {
            (format!("{EXAMPLES_PREFIX}:{}", rel.display()), true)
        } else {
            (path.display().to_string(), false)
        };

        Ok(AppId {
            encoded: URL_SAFE_NO_PAD.encode(raw.as_bytes()),
            path,
            is_example,
        })
    }

    fn parse(&self, raw: &str) -> Result<AppId, AppError> {
        if let Some((prefix, rel)) = raw.split_once(':') {
            let (root, is_example) = match prefix {
                USER_PREFIX => (self.config.apps_dir.clone(), false),
                EXAMPLES_PREFIX => (self.config.examples_dir(), true),
                _ => return Err(AppError::InvalidId),
            };
            if rel.is_empty() || Path::new(rel).is_absolute() {
                return Err(AppError::InvalidId);
            }
            return Ok(AppId {
                path: root.join(rel),
                encoded: URL_SAFE_NO_PAD.encode(raw.as_bytes()),
                is_example,
            });
        }

        let path = Path::new(raw);
        if !path.is_absolute() || !path.exists() {
            return Err(AppError::InvalidId);
        }
        Ok(AppId {
            path: path.to_path_buf(),
            encoded: URL_SAFE_NO_PAD.encode(raw.as_bytes()),
            is_example: false,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
}

#[derive(Debug, Clone)]
pub struct App {
    pub id: AppId,
    pub descriptor: AppDescriptor,
    pub main_python_file: Option<PathBuf>,
    pub main_sketch_file: Option<PathBuf>,
}

impl App {
    pub fn load(id: AppId) -> Result<Self, AppError> {
        let dir = id.path();
        let descriptor_path = ["app.yaml", "app.yml"]
            .into_iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| AppError::NotAnApp(dir.to_path_buf()))?;

        let contents = std::fs::read_to_string(&descriptor_path)?;
        let mut descriptor: AppDescriptor =
            serde_yaml::from_str(&contents).map_err(|source| AppError::Descriptor {
                path: descriptor_path.clone(),
                source,
            })?;
        if descriptor.name.is_empty() {
            descriptor.name = dir_name(dir);
        }

        let main_python_file = Some(dir.join("python").join("main.py")).filter(|p| p.is_file());
        let main_sketch_file =
            Some(dir.join("sketch").join("sketch.ino")).filter(|p| p.is_file());

        Ok(Self {
            id,
            descriptor,
            main_python_file,
            main_sketch_file,
        })
    }

    pub fn path(&self) -> &Path {
        self.id.path()
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Compose project name of the app containers.
    pub fn project_name(&self) -> String {
        dir_name(self.path())
    }

    pub fn has_containers(&self) -> bool {
        self.main_python_file.is_some()
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Whether a directory looks like an app.
pub fn is_app_dir(dir: &Path) -> bool {
    dir.join("app.yaml").is_file() || dir.join("app.yml").is_file()
}
