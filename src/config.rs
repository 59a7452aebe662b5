use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::cli::Args;

const DEFAULT_PYTHON_IMAGE: &str = "ghcr.io/arduino/app-python-base:0.1.0";
const DEFAULT_LISTEN: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8800));
const DEFAULT_FIRST_PARTY_PREFIX: &str = "arduino-";
const DEFAULT_UPGRADE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Unable to determine the {0} directory")]
    NoDefaultDir(&'static str),
}

/// Optional overrides read from the TOML config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    apps_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    python_image: Option<String>,
    docker_bin: Option<String>,
    listen: Option<SocketAddr>,
    first_party_prefix: Option<String>,
    upgrade_timeout_secs: Option<u64>,
}

impl ConfigFile {
    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    fn try_init(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::try_init_from_string(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config file at {path:?}, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Runtime configuration shared by the orchestrator, the upgrade service and
/// the HTTP daemon.
#[derive(Debug, Clone)]
pub struct Config {
    pub apps_dir: PathBuf,
    pub data_dir: PathBuf,
    pub python_image: String,
    pub docker_bin: String,
    pub listen: SocketAddr,
    pub first_party_prefix: String,
    pub upgrade_timeout: Duration,
}

impl Config {
    /// Command line / environment wins over the config file, which wins
    /// over the built-in defaults.
    pub fn try_init(args: &Args) -> Result<Self, ConfigError> {
        let file = ConfigFile::try_init(&args.config)?;
        Self::from_parts(args.apps_dir.clone(), args.data_dir.clone(), file)
    }

    fn from_parts(
        apps_dir: Option<PathBuf>,
        data_dir: Option<PathBuf>,
        file: ConfigFile,
    ) -> Result<Self, ConfigError> {
        let apps_dir = match apps_dir.or(file.apps_dir) {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or(ConfigError::NoDefaultDir("home"))?
                .join("ArduinoApps"),
        };
        let data_dir = match data_dir.or(file.data_dir) {
            Some(dir) => dir,
            None => dirs::config_dir()
                .ok_or(ConfigError::NoDefaultDir("config"))?
                .join("appctl"),
        };
        let listen = file.listen.unwrap_or(DEFAULT_LISTEN);

        Ok(Self {
            apps_dir: absolute(apps_dir)?,
            data_dir: absolute(data_dir)?,
            python_image: file
                .python_image
                .unwrap_or_else(|| DEFAULT_PYTHON_IMAGE.to_string()),
            docker_bin: file.docker_bin.unwrap_or_else(|| "docker".to_string()),
            listen,
            first_party_prefix: file
                .first_party_prefix
                .unwrap_or_else(|| DEFAULT_FIRST_PARTY_PREFIX.to_string()),
            upgrade_timeout: Duration::from_secs(
                file.upgrade_timeout_secs
                    .unwrap_or(DEFAULT_UPGRADE_TIMEOUT_SECS),
            ),
        })
    }

    /// Config rooted in the given directories with every other field at its
    /// default.
    #[cfg(test)]
    pub fn with_dirs(apps_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        let apps_dir = apps_dir.into();
        let data_dir = data_dir.into();
        Self::from_parts(Some(apps_dir), Some(data_dir), ConfigFile::default())
            .expect("Explicit directories never need a default lookup")
    }

    pub fn examples_dir(&self) -> PathBuf {
        self.data_dir.join("examples")
    }

    pub fn default_app_file(&self) -> PathBuf {
        self.data_dir.join("default-app")
    }

    /// Create the directories the orchestrator writes to.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.apps_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.examples_dir())?;
        Ok(())
    }
}

fn absolute(path: PathBuf) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()?.join(path))
}

#[derive(Debug, serde::Serialize)]
pub struct ConfigDirectories {
    pub data: PathBuf,
    pub apps: PathBuf,
    pub examples: PathBuf,
}

impl From<&Config> for ConfigDirectories {
    fn from(config: &Config) -> Self {
        Self {
            data: config.data_dir.clone(),
            apps: config.apps_dir.clone(),
            examples: config.examples_dir(),
        }
    }
}
