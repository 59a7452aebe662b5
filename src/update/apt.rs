use async_trait::async_trait;
use serde::Serialize;

use crate::process::{CommandSpec, LineRelay, ProcessError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradablePackage {
    pub name: String,
    #[serde(skip)]
    pub architecture: String,
    pub from_version: String,
    pub to_version: String,
}

/// Selects which upgradable packages take part in an upgrade.
pub type PackageMatcher = fn(&UpgradablePackage, &str) -> bool;

pub fn match_all_packages(_: &UpgradablePackage, _: &str) -> bool {
    true
}

/// Packages whose name starts with the first-party prefix.
pub fn match_first_party_packages(package: &UpgradablePackage, prefix: &str) -> bool {
    package.name.starts_with(prefix)
}

#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Refresh the package index.
    async fn refresh(&self) -> Result<(), ProcessError>;

    async fn list_upgradable(&self) -> Result<Vec<UpgradablePackage>, ProcessError>;

    /// Start upgrading `names`; the relay yields the output as it comes.
    fn upgrade(&self, names: &[String]) -> Result<LineRelay, ProcessError>;

    /// Restart the services affected by the upgrade.
    async fn restart_services(&self) -> Result<(), ProcessError>;
}

#[derive(Debug, Default)]
pub struct AptPackageManager;

#[async_trait]
impl PackageManager for AptPackageManager {
    async fn refresh(&self) -> Result<(), ProcessError> {
        CommandSpec::new("sudo")
            .args(["apt-get", "update"])
            .status()
            .await
    }

    async fn list_upgradable(&self) -> Result<Vec<UpgradablePackage>, ProcessError> {
        let output = CommandSpec::new("apt")
            .args(["list", "--upgradable"])
            .env("LANG", "C")
            .output()
            .await?;
        Ok(parse_list_upgradable(&output))
    }

    fn upgrade(&self, names: &[String]) -> Result<LineRelay, ProcessError> {
        CommandSpec::new("sudo")
            .args(["--preserve-env=DEBIAN_FRONTEND,NEEDRESTART_MODE"])
            .args(["apt-get", "upgrade", "-y", "--only-upgrade"])
            .args(names)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .env("NEEDRESTART_MODE", "l")
            .spawn_lines()
    }

    async fn restart_services(&self) -> Result<(), ProcessError> {
        CommandSpec::new("sudo")
            .args(["needrestart", "-r", "a"])
            .status()
            .await
    }
}

/// Parse the output of `apt list --upgradable`, e.g.
/// `bash/stable 5.2.15-2+b3 arm64 [upgradable from: 5.2.15-2+b2]`.
pub fn parse_list_upgradable(output: &str) -> Vec<UpgradablePackage> {
    output.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<UpgradablePackage> {
    let (head, from) = line.split_once("[upgradable from:")?;
    let from_version = from.trim().trim_end_matches(']').trim();

    let mut fields = head.split_whitespace();
    let name = fields.next()?.split('/').next()?;
    let to_version = fields.next()?;
    let architecture = fields.next().unwrap_or_default();

    if name.is_empty() || to_version.is_empty() || from_version.is_empty() {
        return None;
    }
    Some(UpgradablePackage {
        name: name.to_string(),
        architecture: architecture.to_string(),
        from_version: from_version.to_string(),
        to_version: to_version.to_string(),
    })
}
