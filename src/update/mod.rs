//! System package upgrades.
//!
//! At most one upgrade workflow runs at a time. Its progress is published on
//! an [`EventBroker`] so any number of clients can follow along, and none of
//! them can slow the upgrade down.

pub mod apt;
pub mod broker;
pub mod event;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::process::ProcessError;
use apt::{PackageManager, PackageMatcher, UpgradablePackage};
use broker::{EventBroker, Subscription};
use event::UpgradeEvent;

const RESTARTING_MESSAGE: &str = "Upgrade completed. Restarting ...";

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("an operation is already in progress")]
    AlreadyInProgress,
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("upgrade did not complete within {0:?}")]
    Timeout(Duration),
}

/// Clears the in-progress flag when dropped.
struct InProgress(Arc<AtomicBool>);

impl Drop for InProgress {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum UpgradeOutcome {
    UpToDate,
    Started(usize),
}

pub struct UpdateService {
    in_progress: Arc<AtomicBool>,
    broker: EventBroker<UpgradeEvent>,
    packages: Arc<dyn PackageManager>,
    first_party_prefix: String,
    timeout: Duration,
}

impl UpdateService {
    pub fn new(
        packages: Arc<dyn PackageManager>,
        first_party_prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            in_progress: Arc::new(AtomicBool::new(false)),
            broker: EventBroker::new(),
            packages,
            first_party_prefix: first_party_prefix.into(),
            timeout,
        }
    }

    #[cfg(test)]
    fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Result<InProgress, UpgradeError> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| UpgradeError::AlreadyInProgress)?;
        Ok(InProgress(self.in_progress.clone()))
    }

    pub fn subscribe(&self) -> Subscription<UpgradeEvent> {
        self.broker.subscribe()
    }

    pub fn unsubscribe(&self, subscription: Subscription<UpgradeEvent>) {
        self.broker.unsubscribe(subscription)
    }

    /// Refresh the package index and list the upgradable packages selected
    /// by `matcher`.
    pub async fn list_upgradable_packages(
        &self,
        matcher: PackageMatcher,
    ) -> Result<Vec<UpgradablePackage>, UpgradeError> {
        let _guard = self.acquire()?;
        self.packages.refresh().await?;
        let packages = self.packages.list_upgradable().await?;
        Ok(packages
            .into_iter()
            .filter(|package| matcher(package, &self.first_party_prefix))
            .collect())
    }

    /// Start upgrading `packages` in the background. Progress is published
    /// to the subscribers.
    pub fn upgrade_packages(
        self: &Arc<Self>,
        packages: Vec<UpgradablePackage>,
    ) -> Result<(), UpgradeError> {
        let guard = self.acquire()?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            this.run_upgrade(packages).await;
        });
        Ok(())
    }

    /// List, then upgrade whatever matched.
    pub async fn check_and_upgrade(
        self: &Arc<Self>,
        matcher: PackageMatcher,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        let packages = self.list_upgradable_packages(matcher).await?;
        if packages.is_empty() {
            log::info!("System is up to date");
            return Ok(UpgradeOutcome::UpToDate);
        }
        let count = packages.len();
        self.upgrade_packages(packages)?;
        Ok(UpgradeOutcome::Started(count))
    }

    async fn run_upgrade(&self, packages: Vec<UpgradablePackage>) {
        let names: Vec<String> = packages.into_iter().map(|p| p.name).collect();
        log::info!(
            "Upgrading packages: {} ({} subscribers)",
            names.join(", "),
            self.broker.subscriber_count()
        );
        self.broker.publish(UpgradeEvent::Starting(format!(
            "Upgrading {} packages: {}",
            names.len(),
            names.join(", ")
        )));

        match tokio::time::timeout(self.timeout, self.upgrade_and_restart(&names)).await {
            Ok(Ok(())) => {
                log::info!("Upgrade completed");
                self.broker
                    .publish(UpgradeEvent::Done("Upgrade completed".to_string()));
            }
            Ok(Err(e)) => {
                log::error!("Upgrade failed: {e}");
                self.broker.publish(UpgradeEvent::error(e));
            }
            Err(_) => {
                log::error!("Upgrade timed out after {:?}", self.timeout);
                self.broker
                    .publish(UpgradeEvent::error(UpgradeError::Timeout(self.timeout)));
            }
        }
    }

    async fn upgrade_and_restart(&self, names: &[String]) -> Result<(), UpgradeError> {
        let mut relay = self.packages.upgrade(names)?;
        while let Some(line) = relay.next_line().await? {
            self.broker.publish(UpgradeEvent::Log(line));
        }
        relay.wait().await?;

        self.broker
            .publish(UpgradeEvent::Restarting(RESTARTING_MESSAGE.to_string()));
        self.packages.restart_services().await?;
        Ok(())
    }
}
