use std::{net::SocketAddr, path::PathBuf};

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Lifecycle manager for sandboxed apps running on the board.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "appctl.toml", env = "APPCTL_CONFIG")]
    pub config: PathBuf,

    /// Directory holding the user apps.
    #[arg(long, env = "APPCTL_APPS_DIR")]
    pub apps_dir: Option<PathBuf>,

    /// Directory holding examples, caches and the default app pointer.
    #[arg(long, env = "APPCTL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start an app.
    Start(AppArg),
    /// Stop a running app.
    Stop(AppArg),
    /// Stop (best effort) and start an app again.
    Restart(AppArg),
    /// Stop an app and remove its containers.
    Destroy(AppArg),
    /// Print the status of an app.
    Status(AppArg),
    /// List the known apps and their status.
    List,
    /// Run the HTTP daemon.
    Serve {
        /// Address to listen on. Overrides the config file.
        #[arg(long, env = "APPCTL_LISTEN")]
        listen: Option<SocketAddr>,
    },
    /// System package management.
    #[command(subcommand)]
    System(SystemCommand),
}

#[derive(ClapArgs, Debug)]
pub struct AppArg {
    /// App id or path to the app directory.
    pub app: String,
}

#[derive(Subcommand, Debug)]
pub enum SystemCommand {
    /// List the packages that can be upgraded.
    CheckUpgrade {
        /// Only consider first-party packages.
        #[arg(long)]
        only_first_party: bool,
    },
    /// Upgrade packages and restart the affected services.
    Upgrade {
        /// Only consider first-party packages.
        #[arg(long)]
        only_first_party: bool,
    },
}
