use std::{io::Write, process::ExitCode, sync::Arc};

use clap::Parser;

use cli::{Args, Command, SystemCommand};
use config::Config;
use orchestrator::{
    Orchestrator,
    engine::DockerEngine,
    provision::ComposeProvisioner,
};
use output::CliError;
use render::sse::ShutdownSignal;
use update::{
    UpdateService, UpgradeOutcome,
    apt::{AptPackageManager, PackageMatcher, match_all_packages, match_first_party_packages},
};

mod api;
mod cli;
mod config;
mod orchestrator;
mod output;
mod process;
mod render;
mod signals;
mod update;

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("[ERROR] Unable to start the async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let _ = std::io::stdout().flush();
            eprintln!("[ERROR] {e}");
            ExitCode::FAILURE
        }
    }
}

fn matcher(only_first_party: bool) -> PackageMatcher {
    if only_first_party {
        match_first_party_packages
    } else {
        match_all_packages
    }
}

fn update_service(config: &Config) -> Arc<UpdateService> {
    Arc::new(UpdateService::new(
        Arc::new(AptPackageManager),
        config.first_party_prefix.clone(),
        config.upgrade_timeout,
    ))
}

fn orchestrator(config: &Arc<Config>) -> Result<Orchestrator, CliError> {
    let engine = DockerEngine::connect()?;
    let provisioner = ComposeProvisioner::new(engine.docker().clone(), &config.python_image);
    Ok(Orchestrator::new(
        config.clone(),
        Arc::new(engine),
        Arc::new(provisioner),
    ))
}

async fn run(args: Args) -> Result<(), CliError> {
    let config = Arc::new(Config::try_init(&args)?);
    config.ensure_dirs()?;
    let mut stdout = std::io::stdout();

    match args.command {
        Command::System(command) => system(command, &config, &mut stdout).await,
        Command::Serve { listen } => serve(config, listen).await,
        Command::List => {
            let apps = orchestrator(&config)?.list_apps(None).await?;
            output::print_apps(&apps, &mut stdout)?;
            Ok(())
        }
        Command::Status(arg) => {
            let orchestrator = orchestrator(&config)?;
            let app = orchestrator.load_app(&orchestrator.ids().from_cli_arg(&arg.app)?)?;
            let info = orchestrator.app_details(&app).await?;
            writeln!(stdout, "{}: {}", info.name, info.status)?;
            Ok(())
        }
        Command::Start(arg) => {
            let orchestrator = orchestrator(&config)?;
            let app = orchestrator.load_app(&orchestrator.ids().from_cli_arg(&arg.app)?)?;
            output::print_operation(orchestrator.start(app), &mut stdout).await
        }
        Command::Stop(arg) => {
            let orchestrator = orchestrator(&config)?;
            let app = orchestrator.load_app(&orchestrator.ids().from_cli_arg(&arg.app)?)?;
            output::print_operation(orchestrator.stop(app), &mut stdout).await
        }
        Command::Restart(arg) => {
            let orchestrator = orchestrator(&config)?;
            let app = orchestrator.load_app(&orchestrator.ids().from_cli_arg(&arg.app)?)?;
            output::print_operation(orchestrator.restart(app), &mut stdout).await
        }
        Command::Destroy(arg) => {
            let orchestrator = orchestrator(&config)?;
            let app = orchestrator.load_app(&orchestrator.ids().from_cli_arg(&arg.app)?)?;
            output::print_operation(orchestrator.destroy(app), &mut stdout).await
        }
    }
}

async fn system<W: Write>(
    command: SystemCommand,
    config: &Config,
    out: &mut W,
) -> Result<(), CliError> {
    let updates = update_service(config);
    match command {
        SystemCommand::CheckUpgrade { only_first_party } => {
            let packages = updates
                .list_upgradable_packages(matcher(only_first_party))
                .await?;
            output::print_packages(&packages, out)?;
            Ok(())
        }
        SystemCommand::Upgrade { only_first_party } => {
            let subscription = updates.subscribe();
            match updates.check_and_upgrade(matcher(only_first_party)).await? {
                UpgradeOutcome::UpToDate => {
                    writeln!(out, "System is up to date")?;
                    Ok(())
                }
                UpgradeOutcome::Started(count) => {
                    log::info!("Upgrading {count} packages");
                    output::print_upgrade(subscription, out).await
                }
            }
        }
    }
}

async fn serve(config: Arc<Config>, listen: Option<std::net::SocketAddr>) -> Result<(), CliError> {
    let shutdown = signals::handle_shutdown()?;

    let state = Arc::new(api::ApiState {
        orchestrator: orchestrator(&config)?,
        updates: update_service(&config),
        config: config.clone(),
        shutdown: ShutdownSignal::new(),
    });

    let listener = tokio::net::TcpListener::bind(listen.unwrap_or(config.listen)).await?;
    signals::notify_ready();

    api::serve(listener, state, async {
        let _ = shutdown.await;
    })
    .await?;
    log::info!("Server stopped");
    Ok(())
}
