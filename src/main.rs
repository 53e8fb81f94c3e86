use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use cli::{AutotunnelCli, Command, RunArgs};
use config::{dns::SystemResolver, expand_home};
use tracing::{error, info, warn};
use tunneling::{
    check::run_checks,
    command::{LaunchCommand, check_command, find_executable, tunnel_command},
    group::{ProcessGroup, group_tunnels},
    supervisor::{STOP_GRACE, supervise},
    tunnel::{Tunnel, TunnelError, select_tunnels},
};

mod cli;
mod config;
mod logging;
mod tunneling;

#[tokio::main]
pub async fn main() -> ExitCode {
    let cli = AutotunnelCli::parse();
    if let Err(e) = logging::init_logging(cli.verbose, cli.log.as_deref()) {
        eprintln!("{e}");
        return ExitCode::from(e.exit_code());
    }
    let logs_to_file = cli.log.is_some();
    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e}");
            if logs_to_file {
                eprintln!("error: {e}");
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn execute(cli: AutotunnelCli) -> Result<u8, TunnelError> {
    let config_path = expand_home(cli.config.as_deref().unwrap_or(config::DEFAULT_PATH));
    let tunnels = config::load_tunnels(&config_path, &SystemResolver).await?;

    match cli.command {
        Command::Run(args) => run(tunnels, &args).await,
        Command::Config(selection) => {
            let selected = select_or_all(tunnels, &selection.tunnels)?;
            print!("{}", config::render_toml(&selected)?);
            Ok(0)
        }
        Command::Check(args) => {
            let groups = group_tunnels(select_or_all(tunnels, &args.selection.tunnels)?);
            let client = find_executable(&args.client)
                .ok_or_else(|| TunnelError::ClientNotFound(args.client.clone()))?;
            let commands: Vec<LaunchCommand> =
                groups.iter().map(|g| check_command(&client, g)).collect();
            let failures = run_checks(&commands)
                .await
                .iter()
                .filter(|result| result.error.is_some())
                .count();
            info!(checked = commands.len(), failures, "connectivity check done");
            Ok(if failures == 0 { 0 } else { 1 })
        }
        Command::Groups(args) => {
            let groups = group_tunnels(select_or_all(tunnels, &args.selection.tunnels)?);
            let client =
                find_executable(&args.client).unwrap_or_else(|| PathBuf::from(&args.client));
            for group in &groups {
                println!("# {}", group.label());
                for tunnel in &group.tunnels {
                    println!("#   {}: {}", tunnel.server_name, tunnel.describe());
                }
                println!("{}", tunnel_command(&client, group));
            }
            Ok(0)
        }
    }
}

/// Resolves what `run` should start; nothing is spawned when this fails.
fn plan_run(tunnels: Vec<Tunnel>, args: &RunArgs) -> Result<Vec<ProcessGroup>, TunnelError> {
    let selected = if args.all {
        tunnels
    } else {
        select_tunnels(tunnels, &args.tunnels)?
    };
    if selected.is_empty() {
        return Err(TunnelError::NoTunnels);
    }
    Ok(group_tunnels(selected))
}

/// Builds one client command per group, failing if the client cannot be found.
fn launch_commands(
    groups: &[ProcessGroup],
    client: &str,
) -> Result<Vec<LaunchCommand>, TunnelError> {
    let client =
        find_executable(client).ok_or_else(|| TunnelError::ClientNotFound(client.to_string()))?;
    info!(
        processes = groups.len(),
        tunnels = groups.iter().map(|g| g.tunnels.len()).sum::<usize>(),
        client = %client.display(),
        "starting tunnels"
    );
    Ok(groups.iter().map(|g| tunnel_command(&client, g)).collect())
}

async fn run(tunnels: Vec<Tunnel>, args: &RunArgs) -> Result<u8, TunnelError> {
    let groups = plan_run(tunnels, args)?;
    let commands = launch_commands(&groups, &args.client)?;
    let report = supervise(commands, shutdown_signal(), STOP_GRACE).await?;
    if !report.is_success() {
        warn!("at least one tunnel process failed");
    }
    Ok(report.exit_code())
}

fn select_or_all(tunnels: Vec<Tunnel>, identifiers: &[String]) -> Result<Vec<Tunnel>, TunnelError> {
    if identifiers.is_empty() {
        Ok(tunnels)
    } else {
        select_tunnels(tunnels, identifiers)
    }
}

/// Completes on ctrl-c, or on SIGTERM from a service manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("unable to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
