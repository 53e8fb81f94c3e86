use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::tunneling::command::{CHECK_CLIENT, DEFAULT_CLIENT};

#[derive(Parser, Debug)]
#[command(version, about = "Autotunnel keeps groups of SSH tunnels running from one hierarchical config file", long_about = None)]
pub(crate) struct AutotunnelCli {
    /// custom config file
    #[arg(short, long, global = true)]
    pub config: Option<String>,
    /// append logs to this file instead of stderr
    #[arg(short, long, global = true)]
    pub log: Option<PathBuf>,
    /// more logs (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// start tunnels and supervise them until every process exits
    Run(RunArgs),
    /// print the resolved tunnels as TOML
    Config(Selection),
    /// check that every connection can log in
    Check(CheckArgs),
    /// print the client command of every process group without running it
    Groups(GroupsArgs),
}

#[derive(Args, Debug)]
pub(crate) struct Selection {
    /// server names, tunnel names or server addresses (all tunnels when empty)
    pub tunnels: Vec<String>,
}

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// start every configured tunnel
    #[arg(short, long, conflicts_with = "tunnels")]
    pub all: bool,
    /// reconnecting ssh client to spawn
    #[arg(long, default_value = DEFAULT_CLIENT)]
    pub client: String,
    /// server names, tunnel names or server addresses to start
    #[arg(required_unless_present = "all")]
    pub tunnels: Vec<String>,
}

#[derive(Args, Debug)]
pub(crate) struct CheckArgs {
    /// ssh client used for the login test
    #[arg(long, default_value = CHECK_CLIENT)]
    pub client: String,
    #[command(flatten)]
    pub selection: Selection,
}

#[derive(Args, Debug)]
pub(crate) struct GroupsArgs {
    /// reconnecting ssh client the commands are built for
    #[arg(long, default_value = DEFAULT_CLIENT)]
    pub client: String,
    #[command(flatten)]
    pub selection: Selection,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        AutotunnelCli::command().debug_assert();
    }

    #[test]
    fn run_takes_names_or_all() {
        let cli = AutotunnelCli::try_parse_from(["autotunnel", "run", "web", "db"]).unwrap();
        match cli.command {
            Command::Run(args) => {
                assert!(!args.all);
                assert_eq!(args.tunnels, vec!["web", "db"]);
                assert_eq!(args.client, "autossh");
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = AutotunnelCli::try_parse_from(["autotunnel", "-c", "/etc/t.conf", "run", "--all"])
            .unwrap();
        assert_eq!(cli.config.as_deref(), Some("/etc/t.conf"));
        assert!(matches!(cli.command, Command::Run(RunArgs { all: true, .. })));
    }

    #[test]
    fn run_rejects_both_or_neither() {
        assert!(AutotunnelCli::try_parse_from(["autotunnel", "run"]).is_err());
        assert!(AutotunnelCli::try_parse_from(["autotunnel", "run", "--all", "web"]).is_err());
    }

    #[test]
    fn global_options_after_subcommand() {
        let cli =
            AutotunnelCli::try_parse_from(["autotunnel", "config", "web", "-vv", "--log", "/tmp/t.log"])
                .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log, Some(PathBuf::from("/tmp/t.log")));
        match cli.command {
            Command::Config(selection) => assert_eq!(selection.tunnels, vec!["web"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn check_defaults_to_plain_ssh() {
        let cli = AutotunnelCli::try_parse_from(["autotunnel", "check"]).unwrap();
        match cli.command {
            Command::Check(args) => {
                assert_eq!(args.client, "ssh");
                assert!(args.selection.tunnels.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
