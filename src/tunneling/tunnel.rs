use std::{net::Ipv4Addr, path::PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;

pub(crate) const DEFAULT_LOCAL_ADDRESS: Ipv4Addr = Ipv4Addr::new(127, 1, 1, 1);
pub(crate) const DEFAULT_SSH_PORT: u16 = 22;
pub(crate) const DEFAULT_SSH_OPTIONS: [&str; 4] = [
    "-o",
    "ServerAliveInterval=60",
    "-o",
    "ServerAliveCountMax=3",
];

/// One forwarded port, fully resolved from the configuration
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct Tunnel {
    /// section path of the tunnel (`server` or `server/sub`)
    pub server_name: String,
    /// top-level section the tunnel belongs to
    pub group_name: String,
    /// hostname the ssh connection goes to
    pub server_realname: String,
    /// resolved address of `server_realname`
    pub server_ip: Ipv4Addr,
    /// private key used to authenticate
    pub key: PathBuf,
    pub user: String,
    /// loopback address the local side binds to
    pub local_address: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
    /// remote port relays back to us instead of local port relaying out
    pub reverse: bool,
    pub ssh_port: u16,
    pub ssh_options: Vec<String>,
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("unknown tunnels: {}", .0.join(", "))]
    UnknownTunnels(Vec<String>),
    #[error("no tunnel configured")]
    NoTunnels,
    #[error("unable to locate `{0}` in PATH")]
    ClientNotFound(String),
    #[error("unable to spawn {1}: {0}")]
    Spawn(std::io::Error, String),
    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl TunnelError {
    /// Process exit code reported for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            TunnelError::Config(ConfigError::NotFound(_)) => 3,
            TunnelError::Config(_) | TunnelError::NoTunnels => 4,
            TunnelError::UnknownTunnels(_) => 5,
            TunnelError::ClientNotFound(_) | TunnelError::Spawn(_, _) => 6,
            TunnelError::Logging(_) => 7,
        }
    }
}

impl Tunnel {
    /// Whether `identifier` names this tunnel, its server or the server's address
    pub fn matches(&self, identifier: &str) -> bool {
        self.server_name == identifier
            || self.group_name == identifier
            || self.server_realname == identifier
            || self.server_ip.to_string() == identifier
    }

    /// `local ==> remote` for forward tunnels, `local <== remote` for reverse ones
    pub fn describe(&self) -> String {
        format!(
            "{}:{} {} {}:{}",
            self.local_address,
            self.local_port,
            if self.reverse { "<==" } else { "==>" },
            self.server_realname,
            self.remote_port
        )
    }
}

/// Keeps the tunnels named by `identifiers`, in configuration order.
///
/// Every identifier must match at least one tunnel.
pub(crate) fn select_tunnels(
    tunnels: Vec<Tunnel>,
    identifiers: &[String],
) -> Result<Vec<Tunnel>, TunnelError> {
    let unknown: Vec<String> = identifiers
        .iter()
        .filter(|id| !tunnels.iter().any(|t| t.matches(id)))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(TunnelError::UnknownTunnels(unknown));
    }
    Ok(tunnels
        .into_iter()
        .filter(|t| identifiers.iter().any(|id| t.matches(id)))
        .collect())
}

#[cfg(test)]
pub(crate) fn sample_tunnel(server_name: &str, local_port: u16, remote_port: u16) -> Tunnel {
    let group_name = server_name.split('/').next().unwrap_or(server_name);
    Tunnel {
        server_name: server_name.to_string(),
        group_name: group_name.to_string(),
        server_realname: group_name.to_string(),
        server_ip: Ipv4Addr::new(10, 0, 0, 1),
        key: PathBuf::from("/keys/id_ed25519"),
        user: String::from("alice"),
        local_address: DEFAULT_LOCAL_ADDRESS,
        local_port,
        remote_port,
        reverse: false,
        ssh_port: DEFAULT_SSH_PORT,
        ssh_options: DEFAULT_SSH_OPTIONS.iter().map(|o| o.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_matches_every_identifier_kind() {
        let mut other = sample_tunnel("db", 8003, 5432);
        other.server_realname = String::from("db.internal");
        other.server_ip = Ipv4Addr::new(10, 0, 0, 9);
        let tunnels = vec![
            sample_tunnel("web/admin", 8001, 80),
            sample_tunnel("web/api", 8002, 81),
            other,
        ];

        let by_group = select_tunnels(tunnels.clone(), &[String::from("web")]).unwrap();
        assert_eq!(by_group.len(), 2);

        let by_name = select_tunnels(tunnels.clone(), &[String::from("web/api")]).unwrap();
        assert_eq!(by_name[0].local_port, 8002);

        let by_host = select_tunnels(tunnels.clone(), &[String::from("db.internal")]).unwrap();
        assert_eq!(by_host[0].server_name, "db");

        let by_ip = select_tunnels(tunnels, &[String::from("10.0.0.9")]).unwrap();
        assert_eq!(by_ip[0].server_name, "db");
    }

    #[test]
    fn unknown_identifiers_are_all_reported() {
        let tunnels = vec![sample_tunnel("web", 8001, 80)];
        let err = select_tunnels(
            tunnels,
            &[String::from("web"), String::from("nope"), String::from("gone")],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "unknown tunnels: nope, gone");
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn describe_shows_direction() {
        let mut tunnel = sample_tunnel("web", 8001, 80);
        assert_eq!(tunnel.describe(), "127.1.1.1:8001 ==> web:80");
        tunnel.reverse = true;
        assert_eq!(tunnel.describe(), "127.1.1.1:8001 <== web:80");
    }

    #[test]
    fn exit_codes_are_distinct_per_failure_kind() {
        let missing = TunnelError::from(ConfigError::NotFound(PathBuf::from("/nope")));
        let invalid = TunnelError::from(ConfigError::Render(String::from("x")));
        let client = TunnelError::ClientNotFound(String::from("autossh"));
        assert_eq!(missing.exit_code(), 3);
        assert_eq!(invalid.exit_code(), 4);
        assert_eq!(client.exit_code(), 6);
    }
}
