use std::path::{Path, PathBuf};

use dns::HostResolver;
use serde::Serialize;
use thiserror::Error;

use crate::tunneling::tunnel::Tunnel;

pub(crate) mod dns;
pub(crate) mod loader;
pub(crate) mod parser;
pub(crate) mod resolver;

pub const DEFAULT_PATH: &str = "~/.config/autotunnel.conf";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {} not found", .0.display())]
    NotFound(PathBuf),
    #[error("io error on {1}: {0}")]
    Io(std::io::Error, String),
    #[error("invalid include pattern {0:?}: {1}")]
    Glob(String, String),
    #[error("{0} includes itself")]
    IncludeCycle(String),
    #[error("{origin}:{line}: {message}")]
    Syntax {
        origin: String,
        line: usize,
        message: String,
    },
    #[error("invalid section name [{0}]")]
    InvalidSectionName(String),
    #[error("section [{section}] uses `{key}` both as a value and as a sub-section")]
    SectionConflict { section: String, key: String },
    #[error("unknown config option `{option}` in tunnel {tunnel}")]
    UnknownOption { tunnel: String, option: String },
    #[error("missing param `{field}` in tunnel {tunnel}")]
    MissingField { tunnel: String, field: &'static str },
    #[error("invalid value {value:?} for param `{field}` in tunnel {tunnel}")]
    InvalidValue {
        tunnel: String,
        field: String,
        value: String,
    },
    #[error("ssh key {} of tunnel {tunnel} does not exist", .path.display())]
    KeyNotFound { tunnel: String, path: PathBuf },
    #[error("local port {port} is used by both {first} and {second}")]
    DuplicateLocalPort {
        port: u16,
        first: String,
        second: String,
    },
    #[error("remote port {port} of server {server} is used by both {first} and {second}")]
    DuplicateRemotePort {
        server: String,
        port: u16,
        first: String,
        second: String,
    },
    #[error("unknown remote server '{host}' of tunnel {tunnel}: {reason}")]
    UnresolvedHost {
        tunnel: String,
        host: String,
        reason: String,
    },
    #[error("unable to render configuration: {0}")]
    Render(String),
}

/// Expands a leading `~` with the current user's home directory.
pub(crate) fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}

/// Loads `path` with its includes and resolves it into validated tunnels.
pub(crate) async fn load_tunnels(
    path: &Path,
    hosts: &dyn HostResolver,
) -> Result<Vec<Tunnel>, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let tree = loader::load(path)?;
    resolver::resolve(tree, hosts).await
}

#[derive(Serialize)]
struct ResolvedConfig<'a> {
    tunnels: &'a [Tunnel],
}

/// Renders resolved tunnels as `[[tunnels]]` TOML tables.
pub(crate) fn render_toml(tunnels: &[Tunnel]) -> Result<String, ConfigError> {
    toml::to_string(&ResolvedConfig { tunnels }).map_err(|e| ConfigError::Render(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::{fs, net::Ipv4Addr};

    use super::*;
    use crate::tunneling::tunnel::sample_tunnel;
    use dns::MockHostResolver;
    use mockall::predicate::*;

    #[test]
    fn home_is_expanded() {
        let Some(home) = std::env::var_os("HOME").map(PathBuf::from) else {
            return;
        };
        assert_eq!(expand_home("~/x.conf"), home.join("x.conf"));
        assert_eq!(expand_home("/etc/x.conf"), PathBuf::from("/etc/x.conf"));
        assert_eq!(expand_home("rel/~x"), PathBuf::from("rel/~x"));
    }

    #[tokio::test]
    async fn missing_config_file() {
        let hosts = MockHostResolver::new();
        let err = load_tunnels(Path::new("/definitely/not/here.conf"), &hosts)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[tokio::test]
    async fn loads_tunnels_through_includes() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        fs::write(&key, "key").unwrap();
        fs::create_dir(dir.path().join("servers")).unwrap();
        let root = dir.path().join("autotunnel.conf");
        fs::write(
            &root,
            format!(
                "[global]\nuser=alice\nkey={}\n\ninclude servers/*.conf\n",
                key.display()
            ),
        )
        .unwrap();
        fs::write(
            dir.path().join("servers/bastion.conf"),
            "server=10.0.0.7\n[grafana]\nlocal_port=8001\nremote_port=3000\n[prom]\nlocal_port=8002\nremote_port=9090\n",
        )
        .unwrap();

        let mut hosts = MockHostResolver::new();
        hosts
            .expect_resolve_ipv4()
            .with(eq("10.0.0.7"))
            .times(1)
            .returning(|_| Ok(Ipv4Addr::new(10, 0, 0, 7)));

        let tunnels = load_tunnels(&root, &hosts).await.unwrap();
        let names: Vec<&str> = tunnels.iter().map(|t| t.server_name.as_str()).collect();
        assert_eq!(names, vec!["bastion/grafana", "bastion/prom"]);
        assert!(tunnels.iter().all(|t| t.user == "alice" && t.key == key));
    }

    #[test]
    fn renders_tunnel_tables() {
        let rendered = render_toml(&[sample_tunnel("web", 8001, 80)]).unwrap();
        assert!(rendered.contains("[[tunnels]]"));
        assert!(rendered.contains("server_name = \"web\""));
        assert!(rendered.contains("local_port = 8001"));
        assert!(rendered.contains("server_ip = \"10.0.0.1\""));
    }
}
