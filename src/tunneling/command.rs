use std::{
    fmt,
    path::{Path, PathBuf},
};

use super::{group::ProcessGroup, tunnel::Tunnel};

/// Reliable-reconnect client spawned for every process group
pub(crate) const DEFAULT_CLIENT: &str = "autossh";
/// Plain client used for connectivity checks
pub(crate) const CHECK_CLIENT: &str = "ssh";
pub(crate) const PING_REPLY: &str = "ping_test";

/// A program and its argument vector, ready to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LaunchCommand {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program.to_string_lossy()))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// `-L` for forward tunnels, `-R` for reverse ones
pub(crate) fn forward_directive(tunnel: &Tunnel) -> [String; 2] {
    if tunnel.reverse {
        [
            String::from("-R"),
            format!(
                "{}:{}:{}:{}",
                tunnel.server_ip, tunnel.remote_port, tunnel.local_address, tunnel.local_port
            ),
        ]
    } else {
        [
            String::from("-L"),
            format!(
                "{}:{}:{}:{}",
                tunnel.local_address, tunnel.local_port, tunnel.server_ip, tunnel.remote_port
            ),
        ]
    }
}

/// Options shared by the tunnel client and the connectivity check
fn connection_args(group: &ProcessGroup) -> Vec<String> {
    let mut args = vec![String::from("-p"), group.ssh_port.to_string()];
    args.extend(group.ssh_options.iter().cloned());
    args.extend([
        String::from("-i"),
        group.key.to_string_lossy().into_owned(),
        String::from("-l"),
        group.user.clone(),
    ]);
    args
}

/// Builds the reconnecting client invocation carrying every tunnel of `group`.
pub(crate) fn tunnel_command(client: &Path, group: &ProcessGroup) -> LaunchCommand {
    // no autossh monitor port and no connection sharing: one session per process
    let mut args: Vec<String> = ["-M", "0", "-T", "-N", "-n", "-o", "ControlMaster=no"]
        .iter()
        .map(|a| a.to_string())
        .collect();
    args.extend(connection_args(group));
    args.push(format!("{}@{}", group.user, group.server_ip));
    for tunnel in &group.tunnels {
        args.extend(forward_directive(tunnel));
    }
    LaunchCommand {
        label: group.label(),
        program: client.to_path_buf(),
        args,
    }
}

/// Builds a one-shot login that only echoes [`PING_REPLY`] back.
pub(crate) fn check_command(client: &Path, group: &ProcessGroup) -> LaunchCommand {
    let mut args = vec![String::from("-o"), String::from("BatchMode=yes")];
    args.extend(connection_args(group));
    args.push(format!("{}@{}", group.user, group.server_ip));
    args.extend([String::from("echo"), PING_REPLY.to_string()]);
    LaunchCommand {
        label: group.label(),
        program: client.to_path_buf(),
        args,
    }
}

/// Looks `name` up the way a shell does: paths are taken as-is, bare names go through `PATH`.
pub(crate) fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
