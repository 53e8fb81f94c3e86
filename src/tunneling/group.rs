use std::{net::Ipv4Addr, path::PathBuf};

use super::tunnel::Tunnel;

/// Tunnels sharing one ssh connection, hence one spawned client process
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcessGroup {
    pub key: PathBuf,
    pub server_ip: Ipv4Addr,
    pub user: String,
    pub ssh_port: u16,
    pub ssh_options: Vec<String>,
    /// in the order the resolver emitted them
    pub tunnels: Vec<Tunnel>,
}

impl ProcessGroup {
    fn for_tunnel(tunnel: Tunnel) -> Self {
        ProcessGroup {
            key: tunnel.key.clone(),
            server_ip: tunnel.server_ip,
            user: tunnel.user.clone(),
            ssh_port: tunnel.ssh_port,
            ssh_options: tunnel.ssh_options.clone(),
            tunnels: vec![tunnel],
        }
    }

    /// Whether `tunnel` can ride on this group's connection
    pub fn accepts(&self, tunnel: &Tunnel) -> bool {
        self.key == tunnel.key
            && self.server_ip == tunnel.server_ip
            && self.user == tunnel.user
            && self.ssh_port == tunnel.ssh_port
            && self.ssh_options == tunnel.ssh_options
    }

    /// `user@address` plus the servers it carries, for logs
    pub fn label(&self) -> String {
        let mut servers: Vec<&str> = Vec::new();
        for tunnel in &self.tunnels {
            if !servers.contains(&tunnel.group_name.as_str()) {
                servers.push(&tunnel.group_name);
            }
        }
        format!("{}@{} ({})", self.user, self.server_ip, servers.join(", "))
    }
}

/// Partitions tunnels into connection groups, keeping first-seen order for
/// both the groups and the tunnels inside them.
pub(crate) fn group_tunnels(tunnels: Vec<Tunnel>) -> Vec<ProcessGroup> {
    let mut groups: Vec<ProcessGroup> = Vec::new();
    for tunnel in tunnels {
        match groups.iter_mut().find(|group| group.accepts(&tunnel)) {
            Some(group) => group.tunnels.push(tunnel),
            None => groups.push(ProcessGroup::for_tunnel(tunnel)),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunneling::tunnel::sample_tunnel;

    #[test]
    fn same_connection_shares_a_group() {
        let groups = group_tunnels(vec![
            sample_tunnel("web/admin", 8001, 80),
            sample_tunnel("web/api", 8002, 81),
        ]);
        assert_eq!(groups.len(), 1);
        let ports: Vec<u16> = groups[0].tunnels.iter().map(|t| t.local_port).collect();
        assert_eq!(ports, vec![8001, 8002]);
    }

    #[test]
    fn any_differing_parameter_splits_groups() {
        let base = sample_tunnel("a", 8001, 80);
        let mut other_user = sample_tunnel("b", 8002, 80);
        other_user.user = String::from("bob");
        let mut other_key = sample_tunnel("c", 8003, 80);
        other_key.key = PathBuf::from("/keys/other");
        let mut other_ip = sample_tunnel("d", 8004, 80);
        other_ip.server_ip = Ipv4Addr::new(10, 0, 0, 2);
        let mut other_port = sample_tunnel("e", 8005, 80);
        other_port.ssh_port = 2222;
        let back_to_base = sample_tunnel("f", 8006, 80);

        let groups = group_tunnels(vec![
            base,
            other_user,
            other_key,
            other_ip,
            other_port,
            back_to_base,
        ]);
        assert_eq!(groups.len(), 5);
        let first: Vec<&str> = groups[0]
            .tunnels
            .iter()
            .map(|t| t.server_name.as_str())
            .collect();
        assert_eq!(first, vec!["a", "f"]);
        assert_eq!(groups[1].user, "bob");
    }

    #[test]
    fn grouping_is_deterministic() {
        let tunnels = vec![
            sample_tunnel("x", 8001, 1),
            sample_tunnel("y/one", 8002, 2),
            sample_tunnel("y/two", 8003, 3),
        ];
        assert_eq!(group_tunnels(tunnels.clone()), group_tunnels(tunnels));
    }

    #[test]
    fn label_lists_servers_once() {
        let groups = group_tunnels(vec![
            sample_tunnel("web/admin", 8001, 80),
            sample_tunnel("web/api", 8002, 81),
        ]);
        assert_eq!(groups[0].label(), "alice@10.0.0.1 (web)");
    }

    #[test]
    fn label_keeps_first_seen_order_across_interleaved_servers() {
        let groups = group_tunnels(vec![
            sample_tunnel("web/admin", 8001, 80),
            sample_tunnel("db", 8002, 5432),
            sample_tunnel("web/api", 8003, 81),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].label(), "alice@10.0.0.1 (web, db)");
    }
}
