use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
    path::PathBuf,
};

use tracing::{debug, info};

use super::{
    ConfigError,
    dns::HostResolver,
    expand_home,
    parser::{ConfigNode, ConfigTree, Section},
};
use crate::tunneling::tunnel::{
    DEFAULT_LOCAL_ADDRESS, DEFAULT_SSH_OPTIONS, DEFAULT_SSH_PORT, Tunnel,
};

/// Sections whose keys become defaults of every server. `global` wins over `common`.
const DEFAULT_SECTIONS: [&str; 2] = ["common", "global"];
const PATH_SEPARATOR: char = '/';

/// Scalar keys of a section that has no sub-section, before validation
#[derive(Debug, Clone, PartialEq)]
struct TunnelEntry {
    server_name: String,
    group_name: String,
    fields: BTreeMap<String, String>,
}

/// Tunnel fields that are checked but whose server is not resolved yet
#[derive(Debug)]
struct TunnelDraft {
    server_name: String,
    group_name: String,
    server_realname: String,
    key: PathBuf,
    user: String,
    local_address: Ipv4Addr,
    local_port: u16,
    remote_port: u16,
    reverse: bool,
    ssh_port: u16,
    ssh_options: Vec<String>,
}

/// Applies section inheritance and turns the tree into validated tunnels.
///
/// Output order follows the sorted section names.
pub(crate) async fn resolve(
    tree: ConfigTree,
    hosts: &dyn HostResolver,
) -> Result<Vec<Tunnel>, ConfigError> {
    let servers = build_server_tree(tree)?;

    let mut entries = Vec::new();
    for (name, section) in &servers {
        flatten(name, name, section, &mut entries);
    }

    let drafts = entries
        .iter()
        .map(check_entry)
        .collect::<Result<Vec<_>, _>>()?;
    check_port_collisions(&drafts)?;

    let mut addresses: HashMap<String, Ipv4Addr> = HashMap::new();
    let mut tunnels = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let server_ip = match addresses.get(&draft.server_realname) {
            Some(address) => *address,
            None => {
                let address = hosts
                    .resolve_ipv4(&draft.server_realname)
                    .await
                    .map_err(|e| ConfigError::UnresolvedHost {
                        tunnel: draft.server_name.clone(),
                        host: draft.server_realname.clone(),
                        reason: e.to_string(),
                    })?;
                debug!(host = %draft.server_realname, %address, "resolved server");
                addresses.insert(draft.server_realname.clone(), address);
                address
            }
        };
        tunnels.push(Tunnel {
            server_name: draft.server_name,
            group_name: draft.group_name,
            server_realname: draft.server_realname,
            server_ip,
            key: draft.key,
            user: draft.user,
            local_address: draft.local_address,
            local_port: draft.local_port,
            remote_port: draft.remote_port,
            reverse: draft.reverse,
            ssh_port: draft.ssh_port,
            ssh_options: draft.ssh_options,
        });
    }
    info!(tunnels = tunnels.len(), "configuration resolved");
    Ok(tunnels)
}

/// Copies every scalar of `parent` that `child` does not define yet.
fn inherit(parent: &Section, mut child: Section) -> Section {
    for (key, value) in parent {
        if let ConfigNode::Scalar(_) = value {
            child.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    child
}

fn scalars(section: &Section) -> Section {
    section
        .iter()
        .filter(|(_, value)| matches!(value, ConfigNode::Scalar(_)))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Folds the flat parsed sections into one nested section per server.
fn build_server_tree(tree: ConfigTree) -> Result<BTreeMap<String, Section>, ConfigError> {
    let mut sections = tree.sections;

    let mut defaults = Section::new();
    for name in DEFAULT_SECTIONS {
        if let Some(section) = sections.remove(name) {
            defaults.extend(scalars(&section));
        }
    }

    let (nested, roots): (Vec<_>, Vec<_>) = sections
        .into_iter()
        .partition(|(name, _)| name.contains(PATH_SEPARATOR));

    let mut servers: BTreeMap<String, Section> = roots
        .into_iter()
        .map(|(name, section)| {
            let section = inherit(&defaults, section);
            (name, section)
        })
        .collect();

    let mut nested = nested;
    // parents have fewer separators, so they are always folded before their children
    nested.sort_by(|(a, _), (b, _)| {
        let depth = |name: &str| name.matches(PATH_SEPARATOR).count();
        depth(a).cmp(&depth(b)).then_with(|| a.cmp(b))
    });

    for (name, explicit) in nested {
        let mut components = name.split(PATH_SEPARATOR);
        let root = components.next().unwrap_or_default();
        let path: Vec<&str> = components.collect();
        // defaults sections are flat, they never become servers
        if root.is_empty()
            || DEFAULT_SECTIONS.contains(&root)
            || path.iter().any(|component| component.is_empty())
        {
            return Err(ConfigError::InvalidSectionName(name));
        }

        let mut node = servers
            .entry(root.to_string())
            .or_insert_with(|| inherit(&defaults, Section::new()));
        let mut node_name = root.to_string();
        for component in path {
            let parent_scalars = scalars(node);
            let child = node
                .entry(component.to_string())
                .or_insert_with(|| ConfigNode::Section(Section::new()));
            let ConfigNode::Section(child_section) = child else {
                return Err(ConfigError::SectionConflict {
                    section: node_name,
                    key: component.to_string(),
                });
            };
            *child_section = inherit(&parent_scalars, std::mem::take(child_section));
            node = child_section;
            node_name = format!("{node_name}{PATH_SEPARATOR}{component}");
        }

        for (key, value) in explicit {
            if let Some(ConfigNode::Section(_)) = node.get(&key) {
                return Err(ConfigError::SectionConflict { section: name, key });
            }
            node.insert(key, value);
        }
    }
    Ok(servers)
}

/// Sections holding sub-sections expand into their children, the others are tunnels.
fn flatten(path: &str, group_name: &str, section: &Section, out: &mut Vec<TunnelEntry>) {
    let children: Vec<(&String, &Section)> = section
        .iter()
        .filter_map(|(key, value)| match value {
            ConfigNode::Section(child) => Some((key, child)),
            ConfigNode::Scalar(_) => None,
        })
        .collect();

    if children.is_empty() {
        if section.is_empty() {
            debug!(section = path, "skipping empty section");
            return;
        }
        let fields = section
            .iter()
            .filter_map(|(key, value)| match value {
                ConfigNode::Scalar(v) => Some((key.clone(), v.clone())),
                ConfigNode::Section(_) => None,
            })
            .collect();
        out.push(TunnelEntry {
            server_name: path.to_string(),
            group_name: group_name.to_string(),
            fields,
        });
        return;
    }
    for (name, child) in children {
        flatten(
            &format!("{path}{PATH_SEPARATOR}{name}"),
            group_name,
            child,
            out,
        );
    }
}

fn check_entry(entry: &TunnelEntry) -> Result<TunnelDraft, ConfigError> {
    let tunnel = &entry.server_name;
    let invalid = |field: &str, value: &str| ConfigError::InvalidValue {
        tunnel: tunnel.clone(),
        field: field.to_string(),
        value: value.to_string(),
    };

    let mut key = None;
    let mut user = None;
    let mut local_port = None;
    let mut remote_port = None;
    let mut reverse = false;
    let mut server_realname = entry.group_name.clone();
    let mut local_address = DEFAULT_LOCAL_ADDRESS;
    let mut ssh_port = DEFAULT_SSH_PORT;
    let mut ssh_options: Vec<String> = DEFAULT_SSH_OPTIONS.iter().map(|o| o.to_string()).collect();

    for (option, value) in &entry.fields {
        let (option, value) = (option.as_str(), value.as_str());
        match option {
            "key" | "ssh_key" => {
                if value.is_empty() {
                    return Err(invalid(option, value));
                }
                key = Some(expand_home(value));
            }
            "user" | "ssh_user" => {
                if !is_valid_user(value) {
                    return Err(invalid(option, value));
                }
                user = Some(value.to_string());
            }
            "local_port" => local_port = Some(parse_port(value).ok_or_else(|| invalid(option, value))?),
            "remote_port" => {
                remote_port = Some(parse_port(value).ok_or_else(|| invalid(option, value))?)
            }
            "ssh_port" => ssh_port = parse_port(value).ok_or_else(|| invalid(option, value))?,
            "reverse" => reverse = parse_bool(value).ok_or_else(|| invalid(option, value))?,
            "server" => {
                if value.is_empty() {
                    return Err(invalid(option, value));
                }
                server_realname = value.to_string();
            }
            "local_address" => {
                local_address = value
                    .parse::<Ipv4Addr>()
                    .ok()
                    .filter(Ipv4Addr::is_loopback)
                    .ok_or_else(|| invalid(option, value))?;
            }
            "ssh_options" => {
                let words = split_words(value).ok_or_else(|| invalid(option, value))?;
                ssh_options = with_keepalive(words);
            }
            _ => {
                return Err(ConfigError::UnknownOption {
                    tunnel: tunnel.clone(),
                    option: option.to_string(),
                });
            }
        }
    }

    let missing = |field: &'static str| ConfigError::MissingField {
        tunnel: tunnel.clone(),
        field,
    };
    let key = key.ok_or_else(|| missing("key"))?;
    let user = user.ok_or_else(|| missing("user"))?;
    let local_port = local_port.ok_or_else(|| missing("local_port"))?;
    let remote_port = remote_port.ok_or_else(|| missing("remote_port"))?;
    if !key.exists() {
        return Err(ConfigError::KeyNotFound {
            tunnel: tunnel.clone(),
            path: key,
        });
    }

    Ok(TunnelDraft {
        server_name: entry.server_name.clone(),
        group_name: entry.group_name.clone(),
        server_realname,
        key,
        user,
        local_address,
        local_port,
        remote_port,
        reverse,
        ssh_port,
        ssh_options,
    })
}

/// Local ports share one host so they must be unique everywhere; remote ports only per server.
fn check_port_collisions(drafts: &[TunnelDraft]) -> Result<(), ConfigError> {
    let mut local_ports: HashMap<u16, &str> = HashMap::new();
    let mut remote_ports: HashMap<(&str, u16), &str> = HashMap::new();
    for draft in drafts {
        if let Some(first) = local_ports.insert(draft.local_port, draft.server_name.as_str()) {
            return Err(ConfigError::DuplicateLocalPort {
                port: draft.local_port,
                first: first.to_string(),
                second: draft.server_name.clone(),
            });
        }
        if let Some(first) =
            remote_ports.insert((draft.group_name.as_str(), draft.remote_port), draft.server_name.as_str())
        {
            return Err(ConfigError::DuplicateRemotePort {
                server: draft.group_name.clone(),
                port: draft.remote_port,
                first: first.to_string(),
                second: draft.server_name.clone(),
            });
        }
    }
    Ok(())
}

fn parse_port(value: &str) -> Option<u16> {
    value.parse::<u16>().ok().filter(|port| *port > 0)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// POSIX-style login: `[a-z_][a-z0-9_-]{0,31}`, optionally ending with `$`.
fn is_valid_user(value: &str) -> bool {
    let name = value.strip_suffix('$').unwrap_or(value);
    let limit = if name.len() < value.len() { 31 } else { 32 };
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= limit
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Appends every keepalive default the user's options do not set themselves.
fn with_keepalive(mut options: Vec<String>) -> Vec<String> {
    for pair in DEFAULT_SSH_OPTIONS.chunks(2) {
        let [flag, setting] = pair else { continue };
        let name = setting.split('=').next().unwrap_or_default().to_ascii_lowercase();
        let already_set = options.iter().any(|word| {
            word.trim_start_matches("-o")
                .trim_start()
                .to_ascii_lowercase()
                .starts_with(&name)
        });
        if !already_set {
            options.extend([flag.to_string(), setting.to_string()]);
        }
    }
    options
}

/// Splits a word list the way a shell would, honouring single and double quotes.
fn split_words(value: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    for c in value.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return None;
    }
    if in_word {
        words.push(current);
    }
    Some(words)
}
