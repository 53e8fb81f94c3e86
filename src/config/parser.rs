use std::collections::BTreeMap;

use super::ConfigError;

/// A value inside a section: either a plain value or a nested section
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConfigNode {
    Scalar(String),
    Section(Section),
}

pub(crate) type Section = BTreeMap<String, ConfigNode>;

/// Parsed configuration, keyed by section header.
///
/// Sections come out of the parser flat (only scalars); nesting is built later
/// by the resolver from the `/`-delimited section names.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct ConfigTree {
    pub sections: BTreeMap<String, Section>,
}

/// One line of configuration text and the file position it was read from
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SourceLine {
    pub origin: String,
    /// 1-based line number inside `origin`
    pub number: usize,
    pub text: String,
}

/// Removes a `#` comment from a line, whether it spans the whole line or trails a value.
pub(crate) fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Returns the name inside a `[section]` header line.
pub(crate) fn section_name(line: &str) -> Option<&str> {
    let line = line.trim();
    line.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(str::trim)
}

/// Parses a single file's text, numbering lines from 1.
#[cfg(test)]
pub(crate) fn parse(content: &str, origin: &str) -> Result<ConfigTree, ConfigError> {
    let lines: Vec<SourceLine> = content
        .lines()
        .enumerate()
        .map(|(idx, text)| SourceLine {
            origin: origin.to_string(),
            number: idx + 1,
            text: text.to_string(),
        })
        .collect();
    parse_lines(&lines)
}

/// Parses lines that may come from several files; errors carry each line's own position.
pub(crate) fn parse_lines(lines: &[SourceLine]) -> Result<ConfigTree, ConfigError> {
    let mut tree = ConfigTree::default();
    let mut current: Option<String> = None;

    for source in lines {
        let syntax = |message: String| ConfigError::Syntax {
            origin: source.origin.clone(),
            line: source.number,
            message,
        };
        let line = source.text.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let line = strip_comment(line).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = section_name(line) {
            if name.is_empty() {
                return Err(syntax("empty section name".to_string()));
            }
            if tree.sections.contains_key(name) {
                return Err(syntax(format!("section [{name}] is defined twice")));
            }
            tree.sections.insert(name.to_string(), Section::new());
            current = Some(name.to_string());
            continue;
        }

        let Some(separator) = line.find(['=', ':']) else {
            return Err(syntax(format!("expected `key=value`, found {line:?}")));
        };
        let key = line[..separator].trim().to_lowercase();
        let value = line[separator + 1..].trim();
        if key.is_empty() {
            return Err(syntax(format!("missing key before value {value:?}")));
        }
        let Some(section_key) = current.as_ref() else {
            return Err(syntax(format!("`{key}` appears before any section header")));
        };
        let section = tree
            .sections
            .get_mut(section_key)
            .ok_or_else(|| syntax(format!("section [{section_key}] vanished")))?;
        if section.contains_key(&key) {
            return Err(syntax(format!(
                "`{key}` is defined twice in section [{section_key}]"
            )));
        }
        section.insert(key, ConfigNode::Scalar(value.to_string()));
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(value: &str) -> ConfigNode {
        ConfigNode::Scalar(value.to_string())
    }

    #[test]
    fn parses_sections_and_values() {
        let content = r#"
            # leading comment
            [global]
            user = alice
            Key: /home/alice/.ssh/id_ed25519   # trailing comment

            ; semicolon comment
            [web/admin]
            local_port=8001
        "#;
        let tree = parse(content, "test.conf").unwrap();
        assert_eq!(tree.sections.len(), 2);
        let global = &tree.sections["global"];
        assert_eq!(global["user"], scalar("alice"));
        assert_eq!(global["key"], scalar("/home/alice/.ssh/id_ed25519"));
        assert_eq!(tree.sections["web/admin"]["local_port"], scalar("8001"));
    }

    #[test]
    fn empty_section_is_kept() {
        let tree = parse("[alone]\n", "test.conf").unwrap();
        assert_eq!(tree.sections["alone"], Section::new());
    }

    #[test]
    fn value_before_section_is_rejected() {
        let err = parse("user=alice\n[a]\n", "test.conf").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { line: 1, .. }));
    }

    #[test]
    fn duplicate_section_reports_line() {
        let err = parse("[a]\nuser=x\n\n[a]\n", "dup.conf").unwrap_err();
        match err {
            ConfigError::Syntax { origin, line, .. } => {
                assert_eq!(origin, "dup.conf");
                assert_eq!(line, 4);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let err = parse("[a]\nuser=x\nUSER=y\n", "test.conf").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { line: 3, .. }));
    }

    #[test]
    fn malformed_line_is_rejected() {
        assert!(parse("[a]\njust some words\n", "test.conf").is_err());
        assert!(parse("[]\n", "test.conf").is_err());
        assert!(parse("[a]\n=value\n", "test.conf").is_err());
    }

    #[test]
    fn lines_from_several_files_keep_their_position() {
        let line = |origin: &str, number: usize, text: &str| SourceLine {
            origin: origin.to_string(),
            number,
            text: text.to_string(),
        };
        let lines = vec![
            line("root.conf", 4, "[srv]"),
            line("root.conf", 5, "user=bob"),
            line("conf.d/web.conf", 12, "broken"),
        ];
        match parse_lines(&lines).unwrap_err() {
            ConfigError::Syntax { origin, line, .. } => {
                assert_eq!(origin, "conf.d/web.conf");
                assert_eq!(line, 12);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn header_helpers() {
        assert_eq!(section_name("[ srv/tunnel ]"), Some("srv/tunnel"));
        assert_eq!(section_name("key=value"), None);
        assert_eq!(strip_comment("port=22 # ssh"), "port=22 ");
    }
}
