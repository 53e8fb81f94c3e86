use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use super::{
    ConfigError,
    parser::{self, ConfigTree, SourceLine},
};

/// Reads `path`, splices every included file into it and parses the result.
///
/// Each included file is wrapped in a section named after its file stem and
/// all of its own section headers are moved under that namespace, so
/// `[tunnel]` inside `web.conf` becomes `[web/tunnel]`. The merged lines must
/// parse; a broken include only gets skipped. Syntax errors point at the file
/// and line the offending text was read from.
pub(crate) fn load(path: &Path) -> Result<ConfigTree, ConfigError> {
    parser::parse_lines(&merge(path)?)
}

/// Comment-free lines of `path` with every include expanded in place
fn merge(path: &Path) -> Result<Vec<SourceLine>, ConfigError> {
    let mut stack = Vec::new();
    load_file(path, &mut stack)
}

fn load_file(path: &Path, stack: &mut Vec<PathBuf>) -> Result<Vec<SourceLine>, ConfigError> {
    let canonical = path
        .canonicalize()
        .map_err(|e| ConfigError::Io(e, path.display().to_string()))?;
    if stack.contains(&canonical) {
        return Err(ConfigError::IncludeCycle(path.display().to_string()));
    }
    stack.push(canonical.clone());
    let result = expand_file(path, &canonical, stack);
    stack.pop();
    result
}

fn expand_file(
    path: &Path,
    canonical: &Path,
    stack: &mut Vec<PathBuf>,
) -> Result<Vec<SourceLine>, ConfigError> {
    let content = fs::read_to_string(canonical)
        .map_err(|e| ConfigError::Io(e, path.display().to_string()))?;
    let origin = path.display().to_string();
    // includes are relative to the including file, never to the process cwd
    let base_dir = canonical.parent().unwrap_or_else(|| Path::new("."));
    let mut merged = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = parser::strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        let here = SourceLine {
            origin: origin.clone(),
            number: idx + 1,
            text: line.to_string(),
        };
        let Some(pattern) = include_pattern(line) else {
            merged.push(here);
            continue;
        };
        for included in expand_include(base_dir, pattern)? {
            match load_include(&included, &here, stack) {
                Ok(lines) => merged.extend(lines),
                Err(e @ (ConfigError::Syntax { .. } | ConfigError::IncludeCycle(_))) => {
                    warn!(
                        include = %included.display(),
                        from = %origin,
                        line = here.number,
                        "skipping include: {e}"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(merged)
}

/// Loads one included file under its namespace header, which is attributed to
/// the `directive` that pulled it in.
fn load_include(
    path: &Path,
    directive: &SourceLine,
    stack: &mut Vec<PathBuf>,
) -> Result<Vec<SourceLine>, ConfigError> {
    let namespace = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let body = load_file(path, stack)?;

    let mut lines = Vec::with_capacity(body.len() + 1);
    lines.push(SourceLine {
        text: format!("[{namespace}]"),
        ..directive.clone()
    });
    for mut line in body {
        if let Some(name) = parser::section_name(&line.text) {
            line.text = format!("[{namespace}/{name}]");
        }
        lines.push(line);
    }
    parser::parse_lines(&lines)?;
    debug!(include = %path.display(), %namespace, "included config file");
    Ok(lines)
}

/// Matches `include <glob>`, `include=<glob>` and `include:<glob>`.
fn include_pattern(line: &str) -> Option<&str> {
    let keyword = line.get(..7)?;
    if !keyword.eq_ignore_ascii_case("include") {
        return None;
    }
    let rest = &line[7..];
    let first = rest.chars().next()?;
    if !(first.is_whitespace() || first == '=' || first == ':') {
        return None;
    }
    let pattern = rest[first.len_utf8()..].trim();
    let pattern = pattern
        .strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .or_else(|| pattern.strip_prefix('\'').and_then(|p| p.strip_suffix('\'')))
        .unwrap_or(pattern);
    (!pattern.is_empty()).then_some(pattern)
}

fn expand_include(base_dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, ConfigError> {
    let full_pattern = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        let escaped = glob::Pattern::escape(&base_dir.to_string_lossy());
        format!("{escaped}/{pattern}")
    };
    let entries = glob::glob(&full_pattern)
        .map_err(|e| ConfigError::Glob(pattern.to_string(), e.to_string()))?;

    let mut matched = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            let location = e.path().display().to_string();
            ConfigError::Io(e.into_error(), location)
        })?;
        if entry.is_file() {
            matched.push(entry);
        }
    }
    if matched.is_empty() {
        debug!(pattern = %full_pattern, "include matched no file");
    }
    Ok(matched)
}
