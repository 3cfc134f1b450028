//! Credential file parsing.
//!
//! Channels and the container runner read their secrets from
//! `<data_dir>/env/env` instead of the process environment, so credentials
//! never leak into spawned children via inherited env vars.

use std::collections::HashMap;
use std::path::Path;

/// Parse the env file and return the values for the requested keys.
/// Missing file yields an empty map; a channel decides for itself whether
/// an absent credential is fatal.
pub fn read_env_file(path: &Path, keys: &[&str]) -> HashMap<String, String> {
    let all = read_all(path);
    keys.iter()
        .filter_map(|k| all.get(*k).map(|v| ((*k).to_string(), v.clone())))
        .collect()
}

/// Parse every `KEY=VALUE` entry in the env file.
pub fn read_all(path: &Path) -> HashMap<String, String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    parse(&content)
}

fn parse(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        out.insert(key.to_string(), value.to_string());
    }
    out
}
