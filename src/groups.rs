//! Registered-group map and per-group cursors.
//!
//! The registry is the in-memory authority during a run; the store column
//! `last_processed_at` is its durable shadow, written only on successful
//! cursor advances.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use regex::Regex;

use crate::types::RegisteredGroup;

/// Reserved folder name: `global` is the shared skills/config namespace and
/// must never be claimed by a group.
const RESERVED_FOLDERS: &[&str] = &["global"];

/// A folder is a filesystem-safe identifier: `[A-Za-z0-9_-]+`, no
/// traversal, not a reserved word.
pub fn is_valid_folder(folder: &str) -> bool {
    !folder.is_empty()
        && !RESERVED_FOLDERS.contains(&folder)
        && folder
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Case-insensitive trigger matcher: the trigger mention must appear as its
/// own word (start of message or after whitespace).
pub fn trigger_regex(trigger: &str) -> anyhow::Result<Regex> {
    let pattern = format!(r"(?i)(^|\s){}($|[\s[:punct:]])", regex::escape(trigger));
    Ok(Regex::new(&pattern)?)
}

pub struct GroupRegistry {
    groups: RwLock<HashMap<String, RegisteredGroup>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the whole map, e.g. from the store at startup.
    pub fn replace(&self, groups: Vec<RegisteredGroup>) {
        let mut map = self.groups.write().expect("group registry lock poisoned");
        map.clear();
        for group in groups {
            map.insert(group.jid.clone(), group);
        }
    }

    pub fn get(&self, jid: &str) -> Option<RegisteredGroup> {
        self.groups
            .read()
            .expect("group registry lock poisoned")
            .get(jid)
            .cloned()
    }

    pub fn is_registered(&self, jid: &str) -> bool {
        self.groups
            .read()
            .expect("group registry lock poisoned")
            .contains_key(jid)
    }

    pub fn find_by_folder(&self, folder: &str) -> Option<RegisteredGroup> {
        self.groups
            .read()
            .expect("group registry lock poisoned")
            .values()
            .find(|g| g.folder == folder)
            .cloned()
    }

    pub fn jids(&self) -> Vec<String> {
        self.groups
            .read()
            .expect("group registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.groups
            .read()
            .expect("group registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// In-memory cursor for a JID; empty string when nothing consumed yet.
    pub fn cursor(&self, jid: &str) -> String {
        self.groups
            .read()
            .expect("group registry lock poisoned")
            .get(jid)
            .map(|g| g.last_processed_at.clone())
            .unwrap_or_default()
    }

    pub fn set_cursor(&self, jid: &str, ts: &str) {
        if let Some(group) = self
            .groups
            .write()
            .expect("group registry lock poisoned")
            .get_mut(jid)
        {
            group.last_processed_at = ts.to_string();
        }
    }

    /// A task's group folder is resolvable when a registered group claims it
    /// and its working directory exists on disk.
    pub fn folder_resolvable(&self, groups_dir: &Path, folder: &str) -> bool {
        is_valid_folder(folder)
            && self.find_by_folder(folder).is_some()
            && groups_dir.join(folder).is_dir()
    }
}
