//! Durable runtime settings: the node and volume sets discovered at runtime.
//!
//! The document is a flat JSON object stored in
//! `<config_storage_path>/egmi-runtime-config.json`. Lists are stored as
//! comma-joined strings. All access goes through one lock, independent of
//! the cluster-mutation lock.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::SettingsError;
use crate::types::{Node, Volume};

/// File name of the settings document.
pub const RUNTIME_CONFIG_FILE: &str = "egmi-runtime-config.json";
/// Nodes learned from peer listings.
pub const DISCOVERED_NODES: &str = "discovered-nodes";
/// Nodes added explicitly by an operator.
pub const STATIC_NODES: &str = "static-nodes";
/// Volumes learned from node reports.
pub const DISCOVERED_VOLUMES: &str = "discovered-volumes";

/// The settings document.
pub type SettingsDocument = Map<String, Value>;

/// Lock-protected JSON settings file.
pub struct RuntimeSettings {
    path: PathBuf,
    lock: Mutex<()>,
}

fn split_list(value: Option<&Value>) -> BTreeSet<String> {
    value
        .and_then(Value::as_str)
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn join_list<'a>(items: impl IntoIterator<Item = &'a str>) -> String {
    items.into_iter().collect::<Vec<_>>().join(",")
}

impl RuntimeSettings {
    /// Settings stored under `storage_dir`.
    pub fn new(storage_dir: &Path) -> Self {
        Self {
            path: storage_dir.join(RUNTIME_CONFIG_FILE),
            lock: Mutex::new(()),
        }
    }

    /// Location of the settings document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<SettingsDocument, SettingsError> {
        if !self.path.exists() {
            return Ok(SettingsDocument::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(SettingsDocument::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn write(&self, doc: &SettingsDocument) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Reads the whole document; a missing file is an empty document.
    pub fn load(&self) -> Result<SettingsDocument, SettingsError> {
        let _guard = self.lock.lock();
        self.read()
    }

    /// Replaces the whole document.
    pub fn save(&self, doc: &SettingsDocument) -> Result<(), SettingsError> {
        let _guard = self.lock.lock();
        self.write(doc)
    }

    /// Read-modify-write under the settings lock. The document is saved only
    /// when `update` returns true.
    pub fn update_atomically<F>(&self, update: F) -> Result<bool, SettingsError>
    where
        F: FnOnce(&mut SettingsDocument) -> bool,
    {
        let _guard = self.lock.lock();
        let mut doc = self.read()?;
        let changed = update(&mut doc);
        if changed {
            self.write(&doc)?;
        }
        Ok(changed)
    }

    /// Entries of the list stored under `key`.
    pub fn list(&self, key: &str) -> Result<BTreeSet<String>, SettingsError> {
        Ok(split_list(self.load()?.get(key)))
    }

    /// Nodes stored under `key`.
    pub fn nodes(&self, key: &str) -> Result<BTreeSet<Node>, SettingsError> {
        Ok(self.list(key)?.into_iter().map(Node::from).collect())
    }

    /// Volumes stored under `key`.
    pub fn volumes(&self, key: &str) -> Result<BTreeSet<Volume>, SettingsError> {
        Ok(self.list(key)?.into_iter().map(Volume::new).collect())
    }

    /// Stores `items` under `key` if they differ from the stored value.
    /// Returns whether the document changed.
    pub fn replace_list<'a>(
        &self,
        key: &str,
        items: impl IntoIterator<Item = &'a str>,
    ) -> Result<bool, SettingsError> {
        let joined = join_list(items);
        self.update_atomically(|doc| {
            let current = doc.get(key).and_then(Value::as_str).unwrap_or_default();
            if current == joined {
                false
            } else {
                doc.insert(key.to_string(), Value::String(joined.clone()));
                true
            }
        })
    }

    /// Adds `item` to the list under `key`.
    pub fn add_to_list(&self, key: &str, item: &str) -> Result<bool, SettingsError> {
        self.update_atomically(|doc| {
            let mut list = split_list(doc.get(key));
            if !list.insert(item.to_string()) {
                return false;
            }
            doc.insert(
                key.to_string(),
                Value::String(join_list(list.iter().map(String::as_str))),
            );
            true
        })
    }

    /// Removes `item` from the list under `key`.
    pub fn remove_from_list(&self, key: &str, item: &str) -> Result<bool, SettingsError> {
        self.update_atomically(|doc| {
            let mut list = split_list(doc.get(key));
            if !list.remove(item) {
                return false;
            }
            doc.insert(
                key.to_string(),
                Value::String(join_list(list.iter().map(String::as_str))),
            );
            true
        })
    }
}
