//! Settings store: the process-wide configuration singleton.
//!
//! The store is the single writer for its interior state; readers always get
//! a cloned snapshot so a concurrent `set` can never expose a torn value.

mod apikey;
mod types;

pub use apikey::ApiKeyStore;
pub use types::Settings;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use tracing::info;

pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Load settings from `path`. A missing file is populated with defaults
    /// (parents created first); a present file is parsed onto a
    /// defaults-initialised value so missing keys keep their defaults.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<Settings>(&raw)
                .with_context(|| format!("failed to parse settings file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let defaults = Settings::default();
                write_settings_file(&path, &defaults)?;
                info!(path = %path.display(), "wrote default settings file");
                defaults
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read settings file {}", path.display()));
            }
        };

        Ok(Self {
            path,
            current: RwLock::new(settings),
        })
    }

    /// Snapshot of the current settings
    pub fn get(&self) -> Settings {
        self.current.read().expect("settings lock poisoned").clone()
    }

    /// Replace the current settings
    pub fn set(&self, settings: Settings) {
        *self.current.write().expect("settings lock poisoned") = settings;
    }

    /// Write `settings` to the backing file without installing them
    pub fn persist(&self, settings: &Settings) -> Result<()> {
        write_settings_file(&self.path, settings)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_settings_file(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create settings directory {}", parent.display()))?;
    }
    let raw = serde_json::to_vec_pretty(settings)?;
    fs::write(path, raw).with_context(|| format!("failed to write settings file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_writes_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::load(&path).unwrap();
        assert!(path.is_file());
        assert_eq!(store.get().http_port, ":8031");

        // File round-trips back through a fresh load.
        let again = SettingsStore::load(&path).unwrap();
        assert_eq!(again.get().fs_base_path, "/tmp/vestri");
    }

    #[test]
    fn test_load_merges_onto_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"http_port": ":9999", "require_tls": true}"#).unwrap();
        let store = SettingsStore::load(&path).unwrap();
        let s = store.get();
        assert_eq!(s.http_port, ":9999");
        assert!(s.require_tls);
        assert_eq!(s.fs_base_path, "/tmp/vestri");
    }

    #[test]
    fn test_set_then_get_returns_written_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json")).unwrap();
        let mut s = store.get();
        s.fs_base_path = "/srv/data".to_string();
        s.rate_limit_rps = 2.5;
        store.set(s.clone());
        let got = store.get();
        assert_eq!(got.fs_base_path, "/srv/data");
        assert_eq!(got.rate_limit_rps, 2.5);
    }

    #[test]
    fn test_persist_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json")).unwrap();
        let mut s = store.get();
        s.http_port = ":1234".to_string();
        store.persist(&s).unwrap();
        let reloaded = SettingsStore::load(store.path()).unwrap();
        assert_eq!(reloaded.get().http_port, ":1234");
    }
}
