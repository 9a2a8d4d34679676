//! API key bootstrap and storage.
//!
//! The key file is the durable source of the shared secret. On first boot a
//! 32-byte random key is generated, hex-encoded and persisted at mode 0600;
//! subsequent boots load it back.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use rand::RngCore;

pub struct ApiKeyStore {
    path: PathBuf,
    key: RwLock<String>,
}

impl ApiKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            key: RwLock::new(String::new()),
        }
    }

    /// Current key snapshot; empty means unauthenticated legacy mode
    pub fn get(&self) -> String {
        self.key.read().expect("api key lock poisoned").clone()
    }

    fn set(&self, key: String) {
        *self.key.write().expect("api key lock poisoned") = key;
    }

    /// Ensure a usable key exists: prefer the in-memory key, then the key
    /// file, then generate a fresh one. Returns `(key, generated)`.
    pub fn ensure(&self) -> Result<(String, bool)> {
        let key = self.get().trim().to_string();
        if !key.is_empty() {
            self.write_key_file(&key)?;
            return Ok((key, false));
        }

        match self.read_key_file() {
            Ok(file_key) if !file_key.is_empty() => {
                self.set(file_key.clone());
                return Ok((file_key, false));
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read API key file {}", self.path.display()));
            }
        }

        let new_key = generate_api_key();
        self.write_key_file(&new_key)?;
        self.set(new_key.clone());
        Ok((new_key, true))
    }

    /// Replace the key. An empty key clears the store and removes the file,
    /// returning the worker to legacy unauthenticated mode.
    pub fn update(&self, key: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            self.set(String::new());
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove API key file {}", self.path.display()));
                }
            }
            return Ok(());
        }

        self.write_key_file(key)?;
        self.set(key.to_string());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_key_file(&self) -> std::io::Result<String> {
        let raw = fs::read_to_string(&self.path)?;
        Ok(raw.trim().to_string())
    }

    fn write_key_file(&self, key: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create key directory {}", parent.display()))?;
        }

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)
                .with_context(|| format!("failed to open API key file {}", self.path.display()))?;
            file.write_all(format!("{key}\n").as_bytes())?;
            // The open mode only applies on create; an existing file keeps
            // its permissions, so tighten explicitly.
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        #[cfg(not(unix))]
        {
            fs::write(&self.path, format!("{key}\n"))
                .with_context(|| format!("failed to write API key file {}", self.path.display()))?;
        }

        Ok(())
    }
}

fn generate_api_key() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
