//! Per-client local state, kept outside the base directory (an attacker who
//! controls the base directory must not be able to tamper with it). Holds
//! the client id, the integrity bookkeeping file, the basedir registry used
//! for filesystem-id drift detection, and the encryption key fingerprint.

use crate::error::{ConfigError, Error, Result};
use crate::utils::write_atomically;
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const LOCAL_STATE_DIR_ENV: &str = "VEILFS_LOCAL_STATE_DIR";

pub struct LocalStateDir {
    root: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BasedirRegistry {
    /// canonical basedir path -> filesystem id (hex)
    basedirs: HashMap<String, String>,
}

impl LocalStateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$VEILFS_LOCAL_STATE_DIR`, or `~/.local/share/veilfs`.
    pub fn default_location() -> Result<Self> {
        if let Ok(dir) = std::env::var(LOCAL_STATE_DIR_ENV) {
            return Ok(Self::new(dir));
        }
        let home = std::env::var("HOME").map_err(|_| {
            Error::Config(ConfigError::InvalidFormat(format!(
                "cannot determine the local state directory; set {LOCAL_STATE_DIR_ENV} or HOME"
            )))
        })?;
        Ok(Self::new(
            Path::new(&home).join(".local").join("share").join("veilfs"),
        ))
    }

    fn filesystem_dir(&self, filesystem_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(filesystem_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// This client's id for the given filesystem; generated (nonzero,
    /// random) and persisted on first use.
    pub fn my_client_id(&self, filesystem_id: &str) -> Result<u32> {
        let path = self.filesystem_dir(filesystem_id)?.join("myClientId");
        match fs::read_to_string(&path) {
            Ok(content) => {
                let id = u32::from_str_radix(content.trim(), 16).map_err(|_| {
                    Error::Corruption(format!("invalid client id in {}", path.display()))
                })?;
                Ok(id)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let id = loop {
                    let id: u32 = rand::random();
                    if id != 0 {
                        break id;
                    }
                };
                write_atomically(&path, format!("{id:08x}").as_bytes())?;
                debug!("generated client id {id:08x} for filesystem {filesystem_id}");
                Ok(id)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn integrity_state_file(&self, filesystem_id: &str) -> Result<PathBuf> {
        Ok(self.filesystem_dir(filesystem_id)?.join("integritystate"))
    }

    /// Remembers which filesystem id lives in which base directory and
    /// fails if the id changed since the last time we opened that basedir
    /// (someone replaced the whole filesystem).
    pub fn check_and_update_basedir(
        &self,
        basedir: &Path,
        filesystem_id: &str,
        allow_replaced_filesystem: bool,
    ) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join("basedirs");
        let mut registry: BasedirRegistry = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == ErrorKind::NotFound => BasedirRegistry::default(),
            Err(err) => return Err(err.into()),
        };
        let key = basedir
            .canonicalize()
            .unwrap_or_else(|_| basedir.to_path_buf())
            .to_string_lossy()
            .into_owned();
        if let Some(known) = registry.basedirs.get(&key) {
            if known != filesystem_id && !allow_replaced_filesystem {
                return Err(ConfigError::FilesystemIdChanged.into());
            }
        }
        registry.basedirs.insert(key, filesystem_id.to_string());
        write_atomically(&path, &serde_json::to_vec_pretty(&registry)?)?;
        Ok(())
    }

    /// Compares (and on first open, records) a fingerprint of the block
    /// encryption key. A changed key with an unchanged filesystem id means
    /// the config file was swapped out underneath us.
    pub fn check_and_update_key_fingerprint(
        &self,
        filesystem_id: &str,
        encryption_key_hex: &str,
        allow_replaced_filesystem: bool,
    ) -> Result<()> {
        let path = self
            .filesystem_dir(filesystem_id)?
            .join("encryptionKey.fingerprint");
        let fingerprint = hex::encode(Sha256::digest(encryption_key_hex.as_bytes()));
        match fs::read_to_string(&path) {
            Ok(known) => {
                if known.trim() != fingerprint && !allow_replaced_filesystem {
                    return Err(ConfigError::EncryptionKeyChanged.into());
                }
            }
            Err(err) if err.kind() != ErrorKind::NotFound => return Err(err.into()),
            Err(_) => {}
        }
        write_atomically(&path, fingerprint.as_bytes())?;
        Ok(())
    }
}
