use super::encryptor::{self, ConfigEncryptor};
use super::key_provider::KeyProvider;
use super::{Config, OUR_VERSION};
use crate::cipher::{cipher_is_aead, cipher_key_size, EncryptionKey, DEFAULT_CIPHER};
use crate::error::{ConfigError, Error, Result};
use crate::utils::write_atomically;
use log::{info, warn};
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_BLOCKSIZE_BYTES: u64 = 32832;

#[derive(Debug, Clone)]
pub struct ConfigCreateSettings {
    pub cipher: String,
    pub blocksize_bytes: u64,
    pub exclusive_client_id: Option<u32>,
}

impl Default for ConfigCreateSettings {
    fn default() -> Self {
        Self {
            cipher: DEFAULT_CIPHER.to_string(),
            blocksize_bytes: DEFAULT_BLOCKSIZE_BYTES,
            exclusive_client_id: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Fail if the filesystem doesn't use this cipher (`--cipher` given for
    /// an existing filesystem).
    pub expected_cipher: Option<String>,
    pub allow_filesystem_upgrade: bool,
}

/// A decrypted config bound to its file location and encryption keys, so
/// changes (e.g. recording the root blob id) can be written back.
pub struct ConfigFile {
    path: PathBuf,
    config: Config,
    encryptor: ConfigEncryptor,
    created: bool,
}

impl ConfigFile {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Whether `load_or_create` created a fresh filesystem.
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn save(&self) -> Result<()> {
        let encrypted = self.encryptor.encrypt(&self.config.save()?)?;
        write_atomically(&self.path, &encrypted)?;
        Ok(())
    }
}

/// Opens the config file, creating a fresh filesystem if there is none yet.
pub fn load_or_create(
    path: &Path,
    key_provider: &dyn KeyProvider,
    create_settings: &ConfigCreateSettings,
    options: &LoadOptions,
) -> Result<ConfigFile> {
    if path.exists() {
        load(path, key_provider, options)
    } else {
        create(path, key_provider, create_settings)
    }
}

fn create(
    path: &Path,
    key_provider: &dyn KeyProvider,
    settings: &ConfigCreateSettings,
) -> Result<ConfigFile> {
    let key_size = cipher_key_size(&settings.cipher)?;
    if !cipher_is_aead(&settings.cipher)? {
        warn!(
            "cipher {} does not authenticate its ciphertext; manipulations are only caught by the integrity layer",
            settings.cipher
        );
    }

    let derived = key_provider.request_key_for_new_filesystem()?;
    let mut filesystem_id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut filesystem_id);

    let config = Config {
        root_blob: String::new(),
        key: EncryptionKey::generate(key_size).to_hex(),
        cipher: settings.cipher.clone(),
        version: OUR_VERSION.to_string(),
        created_with_version: OUR_VERSION.to_string(),
        last_opened_with_version: OUR_VERSION.to_string(),
        blocksize_bytes: settings.blocksize_bytes,
        filesystem_id: hex::encode_upper(filesystem_id),
        exclusive_client_id: settings.exclusive_client_id,
    };

    let config_file = ConfigFile {
        path: path.to_path_buf(),
        config,
        encryptor: ConfigEncryptor::new(derived.key.as_ref(), &settings.cipher, derived.settings)?,
        created: true,
    };
    config_file.save()?;
    info!("created new filesystem {}", config_file.config.filesystem_id);
    Ok(config_file)
}

fn load(path: &Path, key_provider: &dyn KeyProvider, options: &LoadOptions) -> Result<ConfigFile> {
    let file_content = fs::read(path)?;
    let (kdf_settings, outer_ciphertext) = encryptor::parse_container(&file_content)?;
    let derived_key = key_provider.request_key_for_existing_filesystem(&kdf_settings)?;
    let (cipher_name, config_json) = encryptor::decrypt_container(derived_key.as_ref(), outer_ciphertext)?;

    let mut config = Config::load(&config_json)?;
    if config.cipher != cipher_name {
        return Err(ConfigError::InvalidFormat(format!(
            "config says cipher {} but was encrypted with {cipher_name}",
            config.cipher
        ))
        .into());
    }
    if let Some(expected) = &options.expected_cipher {
        if *expected != config.cipher {
            return Err(ConfigError::InvalidFormat(format!(
                "filesystem uses cipher {}, but {expected} was requested",
                config.cipher
            ))
            .into());
        }
    }

    check_and_migrate_version(&mut config, options.allow_filesystem_upgrade)?;

    let config_file = ConfigFile {
        path: path.to_path_buf(),
        config,
        encryptor: ConfigEncryptor::new(derived_key.as_ref(), &cipher_name, kdf_settings)?,
        created: false,
    };
    // Record that this version opened the filesystem.
    config_file.save()?;
    Ok(config_file)
}

fn check_and_migrate_version(config: &mut Config, allow_upgrade: bool) -> Result<()> {
    if version_is_newer(&config.version, OUR_VERSION) {
        return Err(Error::Config(ConfigError::TooNewFilesystemFormat {
            created_with: config.version.clone(),
            our_version: OUR_VERSION.to_string(),
        }));
    }
    if version_is_newer(OUR_VERSION, &config.version) {
        if !allow_upgrade {
            return Err(Error::Config(ConfigError::FilesystemUpgradeRequired {
                last_opened_with: config.last_opened_with_version.clone(),
            }));
        }
        info!(
            "upgrading filesystem format from {} to {OUR_VERSION}",
            config.version
        );
        config.version = OUR_VERSION.to_string();
    }
    config.last_opened_with_version = OUR_VERSION.to_string();
    Ok(())
}

fn parse_version(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|component| {
            let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Numeric component-wise comparison; `1.10 > 1.9`, trailing zeros ignored.
fn version_is_newer(a: &str, b: &str) -> bool {
    let a = parse_version(a);
    let b = parse_version(b);
    for i in 0..usize::max(a.len(), b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x > y;
        }
    }
    false
}
