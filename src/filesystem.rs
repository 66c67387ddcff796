//! Wires the whole stack together: config bootstrap, local-state checks,
//! block store layering, blob stores, and the device on top.

use crate::blockstore::caching::CachingBlockStore;
use crate::blockstore::encrypted::EncryptedBlockStore;
use crate::blockstore::integrity::{IntegrityBlockStore, IntegrityConfig, KnownBlockVersions};
use crate::blockstore::ondisk::OnDiskBlockStore;
use crate::blockstore::parallel::ParallelAccessBlockStore;
use crate::blockstore::BlockId;
use crate::cipher::{new_cipher, EncryptionKey};
use crate::config::key_provider::KeyProvider;
use crate::config::{self, ConfigCreateSettings, ConfigFile, LoadOptions};
use crate::error::Result;
use crate::fs::{AtimeUpdateBehavior, Device};
use crate::fsblobstore::parallel::ParallelAccessFsBlobStore;
use crate::localstate::LocalStateDir;
use log::info;
use std::path::{Path, PathBuf};

/// The concrete store stack under a mounted filesystem:
/// on-disk -> encryption -> integrity -> caching (-> parallel access).
pub type BlockStack = CachingBlockStore<IntegrityBlockStore<EncryptedBlockStore<OnDiskBlockStore>>>;

pub const CONFIG_FILE_NAME: &str = "veilfs.config";

#[derive(Debug, Clone)]
pub struct FilesystemOptions {
    pub basedir: PathBuf,
    /// Defaults to `<basedir>/veilfs.config`.
    pub config_path: Option<PathBuf>,
    /// Cipher for a newly created filesystem; for an existing one, a
    /// mismatch is an error.
    pub cipher: Option<String>,
    pub blocksize_bytes: u64,
    /// Treat integrity violations as warnings and keep going.
    pub allow_integrity_violations: bool,
    pub allow_filesystem_upgrade: bool,
    /// Accept a basedir whose filesystem id or key changed since last time.
    pub allow_replaced_filesystem: bool,
    /// Bind a newly created filesystem to this client; blocks missing from
    /// the base directory then become integrity violations.
    pub exclusive_client: bool,
    pub atime_behavior: AtimeUpdateBehavior,
}

impl FilesystemOptions {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        Self {
            basedir: basedir.into(),
            config_path: None,
            cipher: None,
            blocksize_bytes: config::DEFAULT_BLOCKSIZE_BYTES,
            allow_integrity_violations: false,
            allow_filesystem_upgrade: false,
            allow_replaced_filesystem: false,
            exclusive_client: false,
            atime_behavior: AtimeUpdateBehavior::default(),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| self.basedir.join(CONFIG_FILE_NAME))
    }
}

/// An opened filesystem. Dropping it tears the stack down top-first,
/// flushing caches and persisting the integrity state.
pub struct Veilfs {
    device: Device<BlockStack>,
    config: ConfigFile,
}

impl Veilfs {
    /// Opens the filesystem in `options.basedir`, creating it (config file
    /// and root directory) if none exists there yet.
    pub fn open(
        options: &FilesystemOptions,
        key_provider: &dyn KeyProvider,
        local_state: &LocalStateDir,
    ) -> Result<Self> {
        let create_settings = ConfigCreateSettings {
            cipher: options
                .cipher
                .clone()
                .unwrap_or_else(|| crate::cipher::DEFAULT_CIPHER.to_string()),
            blocksize_bytes: options.blocksize_bytes,
            exclusive_client_id: None,
        };
        let load_options = LoadOptions {
            expected_cipher: options.cipher.clone(),
            allow_filesystem_upgrade: options.allow_filesystem_upgrade,
        };
        let mut config = config::load_or_create(
            &options.config_path(),
            key_provider,
            &create_settings,
            &load_options,
        )?;

        let filesystem_id = config.config().filesystem_id.clone();
        local_state.check_and_update_basedir(
            &options.basedir,
            &filesystem_id,
            options.allow_replaced_filesystem || config.was_created(),
        )?;
        local_state.check_and_update_key_fingerprint(
            &filesystem_id,
            &config.config().key,
            options.allow_replaced_filesystem,
        )?;
        let my_client_id = local_state.my_client_id(&filesystem_id)?;

        if options.exclusive_client && config.was_created() {
            config.config_mut().exclusive_client_id = Some(my_client_id);
            config.save()?;
        }

        let key = EncryptionKey::from_hex(&config.config().key)?;
        let cipher = new_cipher(&config.config().cipher, &key)?;

        let ondisk = OnDiskBlockStore::new(&options.basedir);
        let encrypted = EncryptedBlockStore::new(cipher, ondisk);
        let known_block_versions =
            KnownBlockVersions::load(local_state.integrity_state_file(&filesystem_id)?)?;
        let integrity = IntegrityBlockStore::new(
            encrypted,
            known_block_versions,
            my_client_id,
            IntegrityConfig {
                allow_integrity_violations: options.allow_integrity_violations,
                missing_block_is_integrity_violation: config
                    .config()
                    .missing_block_is_integrity_violation(),
            },
        )?;
        if config.config().missing_block_is_integrity_violation() {
            integrity.check_for_missing_blocks()?;
        }
        let caching = CachingBlockStore::new(integrity);
        let blockstore = ParallelAccessBlockStore::new(caching);
        let fsblobstore =
            ParallelAccessFsBlobStore::new(blockstore, config.config().blocksize_bytes)?;

        let root_blob_id = match config.config().root_blob.as_str() {
            "" => None,
            hex => Some(BlockId::from_hex(hex).ok_or_else(|| {
                crate::error::ConfigError::InvalidFormat(
                    "root blob id is not a valid block id".to_string(),
                )
            })?),
        };
        let device = Device::new(
            fsblobstore,
            root_blob_id,
            config.config().blocksize_bytes,
            options.atime_behavior,
            process_uid(),
            process_gid(),
        )?;

        if root_blob_id.is_none() {
            config.config_mut().root_blob = device.root_blob_id().to_hex();
            config.save()?;
            info!(
                "initialized filesystem {filesystem_id} with root blob {}",
                device.root_blob_id()
            );
        }

        Ok(Self { device, config })
    }

    pub fn device(&self) -> &Device<BlockStack> {
        &self.device
    }

    pub fn config(&self) -> &config::Config {
        self.config.config()
    }

    /// Flushes everything buffered in memory down to the base directory.
    pub fn flush(&self) -> Result<()> {
        self.device.flush()
    }
}

#[cfg(unix)]
fn process_uid() -> u32 {
    unsafe { libc::geteuid() }
}

#[cfg(unix)]
fn process_gid() -> u32 {
    unsafe { libc::getegid() }
}

#[cfg(not(unix))]
fn process_uid() -> u32 {
    0
}

#[cfg(not(unix))]
fn process_gid() -> u32 {
    0
}

/// True if one path is nested inside the other (either direction).
pub fn paths_are_nested(a: &Path, b: &Path) -> bool {
    let a = a.canonicalize().unwrap_or_else(|_| a.to_path_buf());
    let b = b.canonicalize().unwrap_or_else(|_| b.to_path_buf());
    a.starts_with(&b) || b.starts_with(&a)
}
