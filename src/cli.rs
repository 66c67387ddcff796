//! Command line frontend: argument handling, environment, sanity checks on
//! the base and mount directories, and the exit-code contract. The kernel
//! interface itself is pluggable; this binary prepares and verifies the
//! filesystem and reports problems with stable exit codes.

use crate::cipher;
use crate::config::key_provider::{InteractiveKeyProvider, KeyProvider};
use crate::error::{ConfigError, Error, IntegrityViolation};
use crate::filesystem::{paths_are_nested, FilesystemOptions, Veilfs};
use crate::fs::AtimeUpdateBehavior;
use crate::localstate::LocalStateDir;
use clap::{Parser, ValueEnum};
use log::{error, info};
use std::fs;
use std::path::{Path, PathBuf};

pub const FRONTEND_ENV: &str = "VEILFS_FRONTEND";

/// Stable process exit codes; scripts depend on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    UnspecifiedError = 1,
    InvalidArguments = 10,
    WrongPassword = 11,
    InaccessibleBaseDir = 16,
    InaccessibleMountDir = 17,
    BaseDirInsideMountDir = 18,
    TooNewFilesystemFormat = 19,
    FilesystemIdChanged = 20,
    EncryptionKeyChanged = 21,
    IntegrityViolation = 22,
    IntegrityViolationOnPreviousRun = 23,
    FilesystemUpgradeRequired = 24,
}

impl ExitCode {
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Config(ConfigError::WrongPassword) => ExitCode::WrongPassword,
            Error::Config(ConfigError::TooNewFilesystemFormat { .. }) => {
                ExitCode::TooNewFilesystemFormat
            }
            Error::Config(ConfigError::FilesystemUpgradeRequired { .. }) => {
                ExitCode::FilesystemUpgradeRequired
            }
            Error::Config(ConfigError::FilesystemIdChanged) => ExitCode::FilesystemIdChanged,
            Error::Config(ConfigError::EncryptionKeyChanged) => ExitCode::EncryptionKeyChanged,
            Error::Config(_) => ExitCode::InvalidArguments,
            Error::Integrity(IntegrityViolation::PreviousRun) => {
                ExitCode::IntegrityViolationOnPreviousRun
            }
            Error::Integrity(_) => ExitCode::IntegrityViolation,
            _ => ExitCode::UnspecifiedError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AtimePolicy {
    Noatime,
    Relatime,
    Strictatime,
    Nodiratime,
}

impl From<AtimePolicy> for AtimeUpdateBehavior {
    fn from(policy: AtimePolicy) -> Self {
        match policy {
            AtimePolicy::Noatime => AtimeUpdateBehavior::Noatime,
            AtimePolicy::Relatime => AtimeUpdateBehavior::Relatime,
            AtimePolicy::Strictatime => AtimeUpdateBehavior::Strictatime,
            AtimePolicy::Nodiratime => AtimeUpdateBehavior::Nodiratime,
        }
    }
}

#[derive(Parser)]
#[clap(name = "veilfs", version)]
pub struct Args {
    /// The directory holding the encrypted blocks
    #[clap(required_unless_present = "show_ciphers")]
    pub basedir: Option<PathBuf>,

    /// The mount point
    #[clap(required_unless_present = "show_ciphers")]
    pub mountdir: Option<PathBuf>,

    /// Cipher for a new filesystem (see --show-ciphers); for an existing
    /// one, fail unless it uses this cipher
    #[clap(long)]
    pub cipher: Option<String>,

    /// Config file location, if not inside the base directory
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Physical block size in bytes for a new filesystem
    #[clap(long, default_value_t = crate::config::DEFAULT_BLOCKSIZE_BYTES)]
    pub blocksize_bytes: u64,

    /// Continue (with warnings) when the base directory shows signs of
    /// tampering
    #[clap(long, default_value_t = false)]
    pub allow_integrity_violations: bool,

    /// Migrate a filesystem created by an older version
    #[clap(long, default_value_t = false)]
    pub allow_filesystem_upgrade: bool,

    /// Accept that the filesystem in the base directory was replaced by a
    /// different one
    #[clap(long, default_value_t = false)]
    pub allow_replaced_filesystem: bool,

    /// Create the new filesystem bound to this machine; missing blocks are
    /// then treated as attacks
    #[clap(long, default_value_t = false)]
    pub exclusive_client: bool,

    /// Access-time update policy
    #[clap(long, value_enum, default_value = "relatime")]
    pub atime: AtimePolicy,

    /// Run in foreground
    #[clap(short, long, default_value_t = false)]
    pub foreground: bool,

    /// List supported ciphers and exit
    #[clap(long, default_value_t = false)]
    pub show_ciphers: bool,
}

fn check_dir_accessible(dir: &Path, create: bool) -> std::result::Result<(), String> {
    if !dir.exists() {
        if !create {
            return Err(format!("{} does not exist", dir.display()));
        }
        if let Err(err) = fs::create_dir_all(dir) {
            return Err(format!("could not create {}: {err}", dir.display()));
        }
    }
    if !dir.is_dir() {
        return Err(format!("{} is not a directory", dir.display()));
    }
    // Probe for read and write permission.
    if let Err(err) = fs::read_dir(dir) {
        return Err(format!("cannot read {}: {err}", dir.display()));
    }
    let probe = dir.join(".veilfs-access-probe");
    if let Err(err) = fs::write(&probe, b"") {
        return Err(format!("cannot write to {}: {err}", dir.display()));
    }
    let _ = fs::remove_file(&probe);
    Ok(())
}

pub fn run(args: &Args) -> ExitCode {
    if args.show_ciphers {
        for name in cipher::supported_cipher_names() {
            let aead = cipher::cipher_is_aead(name).unwrap_or(false);
            if aead {
                println!("{name}");
            } else {
                println!("{name} (warning: no authenticated encryption)");
            }
        }
        return ExitCode::Success;
    }

    let (Some(basedir), Some(mountdir)) = (&args.basedir, &args.mountdir) else {
        error!("base directory and mount directory are required");
        return ExitCode::InvalidArguments;
    };
    if let Err(reason) = check_dir_accessible(basedir, true) {
        error!("base directory is not usable: {reason}");
        return ExitCode::InaccessibleBaseDir;
    }
    if let Err(reason) = check_dir_accessible(mountdir, true) {
        error!("mount directory is not usable: {reason}");
        return ExitCode::InaccessibleMountDir;
    }
    if paths_are_nested(basedir, mountdir) {
        error!("base directory and mount directory must not contain each other");
        return ExitCode::BaseDirInsideMountDir;
    }

    let noninteractive = std::env::var(FRONTEND_ENV)
        .map(|v| v == "noninteractive")
        .unwrap_or(false);
    let key_provider = InteractiveKeyProvider::new(noninteractive);

    match open_filesystem(args, basedir, &key_provider) {
        Ok(veilfs) => {
            info!(
                "filesystem {} ready to serve {}",
                veilfs.config().filesystem_id,
                mountdir.display()
            );
            if let Err(err) = veilfs.flush() {
                error!("{err}");
                return ExitCode::from_error(&err);
            }
            ExitCode::Success
        }
        Err(err) => {
            error!("Error {}: {err}", ExitCode::from_error(&err) as i32);
            ExitCode::from_error(&err)
        }
    }
}

fn open_filesystem(
    args: &Args,
    basedir: &Path,
    key_provider: &dyn KeyProvider,
) -> crate::error::Result<Veilfs> {
    let local_state = LocalStateDir::default_location()?;
    let options = FilesystemOptions {
        basedir: basedir.to_path_buf(),
        config_path: args.config.clone(),
        cipher: args.cipher.clone(),
        blocksize_bytes: args.blocksize_bytes,
        allow_integrity_violations: args.allow_integrity_violations,
        allow_filesystem_upgrade: args.allow_filesystem_upgrade,
        allow_replaced_filesystem: args.allow_replaced_filesystem,
        exclusive_client: args.exclusive_client,
        atime_behavior: args.atime.into(),
    };
    Veilfs::open(&options, key_provider, &local_state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(ExitCode::InaccessibleBaseDir as i32, 16);
        assert_eq!(ExitCode::InaccessibleMountDir as i32, 17);
        assert_eq!(ExitCode::BaseDirInsideMountDir as i32, 18);
        assert_eq!(ExitCode::FilesystemIdChanged as i32, 20);
        assert_eq!(ExitCode::EncryptionKeyChanged as i32, 21);
        assert_eq!(ExitCode::IntegrityViolation as i32, 22);
        assert_eq!(ExitCode::IntegrityViolationOnPreviousRun as i32, 23);
    }

    #[test]
    fn error_mapping() {
        assert_eq!(
            ExitCode::from_error(&Error::Config(ConfigError::WrongPassword)),
            ExitCode::WrongPassword
        );
        assert_eq!(
            ExitCode::from_error(&Error::Config(ConfigError::FilesystemIdChanged)),
            ExitCode::FilesystemIdChanged
        );
        assert_eq!(
            ExitCode::from_error(&Error::Integrity(IntegrityViolation::PreviousRun)),
            ExitCode::IntegrityViolationOnPreviousRun
        );
        assert_eq!(
            ExitCode::from_error(&Error::Integrity(IntegrityViolation::MissingBlock {
                block_id: crate::blockstore::BlockId::random()
            })),
            ExitCode::IntegrityViolation
        );
    }

    #[test]
    fn nested_paths_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let mount_inside = base.join("mount");
        fs::create_dir_all(&mount_inside).unwrap();
        assert!(paths_are_nested(&base, &mount_inside));
        assert!(paths_are_nested(&mount_inside, &base));

        let sibling = dir.path().join("mount");
        fs::create_dir_all(&sibling).unwrap();
        assert!(!paths_are_nested(&base, &sibling));
    }
}
