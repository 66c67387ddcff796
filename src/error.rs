use crate::blockstore::BlockId;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serde(#[from] bincode::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Integrity(#[from] IntegrityViolation),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("corrupted data: {0}")]
    Corruption(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Evidence that the base directory was tampered with (or a previous run
/// already found such evidence). Detection poisons the local state, so later
/// mounts refuse until the user explicitly overrides.
#[derive(Debug, Clone, Error)]
pub enum IntegrityViolation {
    #[error("block {block_id} was rolled back to version {seen} (we last wrote version {expected})")]
    RollbackOfOwnWrites {
        block_id: BlockId,
        expected: u64,
        seen: u64,
    },

    #[error("block {block_id} was rolled back to an old state of client {client_id} (version {seen}, last seen {last_seen})")]
    RollbackToOtherClient {
        block_id: BlockId,
        client_id: u32,
        seen: u64,
        last_seen: u64,
    },

    #[error("block {block_id} was deleted earlier but reappeared")]
    DeletedBlockReappeared { block_id: BlockId },

    #[error("block {block_id} is known to exist but is missing from the base directory")]
    MissingBlock { block_id: BlockId },

    #[error("an integrity violation was detected on a previous run; refusing to open the filesystem")]
    PreviousRun,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("wrong password or corrupted config file")]
    WrongPassword,

    #[error("invalid config file: {0}")]
    InvalidFormat(String),

    #[error("filesystem was created with veilfs {created_with}, which is newer than this version ({our_version})")]
    TooNewFilesystemFormat {
        created_with: String,
        our_version: String,
    },

    #[error("filesystem was last opened with veilfs {last_opened_with} and needs an upgrade; pass --allow-filesystem-upgrade to migrate it")]
    FilesystemUpgradeRequired { last_opened_with: String },

    #[error("the filesystem id in the config file is different to the last time this base directory was opened")]
    FilesystemIdChanged,

    #[error("the encryption key is different to the last time this filesystem was opened")]
    EncryptionKeyChanged,

    #[error("unknown cipher: {0}")]
    UnknownCipher(String),
}

/// POSIX-mappable filesystem errors. The node layer is the translation
/// boundary: everything an operation can fail with is one of these, and
/// callers (the mount adapter) read the errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("file exists")]
    AlreadyExists,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid argument")]
    InvalidOperation,

    #[error("bad file descriptor")]
    BadFileDescriptor,

    #[error("no space left on device")]
    NoSpace,

    #[error("input/output error")]
    IoFailure,
}

impl FsError {
    pub fn errno(self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::InvalidOperation => libc::EINVAL,
            FsError::BadFileDescriptor => libc::EBADF,
            FsError::NoSpace => libc::ENOSPC,
            FsError::IoFailure => libc::EIO,
        }
    }
}

impl Error {
    /// Collapses any error into the errno the kernel interface reports.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Fs(e) => e.errno(),
            Error::Io(e) if e.kind() == io::ErrorKind::StorageFull => libc::ENOSPC,
            _ => libc::EIO,
        }
    }
}
