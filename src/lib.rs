//! veilfs: a client-side encrypted filesystem.
//!
//! The POSIX directory tree is persisted as fixed-size, individually
//! encrypted, integrity-protected blocks in an untrusted base directory.
//! File names, sizes, directory structure and metadata are invisible to
//! whoever sees that directory; every block file looks the same.
//!
//! The crate is organized as a stack:
//!
//! - [`blockstore`]: layered block stores (on-disk, encryption, integrity,
//!   caching, parallel access), all behind one trait.
//! - [`blobstore`]: variable-size byte streams as balanced left-max-data
//!   trees of blocks.
//! - [`fsblobstore`]: file/directory/symlink blobs with headers, parent
//!   pointers and directory entry lists.
//! - [`fs`]: the device mapping POSIX operations onto blobs; this is the
//!   surface a kernel-interface adapter drives.
//! - [`config`], [`localstate`], [`cipher`]: bootstrap — key derivation,
//!   the encrypted config file, client identity and integrity state.
//!
//! [`Veilfs::open`] assembles the whole stack from a base directory, a key
//! provider and a local state directory.

pub mod blobstore;
pub mod blockstore;
pub mod cipher;
pub mod cli;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod fs;
pub mod fsblobstore;
pub mod localstate;
pub mod utils;

pub use error::{Error, Result};
pub use filesystem::{FilesystemOptions, Veilfs};
