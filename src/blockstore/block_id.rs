use crate::utils::random_bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 128-bit opaque block identifier. Generated uniformly at random when a
/// block is created; the full id namespace of a filesystem is a sparse set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId([u8; 16]);

impl BlockId {
    pub const BINARY_LENGTH: usize = 16;

    pub fn random() -> Self {
        BlockId(random_bytes(&mut rand::thread_rng()))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        BlockId(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = slice.try_into().ok()?;
        Some(BlockId(bytes))
    }

    pub fn bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Uppercase hex, as used for block file names in the base directory.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 2 * Self::BINARY_LENGTH {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.to_hex())
    }
}
