//! Filesystem configuration: the JSON document stored encrypted as
//! `veilfs.config` in the base directory, the scrypt key derivation, the
//! two-layer config encryption, and the bootstrap checks that gate opening a
//! filesystem.

pub mod encryptor;
pub mod kdf;
pub mod key_provider;
mod loader;

pub use loader::{load_or_create, ConfigCreateSettings, ConfigFile, LoadOptions, DEFAULT_BLOCKSIZE_BYTES};

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};

/// The version of this build, written into configs it creates or opens.
pub const OUR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Root directory blob id (hex). Empty until the filesystem was mounted
    /// for the first time.
    #[serde(rename = "rootblob")]
    pub root_blob: String,

    /// Block encryption key (hex).
    pub key: String,

    pub cipher: String,

    /// Filesystem format version (the veilfs version that wrote the current
    /// on-disk format).
    pub version: String,

    #[serde(rename = "createdWithVersion")]
    pub created_with_version: String,

    #[serde(rename = "lastOpenedWithVersion")]
    pub last_opened_with_version: String,

    #[serde(rename = "blocksizeBytes")]
    pub blocksize_bytes: u64,

    /// 128-bit filesystem id (hex).
    #[serde(rename = "filesystemId")]
    pub filesystem_id: String,

    /// When set, only this client may write the filesystem and a missing
    /// block is treated as an integrity violation.
    #[serde(
        rename = "exclusiveClientId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub exclusive_client_id: Option<u32>,
}

impl Config {
    pub fn load(json: &[u8]) -> Result<Self> {
        let config: Config = serde_json::from_slice(json)?;
        if config.filesystem_id.len() != 32 || hex::decode(&config.filesystem_id).is_err() {
            return Err(ConfigError::InvalidFormat(
                "filesystem id is not a 128-bit hex string".to_string(),
            )
            .into());
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn missing_block_is_integrity_violation(&self) -> bool {
        self.exclusive_client_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_config() -> Config {
        Config {
            root_blob: "0DA4607AD93F24E41C9E5340D92EB3A7".to_string(),
            key: "aa".repeat(32),
            cipher: "aes-256-gcm".to_string(),
            version: OUR_VERSION.to_string(),
            created_with_version: OUR_VERSION.to_string(),
            last_opened_with_version: OUR_VERSION.to_string(),
            blocksize_bytes: 32832,
            filesystem_id: "00112233445566778899AABBCCDDEEFF".to_string(),
            exclusive_client_id: None,
        }
    }

    #[test]
    fn json_roundtrip() {
        let config = example_config();
        let restored = Config::load(&config.save().unwrap()).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn json_roundtrip_with_exclusive_client() {
        let mut config = example_config();
        config.exclusive_client_id = Some(0x1234);
        let restored = Config::load(&config.save().unwrap()).unwrap();
        assert_eq!(config, restored);
        assert!(restored.missing_block_is_integrity_violation());
    }

    #[test]
    fn field_names_are_stable() {
        let json = String::from_utf8(example_config().save().unwrap()).unwrap();
        for field in [
            "rootblob",
            "key",
            "cipher",
            "version",
            "createdWithVersion",
            "lastOpenedWithVersion",
            "blocksizeBytes",
            "filesystemId",
        ] {
            assert!(json.contains(field), "missing field {field} in {json}");
        }
        // Absent option is omitted entirely.
        assert!(!json.contains("exclusiveClientId"));
    }

    #[test]
    fn invalid_filesystem_id_is_rejected() {
        let mut config = example_config();
        config.filesystem_id = "nothex".to_string();
        assert!(Config::load(&config.save().unwrap()).is_err());
    }
}
