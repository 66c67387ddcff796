//! Two-layer encryption of the config file.
//!
//! The stored container is `[ASCII header || scrypt settings || outer
//! ciphertext]`. The outer layer is always AES-256-GCM and hides an inner
//! container `[cipher name, NUL || inner ciphertext]` encrypted with the
//! filesystem's own cipher. Both layers pad their plaintext to a fixed size
//! with random bytes first, so the config file never leaks the cipher name
//! length or config content size, and all config files have the same size.

use super::kdf::ScryptSettings;
use crate::cipher::{cipher_key_size, new_cipher, Cipher, EncryptionKey};
use crate::error::{ConfigError, Error, Result};
use rand::RngCore;

/// `veilfs.config;<container format version>;<kdf name>`
const HEADER: &[u8] = b"veilfs.config;0;scrypt\0";

const OUTER_CIPHER: &str = "aes-256-gcm";
const OUTER_KEY_SIZE: usize = 32;
const OUTER_PADDED_SIZE: usize = 1024;
const INNER_PADDED_SIZE: usize = 512;

/// Pads `data` with random bytes to `target_size`, length-prefixed so the
/// padding can be stripped again.
fn add_random_padding(data: &[u8], target_size: usize) -> Result<Vec<u8>> {
    if data.len() + 4 > target_size {
        return Err(Error::Config(ConfigError::InvalidFormat(format!(
            "config of {} bytes does not fit the {target_size}-byte container",
            data.len()
        ))));
    }
    let mut padded = Vec::with_capacity(target_size);
    padded.extend_from_slice(&(data.len() as u32).to_le_bytes());
    padded.extend_from_slice(data);
    let mut padding = vec![0u8; target_size - padded.len()];
    rand::thread_rng().fill_bytes(&mut padding);
    padded.extend_from_slice(&padding);
    Ok(padded)
}

fn remove_random_padding(padded: &[u8]) -> Option<Vec<u8>> {
    if padded.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(padded[..4].try_into().unwrap()) as usize;
    if 4 + len > padded.len() {
        return None;
    }
    Some(padded[4..4 + len].to_vec())
}

fn outer_cipher(derived_key: &[u8]) -> Result<Box<dyn Cipher>> {
    assert!(derived_key.len() >= OUTER_KEY_SIZE, "derived key too short");
    new_cipher(
        OUTER_CIPHER,
        &EncryptionKey::new(derived_key[..OUTER_KEY_SIZE].to_vec()),
    )
}

fn inner_cipher(derived_key: &[u8], cipher_name: &str) -> Result<Box<dyn Cipher>> {
    let key_size = cipher_key_size(cipher_name)?;
    assert!(
        derived_key.len() >= OUTER_KEY_SIZE + key_size,
        "derived key too short for inner cipher {cipher_name}"
    );
    new_cipher(
        cipher_name,
        &EncryptionKey::new(derived_key[OUTER_KEY_SIZE..OUTER_KEY_SIZE + key_size].to_vec()),
    )
}

/// Splits a config file into its KDF settings and the outer ciphertext.
pub fn parse_container(file: &[u8]) -> Result<(ScryptSettings, &[u8])> {
    let Some(rest) = file.strip_prefix(HEADER) else {
        return Err(ConfigError::InvalidFormat(
            "not a veilfs config file (bad header)".to_string(),
        )
        .into());
    };
    let (settings, consumed) = ScryptSettings::deserialize_from(rest)?;
    Ok((settings, &rest[consumed..]))
}

/// Decrypts both layers. The inner cipher name is discovered from the outer
/// plaintext; it is returned together with the config JSON. Authentication
/// failures surface as `WrongPassword`.
pub fn decrypt_container(derived_key: &[u8], outer_ciphertext: &[u8]) -> Result<(String, Vec<u8>)> {
    let outer_padded = outer_cipher(derived_key)?
        .decrypt(outer_ciphertext)
        .ok_or(ConfigError::WrongPassword)?;
    let inner_container = remove_random_padding(&outer_padded).ok_or(ConfigError::WrongPassword)?;

    let name_end = inner_container
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ConfigError::InvalidFormat("unterminated cipher name".to_string()))?;
    let cipher_name = std::str::from_utf8(&inner_container[..name_end])
        .map_err(|_| ConfigError::InvalidFormat("cipher name is not UTF-8".to_string()))?
        .to_string();

    let inner_padded = inner_cipher(derived_key, &cipher_name)?
        .decrypt(&inner_container[name_end + 1..])
        .ok_or(ConfigError::WrongPassword)?;
    let config_json =
        remove_random_padding(&inner_padded).ok_or(ConfigError::WrongPassword)?;
    Ok((cipher_name, config_json))
}

/// Bound to one password derivation: holds both layer ciphers and the KDF
/// settings that produced the keys, so a loaded config can be re-saved
/// without re-prompting.
pub struct ConfigEncryptor {
    outer_cipher: Box<dyn Cipher>,
    inner_cipher: Box<dyn Cipher>,
    inner_cipher_name: String,
    kdf_settings: ScryptSettings,
}

impl ConfigEncryptor {
    pub fn new(
        derived_key: &[u8],
        inner_cipher_name: &str,
        kdf_settings: ScryptSettings,
    ) -> Result<Self> {
        Ok(Self {
            outer_cipher: outer_cipher(derived_key)?,
            inner_cipher: inner_cipher(derived_key, inner_cipher_name)?,
            inner_cipher_name: inner_cipher_name.to_string(),
            kdf_settings,
        })
    }

    pub fn kdf_settings(&self) -> &ScryptSettings {
        &self.kdf_settings
    }

    /// Encrypts the serialized config into the full file content.
    pub fn encrypt(&self, config_json: &[u8]) -> Result<Vec<u8>> {
        let inner_padded = add_random_padding(config_json, INNER_PADDED_SIZE)?;
        let inner_ciphertext = self.inner_cipher.encrypt(&inner_padded)?;

        let mut inner_container =
            Vec::with_capacity(self.inner_cipher_name.len() + 1 + inner_ciphertext.len());
        inner_container.extend_from_slice(self.inner_cipher_name.as_bytes());
        inner_container.push(0);
        inner_container.extend_from_slice(&inner_ciphertext);

        let outer_padded = add_random_padding(&inner_container, OUTER_PADDED_SIZE)?;
        let outer_ciphertext = self.outer_cipher.encrypt(&outer_padded)?;

        let mut file = Vec::new();
        file.extend_from_slice(HEADER);
        self.kdf_settings.serialize_into(&mut file);
        file.extend_from_slice(&outer_ciphertext);
        Ok(file)
    }
}
