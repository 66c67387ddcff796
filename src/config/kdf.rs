//! Password-based key derivation via scrypt. The parameters used when a
//! filesystem was created travel with the config file, so later opens (and
//! future parameter upgrades) derive the same key material.

use crate::error::{ConfigError, Error, Result};
use crate::utils::random_bytes;
use scrypt::Params;
use zeroize::Zeroizing;

/// Total key material derived from the password: 32 bytes for the outer
/// config encryption plus up to 32 bytes for the inner cipher.
pub const DERIVED_KEY_SIZE: usize = 64;

const SALT_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScryptSettings {
    pub salt: Vec<u8>,
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl ScryptSettings {
    /// Fresh settings with a random salt and the default cost parameters.
    pub fn generate() -> Self {
        Self {
            salt: random_bytes::<_, SALT_SIZE>(&mut rand::thread_rng()).to_vec(),
            log_n: 17,
            r: 8,
            p: 1,
        }
    }

    /// Cheap parameters for tests; deriving with the real cost parameters
    /// takes around a second per call.
    #[cfg(test)]
    pub fn test_settings() -> Self {
        Self {
            salt: random_bytes::<_, SALT_SIZE>(&mut rand::thread_rng()).to_vec(),
            log_n: 10,
            r: 8,
            p: 1,
        }
    }

    pub fn serialized_size(&self) -> usize {
        4 + self.salt.len() + 1 + 4 + 4
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.salt.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.salt);
        out.push(self.log_n);
        out.extend_from_slice(&self.r.to_le_bytes());
        out.extend_from_slice(&self.p.to_le_bytes());
    }

    /// Parses settings from `data`, returning them and the number of bytes
    /// consumed.
    pub fn deserialize_from(data: &[u8]) -> Result<(Self, usize)> {
        let invalid = || {
            Error::Config(ConfigError::InvalidFormat(
                "truncated key derivation parameters".to_string(),
            ))
        };
        if data.len() < 4 {
            return Err(invalid());
        }
        let salt_len = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
        let rest = &data[4..];
        if rest.len() < salt_len + 1 + 4 + 4 {
            return Err(invalid());
        }
        let salt = rest[..salt_len].to_vec();
        let log_n = rest[salt_len];
        let r = u32::from_le_bytes(rest[salt_len + 1..salt_len + 5].try_into().unwrap());
        let p = u32::from_le_bytes(rest[salt_len + 5..salt_len + 9].try_into().unwrap());
        let settings = Self { salt, log_n, r, p };
        Ok((settings, 4 + salt_len + 9))
    }
}

/// Runs scrypt over the password with the given settings.
pub fn derive_key(password: &str, settings: &ScryptSettings) -> Result<Zeroizing<[u8; DERIVED_KEY_SIZE]>> {
    let params = Params::new(settings.log_n, settings.r, settings.p, DERIVED_KEY_SIZE)
        .map_err(|err| {
            Error::Config(ConfigError::InvalidFormat(format!(
                "invalid scrypt parameters: {err}"
            )))
        })?;
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_SIZE]);
    scrypt::scrypt(
        password.as_bytes(),
        &settings.salt,
        &params,
        key.as_mut_slice(),
    )
    .map_err(|err| Error::Cipher(format!("scrypt failed: {err}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_roundtrip() {
        let settings = ScryptSettings::test_settings();
        let mut serialized = vec![];
        settings.serialize_into(&mut serialized);
        assert_eq!(serialized.len(), settings.serialized_size());
        let (restored, consumed) = ScryptSettings::deserialize_from(&serialized).unwrap();
        assert_eq!(settings, restored);
        assert_eq!(consumed, serialized.len());
    }

    #[test]
    fn same_password_same_salt_derives_same_key() {
        let settings = ScryptSettings::test_settings();
        let a = derive_key("password", &settings).unwrap();
        let b = derive_key("password", &settings).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn different_password_derives_different_key() {
        let settings = ScryptSettings::test_settings();
        let a = derive_key("password", &settings).unwrap();
        let b = derive_key("other", &settings).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn different_salt_derives_different_key() {
        let a = derive_key("password", &ScryptSettings::test_settings()).unwrap();
        let b = derive_key("password", &ScryptSettings::test_settings()).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn truncated_settings_are_rejected() {
        let settings = ScryptSettings::test_settings();
        let mut serialized = vec![];
        settings.serialize_into(&mut serialized);
        assert!(ScryptSettings::deserialize_from(&serialized[..10]).is_err());
    }
}
