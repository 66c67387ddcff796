//! Sources of the password-derived key material. The core only ever sees
//! derived keys; where the password comes from (preset by a caller, an
//! interactive prompt, stdin in noninteractive mode) is decided here.

use super::kdf::{self, ScryptSettings, DERIVED_KEY_SIZE};
use crate::error::Result;
use std::io::{BufRead, IsTerminal};
use zeroize::Zeroizing;

pub struct DerivedKey {
    pub key: Zeroizing<[u8; DERIVED_KEY_SIZE]>,
    pub settings: ScryptSettings,
}

pub trait KeyProvider {
    /// Derives the key for an existing filesystem with the settings stored
    /// in its config file.
    fn request_key_for_existing_filesystem(
        &self,
        settings: &ScryptSettings,
    ) -> Result<Zeroizing<[u8; DERIVED_KEY_SIZE]>>;

    /// Picks fresh derivation settings and derives the key for a filesystem
    /// being created.
    fn request_key_for_new_filesystem(&self) -> Result<DerivedKey>;
}

/// Key provider with a fixed password. Used by the library API and tests.
pub struct PresetPasswordKeyProvider {
    password: Zeroizing<String>,
    kdf_parameters: Option<(u8, u32, u32)>,
}

impl PresetPasswordKeyProvider {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: Zeroizing::new(password.into()),
            kdf_parameters: None,
        }
    }

    /// Overrides the scrypt cost parameters used for new filesystems.
    /// Mainly for tests and benchmarks; the defaults are the right choice
    /// for real data.
    pub fn with_kdf_parameters(mut self, log_n: u8, r: u32, p: u32) -> Self {
        self.kdf_parameters = Some((log_n, r, p));
        self
    }

    fn fresh_settings(&self) -> ScryptSettings {
        let mut settings = ScryptSettings::generate();
        if let Some((log_n, r, p)) = self.kdf_parameters {
            settings.log_n = log_n;
            settings.r = r;
            settings.p = p;
        }
        settings
    }
}

impl KeyProvider for PresetPasswordKeyProvider {
    fn request_key_for_existing_filesystem(
        &self,
        settings: &ScryptSettings,
    ) -> Result<Zeroizing<[u8; DERIVED_KEY_SIZE]>> {
        kdf::derive_key(&self.password, settings)
    }

    fn request_key_for_new_filesystem(&self) -> Result<DerivedKey> {
        let settings = self.fresh_settings();
        let key = kdf::derive_key(&self.password, &settings)?;
        Ok(DerivedKey { key, settings })
    }
}

/// Asks for the password on the terminal; on a non-terminal stdin (or with
/// `VEILFS_FRONTEND=noninteractive`) it reads one line from stdin instead.
pub struct InteractiveKeyProvider {
    noninteractive: bool,
}

impl InteractiveKeyProvider {
    pub fn new(noninteractive: bool) -> Self {
        Self { noninteractive }
    }

    fn read_password(&self, prompt: &str) -> Result<Zeroizing<String>> {
        if self.noninteractive || !std::io::stdin().is_terminal() {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
            return Ok(Zeroizing::new(trimmed));
        }
        let password = rpassword::prompt_password(prompt)?;
        Ok(Zeroizing::new(password))
    }
}

impl KeyProvider for InteractiveKeyProvider {
    fn request_key_for_existing_filesystem(
        &self,
        settings: &ScryptSettings,
    ) -> Result<Zeroizing<[u8; DERIVED_KEY_SIZE]>> {
        let password = self.read_password("Password: ")?;
        kdf::derive_key(&password, settings)
    }

    fn request_key_for_new_filesystem(&self) -> Result<DerivedKey> {
        let password = self.read_password("Password for new filesystem: ")?;
        let settings = ScryptSettings::generate();
        let key = kdf::derive_key(&password, &settings)?;
        Ok(DerivedKey { key, settings })
    }
}

/// Test-only provider skipping the expensive derivation parameters.
#[cfg(test)]
pub struct FakeKeyProvider {
    password: String,
}

#[cfg(test)]
impl FakeKeyProvider {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[cfg(test)]
impl KeyProvider for FakeKeyProvider {
    fn request_key_for_existing_filesystem(
        &self,
        settings: &ScryptSettings,
    ) -> Result<Zeroizing<[u8; DERIVED_KEY_SIZE]>> {
        kdf::derive_key(&self.password, settings)
    }

    fn request_key_for_new_filesystem(&self) -> Result<DerivedKey> {
        let settings = ScryptSettings::test_settings();
        let key = kdf::derive_key(&self.password, &settings)?;
        Ok(DerivedKey { key, settings })
    }
}
