//! Symmetric ciphers for block encryption, selectable by name in the
//! filesystem config. GCM variants are AEAD; the CFB variants carry no
//! authentication tag of their own and rely on the integrity layer plus the
//! block-id binding, so creating a filesystem with one prints a warning.

use crate::error::{ConfigError, Error, Result};
use aes::{Aes128, Aes256};
use aes_gcm::aead::array::typenum::consts::{U12, U16};
use aes_gcm::aead::array::typenum::Unsigned;
use aes_gcm::aead::array::Array as GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use cfb_mode::cipher::{BlockCipherDecrypt, BlockCipherEncrypt, KeyIvInit};
use cfb_mode::{Decryptor as CfbDecryptor, Encryptor as CfbEncryptor};
use rand::RngCore;
use std::marker::PhantomData;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const DEFAULT_CIPHER: &str = "aes-256-gcm";

type TwofishGcm = AesGcm<twofish::Twofish, U12, U16>;
type SerpentGcm = AesGcm<serpent::Serpent, U12, U16>;
type Cast6Gcm = AesGcm<cast6::Cast6, U12, U16>;

/// Raw symmetric key material. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        EncryptionKey(bytes)
    }

    pub fn generate(len: usize) -> Self {
        let mut bytes = vec![0; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        EncryptionKey(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Ok(EncryptionKey(hex::decode(s).map_err(|_| {
            Error::Cipher("encryption key is not valid hex".to_string())
        })?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "EncryptionKey({} bytes)", self.0.len())
    }
}

/// A named symmetric cipher instance bound to a key.
///
/// `encrypt` prepends the random nonce/IV to its output; `decrypt` expects
/// that layout and returns `None` on any authentication or framing failure.
pub trait Cipher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bytes added to a plaintext by `encrypt` (nonce/IV plus tag, if any).
    fn ciphertext_overhead(&self) -> usize;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>>;
}

struct AeadCipher<A> {
    name: &'static str,
    aead: A,
}

impl<A> Cipher for AeadCipher<A>
where
    A: Aead + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn ciphertext_overhead(&self) -> usize {
        A::NonceSize::USIZE + A::TagSize::USIZE
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = vec![0u8; A::NonceSize::USIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce_arr = GenericArray::try_from(nonce.as_slice())
            .expect("nonce has exactly NonceSize bytes");
        let ciphertext = self
            .aead
            .encrypt(&nonce_arr, plaintext)
            .map_err(|_| Error::Cipher(format!("{} encryption failed", self.name)))?;
        nonce.extend_from_slice(&ciphertext);
        Ok(nonce)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let nonce_size = A::NonceSize::USIZE;
        if ciphertext.len() < nonce_size + A::TagSize::USIZE {
            return None;
        }
        let (nonce, body) = ciphertext.split_at(nonce_size);
        let nonce_arr = GenericArray::try_from(nonce).ok()?;
        self.aead.decrypt(&nonce_arr, body).ok()
    }
}

const CFB_IV_SIZE: usize = 16;

struct CfbCipher<C> {
    name: &'static str,
    key: EncryptionKey,
    _cipher: PhantomData<fn() -> C>,
}

impl<C> Cipher for CfbCipher<C>
where
    C: BlockCipherEncrypt + BlockCipherDecrypt + KeyInit + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn ciphertext_overhead(&self) -> usize {
        CFB_IV_SIZE
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; CFB_IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let encryptor = CfbEncryptor::<C>::new_from_slices(self.key.as_bytes(), &iv)
            .map_err(|_| Error::Cipher(format!("bad key or IV length for {}", self.name)))?;
        let mut out = Vec::with_capacity(CFB_IV_SIZE + plaintext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(plaintext);
        encryptor.encrypt(&mut out[CFB_IV_SIZE..]);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        if ciphertext.len() < CFB_IV_SIZE {
            return None;
        }
        let (iv, body) = ciphertext.split_at(CFB_IV_SIZE);
        let decryptor = CfbDecryptor::<C>::new_from_slices(self.key.as_bytes(), iv).ok()?;
        let mut plaintext = body.to_vec();
        decryptor.decrypt(&mut plaintext);
        // CFB carries no tag. Tampering is caught by the layers above.
        Some(plaintext)
    }
}

struct CipherSpec {
    name: &'static str,
    key_size: usize,
    aead: bool,
}

const CIPHERS: &[CipherSpec] = &[
    CipherSpec { name: "aes-128-gcm", key_size: 16, aead: true },
    CipherSpec { name: "aes-256-gcm", key_size: 32, aead: true },
    CipherSpec { name: "aes-128-cfb", key_size: 16, aead: false },
    CipherSpec { name: "aes-256-cfb", key_size: 32, aead: false },
    CipherSpec { name: "twofish-256-gcm", key_size: 32, aead: true },
    CipherSpec { name: "twofish-256-cfb", key_size: 32, aead: false },
    CipherSpec { name: "serpent-256-gcm", key_size: 32, aead: true },
    CipherSpec { name: "serpent-256-cfb", key_size: 32, aead: false },
    CipherSpec { name: "cast-256-gcm", key_size: 32, aead: true },
    CipherSpec { name: "cast-256-cfb", key_size: 32, aead: false },
];

fn spec(name: &str) -> std::result::Result<&'static CipherSpec, ConfigError> {
    CIPHERS
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| ConfigError::UnknownCipher(name.to_string()))
}

pub fn supported_cipher_names() -> Vec<&'static str> {
    CIPHERS.iter().map(|c| c.name).collect()
}

/// Key length in bytes required by the named cipher.
pub fn cipher_key_size(name: &str) -> std::result::Result<usize, ConfigError> {
    Ok(spec(name)?.key_size)
}

/// Whether the named cipher authenticates its ciphertext itself.
pub fn cipher_is_aead(name: &str) -> std::result::Result<bool, ConfigError> {
    Ok(spec(name)?.aead)
}

fn new_aead<A>(name: &'static str, key: &EncryptionKey) -> Result<Box<dyn Cipher>>
where
    A: Aead + KeyInit + Send + Sync + 'static,
{
    let aead = A::new_from_slice(key.as_bytes())
        .map_err(|_| Error::Cipher(format!("wrong key length for {name}")))?;
    Ok(Box::new(AeadCipher { name, aead }))
}

fn new_cfb<C>(name: &'static str, key: &EncryptionKey) -> Result<Box<dyn Cipher>>
where
    C: BlockCipherEncrypt + BlockCipherDecrypt + KeyInit + Send + Sync + 'static,
{
    Ok(Box::new(CfbCipher::<C> {
        name,
        key: key.clone(),
        _cipher: PhantomData,
    }))
}

/// Instantiates the named cipher with the given key.
pub fn new_cipher(name: &str, key: &EncryptionKey) -> Result<Box<dyn Cipher>> {
    let spec = spec(name)?;
    if key.len() != spec.key_size {
        return Err(Error::Cipher(format!(
            "cipher {name} needs a {}-byte key, got {} bytes",
            spec.key_size,
            key.len()
        )));
    }
    match spec.name {
        "aes-128-gcm" => new_aead::<Aes128Gcm>("aes-128-gcm", key),
        "aes-256-gcm" => new_aead::<Aes256Gcm>("aes-256-gcm", key),
        "aes-128-cfb" => new_cfb::<Aes128>("aes-128-cfb", key),
        "aes-256-cfb" => new_cfb::<Aes256>("aes-256-cfb", key),
        "twofish-256-gcm" => new_aead::<TwofishGcm>("twofish-256-gcm", key),
        "twofish-256-cfb" => new_cfb::<twofish::Twofish>("twofish-256-cfb", key),
        "serpent-256-gcm" => new_aead::<SerpentGcm>("serpent-256-gcm", key),
        "serpent-256-cfb" => new_cfb::<serpent::Serpent>("serpent-256-cfb", key),
        "cast-256-gcm" => new_aead::<Cast6Gcm>("cast-256-gcm", key),
        "cast-256-cfb" => new_cfb::<cast6::Cast6>("cast-256-cfb", key),
        _ => unreachable!("cipher listed in CIPHERS but not constructible"),
    }
}
