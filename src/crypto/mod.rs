//! Cryptographic primitives for filewarden
//!
//! Each stored file is encrypted with its own key, derived with HKDF-SHA256
//! from the master key and the file id. The master key itself is derived from
//! the operator passphrase with Argon2id (see [`kdf`]).

pub mod kdf;
mod password;
mod stream;

pub use kdf::{configured_salt, generate_salt, stretch_passphrase};
pub use password::{Argon2PasswordHasher, PasswordHasher};
pub use stream::{decrypt_file, decrypt_stream, encrypt_file, encrypt_stream, EncryptionOutput};

use crate::config::EncryptionConfig;
use crate::error::{Error, Result};
use rand::Rng;
use ring::hkdf::{Salt, HKDF_SHA256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Size of every symmetric key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the KDF salt in bytes
pub const SALT_SIZE: usize = 16;

/// Authentication tag size for the AEAD modes
pub const TAG_SIZE: usize = 16;

/// AES block size (CBC IV size)
pub const BLOCK_SIZE: usize = 16;

/// Nonce size for the AEAD modes
pub const AEAD_NONCE_SIZE: usize = 12;

/// HKDF purpose prefix for per-file keys
const FILE_KEY_PREFIX: &str = "filewarden-file-v1:";

/// Supported ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl Algorithm {
    /// All supported algorithms
    pub const ALL: [Algorithm; 3] = [
        Algorithm::Aes256Cbc,
        Algorithm::Aes256Gcm,
        Algorithm::ChaCha20Poly1305,
    ];

    /// IV length in bytes
    pub fn iv_len(&self) -> usize {
        match self {
            Algorithm::Aes256Cbc => BLOCK_SIZE,
            Algorithm::Aes256Gcm | Algorithm::ChaCha20Poly1305 => AEAD_NONCE_SIZE,
        }
    }

    /// Whether the algorithm authenticates its ciphertext
    pub fn is_aead(&self) -> bool {
        !matches!(self, Algorithm::Aes256Cbc)
    }

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Aes256Cbc => "aes-256-cbc",
            Algorithm::Aes256Gcm => "aes-256-gcm",
            Algorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// Generate a random IV of the right length
    pub fn generate_iv(&self) -> Vec<u8> {
        let mut iv = vec![0u8; self.iv_len()];
        rand::thread_rng().fill(iv.as_mut_slice());
        iv
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-256-cbc" => Ok(Algorithm::Aes256Cbc),
            "aes-256-gcm" => Ok(Algorithm::Aes256Gcm),
            "chacha20-poly1305" => Ok(Algorithm::ChaCha20Poly1305),
            other => Err(Error::InvalidArgument(format!("unknown algorithm: {}", other))),
        }
    }
}

/// How the cipher for a new upload is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmPolicy {
    /// Uniformly random among the supported ciphers
    Random,
    /// Always the given cipher
    Fixed(Algorithm),
}

impl AlgorithmPolicy {
    /// Pick the cipher for one file
    pub fn select(&self) -> Algorithm {
        match self {
            AlgorithmPolicy::Random => {
                let idx = rand::thread_rng().gen_range(0..Algorithm::ALL.len());
                Algorithm::ALL[idx]
            }
            AlgorithmPolicy::Fixed(algorithm) => *algorithm,
        }
    }
}

/// Master key material (zeroized on drop)
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
    salt: [u8; SALT_SIZE],
}

impl MasterKey {
    /// Derive the master key from a passphrase
    ///
    /// Uses the configured salt, or a fresh one before the store is initialized.
    pub fn from_password(password: &[u8], config: &EncryptionConfig) -> Result<Self> {
        let salt = configured_salt(config)?.unwrap_or_else(generate_salt);
        let key = stretch_passphrase(password, &salt, config)?;
        Ok(MasterKey { key, salt })
    }

    /// Wrap raw key bytes
    pub fn from_bytes(key: [u8; KEY_SIZE], salt: [u8; SALT_SIZE]) -> Self {
        MasterKey {
            key: Zeroizing::new(key),
            salt,
        }
    }

    /// Salt the key was derived with
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }
}

/// Derives per-file keys from the master key
pub struct KeyManager {
    master: MasterKey,
}

impl KeyManager {
    /// Create a key manager
    pub fn new(master: MasterKey) -> Self {
        KeyManager { master }
    }

    /// Salt of the master key
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        self.master.salt()
    }

    /// Key for one stored file
    pub fn file_key(&self, file_id: &Uuid) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let purpose = format!("{}{}", FILE_KEY_PREFIX, file_id);
        let salt = Salt::new(HKDF_SHA256, &self.master.salt);
        let prk = salt.extract(&self.master.key[..]);

        let mut output = Zeroizing::new([0u8; KEY_SIZE]);
        prk.expand(&[purpose.as_bytes()], HkdfKeyType)
            .map_err(|_| Error::KeyDerivation("HKDF expansion failed".to_string()))?
            .fill(&mut output[..])
            .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;

        Ok(output)
    }
}

struct HkdfKeyType;

impl ring::hkdf::KeyType for HkdfKeyType {
    fn len(&self) -> usize {
        KEY_SIZE
    }
}
