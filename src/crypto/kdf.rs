//! Master key stretching
//!
//! The operator passphrase goes through Argon2id once per process to produce
//! the master key; per-file keys are expanded from it with HKDF. The salt is
//! written by `filewarden init` and must be exactly [`SALT_SIZE`] bytes.

use crate::config::EncryptionConfig;
use crate::crypto::{KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroizing;

/// Validated Argon2 cost parameters
pub(crate) fn argon2_params(
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
    output_len: Option<usize>,
) -> Result<Params> {
    Params::new(memory_kib, iterations, parallelism, output_len)
        .map_err(|e| Error::InvalidConfig(format!("Invalid Argon2 parameters: {}", e)))
}

/// Salt stored in the configuration, if init has run
pub fn configured_salt(config: &EncryptionConfig) -> Result<Option<[u8; SALT_SIZE]>> {
    if config.salt.is_empty() {
        return Ok(None);
    }
    let salt: [u8; SALT_SIZE] = config.salt.as_slice().try_into().map_err(|_| {
        Error::KeyDerivation(format!(
            "configured salt is {} bytes, expected {}",
            config.salt.len(),
            SALT_SIZE
        ))
    })?;
    Ok(Some(salt))
}

/// Stretch a passphrase into master key bytes
pub fn stretch_passphrase(
    passphrase: &[u8],
    salt: &[u8; SALT_SIZE],
    config: &EncryptionConfig,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let params = argon2_params(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )?;

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passphrase, salt, &mut key[..])
        .map_err(|e| Error::KeyDerivation(format!("Argon2id failed: {}", e)))?;
    Ok(key)
}

/// Fresh random salt for a new store
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
