//! Lock password hashing
//!
//! File locks store an Argon2id PHC string. Call sites only see the
//! [`PasswordHasher`] trait, so the cost parameters can change without
//! touching them; existing hashes keep verifying because the PHC string
//! carries its own parameters.

use super::kdf::argon2_params;
use crate::config::LifecycleConfig;
use crate::error::{Error, Result};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString,
};
use argon2::{Algorithm, Argon2, Params, Version};

/// Slow, salted password hashing
pub trait PasswordHasher: Send + Sync {
    /// Hash a password into a self-describing string
    fn hash(&self, password: &str) -> Result<String>;

    /// Check a password against a stored hash
    fn verify(&self, password: &str, hash: &str) -> Result<bool>;
}

/// Argon2id implementation of [`PasswordHasher`]
pub struct Argon2PasswordHasher {
    params: Params,
}

impl Argon2PasswordHasher {
    /// Create a hasher with explicit cost parameters
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self> {
        let params = argon2_params(memory_kib, iterations, parallelism, None)?;
        Ok(Argon2PasswordHasher { params })
    }

    /// Create a hasher from the lifecycle configuration
    pub fn from_config(config: &LifecycleConfig) -> Result<Self> {
        Self::new(
            config.lock_hash_memory_kib,
            config.lock_hash_iterations,
            config.lock_hash_parallelism,
        )
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl PasswordHasher for Argon2PasswordHasher {
    fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::internal(format!("password hashing failed: {}", e)))?;
        Ok(hash.to_string())
    }

    fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| Error::Deserialization(format!("bad password hash: {}", e)))?;
        Ok(self
            .argon2()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> Argon2PasswordHasher {
        Argon2PasswordHasher::new(1024, 1, 1).unwrap()
    }

    #[test]
    fn test_hash_and_verify() {
        let hasher = hasher();
        let hash = hasher.hash("hunter22").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("hunter22", &hash).unwrap());
        assert!(!hasher.verify("hunter23", &hash).unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        let hasher = hasher();
        assert_ne!(hasher.hash("same").unwrap(), hasher.hash("same").unwrap());
    }

    #[test]
    fn test_verify_survives_cost_change() {
        let hash = hasher().hash("pass").unwrap();
        let stronger = Argon2PasswordHasher::new(2048, 2, 1).unwrap();
        assert!(stronger.verify("pass", &hash).unwrap());
    }

    #[test]
    fn test_garbage_hash_is_an_error() {
        assert!(hasher().verify("pass", "not-a-hash").is_err());
    }
}
