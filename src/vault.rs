//! Sealing and opening stored objects
//!
//! Joins per-file key derivation, the streaming cipher and the object store.
//! All cipher work runs on the blocking pool.

use crate::crypto::{decrypt_file, encrypt_file, AlgorithmPolicy, EncryptionOutput, KeyManager};
use crate::error::Result;
use crate::integrity::hash_file;
use crate::metadata::StoredFile;
use crate::storage::{DecryptedStream, ObjectStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Ciphertext written for a new object
#[derive(Debug, Clone)]
pub struct SealedObject {
    pub path: PathBuf,
    pub encryption: EncryptionOutput,
    pub chunk_size: usize,
    /// Hex SHA-256 of the ciphertext
    pub content_hash: String,
}

/// Encrypts into and decrypts out of the object store
pub struct Vault {
    keys: Arc<KeyManager>,
    objects: ObjectStore,
    chunk_size: usize,
    policy: AlgorithmPolicy,
}

impl Vault {
    pub fn new(
        keys: Arc<KeyManager>,
        objects: ObjectStore,
        chunk_size: usize,
        policy: AlgorithmPolicy,
    ) -> Self {
        Vault {
            keys,
            objects,
            chunk_size,
            policy,
        }
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// Encrypt staged plaintext into the object slot for `id` and hash the result
    ///
    /// On failure no ciphertext is left behind.
    pub async fn seal(&self, id: Uuid, plaintext: &Path) -> Result<SealedObject> {
        let dst = self.objects.allocate(&id).await?;
        let key = self.keys.file_key(&id)?;
        let algorithm = self.policy.select();
        let chunk_size = self.chunk_size;
        let src = plaintext.to_path_buf();

        let sealed = tokio::task::spawn_blocking(move || -> Result<SealedObject> {
            let encryption = encrypt_file(&key, algorithm, chunk_size, &src, &dst)?;
            match hash_file(&dst) {
                Ok(content_hash) => Ok(SealedObject {
                    path: dst,
                    encryption,
                    chunk_size,
                    content_hash,
                }),
                Err(e) => {
                    let _ = std::fs::remove_file(&dst);
                    Err(e)
                }
            }
        })
        .await??;

        debug!(
            file_id = %id,
            algorithm = %sealed.encryption.algorithm,
            bytes = sealed.encryption.ciphertext_len,
            "Sealed object"
        );
        Ok(sealed)
    }

    /// Decrypt a stored object into a private temporary file
    ///
    /// The stream is only returned once every byte has been decrypted and,
    /// for AEAD ciphers, authenticated.
    pub async fn open(&self, file: &StoredFile) -> Result<DecryptedStream> {
        let temp = self.objects.staging_path()?;
        let key = self.keys.file_key(&file.id)?;
        let algorithm = file.encryption_algorithm;
        let iv = file.iv.clone();
        let auth_tag = file.auth_tag.clone();
        let chunk_size = file.chunk_size;
        let src = file.ciphertext_path.clone();
        let dst = temp.to_path_buf();

        let len = tokio::task::spawn_blocking(move || {
            decrypt_file(
                &key,
                algorithm,
                &iv,
                auth_tag.as_deref(),
                chunk_size,
                &src,
                &dst,
            )
        })
        .await??;

        DecryptedStream::open(temp, len).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::{Algorithm, MasterKey, KEY_SIZE, SALT_SIZE};
    use crate::error::Error;
    use chrono::Utc;

    fn vault(dir: &Path, algorithm: Algorithm) -> Vault {
        let mut config = Config::default();
        config.data_dir = dir.to_path_buf();
        let objects = ObjectStore::new(&config);
        objects.ensure_dirs().unwrap();
        let keys = Arc::new(KeyManager::new(MasterKey::from_bytes(
            [1u8; KEY_SIZE],
            [2u8; SALT_SIZE],
        )));
        Vault::new(keys, objects, 1024, AlgorithmPolicy::Fixed(algorithm))
    }

    fn record(id: Uuid, sealed: &SealedObject, size: u64) -> StoredFile {
        StoredFile::new(
            id,
            "alice",
            "a.bin",
            "application/octet-stream",
            size,
            sealed.path.clone(),
            sealed.encryption.algorithm,
            sealed.encryption.iv.clone(),
            sealed.encryption.auth_tag.clone(),
            sealed.chunk_size,
            sealed.content_hash.clone(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_seal_and_open() {
        let dir = tempfile::tempdir().unwrap();
        for algorithm in Algorithm::ALL {
            let vault = vault(dir.path(), algorithm);
            let plain = dir.path().join("plain");
            let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
            std::fs::write(&plain, &data).unwrap();

            let id = Uuid::new_v4();
            let sealed = vault.seal(id, &plain).await.unwrap();
            assert_eq!(sealed.encryption.algorithm, algorithm);
            assert_ne!(std::fs::read(&sealed.path).unwrap(), data);

            let stream = vault.open(&record(id, &sealed, 5000)).await.unwrap();
            assert_eq!(stream.len(), 5000);
            assert_eq!(stream.read_to_vec().await.unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_open_tampered_leaves_no_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(dir.path(), Algorithm::ChaCha20Poly1305);
        let plain = dir.path().join("plain");
        std::fs::write(&plain, vec![9u8; 3000]).unwrap();

        let id = Uuid::new_v4();
        let sealed = vault.seal(id, &plain).await.unwrap();
        let mut bytes = std::fs::read(&sealed.path).unwrap();
        bytes[2000] ^= 1;
        std::fs::write(&sealed.path, bytes).unwrap();

        let result = vault.open(&record(id, &sealed, 3000)).await;
        assert!(matches!(result, Err(Error::DecryptionAuthFailure)));
        let leftovers = std::fs::read_dir(dir.path().join("staging")).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
