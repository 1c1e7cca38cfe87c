//! Configuration management for filewarden

use crate::crypto::AlgorithmPolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default streaming chunk size: 64KiB (multiple of the AES block size)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default per-user storage limit: 1GiB
pub const DEFAULT_STORAGE_LIMIT: u64 = 1024 * 1024 * 1024;

/// Default maximum upload size: 100MiB
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 100 * 1024 * 1024;

/// Longest accepted share link lifetime
pub const MAX_LINK_TTL_DAYS: i64 = 365;

/// Longest accepted verification code lifetime: one day
pub const MAX_CODE_TTL_MINUTES: i64 = 24 * 60;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage layout and quotas
    pub storage: StorageConfig,

    /// Encryption configuration
    pub encryption: EncryptionConfig,

    /// Malware scanner configuration
    pub scanner: ScannerConfig,

    /// Lifecycle policy configuration
    pub lifecycle: LifecycleConfig,

    /// Share link configuration
    pub share: ShareConfig,

    /// Path to the data directory
    pub data_dir: PathBuf,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Quarantine root (defaults to `<data_dir>/quarantine`)
    pub quarantine_dir: Option<PathBuf>,

    /// Per-user storage limit in bytes
    pub default_storage_limit: u64,

    /// Largest accepted upload in bytes
    pub max_upload_size: u64,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB (master key)
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Salt for master key derivation (generated on init)
    #[serde(with = "hex_serde")]
    pub salt: Vec<u8>,

    /// Cipher selection policy for new uploads
    pub algorithm: AlgorithmPolicy,

    /// Streaming chunk size in bytes
    pub chunk_size: usize,
}

/// Scanner backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScannerBackend {
    /// ClamAV command-line scanners
    ClamAv,
    /// No scanner; every file stays pending
    Disabled,
}

/// Malware scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Which backend to use
    pub backend: ScannerBackend,

    /// Daemon client binary, tried first
    pub daemon_binary: String,

    /// Standalone scanner binary, used when the daemon client fails
    pub binary: String,

    /// Hard limit for a single scan
    pub timeout_secs: u64,

    /// How long an availability probe stays valid
    pub availability_ttl_secs: u64,

    /// Scan decrypted bytes before every download
    pub scan_on_download: bool,
}

/// Lifecycle policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Minimum lock password length. A usability floor only; it does not make
    /// short passwords safe.
    pub min_lock_password_len: usize,

    /// Argon2 memory cost in KiB for lock passwords
    pub lock_hash_memory_kib: u32,

    /// Argon2 iterations for lock passwords
    pub lock_hash_iterations: u32,

    /// Argon2 parallelism for lock passwords
    pub lock_hash_parallelism: u32,

    /// Re-hash the ciphertext before every download
    pub verify_integrity_on_download: bool,

    /// Files verified concurrently during a system integrity check
    pub integrity_concurrency: usize,
}

/// Share link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Share link lifetime in days
    pub link_ttl_days: i64,

    /// Verification code lifetime in minutes
    pub code_ttl_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("filewarden");

        Config {
            storage: StorageConfig::default(),
            encryption: EncryptionConfig::default(),
            scanner: ScannerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            share: ShareConfig::default(),
            data_dir,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            quarantine_dir: None,
            default_storage_limit: DEFAULT_STORAGE_LIMIT,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            argon2_memory_kib: 65536, // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
            salt: Vec::new(), // Generated by `init`
            algorithm: AlgorithmPolicy::Random,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            backend: ScannerBackend::ClamAv,
            daemon_binary: "clamdscan".to_string(),
            binary: "clamscan".to_string(),
            timeout_secs: 60,
            availability_ttl_secs: 300,
            scan_on_download: true,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            min_lock_password_len: 4,
            lock_hash_memory_kib: 19456,
            lock_hash_iterations: 2,
            lock_hash_parallelism: 1,
            verify_integrity_on_download: true,
            integrity_concurrency: 4,
        }
    }
}

impl Default for ShareConfig {
    fn default() -> Self {
        ShareConfig {
            link_ttl_days: 7,
            code_ttl_minutes: 30,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("FILEWARDEN_DATA_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(backend) = std::env::var("FILEWARDEN_SCANNER") {
            match backend.trim().to_ascii_lowercase().as_str() {
                "clamav" => self.scanner.backend = ScannerBackend::ClamAv,
                "disabled" | "none" | "off" => self.scanner.backend = ScannerBackend::Disabled,
                _ => {}
            }
        }

        if let Ok(timeout) = std::env::var("FILEWARDEN_SCAN_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.trim().parse::<u64>() {
                self.scanner.timeout_secs = secs;
            }
        }

        if let Ok(limit) = std::env::var("FILEWARDEN_STORAGE_LIMIT") {
            if let Ok(bytes) = limit.trim().parse::<u64>() {
                self.storage.default_storage_limit = bytes;
            }
        }

        if let Ok(chunk_size) = std::env::var("FILEWARDEN_CHUNK_SIZE") {
            if let Ok(size) = chunk_size.trim().parse::<usize>() {
                self.encryption.chunk_size = size;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let chunk_size = self.encryption.chunk_size;
        if chunk_size == 0 || chunk_size % 16 != 0 {
            return Err(Error::InvalidConfig(
                "Chunk size must be a non-zero multiple of 16".to_string(),
            ));
        }

        if self.scanner.timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "Scanner timeout must be greater than 0".to_string(),
            ));
        }

        if self.lifecycle.min_lock_password_len == 0 {
            return Err(Error::InvalidConfig(
                "Minimum lock password length must be at least 1".to_string(),
            ));
        }

        if self.lifecycle.integrity_concurrency == 0 {
            return Err(Error::InvalidConfig(
                "Integrity concurrency must be at least 1".to_string(),
            ));
        }

        if !(1..=MAX_LINK_TTL_DAYS).contains(&self.share.link_ttl_days) {
            return Err(Error::InvalidConfig(format!(
                "Share link lifetime must be between 1 and {} days",
                MAX_LINK_TTL_DAYS
            )));
        }

        if !(1..=MAX_CODE_TTL_MINUTES).contains(&self.share.code_ttl_minutes) {
            return Err(Error::InvalidConfig(format!(
                "Verification code lifetime must be between 1 and {} minutes",
                MAX_CODE_TTL_MINUTES
            )));
        }

        let quarantine = self.quarantine_dir();
        if quarantine.starts_with(self.objects_dir()) || self.objects_dir().starts_with(&quarantine)
        {
            return Err(Error::InvalidConfig(
                "Quarantine root must be separate from the object store".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory holding ciphertext objects
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    /// Directory holding quarantined ciphertext
    pub fn quarantine_dir(&self) -> PathBuf {
        self.storage
            .quarantine_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("quarantine"))
    }

    /// Directory holding temporary plaintext
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    /// Path of the metadata database
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("metadata.db")
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.objects_dir())?;
        std::fs::create_dir_all(self.quarantine_dir())?;
        std::fs::create_dir_all(self.staging_dir())?;
        Ok(())
    }
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
