//! Error types for filewarden

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Broad category of an error, used by callers to pick a user-facing message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Lifecycle or sharing policy refused the operation
    Policy,
    /// Stored bytes are missing or the filesystem refused an operation
    Disk,
    /// Encryption, decryption or integrity failure
    Crypto,
    /// Malware scanning refused or could not complete
    Scan,
    /// Caller supplied something unusable
    Input,
    /// Everything else
    Internal,
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    // Crypto
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Decryption rejected: authentication tag mismatch")]
    DecryptionAuthFailure,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Integrity mismatch: stored digest {stored}, current digest {current}")]
    IntegrityMismatch { stored: String, current: String },

    // Disk
    #[error("Ciphertext missing on disk: {0}")]
    FileMissing(PathBuf),

    #[error("Cannot restore: ciphertext no longer exists at {0}")]
    MissingOnDisk(PathBuf),

    // Scanning
    #[error("Malware scanner unavailable")]
    ScannerUnavailable,

    #[error("Threat detected: {0}")]
    ScanInfected(String),

    #[error("Malware scan failed: {0}")]
    ScanError(String),

    // Lifecycle policy
    #[error("File has expired")]
    Expired,

    #[error("File has been revoked")]
    Revoked,

    #[error("File is locked; the lock password is required")]
    Locked,

    #[error("Download limit reached")]
    DownloadLimitExceeded,

    #[error("File is not revoked")]
    NotRevoked,

    #[error("File is not locked")]
    NotLocked,

    #[error("Incorrect lock password")]
    InvalidPassword,

    #[error("Lock password must be at least {min} characters")]
    PasswordTooShort { min: usize },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Storage limit exceeded: {used} + {requested} bytes exceeds {limit}")]
    StorageQuotaExceeded { used: u64, requested: u64, limit: u64 },

    #[error("Upload exceeds the maximum size of {max} bytes")]
    UploadTooLarge { max: u64 },

    // Sharing
    #[error("Invalid or expired share token")]
    InvalidOrExpiredShareToken,

    #[error("Invalid or expired verification code")]
    InvalidVerificationCode,

    #[error("Could not notify the file owner: {0}")]
    NotificationFailed(String),

    // Metadata
    #[error("File not found: {0}")]
    FileNotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error from anything displayable
    pub fn internal<T: std::fmt::Display>(msg: T) -> Self {
        Error::Internal(msg.to_string())
    }

    /// Category of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Expired
            | Error::Revoked
            | Error::Locked
            | Error::DownloadLimitExceeded
            | Error::NotRevoked
            | Error::NotLocked
            | Error::InvalidPassword
            | Error::PermissionDenied(_)
            | Error::StorageQuotaExceeded { .. }
            | Error::InvalidOrExpiredShareToken
            | Error::InvalidVerificationCode => ErrorClass::Policy,

            Error::FileMissing(_) | Error::MissingOnDisk(_) | Error::Io(_) => ErrorClass::Disk,

            Error::Encryption(_)
            | Error::Decryption(_)
            | Error::DecryptionAuthFailure
            | Error::KeyDerivation(_)
            | Error::IntegrityMismatch { .. } => ErrorClass::Crypto,

            Error::ScannerUnavailable | Error::ScanInfected(_) | Error::ScanError(_) => {
                ErrorClass::Scan
            }

            Error::PasswordTooShort { .. }
            | Error::UploadTooLarge { .. }
            | Error::InvalidArgument(_)
            | Error::FileNotFound(_) => ErrorClass::Input,

            Error::Database(_)
            | Error::Serialization(_)
            | Error::Deserialization(_)
            | Error::Config(_)
            | Error::InvalidConfig(_)
            | Error::NotificationFailed(_)
            | Error::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether the error comes from a lifecycle or sharing rule
    pub fn is_policy(&self) -> bool {
        self.class() == ErrorClass::Policy
    }

    /// Whether the error comes from the stored bytes or the filesystem
    pub fn is_disk(&self) -> bool {
        self.class() == ErrorClass::Disk
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("blocking task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_and_disk_are_distinct() {
        assert!(Error::Revoked.is_policy());
        assert!(Error::Expired.is_policy());
        assert!(!Error::Revoked.is_disk());

        let missing = Error::FileMissing(PathBuf::from("/tmp/x.enc"));
        assert!(missing.is_disk());
        assert!(!missing.is_policy());
    }

    #[test]
    fn test_scan_and_crypto_classes() {
        assert_eq!(Error::ScannerUnavailable.class(), ErrorClass::Scan);
        assert_eq!(Error::ScanInfected("Eicar".into()).class(), ErrorClass::Scan);
        assert_eq!(Error::DecryptionAuthFailure.class(), ErrorClass::Crypto);
    }
}
