//! filewarden - Secure file lifecycle engine
//!
//! Files are encrypted at rest, scanned for malware, hash-verified against
//! tampering and released only while their lifecycle allows it: not expired,
//! not revoked, within the download limit, unlocked, and for external shares
//! only after a verification code has been confirmed.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod lifecycle;
pub mod metadata;
pub mod notify;
pub mod quota;
pub mod scan;
pub mod share;
pub mod storage;
pub mod vault;

pub use config::Config;
pub use engine::{Caller, Download, DownloadOptions, Engine, EngineBuilder, Role, UploadMeta, Usage};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{Caller, DownloadOptions, Engine, UploadMeta};
    pub use crate::error::{Error, Result};
    pub use crate::lifecycle::ExpiryUnit;
    pub use crate::metadata::{ScanStatus, StoredFile};
}
