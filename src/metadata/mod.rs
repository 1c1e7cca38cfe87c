//! Metadata storage module
//!
//! Stores one serialized [`StoredFile`] per uploaded object in sled.

mod record;
mod store;

pub use record::{check_access, is_accessible, AccessGrant, ScanStatus, StoredFile, HASH_ALGORITHM};
pub use store::MetadataStore;

#[cfg(test)]
pub(crate) use record::sample;
