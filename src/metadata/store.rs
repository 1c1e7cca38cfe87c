//! sled-backed metadata store
//!
//! Records live in the `files` tree keyed by the 16 raw bytes of the file id.
//! Mutations are optimistic: read, apply a closure, compare-and-swap, retry
//! on conflict. The `share_tokens` tree maps a token to its file id; entries
//! may go stale and lookups confirm the token against the record itself.

use super::record::StoredFile;
use crate::error::{Error, Result};
use std::path::Path;
use tracing::{debug, trace};
use uuid::Uuid;

const FILES_TREE: &str = "files";
const SHARE_TOKENS_TREE: &str = "share_tokens";
const USAGE_TREE: &str = "usage";

/// Persistent metadata store
#[derive(Clone)]
pub struct MetadataStore {
    db: sled::Db,
    files: sled::Tree,
    share_tokens: sled::Tree,
}

impl MetadataStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Open a throwaway in-memory store
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let files = db.open_tree(FILES_TREE)?;
        let share_tokens = db.open_tree(SHARE_TOKENS_TREE)?;
        Ok(MetadataStore {
            db,
            files,
            share_tokens,
        })
    }

    /// Tree holding per-user storage usage
    pub fn usage_tree(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree(USAGE_TREE)?)
    }

    /// Insert a new record; fails if the id is already taken
    pub fn insert(&self, file: &StoredFile) -> Result<()> {
        let bytes = file.to_bytes()?;
        self.files
            .compare_and_swap(file.id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .map_err(|_| Error::internal(format!("file id {} already exists", file.id)))?;

        if let Some(token) = &file.share_token {
            self.share_tokens
                .insert(token.as_bytes(), &file.id.as_bytes()[..])?;
        }
        trace!(file_id = %file.id, "Inserted file record");
        Ok(())
    }

    /// Fetch a record
    pub fn get(&self, id: &Uuid) -> Result<Option<StoredFile>> {
        match self.files.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(StoredFile::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch a record that must exist
    pub fn require(&self, id: &Uuid) -> Result<StoredFile> {
        self.get(id)?.ok_or(Error::FileNotFound(*id))
    }

    /// Atomically apply `f` to a record and return the stored result
    ///
    /// `f` may run more than once when another writer wins the race, so it
    /// must only depend on the record it is handed. If `f` fails nothing is
    /// written and the error is returned.
    pub fn update<F>(&self, id: &Uuid, mut f: F) -> Result<StoredFile>
    where
        F: FnMut(&mut StoredFile) -> Result<()>,
    {
        let key = id.as_bytes();
        loop {
            let current = self.files.get(key)?.ok_or(Error::FileNotFound(*id))?;
            let before = StoredFile::from_bytes(&current)?;
            let mut file = before.clone();
            f(&mut file)?;

            let encoded = file.to_bytes()?;
            match self
                .files
                .compare_and_swap(key, Some(&current[..]), Some(encoded))?
            {
                Ok(()) => {
                    self.sync_share_index(&before, &file)?;
                    return Ok(file);
                }
                Err(_) => {
                    debug!(file_id = %id, "Concurrent metadata update, retrying");
                }
            }
        }
    }

    fn sync_share_index(&self, before: &StoredFile, after: &StoredFile) -> Result<()> {
        if before.share_token == after.share_token {
            return Ok(());
        }
        if let Some(old) = &before.share_token {
            self.share_tokens.remove(old.as_bytes())?;
        }
        if let Some(new) = &after.share_token {
            self.share_tokens
                .insert(new.as_bytes(), &after.id.as_bytes()[..])?;
        }
        Ok(())
    }

    /// Remove a record, returning it if it existed
    pub fn remove(&self, id: &Uuid) -> Result<Option<StoredFile>> {
        match self.files.remove(id.as_bytes())? {
            Some(bytes) => {
                let file = StoredFile::from_bytes(&bytes)?;
                if let Some(token) = &file.share_token {
                    self.share_tokens.remove(token.as_bytes())?;
                }
                trace!(file_id = %id, "Removed file record");
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Find the record currently holding a share token
    pub fn find_by_share_token(&self, token: &str) -> Result<Option<StoredFile>> {
        let id_bytes = match self.share_tokens.get(token.as_bytes())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let id = Uuid::from_slice(&id_bytes)
            .map_err(|e| Error::Deserialization(format!("bad share index entry: {}", e)))?;

        match self.get(&id)? {
            Some(file) if file.share_token.as_deref() == Some(token) => Ok(Some(file)),
            _ => Ok(None),
        }
    }

    /// All records
    pub fn list(&self) -> Result<Vec<StoredFile>> {
        self.list_where(|_| true)
    }

    /// Records matching a predicate
    pub fn list_where<P>(&self, mut predicate: P) -> Result<Vec<StoredFile>>
    where
        P: FnMut(&StoredFile) -> bool,
    {
        let mut files = Vec::new();
        for item in self.files.iter() {
            let (_, bytes) = item?;
            let file = StoredFile::from_bytes(&bytes)?;
            if predicate(&file) {
                files.push(file);
            }
        }
        Ok(files)
    }

    /// Records owned by one user, newest first
    pub fn list_owned(&self, owner_id: &str) -> Result<Vec<StoredFile>> {
        let mut files = self.list_where(|f| f.owner_id == owner_id)?;
        files.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(files)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::record::sample;
    use std::sync::Arc;

    #[test]
    fn test_insert_get_remove() {
        let store = MetadataStore::temporary().unwrap();
        let file = sample("alice");

        store.insert(&file).unwrap();
        assert_eq!(store.require(&file.id).unwrap(), file);
        assert!(store.insert(&file).is_err());

        assert!(store.remove(&file.id).unwrap().is_some());
        assert!(matches!(store.require(&file.id), Err(Error::FileNotFound(_))));
    }

    #[test]
    fn test_update_failure_writes_nothing() {
        let store = MetadataStore::temporary().unwrap();
        let file = sample("alice");
        store.insert(&file).unwrap();

        let result = store.update(&file.id, |f| {
            f.download_count = 99;
            Err(Error::Revoked)
        });
        assert!(matches!(result, Err(Error::Revoked)));
        assert_eq!(store.require(&file.id).unwrap().download_count, 0);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(MetadataStore::temporary().unwrap());
        let file = sample("alice");
        store.insert(&file).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let id = file.id;
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store
                            .update(&id, |f| {
                                f.download_count += 1;
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.require(&file.id).unwrap().download_count, 200);
    }

    #[test]
    fn test_share_index_follows_record() {
        let store = MetadataStore::temporary().unwrap();
        let file = sample("alice");
        store.insert(&file).unwrap();

        store
            .update(&file.id, |f| {
                f.share_token = Some("first".into());
                Ok(())
            })
            .unwrap();
        assert!(store.find_by_share_token("first").unwrap().is_some());

        store
            .update(&file.id, |f| {
                f.share_token = Some("second".into());
                Ok(())
            })
            .unwrap();
        assert!(store.find_by_share_token("first").unwrap().is_none());
        assert_eq!(
            store.find_by_share_token("second").unwrap().unwrap().id,
            file.id
        );

        store.remove(&file.id).unwrap();
        assert!(store.find_by_share_token("second").unwrap().is_none());
    }

    #[test]
    fn test_list_owned() {
        let store = MetadataStore::temporary().unwrap();
        store.insert(&sample("alice")).unwrap();
        store.insert(&sample("alice")).unwrap();
        store.insert(&sample("bob")).unwrap();

        assert_eq!(store.list_owned("alice").unwrap().len(), 2);
        assert_eq!(store.list().unwrap().len(), 3);
    }
}
