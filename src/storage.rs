//! On-disk layout for ciphertext, quarantine and temporary plaintext
//!
//! ```text
//! <data_dir>/objects/<2 hex>/<uuid>.enc   ciphertext
//! <quarantine root>/<uuid>.enc            quarantined ciphertext
//! <data_dir>/staging/                     temporary plaintext
//! ```
//! Temporary plaintext is always held by a [`TempPath`], which deletes the
//! file when dropped.

use crate::config::Config;
use crate::error::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Plaintext staged from an upload stream
pub struct StagedUpload {
    pub path: TempPath,
    pub len: u64,
}

/// Filesystem roots used by the engine
#[derive(Debug, Clone)]
pub struct ObjectStore {
    objects: PathBuf,
    quarantine: PathBuf,
    staging: PathBuf,
}

impl ObjectStore {
    pub fn new(config: &Config) -> Self {
        ObjectStore {
            objects: config.objects_dir(),
            quarantine: config.quarantine_dir(),
            staging: config.staging_dir(),
        }
    }

    /// Create the directory roots
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.objects)?;
        std::fs::create_dir_all(&self.quarantine)?;
        std::fs::create_dir_all(&self.staging)?;
        Ok(())
    }

    /// Path the ciphertext of `id` is stored at
    pub fn object_path(&self, id: &Uuid) -> PathBuf {
        let simple = id.simple().to_string();
        self.objects
            .join(&simple[..2])
            .join(format!("{}.enc", id))
    }

    /// Ciphertext path for a new object, with its fan-out directory created
    pub async fn allocate(&self, id: &Uuid) -> Result<PathBuf> {
        let path = self.object_path(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }

    /// Fresh, empty temporary file in the staging directory
    pub fn staging_path(&self) -> Result<TempPath> {
        let file = tempfile::Builder::new()
            .prefix("fw-")
            .suffix(".tmp")
            .tempfile_in(&self.staging)?;
        Ok(file.into_temp_path())
    }

    /// Copy an upload stream into staging, refusing more than `max_size` bytes
    pub async fn stage_upload<R>(&self, mut reader: R, max_size: u64) -> Result<StagedUpload>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.staging_path()?;
        let mut out = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut len = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            len += n as u64;
            if len > max_size {
                return Err(Error::UploadTooLarge { max: max_size });
            }
            out.write_all(&buf[..n]).await?;
        }
        out.flush().await?;
        out.sync_all().await?;

        debug!(path = %path.display(), bytes = len, "Staged upload");
        Ok(StagedUpload { path, len })
    }

    /// Remove a ciphertext object; `Ok(false)` if it was already gone
    pub async fn remove(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a path exists
    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Whether a path lies under the quarantine root
    pub fn is_quarantine_path(&self, path: &Path) -> bool {
        path.starts_with(&self.quarantine)
    }

    /// Move ciphertext into the quarantine root and return its new path
    ///
    /// Tries a rename first and falls back to copy and remove when the
    /// quarantine root is on another filesystem.
    pub async fn quarantine(&self, id: &Uuid, path: &Path) -> Result<PathBuf> {
        let dest = self.quarantine.join(format!("{}.enc", id));
        tokio::fs::create_dir_all(&self.quarantine).await?;

        match tokio::fs::rename(path, &dest).await {
            Ok(()) => return Ok(dest),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::FileMissing(path.to_path_buf()))
            }
            Err(e) => {
                warn!(file_id = %id, error = %e, "Rename into quarantine failed, copying instead");
            }
        }

        if let Err(e) = tokio::fs::copy(path, &dest).await {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(e.into());
        }
        tokio::fs::remove_file(path).await?;
        Ok(dest)
    }
}

/// Decrypted plaintext, readable once
///
/// Backed by a private temporary file that is removed when the stream is
/// dropped or [`finish`](Self::finish)ed. Only handed out after the whole
/// ciphertext has been authenticated.
pub struct DecryptedStream {
    file: tokio::fs::File,
    path: TempPath,
    len: u64,
}

impl DecryptedStream {
    /// Open a fully decrypted temporary file for reading
    pub async fn open(path: TempPath, len: u64) -> Result<Self> {
        let file = tokio::fs::File::open(&path).await?;
        Ok(DecryptedStream { file, path, len })
    }

    /// Plaintext length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Location of the temporary plaintext
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stream the remaining plaintext into `writer`, then clean up
    pub async fn copy_to<W>(mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let copied = tokio::io::copy(&mut self.file, writer).await?;
        writer.flush().await?;
        self.finish()?;
        Ok(copied)
    }

    /// Read the remaining plaintext into memory, then clean up
    pub async fn read_to_vec(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len as usize);
        self.file.read_to_end(&mut out).await?;
        self.finish()?;
        Ok(out)
    }

    /// Close the stream and remove the temporary file, reporting removal errors
    pub fn finish(self) -> Result<()> {
        let DecryptedStream { file, path, .. } = self;
        drop(file);
        path.close()?;
        Ok(())
    }
}

impl AsyncRead for DecryptedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> ObjectStore {
        let mut config = Config::default();
        config.data_dir = dir.to_path_buf();
        let store = ObjectStore::new(&config);
        store.ensure_dirs().unwrap();
        store
    }

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir.join("staging")).unwrap().count()
    }

    #[test]
    fn test_object_path_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = Uuid::new_v4();

        let path = store.object_path(&id);
        let fan = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        assert_eq!(fan, &id.simple().to_string()[..2]);
        assert!(path.to_str().unwrap().ends_with(".enc"));
    }

    #[tokio::test]
    async fn test_stage_upload_enforces_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let staged = store.stage_upload(&b"hello"[..], 5).await.unwrap();
        assert_eq!(staged.len, 5);
        assert_eq!(std::fs::read(&staged.path).unwrap(), b"hello");
        drop(staged);

        let result = store.stage_upload(&b"hello!"[..], 5).await;
        assert!(matches!(result, Err(Error::UploadTooLarge { max: 5 })));
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_decrypted_stream_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let path = store.staging_path().unwrap();
        std::fs::write(&path, b"plaintext").unwrap();
        let stream = DecryptedStream::open(path, 9).await.unwrap();
        assert_eq!(stream.read_to_vec().await.unwrap(), b"plaintext");
        assert_eq!(staged_files(dir.path()), 0);

        let path = store.staging_path().unwrap();
        let stream = DecryptedStream::open(path, 0).await.unwrap();
        drop(stream);
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_quarantine_moves_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = Uuid::new_v4();

        let path = store.allocate(&id).await.unwrap();
        std::fs::write(&path, b"cipher").unwrap();

        let moved = store.quarantine(&id, &path).await.unwrap();
        assert!(!path.exists());
        assert!(store.is_quarantine_path(&moved));
        assert_eq!(std::fs::read(&moved).unwrap(), b"cipher");

        let again = store.quarantine(&id, &path).await;
        assert!(matches!(again, Err(Error::FileMissing(_))));
    }

    #[tokio::test]
    async fn test_remove_missing_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(!store.remove(&dir.path().join("nope.enc")).await.unwrap());
    }
}
