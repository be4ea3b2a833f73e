//! A filesystem whose files are the output of a secret command.
//!
//! Nothing is listable besides `.` and `..` in the root: a client has to know the exact name
//! of the secret it wants, because the backing command only answers exact keys. Every
//! operation resolves its path through the [`ContentCache`], so no state is carried between
//! calls and the order in which the kernel issues them does not matter.

use std::collections::HashSet;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    cache::{ContentCache, ContentError},
    fetch::SecretSource,
    fs::{DirEntry, DirEntryType, FileAttr, Fs, OpenFile, OpenFlags, Permissions, ROOT},
};

/// `getattr` failures. Mapped to `ENOENT`.
#[derive(Debug, Error)]
pub enum GetAttrError {
    /// The secret could not be fetched.
    #[error("not found: {0}")]
    NotFound(#[from] ContentError),
}

impl From<GetAttrError> for i32 {
    fn from(e: GetAttrError) -> Self {
        match e {
            GetAttrError::NotFound(_) => libc::ENOENT,
        }
    }
}

/// `readdir` failures. Mapped to `ENOENT`.
#[derive(Debug, Error)]
pub enum ReadDirError {
    /// Only the root can be listed.
    #[error("not a listable directory: {0}")]
    NotFound(String),
}

impl From<ReadDirError> for i32 {
    fn from(e: ReadDirError) -> Self {
        match e {
            ReadDirError::NotFound(_) => libc::ENOENT,
        }
    }
}

/// `open` failures.
#[derive(Debug, Error)]
pub enum OpenError {
    /// Write access was requested. Mapped to `EACCES`.
    #[error("only read-only access is supported")]
    PermissionDenied,

    /// The secret could not be fetched. Mapped to `ENOENT`.
    #[error("not found: {0}")]
    NotFound(#[from] ContentError),
}

impl From<OpenError> for i32 {
    fn from(e: OpenError) -> Self {
        match e {
            OpenError::PermissionDenied => libc::EACCES,
            OpenError::NotFound(_) => libc::ENOENT,
        }
    }
}

/// `read` failures. Mapped to `ENOENT`.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The secret could not be fetched.
    #[error("not found: {0}")]
    NotFound(#[from] ContentError),
}

impl From<ReadError> for i32 {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::NotFound(_) => libc::ENOENT,
        }
    }
}

/// Read-only filesystem serving one secret at a time through a [`ContentCache`].
pub struct SecretFs<S> {
    cache: ContentCache<S>,
    /// Paths reported as (empty) directories besides the root.
    directories: HashSet<String>,
}

impl<S: SecretSource> SecretFs<S> {
    /// A filesystem whose only directory is the root.
    pub fn new(cache: ContentCache<S>) -> Self {
        Self {
            cache,
            directories: HashSet::new(),
        }
    }

    /// Declare paths that should stat as directories instead of being fetched.
    ///
    /// They are never listed in the root and cannot be listed themselves; they only let the
    /// kernel walk to nested secret names such as `/certs/HTTP/server.pem`.
    #[must_use]
    pub fn with_directories<I, P>(mut self, directories: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.directories = directories.into_iter().map(Into::into).collect();
        self
    }

    /// The cache every operation goes through.
    pub fn cache(&self) -> &ContentCache<S> {
        &self.cache
    }

    fn is_directory(&self, path: &str) -> bool {
        path == ROOT || self.directories.contains(path)
    }
}

#[async_trait]
impl<S: SecretSource> Fs for SecretFs<S> {
    type GetAttrError = GetAttrError;
    type OpenError = OpenError;
    type ReadError = ReadError;
    type ReaddirError = ReadDirError;

    #[instrument(name = "SecretFs::getattr", skip(self))]
    async fn getattr(&self, path: &str) -> Result<FileAttr, GetAttrError> {
        if self.is_directory(path) {
            return Ok(FileAttr::Directory {
                perm: Permissions::DIRECTORY,
            });
        }

        let entry = self.cache.get_content(path).await?;
        Ok(FileAttr::RegularFile {
            perm: Permissions::READ_ONLY,
            size: entry.len(),
            mtime: entry.mtime,
        })
    }

    #[instrument(name = "SecretFs::readdir", skip(self))]
    async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, ReadDirError> {
        if path != ROOT {
            return Err(ReadDirError::NotFound(path.to_owned()));
        }

        Ok(vec![
            DirEntry {
                name: ".".into(),
                kind: DirEntryType::Directory,
            },
            DirEntry {
                name: "..".into(),
                kind: DirEntryType::Directory,
            },
        ])
    }

    #[instrument(name = "SecretFs::open", skip(self))]
    async fn open(&self, path: &str, flags: OpenFlags) -> Result<OpenFile, OpenError> {
        if !flags.is_read_only() {
            return Err(OpenError::PermissionDenied);
        }

        self.cache.get_content(path).await?;
        // Reads re-resolve through the cache by path, so the handle carries nothing.
        Ok(OpenFile { handle: 0 })
    }

    #[instrument(name = "SecretFs::read", skip(self))]
    async fn read(&self, path: &str, offset: u64, size: u32) -> Result<Bytes, ReadError> {
        let entry = self.cache.get_content(path).await?;
        let data = entry.slice(offset, size);
        debug!(length = entry.len(), returned = data.len(), "serving read");
        Ok(data)
    }
}
