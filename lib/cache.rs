//! Single-slot content cache.
//!
//! The filesystem only ever exposes one real file at a time, so the cache holds exactly one
//! entry: the content of the path that was fetched last. Asking for any other path evicts it.

use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::fetch::{FetchError, SecretSource};

/// Why the cache could not produce content for a path.
#[derive(Debug, Error)]
pub enum ContentError {
    /// Paths must start with `/`. Nothing was fetched.
    #[error("path is not absolute: {0:?}")]
    InvalidPath(String),

    /// The source failed. The slot is empty afterwards.
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

/// The content of one successfully fetched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    /// The path the content was fetched for.
    pub path: String,
    /// The command's stdout, verbatim.
    pub content: Bytes,
    /// When the fetch that produced this entry completed.
    pub mtime: SystemTime,
}

impl CachedEntry {
    /// Content length in bytes, as reported in `st_size`.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.content.len() as u64
    }

    /// Whether the command printed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Returns at most `size` bytes starting at `offset`. Reading at or past the end yields an
    /// empty buffer.
    #[must_use]
    pub fn slice(&self, offset: u64, size: u32) -> Bytes {
        let Ok(start) = usize::try_from(offset) else {
            return Bytes::new();
        };
        if start >= self.content.len() {
            return Bytes::new();
        }
        let end = start.saturating_add(size as usize).min(self.content.len());
        self.content.slice(start..end)
    }
}

/// Capacity-one cache in front of a [`SecretSource`].
///
/// Lookup, eviction and refill happen under a single lock that is held across the fetch, so
/// two concurrent requests for different paths can never interleave and observe an entry
/// whose label does not match its content.
pub struct ContentCache<S> {
    source: S,
    slot: Mutex<Option<CachedEntry>>,
}

impl<S: SecretSource> ContentCache<S> {
    /// An empty cache over `source`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            slot: Mutex::new(None),
        }
    }

    /// The backing source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Get the content for `path`, fetching it if the slot holds anything else.
    ///
    /// There is no freshness check: once fetched, a path is served from memory until a
    /// different path is requested.
    #[instrument(name = "ContentCache::get_content", skip(self))]
    pub async fn get_content(&self, path: &str) -> Result<CachedEntry, ContentError> {
        if !path.starts_with('/') {
            return Err(ContentError::InvalidPath(path.to_owned()));
        }

        let mut slot = self.slot.lock().await;

        if let Some(entry) = slot.as_ref() {
            if entry.path == path {
                debug!("cache hit");
                return Ok(entry.clone());
            }
            info!(evicted = %entry.path, "Evicting cached secret.");
        }
        // Release the old buffer before fetching so a failed fetch leaves nothing behind.
        *slot = None;

        match self.source.fetch(path).await {
            Ok(content) => {
                let entry = CachedEntry {
                    path: path.to_owned(),
                    content,
                    mtime: SystemTime::now(),
                };
                debug!(length = entry.len(), "cached fetched content");
                Ok(slot.insert(entry).clone())
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch secret.");
                Err(e.into())
            }
        }
    }

    /// A snapshot of the slot without triggering a fetch.
    pub async fn current(&self) -> Option<CachedEntry> {
        self.slot.lock().await.clone()
    }

    /// Drop whatever is cached. The next request fetches again.
    pub async fn invalidate(&self) {
        self.slot.lock().await.take();
    }
}
