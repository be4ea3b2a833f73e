//! Filesystem abstractions.
//!
//! This is a slightly cleaner, path-based interface than fuser's inode-based one. [`fuser`]
//! bridges the two.

/// FUSE adapter: maps [`::fuser::Filesystem`] callbacks onto an [`Fs`].
pub mod fuser;
/// The secret-backed filesystem.
pub mod secret;

use std::{ffi::OsString, time::SystemTime};

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;

/// The root path, the only listable directory.
pub const ROOT: &str = "/";

/// Opaque handle returned by `open`.
pub type FileHandle = u64;

bitflags! {
    /// Permission bits, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u16 {
        // Other
        /// --------x
        const OTHER_EXECUTE = 1 << 0;
        /// -------w-
        const OTHER_WRITE   = 1 << 1;
        /// ------r--
        const OTHER_READ    = 1 << 2;

        // Group
        /// -----x---
        const GROUP_EXECUTE = 1 << 3;
        /// ----w----
        const GROUP_WRITE   = 1 << 4;
        /// ---r-----
        const GROUP_READ    = 1 << 5;

        // Owner
        /// --x------
        const OWNER_EXECUTE = 1 << 6;
        /// -w-------
        const OWNER_WRITE   = 1 << 7;
        /// r--------
        const OWNER_READ    = 1 << 8;

        /// r--r--r--
        const READ_ONLY = Self::OWNER_READ.bits()
            | Self::GROUP_READ.bits()
            | Self::OTHER_READ.bits();
        /// rwxr-xr-x
        const DIRECTORY = Self::OWNER_READ.bits()
            | Self::OWNER_WRITE.bits()
            | Self::OWNER_EXECUTE.bits()
            | Self::GROUP_READ.bits()
            | Self::GROUP_EXECUTE.bits()
            | Self::OTHER_READ.bits()
            | Self::OTHER_EXECUTE.bits();
    }
}

bitflags! {
    /// Flags passed to open(2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        // Access modes (mutually exclusive)
        /// Zero, so never "contained". See [`OpenFlags::is_read_only`].
        const RDONLY = libc::O_RDONLY;
        /// Write only.
        const WRONLY = libc::O_WRONLY;
        /// Read and write.
        const RDWR = libc::O_RDWR;

        // Creation/status flags
        /// `O_APPEND`
        const APPEND = libc::O_APPEND;
        /// `O_TRUNC`
        const TRUNC = libc::O_TRUNC;
        /// `O_CREAT`
        const CREAT = libc::O_CREAT;
        /// `O_EXCL`
        const EXCL = libc::O_EXCL;

        // Behavior flags
        /// `O_NONBLOCK`
        const NONBLOCK = libc::O_NONBLOCK;
        /// `O_SYNC`
        const SYNC = libc::O_SYNC;
        /// `O_NOFOLLOW`
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// `O_CLOEXEC`
        const CLOEXEC = libc::O_CLOEXEC;
        /// `O_DIRECTORY`
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

impl OpenFlags {
    /// `O_RDONLY` is zero, so `contains` cannot answer whether a file is opened read-only.
    /// Compare the masked access mode instead.
    #[must_use]
    pub fn is_read_only(self) -> bool {
        self.bits() & libc::O_ACCMODE == libc::O_RDONLY
    }
}

impl From<i32> for OpenFlags {
    fn from(val: i32) -> Self {
        Self::from_bits_retain(val)
    }
}

/// What `getattr` knows about a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileAttr {
    /// A secret.
    RegularFile {
        /// Always [`Permissions::READ_ONLY`].
        perm: Permissions,
        /// Length of the fetched content.
        size: u64,
        /// When the content was fetched.
        mtime: SystemTime,
    },
    /// The root or a placeholder directory.
    Directory {
        /// Always [`Permissions::DIRECTORY`].
        perm: Permissions,
    },
}

impl FileAttr {
    /// 1 for files, 2 for directories.
    #[must_use]
    pub fn nlink(&self) -> u32 {
        match self {
            Self::RegularFile { .. } => 1,
            Self::Directory { .. } => 2,
        }
    }

    /// The permission bits of either variant.
    #[must_use]
    pub fn perm(&self) -> Permissions {
        match self {
            Self::RegularFile { perm, .. } | Self::Directory { perm } => *perm,
        }
    }
}

/// The kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirEntryType {
    /// A secret.
    RegularFile,
    /// A directory, including `.` and `..`.
    Directory,
}

impl From<FileAttr> for DirEntryType {
    fn from(attr: FileAttr) -> Self {
        match attr {
            FileAttr::RegularFile { .. } => Self::RegularFile,
            FileAttr::Directory { .. } => Self::Directory,
        }
    }
}

/// One entry returned by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntry {
    /// The entry's name within its directory.
    pub name: OsString,
    /// File or directory.
    pub kind: DirEntryType,
}

/// The result of a successful `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenFile {
    /// Handed back to the kernel; reads do not use it.
    pub handle: FileHandle,
}

/// The operations a read-only, path-addressed filesystem has to answer.
///
/// Every method takes `&self`: implementations must be reentrant, since the adapter runs each
/// request as its own task.
#[async_trait]
pub trait Fs: Send + Sync {
    /// Error returned by [`Fs::getattr`].
    type GetAttrError: std::error::Error + Send;
    /// Error returned by [`Fs::open`].
    type OpenError: std::error::Error + Send;
    /// Error returned by [`Fs::read`].
    type ReadError: std::error::Error + Send;
    /// Error returned by [`Fs::readdir`].
    type ReaddirError: std::error::Error + Send;

    /// Metadata for `path`.
    async fn getattr(&self, path: &str) -> Result<FileAttr, Self::GetAttrError>;

    /// Read the contents of a directory, including the `.` and `..` entries.
    async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, Self::ReaddirError>;

    /// Open `path` with the given open(2) flags.
    async fn open(&self, path: &str, flags: OpenFlags) -> Result<OpenFile, Self::OpenError>;

    /// Read up to `size` bytes at `offset`. A short (or empty) result means end of file.
    async fn read(&self, path: &str, offset: u64, size: u32) -> Result<Bytes, Self::ReadError>;
}
