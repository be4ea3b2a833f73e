use std::collections::HashMap;
use std::ffi::OsStr;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, UNIX_EPOCH};

use crate::fs::{DirEntryType, FileAttr, Fs, OpenFlags, ROOT};
use tracing::{debug, error, instrument};

/// Bidirectional mapping between the inode numbers handed to the kernel and the paths the
/// [`Fs`] understands.
///
/// Every inode other than the root carries the kernel's lookup count. It is dropped once the
/// kernel forgets it, so the table stays bounded by what the kernel currently remembers.
/// Inode numbers are never reused.
#[derive(Debug)]
pub struct PathTable {
    by_ino: HashMap<u64, Node>,
    by_path: HashMap<String, u64>,
    next_ino: u64,
}

#[derive(Debug)]
struct Node {
    path: String,
    nlookup: u64,
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTable {
    /// A table holding only the root.
    #[must_use]
    pub fn new() -> Self {
        let mut by_ino = HashMap::new();
        by_ino.insert(
            fuser::FUSE_ROOT_ID,
            Node {
                path: ROOT.to_owned(),
                nlookup: 0,
            },
        );
        Self {
            by_ino,
            by_path: HashMap::from([(ROOT.to_owned(), fuser::FUSE_ROOT_ID)]),
            next_ino: fuser::FUSE_ROOT_ID + 1,
        }
    }

    /// The path behind `ino`, if the kernel still holds it.
    #[must_use]
    pub fn path(&self, ino: u64) -> Option<&str> {
        self.by_ino.get(&ino).map(|node| node.path.as_str())
    }

    /// The inode currently assigned to `path`.
    #[must_use]
    pub fn ino(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).copied()
    }

    /// Record one kernel lookup of `path`, allocating an inode on first sight.
    pub fn remember(&mut self, path: &str) -> u64 {
        let ino = match self.by_path.get(path) {
            Some(&ino) => ino,
            None => {
                let ino = self.next_ino;
                self.next_ino += 1;
                self.by_path.insert(path.to_owned(), ino);
                self.by_ino.insert(
                    ino,
                    Node {
                        path: path.to_owned(),
                        nlookup: 0,
                    },
                );
                ino
            }
        };
        if let Some(node) = self.by_ino.get_mut(&ino) {
            node.nlookup = node.nlookup.saturating_add(1);
        }
        ino
    }

    /// Drop `nlookup` references to `ino`. The entry goes away when none remain. The root is
    /// never forgotten.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == fuser::FUSE_ROOT_ID {
            return;
        }
        let Some(node) = self.by_ino.get_mut(&ino) else {
            return;
        };
        node.nlookup = node.nlookup.saturating_sub(nlookup);
        if node.nlookup == 0 {
            if let Some(node) = self.by_ino.remove(&ino) {
                self.by_path.remove(&node.path);
            }
        }
    }

    /// Number of known inodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    /// Never true: the root is always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }

    /// Joins `name` onto `parent`. Names that are not valid UTF-8, contain a slash, or are
    /// `.`/`..` do not name a secret and yield `None`.
    #[must_use]
    pub fn child(parent: &str, name: &OsStr) -> Option<String> {
        let name = name.to_str()?;
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return None;
        }
        if parent == ROOT {
            Some(format!("/{name}"))
        } else {
            Some(format!("{parent}/{name}"))
        }
    }

    /// The parent directory of `path`. The root is its own parent.
    #[must_use]
    pub fn parent(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) | None => ROOT,
            Some(idx) => &path[..idx],
        }
    }
}

/// Translate the caller-facing mount options (as given to `mount -o`) into fuser options.
///
/// The filesystem is always mounted read-only, without device files or setuid binaries.
#[must_use]
pub fn mount_options(fs_name: &str, options: &[String]) -> Vec<fuser::MountOption> {
    let mut opts = vec![
        fuser::MountOption::FSName(fs_name.to_owned()),
        fuser::MountOption::RO,
        fuser::MountOption::NoDev,
        fuser::MountOption::NoSuid,
    ];
    for option in options.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
        let parsed = match option {
            "ro" => continue,
            "allow_other" => fuser::MountOption::AllowOther,
            "allow_root" => fuser::MountOption::AllowRoot,
            "auto_unmount" => fuser::MountOption::AutoUnmount,
            "default_permissions" => fuser::MountOption::DefaultPermissions,
            other => fuser::MountOption::CUSTOM(other.to_owned()),
        };
        if !opts.contains(&parsed) {
            opts.push(parsed);
        }
    }
    opts
}

fn to_fuser_attr(ino: u64, attr: FileAttr, uid: u32, gid: u32) -> fuser::FileAttr {
    let mut out = fuser::FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: fuser::FileType::Directory,
        perm: attr.perm().bits(),
        nlink: attr.nlink(),
        uid,
        gid,
        rdev: 0,
        blksize: 512,
        flags: 0,
    };
    if let FileAttr::RegularFile { size, mtime, .. } = attr {
        out.kind = fuser::FileType::RegularFile;
        out.size = size;
        out.blocks = size.div_ceil(512);
        out.atime = mtime;
        out.mtime = mtime;
        out.ctime = mtime;
        out.crtime = mtime;
    }
    out
}

impl From<DirEntryType> for fuser::FileType {
    fn from(val: DirEntryType) -> Self {
        match val {
            DirEntryType::RegularFile => Self::RegularFile,
            DirEntryType::Directory => Self::Directory,
        }
    }
}

/// Serves an [`Fs`] to the kernel through fuser.
pub struct FuserAdapter<F: Fs>
where
    F::GetAttrError: Into<i32>,
    F::OpenError: Into<i32>,
    F::ReadError: Into<i32>,
    F::ReaddirError: Into<i32>,
{
    fs: Arc<F>,
    paths: Arc<Mutex<PathTable>>,
    /// Created when the kernel sends `init`, i.e. after the session process has detached.
    /// Runtime worker threads would not survive the fork.
    runtime: Option<tokio::runtime::Runtime>,
    uid: u32,
    gid: u32,
}

impl<F: Fs + 'static> FuserAdapter<F>
where
    F::GetAttrError: Into<i32> + 'static,
    F::OpenError: Into<i32> + 'static,
    F::ReadError: Into<i32> + 'static,
    F::ReaddirError: Into<i32> + 'static,
{
    // The content behind a name changes whenever the secret command is re-run, so keep kernel
    // caching short.
    const TTL: Duration = Duration::from_secs(1);

    /// Wrap `fs`. Files are reported as owned by the current user.
    pub fn new(fs: F) -> Self {
        Self {
            fs: Arc::new(fs),
            paths: Arc::new(Mutex::new(PathTable::new())),
            runtime: None,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        if let Some(runtime) = &self.runtime {
            runtime.spawn(fut);
        } else {
            // Dropping the future drops its reply, which fuser answers with EIO.
            error!("Received a request before init, dropping it.");
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .path(ino)
            .map(ToOwned::to_owned)
    }
}

impl<F: Fs + 'static> fuser::Filesystem for FuserAdapter<F>
where
    F::GetAttrError: Into<i32> + 'static,
    F::OpenError: Into<i32> + 'static,
    F::ReadError: Into<i32> + 'static,
    F::ReaddirError: Into<i32> + 'static,
{
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                error!("Failed to create Tokio runtime: {e}");
                libc::EIO
            })?;
        self.runtime = Some(runtime);
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }

    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let resolved = self
            .path_of(parent)
            .and_then(|parent| PathTable::child(&parent, name));
        let Some(path) = resolved else {
            debug!("unresolvable name, replying ENOENT");
            reply.error(libc::ENOENT);
            return;
        };

        let fs = Arc::clone(&self.fs);
        let paths = Arc::clone(&self.paths);
        let (uid, gid) = (self.uid, self.gid);
        self.spawn(async move {
            match fs.getattr(&path).await {
                Ok(attr) => {
                    // Only names that exist get an inode; the kernel will forget it later.
                    let ino = paths
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remember(&path);
                    let f_attr = to_fuser_attr(ino, attr, uid, gid);
                    debug!(?f_attr, "replying...");
                    reply.entry(&Self::TTL, &f_attr, 0);
                }
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                }
            }
        });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req, nlookup))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let fs = Arc::clone(&self.fs);
        let (uid, gid) = (self.uid, self.gid);
        self.spawn(async move {
            match fs.getattr(&path).await {
                Ok(attr) => {
                    debug!(?attr, "replying...");
                    reply.attr(&Self::TTL, &to_fuser_attr(ino, attr, uid, gid));
                }
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                }
            }
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _fh, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Ok(skip) = usize::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };

        let fs = Arc::clone(&self.fs);
        let paths = Arc::clone(&self.paths);
        self.spawn(async move {
            let entries = match fs.readdir(&path).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                    return;
                }
            };

            let paths = paths.lock().unwrap_or_else(PoisonError::into_inner);
            for (i, entry) in entries.iter().enumerate().skip(skip) {
                // Listing is not a lookup, so it never assigns inodes.
                let entry_ino = match entry.name.to_str() {
                    Some(".") => ino,
                    Some("..") => paths
                        .ino(PathTable::parent(&path))
                        .unwrap_or(fuser::FUSE_ROOT_ID),
                    _ => match PathTable::child(&path, &entry.name).and_then(|c| paths.ino(&c)) {
                        Some(child_ino) => child_ino,
                        None => continue,
                    },
                };
                let Ok(idx): Result<i64, _> = (i + 1).try_into() else {
                    error!("Directory entry index {} too large for fuser", i + 1);
                    reply.error(libc::EIO);
                    return;
                };

                debug!(?entry, "adding entry to reply...");
                if reply.add(entry_ino, idx, entry.kind.into(), &entry.name) {
                    debug!("buffer full for now, stopping readdir");
                    break;
                }
            }

            debug!("finalizing reply...");
            reply.ok();
        });
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let fs = Arc::clone(&self.fs);
        let flags: OpenFlags = flags.into();
        self.spawn(async move {
            match fs.open(&path, flags).await {
                Ok(open_file) => {
                    debug!(handle = open_file.handle, "replying...");
                    reply.opened(open_file.handle, 0);
                }
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                }
            }
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _fh, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };

        let fs = Arc::clone(&self.fs);
        self.spawn(async move {
            match fs.read(&path, offset, size).await {
                Ok(data) => {
                    debug!(read_bytes = data.len(), "replying...");
                    reply.data(&data);
                }
                Err(e) => {
                    debug!(error = %e, "replying error");
                    reply.error(e.into());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Permissions;

    #[test]
    fn root_is_preallocated() {
        let table = PathTable::new();
        assert_eq!(table.path(fuser::FUSE_ROOT_ID), Some(ROOT), "root inode maps to /");
        assert_eq!(table.ino(ROOT), Some(fuser::FUSE_ROOT_ID));
        assert_eq!(table.len(), 1, "only the root is known initially");
    }

    #[test]
    fn remember_is_stable() {
        let mut table = PathTable::new();
        let a = table.remember("/a");
        let b = table.remember("/b");
        assert_ne!(a, b, "distinct paths get distinct inodes");
        assert_ne!(a, fuser::FUSE_ROOT_ID);
        assert_eq!(table.remember("/a"), a, "looking up again returns the same inode");
        assert_eq!(table.path(b), Some("/b"));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn forget_drops_entry_when_count_reaches_zero() {
        let mut table = PathTable::new();
        let ino = table.remember("/db");
        table.remember("/db");
        table.remember("/db");

        table.forget(ino, 2);
        assert_eq!(table.path(ino), Some("/db"), "one lookup is still outstanding");

        table.forget(ino, 1);
        assert_eq!(table.path(ino), None, "fully forgotten inodes are dropped");
        assert_eq!(table.ino("/db"), None);
        assert_eq!(table.len(), 1, "only the root remains");

        let again = table.remember("/db");
        assert_ne!(again, ino, "inode numbers are not reused");
    }

    #[test]
    fn forget_never_drops_the_root() {
        let mut table = PathTable::new();
        table.forget(fuser::FUSE_ROOT_ID, 1_000);
        assert_eq!(table.path(fuser::FUSE_ROOT_ID), Some(ROOT));
    }

    #[test]
    fn forget_of_unknown_or_over_counted_inode_is_harmless() {
        let mut table = PathTable::new();
        table.forget(42, 1);
        let ino = table.remember("/a");
        table.forget(ino, 10);
        assert_eq!(table.path(ino), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn table_stays_bounded_under_repeated_lookups() {
        let mut table = PathTable::new();
        for n in 0..100 {
            let ino = table.remember(&format!("/secret-{n}"));
            table.forget(ino, 1);
        }
        assert_eq!(table.len(), 1, "forgotten names must not accumulate");
    }

    #[test]
    fn child_joins_under_root_and_nested() {
        assert_eq!(
            PathTable::child("/", OsStr::new("db-password")).as_deref(),
            Some("/db-password")
        );
        assert_eq!(
            PathTable::child("/certs/HTTP", OsStr::new("server.pem")).as_deref(),
            Some("/certs/HTTP/server.pem")
        );
    }

    #[test]
    fn child_rejects_dot_entries() {
        assert!(PathTable::child("/", OsStr::new(".")).is_none());
        assert!(PathTable::child("/", OsStr::new("..")).is_none());
        assert!(PathTable::child("/", OsStr::new("")).is_none());
    }

    #[test]
    fn parent_of_paths() {
        assert_eq!(PathTable::parent("/"), "/", "root is its own parent");
        assert_eq!(PathTable::parent("/a"), "/");
        assert_eq!(PathTable::parent("/certs/HTTP"), "/certs");
    }

    #[test]
    fn mount_options_always_read_only() {
        let opts = mount_options("secret-fs", &["allow_other".to_owned(), "ro".to_owned()]);
        assert!(opts.contains(&fuser::MountOption::RO), "RO is always present");
        assert!(opts.contains(&fuser::MountOption::AllowOther));
        assert_eq!(
            opts.iter()
                .filter(|o| **o == fuser::MountOption::RO)
                .count(),
            1,
            "RO is not duplicated"
        );
    }

    #[test]
    fn mount_options_pass_unknown_through() {
        let opts = mount_options("secret-fs", &["max_read=4096".to_owned()]);
        assert!(opts.contains(&fuser::MountOption::CUSTOM("max_read=4096".to_owned())));
        assert!(opts.contains(&fuser::MountOption::FSName("secret-fs".to_owned())));
    }

    #[test]
    fn regular_file_attr() {
        let mtime = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let attr = FileAttr::RegularFile {
            perm: Permissions::READ_ONLY,
            size: 1025,
            mtime,
        };

        let out = to_fuser_attr(7, attr, 1000, 1001);

        assert_eq!(out.ino, 7);
        assert_eq!(out.kind, fuser::FileType::RegularFile);
        assert_eq!(out.perm, 0o444, "files are read-only");
        assert_eq!(out.nlink, 1);
        assert_eq!(out.size, 1025, "size is the cached length");
        assert_eq!(out.blocks, 3, "blocks are rounded up to 512 bytes");
        assert_eq!(out.mtime, mtime, "mtime is the fetch time");
        assert_eq!(out.ctime, mtime);
        assert_eq!((out.uid, out.gid), (1000, 1001));
    }

    #[test]
    fn directory_attr() {
        let attr = FileAttr::Directory {
            perm: Permissions::DIRECTORY,
        };

        let out = to_fuser_attr(fuser::FUSE_ROOT_ID, attr, 0, 0);

        assert_eq!(out.kind, fuser::FileType::Directory);
        assert_eq!(out.perm, 0o755);
        assert_eq!(out.nlink, 2);
        assert_eq!(out.size, 0);
        assert_eq!(out.blocks, 0);
    }

    #[test]
    fn dir_entry_types_map_to_fuser_kinds() {
        assert_eq!(
            fuser::FileType::from(DirEntryType::RegularFile),
            fuser::FileType::RegularFile
        );
        assert_eq!(
            fuser::FileType::from(DirEntryType::Directory),
            fuser::FileType::Directory
        );
    }
}
