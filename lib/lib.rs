//! secret-fs shared library.
//!
//! Exposes the output of an external secret command as read-only files, mounted through the
//! flexVolume driver protocol.

/// TOML configuration of the driver.
pub mod app_config;
/// Single-slot cache of fetched secret content.
pub mod cache;
pub mod fetch;
/// The flexVolume `init`/`mount`/`umount` protocol.
pub mod flexvolume;
/// Filesystem abstractions and the FUSE binding.
pub mod fs;
