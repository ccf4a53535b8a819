//! Shared infrastructure utilities for Tether.
//!
//! Persistence substrates in `tether-store` sit on top of these helpers:
//!
//! - **`atomic_write`**: Crash-safe snapshot persistence (temp + rename) and
//!   recovery of a `.bak` left behind by an interrupted overwrite
//! - **`secure_fs`**: Owner-only directory and file creation for shared containers

pub mod atomic_write;
pub mod secure_fs;

pub use atomic_write::{
    AtomicWriteOptions, FileSyncPolicy, ParentDirSyncPolicy, PersistMode, atomic_write,
    atomic_write_with_options, recover_bak_file,
};
pub use secure_fs::{ensure_secure_dir, ensure_secure_file, sidecar_path};
