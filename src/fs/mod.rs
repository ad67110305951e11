/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

pub mod real;

use std::{io::SeekFrom, os::unix::io::RawFd, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::FsResult;

/// Flags for `open_file`. A flag set carries at most one of
/// `Read`/`Write`/`ReadWrite`; absence of all three means read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenFlag {
    Read,
    Write,
    ReadWrite,
    Append,
    Create,
    Excl,
    Trunc,
}

pub fn has_flag(flags: &[OpenFlag], flag: OpenFlag) -> bool {
    flags.contains(&flag)
}

/// Drives a handle `write` to completion, retrying short writes.
pub(crate) fn write_all(file: &dyn File, data: &[u8], path: &Path) -> FsResult<()> {
    let mut written = 0;
    while written < data.len() {
        let n = file.write(&data[written..])?;
        if n == 0 {
            return Err(crate::error::FsError::path(
                "write",
                path,
                std::io::Error::new(std::io::ErrorKind::WriteZero, "write returned 0 bytes"),
            ));
        }
        written += n;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// Permission bits as reported by the OS.
    pub mode: u32,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// An open file or directory handle.
///
/// Methods take `&self` and implementations lock internally, so handles
/// can be shared across threads behind `Arc`. `close` releases the
/// underlying descriptor exactly once; a second call reports
/// already-closed.
pub trait File: Send + Sync {
    /// Reads into `buf`, advancing the handle offset. `Ok(0)` is EOF.
    fn read(&self, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&self, data: &[u8]) -> FsResult<usize>;
    fn seek(&self, pos: SeekFrom) -> FsResult<u64>;
    fn stat(&self) -> FsResult<FileInfo>;
    /// fsync: flush file contents (and metadata) to stable storage.
    fn sync(&self) -> FsResult<()>;
    fn chmod(&self, mode: u32) -> FsResult<()>;
    fn close(&self) -> FsResult<()>;
    /// The OS handle. Valid until `close`.
    fn fd(&self) -> RawFd;
}

/// The filesystem capability surface.
///
/// Implementations must be safe for concurrent calls; errors expose a
/// classifiable errno whenever the underlying cause was an OS error.
/// Used as `Arc<dyn FileSystem>` so tests can swap the real filesystem,
/// the chaos wrapper and the crash simulator at runtime.
pub trait FileSystem: Send + Sync {
    /// Opens an existing file (or directory) read-only.
    fn open(&self, path: &Path) -> FsResult<Box<dyn File>>;
    /// Creates (or truncates) a file for writing, mode 0o666 before umask.
    fn create(&self, path: &Path) -> FsResult<Box<dyn File>>;
    fn open_file(&self, path: &Path, flags: &[OpenFlag], mode: u32) -> FsResult<Box<dyn File>>;

    fn read_file(&self, path: &Path) -> FsResult<Vec<u8>>;
    /// Non-atomic create/truncate/write. `mode` applies on creation only.
    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()>;

    /// Entries of a directory, sorted by name, ascending byte-wise.
    fn read_dir(&self, path: &Path) -> FsResult<Vec<DirEntry>>;
    /// Idempotent; creates missing ancestors with `mode`.
    fn mkdir_all(&self, path: &Path, mode: u32) -> FsResult<()>;

    fn stat(&self, path: &Path) -> FsResult<FileInfo>;
    /// `Ok(false)` when the path does not exist; other stat errors surface.
    fn exists(&self, path: &Path) -> FsResult<bool>;

    /// Removes a single entry (file or empty directory).
    fn remove(&self, path: &Path) -> FsResult<()>;
    /// Recursive removal; succeeds when the path is already missing.
    fn remove_all(&self, path: &Path) -> FsResult<()>;

    fn rename(&self, old: &Path, new: &Path) -> FsResult<()>;
}
