/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    error::FsResult,
    fs::{write_all, FileSystem, OpenFlag},
};

/// Durably replaces file contents: write to a temp sibling, fsync it,
/// rename over the target, fsync the parent directory. A reader never
/// observes a partially written target, and after a crash the target
/// holds either the old or the new contents in full.
pub struct AtomicWriter {
    fs: Arc<dyn FileSystem>,
    next_tmp: AtomicU64,
}

impl AtomicWriter {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        AtomicWriter {
            fs,
            next_tmp: AtomicU64::new(0),
        }
    }

    fn temp_sibling(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_owned());
        let id = self.next_tmp.fetch_add(1, Ordering::Relaxed);
        path.with_file_name(format!(".{}.tmp-{}", name, id))
    }

    pub fn write(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        let tmp = self.temp_sibling(path);
        let file = self.fs.open_file(
            &tmp,
            &[OpenFlag::Write, OpenFlag::Create, OpenFlag::Excl],
            mode,
        )?;
        let written = write_all(file.as_ref(), data, &tmp).and_then(|()| file.sync());
        let closed = file.close();
        if let Err(err) = written.and(closed) {
            let _ = self.fs.remove(&tmp);
            return Err(err);
        }
        if let Err(err) = self.fs.rename(&tmp, path) {
            let _ = self.fs.remove(&tmp);
            return Err(err);
        }
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let dir = self.fs.open(parent)?;
        let synced = dir.sync();
        let closed = dir.close();
        synced.and(closed)
    }
}
