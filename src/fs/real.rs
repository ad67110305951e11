/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::{
    fs,
    io::{self, Read, Seek, SeekFrom, Write},
    os::unix::{
        fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt},
        io::{AsRawFd, RawFd},
    },
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::{
    error::{FsError, FsResult},
    fs::{has_flag, DirEntry, File, FileInfo, FileSystem, OpenFlag},
};

/// Direct OS delegation. Every error is annotated with the op name and
/// path so it classifies the same way as wrapped filesystems.
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        RealFs
    }
}

impl Default for RealFs {
    fn default() -> Self {
        RealFs::new()
    }
}

fn file_info(name: &Path, metadata: &fs::Metadata) -> FileInfo {
    FileInfo {
        name: name
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size: metadata.len(),
        mode: metadata.permissions().mode() & 0o7777,
        is_dir: metadata.is_dir(),
    }
}

fn is_directory_errno(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EISDIR)
}

impl FileSystem for RealFs {
    fn open(&self, path: &Path) -> FsResult<Box<dyn File>> {
        let file = fs::OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|err| FsError::path("open", path, err))?;
        Ok(Box::new(RealFile::new(path, file)))
    }

    fn create(&self, path: &Path) -> FsResult<Box<dyn File>> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| FsError::path("create", path, err))?;
        Ok(Box::new(RealFile::new(path, file)))
    }

    fn open_file(&self, path: &Path, flags: &[OpenFlag], mode: u32) -> FsResult<Box<dyn File>> {
        let mut options = fs::OpenOptions::new();
        let writable = has_flag(flags, OpenFlag::Write)
            || has_flag(flags, OpenFlag::ReadWrite)
            || has_flag(flags, OpenFlag::Append);
        options.read(has_flag(flags, OpenFlag::Read) || has_flag(flags, OpenFlag::ReadWrite) || !writable);
        options.write(writable);
        options.append(has_flag(flags, OpenFlag::Append));
        options.create(has_flag(flags, OpenFlag::Create));
        options.create_new(has_flag(flags, OpenFlag::Excl));
        options.truncate(has_flag(flags, OpenFlag::Trunc));
        options.mode(mode);
        let file = options
            .open(path)
            .map_err(|err| FsError::path("open", path, err))?;
        Ok(Box::new(RealFile::new(path, file)))
    }

    fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        fs::read(path).map_err(|err| FsError::path("readfile", path, err))
    }

    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)
            .map_err(|err| FsError::path("writefile", path, err))?;
        file.write_all(data)
            .map_err(|err| FsError::path("writefile", path, err))
    }

    fn read_dir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let iter = fs::read_dir(path).map_err(|err| FsError::path("readdir", path, err))?;
        for entry in iter {
            let entry = entry.map_err(|err| FsError::path("readdir", path, err))?;
            let file_type = entry
                .file_type()
                .map_err(|err| FsError::path("readdir", path, err))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: file_type.is_dir(),
            });
        }
        entries.sort();
        Ok(entries)
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> FsResult<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)
            .map_err(|err| FsError::path("mkdirall", path, err))
    }

    fn stat(&self, path: &Path) -> FsResult<FileInfo> {
        let metadata = fs::metadata(path).map_err(|err| FsError::path("stat", path, err))?;
        Ok(file_info(path, &metadata))
    }

    fn exists(&self, path: &Path) -> FsResult<bool> {
        match fs::metadata(path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(FsError::path("stat", path, err)),
        }
    }

    fn remove(&self, path: &Path) -> FsResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if is_directory_errno(&err) => {
                fs::remove_dir(path).map_err(|err| FsError::path("remove", path, err))
            }
            Err(err) => Err(FsError::path("remove", path, err)),
        }
    }

    fn remove_all(&self, path: &Path) -> FsResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) if is_directory_errno(&err) => match fs::remove_dir_all(path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(FsError::path("removeall", path, err)),
            },
            Err(err) => Err(FsError::path("removeall", path, err)),
        }
    }

    fn rename(&self, old: &Path, new: &Path) -> FsResult<()> {
        fs::rename(old, new).map_err(|err| FsError::link("rename", old, new, err))
    }
}

/// A real OS handle. The descriptor is shared behind a mutex so `close`
/// runs at most once even under concurrent calls.
pub struct RealFile {
    path: PathBuf,
    fd: RawFd,
    file: Mutex<Option<fs::File>>,
}

impl RealFile {
    pub(crate) fn new(path: &Path, file: fs::File) -> Self {
        let fd = file.as_raw_fd();
        RealFile {
            path: path.to_path_buf(),
            fd,
            file: Mutex::new(Some(file)),
        }
    }

    fn with_file<T>(
        &self,
        op: &'static str,
        body: impl FnOnce(&fs::File) -> io::Result<T>,
    ) -> FsResult<T> {
        let guard = self.file.lock().unwrap();
        let file = guard
            .as_ref()
            .ok_or_else(|| FsError::path(op, &self.path, closed_error()))?;
        body(file).map_err(|err| FsError::path(op, &self.path, err))
    }
}

fn closed_error() -> io::Error {
    io::Error::other("file already closed")
}

impl File for RealFile {
    fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        self.with_file("read", |mut file| file.read(buf))
    }

    fn write(&self, data: &[u8]) -> FsResult<usize> {
        self.with_file("write", |mut file| file.write(data))
    }

    fn seek(&self, pos: SeekFrom) -> FsResult<u64> {
        self.with_file("seek", |mut file| file.seek(pos))
    }

    fn stat(&self) -> FsResult<FileInfo> {
        let metadata = self.with_file("stat", |file| file.metadata())?;
        Ok(file_info(&self.path, &metadata))
    }

    fn sync(&self) -> FsResult<()> {
        self.with_file("sync", |file| file.sync_all())
    }

    fn chmod(&self, mode: u32) -> FsResult<()> {
        self.with_file("chmod", |file| {
            file.set_permissions(fs::Permissions::from_mode(mode))
        })
    }

    fn close(&self) -> FsResult<()> {
        let file = self.file.lock().unwrap().take();
        match file {
            Some(file) => {
                drop(file);
                Ok(())
            }
            None => Err(FsError::path("close", &self.path, closed_error())),
        }
    }

    fn fd(&self) -> RawFd {
        self.fd
    }
}
