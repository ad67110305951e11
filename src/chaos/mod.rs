/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

pub mod trace;

use std::{
    io::{self, SeekFrom},
    os::unix::io::RawFd,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};

use crate::{
    error::{errno_error, errno_name, FsError, FsResult},
    fs::{has_flag, DirEntry, File, FileInfo, FileSystem, OpenFlag},
};

pub use trace::{Trace, TraceEvent, TraceEventKind};

const OPEN_ERRNOS: &[i32] = &[
    libc::EACCES,
    libc::EIO,
    libc::EMFILE,
    libc::ENFILE,
    libc::ENOTDIR,
];
const CREATE_ERRNOS: &[i32] = &[
    libc::EACCES,
    libc::EIO,
    libc::EMFILE,
    libc::ENFILE,
    libc::ENOTDIR,
    libc::ENOSPC,
    libc::EDQUOT,
    libc::EROFS,
];
// open set minus EIO, used for the open phase of readfile faults
const READ_FILE_OPEN_ERRNOS: &[i32] = &[libc::EACCES, libc::EMFILE, libc::ENFILE, libc::ENOTDIR];
const READ_DIR_ERRNOS: &[i32] = &[
    libc::EACCES,
    libc::EIO,
    libc::ENOTDIR,
    libc::EMFILE,
    libc::ENFILE,
];
const RENAME_ERRNOS: &[i32] = &[
    libc::EACCES,
    libc::EIO,
    libc::ENOSPC,
    libc::EXDEV,
    libc::EROFS,
    libc::EPERM,
];
const REMOVE_ERRNOS: &[i32] = &[
    libc::EACCES,
    libc::EPERM,
    libc::EBUSY,
    libc::EIO,
    libc::EROFS,
];
const MKDIR_ALL_ERRNOS: &[i32] = &[
    libc::EACCES,
    libc::EIO,
    libc::ENOSPC,
    libc::EDQUOT,
    libc::EROFS,
    libc::ENOTDIR,
];
const STAT_ERRNOS: &[i32] = &[libc::EACCES, libc::EIO];
const FILE_WRITE_ERRNOS: &[i32] = &[libc::EIO, libc::ENOSPC, libc::EDQUOT, libc::EROFS];
const FILE_SYNC_ERRNOS: &[i32] = &[libc::EIO, libc::ENOSPC, libc::EDQUOT, libc::EROFS];
const FILE_CHMOD_ERRNOS: &[i32] = &[libc::EACCES, libc::EPERM, libc::EIO, libc::EROFS];
const EIO_ONLY: &[i32] = &[libc::EIO];

/// True when the error (at any wrapping depth) was injected by [`ChaosFs`].
pub fn is_chaos_err(err: &FsError) -> bool {
    err.is_injected()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChaosMode {
    /// Inject faults per the configured rates.
    Active,
    /// Pass everything through, but keep recording trace events.
    NoOp,
}

/// All rates are probabilities in `[0, 1]`; `0.0` disables the fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    pub mode: ChaosMode,
    pub seed: u64,
    /// Fail `open`/`create`/`open_file` before touching the inner fs.
    pub open_fail_rate: f64,
    /// Fail `read_file` or a handle `read`.
    pub read_fail_rate: f64,
    /// Handle read: legal short read, no error. `read_file`: EIO.
    pub partial_read_rate: f64,
    pub write_fail_rate: f64,
    /// Write a true non-empty prefix, then error.
    pub partial_write_rate: f64,
    /// Fraction of partial writes reported as a short write without errno.
    pub short_write_rate: f64,
    pub sync_fail_rate: f64,
    pub close_fail_rate: f64,
    pub chmod_fail_rate: f64,
    pub seek_fail_rate: f64,
    pub file_stat_fail_rate: f64,
    pub remove_fail_rate: f64,
    pub rename_fail_rate: f64,
    pub stat_fail_rate: f64,
    pub mkdir_all_fail_rate: f64,
    pub read_dir_fail_rate: f64,
    /// Return a strict sorted prefix of the listing.
    pub read_dir_partial_rate: f64,
    /// 0 disables tracing.
    pub trace_capacity: usize,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosConfig {
            mode: ChaosMode::Active,
            seed: 0,
            open_fail_rate: 0.0,
            read_fail_rate: 0.0,
            partial_read_rate: 0.0,
            write_fail_rate: 0.0,
            partial_write_rate: 0.0,
            short_write_rate: 0.0,
            sync_fail_rate: 0.0,
            close_fail_rate: 0.0,
            chmod_fail_rate: 0.0,
            seek_fail_rate: 0.0,
            file_stat_fail_rate: 0.0,
            remove_fail_rate: 0.0,
            rename_fail_rate: 0.0,
            stat_fail_rate: 0.0,
            mkdir_all_fail_rate: 0.0,
            read_dir_fail_rate: 0.0,
            read_dir_partial_rate: 0.0,
            trace_capacity: 0,
        }
    }
}

/// Counters of what the chaos layer has done so far.
#[derive(Default)]
pub struct ChaosStats {
    operations: AtomicU64,
    injected_faults: AtomicU64,
    short_reads: AtomicU64,
    partial_writes: AtomicU64,
    partial_read_dirs: AtomicU64,
}

impl ChaosStats {
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }
    pub fn injected_faults(&self) -> u64 {
        self.injected_faults.load(Ordering::Relaxed)
    }
    pub fn short_reads(&self) -> u64 {
        self.short_reads.load(Ordering::Relaxed)
    }
    pub fn partial_writes(&self) -> u64 {
        self.partial_writes.load(Ordering::Relaxed)
    }
    pub fn partial_read_dirs(&self) -> u64 {
        self.partial_read_dirs.load(Ordering::Relaxed)
    }
}

struct ChaosCore {
    config: ChaosConfig,
    rng: Mutex<Pcg32>,
    stats: ChaosStats,
    trace: Trace,
}

impl ChaosCore {
    fn active(&self) -> bool {
        self.config.mode == ChaosMode::Active
    }

    /// One RNG draw per call; skipped entirely for disabled rates so
    /// the stream only depends on configured faults.
    fn roll(&self, rate: f64) -> bool {
        if !self.active() || rate <= 0.0 {
            return false;
        }
        self.rng.lock().unwrap().gen::<f64>() < rate
    }

    fn pick_errno(&self, menu: &[i32]) -> i32 {
        *menu.choose(&mut *self.rng.lock().unwrap()).unwrap()
    }

    fn coin(&self) -> bool {
        self.rng.lock().unwrap().gen::<bool>()
    }

    /// Random cut point in `[1, len)`. Callers guarantee `len > 1`.
    fn cut(&self, len: usize) -> usize {
        self.rng.lock().unwrap().gen_range(1..len)
    }

    fn inject_path(&self, op: &'static str, path: &Path, menu: &[i32]) -> FsError {
        self.stats.injected_faults.fetch_add(1, Ordering::Relaxed);
        FsError::path(op, path, errno_error(self.pick_errno(menu))).injected()
    }

    fn inject_link(&self, op: &'static str, from: &Path, to: &Path, menu: &[i32]) -> FsError {
        self.stats.injected_faults.fetch_add(1, Ordering::Relaxed);
        FsError::link(op, from, to, errno_error(self.pick_errno(menu))).injected()
    }

    fn trace_ok(&self, op: &'static str, path: &Path, attrs: Vec<(&'static str, String)>) {
        self.trace.record(
            op,
            path.display().to_string(),
            TraceEventKind::Ok,
            None,
            false,
            attrs,
        );
    }

    fn trace_fail(&self, op: &'static str, path: &Path, err: &FsError) {
        let mut attrs = vec![];
        if let Some(errno) = err.errno() {
            attrs.push(("errno", errno_name(errno)));
        }
        self.trace.record(
            op,
            path.display().to_string(),
            TraceEventKind::Fail,
            Some(err.to_string()),
            err.is_injected(),
            attrs,
        );
    }

    fn trace_shaped(
        &self,
        op: &'static str,
        path: &Path,
        kind: TraceEventKind,
        err: Option<&FsError>,
        attrs: Vec<(&'static str, String)>,
    ) {
        self.trace.record(
            op,
            path.display().to_string(),
            kind,
            err.map(|err| err.to_string()),
            err.map(FsError::is_injected).unwrap_or(true),
            attrs,
        );
    }

    fn count_op(&self) {
        self.stats.operations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fault-injection wrapper: exposes the same capability surface as the
/// inner filesystem and injects errno-carrying errors and partial
/// reads/writes per [`ChaosConfig`]. Outcomes are a pure function of the
/// seed and the operation sequence.
pub struct ChaosFs {
    inner: Arc<dyn FileSystem>,
    core: Arc<ChaosCore>,
}

impl ChaosFs {
    pub fn new(inner: Arc<dyn FileSystem>, config: ChaosConfig) -> Self {
        let core = ChaosCore {
            rng: Mutex::new(Pcg32::seed_from_u64(config.seed)),
            trace: Trace::new(config.trace_capacity),
            stats: ChaosStats::default(),
            config,
        };
        ChaosFs {
            inner,
            core: Arc::new(core),
        }
    }

    pub fn stats(&self) -> &ChaosStats {
        &self.core.stats
    }

    pub fn trace_events(&self) -> Vec<TraceEvent> {
        self.core.trace.events()
    }

    /// Renders the trace in insertion order.
    pub fn trace(&self) -> String {
        self.core.trace.render()
    }

    fn wrap_file(&self, path: &Path, file: Box<dyn File>) -> Box<dyn File> {
        Box::new(ChaosFile {
            inner: file,
            path: path.to_path_buf(),
            core: Arc::clone(&self.core),
        })
    }

    fn open_with_menu(
        &self,
        op: &'static str,
        path: &Path,
        menu: &[i32],
        open: impl FnOnce() -> FsResult<Box<dyn File>>,
    ) -> FsResult<Box<dyn File>> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.open_fail_rate) {
            let err = core.inject_path(op, path, menu);
            core.trace_fail(op, path, &err);
            return Err(err);
        }
        match open() {
            Ok(file) => {
                core.trace_ok(op, path, vec![]);
                Ok(self.wrap_file(path, file))
            }
            Err(err) => {
                core.trace_fail(op, path, &err);
                Err(err)
            }
        }
    }
}

impl FileSystem for ChaosFs {
    fn open(&self, path: &Path) -> FsResult<Box<dyn File>> {
        self.open_with_menu("open", path, OPEN_ERRNOS, || self.inner.open(path))
    }

    fn create(&self, path: &Path) -> FsResult<Box<dyn File>> {
        self.open_with_menu("create", path, CREATE_ERRNOS, || self.inner.create(path))
    }

    fn open_file(&self, path: &Path, flags: &[OpenFlag], mode: u32) -> FsResult<Box<dyn File>> {
        let menu = if has_flag(flags, OpenFlag::Create) {
            CREATE_ERRNOS
        } else {
            OPEN_ERRNOS
        };
        self.open_with_menu("open", path, menu, || self.inner.open_file(path, flags, mode))
    }

    fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.read_fail_rate) {
            // half open-phase faults, half read-phase EIO
            let errno = if core.coin() {
                libc::EIO
            } else {
                core.pick_errno(READ_FILE_OPEN_ERRNOS)
            };
            core.stats.injected_faults.fetch_add(1, Ordering::Relaxed);
            let err = FsError::path("readfile", path, errno_error(errno)).injected();
            core.trace_fail("readfile", path, &err);
            return Err(err);
        }
        let partial = core.roll(core.config.partial_read_rate);
        match self.inner.read_file(path) {
            Ok(data) => {
                if partial && data.len() > 1 {
                    let cut = core.cut(data.len());
                    core.stats.injected_faults.fetch_add(1, Ordering::Relaxed);
                    let err = FsError::path("readfile", path, errno_error(libc::EIO)).injected();
                    core.trace_shaped(
                        "readfile",
                        path,
                        TraceEventKind::PartialRead,
                        Some(&err),
                        vec![("len", data.len().to_string()), ("cut", cut.to_string())],
                    );
                    return Err(err);
                }
                core.trace_ok("readfile", path, vec![("bytes", data.len().to_string())]);
                Ok(data)
            }
            Err(err) => {
                core.trace_fail("readfile", path, &err);
                Err(err)
            }
        }
    }

    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        let core = &self.core;
        core.count_op();
        match self.inner.write_file(path, data, mode) {
            Ok(()) => {
                core.trace_ok("writefile", path, vec![("bytes", data.len().to_string())]);
                Ok(())
            }
            Err(err) => {
                core.trace_fail("writefile", path, &err);
                Err(err)
            }
        }
    }

    fn read_dir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.read_dir_fail_rate) {
            let err = core.inject_path("readdir", path, READ_DIR_ERRNOS);
            core.trace_fail("readdir", path, &err);
            return Err(err);
        }
        let partial = core.roll(core.config.read_dir_partial_rate);
        match self.inner.read_dir(path) {
            Ok(entries) => {
                if partial && entries.len() > 1 {
                    let cut = core.cut(entries.len());
                    core.stats.partial_read_dirs.fetch_add(1, Ordering::Relaxed);
                    core.trace_shaped(
                        "readdir",
                        path,
                        TraceEventKind::PartialReaddir,
                        None,
                        vec![
                            ("total", entries.len().to_string()),
                            ("kept", cut.to_string()),
                        ],
                    );
                    return Ok(entries[..cut].to_vec());
                }
                core.trace_ok("readdir", path, vec![("entries", entries.len().to_string())]);
                Ok(entries)
            }
            Err(err) => {
                core.trace_fail("readdir", path, &err);
                Err(err)
            }
        }
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> FsResult<()> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.mkdir_all_fail_rate) {
            let err = core.inject_path("mkdirall", path, MKDIR_ALL_ERRNOS);
            core.trace_fail("mkdirall", path, &err);
            return Err(err);
        }
        match self.inner.mkdir_all(path, mode) {
            Ok(()) => {
                core.trace_ok("mkdirall", path, vec![]);
                Ok(())
            }
            Err(err) => {
                core.trace_fail("mkdirall", path, &err);
                Err(err)
            }
        }
    }

    fn stat(&self, path: &Path) -> FsResult<FileInfo> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.stat_fail_rate) {
            let err = core.inject_path("stat", path, STAT_ERRNOS);
            core.trace_fail("stat", path, &err);
            return Err(err);
        }
        match self.inner.stat(path) {
            Ok(info) => {
                core.trace_ok("stat", path, vec![]);
                Ok(info)
            }
            Err(err) => {
                core.trace_fail("stat", path, &err);
                Err(err)
            }
        }
    }

    fn exists(&self, path: &Path) -> FsResult<bool> {
        let core = &self.core;
        core.count_op();
        match self.inner.exists(path) {
            Ok(found) => {
                core.trace_ok("stat", path, vec![("exists", found.to_string())]);
                Ok(found)
            }
            Err(err) => {
                core.trace_fail("stat", path, &err);
                Err(err)
            }
        }
    }

    fn remove(&self, path: &Path) -> FsResult<()> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.remove_fail_rate) {
            let err = core.inject_path("remove", path, REMOVE_ERRNOS);
            core.trace_fail("remove", path, &err);
            return Err(err);
        }
        match self.inner.remove(path) {
            Ok(()) => {
                core.trace_ok("remove", path, vec![]);
                Ok(())
            }
            Err(err) => {
                core.trace_fail("remove", path, &err);
                Err(err)
            }
        }
    }

    fn remove_all(&self, path: &Path) -> FsResult<()> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.remove_fail_rate) {
            let err = core.inject_path("removeall", path, REMOVE_ERRNOS);
            core.trace_fail("removeall", path, &err);
            return Err(err);
        }
        match self.inner.remove_all(path) {
            Ok(()) => {
                core.trace_ok("removeall", path, vec![]);
                Ok(())
            }
            Err(err) => {
                core.trace_fail("removeall", path, &err);
                Err(err)
            }
        }
    }

    fn rename(&self, old: &Path, new: &Path) -> FsResult<()> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.rename_fail_rate) {
            let err = core.inject_link("rename", old, new, RENAME_ERRNOS);
            core.trace_fail("rename", old, &err);
            return Err(err);
        }
        match self.inner.rename(old, new) {
            Ok(()) => {
                core.trace_ok("rename", old, vec![("to", new.display().to_string())]);
                Ok(())
            }
            Err(err) => {
                core.trace_fail("rename", old, &err);
                Err(err)
            }
        }
    }
}

struct ChaosFile {
    inner: Box<dyn File>,
    path: PathBuf,
    core: Arc<ChaosCore>,
}

impl ChaosFile {
    /// Writes the whole prefix through the inner handle, retrying short
    /// writes, so an injected partial write is truly on disk.
    fn write_prefix(&self, data: &[u8]) -> FsResult<usize> {
        let mut written = 0;
        while written < data.len() {
            let n = self.inner.write(&data[written..])?;
            if n == 0 {
                return Err(FsError::path(
                    "write",
                    &self.path,
                    io::Error::new(io::ErrorKind::WriteZero, "write returned 0 bytes"),
                ));
            }
            written += n;
        }
        Ok(written)
    }
}

impl File for ChaosFile {
    fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.read_fail_rate) {
            let err = core.inject_path("read", &self.path, EIO_ONLY);
            core.trace_fail("read", &self.path, &err);
            return Err(err);
        }
        let partial = core.roll(core.config.partial_read_rate);
        if partial && buf.len() > 1 {
            // limit the underlying read so the handle offset only
            // advances past bytes actually returned
            let cut = core.cut(buf.len());
            match self.inner.read(&mut buf[..cut]) {
                Ok(n) => {
                    core.stats.short_reads.fetch_add(1, Ordering::Relaxed);
                    core.trace_shaped(
                        "read",
                        &self.path,
                        TraceEventKind::ShortRead,
                        None,
                        vec![("cut", cut.to_string()), ("bytes", n.to_string())],
                    );
                    return Ok(n);
                }
                Err(err) => {
                    core.trace_fail("read", &self.path, &err);
                    return Err(err);
                }
            }
        }
        match self.inner.read(buf) {
            Ok(n) => {
                core.trace_ok("read", &self.path, vec![("bytes", n.to_string())]);
                Ok(n)
            }
            Err(err) => {
                core.trace_fail("read", &self.path, &err);
                Err(err)
            }
        }
    }

    fn write(&self, data: &[u8]) -> FsResult<usize> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.write_fail_rate) {
            let err = core.inject_path("write", &self.path, FILE_WRITE_ERRNOS);
            core.trace_fail("write", &self.path, &err);
            return Err(err);
        }
        let partial = core.roll(core.config.partial_write_rate);
        if partial && data.len() > 1 {
            let cut = core.cut(data.len());
            let short = core.roll(core.config.short_write_rate);
            match self.write_prefix(&data[..cut]) {
                Ok(written) => {
                    core.stats.partial_writes.fetch_add(1, Ordering::Relaxed);
                    core.stats.injected_faults.fetch_add(1, Ordering::Relaxed);
                    let (kind, err) = if short {
                        (
                            TraceEventKind::ShortWrite,
                            FsError::path(
                                "write",
                                &self.path,
                                io::Error::new(io::ErrorKind::WriteZero, "short write"),
                            )
                            .injected(),
                        )
                    } else {
                        (
                            TraceEventKind::PartialWrite,
                            FsError::path(
                                "write",
                                &self.path,
                                errno_error(core.pick_errno(FILE_WRITE_ERRNOS)),
                            )
                            .injected(),
                        )
                    };
                    core.trace_shaped(
                        "write",
                        &self.path,
                        kind,
                        Some(&err),
                        vec![("written", written.to_string()), ("len", data.len().to_string())],
                    );
                    return Err(err);
                }
                Err(err) => {
                    core.trace_fail("write", &self.path, &err);
                    return Err(err);
                }
            }
        }
        match self.inner.write(data) {
            Ok(n) => {
                core.trace_ok("write", &self.path, vec![("bytes", n.to_string())]);
                Ok(n)
            }
            Err(err) => {
                core.trace_fail("write", &self.path, &err);
                Err(err)
            }
        }
    }

    fn seek(&self, pos: SeekFrom) -> FsResult<u64> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.seek_fail_rate) {
            let err = core.inject_path("seek", &self.path, EIO_ONLY);
            core.trace_fail("seek", &self.path, &err);
            return Err(err);
        }
        match self.inner.seek(pos) {
            Ok(offset) => {
                core.trace_ok("seek", &self.path, vec![("offset", offset.to_string())]);
                Ok(offset)
            }
            Err(err) => {
                core.trace_fail("seek", &self.path, &err);
                Err(err)
            }
        }
    }

    fn stat(&self) -> FsResult<FileInfo> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.file_stat_fail_rate) {
            let err = core.inject_path("stat", &self.path, EIO_ONLY);
            core.trace_fail("stat", &self.path, &err);
            return Err(err);
        }
        match self.inner.stat() {
            Ok(info) => {
                core.trace_ok("stat", &self.path, vec![]);
                Ok(info)
            }
            Err(err) => {
                core.trace_fail("stat", &self.path, &err);
                Err(err)
            }
        }
    }

    fn sync(&self) -> FsResult<()> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.sync_fail_rate) {
            let err = core.inject_path("sync", &self.path, FILE_SYNC_ERRNOS);
            core.trace_fail("sync", &self.path, &err);
            return Err(err);
        }
        match self.inner.sync() {
            Ok(()) => {
                core.trace_ok("sync", &self.path, vec![]);
                Ok(())
            }
            Err(err) => {
                core.trace_fail("sync", &self.path, &err);
                Err(err)
            }
        }
    }

    fn chmod(&self, mode: u32) -> FsResult<()> {
        let core = &self.core;
        core.count_op();
        if core.roll(core.config.chmod_fail_rate) {
            let err = core.inject_path("chmod", &self.path, FILE_CHMOD_ERRNOS);
            core.trace_fail("chmod", &self.path, &err);
            return Err(err);
        }
        match self.inner.chmod(mode) {
            Ok(()) => {
                core.trace_ok("chmod", &self.path, vec![("mode", format!("{:o}", mode))]);
                Ok(())
            }
            Err(err) => {
                core.trace_fail("chmod", &self.path, &err);
                Err(err)
            }
        }
    }

    fn close(&self) -> FsResult<()> {
        let core = &self.core;
        core.count_op();
        let inject = core.roll(core.config.close_fail_rate);
        // the descriptor is released no matter what gets reported
        let genuine = self.inner.close();
        if inject && genuine.is_ok() {
            let err = core.inject_path("close", &self.path, EIO_ONLY);
            core.trace_fail("close", &self.path, &err);
            return Err(err);
        }
        match genuine {
            Ok(()) => {
                core.trace_ok("close", &self.path, vec![]);
                Ok(())
            }
            Err(err) => {
                core.trace_fail("close", &self.path, &err);
                Err(err)
            }
        }
    }

    fn fd(&self) -> RawFd {
        self.inner.fd()
    }
}
