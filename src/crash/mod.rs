/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

pub mod failpoint;
pub(crate) mod snapshot;
pub mod writeback;

use std::{
    fmt::Display,
    io::{self, SeekFrom},
    os::unix::io::RawFd,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::{
    error::{FsError, FsResult},
    fs::{has_flag, write_all, DirEntry, File, FileInfo, FileSystem, OpenFlag},
    temp_dir::TempDirProvider,
};

use failpoint::{Failpoint, FailpointConfig, FailpointError};
use snapshot::{FileSnapshot, ObjId, ObjKind, Snapshot, ROOT_ID};
use writeback::{WritebackConfig, WritebackEngine, WritebackError};

const DIR_MODE: u32 = 0o755;
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Every operation the crash simulator can observe, plus the synthetic
/// `Crash` op that tags re-latched terminations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashOp {
    Open,
    Create,
    OpenFile,
    ReadFile,
    WriteFile,
    ReadDir,
    MkdirAll,
    Stat,
    Exists,
    Remove,
    RemoveAll,
    Rename,
    FileRead,
    FileWrite,
    FileSeek,
    FileStat,
    FileSync,
    FileChmod,
    FileClose,
    Crash,
}

impl CrashOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrashOp::Open => "open",
            CrashOp::Create => "create",
            CrashOp::OpenFile => "openfile",
            CrashOp::ReadFile => "readfile",
            CrashOp::WriteFile => "writefile",
            CrashOp::ReadDir => "readdir",
            CrashOp::MkdirAll => "mkdirall",
            CrashOp::Stat => "stat",
            CrashOp::Exists => "exists",
            CrashOp::Remove => "remove",
            CrashOp::RemoveAll => "removeall",
            CrashOp::Rename => "rename",
            CrashOp::FileRead => "file.read",
            CrashOp::FileWrite => "file.write",
            CrashOp::FileSeek => "file.seek",
            CrashOp::FileStat => "file.stat",
            CrashOp::FileSync => "file.sync",
            CrashOp::FileChmod => "file.chmod",
            CrashOp::FileClose => "file.close",
            CrashOp::Crash => "crash",
        }
    }
}

impl Display for CrashOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a triggered failpoint does to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CrashAction {
    /// Unwind with a [`CrashPanicValue`] payload; tests catch it with
    /// `catch_unwind` on the faulting thread.
    Panic,
    /// Terminate the process with the configured nonzero exit code.
    /// The only usable action when panics are configured to abort.
    Exit,
}

/// The structured payload a triggered failpoint panics with. Subsequent
/// calls re-panic with the same payload until [`CrashFs::recover`].
#[derive(Debug, Clone, PartialEq)]
pub struct CrashPanicValue {
    pub op: CrashOp,
    pub path: String,
    pub rel: String,
    pub new_path: String,
    pub new_rel: String,
    pub seq: u64,
    pub cause: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    pub failpoint: Option<FailpointConfig>,
    pub writeback: Option<WritebackConfig>,
}

#[derive(Debug, Error)]
pub enum CrashSetupError {
    #[error("invalid failpoint config: {0}")]
    Failpoint(#[from] FailpointError),
    #[error("invalid writeback config: {0}")]
    Writeback(#[from] WritebackError),
    #[error("create base directory: {0}")]
    TempDir(#[from] io::Error),
    #[error("prepare working directory: {0}")]
    Prepare(#[from] FsError),
}

/// Normalizes a user path to root-relative form: absolute paths lose the
/// leading separator, `""` and `"."` mean the root, and a path that
/// still escapes upward after cleaning is rejected.
pub(crate) fn normalize_rel(path: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Prefix(_) => return None,
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(name) => parts.push(name),
        }
    }
    Some(parts.iter().collect())
}

fn escape_error(op: CrashOp, path: &Path) -> FsError {
    FsError::path(
        op.as_str(),
        path,
        io::Error::new(io::ErrorKind::InvalidInput, "path escapes filesystem root"),
    )
}

fn closed_error() -> io::Error {
    io::Error::other("file already closed")
}

fn terminate(action: CrashAction, exit_code: i32, payload: CrashPanicValue) -> ! {
    match action {
        CrashAction::Panic => std::panic::panic_any(payload),
        CrashAction::Exit => {
            error!(
                "crash failpoint exit {}: {} '{}' seq {}",
                exit_code, payload.op, payload.rel, payload.seq
            );
            std::process::exit(exit_code)
        }
    }
}

struct HandleSlot {
    rel: PathBuf,
    obj: ObjId,
    generation: u64,
    is_dir: bool,
    file: Mutex<Option<Box<dyn File>>>,
}

struct CrashState {
    generation: u64,
    workdir: PathBuf,
    snapshot: Snapshot,
    handles: Vec<Arc<HandleSlot>>,
    latched: Option<(CrashAction, i32, CrashPanicValue)>,
    failpoint: Option<Failpoint>,
    writeback: Option<WritebackEngine>,
}

struct CrashShared {
    fs: Arc<dyn FileSystem>,
    base_dir: PathBuf,
    state: Mutex<CrashState>,
}

/// Resolution of a call against the working directory current at the
/// time the failpoint was consulted.
struct OpToken {
    rel: PathBuf,
    abs: PathBuf,
    new_abs: Option<PathBuf>,
    generation: u64,
}

impl CrashShared {
    /// The per-operation template head: re-terminate when latched,
    /// consult the failpoint, then resolve against the current working
    /// directory. Underlying filesystem calls happen after this returns,
    /// without the lock.
    fn begin(&self, op: CrashOp, raw: &Path, raw_new: Option<&Path>) -> FsResult<OpToken> {
        let rel = normalize_rel(raw).ok_or_else(|| escape_error(op, raw))?;
        let new_rel = match raw_new {
            Some(raw_new) => {
                Some(normalize_rel(raw_new).ok_or_else(|| escape_error(op, raw_new))?)
            }
            None => None,
        };
        let mut state = self.state.lock().unwrap();
        if let Some((action, exit_code, payload)) = state.latched.clone() {
            drop(state);
            debug!("{} while latched, re-terminating as {}", op, CrashOp::Crash);
            terminate(action, exit_code, payload);
        }
        let mut triggered = None;
        if let Some(failpoint) = state.failpoint.as_mut() {
            if failpoint.armed() && failpoint.eligible(op, &rel, new_rel.as_deref()) {
                let (fire, seq) = failpoint.advance();
                if fire {
                    failpoint.disarm();
                    triggered = Some((failpoint.action(), failpoint.exit_code(), seq));
                }
            }
        }
        if let Some((action, exit_code, seq)) = triggered {
            let payload = CrashPanicValue {
                op,
                path: raw.display().to_string(),
                rel: rel.display().to_string(),
                new_path: raw_new
                    .map(|path| path.display().to_string())
                    .unwrap_or_default(),
                new_rel: new_rel
                    .as_ref()
                    .map(|rel| rel.display().to_string())
                    .unwrap_or_default(),
                seq,
                cause: None,
            };
            info!(
                "failpoint triggered: {} '{}' seq {}",
                payload.op, payload.rel, payload.seq
            );
            rotate_locked(self, &mut state)?;
            state.latched = Some((action, exit_code, payload.clone()));
            drop(state);
            terminate(action, exit_code, payload);
        }
        Ok(OpToken {
            abs: state.workdir.join(&rel),
            new_abs: new_rel.as_ref().map(|rel| state.workdir.join(rel)),
            rel,
            generation: state.generation,
        })
    }
}

/// Materializes a restored snapshot onto disk under `base`, dirs first,
/// children in sorted name order.
fn materialize(fs: &dyn FileSystem, base: &Path, snapshot: &Snapshot) -> FsResult<()> {
    let mut stack = vec![(ROOT_ID, PathBuf::new())];
    while let Some((dir, rel)) = stack.pop() {
        let Some(children) = snapshot.durable_children.get(&dir) else {
            continue;
        };
        for (name, child) in children {
            let child_rel = rel.join(name);
            let abs = base.join(&child_rel);
            match snapshot.kind(*child) {
                Some(ObjKind::Dir) => {
                    fs.mkdir_all(&abs, DIR_MODE)
                        .map_err(|err| err.crash("restore"))?;
                    stack.push((*child, child_rel));
                }
                Some(ObjKind::File) => {
                    let (bytes, mode) = match snapshot.durable_files.get(child) {
                        Some(file) => (file.bytes.as_slice(), file.mode),
                        None => (&[][..], DEFAULT_FILE_MODE),
                    };
                    let file = fs
                        .open_file(&abs, &[OpenFlag::Write, OpenFlag::Create, OpenFlag::Trunc], mode)
                        .map_err(|err| err.crash("restore"))?;
                    let result = write_all(file.as_ref(), bytes, &child_rel)
                        .and_then(|()| file.chmod(mode));
                    let close_result = file.close();
                    result.map_err(|err| err.crash("restore"))?;
                    close_result.map_err(|err| err.crash("restore"))?;
                }
                None => {}
            }
        }
    }
    Ok(())
}

/// Rotate: build and materialize the restored tree in a fresh working
/// directory, then commit by swapping it in, closing every tracked
/// handle and discarding the old directory. A failure before the commit
/// leaves the previous working directory fully intact.
fn rotate_locked(shared: &CrashShared, state: &mut CrashState) -> FsResult<()> {
    let new_generation = state.generation + 1;
    let new_workdir = shared.base_dir.join(format!("gen-{}", new_generation));
    shared
        .fs
        .mkdir_all(&new_workdir, DIR_MODE)
        .map_err(|err| err.crash("rotate"))?;
    let mut restored = state.snapshot.clone();
    restored.restore();
    if let Err(err) = materialize(shared.fs.as_ref(), &new_workdir, &restored) {
        if let Err(cleanup) = shared.fs.remove_all(&new_workdir) {
            warn!(
                "failed to clean up aborted working directory '{}': {}",
                new_workdir.display(),
                cleanup
            );
        }
        return Err(err);
    }
    for slot in state.handles.drain(..) {
        if let Some(file) = slot.file.lock().unwrap().take() {
            if let Err(err) = file.close() {
                warn!("close during rotation: {}", err);
            }
        }
    }
    let old_workdir = std::mem::replace(&mut state.workdir, new_workdir);
    state.generation = new_generation;
    state.snapshot = restored;
    if let Err(err) = shared.fs.remove_all(&old_workdir) {
        warn!(
            "failed to remove old working directory '{}': {}",
            old_workdir.display(),
            err
        );
    }
    info!("rotated to generation {}", new_generation);
    Ok(())
}

fn check_no_symlinks(workdir: &Path) -> FsResult<()> {
    for entry in WalkDir::new(workdir).follow_links(false) {
        let entry = entry.map_err(|err| {
            FsError::crash_msg("writeback", workdir, format!("walk live tree: {}", err))
        })?;
        if entry.path_is_symlink() {
            return Err(FsError::crash_msg(
                "writeback",
                entry.path(),
                "symbolic link in live tree",
            ));
        }
    }
    Ok(())
}

/// Reads the whole file behind `fd` with positional reads, leaving the
/// descriptor offset untouched.
fn read_all_at(fd: RawFd) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut offset: libc::off_t = 0;
    let mut buf = [0u8; 8192];
    loop {
        let n = unsafe { libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n as usize]);
        offset += n as libc::off_t;
    }
    Ok(out)
}

fn fstat_mode(fd: RawFd) -> io::Result<u32> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let stat = unsafe { stat.assume_init() };
    Ok((stat.st_mode as u32) & 0o7777)
}

/// The crash-consistency simulator.
///
/// Presents the full filesystem surface over an owned, per-generation
/// working directory while maintaining the durable snapshot that
/// [`CrashFs::simulate_crash`] restores from. Clones share one
/// simulator, so a clone can be handed out as `Arc<dyn FileSystem>`
/// while the original keeps the crash controls.
pub struct CrashFs {
    shared: Arc<CrashShared>,
}

impl Clone for CrashFs {
    fn clone(&self) -> Self {
        CrashFs {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl CrashFs {
    pub fn new(
        provider: &dyn TempDirProvider,
        fs: Arc<dyn FileSystem>,
        config: CrashConfig,
    ) -> Result<CrashFs, CrashSetupError> {
        let failpoint = config
            .failpoint
            .as_ref()
            .map(Failpoint::new)
            .transpose()?;
        let writeback = config
            .writeback
            .as_ref()
            .map(WritebackEngine::new)
            .transpose()?
            .filter(WritebackEngine::enabled);
        let base_dir = provider.create_temp_dir("crashfs")?;
        let workdir = base_dir.join("gen-1");
        fs.mkdir_all(&workdir, DIR_MODE)?;
        info!("crash fs ready at '{}'", workdir.display());
        Ok(CrashFs {
            shared: Arc::new(CrashShared {
                fs,
                base_dir,
                state: Mutex::new(CrashState {
                    generation: 1,
                    workdir,
                    snapshot: Snapshot::new(),
                    handles: Vec::new(),
                    latched: None,
                    failpoint,
                    writeback,
                }),
            }),
        })
    }

    /// The directory all generations live under; owned by this instance.
    pub fn base_dir(&self) -> PathBuf {
        self.shared.base_dir.clone()
    }

    /// Absolute path of the current working directory.
    pub fn workdir(&self) -> PathBuf {
        self.shared.state.lock().unwrap().workdir.clone()
    }

    pub fn generation(&self) -> u64 {
        self.shared.state.lock().unwrap().generation
    }

    /// Simulates a crash: with writeback configured, first merges the
    /// durable and live views into a new durable snapshot; then rotates
    /// to a fresh working directory restored from durable state.
    ///
    /// Must not be called concurrently with ongoing writes by the system
    /// under test; callers that need that invariant impose their own
    /// barrier.
    pub fn simulate_crash(&self) -> FsResult<()> {
        let shared = &self.shared;
        let mut guard = shared.state.lock().unwrap();
        let state = &mut *guard;
        let CrashState {
            ref mut writeback,
            ref mut snapshot,
            ref workdir,
            ..
        } = *state;
        if let Some(engine) = writeback.as_mut() {
            check_no_symlinks(workdir)?;
            let workdir = workdir.clone();
            let fs = Arc::clone(&shared.fs);
            let mut read_live = |rel: &Path| -> FsResult<(Vec<u8>, u32)> {
                let abs = workdir.join(rel);
                let bytes = fs.read_file(&abs)?;
                let mode = fs.stat(&abs)?.mode;
                Ok((bytes, mode))
            };
            let merged = engine
                .merge(snapshot, &mut read_live)
                .map_err(|err| match err.is_crash_internal() {
                    true => err,
                    false => err.crash("writeback"),
                })?;
            snapshot.durable_children = merged.durable_children;
            snapshot.durable_files = merged.durable_files;
            info!("writeback merge committed");
        }
        rotate_locked(shared, state)
    }

    /// Clears the latched post-crash state so assertions can proceed.
    pub fn recover(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.latched.take().is_some() {
            info!("recovered from latched crash");
        }
    }

    /// Registers a successfully opened handle against live state.
    fn bind_handle(
        &self,
        op: CrashOp,
        raw: &Path,
        token: OpToken,
        file: Box<dyn File>,
        create_if_missing: bool,
    ) -> FsResult<Box<dyn File>> {
        let info = match file.stat() {
            Ok(info) => info,
            Err(err) => {
                let _ = file.close();
                return Err(err);
            }
        };
        let mut state = self.shared.state.lock().unwrap();
        if state.generation != token.generation {
            drop(state);
            let _ = file.close();
            return Err(FsError::crash_msg(
                op.as_str(),
                raw,
                "working directory rotated during open",
            ));
        }
        let bind_failure = |state: std::sync::MutexGuard<'_, CrashState>,
                            file: Box<dyn File>,
                            msg: &str|
         -> FsError {
            drop(state);
            let _ = file.close();
            FsError::crash_msg(op.as_str(), raw, msg.to_owned())
        };
        let obj = match state.snapshot.live_lookup(&token.rel) {
            Some((id, kind)) => {
                if (kind == ObjKind::Dir) != info.is_dir {
                    return Err(bind_failure(state, file, "live state kind mismatch"));
                }
                id
            }
            None if !create_if_missing => {
                return Err(bind_failure(state, file, "object missing from live state"));
            }
            None if info.is_dir => {
                return Err(bind_failure(
                    state,
                    file,
                    "directory creation through open is not supported",
                ));
            }
            None => match state.snapshot.live_add_file(&token.rel) {
                Some(id) => id,
                None => {
                    return Err(bind_failure(
                        state,
                        file,
                        "parent directory missing from live state",
                    ));
                }
            },
        };
        let slot = Arc::new(HandleSlot {
            rel: token.rel,
            obj,
            generation: token.generation,
            is_dir: info.is_dir,
            file: Mutex::new(Some(file)),
        });
        state.handles.push(Arc::clone(&slot));
        Ok(Box::new(CrashFile {
            shared: Arc::clone(&self.shared),
            slot,
        }))
    }

    /// Applies a live-state update after a successful underlying call,
    /// unless the working directory rotated in between.
    fn update_live(
        &self,
        token: &OpToken,
        update: impl FnOnce(&mut Snapshot) -> Option<()>,
        op: CrashOp,
        raw: &Path,
    ) -> FsResult<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.generation != token.generation {
            return Ok(());
        }
        match update(&mut state.snapshot) {
            Some(()) => Ok(()),
            None => Err(FsError::crash_msg(
                op.as_str(),
                raw,
                "live state out of sync with working directory",
            )),
        }
    }
}

impl FileSystem for CrashFs {
    fn open(&self, path: &Path) -> FsResult<Box<dyn File>> {
        let token = self.shared.begin(CrashOp::Open, path, None)?;
        let file = self.shared.fs.open(&token.abs)?;
        self.bind_handle(CrashOp::Open, path, token, file, false)
    }

    fn create(&self, path: &Path) -> FsResult<Box<dyn File>> {
        let token = self.shared.begin(CrashOp::Create, path, None)?;
        let file = self.shared.fs.create(&token.abs)?;
        self.bind_handle(CrashOp::Create, path, token, file, true)
    }

    fn open_file(&self, path: &Path, flags: &[OpenFlag], mode: u32) -> FsResult<Box<dyn File>> {
        let token = self.shared.begin(CrashOp::OpenFile, path, None)?;
        let file = self.shared.fs.open_file(&token.abs, flags, mode)?;
        let create = has_flag(flags, OpenFlag::Create);
        self.bind_handle(CrashOp::OpenFile, path, token, file, create)
    }

    fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        let token = self.shared.begin(CrashOp::ReadFile, path, None)?;
        self.shared.fs.read_file(&token.abs)
    }

    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        let token = self.shared.begin(CrashOp::WriteFile, path, None)?;
        self.shared.fs.write_file(&token.abs, data, mode)?;
        self.update_live(
            &token,
            |snapshot| match snapshot.live_lookup(&token.rel) {
                Some((_, ObjKind::File)) => Some(()),
                Some((_, ObjKind::Dir)) => None,
                None => snapshot.live_add_file(&token.rel).map(|_| ()),
            },
            CrashOp::WriteFile,
            path,
        )
    }

    fn read_dir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let token = self.shared.begin(CrashOp::ReadDir, path, None)?;
        self.shared.fs.read_dir(&token.abs)
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> FsResult<()> {
        let token = self.shared.begin(CrashOp::MkdirAll, path, None)?;
        self.shared.fs.mkdir_all(&token.abs, mode)?;
        self.update_live(
            &token,
            |snapshot| snapshot.live_ensure_dir_path(&token.rel).map(|_| ()),
            CrashOp::MkdirAll,
            path,
        )
    }

    fn stat(&self, path: &Path) -> FsResult<FileInfo> {
        let token = self.shared.begin(CrashOp::Stat, path, None)?;
        self.shared.fs.stat(&token.abs)
    }

    fn exists(&self, path: &Path) -> FsResult<bool> {
        let token = self.shared.begin(CrashOp::Exists, path, None)?;
        self.shared.fs.exists(&token.abs)
    }

    fn remove(&self, path: &Path) -> FsResult<()> {
        let token = self.shared.begin(CrashOp::Remove, path, None)?;
        if token.rel.as_os_str().is_empty() {
            return Err(FsError::path(
                "remove",
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "removing root is forbidden"),
            ));
        }
        self.shared.fs.remove(&token.abs)?;
        self.update_live(
            &token,
            |snapshot| {
                snapshot.live_remove_entry(&token.rel);
                Some(())
            },
            CrashOp::Remove,
            path,
        )
    }

    fn remove_all(&self, path: &Path) -> FsResult<()> {
        let token = self.shared.begin(CrashOp::RemoveAll, path, None)?;
        if token.rel.as_os_str().is_empty() {
            return Err(FsError::path(
                "removeall",
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "removing root is forbidden"),
            ));
        }
        self.shared.fs.remove_all(&token.abs)?;
        self.update_live(
            &token,
            |snapshot| {
                snapshot.live_remove_entry(&token.rel);
                Some(())
            },
            CrashOp::RemoveAll,
            path,
        )
    }

    fn rename(&self, old: &Path, new: &Path) -> FsResult<()> {
        let token = self.shared.begin(CrashOp::Rename, old, Some(new))?;
        let new_abs = token.new_abs.clone().expect("rename resolves both paths");
        self.shared.fs.rename(&token.abs, &new_abs)?;
        let new_rel = normalize_rel(new).expect("validated in begin");
        self.update_live(
            &token,
            |snapshot| {
                snapshot.live_rename_entry(&token.rel, &new_rel);
                Some(())
            },
            CrashOp::Rename,
            old,
        )
    }
}

/// A handle bound to the object identity it was opened on. The
/// generation tag fences syncs issued against a rotated-away working
/// directory.
struct CrashFile {
    shared: Arc<CrashShared>,
    slot: Arc<HandleSlot>,
}

impl CrashFile {
    fn with_inner<T>(
        &self,
        op: &'static str,
        body: impl FnOnce(&dyn File) -> FsResult<T>,
    ) -> FsResult<T> {
        let guard = self.slot.file.lock().unwrap();
        match guard.as_ref() {
            Some(file) => body(file.as_ref()),
            None => Err(FsError::path(op, &self.slot.rel, closed_error())),
        }
    }
}

impl File for CrashFile {
    fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        self.shared.begin(CrashOp::FileRead, &self.slot.rel, None)?;
        self.with_inner("read", |file| file.read(buf))
    }

    fn write(&self, data: &[u8]) -> FsResult<usize> {
        self.shared.begin(CrashOp::FileWrite, &self.slot.rel, None)?;
        self.with_inner("write", |file| file.write(data))
    }

    fn seek(&self, pos: SeekFrom) -> FsResult<u64> {
        self.shared.begin(CrashOp::FileSeek, &self.slot.rel, None)?;
        self.with_inner("seek", |file| file.seek(pos))
    }

    fn stat(&self) -> FsResult<FileInfo> {
        self.shared.begin(CrashOp::FileStat, &self.slot.rel, None)?;
        self.with_inner("stat", |file| file.stat())
    }

    fn sync(&self) -> FsResult<()> {
        let token = self
            .shared
            .begin(CrashOp::FileSync, &self.slot.rel, None)?;
        if self.slot.generation != token.generation {
            // stale handle from a rotated-away working directory
            return Ok(());
        }
        let fd;
        {
            let guard = self.slot.file.lock().unwrap();
            let file = guard
                .as_ref()
                .ok_or_else(|| FsError::path("sync", &self.slot.rel, closed_error()))?;
            file.sync()?;
            fd = file.fd();
        }
        let mut guard = self.shared.state.lock().unwrap();
        let state = &mut *guard;
        if state.generation != self.slot.generation {
            return Ok(());
        }
        if self.slot.is_dir {
            if !state.snapshot.dir_reachable(self.slot.obj) {
                return Ok(());
            }
            state.snapshot.record_dir_sync(self.slot.obj);
            debug!("durable: dir '{}' synced", self.slot.rel.display());
            return Ok(());
        }
        let (bytes, mode) = match state.snapshot.find_live_path(self.slot.obj) {
            Some(rel) => {
                let abs = state.workdir.join(&rel);
                let bytes = self
                    .shared
                    .fs
                    .read_file(&abs)
                    .map_err(|err| err.crash("sync"))?;
                let mode = self
                    .shared
                    .fs
                    .stat(&abs)
                    .map_err(|err| err.crash("sync"))?
                    .mode;
                (bytes, mode)
            }
            None => {
                // unlinked but still open: go through the descriptor
                let bytes = read_all_at(fd)
                    .map_err(|err| FsError::path("sync", &self.slot.rel, err).crash("sync"))?;
                let mode = fstat_mode(fd)
                    .map_err(|err| FsError::path("sync", &self.slot.rel, err).crash("sync"))?;
                (bytes, mode)
            }
        };
        state
            .snapshot
            .record_file_sync(self.slot.obj, FileSnapshot { bytes, mode });
        debug!("durable: file '{}' synced", self.slot.rel.display());
        Ok(())
    }

    fn chmod(&self, mode: u32) -> FsResult<()> {
        self.shared
            .begin(CrashOp::FileChmod, &self.slot.rel, None)?;
        self.with_inner("chmod", |file| file.chmod(mode))
    }

    fn close(&self) -> FsResult<()> {
        self.shared
            .begin(CrashOp::FileClose, &self.slot.rel, None)?;
        let file = self.slot.file.lock().unwrap().take();
        let result = match file {
            Some(file) => file.close(),
            None => Err(FsError::path("close", &self.slot.rel, closed_error())),
        };
        let mut state = self.shared.state.lock().unwrap();
        state.handles.retain(|slot| !Arc::ptr_eq(slot, &self.slot));
        drop(state);
        result
    }

    fn fd(&self) -> RawFd {
        self.slot
            .file
            .lock()
            .unwrap()
            .as_ref()
            .map(|file| file.fd())
            .unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::writeback::{DirEntryWeights, FileWeights};
    use crate::{fs::real::RealFs, temp_dir::SystemTempDir};
    use std::{fs, panic::AssertUnwindSafe};

    fn crash_fs(config: CrashConfig) -> CrashFs {
        CrashFs::new(&SystemTempDir::new(), Arc::new(RealFs::new()), config).unwrap()
    }

    fn sync_path(fs: &CrashFs, path: &str) {
        let file = fs.open(Path::new(path)).unwrap();
        file.sync().unwrap();
        file.close().unwrap();
    }

    fn cleanup(fs: &CrashFs) {
        fs::remove_dir_all(fs.base_dir()).unwrap();
    }

    #[test]
    fn test_normalize_rel() {
        assert_eq!(Some(PathBuf::new()), normalize_rel(Path::new("")));
        assert_eq!(Some(PathBuf::new()), normalize_rel(Path::new(".")));
        assert_eq!(Some(PathBuf::from("a/b")), normalize_rel(Path::new("/a/b")));
        assert_eq!(Some(PathBuf::from("b")), normalize_rel(Path::new("a/../b")));
        assert_eq!(Some(PathBuf::new()), normalize_rel(Path::new("a/..")));
        assert_eq!(None, normalize_rel(Path::new("..")));
        assert_eq!(None, normalize_rel(Path::new("a/../../b")));
    }

    #[test]
    fn test_escaping_path_rejected() {
        let fs = crash_fs(CrashConfig::default());
        let err = fs.read_file(Path::new("../escape")).unwrap_err();
        assert_eq!("readfile", err.op());
        assert!(err.errno().is_none());
        cleanup(&fs);
    }

    #[test]
    fn test_basic_passthrough() {
        let fs = crash_fs(CrashConfig::default());
        fs.mkdir_all(Path::new("a/b"), 0o755).unwrap();
        fs.write_file(Path::new("a/b/f"), b"hello", 0o644).unwrap();
        assert_eq!(b"hello".to_vec(), fs.read_file(Path::new("a/b/f")).unwrap());
        assert!(fs.exists(Path::new("a/b/f")).unwrap());
        let entries = fs.read_dir(Path::new("a")).unwrap();
        assert_eq!(1, entries.len());
        assert_eq!("b", entries[0].name);
        cleanup(&fs);
    }

    #[test]
    fn test_unsynced_state_vanishes_on_crash() {
        let fs = crash_fs(CrashConfig::default());
        fs.write_file(Path::new("f"), b"data", 0o644).unwrap();
        fs.mkdir_all(Path::new("d"), 0o755).unwrap();
        fs.simulate_crash().unwrap();
        assert!(!fs.exists(Path::new("f")).unwrap());
        assert!(!fs.exists(Path::new("d")).unwrap());
        assert_eq!(2, fs.generation());
        cleanup(&fs);
    }

    #[test]
    fn test_unsynced_overwrite_reverts() {
        let fs = crash_fs(CrashConfig::default());
        fs.write_file(Path::new("a"), b"old", 0o644).unwrap();
        sync_path(&fs, "a");
        sync_path(&fs, ".");
        fs.write_file(Path::new("a"), b"new", 0o644).unwrap();
        fs.simulate_crash().unwrap();
        assert_eq!(b"old".to_vec(), fs.read_file(Path::new("a")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_file_without_file_sync_restores_empty() {
        let fs = crash_fs(CrashConfig::default());
        fs.write_file(Path::new("f"), b"payload", 0o644).unwrap();
        sync_path(&fs, ".");
        fs.simulate_crash().unwrap();
        // the entry was durable, its contents never were
        assert_eq!(Vec::<u8>::new(), fs.read_file(Path::new("f")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_mkdir_all_with_ancestor_syncs_survives() {
        let fs = crash_fs(CrashConfig::default());
        fs.mkdir_all(Path::new("x/y/z"), 0o755).unwrap();
        sync_path(&fs, ".");
        sync_path(&fs, "x");
        sync_path(&fs, "x/y");
        fs.simulate_crash().unwrap();
        assert!(fs.stat(Path::new("x/y/z")).unwrap().is_dir);
        cleanup(&fs);
    }

    #[test]
    fn test_dir_sync_is_needed_per_parent() {
        let fs = crash_fs(CrashConfig::default());
        fs.mkdir_all(Path::new("x/y"), 0o755).unwrap();
        sync_path(&fs, ".");
        // "x" itself never synced: "x" survives, "x/y" does not
        fs.simulate_crash().unwrap();
        assert!(fs.exists(Path::new("x")).unwrap());
        assert!(!fs.exists(Path::new("x/y")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_cross_directory_rename_needs_both_dir_syncs() {
        let fs = crash_fs(CrashConfig::default());
        fs.mkdir_all(Path::new("a"), 0o755).unwrap();
        fs.mkdir_all(Path::new("b"), 0o755).unwrap();
        sync_path(&fs, ".");
        fs.write_file(Path::new("a/file"), b"data", 0o644).unwrap();
        sync_path(&fs, "a/file");
        sync_path(&fs, "a");
        fs.rename(Path::new("a/file"), Path::new("b/file")).unwrap();
        sync_path(&fs, "a");
        fs.simulate_crash().unwrap();
        // source removal became durable, destination addition did not
        assert!(!fs.exists(Path::new("a/file")).unwrap());
        assert!(!fs.exists(Path::new("b/file")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_rename_then_dest_sync_moves_file() {
        let fs = crash_fs(CrashConfig::default());
        fs.mkdir_all(Path::new("a"), 0o755).unwrap();
        fs.mkdir_all(Path::new("b"), 0o755).unwrap();
        sync_path(&fs, ".");
        fs.write_file(Path::new("a/file"), b"data", 0o644).unwrap();
        sync_path(&fs, "a/file");
        sync_path(&fs, "a");
        fs.rename(Path::new("a/file"), Path::new("b/file")).unwrap();
        sync_path(&fs, "a");
        sync_path(&fs, "b");
        fs.simulate_crash().unwrap();
        assert!(!fs.exists(Path::new("a/file")).unwrap());
        assert_eq!(b"data".to_vec(), fs.read_file(Path::new("b/file")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_sync_records_bytes_for_opened_identity() {
        let fs = crash_fs(CrashConfig::default());
        fs.write_file(Path::new("a"), b"v1", 0o644).unwrap();
        sync_path(&fs, "a");
        sync_path(&fs, ".");
        let handle = fs
            .open_file(Path::new("a"), &[OpenFlag::ReadWrite], 0o644)
            .unwrap();
        // the name now points at a different file
        fs.rename(Path::new("a"), Path::new("b")).unwrap();
        fs.write_file(Path::new("a"), b"impostor", 0o644).unwrap();
        handle.seek(SeekFrom::Start(0)).unwrap();
        handle.write(b"v2").unwrap();
        handle.sync().unwrap();
        handle.close().unwrap();
        fs.simulate_crash().unwrap();
        // durable name "a" still refers to the original identity, whose
        // synced bytes are v2; the impostor was never synced
        assert_eq!(b"v2".to_vec(), fs.read_file(Path::new("a")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_unlinked_but_open_sync_goes_through_descriptor() {
        let fs = crash_fs(CrashConfig::default());
        fs.write_file(Path::new("a"), b"before", 0o644).unwrap();
        sync_path(&fs, "a");
        sync_path(&fs, ".");
        let handle = fs
            .open_file(Path::new("a"), &[OpenFlag::ReadWrite], 0o644)
            .unwrap();
        fs.remove(Path::new("a")).unwrap();
        handle.seek(SeekFrom::Start(0)).unwrap();
        handle.write(b"after!").unwrap();
        handle.sync().unwrap();
        handle.close().unwrap();
        fs.simulate_crash().unwrap();
        // the removal never became durable, so the durable name revives
        // the file with the bytes synced through the descriptor
        assert_eq!(b"after!".to_vec(), fs.read_file(Path::new("a")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_no_resurrection_after_durable_removal() {
        let fs = crash_fs(CrashConfig::default());
        fs.write_file(Path::new("f"), b"x", 0o644).unwrap();
        sync_path(&fs, "f");
        sync_path(&fs, ".");
        fs.remove(Path::new("f")).unwrap();
        sync_path(&fs, ".");
        fs.simulate_crash().unwrap();
        assert!(!fs.exists(Path::new("f")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_stale_handle_sync_is_ignored_after_crash() {
        let fs = crash_fs(CrashConfig::default());
        fs.write_file(Path::new("f"), b"x", 0o644).unwrap();
        let handle = fs.open(Path::new("f")).unwrap();
        fs.simulate_crash().unwrap();
        // the handle belongs to generation 1; sync must be a no-op
        handle.sync().unwrap();
        assert!(!fs.exists(Path::new("f")).unwrap());
        fs.simulate_crash().unwrap();
        assert!(!fs.exists(Path::new("f")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_removed_dir_sync_is_ignored() {
        let fs = crash_fs(CrashConfig::default());
        fs.mkdir_all(Path::new("d"), 0o755).unwrap();
        fs.write_file(Path::new("d/f"), b"x", 0o644).unwrap();
        sync_path(&fs, ".");
        let dir_handle = fs.open(Path::new("d")).unwrap();
        fs.remove_all(Path::new("d")).unwrap();
        // directory is gone from live state; its sync must not
        // resurrect "d/f" in durable state
        dir_handle.sync().unwrap();
        dir_handle.close().unwrap();
        fs.simulate_crash().unwrap();
        assert!(fs.exists(Path::new("d")).unwrap());
        assert!(!fs.exists(Path::new("d/f")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_dir_sync_propagates_to_all_durable_names() {
        let fs = crash_fs(CrashConfig::default());
        fs.mkdir_all(Path::new("d"), 0o755).unwrap();
        sync_path(&fs, ".");
        // rename the directory but only sync the new parent state; the
        // old durable name still refers to the same directory id
        fs.rename(Path::new("d"), Path::new("e")).unwrap();
        fs.write_file(Path::new("e/f"), b"x", 0o644).unwrap();
        sync_path(&fs, "e/f");
        sync_path(&fs, "e");
        fs.simulate_crash().unwrap();
        // root never saw the rename durably, so the dir is still "d",
        // but its synced contents are visible through that name
        assert!(fs.exists(Path::new("d")).unwrap());
        assert_eq!(b"x".to_vec(), fs.read_file(Path::new("d/f")).unwrap());
        assert!(!fs.exists(Path::new("e")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_consecutive_crashes_are_stable() {
        let fs = crash_fs(CrashConfig::default());
        fs.mkdir_all(Path::new("d"), 0o755).unwrap();
        fs.write_file(Path::new("d/f"), b"stable", 0o644).unwrap();
        sync_path(&fs, "d/f");
        sync_path(&fs, ".");
        sync_path(&fs, "d");
        fs.simulate_crash().unwrap();
        assert_eq!(b"stable".to_vec(), fs.read_file(Path::new("d/f")).unwrap());
        fs.simulate_crash().unwrap();
        assert_eq!(b"stable".to_vec(), fs.read_file(Path::new("d/f")).unwrap());
        assert_eq!(3, fs.generation());
        cleanup(&fs);
    }

    #[test]
    fn test_remove_root_is_forbidden() {
        let fs = crash_fs(CrashConfig::default());
        assert!(fs.remove(Path::new(".")).is_err());
        assert!(fs.remove_all(Path::new("")).is_err());
        cleanup(&fs);
    }

    #[test]
    fn test_failpoint_triggers_and_latches() {
        let fs = crash_fs(CrashConfig {
            failpoint: Some(FailpointConfig {
                after: 2,
                ops: vec![CrashOp::FileWrite],
                ..FailpointConfig::default()
            }),
            writeback: None,
        });
        fs.write_file(Path::new("a"), b"old", 0o644).unwrap();
        sync_path(&fs, "a");
        sync_path(&fs, ".");
        let handle = fs
            .open_file(Path::new("a"), &[OpenFlag::Write], 0o644)
            .unwrap();
        handle.write(b"x").unwrap();
        let payload = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = handle.write(b"y");
        }))
        .unwrap_err();
        let payload = payload
            .downcast::<CrashPanicValue>()
            .expect("failpoint panics with a structured payload");
        assert_eq!(CrashOp::FileWrite, payload.op);
        assert_eq!("a", payload.rel);
        assert_eq!(2, payload.seq);

        // latched: every call re-panics with the same payload
        let again = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = fs.read_file(Path::new("a"));
        }))
        .unwrap_err();
        let again = again.downcast::<CrashPanicValue>().unwrap();
        assert_eq!(*payload, *again);

        fs.recover();
        assert_eq!(b"old".to_vec(), fs.read_file(Path::new("a")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_failpoint_path_filter_scopes_trigger() {
        let fs = crash_fs(CrashConfig {
            failpoint: Some(FailpointConfig {
                after: 1,
                paths: vec!["target".to_owned()],
                ..FailpointConfig::default()
            }),
            writeback: None,
        });
        // operations elsewhere never trip it
        fs.write_file(Path::new("other"), b"x", 0o644).unwrap();
        assert!(fs.exists(Path::new("other")).unwrap());
        let payload = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = fs.write_file(Path::new("target"), b"y", 0o644);
        }))
        .unwrap_err()
        .downcast::<CrashPanicValue>()
        .unwrap();
        assert_eq!(CrashOp::WriteFile, payload.op);
        assert_eq!(1, payload.seq);
        fs.recover();
        // the trigger rotated before anything was durable
        assert!(!fs.exists(Path::new("other")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_failpoint_rename_matches_destination() {
        let fs = crash_fs(CrashConfig {
            failpoint: Some(FailpointConfig {
                after: 1,
                ops: vec![CrashOp::Rename],
                paths: vec!["dst".to_owned()],
                ..FailpointConfig::default()
            }),
            writeback: None,
        });
        fs.write_file(Path::new("src"), b"x", 0o644).unwrap();
        let payload = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = fs.rename(Path::new("src"), Path::new("dst"));
        }))
        .unwrap_err()
        .downcast::<CrashPanicValue>()
        .unwrap();
        assert_eq!(CrashOp::Rename, payload.op);
        assert_eq!("src", payload.rel);
        assert_eq!("dst", payload.new_rel);
        fs.recover();
        cleanup(&fs);
    }

    #[test]
    fn test_writeback_prefix_outcome() {
        let fs = crash_fs(CrashConfig {
            failpoint: None,
            writeback: Some(WritebackConfig {
                seed: 1234,
                file_weights: FileWeights {
                    keep_prefix: 1.0,
                    ..FileWeights::default()
                },
                dir_entry_weights: DirEntryWeights {
                    keep_new: 1.0,
                    ..DirEntryWeights::default()
                },
            }),
        });
        let old = b"old-contents-000";
        let new = b"new-contents-111";
        fs.write_file(Path::new("d"), old, 0o644).unwrap();
        sync_path(&fs, "d");
        sync_path(&fs, ".");
        fs.write_file(Path::new("d"), new, 0o644).unwrap();
        fs.simulate_crash().unwrap();
        let merged = fs.read_file(Path::new("d")).unwrap();
        assert_eq!(old.len(), merged.len());
        let split = (0..=old.len())
            .find(|&k| merged[..k] == new[..k] && merged[k..] == old[k..])
            .expect("mixed contents must be new-prefix + old-suffix");
        assert!(split <= old.len());
        cleanup(&fs);
    }

    #[test]
    fn test_writeback_keep_new_retains_unsynced_file() {
        let fs = crash_fs(CrashConfig {
            failpoint: None,
            writeback: Some(WritebackConfig {
                seed: 5,
                file_weights: FileWeights {
                    keep_new: 1.0,
                    ..FileWeights::default()
                },
                dir_entry_weights: DirEntryWeights {
                    keep_new: 1.0,
                    ..DirEntryWeights::default()
                },
            }),
        });
        fs.write_file(Path::new("never-synced"), b"kept anyway", 0o644)
            .unwrap();
        fs.simulate_crash().unwrap();
        assert_eq!(
            b"kept anyway".to_vec(),
            fs.read_file(Path::new("never-synced")).unwrap()
        );
        cleanup(&fs);
    }

    #[test]
    fn test_writeback_zero_weights_is_strict_rotation() {
        let fs = crash_fs(CrashConfig {
            failpoint: None,
            writeback: Some(WritebackConfig::default()),
        });
        fs.write_file(Path::new("f"), b"x", 0o644).unwrap();
        fs.simulate_crash().unwrap();
        assert!(!fs.exists(Path::new("f")).unwrap());
        cleanup(&fs);
    }

    #[test]
    fn test_writeback_refuses_symlinks() {
        let fs = crash_fs(CrashConfig {
            failpoint: None,
            writeback: Some(WritebackConfig {
                seed: 1,
                file_weights: FileWeights {
                    keep_new: 1.0,
                    ..FileWeights::default()
                },
                dir_entry_weights: DirEntryWeights::default(),
            }),
        });
        fs.write_file(Path::new("f"), b"x", 0o644).unwrap();
        std::os::unix::fs::symlink("f", fs.workdir().join("link")).unwrap();
        let err = fs.simulate_crash().unwrap_err();
        assert!(err.is_crash_internal());
        assert!(err.to_string().contains("symbolic link"));
        cleanup(&fs);
    }

    #[test]
    fn test_invalid_failpoint_config_fails_construction() {
        let result = CrashFs::new(
            &SystemTempDir::new(),
            Arc::new(RealFs::new()),
            CrashConfig {
                failpoint: Some(FailpointConfig {
                    rate: 2.0,
                    ..FailpointConfig::default()
                }),
                writeback: None,
            },
        );
        assert!(matches!(
            result.map(|_| ()),
            Err(CrashSetupError::Failpoint(FailpointError::InvalidRate(_)))
        ));
    }

    #[test]
    fn test_exit_action_without_code_fails_construction() {
        let result = CrashFs::new(
            &SystemTempDir::new(),
            Arc::new(RealFs::new()),
            CrashConfig {
                failpoint: Some(FailpointConfig {
                    after: 1,
                    action: CrashAction::Exit,
                    ..FailpointConfig::default()
                }),
                writeback: None,
            },
        );
        assert!(matches!(
            result.map(|_| ()),
            Err(CrashSetupError::Failpoint(FailpointError::MissingExitCode))
        ));
    }

    #[test]
    fn test_open_missing_file_passes_through_enoent() {
        let fs = crash_fs(CrashConfig::default());
        let err = match fs.open(Path::new("missing")) {
            Ok(_) => panic!("expected open to fail"),
            Err(e) => e,
        };
        assert!(err.is_not_exist());
        assert!(!err.is_injected());
        cleanup(&fs);
    }

    #[test]
    fn test_handle_close_twice() {
        let fs = crash_fs(CrashConfig::default());
        fs.write_file(Path::new("f"), b"x", 0o644).unwrap();
        let handle = fs.open(Path::new("f")).unwrap();
        handle.close().unwrap();
        assert!(handle.close().is_err());
        cleanup(&fs);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config: CrashConfig = toml::from_str(
            r#"
            [failpoint]
            after = 2
            ops = ["file_write", "rename"]
            paths = ["a/b"]
            action = "PANIC"

            [writeback]
            seed = 9
            file_weights = { keep_old = 1.0, keep_prefix = 0.5 }
            dir_entry_weights = { keep_new = 1.0 }
            "#,
        )
        .unwrap();
        let failpoint = config.failpoint.unwrap();
        assert_eq!(2, failpoint.after);
        assert_eq!(vec![CrashOp::FileWrite, CrashOp::Rename], failpoint.ops);
        assert_eq!(CrashAction::Panic, failpoint.action);
        let writeback = config.writeback.unwrap();
        assert_eq!(9, writeback.seed);
        assert_eq!(1.0, writeback.file_weights.keep_old);
        assert_eq!(1.0, writeback.dir_entry_weights.keep_new);
    }
}
