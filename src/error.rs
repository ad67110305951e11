/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::{io, path::PathBuf};

use thiserror::Error;

pub type FsResult<T> = std::result::Result<T, FsError>;

/// Error of a single-path operation (`open`, `read`, `mkdirall`, ...).
///
/// The `source` keeps the OS errno when the underlying cause was an OS
/// error, so callers can classify without caring which wrapper produced
/// the failure.
#[derive(Debug, Error)]
#[error("{op} {}: {source}", path.display())]
pub struct PathError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Error of a two-path operation, in practice only `rename`.
#[derive(Debug, Error)]
#[error("{op} {} -> {}: {source}", from.display(), to.display())]
pub struct LinkError {
    pub op: &'static str,
    pub from: PathBuf,
    pub to: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Marker for faults produced by the chaos layer. Classification
    /// predicates see through it.
    #[error("injected: {0}")]
    Injected(#[source] Box<FsError>),
    /// Failure inside the crash simulator itself (rotate, restore,
    /// writeback). Always a scaffolding bug or an unusable environment,
    /// never a fault of the system under test.
    #[error("crash fs {op}: {source}")]
    Crash {
        op: &'static str,
        #[source]
        source: Box<FsError>,
    },
}

impl FsError {
    pub fn path(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        FsError::Path(PathError {
            op,
            path: path.into(),
            source,
        })
    }

    pub fn link(
        op: &'static str,
        from: impl Into<PathBuf>,
        to: impl Into<PathBuf>,
        source: io::Error,
    ) -> Self {
        FsError::Link(LinkError {
            op,
            from: from.into(),
            to: to.into(),
            source,
        })
    }

    /// Wraps `self` with the injected-fault marker.
    pub fn injected(self) -> Self {
        FsError::Injected(Box::new(self))
    }

    /// Wraps `self` as an internal crash-simulator error tagged with a
    /// short op name.
    pub fn crash(self, op: &'static str) -> Self {
        FsError::Crash {
            op,
            source: Box::new(self),
        }
    }

    /// Internal crash-simulator error with a free-form cause and no errno.
    pub fn crash_msg(op: &'static str, path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        FsError::path(op, path, io::Error::other(msg.into())).crash(op)
    }

    /// The operation name of the innermost path/link error.
    pub fn op(&self) -> &'static str {
        match self {
            FsError::Path(err) => err.op,
            FsError::Link(err) => err.op,
            FsError::Injected(inner) => inner.op(),
            FsError::Crash { source, .. } => source.op(),
        }
    }

    /// The innermost `io::Error`, through any number of wrappers.
    pub fn io_source(&self) -> &io::Error {
        match self {
            FsError::Path(err) => &err.source,
            FsError::Link(err) => &err.source,
            FsError::Injected(inner) => inner.io_source(),
            FsError::Crash { source, .. } => source.io_source(),
        }
    }

    /// OS errno of the innermost cause, if it was an OS error.
    pub fn errno(&self) -> Option<i32> {
        self.io_source().raw_os_error()
    }

    pub fn matches_errno(&self, errnos: &[i32]) -> bool {
        match self.errno() {
            Some(code) => errnos.contains(&code),
            None => false,
        }
    }

    pub fn is_not_exist(&self) -> bool {
        self.io_source().kind() == io::ErrorKind::NotFound
    }

    pub fn is_permission(&self) -> bool {
        self.io_source().kind() == io::ErrorKind::PermissionDenied
            || self.matches_errno(&[libc::EACCES, libc::EPERM])
    }

    /// True when the error (at any wrapping depth) was produced by the
    /// chaos layer.
    pub fn is_injected(&self) -> bool {
        match self {
            FsError::Injected(_) => true,
            FsError::Crash { source, .. } => source.is_injected(),
            _ => false,
        }
    }

    /// True for internal crash-simulator failures.
    pub fn is_crash_internal(&self) -> bool {
        matches!(self, FsError::Crash { .. })
    }
}

/// Builds an errno-carrying `io::Error`, the payload of every injected
/// fault. `ENOENT` and `EINTR` are deliberately never used here.
pub fn errno_error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

/// Symbolic name for the errnos this crate works with.
pub fn errno_name(errno: i32) -> String {
    let name = match errno {
        libc::EACCES => "EACCES",
        libc::EPERM => "EPERM",
        libc::EBUSY => "EBUSY",
        libc::EIO => "EIO",
        libc::EROFS => "EROFS",
        libc::ENOSPC => "ENOSPC",
        libc::EDQUOT => "EDQUOT",
        libc::EMFILE => "EMFILE",
        libc::ENFILE => "ENFILE",
        libc::ENOTDIR => "ENOTDIR",
        libc::EXDEV => "EXDEV",
        libc::ENOENT => "ENOENT",
        libc::EISDIR => "EISDIR",
        other => return format!("errno({})", other),
    };
    name.to_owned()
}
