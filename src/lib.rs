/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Testing-only filesystem substrate.
//!
//! Three swappable implementations of one capability surface:
//! [`RealFs`] delegates to the OS, [`ChaosFs`] injects errno-carrying
//! faults and partial reads/writes, and [`CrashFs`] simulates crashes
//! against a strict Unix durability model (file contents survive only
//! after a file sync, directory entries only after a sync on the parent
//! directory handle). Stack them as needed:
//! `ChaosFs::new(Arc::new(crash_fs.clone()), ..)` puts fault injection
//! in front of crash simulation.
//!
//! None of this is meant for production use.

pub mod chaos;
pub mod crash;
pub mod error;
pub mod fingerprint;
pub mod fs;
pub mod temp_dir;
pub mod writer;


pub use chaos::{is_chaos_err, ChaosConfig, ChaosFs, ChaosMode, ChaosStats};
pub use crash::{
    failpoint::FailpointConfig,
    writeback::{DirEntryWeights, FileWeights, WritebackConfig},
    CrashAction, CrashConfig, CrashFs, CrashOp, CrashPanicValue, CrashSetupError,
};
pub use error::{FsError, FsResult, LinkError, PathError};
pub use fs::{real::RealFs, DirEntry, File, FileInfo, FileSystem, OpenFlag};
pub use temp_dir::{SystemTempDir, TempDirProvider};
pub use writer::AtomicWriter;
