/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::{
    env, fs, io,
    path::PathBuf,
    process,
    sync::atomic::{AtomicU64, Ordering},
};

/// Prefix for temporary directories to use
const TMP_DIR_PREFIX: &str = "faultfs";

static NEXT_TMP_ID: AtomicU64 = AtomicU64::new(0);

/// Collaborator that yields writable, caller-owned directories. The crash
/// simulator takes one at construction and assumes exclusive ownership of
/// the directory it is given.
pub trait TempDirProvider: Send + Sync {
    fn create_temp_dir(&self, name: &str) -> io::Result<PathBuf>;
}

/// Creates uniquely-named directories under the system temp dir.
pub struct SystemTempDir;

impl SystemTempDir {
    pub fn new() -> Self {
        SystemTempDir
    }
}

impl Default for SystemTempDir {
    fn default() -> Self {
        SystemTempDir::new()
    }
}

impl TempDirProvider for SystemTempDir {
    fn create_temp_dir(&self, name: &str) -> io::Result<PathBuf> {
        let id = NEXT_TMP_ID.fetch_add(1, Ordering::Relaxed);
        let dir = env::temp_dir().join(format!(
            "{}-{}-{}-{}",
            TMP_DIR_PREFIX,
            name,
            process::id(),
            id
        ));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_dirs_are_unique_and_writable() {
        let provider = SystemTempDir::new();
        let first = provider.create_temp_dir("unique").unwrap();
        let second = provider.create_temp_dir("unique").unwrap();
        assert_ne!(first, second);
        fs::write(first.join("probe"), b"ok").unwrap();
        fs::remove_dir_all(&first).unwrap();
        fs::remove_dir_all(&second).unwrap();
    }
}
