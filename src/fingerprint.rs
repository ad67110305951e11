/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::{fs, hash::Hasher, os::unix::fs::PermissionsExt, path::Path};

use anyhow::Context;
use regex::RegexSet;
use twox_hash::XxHash64;
use walkdir::WalkDir;

/// One entry of a fingerprinted tree, relative to the walked root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub rel_path: String,
    pub is_dir: bool,
    pub mode: u32,
    pub size: u64,
}

/// Hashes a directory tree: entry names in sorted walk order, kinds,
/// permission bits and full file contents. Two trees fingerprint equal
/// iff a reader could not tell them apart. Entries matching `skip` are
/// left out.
pub fn tree_fingerprint(path: &Path, skip: &RegexSet) -> anyhow::Result<(u64, Vec<EntryInfo>)> {
    let mut hasher = XxHash64::default();
    let mut entries: Vec<EntryInfo> = Vec::new();

    for entry in WalkDir::new(path).sort_by(|a, b| a.file_name().cmp(b.file_name())) {
        let entry = entry.with_context(|| "failed to get directory entry")?;
        let rel_path = entry
            .path()
            .strip_prefix(path)
            .unwrap()
            .to_string_lossy()
            .into_owned();
        if rel_path.is_empty() || skip.is_match(&rel_path) {
            continue;
        }

        let metadata = entry
            .metadata()
            .with_context(|| "failed to get entry metadata")?;
        let info = EntryInfo {
            rel_path,
            is_dir: metadata.is_dir(),
            mode: metadata.permissions().mode() & 0o7777,
            size: metadata.len(),
        };
        hasher.write(info.rel_path.as_bytes());
        hasher.write_u8(info.is_dir as u8);
        hasher.write_u32(info.mode);
        hasher.write_u64(info.size);
        if !info.is_dir {
            let contents = fs::read(entry.path())
                .with_context(|| format!("failed to read '{}'", entry.path().display()))?;
            hasher.write(&contents);
        }
        entries.push(info);
    }

    Ok((hasher.finish(), entries))
}
