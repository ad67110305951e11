/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
};

use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    crash::snapshot::{FileSnapshot, ObjId, ObjKind, Snapshot, ROOT_ID},
    error::FsResult,
};

/// Weighted retention of unsynced file contents at crash time.
/// All weights must be nonnegative; an all-zero set collapses to
/// strict keep-old.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileWeights {
    pub keep_old: f64,
    pub keep_new: f64,
    pub keep_prefix: f64,
}

/// Weighted retention of unsynced directory entries at crash time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirEntryWeights {
    pub keep_old: f64,
    pub keep_new: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WritebackConfig {
    pub seed: i64,
    pub file_weights: FileWeights,
    pub dir_entry_weights: DirEntryWeights,
}

#[derive(Debug, Error, PartialEq)]
pub enum WritebackError {
    #[error("negative writeback weight {0}")]
    NegativeWeight(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    KeepOld,
    KeepNew,
    KeepPrefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirOutcome {
    KeepOld,
    KeepNew,
}

/// The merged durable state writeback commits before rotating.
pub(crate) struct MergedState {
    pub durable_children: HashMap<ObjId, BTreeMap<String, ObjId>>,
    pub durable_files: HashMap<ObjId, FileSnapshot>,
}

/// Deterministic weighted merge of the durable and live views.
///
/// One PCG stream is consumed across the engine's lifetime, so a fixed
/// seed and operation sequence (including repeated crashes) produce one
/// reproducible outcome sequence. Every iteration that consumes
/// randomness runs in sorted-name order.
pub(crate) struct WritebackEngine {
    rng: Pcg32,
    file_menu: Vec<(FileOutcome, f64)>,
    dir_menu: Vec<(DirOutcome, f64)>,
}

fn check_weight(weight: f64) -> Result<(), WritebackError> {
    if weight < 0.0 || weight.is_nan() {
        return Err(WritebackError::NegativeWeight(weight));
    }
    Ok(())
}

impl WritebackEngine {
    pub fn new(config: &WritebackConfig) -> Result<Self, WritebackError> {
        let files = config.file_weights;
        let dirs = config.dir_entry_weights;
        for weight in [
            files.keep_old,
            files.keep_new,
            files.keep_prefix,
            dirs.keep_old,
            dirs.keep_new,
        ] {
            check_weight(weight)?;
        }
        let file_menu: Vec<(FileOutcome, f64)> = [
            (FileOutcome::KeepOld, files.keep_old),
            (FileOutcome::KeepNew, files.keep_new),
            (FileOutcome::KeepPrefix, files.keep_prefix),
        ]
        .into_iter()
        .filter(|(_, weight)| *weight > 0.0)
        .collect();
        let dir_menu: Vec<(DirOutcome, f64)> = [
            (DirOutcome::KeepOld, dirs.keep_old),
            (DirOutcome::KeepNew, dirs.keep_new),
        ]
        .into_iter()
        .filter(|(_, weight)| *weight > 0.0)
        .collect();
        Ok(WritebackEngine {
            rng: Pcg32::seed_from_u64(config.seed as u64),
            file_menu,
            dir_menu,
        })
    }

    /// Both menus collapsed to keep-old means writeback changes nothing;
    /// the caller falls back to strict rotation.
    pub fn enabled(&self) -> bool {
        !(self.file_menu.is_empty() && self.dir_menu.is_empty())
    }

    fn roll_dir(&mut self) -> DirOutcome {
        if self.dir_menu.is_empty() {
            return DirOutcome::KeepOld;
        }
        self.dir_menu
            .choose_weighted(&mut self.rng, |item| item.1)
            .unwrap()
            .0
    }

    fn roll_file(&mut self) -> FileOutcome {
        if self.file_menu.is_empty() {
            return FileOutcome::KeepOld;
        }
        self.file_menu
            .choose_weighted(&mut self.rng, |item| item.1)
            .unwrap()
            .0
    }

    /// Builds the new durable snapshot. `read_live` yields the on-disk
    /// bytes and mode of a live relative path.
    pub fn merge(
        &mut self,
        snapshot: &Snapshot,
        read_live: &mut dyn FnMut(&Path) -> FsResult<(Vec<u8>, u32)>,
    ) -> FsResult<MergedState> {
        let live_reachable = live_reachable_dirs(snapshot);
        let mut out_children = HashMap::new();
        let mut files_in_order = Vec::new();
        let mut visited = HashSet::new();
        self.build_dir(
            snapshot,
            &live_reachable,
            ROOT_ID,
            &mut out_children,
            &mut files_in_order,
            &mut visited,
        );

        let mut out_files = HashMap::new();
        let mut seen = HashSet::new();
        for id in files_in_order {
            if !seen.insert(id) {
                continue;
            }
            let old = snapshot.durable_files.get(&id);
            match snapshot.find_live_path(id) {
                None => {
                    // nothing live to merge against, durable bytes stand
                    if let Some(old) = old {
                        out_files.insert(id, old.clone());
                    }
                }
                Some(rel) => {
                    let (live_bytes, live_mode) = read_live(&rel)?;
                    let old_bytes: &[u8] = old.map(|s| s.bytes.as_slice()).unwrap_or(&[]);
                    if live_bytes == old_bytes {
                        if let Some(old) = old {
                            out_files.insert(id, old.clone());
                        }
                        continue;
                    }
                    match self.roll_file() {
                        FileOutcome::KeepOld => {
                            if let Some(old) = old {
                                out_files.insert(id, old.clone());
                            }
                        }
                        FileOutcome::KeepNew => {
                            out_files.insert(
                                id,
                                FileSnapshot {
                                    bytes: live_bytes,
                                    mode: live_mode,
                                },
                            );
                        }
                        FileOutcome::KeepPrefix => {
                            let max = old_bytes.len().min(live_bytes.len());
                            let split = self.rng.gen_range(0..=max);
                            let mut mixed = Vec::with_capacity(old_bytes.len());
                            mixed.extend_from_slice(&live_bytes[..split]);
                            mixed.extend_from_slice(&old_bytes[split..]);
                            out_files.insert(
                                id,
                                FileSnapshot {
                                    bytes: mixed,
                                    mode: old.map(|s| s.mode).unwrap_or(live_mode),
                                },
                            );
                        }
                    }
                }
            }
        }

        Ok(MergedState {
            durable_children: out_children,
            durable_files: out_files,
        })
    }

    fn build_dir(
        &mut self,
        snapshot: &Snapshot,
        live_reachable: &HashSet<ObjId>,
        id: ObjId,
        out_children: &mut HashMap<ObjId, BTreeMap<String, ObjId>>,
        files: &mut Vec<ObjId>,
        visited: &mut HashSet<ObjId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        let old = snapshot.durable_children.get(&id);
        // stale live maps of removed directories do not count
        let live = if live_reachable.contains(&id) {
            snapshot.live_children.get(&id)
        } else {
            None
        };
        let merged = match (old, live) {
            (Some(old), Some(live)) => self.merge_entries(old, live),
            (Some(old), None) => old.clone(),
            (None, Some(live)) => live.clone(),
            (None, None) => BTreeMap::new(),
        };
        let mut kept = BTreeMap::new();
        for (name, child) in merged {
            match snapshot.kind(child) {
                Some(ObjKind::Dir) => {
                    // an id already claimed by another name stays there
                    if visited.contains(&child) {
                        continue;
                    }
                    self.build_dir(snapshot, live_reachable, child, out_children, files, visited);
                    kept.insert(name, child);
                }
                Some(ObjKind::File) => {
                    files.push(child);
                    kept.insert(name, child);
                }
                None => {}
            }
        }
        out_children.insert(id, kept);
    }

    /// The per-directory merge of durable and live entry maps.
    fn merge_entries(
        &mut self,
        old: &BTreeMap<String, ObjId>,
        live: &BTreeMap<String, ObjId>,
    ) -> BTreeMap<String, ObjId> {
        let mut result = BTreeMap::new();
        let mut replace_names = Vec::new();
        let mut old_only = BTreeMap::new();
        let mut new_only = BTreeMap::new();

        for (name, old_id) in old {
            match live.get(name) {
                Some(new_id) if new_id == old_id => {
                    result.insert(name.clone(), *old_id);
                }
                Some(_) => replace_names.push(name.clone()),
                None => {
                    old_only.insert(name.clone(), *old_id);
                }
            }
        }
        for (name, new_id) in live {
            if !old.contains_key(name) {
                new_only.insert(name.clone(), *new_id);
            }
        }

        // a name bound to a different id on each side: one of them wins
        for name in &replace_names {
            let chosen = match self.roll_dir() {
                DirOutcome::KeepOld => old[name],
                DirOutcome::KeepNew => live[name],
            };
            result.insert(name.clone(), chosen);
        }

        // renames: an id under exactly one old-only and one new-only
        // name; ambiguous ids fall through to the plain keep/drop rolls
        let mut old_by_id: HashMap<ObjId, Vec<String>> = HashMap::new();
        for (name, id) in &old_only {
            old_by_id.entry(*id).or_default().push(name.clone());
        }
        let mut new_by_id: HashMap<ObjId, Vec<String>> = HashMap::new();
        for (name, id) in &new_only {
            new_by_id.entry(*id).or_default().push(name.clone());
        }
        let mut rename_pairs: Vec<(String, String, ObjId)> = old_by_id
            .iter()
            .filter_map(|(id, old_names)| {
                let new_names = new_by_id.get(id)?;
                if old_names.len() == 1 && new_names.len() == 1 {
                    Some((old_names[0].clone(), new_names[0].clone(), *id))
                } else {
                    None
                }
            })
            .collect();
        rename_pairs.sort();
        for (old_name, new_name, id) in rename_pairs {
            old_only.remove(&old_name);
            new_only.remove(&new_name);
            let name = match self.roll_dir() {
                DirOutcome::KeepOld => old_name,
                DirOutcome::KeepNew => new_name,
            };
            result.insert(name, id);
        }

        // removals that did not become durable: keep-old resurrects them
        for (name, id) in old_only {
            if self.roll_dir() == DirOutcome::KeepOld {
                result.insert(name, id);
            }
        }
        // additions that did not become durable: keep-new retains them
        for (name, id) in new_only {
            if self.roll_dir() == DirOutcome::KeepNew {
                result.insert(name, id);
            }
        }

        result
    }
}

fn live_reachable_dirs(snapshot: &Snapshot) -> HashSet<ObjId> {
    let mut reachable = HashSet::new();
    let mut stack = vec![ROOT_ID];
    while let Some(dir) = stack.pop() {
        if !reachable.insert(dir) {
            continue;
        }
        if let Some(children) = snapshot.live_children.get(&dir) {
            for child in children.values() {
                if snapshot.kind(*child) == Some(ObjKind::Dir) {
                    stack.push(*child);
                }
            }
        }
    }
    reachable
}
