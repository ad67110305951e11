/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Component, Path, PathBuf},
};

use log::debug;

/// Identity of a filesystem object within one crash-simulator instance.
/// Ids are allocated monotonically and never reused; a restore remaps the
/// whole tree onto fresh ids so pre- and post-crash objects can never be
/// confused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ObjId(pub u64);

pub(crate) const ROOT_ID: ObjId = ObjId(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjKind {
    File,
    Dir,
}

/// File contents and mode captured by the last successful file sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileSnapshot {
    pub bytes: Vec<u8>,
    pub mode: u32,
}

/// The durable and live views of the tree.
///
/// `durable_*` is what survives a simulated crash; `live_*` mirrors the
/// on-disk working directory (byte contents live only on disk and are
/// read back during file sync). Children maps are ordered so every walk
/// is deterministic.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    next_id: u64,
    pub kinds: HashMap<ObjId, ObjKind>,
    pub durable_children: HashMap<ObjId, BTreeMap<String, ObjId>>,
    pub durable_files: HashMap<ObjId, FileSnapshot>,
    pub live_children: HashMap<ObjId, BTreeMap<String, ObjId>>,
}

fn name_of(component: Component<'_>) -> Option<String> {
    match component {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    }
}

fn components(rel: &Path) -> Option<Vec<String>> {
    rel.components().map(name_of).collect()
}

impl Snapshot {
    pub fn new() -> Self {
        let mut kinds = HashMap::new();
        kinds.insert(ROOT_ID, ObjKind::Dir);
        let mut durable_children = HashMap::new();
        durable_children.insert(ROOT_ID, BTreeMap::new());
        let mut live_children = HashMap::new();
        live_children.insert(ROOT_ID, BTreeMap::new());
        Snapshot {
            next_id: ROOT_ID.0 + 1,
            kinds,
            durable_children,
            durable_files: HashMap::new(),
            live_children,
        }
    }

    fn alloc(&mut self, kind: ObjKind) -> ObjId {
        let id = ObjId(self.next_id);
        self.next_id += 1;
        self.kinds.insert(id, kind);
        if kind == ObjKind::Dir {
            self.live_children.insert(id, BTreeMap::new());
        }
        id
    }

    pub fn kind(&self, id: ObjId) -> Option<ObjKind> {
        self.kinds.get(&id).copied()
    }

    /// Resolves a root-relative path through the live tree.
    pub fn live_lookup(&self, rel: &Path) -> Option<(ObjId, ObjKind)> {
        let names = components(rel)?;
        let mut current = ROOT_ID;
        for name in &names {
            let children = self.live_children.get(&current)?;
            current = *children.get(name)?;
        }
        self.kind(current).map(|kind| (current, kind))
    }

    pub fn live_dir_id(&self, rel: &Path) -> Option<ObjId> {
        match self.live_lookup(rel) {
            Some((id, ObjKind::Dir)) => Some(id),
            _ => None,
        }
    }

    /// Registers a freshly created file under its live parent.
    /// A prior entry under the same name is replaced.
    pub fn live_add_file(&mut self, rel: &Path) -> Option<ObjId> {
        let parent = self.live_dir_id(rel.parent().unwrap_or(Path::new("")))?;
        let name = name_of(rel.components().next_back()?)?;
        let id = self.alloc(ObjKind::File);
        self.live_children.get_mut(&parent)?.insert(name, id);
        Some(id)
    }

    /// Walks `rel`, creating missing directory objects along the way.
    /// Fails (None) when a component resolves to a file.
    pub fn live_ensure_dir_path(&mut self, rel: &Path) -> Option<ObjId> {
        let names = components(rel)?;
        let mut current = ROOT_ID;
        for name in &names {
            let existing = self.live_children.get(&current)?.get(name).copied();
            current = match existing {
                Some(id) => match self.kind(id)? {
                    ObjKind::Dir => id,
                    ObjKind::File => return None,
                },
                None => {
                    let id = self.alloc(ObjKind::Dir);
                    self.live_children.get_mut(&current)?.insert(name.clone(), id);
                    id
                }
            };
        }
        Some(current)
    }

    pub fn live_remove_entry(&mut self, rel: &Path) {
        let Some(parent_rel) = rel.parent() else {
            return;
        };
        let Some(parent) = self.live_dir_id(parent_rel) else {
            return;
        };
        let Some(name) = rel.components().next_back().and_then(name_of) else {
            return;
        };
        if let Some(children) = self.live_children.get_mut(&parent) {
            children.remove(&name);
        }
    }

    /// Moves the entry at `old_rel` under the destination parent,
    /// discarding whatever the destination name pointed at.
    pub fn live_rename_entry(&mut self, old_rel: &Path, new_rel: &Path) {
        let moved = match self.live_lookup(old_rel) {
            Some((id, _)) => id,
            None => return,
        };
        self.live_remove_entry(old_rel);
        let Some(parent) = self.live_dir_id(new_rel.parent().unwrap_or(Path::new(""))) else {
            return;
        };
        let Some(name) = new_rel.components().next_back().and_then(name_of) else {
            return;
        };
        if let Some(children) = self.live_children.get_mut(&parent) {
            children.insert(name, moved);
        }
    }

    /// First live path naming `id`, found by depth-first search in
    /// sorted child-name order. Deterministic for a given tree.
    pub fn find_live_path(&self, id: ObjId) -> Option<PathBuf> {
        if id == ROOT_ID {
            return Some(PathBuf::new());
        }
        self.find_live_path_from(ROOT_ID, id, &mut HashSet::new())
    }

    fn find_live_path_from(
        &self,
        dir: ObjId,
        target: ObjId,
        visited: &mut HashSet<ObjId>,
    ) -> Option<PathBuf> {
        if !visited.insert(dir) {
            return None;
        }
        let children = self.live_children.get(&dir)?;
        for (name, child) in children {
            if *child == target {
                return Some(PathBuf::from(name));
            }
            if self.kind(*child) == Some(ObjKind::Dir) {
                if let Some(rest) = self.find_live_path_from(*child, target, visited) {
                    return Some(Path::new(name).join(rest));
                }
            }
        }
        None
    }

    /// Is this directory still reachable from the root via live entries?
    pub fn dir_reachable(&self, id: ObjId) -> bool {
        if self.kind(id) != Some(ObjKind::Dir) {
            return false;
        }
        id == ROOT_ID || self.find_live_path(id).is_some()
    }

    /// Sync-on-file bookkeeping: the bytes belong to the file identity
    /// the handle was opened on, whatever its current name is.
    pub fn record_file_sync(&mut self, id: ObjId, snapshot: FileSnapshot) {
        self.durable_files.insert(id, snapshot);
    }

    /// Sync-on-directory bookkeeping: the directory's live entries become
    /// durable under every durable name that refers to this id, then
    /// entries only reachable through non-durable paths are dropped.
    pub fn record_dir_sync(&mut self, id: ObjId) {
        let entries = self
            .live_children
            .get(&id)
            .cloned()
            .unwrap_or_default();
        self.durable_children.insert(id, entries);
        self.prune_durable();
    }

    /// Drops durable map entries for ids no longer reachable from the
    /// root through durable children. File snapshots are garbage
    /// collected here once their last durable name goes away.
    fn prune_durable(&mut self) {
        let mut reachable = HashSet::new();
        let mut stack = vec![ROOT_ID];
        while let Some(dir) = stack.pop() {
            if !reachable.insert(dir) {
                continue;
            }
            if let Some(children) = self.durable_children.get(&dir) {
                for child in children.values() {
                    if self.kinds.get(child) == Some(&ObjKind::Dir) {
                        stack.push(*child);
                    } else {
                        reachable.insert(*child);
                    }
                }
            }
        }
        let dirs_before = self.durable_children.len();
        let files_before = self.durable_files.len();
        self.durable_children.retain(|id, _| reachable.contains(id));
        self.durable_files.retain(|id, _| reachable.contains(id));
        if self.durable_children.len() != dirs_before || self.durable_files.len() != files_before {
            debug!(
                "pruned durable state: {} dirs, {} file snapshots dropped",
                dirs_before - self.durable_children.len(),
                files_before - self.durable_files.len(),
            );
        }
    }

    /// Rebuilds the snapshot from its durable half, remapping every
    /// object (except the root) onto fresh ids and making the live view
    /// structurally equal to the durable one.
    pub fn restore(&mut self) {
        let mut remap: HashMap<ObjId, ObjId> = HashMap::new();
        remap.insert(ROOT_ID, ROOT_ID);
        let mut new_kinds = HashMap::new();
        new_kinds.insert(ROOT_ID, ObjKind::Dir);
        let mut new_children: HashMap<ObjId, BTreeMap<String, ObjId>> = HashMap::new();
        let mut new_files = HashMap::new();

        let mut visited = HashSet::new();
        let mut stack = vec![ROOT_ID];
        while let Some(old_dir) = stack.pop() {
            if !visited.insert(old_dir) {
                continue;
            }
            let new_dir = remap[&old_dir];
            let mut entries = BTreeMap::new();
            let children = self
                .durable_children
                .get(&old_dir)
                .cloned()
                .unwrap_or_default();
            for (name, old_child) in children {
                let kind = match self.kinds.get(&old_child) {
                    Some(kind) => *kind,
                    None => continue,
                };
                let new_child = *remap.entry(old_child).or_insert_with(|| {
                    let id = ObjId(self.next_id);
                    self.next_id += 1;
                    id
                });
                new_kinds.insert(new_child, kind);
                entries.insert(name, new_child);
                match kind {
                    ObjKind::Dir => stack.push(old_child),
                    ObjKind::File => {
                        if let Some(snapshot) = self.durable_files.get(&old_child) {
                            new_files.insert(new_child, snapshot.clone());
                        }
                    }
                }
            }
            new_children.insert(new_dir, entries);
        }

        self.kinds = new_kinds;
        self.durable_children = new_children;
        self.durable_files = new_files;
        self.live_children = self.durable_children.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(path: &str) -> PathBuf {
        PathBuf::from(path)
    }

    #[test]
    fn test_new_has_empty_root() {
        let snapshot = Snapshot::new();
        assert_eq!(Some((ROOT_ID, ObjKind::Dir)), snapshot.live_lookup(Path::new("")));
        assert!(snapshot.live_children[&ROOT_ID].is_empty());
        assert!(snapshot.durable_children[&ROOT_ID].is_empty());
    }

    #[test]
    fn test_live_add_and_lookup() {
        let mut snapshot = Snapshot::new();
        let dir = snapshot.live_ensure_dir_path(&p("a/b")).unwrap();
        let file = snapshot.live_add_file(&p("a/b/f")).unwrap();
        assert_eq!(Some((dir, ObjKind::Dir)), snapshot.live_lookup(&p("a/b")));
        assert_eq!(Some((file, ObjKind::File)), snapshot.live_lookup(&p("a/b/f")));
        assert!(snapshot.live_lookup(&p("a/missing")).is_none());
    }

    #[test]
    fn test_ensure_dir_path_is_idempotent() {
        let mut snapshot = Snapshot::new();
        let first = snapshot.live_ensure_dir_path(&p("x/y")).unwrap();
        let second = snapshot.live_ensure_dir_path(&p("x/y")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ensure_dir_path_rejects_file_component() {
        let mut snapshot = Snapshot::new();
        snapshot.live_add_file(&p("f")).unwrap();
        assert!(snapshot.live_ensure_dir_path(&p("f/sub")).is_none());
    }

    #[test]
    fn test_add_file_replaces_existing_entry() {
        let mut snapshot = Snapshot::new();
        let old = snapshot.live_add_file(&p("f")).unwrap();
        let new = snapshot.live_add_file(&p("f")).unwrap();
        assert_ne!(old, new);
        assert_eq!(Some((new, ObjKind::File)), snapshot.live_lookup(&p("f")));
    }

    #[test]
    fn test_rename_moves_identity_and_discards_target() {
        let mut snapshot = Snapshot::new();
        let moved = snapshot.live_add_file(&p("a")).unwrap();
        let displaced = snapshot.live_add_file(&p("b")).unwrap();
        snapshot.live_rename_entry(&p("a"), &p("b"));
        assert!(snapshot.live_lookup(&p("a")).is_none());
        assert_eq!(Some((moved, ObjKind::File)), snapshot.live_lookup(&p("b")));
        assert!(snapshot.find_live_path(displaced).is_none());
    }

    #[test]
    fn test_find_live_path_prefers_sorted_order() {
        let mut snapshot = Snapshot::new();
        snapshot.live_ensure_dir_path(&p("z")).unwrap();
        snapshot.live_ensure_dir_path(&p("a")).unwrap();
        let file = snapshot.live_add_file(&p("z/f")).unwrap();
        // give the same id a second name under an earlier-sorting dir
        snapshot.live_rename_entry(&p("z/f"), &p("a/g"));
        assert_eq!(Some(p("a/g")), snapshot.find_live_path(file));
    }

    #[test]
    fn test_dir_reachable() {
        let mut snapshot = Snapshot::new();
        let dir = snapshot.live_ensure_dir_path(&p("d")).unwrap();
        assert!(snapshot.dir_reachable(dir));
        assert!(snapshot.dir_reachable(ROOT_ID));
        snapshot.live_remove_entry(&p("d"));
        assert!(!snapshot.dir_reachable(dir));
        let file = snapshot.live_add_file(&p("f")).unwrap();
        assert!(!snapshot.dir_reachable(file));
    }

    #[test]
    fn test_dir_sync_copies_live_entries() {
        let mut snapshot = Snapshot::new();
        let file = snapshot.live_add_file(&p("f")).unwrap();
        snapshot.record_file_sync(
            file,
            FileSnapshot {
                bytes: b"data".to_vec(),
                mode: 0o644,
            },
        );
        snapshot.record_dir_sync(ROOT_ID);
        assert_eq!(Some(&file), snapshot.durable_children[&ROOT_ID].get("f"));
        assert_eq!(b"data".to_vec(), snapshot.durable_files[&file].bytes);
    }

    #[test]
    fn test_dir_sync_prunes_unlinked_snapshots() {
        let mut snapshot = Snapshot::new();
        let file = snapshot.live_add_file(&p("f")).unwrap();
        snapshot.record_file_sync(
            file,
            FileSnapshot {
                bytes: b"data".to_vec(),
                mode: 0o644,
            },
        );
        snapshot.record_dir_sync(ROOT_ID);
        // unlink and make the removal durable: the snapshot must go away
        snapshot.live_remove_entry(&p("f"));
        snapshot.record_dir_sync(ROOT_ID);
        assert!(!snapshot.durable_files.contains_key(&file));
    }

    #[test]
    fn test_snapshot_survives_while_another_durable_name_remains() {
        let mut snapshot = Snapshot::new();
        snapshot.live_ensure_dir_path(&p("a")).unwrap();
        let b = snapshot.live_ensure_dir_path(&p("b")).unwrap();
        let file = snapshot.live_add_file(&p("a/f")).unwrap();
        snapshot.record_file_sync(
            file,
            FileSnapshot {
                bytes: b"x".to_vec(),
                mode: 0o644,
            },
        );
        snapshot.record_dir_sync(ROOT_ID);
        let a = snapshot.live_dir_id(&p("a")).unwrap();
        snapshot.record_dir_sync(a);
        // move the file; only the destination dir records the new name
        snapshot.live_rename_entry(&p("a/f"), &p("b/f"));
        snapshot.record_dir_sync(b);
        // both durable names point at the file; removing one keeps the bytes
        assert!(snapshot.durable_files.contains_key(&file));
        snapshot.record_dir_sync(a);
        assert!(snapshot.durable_files.contains_key(&file));
        // dropping the second durable name garbage-collects the snapshot
        snapshot.live_remove_entry(&p("b/f"));
        snapshot.record_dir_sync(b);
        assert!(!snapshot.durable_files.contains_key(&file));
    }

    #[test]
    fn test_restore_remaps_ids_and_mirrors_durable() {
        let mut snapshot = Snapshot::new();
        snapshot.live_ensure_dir_path(&p("d")).unwrap();
        let file = snapshot.live_add_file(&p("d/f")).unwrap();
        snapshot.record_file_sync(
            file,
            FileSnapshot {
                bytes: b"bytes".to_vec(),
                mode: 0o600,
            },
        );
        snapshot.record_dir_sync(ROOT_ID);
        let d = snapshot.live_dir_id(&p("d")).unwrap();
        snapshot.record_dir_sync(d);

        // something unsynced that must vanish
        snapshot.live_add_file(&p("d/unsynced")).unwrap();

        snapshot.restore();

        let (new_d, kind) = snapshot.live_lookup(&p("d")).unwrap();
        assert_eq!(ObjKind::Dir, kind);
        assert_ne!(d, new_d);
        let (new_file, kind) = snapshot.live_lookup(&p("d/f")).unwrap();
        assert_eq!(ObjKind::File, kind);
        assert_ne!(file, new_file);
        assert_eq!(b"bytes".to_vec(), snapshot.durable_files[&new_file].bytes);
        assert!(snapshot.live_lookup(&p("d/unsynced")).is_none());
        assert_eq!(snapshot.durable_children, snapshot.live_children);
    }

    #[test]
    fn test_restore_twice_never_reuses_ids() {
        let mut snapshot = Snapshot::new();
        let file = snapshot.live_add_file(&p("f")).unwrap();
        snapshot.record_file_sync(
            file,
            FileSnapshot {
                bytes: vec![],
                mode: 0o644,
            },
        );
        snapshot.record_dir_sync(ROOT_ID);
        snapshot.restore();
        let (second, _) = snapshot.live_lookup(&p("f")).unwrap();
        snapshot.restore();
        let (third, _) = snapshot.live_lookup(&p("f")).unwrap();
        assert_ne!(file, second);
        assert_ne!(second, third);
        assert_ne!(file, third);
    }
}
