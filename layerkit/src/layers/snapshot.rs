//! Root filesystem snapshots and diffs.
//!
//! A snapshot records every path below a root with its kind, normalized
//! mode and content digest. Diffing two snapshots of the same root taken
//! before and after a command yields exactly the entries the command
//! changed, which become that step's layer.

use super::archive::{LayerWriter, normalize_mode};
use super::digest::Digest;
use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File { digest: Digest, size: u64 },
    Symlink(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

impl Change {
    pub fn path(&self) -> &Path {
        match self {
            Change::Added(p) | Change::Modified(p) | Change::Removed(p) => p,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    nodes: BTreeMap<PathBuf, Node>,
}

impl Snapshot {
    /// Walk `root` and record every entry below it (the root itself excluded).
    pub fn capture(root: &Path) -> LayerkitResult<Self> {
        let mut nodes = BTreeMap::new();
        for entry in WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                LayerkitError::Storage(format!("Failed to walk {}: {}", root.display(), e))
            })?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| LayerkitError::Internal(e.to_string()))?
                .to_path_buf();
            let file_type = entry.file_type();
            let metadata = entry.path().symlink_metadata()?;

            let node = if file_type.is_dir() {
                Node {
                    kind: NodeKind::Dir,
                    mode: 0o755,
                }
            } else if file_type.is_symlink() {
                Node {
                    kind: NodeKind::Symlink(std::fs::read_link(entry.path())?),
                    mode: 0o777,
                }
            } else if file_type.is_file() {
                Node {
                    kind: NodeKind::File {
                        digest: Digest::of_file(entry.path())?,
                        size: metadata.len(),
                    },
                    mode: normalize_mode(metadata.permissions().mode()),
                }
            } else {
                continue;
            };
            nodes.insert(rel, node);
        }
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, rel: &Path) -> Option<&Node> {
        self.nodes.get(rel)
    }

    /// Aggregate digest over paths, kinds, modes and contents.
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        for (path, node) in &self.nodes {
            let path = path.to_string_lossy();
            hasher.update((path.len() as u64).to_le_bytes());
            hasher.update(path.as_bytes());
            hasher.update(node.mode.to_le_bytes());
            match &node.kind {
                NodeKind::Dir => hasher.update(b"d"),
                NodeKind::File { digest, .. } => {
                    hasher.update(b"f");
                    hasher.update(digest.as_str().as_bytes());
                }
                NodeKind::Symlink(target) => {
                    hasher.update(b"l");
                    hasher.update(target.to_string_lossy().as_bytes());
                }
            }
        }
        Digest::from_hasher(hasher)
    }

    /// Changes that turn `self` into `after`, in path order.
    ///
    /// Children of a removed directory are folded into the directory's
    /// own removal.
    pub fn diff(&self, after: &Snapshot) -> Vec<Change> {
        let mut changes = Vec::new();
        let mut removed_dir: Option<&Path> = None;

        let mut keys: Vec<&PathBuf> = self.nodes.keys().chain(after.nodes.keys()).collect();
        keys.sort();
        keys.dedup();

        for path in keys {
            match (self.nodes.get(path), after.nodes.get(path)) {
                (None, Some(_)) => changes.push(Change::Added(path.clone())),
                (Some(before), Some(now)) => {
                    let kind_changed = std::mem::discriminant(&before.kind)
                        != std::mem::discriminant(&now.kind);
                    if kind_changed && matches!(before.kind, NodeKind::Dir) {
                        // Directory replaced by a file: hide the old subtree.
                        changes.push(Change::Removed(path.clone()));
                        changes.push(Change::Added(path.clone()));
                        removed_dir = Some(path.as_path());
                    } else if before != now {
                        changes.push(Change::Modified(path.clone()));
                    }
                }
                (Some(_), None) => {
                    if removed_dir.is_some_and(|dir| path.starts_with(dir)) {
                        continue;
                    }
                    if matches!(self.nodes[path].kind, NodeKind::Dir) {
                        removed_dir = Some(path.as_path());
                    }
                    changes.push(Change::Removed(path.clone()));
                }
                (None, None) => {}
            }
        }
        changes
    }

    /// Write `changes` into `writer`, reading added and modified content
    /// from `root` (the tree `self` was captured from).
    pub fn write_changes(
        &self,
        root: &Path,
        changes: &[Change],
        writer: &mut LayerWriter,
    ) -> LayerkitResult<()> {
        for change in changes {
            match change {
                Change::Removed(path) => writer.add_whiteout(path)?,
                Change::Added(path) | Change::Modified(path) => {
                    let node = self.nodes.get(path).ok_or_else(|| {
                        LayerkitError::Internal(format!("change for unknown path {:?}", path))
                    })?;
                    match &node.kind {
                        NodeKind::Dir => writer.add_dir(path)?,
                        NodeKind::File { .. } => writer.add_file(path, &root.join(path))?,
                        NodeKind::Symlink(target) => writer.add_symlink(path, target)?,
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(root: &Path) {
        std::fs::create_dir_all(root.join("app/old")).unwrap();
        std::fs::write(root.join("app/old/a.txt"), "a").unwrap();
        std::fs::write(root.join("app/keep.txt"), "keep").unwrap();
        std::fs::write(root.join("app/edit.txt"), "v1").unwrap();
    }

    #[test]
    fn test_diff_detects_add_modify_remove() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let before = Snapshot::capture(dir.path()).unwrap();

        std::fs::remove_dir_all(dir.path().join("app/old")).unwrap();
        std::fs::write(dir.path().join("app/edit.txt"), "v2").unwrap();
        std::fs::write(dir.path().join("app/new.txt"), "new").unwrap();
        let after = Snapshot::capture(dir.path()).unwrap();

        let changes = before.diff(&after);
        assert_eq!(
            changes,
            vec![
                Change::Modified(PathBuf::from("app/edit.txt")),
                Change::Added(PathBuf::from("app/new.txt")),
                Change::Removed(PathBuf::from("app/old")),
            ]
        );
    }

    #[test]
    fn test_unchanged_tree_has_no_changes() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let before = Snapshot::capture(dir.path()).unwrap();
        let after = Snapshot::capture(dir.path()).unwrap();
        assert!(before.diff(&after).is_empty());
        assert_eq!(before.digest(), after.digest());
    }

    #[test]
    fn test_digest_tracks_content() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let first = Snapshot::capture(dir.path()).unwrap().digest();
        std::fs::write(dir.path().join("app/keep.txt"), "changed").unwrap();
        let second = Snapshot::capture(dir.path()).unwrap().digest();
        assert_ne!(first, second);
    }

    #[test]
    fn test_write_changes_round_trips_through_extract() {
        let tmp = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let before = Snapshot::capture(dir.path()).unwrap();
        std::fs::write(dir.path().join("app/new.txt"), "new").unwrap();
        std::fs::remove_file(dir.path().join("app/keep.txt")).unwrap();
        let after = Snapshot::capture(dir.path()).unwrap();

        let changes = before.diff(&after);
        let mut writer = LayerWriter::create(tmp.path()).unwrap();
        after.write_changes(dir.path(), &changes, &mut writer).unwrap();
        let layer = writer.finish().unwrap();

        let target = TempDir::new().unwrap();
        seed(target.path());
        super::super::archive::extract_layer(layer.file.path(), target.path()).unwrap();
        assert!(!target.path().join("app/keep.txt").exists());
        assert_eq!(
            std::fs::read_to_string(target.path().join("app/new.txt")).unwrap(),
            "new"
        );
    }
}
