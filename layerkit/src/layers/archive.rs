//! Deterministic layer archives.
//!
//! Layers are gzip-compressed tarballs written with normalized metadata
//! (zero mtime, root ownership, 0755/0644 modes) so identical trees always
//! produce identical bytes. Deletions use OCI whiteouts: an empty entry
//! named `.wh.<name>` removes `<name>` from lower layers, and
//! `.wh..wh..opq` hides every lower entry of its directory.

use super::digest::{Digest, HashingWriter};
use flate2::Compression;
use flate2::GzBuilder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use layerkit_shared::errors::{LayerkitError, LayerkitResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const DIR_MODE: u32 = 0o755;
const EXEC_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Descriptor of a committed layer blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Digest of the compressed blob (its address in the blob store).
    pub digest: Digest,
    /// Digest of the uncompressed tar stream.
    pub diff_id: Digest,
    /// Size of the compressed blob in bytes.
    pub size: u64,
}

/// A finished layer still sitting in a temporary file.
#[derive(Debug)]
pub struct PendingLayer {
    pub file: NamedTempFile,
    pub descriptor: LayerDescriptor,
}

/// Kind of a tar entry as seen by layer inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    Whiteout,
    OpaqueWhiteout,
    Other,
}

/// Normalize a permission mode to 0755 (any exec bit) or 0644.
pub fn normalize_mode(mode: u32) -> u32 {
    if mode & 0o111 != 0 { EXEC_MODE } else { FILE_MODE }
}

/// Join `rel` onto `root`, refusing absolute paths and `..` components.
pub fn safe_join(root: &Path, rel: &Path) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

type TarSink = HashingWriter<GzEncoder<HashingWriter<BufWriter<File>>>>;

/// Streaming writer for one deterministic layer.
///
/// Callers add entries in sorted path order; parents are emitted
/// automatically the first time a child needs them.
pub struct LayerWriter {
    builder: tar::Builder<TarSink>,
    file: NamedTempFile,
    written: BTreeSet<PathBuf>,
}

impl LayerWriter {
    /// Start a new layer in a temporary file inside `tmp_dir`.
    pub fn create(tmp_dir: &Path) -> LayerkitResult<Self> {
        let file = NamedTempFile::new_in(tmp_dir).map_err(|e| {
            LayerkitError::Storage(format!(
                "Failed to create layer file in {}: {}",
                tmp_dir.display(),
                e
            ))
        })?;
        let handle = file.reopen()?;
        let compressed = HashingWriter::new(BufWriter::new(handle));
        let gz = GzBuilder::new().write(compressed, Compression::default());
        let mut builder = tar::Builder::new(HashingWriter::new(gz));
        builder.follow_symlinks(false);

        Ok(Self {
            builder,
            file,
            written: BTreeSet::new(),
        })
    }

    fn header(kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_size(size);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header
    }

    fn add_parents(&mut self, rel: &Path) -> LayerkitResult<()> {
        let mut ancestors: Vec<PathBuf> = rel
            .ancestors()
            .skip(1)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .collect();
        ancestors.reverse();
        for dir in ancestors {
            if !self.written.contains(&dir) {
                self.add_dir(&dir)?;
            }
        }
        Ok(())
    }

    /// Add a directory entry (and any missing parents).
    pub fn add_dir(&mut self, rel: &Path) -> LayerkitResult<()> {
        if self.written.contains(rel) {
            return Ok(());
        }
        self.add_parents(rel)?;
        let mut header = Self::header(tar::EntryType::Directory, DIR_MODE, 0);
        self.builder.append_data(&mut header, rel, std::io::empty())?;
        self.written.insert(rel.to_path_buf());
        Ok(())
    }

    /// Add a regular file copied from `src`.
    pub fn add_file(&mut self, rel: &Path, src: &Path) -> LayerkitResult<()> {
        self.add_parents(rel)?;
        let metadata = std::fs::metadata(src)?;
        let mode = normalize_mode(metadata.permissions().mode());
        let mut header = Self::header(tar::EntryType::Regular, mode, metadata.len());
        let reader = BufReader::new(File::open(src)?);
        self.builder.append_data(&mut header, rel, reader)?;
        self.written.insert(rel.to_path_buf());
        Ok(())
    }

    /// Add a symbolic link pointing at `target`.
    pub fn add_symlink(&mut self, rel: &Path, target: &Path) -> LayerkitResult<()> {
        self.add_parents(rel)?;
        let mut header = Self::header(tar::EntryType::Symlink, 0o777, 0);
        self.builder.append_link(&mut header, rel, target)?;
        self.written.insert(rel.to_path_buf());
        Ok(())
    }

    /// Mark `rel` as deleted relative to lower layers.
    pub fn add_whiteout(&mut self, rel: &Path) -> LayerkitResult<()> {
        let name = rel
            .file_name()
            .ok_or_else(|| LayerkitError::Internal(format!("whiteout without name: {:?}", rel)))?;
        let marker = rel.with_file_name(format!("{}{}", WHITEOUT_PREFIX, name.to_string_lossy()));
        self.add_parents(&marker)?;
        let mut header = Self::header(tar::EntryType::Regular, FILE_MODE, 0);
        self.builder.append_data(&mut header, &marker, std::io::empty())?;
        self.written.insert(marker);
        Ok(())
    }

    /// Add whatever lives at `src` (file, directory tree or symlink) under `dest`.
    ///
    /// Directories are walked in file-name order so the result is stable.
    pub fn add_tree(&mut self, src: &Path, dest: &Path) -> LayerkitResult<()> {
        for entry in WalkDir::new(src)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                LayerkitError::Storage(format!("Failed to walk {}: {}", src.display(), e))
            })?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| LayerkitError::Internal(e.to_string()))?;
            let target = if rel.as_os_str().is_empty() {
                dest.to_path_buf()
            } else {
                dest.join(rel)
            };
            if target.as_os_str().is_empty() {
                continue;
            }

            let file_type = entry.file_type();
            if file_type.is_dir() {
                self.add_dir(&target)?;
            } else if file_type.is_symlink() {
                let link = std::fs::read_link(entry.path())?;
                self.add_symlink(&target, &link)?;
            } else if file_type.is_file() {
                self.add_file(&target, entry.path())?;
            } else {
                tracing::debug!(path = %entry.path().display(), "Skipping special file");
            }
        }
        Ok(())
    }

    /// Finalize the archive and compute both digests.
    pub fn finish(self) -> LayerkitResult<PendingLayer> {
        let LayerWriter { builder, file, .. } = self;
        let tar_sink = builder.into_inner()?;
        let (gz, diff_id, _) = tar_sink.finish();
        let compressed = gz.finish()?;
        let (mut buffered, digest, size) = compressed.finish();
        buffered.flush()?;

        Ok(PendingLayer {
            file,
            descriptor: LayerDescriptor {
                digest,
                diff_id,
                size,
            },
        })
    }
}

fn open_layer(blob: &Path) -> LayerkitResult<tar::Archive<GzDecoder<BufReader<File>>>> {
    let file = File::open(blob).map_err(|e| {
        LayerkitError::Storage(format!("Failed to open layer {}: {}", blob.display(), e))
    })?;
    Ok(tar::Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Apply one layer on top of the tree at `dest`, honoring whiteouts.
pub fn extract_layer(blob: &Path, dest: &Path) -> LayerkitResult<()> {
    let mut archive = open_layer(blob)?;
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name == OPAQUE_WHITEOUT || name.starts_with(WHITEOUT_PREFIX) {
            let parent = rel.parent().unwrap_or_else(|| Path::new(""));
            let dir = safe_join(dest, parent).ok_or_else(|| {
                LayerkitError::Storage(format!("unsafe whiteout path in layer: {:?}", rel))
            })?;
            if name == OPAQUE_WHITEOUT {
                if dir.is_dir() {
                    for child in std::fs::read_dir(&dir)? {
                        remove_any(&child?.path())?;
                    }
                }
            } else {
                remove_any(&dir.join(&name[WHITEOUT_PREFIX.len()..]))?;
            }
            continue;
        }

        let target = safe_join(dest, &rel)
            .ok_or_else(|| LayerkitError::Storage(format!("unsafe path in layer: {:?}", rel)))?;
        let is_dir_entry = entry.header().entry_type().is_dir();
        if let Ok(existing) = std::fs::symlink_metadata(&target) {
            if existing.is_dir() != is_dir_entry {
                remove_any(&target)?;
            }
        }
        entry.unpack_in(dest)?;
    }
    Ok(())
}

/// Extract layers bottom-up into `dest`.
pub fn extract_layers<'a, I>(blobs: I, dest: &Path) -> LayerkitResult<()>
where
    I: IntoIterator<Item = &'a Path>,
{
    std::fs::create_dir_all(dest)?;
    for blob in blobs {
        extract_layer(blob, dest)?;
    }
    Ok(())
}

/// List the entries of a layer without extracting it.
pub fn list_entries(blob: &Path) -> LayerkitResult<Vec<(PathBuf, EntryKind)>> {
    let mut archive = open_layer(blob)?;
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = if name == OPAQUE_WHITEOUT {
            EntryKind::OpaqueWhiteout
        } else if name.starts_with(WHITEOUT_PREFIX) {
            EntryKind::Whiteout
        } else {
            match entry.header().entry_type() {
                tar::EntryType::Directory => EntryKind::Directory,
                tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::File,
                tar::EntryType::Symlink => EntryKind::Symlink,
                _ => EntryKind::Other,
            }
        };
        entries.push((path, kind));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_tree(root: &Path) {
        std::fs::create_dir_all(root.join("app/pkg")).unwrap();
        std::fs::write(root.join("app/main.py"), "app = object()\n").unwrap();
        std::fs::write(root.join("app/pkg/__init__.py"), "").unwrap();
        let script = root.join("app/run.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o700)).unwrap();
        std::os::unix::fs::symlink("main.py", root.join("app/link.py")).unwrap();
    }

    fn build_layer(tmp: &Path, src: &Path) -> PendingLayer {
        let mut writer = LayerWriter::create(tmp).unwrap();
        writer.add_tree(src, Path::new("")).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_same_tree_same_digest() {
        let tmp = TempDir::new().unwrap();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write_tree(a.path());
        write_tree(b.path());

        let first = build_layer(tmp.path(), a.path());
        let second = build_layer(tmp.path(), b.path());
        assert_eq!(first.descriptor, second.descriptor);
        assert_ne!(first.descriptor.digest, first.descriptor.diff_id);
    }

    #[test]
    fn test_extract_preserves_content_and_exec_bit() {
        let tmp = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write_tree(src.path());

        let layer = build_layer(tmp.path(), src.path());
        extract_layer(layer.file.path(), dest.path()).unwrap();

        let main = std::fs::read_to_string(dest.path().join("app/main.py")).unwrap();
        assert_eq!(main, "app = object()\n");
        let mode = std::fs::metadata(dest.path().join("app/run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        let link = std::fs::read_link(dest.path().join("app/link.py")).unwrap();
        assert_eq!(link, PathBuf::from("main.py"));
    }

    #[test]
    fn test_whiteout_removes_lower_entry() {
        let tmp = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write_tree(src.path());
        let lower = build_layer(tmp.path(), src.path());

        let mut writer = LayerWriter::create(tmp.path()).unwrap();
        writer.add_whiteout(Path::new("app/main.py")).unwrap();
        writer.add_whiteout(Path::new("app/pkg")).unwrap();
        let upper = writer.finish().unwrap();

        extract_layers([lower.file.path(), upper.file.path()], dest.path()).unwrap();
        assert!(!dest.path().join("app/main.py").exists());
        assert!(!dest.path().join("app/pkg").exists());
        assert!(dest.path().join("app/run.sh").exists());
    }

    #[test]
    fn test_list_entries_reports_kinds() {
        let tmp = TempDir::new().unwrap();
        let mut writer = LayerWriter::create(tmp.path()).unwrap();
        writer.add_dir(Path::new("app")).unwrap();
        writer.add_whiteout(Path::new("etc/motd")).unwrap();
        let layer = writer.finish().unwrap();

        let entries = list_entries(layer.file.path()).unwrap();
        assert!(entries.contains(&(PathBuf::from("app"), EntryKind::Directory)));
        assert!(entries.contains(&(PathBuf::from("etc"), EntryKind::Directory)));
        assert!(entries.contains(&(PathBuf::from("etc/.wh.motd"), EntryKind::Whiteout)));
    }

    #[test]
    fn test_safe_join_rejects_escape() {
        let root = Path::new("/tmp/root");
        assert_eq!(
            safe_join(root, Path::new("a/./b")),
            Some(PathBuf::from("/tmp/root/a/b"))
        );
        assert!(safe_join(root, Path::new("../etc")).is_none());
        assert!(safe_join(root, Path::new("/etc")).is_none());
    }
}
