//! Layer archive creation and restore.
//!
//! A layer is built from one `<launch>/<buildpack>/<layer>` directory as an
//! uncompressed tar whose bytes depend only on file content, relative paths,
//! permission bits and symlink targets. The DiffID is the SHA256 of that tar;
//! the registry blob is its gzip compression.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use packs_core::error::{LifecycleError, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Media type of layers produced by export.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Mode used for the synthesized parent directories of the layer prefix.
const PARENT_DIR_MODE: u32 = 0o755;

/// Compression of a layer blob, derived from its media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    Gzip,
    Uncompressed,
}

impl LayerCompression {
    pub fn from_media_type(media_type: &str) -> Result<Self> {
        match media_type {
            "application/vnd.oci.image.layer.v1.tar+gzip"
            | "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip"
            | "application/vnd.docker.image.rootfs.diff.tar.gzip"
            | "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip" => {
                Ok(LayerCompression::Gzip)
            }
            "application/vnd.oci.image.layer.v1.tar"
            | "application/vnd.oci.image.layer.nondistributable.v1.tar"
            | "application/vnd.docker.image.rootfs.diff.tar" => Ok(LayerCompression::Uncompressed),
            other => Err(LifecycleError::UnsupportedMediaType(other.to_string())),
        }
    }
}

/// Uncompressed layer archive and its DiffID.
#[derive(Debug, Clone)]
pub struct LayerArchive {
    /// Tar bytes
    pub tar: Vec<u8>,
    /// "sha256:<hex>" of `tar`
    pub diff_id: String,
}

/// Compressed layer blob as stored in an image.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    /// Gzip bytes
    pub bytes: Vec<u8>,
    /// "sha256:<hex>" of `bytes`
    pub digest: String,
    /// Size in bytes
    pub size: u64,
}

impl LayerArchive {
    pub fn from_tar(tar: Vec<u8>) -> Self {
        let diff_id = prefixed_digest(&tar);
        Self { tar, diff_id }
    }

    /// Gzip the archive. The gzip header carries no timestamp or file name,
    /// so equal archives compress to equal blobs.
    pub fn compress(&self) -> Result<LayerBlob> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&self.tar)
            .map_err(|e| LifecycleError::Layer(format!("Failed to compress layer: {}", e)))?;
        let bytes = encoder
            .finish()
            .map_err(|e| LifecycleError::Layer(format!("Failed to finalize layer blob: {}", e)))?;

        Ok(LayerBlob {
            digest: prefixed_digest(&bytes),
            size: bytes.len() as u64,
            bytes,
        })
    }
}

/// Build a deterministic layer archive from `dir`.
///
/// Every entry is stored under `prefix` (the layer's location inside the
/// image, e.g. `/launch/<buildpack>/<layer>`), preceded by entries for each
/// parent directory of the prefix. Returns `Ok(None)` when `dir` does not
/// exist.
pub fn build_layer(dir: &Path, prefix: &Path) -> Result<Option<LayerArchive>> {
    let root_meta = match std::fs::symlink_metadata(dir) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(LifecycleError::io(
                format!("Failed to stat layer directory {}", dir.display()),
                e,
            ))
        }
    };
    if !root_meta.is_dir() {
        return Err(LifecycleError::Layer(format!(
            "Layer path {} is not a directory",
            dir.display()
        )));
    }

    let prefix = archive_path(prefix)?;
    if prefix.as_os_str().is_empty() {
        return Err(LifecycleError::Layer(
            "Layer prefix must name a directory".to_string(),
        ));
    }

    let mut builder = tar::Builder::new(Vec::new());

    let mut parent = PathBuf::new();
    let components: Vec<_> = prefix.components().collect();
    for component in &components[..components.len() - 1] {
        parent.push(component);
        append_dir(&mut builder, &parent, PARENT_DIR_MODE)?;
    }
    append_dir(&mut builder, &prefix, permission_bits(&root_meta))?;

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            LifecycleError::Layer(format!("Failed to walk {}: {}", dir.display(), e))
        })?;
        let relative = entry.path().strip_prefix(dir).map_err(|e| {
            LifecycleError::Layer(format!(
                "Failed to compute relative path for {}: {}",
                entry.path().display(),
                e
            ))
        })?;
        let tar_path = prefix.join(relative);
        let meta = entry.metadata().map_err(|e| {
            LifecycleError::Layer(format!(
                "Failed to read metadata for {}: {}",
                entry.path().display(),
                e
            ))
        })?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            append_dir(&mut builder, &tar_path, permission_bits(&meta))?;
        } else if file_type.is_file() {
            let mut header = entry_header(tar::EntryType::Regular, permission_bits(&meta), meta.len());
            let file = std::fs::File::open(entry.path()).map_err(|e| {
                LifecycleError::io(format!("Failed to open {}", entry.path().display()), e)
            })?;
            builder
                .append_data(&mut header, &tar_path, file)
                .map_err(|e| {
                    LifecycleError::Layer(format!(
                        "Failed to add file {} to layer: {}",
                        tar_path.display(),
                        e
                    ))
                })?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(|e| {
                LifecycleError::io(format!("Failed to read link {}", entry.path().display()), e)
            })?;
            let mut header = entry_header(tar::EntryType::Symlink, permission_bits(&meta), 0);
            builder
                .append_link(&mut header, &tar_path, &target)
                .map_err(|e| {
                    LifecycleError::Layer(format!(
                        "Failed to add symlink {} to layer: {}",
                        tar_path.display(),
                        e
                    ))
                })?;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file");
        }
    }

    let tar = builder
        .into_inner()
        .map_err(|e| LifecycleError::Layer(format!("Failed to finalize layer: {}", e)))?;

    Ok(Some(LayerArchive::from_tar(tar)))
}

/// Unpack the entries of a layer blob that live under `strip_prefix` into
/// `target_dir`, with the prefix removed. Entries outside the prefix are
/// ignored. Returns the number of entries written.
pub fn restore_layer<R: Read>(
    reader: R,
    media_type: &str,
    strip_prefix: &Path,
    target_dir: &Path,
) -> Result<usize> {
    let prefix = archive_path(strip_prefix)?;
    match LayerCompression::from_media_type(media_type)? {
        LayerCompression::Gzip => unpack_under(GzDecoder::new(reader), &prefix, target_dir),
        LayerCompression::Uncompressed => unpack_under(reader, &prefix, target_dir),
    }
}

fn unpack_under<R: Read>(reader: R, prefix: &Path, target_dir: &Path) -> Result<usize> {
    std::fs::create_dir_all(target_dir).map_err(|e| {
        LifecycleError::io(
            format!("Failed to create layer directory {}", target_dir.display()),
            e,
        )
    })?;

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|e| LifecycleError::Layer(format!("Failed to read layer archive: {}", e)))?;

    // Directory modes are applied after every entry is written, so a
    // read-only directory can still receive its contents.
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();
    let mut restored = 0;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| LifecycleError::Layer(format!("Corrupt layer archive: {}", e)))?;
        let raw_path = entry
            .path()
            .map_err(|e| LifecycleError::Layer(format!("Invalid entry path: {}", e)))?
            .into_owned();
        let path = archive_path(&raw_path)?;
        let entry_type = entry.header().entry_type();

        let relative = match path.strip_prefix(prefix) {
            Ok(relative) if relative.as_os_str().is_empty() => {
                if entry_type == tar::EntryType::Directory {
                    dir_modes.push((target_dir.to_path_buf(), entry_mode(&entry)?));
                }
                continue;
            }
            Ok(relative) => relative.to_path_buf(),
            Err(_) => continue,
        };

        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Directory | tar::EntryType::Symlink => {}
            other => {
                tracing::debug!(path = %raw_path.display(), entry_type = ?other, "Skipping entry");
                continue;
            }
        }

        reject_symlink_parents(target_dir, &relative)?;
        let dest = target_dir.join(&relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LifecycleError::io(format!("Failed to create {}", parent.display()), e)
            })?;
        }

        if entry_type == tar::EntryType::Directory {
            if std::fs::symlink_metadata(&dest).map_or(false, |m| m.file_type().is_symlink()) {
                return Err(LifecycleError::Layer(format!(
                    "Refusing to restore directory over symlink {}",
                    dest.display()
                )));
            }
            std::fs::create_dir_all(&dest).map_err(|e| {
                LifecycleError::io(format!("Failed to create {}", dest.display()), e)
            })?;
            dir_modes.push((dest, entry_mode(&entry)?));
        } else {
            entry.unpack(&dest).map_err(|e| {
                LifecycleError::Layer(format!("Failed to restore {}: {}", dest.display(), e))
            })?;
        }
        restored += 1;
    }

    // Deepest first: a parent that loses search permission must come last.
    for (dir, mode) in dir_modes.iter().rev() {
        set_dir_mode(dir, *mode)?;
    }

    Ok(restored)
}

fn entry_mode<R: Read>(entry: &tar::Entry<'_, R>) -> Result<u32> {
    entry
        .header()
        .mode()
        .map(|mode| mode & 0o7777)
        .map_err(|e| LifecycleError::Layer(format!("Invalid entry mode: {}", e)))
}

#[cfg(unix)]
fn set_dir_mode(dir: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        LifecycleError::io(format!("Failed to set permissions on {}", dir.display()), e)
    })
}

#[cfg(not(unix))]
fn set_dir_mode(_dir: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Relative archive form of a path: root and `.` components dropped, `..`
/// rejected.
fn archive_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(LifecycleError::Layer(format!(
                    "Refusing path outside the layer: {}",
                    path.display()
                )))
            }
        }
    }
    Ok(out)
}

/// An entry must not be written through a symlink restored earlier.
fn reject_symlink_parents(target_dir: &Path, relative: &Path) -> Result<()> {
    let mut current = target_dir.to_path_buf();
    if let Some(parent) = relative.parent() {
        for component in parent.components() {
            current.push(component);
            if let Ok(meta) = std::fs::symlink_metadata(&current) {
                if meta.file_type().is_symlink() {
                    return Err(LifecycleError::Layer(format!(
                        "Refusing to restore through symlink {}",
                        current.display()
                    )));
                }
            }
        }
    }
    Ok(())
}

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, path: &Path, mode: u32) -> Result<()> {
    let mut header = entry_header(tar::EntryType::Directory, mode, 0);
    builder
        .append_data(&mut header, path, std::io::empty())
        .map_err(|e| {
            LifecycleError::Layer(format!(
                "Failed to add directory {} to layer: {}",
                path.display(),
                e
            ))
        })
}

/// Header with ownership and timestamps zeroed.
fn entry_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Compute SHA256 digest of raw bytes (hex, no prefix).
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA256 digest of raw bytes as "sha256:<hex>".
pub fn prefixed_digest(data: &[u8]) -> String {
    format!("sha256:{}", sha256_bytes(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("bin").join("run"), "#!/bin/sh\necho hi\n").unwrap();
        fs::write(dir.join("data.txt"), "payload").unwrap();
    }

    fn entry_paths(tar: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(tar);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_build_layer_missing_dir_is_none() {
        let tmp = TempDir::new().unwrap();
        let result = build_layer(&tmp.path().join("absent"), Path::new("/launch/bp/l")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_build_layer_is_deterministic_across_copies() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        populate(first.path());
        std::thread::sleep(std::time::Duration::from_millis(1100));
        populate(second.path());

        let prefix = Path::new("/launch/bp.A/layer1");
        let a = build_layer(first.path(), prefix).unwrap().unwrap();
        let b = build_layer(second.path(), prefix).unwrap().unwrap();

        assert_eq!(a.diff_id, b.diff_id);
        assert_eq!(a.tar, b.tar);
        assert!(a.diff_id.starts_with("sha256:"));
        assert_eq!(a.diff_id, prefixed_digest(&a.tar));
    }

    #[test]
    fn test_build_layer_content_changes_diff_id() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());
        let prefix = Path::new("/launch/bp/l");
        let before = build_layer(tmp.path(), prefix).unwrap().unwrap();

        fs::write(tmp.path().join("data.txt"), "changed").unwrap();
        let after = build_layer(tmp.path(), prefix).unwrap().unwrap();

        assert_ne!(before.diff_id, after.diff_id);
    }

    #[test]
    fn test_build_layer_entries_are_prefixed_and_sorted() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());

        let archive = build_layer(tmp.path(), Path::new("/launch/bp.A/layer1"))
            .unwrap()
            .unwrap();

        assert_eq!(
            entry_paths(&archive.tar),
            vec![
                "launch",
                "launch/bp.A",
                "launch/bp.A/layer1",
                "launch/bp.A/layer1/bin",
                "launch/bp.A/layer1/bin/run",
                "launch/bp.A/layer1/data.txt",
            ]
        );
    }

    #[test]
    fn test_build_layer_zeroes_ownership_and_times() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());

        let archive = build_layer(tmp.path(), Path::new("/launch/bp/l")).unwrap().unwrap();
        let mut reader = tar::Archive::new(archive.tar.as_slice());
        for entry in reader.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.mtime().unwrap(), 0);
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            assert_eq!(header.username().unwrap().unwrap_or(""), "");
        }
    }

    #[test]
    fn test_build_empty_dir_has_only_directories() {
        let tmp = TempDir::new().unwrap();
        let archive = build_layer(tmp.path(), Path::new("/launch/bp/empty"))
            .unwrap()
            .unwrap();
        assert_eq!(
            entry_paths(&archive.tar),
            vec!["launch", "launch/bp", "launch/bp/empty"]
        );
    }

    #[test]
    fn test_build_layer_rejects_file_path() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("file");
        fs::write(&file, "x").unwrap();
        assert!(build_layer(&file, Path::new("/launch/bp/l")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_bits_affect_diff_id() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        populate(tmp.path());
        let run = tmp.path().join("bin").join("run");
        fs::set_permissions(&run, fs::Permissions::from_mode(0o644)).unwrap();
        let prefix = Path::new("/launch/bp/l");
        let before = build_layer(tmp.path(), prefix).unwrap().unwrap();

        fs::set_permissions(&run, fs::Permissions::from_mode(0o755)).unwrap();
        let after = build_layer(tmp.path(), prefix).unwrap().unwrap();

        assert_ne!(before.diff_id, after.diff_id);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_archived_and_restored() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        populate(&src);
        std::os::unix::fs::symlink("data.txt", src.join("alias")).unwrap();

        let prefix = Path::new("/launch/bp/l");
        let archive = build_layer(&src, prefix).unwrap().unwrap();
        let dest = tmp.path().join("dest");
        restore_layer(
            archive.tar.as_slice(),
            "application/vnd.oci.image.layer.v1.tar",
            prefix,
            &dest,
        )
        .unwrap();

        assert_eq!(fs::read_link(dest.join("alias")).unwrap(), PathBuf::from("data.txt"));
    }

    #[test]
    fn test_compress_is_stable() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());
        let archive = build_layer(tmp.path(), Path::new("/launch/bp/l")).unwrap().unwrap();

        let a = archive.compress().unwrap();
        let b = archive.compress().unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.size, a.bytes.len() as u64);

        let mut decoded = Vec::new();
        GzDecoder::new(a.bytes.as_slice()).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, archive.tar);
    }

    #[test]
    fn test_restore_gzip_strips_prefix() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        populate(&src);
        let prefix = Path::new("/launch/bp.A/layer1");
        let blob = build_layer(&src, prefix).unwrap().unwrap().compress().unwrap();

        let dest = tmp.path().join("launch").join("bp.A").join("layer1");
        let count = restore_layer(blob.bytes.as_slice(), LAYER_MEDIA_TYPE, prefix, &dest).unwrap();

        assert_eq!(count, 3);
        assert_eq!(fs::read_to_string(dest.join("data.txt")).unwrap(), "payload");
        assert!(dest.join("bin").join("run").is_file());
    }

    #[test]
    fn test_restore_ignores_entries_outside_prefix() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        populate(&src);
        let archive = build_layer(&src, Path::new("/launch/bp/other")).unwrap().unwrap();

        let dest = tmp.path().join("dest");
        let count = restore_layer(
            archive.tar.as_slice(),
            "application/vnd.oci.image.layer.v1.tar",
            Path::new("/launch/bp/wanted"),
            &dest,
        )
        .unwrap();

        assert_eq!(count, 0);
        assert!(fs::read_dir(&dest).unwrap().next().is_none());
    }

    #[test]
    fn test_restore_rejects_parent_dir_entries() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let name = b"launch/../../evil";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_size(1);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &b"x"[..]).unwrap();
        let tar = builder.into_inner().unwrap();

        let tmp = TempDir::new().unwrap();
        let result = restore_layer(
            tar.as_slice(),
            "application/vnd.oci.image.layer.v1.tar",
            Path::new("/launch"),
            tmp.path(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_restore_unsupported_media_type() {
        let tmp = TempDir::new().unwrap();
        let err = restore_layer(
            &b""[..],
            "application/vnd.oci.image.layer.v1.tar+zstd",
            Path::new("/launch/bp/l"),
            tmp.path(),
        )
        .unwrap_err();
        assert!(matches!(err, LifecycleError::UnsupportedMediaType(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_keeps_layer_root_mode() {
        use std::os::unix::fs::PermissionsExt;

        for mode in [0o775, 0o700] {
            let tmp = TempDir::new().unwrap();
            let src = tmp.path().join("src");
            populate(&src);
            fs::set_permissions(&src, fs::Permissions::from_mode(mode)).unwrap();
            let prefix = Path::new("/launch/bp/l");
            let first = build_layer(&src, prefix).unwrap().unwrap();

            let dest = tmp.path().join("dest");
            restore_layer(
                first.tar.as_slice(),
                "application/vnd.oci.image.layer.v1.tar",
                prefix,
                &dest,
            )
            .unwrap();

            let restored = fs::metadata(&dest).unwrap().permissions().mode() & 0o7777;
            assert_eq!(restored, mode);
            let second = build_layer(&dest, prefix).unwrap().unwrap();
            assert_eq!(first.diff_id, second.diff_id);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_read_only_directory_with_contents() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        populate(&src);
        fs::set_permissions(src.join("bin"), fs::Permissions::from_mode(0o555)).unwrap();
        let prefix = Path::new("/launch/bp/l");
        let archive = build_layer(&src, prefix).unwrap().unwrap();

        let dest = tmp.path().join("dest");
        restore_layer(
            archive.tar.as_slice(),
            "application/vnd.oci.image.layer.v1.tar",
            prefix,
            &dest,
        )
        .unwrap();

        assert!(dest.join("bin").join("run").is_file());
        let mode = fs::metadata(dest.join("bin")).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o555);

        fs::set_permissions(dest.join("bin"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(src.join("bin"), fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
