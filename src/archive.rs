// Archive extraction and tree copying for plugin installs

use crate::plugins::ArchiveFormat;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;
use zip::ZipArchive;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read archive {}: {reason}", .archive.display())]
    Corrupt { archive: PathBuf, reason: String },

    #[error("Archive entry escapes destination: {0}")]
    UnsafeEntry(String),

    #[error("{format} is not an archive format: {}", .archive.display())]
    NotAnArchive {
        archive: PathBuf,
        format: ArchiveFormat,
    },

    #[error(
        "Failed to determine archive root directory of {}; top-level entries: {entries:?}",
        .archive.display()
    )]
    NoLeadingDirectory {
        archive: PathBuf,
        entries: Vec<String>,
    },

    #[error("Archive {} has root \"{found}\", expected \"{expected}\"", .archive.display())]
    UnexpectedRoot {
        archive: PathBuf,
        expected: String,
        found: String,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions<'a> {
    /// Drop the single top-level directory of the archive
    pub strip_leading_directory: bool,
    /// Require the single top-level entry to have this name (implies stripping)
    pub expect_root: Option<&'a str>,
    /// Reset permissions to 0755 for directories and 0644 for files
    pub normalize_permissions: bool,
}

/// Extract `archive` into `dest`, merging with whatever is already there.
///
/// Extraction happens in a scratch directory next to the archive first so the
/// leading directory can be stripped and the layout checked before anything
/// lands in the server tree.
pub fn extract_archive(
    archive: &Path,
    format: ArchiveFormat,
    dest: &Path,
    options: &ExtractOptions<'_>,
) -> Result<(), ArchiveError> {
    let scratch = archive
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".extract-{}", Uuid::new_v4().simple()));
    fs::create_dir_all(&scratch).map_err(io_err(&scratch))?;

    let result = extract_via_scratch(archive, format, dest, options, &scratch);

    if let Err(e) = fs::remove_dir_all(&scratch) {
        tracing::warn!("Failed to remove scratch directory {:?}: {}", scratch, e);
    }
    result
}

fn extract_via_scratch(
    archive: &Path,
    format: ArchiveFormat,
    dest: &Path,
    options: &ExtractOptions<'_>,
    scratch: &Path,
) -> Result<(), ArchiveError> {
    match format {
        ArchiveFormat::Zip => extract_zip(archive, scratch)?,
        ArchiveFormat::TarGz => extract_tar_gz(archive, scratch)?,
        ArchiveFormat::Smx => {
            return Err(ArchiveError::NotAnArchive {
                archive: archive.to_path_buf(),
                format,
            })
        }
    }

    let source = if options.strip_leading_directory || options.expect_root.is_some() {
        let root = leading_directory(archive, scratch)?;
        let root_name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(expected) = options.expect_root {
            if root_name != expected {
                return Err(ArchiveError::UnexpectedRoot {
                    archive: archive.to_path_buf(),
                    expected: expected.to_string(),
                    found: root_name,
                });
            }
        }
        tracing::info!("Stripping leading directory \"{}\" from {:?}", root_name, archive);
        root
    } else {
        scratch.to_path_buf()
    };

    if options.normalize_permissions {
        normalize_permissions(&source)?;
    }

    copy_tree(&source, dest)
}

// The one top-level directory of an extracted archive
fn leading_directory(archive: &Path, scratch: &Path) -> Result<PathBuf, ArchiveError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(scratch).map_err(io_err(scratch))? {
        let entry = entry.map_err(io_err(scratch))?;
        entries.push(entry.path());
    }

    match entries.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        _ => Err(ArchiveError::NoLeadingDirectory {
            archive: archive.to_path_buf(),
            entries: entries
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                .collect(),
        }),
    }
}

fn sanitize_entry_path(raw: &str) -> Result<PathBuf, ArchiveError> {
    let mut cleaned = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(ArchiveError::UnsafeEntry(raw.to_string()));
            }
            Component::CurDir => {}
            Component::Normal(part) => cleaned.push(part),
        }
    }
    Ok(cleaned)
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let corrupt = |e: zip::result::ZipError| ArchiveError::Corrupt {
        archive: archive_path.to_path_buf(),
        reason: e.to_string(),
    };

    let file = File::open(archive_path).map_err(io_err(archive_path))?;
    let mut archive = ZipArchive::new(file).map_err(corrupt)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(corrupt)?;
        let raw = entry.name().replace('\\', "/");
        let rel = sanitize_entry_path(&raw)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(&rel);

        if entry.is_dir() {
            fs::create_dir_all(&out).map_err(io_err(&out))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut out_file = File::create(&out).map_err(io_err(&out))?;
        io::copy(&mut entry, &mut out_file).map_err(io_err(&out))?;
    }
    Ok(())
}

fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let corrupt = |e: io::Error| ArchiveError::Corrupt {
        archive: archive_path.to_path_buf(),
        reason: e.to_string(),
    };

    let file = File::open(archive_path).map_err(io_err(archive_path))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let raw = entry.path().map_err(corrupt)?.to_string_lossy().to_string();
        let rel = sanitize_entry_path(&raw)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(&rel);

        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            return Err(ArchiveError::UnsafeEntry(raw));
        }
        if kind.is_dir() {
            fs::create_dir_all(&out).map_err(io_err(&out))?;
        } else {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            entry.unpack(&out).map_err(io_err(&out))?;
        }
    }
    Ok(())
}

/// Recursively copy `src` into `dest`, overwriting files that already exist
pub fn copy_tree(src: &Path, dest: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(dest).map_err(io_err(dest))?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| ArchiveError::Io {
            path: src.to_path_buf(),
            source: e.into(),
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| ArchiveError::UnsafeEntry(entry.path().display().to_string()))?;
        let target = dest.join(rel);

        // fs::copy would follow the link
        if entry.file_type().is_symlink() {
            return Err(ArchiveError::UnsafeEntry(entry.path().display().to_string()));
        }
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(io_err(&target))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            fs::copy(entry.path(), &target).map_err(io_err(&target))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn normalize_permissions(root: &Path) -> Result<(), ArchiveError> {
    use std::os::unix::fs::PermissionsExt;

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| ArchiveError::Io {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        let mode = if entry.file_type().is_dir() { 0o755 } else { 0o644 };
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))
            .map_err(io_err(entry.path()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn normalize_permissions(_root: &Path) -> Result<(), ArchiveError> {
    Ok(())
}
