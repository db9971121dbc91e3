//! Packs glob-matched file trees into zip or tar+gzip archives.
//!
//! Every glob match is walked recursively in file-name order. Entries are
//! named relative to the pattern's parent directory, so packing `dist/*`
//! stores `dist/bin/tool` as `bin/tool`.

mod error;

pub use error::{Error, Result};

use chrono::{DateTime, Datelike, Timelike, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, Metadata};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// Output encoding of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// ZIP with one deflate entry per file
    Zip,
    /// POSIX tar inside gzip
    TarGzip,
}

impl ArchiveFormat {
    /// Select the format from the destination's extension.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedArchiveExtension` for anything but `.zip` and `.gz`.
    pub fn from_destination(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        match extension {
            "zip" => Ok(Self::Zip),
            "gz" => Ok(Self::TarGzip),
            other => Err(Error::UnsupportedArchiveExtension {
                extension: other.to_string(),
                path: path.to_path_buf(),
            }),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zip => write!(f, "zip"),
            Self::TarGzip => write!(f, "tar+gzip"),
        }
    }
}

/// What to pack and where.
///
/// Execution reads the live filesystem, so two runs of the same job may see
/// different trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveJob {
    /// Glob selecting the roots to pack
    pub source_pattern: String,
    /// Archive file to write
    pub destination: PathBuf,
    /// Output encoding
    pub format: ArchiveFormat,
}

impl ArchiveJob {
    /// Create a job whose format follows the destination's extension.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedArchiveExtension` when the extension is unknown.
    pub fn new(source_pattern: impl Into<String>, destination: impl Into<PathBuf>) -> Result<Self> {
        let destination = destination.into();
        let format = ArchiveFormat::from_destination(&destination)?;
        Ok(Self {
            source_pattern: source_pattern.into(),
            destination,
            format,
        })
    }
}

/// Result of a successful [`pack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackSummary {
    /// The archive written
    pub destination: PathBuf,
    /// Its encoding
    pub format: ArchiveFormat,
    /// Number of entries stored
    pub entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Directory,
    File,
    Symlink,
}

#[derive(Debug)]
struct Entry {
    source: PathBuf,
    name: String,
    kind: EntryKind,
}

/// Pack the files matched by `job` into its destination.
///
/// # Errors
///
/// Returns `InvalidPattern` for a malformed glob, and `Io`, `Walk` or `Zip`
/// when reading the tree or writing the archive fails.
pub fn pack(job: &ArchiveJob) -> Result<PackSummary> {
    let entries = collect_entries(&job.source_pattern)?;
    if entries.is_empty() {
        warn!(pattern = %job.source_pattern, "Pattern matched nothing, writing an empty archive");
    }

    if let Some(parent) = job.destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let written = match job.format {
        ArchiveFormat::Zip => write_zip(&job.destination, &entries)?,
        ArchiveFormat::TarGzip => write_tar_gz(&job.destination, &entries)?,
    };

    info!(
        destination = %job.destination.display(),
        format = %job.format,
        entries = written,
        "Archive written"
    );
    Ok(PackSummary {
        destination: job.destination.clone(),
        format: job.format,
        entries: written,
    })
}

fn collect_entries(pattern: &str) -> Result<Vec<Entry>> {
    let base = pattern_base(pattern);
    let matches = glob::glob(pattern).map_err(|source| Error::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })?;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for matched in matches {
        let root = matched.map_err(|e| {
            let path = e.path().to_path_buf();
            Error::io(path, e.into_error())
        })?;

        for walked in WalkDir::new(&root).sort_by_file_name() {
            let walked = walked.map_err(|source| Error::Walk {
                path: root.clone(),
                source,
            })?;
            let Some(name) = entry_name(&base, walked.path())? else {
                continue;
            };
            if !seen.insert(name.clone()) {
                continue;
            }

            let file_type = walked.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else {
                EntryKind::File
            };
            entries.push(Entry {
                source: walked.into_path(),
                name,
                kind,
            });
        }
    }

    debug!(pattern, count = entries.len(), "Collected archive entries");
    Ok(entries)
}

/// Lexically normalise `path`: drop `.` and fold `dir/..` pairs.
///
/// Glob results come back in this form, so the pattern base must match it.
fn clean(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// Parent directory of `pattern`, cut before its first wildcard component.
fn pattern_base(pattern: &str) -> PathBuf {
    let parent = Path::new(pattern).parent().unwrap_or_else(|| Path::new(""));
    clean(parent)
        .components()
        .take_while(|component| {
            !component
                .as_os_str()
                .to_string_lossy()
                .contains(['*', '?', '['])
        })
        .collect()
}

/// `/`-separated name of `path` relative to `base`, `None` for `base` itself.
fn entry_name(base: &Path, path: &Path) -> Result<Option<String>> {
    let cleaned = clean(path);
    let relative = cleaned
        .strip_prefix(base)
        .map_err(|_| Error::OutsidePatternBase {
            path: path.to_path_buf(),
            base: base.to_path_buf(),
        })?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("/")))
    }
}

fn write_zip(destination: &Path, entries: &[Entry]) -> Result<usize> {
    let file = File::create(destination).map_err(|e| Error::io(destination, e))?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(file));
    let mut written = 0;

    for entry in entries {
        if entry.kind == EntryKind::Directory {
            continue;
        }
        // Links are stored as the file they point to.
        let metadata = fs::metadata(&entry.source).map_err(|e| Error::io(&entry.source, e))?;
        if !metadata.is_file() {
            warn!(path = %entry.source.display(), "Skipping link to a non-file in zip archive");
            continue;
        }
        let mut options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(unix_mode(&metadata));
        if let Some(modified) = zip_timestamp(&metadata) {
            options = options.last_modified_time(modified);
        }

        zip.start_file(entry.name.as_str(), options)
            .map_err(|e| Error::zip(destination, e))?;
        let mut source = File::open(&entry.source).map_err(|e| Error::io(&entry.source, e))?;
        io::copy(&mut source, &mut zip).map_err(|e| Error::io(&entry.source, e))?;
        written += 1;
    }

    let mut out = zip.finish().map_err(|e| Error::zip(destination, e))?;
    out.flush().map_err(|e| Error::io(destination, e))?;
    Ok(written)
}

fn write_tar_gz(destination: &Path, entries: &[Entry]) -> Result<usize> {
    let file = File::create(destination).map_err(|e| Error::io(destination, e))?;
    let mut builder = tar::Builder::new(GzEncoder::new(BufWriter::new(file), Compression::default()));
    builder.follow_symlinks(false);

    for entry in entries {
        let appended = match entry.kind {
            EntryKind::Directory => builder.append_dir(&entry.name, &entry.source),
            EntryKind::File | EntryKind::Symlink => builder.append_path_with_name(&entry.source, &entry.name),
        };
        appended.map_err(|e| Error::io(&entry.source, e))?;
    }

    let encoder = builder.into_inner().map_err(|e| Error::io(destination, e))?;
    let mut out = encoder.finish().map_err(|e| Error::io(destination, e))?;
    out.flush().map_err(|e| Error::io(destination, e))?;
    Ok(entries.len())
}

#[cfg(unix)]
fn unix_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn unix_mode(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() { 0o444 } else { 0o644 }
}

/// Modification time in zip's DOS range (1980..=2107), UTC.
fn zip_timestamp(metadata: &Metadata) -> Option<zip::DateTime> {
    let modified: DateTime<Utc> = metadata.modified().ok()?.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(modified.year()).ok()?,
        u8::try_from(modified.month()).ok()?,
        u8::try_from(modified.day()).ok()?,
        u8::try_from(modified.hour()).ok()?,
        u8::try_from(modified.minute()).ok()?,
        u8::try_from(modified.second()).ok()?,
    )
    .ok()
}
