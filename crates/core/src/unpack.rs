//! Host-side extraction of downloaded tool archives.
//!
//! Archives are unpacked into a sibling temp directory first and renamed into
//! place, so a failed extraction never leaves a partial tree behind.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::debug;

use crate::error::{Error, Result};
use crate::plan::InstallKind;

/// Unpack `archive` into `dest`, dropping `strip_components` leading path
/// components from every entry. Returns the number of entries written.
///
/// # Errors
///
/// Returns `Io` when the archive is unreadable or an entry would land
/// outside `dest`.
pub fn unpack(archive: &Path, kind: InstallKind, dest: &Path, strip_components: usize) -> Result<usize> {
    let temp_dir = dest.with_file_name(format!(
        ".{}.tmp",
        dest.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("unpack")
    ));

    if temp_dir.exists() {
        fs::remove_dir_all(&temp_dir).map_err(|e| Error::io(&temp_dir, e))?;
    }
    fs::create_dir_all(&temp_dir).map_err(|e| Error::io(&temp_dir, e))?;

    let result = match kind {
        InstallKind::GzipTar => unpack_tar_gz(archive, &temp_dir, strip_components),
        InstallKind::Zip => unpack_zip(archive, &temp_dir, strip_components),
        InstallKind::RawExecutable => Err(Error::io(
            archive,
            io::Error::new(io::ErrorKind::InvalidInput, "not an archive"),
        )),
    };

    let written = match result {
        Ok(written) => written,
        Err(e) => {
            let _ = fs::remove_dir_all(&temp_dir);
            return Err(e);
        }
    };

    if dest.exists() {
        fs::remove_dir_all(dest).map_err(|e| Error::io(dest, e))?;
    }
    fs::rename(&temp_dir, dest).map_err(|e| Error::io(dest, e))?;

    debug!(archive = %archive.display(), dest = %dest.display(), written, "Unpacked archive");
    Ok(written)
}

fn unpack_tar_gz(archive: &Path, dest: &Path, strip_components: usize) -> Result<usize> {
    let file = File::open(archive).map_err(|e| Error::io(archive, e))?;
    let mut tar = Archive::new(GzDecoder::new(file));
    let mut written = 0;

    for entry in tar.entries().map_err(|e| Error::io(archive, e))? {
        let mut entry = entry.map_err(|e| Error::io(archive, e))?;
        let entry_path = entry.path().map_err(|e| Error::io(archive, e))?.into_owned();
        let Some(relative) = strip_path(archive, &entry_path, strip_components)? else {
            continue;
        };

        let entry_type = entry.header().entry_type();
        let outpath = dest.join(&relative);
        if entry_type.is_dir() {
            fs::create_dir_all(&outpath).map_err(|e| Error::io(&outpath, e))?;
        } else if entry_type.is_file() || entry_type.is_symlink() {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            entry.unpack(&outpath).map_err(|e| Error::io(&outpath, e))?;
        } else {
            continue;
        }
        written += 1;
    }

    Ok(written)
}

fn unpack_zip(archive: &Path, dest: &Path, strip_components: usize) -> Result<usize> {
    let file = File::open(archive).map_err(|e| Error::io(archive, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| Error::io(archive, io::Error::other(e)))?;
    let mut written = 0;

    for i in 0..zip.len() {
        let mut file = zip
            .by_index(i)
            .map_err(|e| Error::io(archive, io::Error::other(e)))?;
        let Some(entry_path) = file.enclosed_name() else {
            return Err(escaping_entry(archive, Path::new(file.name())));
        };
        let Some(relative) = strip_path(archive, &entry_path, strip_components)? else {
            continue;
        };

        let outpath = dest.join(&relative);
        if file.is_dir() {
            fs::create_dir_all(&outpath).map_err(|e| Error::io(&outpath, e))?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            let mut out = File::create(&outpath).map_err(|e| Error::io(&outpath, e))?;
            io::copy(&mut file, &mut out).map_err(|e| Error::io(&outpath, e))?;

            #[cfg(unix)]
            if let Some(mode) = file.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o7777))
                    .map_err(|e| Error::io(&outpath, e))?;
            }
        }
        written += 1;
    }

    Ok(written)
}

/// Drop the first `n` normal components of `path`.
///
/// Returns `None` for entries consumed entirely by stripping.
fn strip_path(archive: &Path, path: &Path, n: usize) -> Result<Option<PathBuf>> {
    let mut normal = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normal.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escaping_entry(archive, path));
            }
        }
    }
    if normal.len() <= n {
        return Ok(None);
    }
    Ok(Some(normal[n..].iter().collect()))
}

fn escaping_entry(archive: &Path, entry: &Path) -> Error {
    Error::io(
        archive,
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("archive entry escapes the destination: {}", entry.display()),
        ),
    )
}
