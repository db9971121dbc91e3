//! Packing a tree and reading it back.

use flate2::read::GzDecoder;
use kubetools_archive::{ArchiveFormat, ArchiveJob, pack};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tempfile::TempDir;

fn fixture(root: &Path) -> String {
    let dir = root.join("dir");
    fs::create_dir_all(dir.join("sub")).unwrap();
    fs::write(dir.join("a.txt"), b"first file\n").unwrap();
    fs::write(dir.join("sub/b.txt"), b"second file\n").unwrap();
    format!("{}/*", dir.display())
}

fn read_zip(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut files = BTreeMap::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        files.insert(entry.name().to_string(), content);
    }
    files
}

fn read_tar_gz(path: &Path) -> (Vec<String>, BTreeMap<String, Vec<u8>>) {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
    let mut names = Vec::new();
    let mut files = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
        names.push(name.clone());
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            files.insert(name, content);
        }
    }
    (names, files)
}

fn expected() -> BTreeMap<String, Vec<u8>> {
    BTreeMap::from([
        ("a.txt".to_string(), b"first file\n".to_vec()),
        ("sub/b.txt".to_string(), b"second file\n".to_vec()),
    ])
}

#[test]
fn zip_round_trip_preserves_relative_paths() {
    let temp = TempDir::new().unwrap();
    let pattern = fixture(temp.path());
    let job = ArchiveJob::new(pattern, temp.path().join("out.zip")).unwrap();
    assert_eq!(job.format, ArchiveFormat::Zip);

    pack(&job).unwrap();

    assert_eq!(read_zip(&job.destination), expected());
}

#[test]
fn zip_entries_are_deflated_with_source_mode() {
    let temp = TempDir::new().unwrap();
    let pattern = fixture(temp.path());
    let job = ArchiveJob::new(pattern, temp.path().join("out.zip")).unwrap();
    pack(&job).unwrap();

    let mut archive = zip::ZipArchive::new(File::open(&job.destination).unwrap()).unwrap();
    let entry = archive.by_name("a.txt").unwrap();
    assert_eq!(entry.compression(), zip::CompressionMethod::Deflated);
    assert!(entry.unix_mode().is_some());
}

#[test]
fn tar_gz_round_trip_includes_directories() {
    let temp = TempDir::new().unwrap();
    let pattern = fixture(temp.path());
    let job = ArchiveJob::new(pattern, temp.path().join("nested/out.tar.gz")).unwrap();
    assert_eq!(job.format, ArchiveFormat::TarGzip);

    let summary = pack(&job).unwrap();
    assert_eq!(summary.entries, 3);

    let (names, files) = read_tar_gz(&job.destination);
    assert_eq!(names, ["a.txt", "sub", "sub/b.txt"]);
    assert_eq!(files, expected());
}

#[test]
fn packing_twice_yields_identical_entries() {
    let temp = TempDir::new().unwrap();
    let pattern = fixture(temp.path());
    let first = ArchiveJob::new(pattern.clone(), temp.path().join("one.zip")).unwrap();
    let second = ArchiveJob::new(pattern, temp.path().join("two.zip")).unwrap();

    pack(&first).unwrap();
    pack(&second).unwrap();

    assert_eq!(read_zip(&first.destination), read_zip(&second.destination));
}

#[cfg(unix)]
#[test]
fn zip_round_trip_follows_linked_files() {
    let temp = TempDir::new().unwrap();
    let pattern = fixture(temp.path());
    fs::write(temp.path().join("real.txt"), b"linked target\n").unwrap();
    std::os::unix::fs::symlink("../../real.txt", temp.path().join("dir/sub/link.txt")).unwrap();

    let job = ArchiveJob::new(pattern, temp.path().join("out.zip")).unwrap();
    let summary = pack(&job).unwrap();
    assert_eq!(summary.entries, 3);

    let mut want = expected();
    want.insert("sub/link.txt".to_string(), b"linked target\n".to_vec());
    assert_eq!(read_zip(&job.destination), want);
}
