//! Shared fakes for kubetools-core tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::download::ArtifactSource;
use crate::engine::{ContainerEngine, ExecOutput, Image};
use crate::error::{Error, Result};
use crate::plan::artifact_file_name;

/// Records every run and answers with canned exit codes per program.
#[derive(Default)]
pub struct FakeEngine {
    runs: Mutex<Vec<(Image, Vec<String>)>>,
    exit_codes: HashMap<String, i32>,
    broken: HashSet<String>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `program` exit with `code`.
    pub fn with_exit_code(mut self, program: &str, code: i32) -> Self {
        self.exit_codes.insert(program.to_string(), code);
        self
    }

    /// Make running `program` an engine error.
    pub fn with_engine_error(mut self, program: &str) -> Self {
        self.broken.insert(program.to_string());
        self
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.runs.lock().unwrap().iter().map(|(_, cmd)| cmd.clone()).collect()
    }

    pub fn images(&self) -> Vec<Image> {
        self.runs.lock().unwrap().iter().map(|(image, _)| image.clone()).collect()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn run(&self, image: &Image, command: &[String]) -> Result<ExecOutput> {
        self.runs
            .lock()
            .unwrap()
            .push((image.clone(), command.to_vec()));

        let program = command.first().cloned().unwrap_or_default();
        if self.broken.contains(&program) {
            return Err(Error::engine("fake", format!("{program}: connection lost")));
        }
        let exit_code = self.exit_codes.get(&program).copied().unwrap_or(0);
        Ok(ExecOutput {
            exit_code,
            stdout: format!("{program} ok\n"),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("{program} failed\n")
            },
        })
    }
}

/// Serves artifacts from a directory, writing a stub file for unknown URLs.
pub struct FakeSource {
    dir: PathBuf,
    fetched: Mutex<Vec<String>>,
    artifacts: HashMap<String, PathBuf>,
    missing: HashSet<String>,
}

impl FakeSource {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            fetched: Mutex::new(Vec::new()),
            artifacts: HashMap::new(),
            missing: HashSet::new(),
        }
    }

    /// Serve `path` for `url`.
    pub fn with_artifact(mut self, url: &str, path: PathBuf) -> Self {
        self.artifacts.insert(url.to_string(), path);
        self
    }

    /// Answer `url` with a permanent download failure.
    pub fn with_missing(mut self, url: &str) -> Self {
        self.missing.insert(url.to_string());
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactSource for FakeSource {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<PathBuf> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.fetched.lock().unwrap().push(url.to_string());

        if self.missing.contains(url) {
            return Err(Error::download(url, 1, "HTTP 404 Not Found"));
        }
        if let Some(path) = self.artifacts.get(url) {
            return Ok(path.clone());
        }
        let path = self.dir.join(artifact_file_name(url));
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        Ok(path)
    }
}

/// Write a gzip tarball containing `entries` (path, content).
pub fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

/// Write a zip archive containing executable `entries` (path, content).
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    use std::io::Write;

    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}
