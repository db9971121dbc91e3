//! Release tag discovery and matching across upstream repositories.
//!
//! [`TagFetcher`] lists the release tags of one repository through a
//! [`VersionControl`] provider, keeping a clone cache that concurrent fetches
//! of the same repository share. [`intersect`] computes the versions common
//! to several tag sets.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lock::KeyedLocks;
use crate::version::compare_tags;

/// Glob selecting release tags.
pub const TAG_PATTERN: &str = "v*";

/// An upstream repository at a branch or tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct RepositoryRef {
    /// Clone URL or path of the repository.
    pub location: String,
    /// Branch or tag to check out.
    #[serde(rename = "ref")]
    pub reference: String,
}

impl RepositoryRef {
    /// Create a repository reference.
    #[must_use]
    pub fn new(location: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            reference: reference.into(),
        }
    }

    /// Cache slot name for this repository and ref.
    ///
    /// Combines a readable name with a digest of the location and ref so that
    /// different repositories never share a slot.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let name = self
            .location
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .unwrap_or_default()
            .trim_end_matches(".git");
        let name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(self.location.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.reference.as_bytes());
        let digest = hex::encode(hasher.finalize());

        format!("{}-{}", if name.is_empty() { "repo" } else { &name }, &digest[..12])
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.location, self.reference)
    }
}

/// Release tags of one repository, ascending by version precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSet {
    repository: String,
    tags: Vec<String>,
}

impl TagSet {
    /// Build a tag set from raw `git tag` output lines.
    ///
    /// Lines are trimmed; empty lines and pre-release tags (anything
    /// containing `-`) are dropped; the rest are sorted by version.
    pub fn from_lines<'a>(
        repository: impl Into<String>,
        lines: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut tags: Vec<String> = lines
            .into_iter()
            .map(str::trim)
            .filter(|tag| !tag.is_empty() && !tag.contains('-'))
            .map(str::to_string)
            .collect();
        tags.sort_by(|a, b| compare_tags(a, b));
        tags.dedup();

        Self {
            repository: repository.into(),
            tags,
        }
    }

    /// Repository the tags belong to.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tags in ascending order.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether no tags survived filtering.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Highest tag, or `EmptyTagSet` when there is none.
    pub fn latest(&self) -> Result<&str> {
        self.tags
            .last()
            .map(String::as_str)
            .ok_or_else(|| Error::empty_tag_set(&self.repository))
    }
}

/// Versions present in every compared tag set, ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedVersions {
    repositories: Vec<String>,
    versions: Vec<String>,
}

impl MatchedVersions {
    /// Matched versions in ascending order.
    #[must_use]
    pub fn versions(&self) -> &[String] {
        &self.versions
    }

    /// Repositories that were compared.
    #[must_use]
    pub fn repositories(&self) -> &[String] {
        &self.repositories
    }

    /// Number of matched versions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether the intersection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// The `fanout` highest matched versions, ascending.
    ///
    /// Takes every match when fewer than `fanout` exist. Fails with
    /// `NoMatchingVersions` when nothing matched.
    pub fn select_latest(&self, fanout: usize) -> Result<&[String]> {
        if self.versions.is_empty() {
            return Err(Error::NoMatchingVersions {
                repositories: self.repositories.clone(),
            });
        }
        let start = self.versions.len().saturating_sub(fanout);
        Ok(&self.versions[start..])
    }
}

/// Intersect tag sets, keeping the order of the first one.
#[must_use]
pub fn intersect(tag_sets: &[TagSet]) -> MatchedVersions {
    let repositories = tag_sets.iter().map(|s| s.repository.clone()).collect();

    let Some((first, rest)) = tag_sets.split_first() else {
        return MatchedVersions {
            repositories,
            versions: Vec::new(),
        };
    };

    let others: Vec<HashSet<&str>> = rest
        .iter()
        .map(|set| set.tags.iter().map(String::as_str).collect())
        .collect();

    let mut seen = HashSet::new();
    let versions = first
        .tags
        .iter()
        .filter(|tag| others.iter().all(|other| other.contains(tag.as_str())))
        .filter(|tag| seen.insert(tag.as_str()))
        .cloned()
        .collect();

    MatchedVersions {
        repositories,
        versions,
    }
}

/// Version-control provider used to obtain repositories and their tags.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Clone `repo` into `worktree`, or update an existing clone, at `repo.reference`.
    async fn sync(&self, repo: &RepositoryRef, worktree: &Path) -> Result<()>;

    /// List tags matching `pattern` in `worktree`, sorted by version key.
    async fn list_tags(
        &self,
        repo: &RepositoryRef,
        worktree: &Path,
        pattern: &str,
    ) -> Result<Vec<String>>;
}

/// Fetches release tags, sharing a clone cache between concurrent callers.
pub struct TagFetcher {
    vcs: Arc<dyn VersionControl>,
    cache_dir: PathBuf,
    locks: KeyedLocks,
}

impl TagFetcher {
    /// Create a fetcher keeping clones under `cache_dir`.
    pub fn new(vcs: Arc<dyn VersionControl>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            cache_dir: cache_dir.into(),
            locks: KeyedLocks::new(),
        }
    }

    /// Clone cache root.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Fetch the release tags of `repo`.
    ///
    /// # Errors
    ///
    /// Returns `Fetch` when the repository cannot be synced or its tags
    /// listed, and `Cancelled` when `cancel` fired before the sync started.
    pub async fn fetch_tags(
        &self,
        repo: &RepositoryRef,
        cancel: &CancellationToken,
    ) -> Result<TagSet> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let key = repo.cache_key();
        let worktree = self.cache_dir.join(&key);
        let _guard = self.locks.lock(&key).await;

        // Waiting on the slot may have outlasted a sibling failure.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        info!(repository = %repo, vcs = self.vcs.name(), "Fetching tags");
        self.vcs
            .sync(repo, &worktree)
            .await
            .map_err(|e| as_fetch_error(repo, e))?;

        let raw = self
            .vcs
            .list_tags(repo, &worktree, TAG_PATTERN)
            .await
            .map_err(|e| as_fetch_error(repo, e))?;

        let tags = TagSet::from_lines(&repo.location, raw.iter().map(String::as_str));
        debug!(repository = %repo, count = tags.len(), "Fetched tags");
        Ok(tags)
    }

    /// Fetch the highest release tag of `repo`.
    ///
    /// # Errors
    ///
    /// Same as [`TagFetcher::fetch_tags`], plus `EmptyTagSet` when no release
    /// tag exists.
    pub async fn fetch_latest_tag(
        &self,
        repo: &RepositoryRef,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let tags = self.fetch_tags(repo, cancel).await?;
        let latest = tags.latest()?.to_string();
        debug!(repository = %repo, %latest, "Latest tag");
        Ok(latest)
    }
}

fn as_fetch_error(repo: &RepositoryRef, err: Error) -> Error {
    match err {
        Error::Fetch { .. } | Error::Cancelled => err,
        other => Error::fetch(&repo.location, other.to_string()),
    }
}
