//! In-memory [`RemoteTreeClient`], for tests and offline use.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use {async_trait::async_trait, tokio_util::sync::CancellationToken};

use crate::{
    client::RemoteTreeClient,
    error::{Error, Result},
    source::SourceRef,
    types::{EntryKind, RemoteEntry},
};

const LOCATOR_SCHEME: &str = "memory://";

/// A single repository tree held in memory.
///
/// Repository coordinates of the [`SourceRef`] are ignored: every source sees
/// the same files and the same revision.
#[derive(Debug, Default)]
pub struct MemoryTree {
    state: Mutex<TreeState>,
    fetches: AtomicUsize,
}

#[derive(Debug, Default)]
struct TreeState {
    files: BTreeMap<String, Vec<u8>>,
    empty_dirs: BTreeSet<String>,
    failing: BTreeSet<String>,
    revision: String,
}

fn clean(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_file(self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.insert_file(path, content);
        self
    }

    #[must_use]
    pub fn with_revision(self, revision: &str) -> Self {
        self.set_revision(revision);
        self
    }

    fn state(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.state().files.insert(clean(path), content.into());
    }

    pub fn insert_dir(&self, path: &str) {
        self.state().empty_dirs.insert(clean(path));
    }

    /// Drop every file and directory at or below `path`.
    pub fn remove_tree(&self, path: &str) {
        let path = clean(path);
        let prefix = format!("{path}/");
        let mut state = self.state();
        state
            .files
            .retain(|p, _| p != &path && !p.starts_with(&prefix));
        state
            .empty_dirs
            .retain(|p| p != &path && !p.starts_with(&prefix));
    }

    pub fn set_revision(&self, revision: &str) {
        self.state().revision = revision.to_string();
    }

    /// Make downloads of `path` fail with a server error.
    pub fn fail_fetch(&self, path: &str) {
        self.state().failing.insert(clean(path));
    }

    /// Number of `fetch_raw` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn is_dir(state: &TreeState, path: &str) -> bool {
        let prefix = format!("{path}/");
        state.empty_dirs.contains(path)
            || state.files.keys().any(|p| p.starts_with(&prefix))
            || state.empty_dirs.iter().any(|p| p.starts_with(&prefix))
    }
}

#[async_trait]
impl RemoteTreeClient for MemoryTree {
    async fn list_children(
        &self,
        _source: &SourceRef,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteEntry>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let path = clean(path);
        let state = self.state();
        if !Self::is_dir(&state, &path) {
            return Err(Error::not_found(format!("remote path {path}")));
        }

        let prefix = format!("{path}/");
        let mut children: BTreeMap<String, RemoteEntry> = BTreeMap::new();
        let file_paths = state.files.iter().map(|(p, c)| (p, Some(c.len() as u64)));
        let dir_paths = state.empty_dirs.iter().map(|p| (p, None));
        for (full, size) in file_paths.chain(dir_paths) {
            let Some(rest) = full.strip_prefix(&prefix) else {
                continue;
            };
            let (name, nested) = match rest.split_once('/') {
                Some((name, _)) => (name, true),
                None => (rest, size.is_none()),
            };
            let child_path = format!("{prefix}{name}");
            let entry = if nested {
                RemoteEntry {
                    name: name.to_string(),
                    path: child_path,
                    kind: EntryKind::Dir,
                    size: 0,
                    download_url: None,
                }
            } else {
                RemoteEntry {
                    name: name.to_string(),
                    download_url: Some(format!("{LOCATOR_SCHEME}{child_path}")),
                    path: child_path,
                    kind: EntryKind::File,
                    size: size.unwrap_or_default(),
                }
            };
            children.entry(name.to_string()).or_insert(entry);
        }
        Ok(children.into_values().collect())
    }

    async fn fetch_raw(&self, locator: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let path = locator
            .strip_prefix(LOCATOR_SCHEME)
            .ok_or_else(|| Error::invalid_input(format!("not a memory locator: {locator}")))?;
        let state = self.state();
        if state.failing.contains(path) {
            return Err(Error::Http {
                url: locator.to_string(),
                status: 500,
            });
        }
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("remote file {path}")))
    }

    async fn latest_revision(
        &self,
        _source: &SourceRef,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.state().revision.clone())
    }

    async fn path_exists(
        &self,
        _source: &SourceRef,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let path = clean(path);
        let state = self.state();
        Ok(state.files.contains_key(&path) || Self::is_dir(&state, &path))
    }
}
