//! Concurrent download of a remote directory tree with atomic promotion.
//!
//! The tree is fetched into a staging directory beside the destination by a
//! bounded pool of "expand directory" tasks. A single coordinator loop owns
//! the counters, schedules subdirectories as they are discovered, and keeps
//! the first error. Only when every task has succeeded is the staging
//! directory renamed over the destination.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    tokio::{sync::Semaphore, task::JoinSet},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use crate::{
    client::RemoteTreeClient,
    error::{Error, Result},
    pool::acquire,
    source::SourceRef,
    types::{EntryKind, MaterializeStats},
};

pub const DEFAULT_CONCURRENCY: usize = 3;

pub struct Materializer {
    client: Arc<dyn RemoteTreeClient>,
    concurrency: usize,
}

/// Everything one directory task produced.
#[derive(Default)]
struct DirOutcome {
    files: usize,
    dirs: usize,
    bytes: u64,
    /// `(remote path, local path)` of subdirectories still to expand.
    pending: Vec<(String, PathBuf)>,
}

/// Shared, read-only inputs of every directory task.
struct TaskContext {
    client: Arc<dyn RemoteTreeClient>,
    source: SourceRef,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Materializer {
    pub fn new(client: Arc<dyn RemoteTreeClient>, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
        }
    }

    pub fn client(&self) -> &Arc<dyn RemoteTreeClient> {
        &self.client
    }

    /// Fetch `remote_path` of `source` and atomically place it at `destination`.
    ///
    /// On failure the destination is left exactly as it was and the staging
    /// directory is removed. The caller must ensure `remote_path` exists.
    pub async fn materialize(
        &self,
        source: &SourceRef,
        remote_path: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<MaterializeStats> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let staging = staging_path(destination, "staging")?;
        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::fs("create directory", parent, e))?;
        }
        tokio::fs::create_dir(&staging)
            .await
            .map_err(|e| Error::fs("create staging directory", &staging, e))?;
        debug!(staging = %staging.display(), remote_path, "staging created");

        let fetched = self.fetch_tree(source, remote_path, &staging, cancel).await;
        let result = match fetched {
            Ok(stats) if cancel.is_cancelled() => {
                debug!(files = stats.files, "fetch finished after cancellation, discarding");
                Err(Error::Cancelled)
            },
            Ok(stats) => promote(&staging, destination).await.map(|()| stats),
            Err(e) => Err(e),
        };

        match result {
            Ok(stats) => {
                info!(
                    destination = %destination.display(),
                    files = stats.files,
                    dirs = stats.dirs,
                    bytes = stats.bytes,
                    "materialized"
                );
                Ok(stats)
            },
            Err(e) => {
                remove_best_effort(&staging).await;
                Err(e)
            },
        }
    }

    async fn fetch_tree(
        &self,
        source: &SourceRef,
        remote_path: &str,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<MaterializeStats> {
        let ctx = Arc::new(TaskContext {
            client: Arc::clone(&self.client),
            source: source.clone(),
            permits: Arc::new(Semaphore::new(self.concurrency)),
            cancel: cancel.child_token(),
        });

        let mut tasks = JoinSet::new();
        tasks.spawn(expand_dir(
            Arc::clone(&ctx),
            remote_path.trim_matches('/').to_string(),
            staging.to_path_buf(),
        ));

        let mut stats = MaterializeStats::default();
        let mut first_error: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Err(Error::Cancelled),
            };
            match outcome {
                Ok(done) => {
                    stats.files += done.files;
                    stats.dirs += done.dirs;
                    stats.bytes += done.bytes;
                    if first_error.is_none() {
                        for (remote, local) in done.pending {
                            tasks.spawn(expand_dir(Arc::clone(&ctx), remote, local));
                        }
                    }
                },
                Err(e) if first_error.is_none() => {
                    debug!(error = %e, "materialize task failed, cancelling siblings");
                    ctx.cancel.cancel();
                    first_error = Some(e);
                },
                Err(e) => debug!(error = %e, "discarding error after cancellation"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

/// List one remote directory, write its files, create its subdirectories.
async fn expand_dir(ctx: Arc<TaskContext>, remote: String, local: PathBuf) -> Result<DirOutcome> {
    let _permit = acquire(&ctx.permits, &ctx.cancel).await?;
    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let entries = ctx
        .client
        .list_children(&ctx.source, &remote, &ctx.cancel)
        .await?;
    let mut out = DirOutcome::default();
    for entry in entries {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let name = safe_entry_name(&entry.name)?;
        let target = local.join(name);
        match entry.kind {
            EntryKind::Dir => {
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|e| Error::fs("create directory", &target, e))?;
                out.dirs += 1;
                let child_remote = if entry.path.is_empty() {
                    format!("{remote}/{name}")
                } else {
                    entry.path
                };
                out.pending.push((child_remote, target));
            },
            EntryKind::File => {
                let locator = entry.download_url.as_deref().ok_or_else(|| {
                    Error::parse(
                        format!("entry '{}'", entry.path),
                        "file has no download URL",
                    )
                })?;
                let bytes = ctx.client.fetch_raw(locator, &ctx.cancel).await?;
                if ctx.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                tokio::fs::write(&target, &bytes)
                    .await
                    .map_err(|e| Error::fs("write", &target, e))?;
                out.files += 1;
                out.bytes += bytes.len() as u64;
            },
            EntryKind::Other => {
                debug!(path = %entry.path, "skipping entry that is neither file nor directory");
            },
        }
    }
    Ok(out)
}

/// Remote names become single local path components; anything that could
/// escape the staging directory is refused.
fn safe_entry_name(name: &str) -> Result<&str> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(Error::parse(
            "remote listing",
            format!("unsafe entry name '{name}'"),
        ));
    }
    Ok(name)
}

/// `<parent>/.<name>.<tag>-<uuid>`, beside `destination`.
fn staging_path(destination: &Path, tag: &str) -> Result<PathBuf> {
    let name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::invalid_input(format!(
                "destination {} has no file name",
                destination.display()
            ))
        })?;
    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!(".{name}.{tag}-{}", Uuid::new_v4().simple())))
}

/// Move `staging` into place. An existing destination is first renamed aside
/// and restored if the final rename fails.
async fn promote(staging: &Path, destination: &Path) -> Result<()> {
    let backup = match tokio::fs::symlink_metadata(destination).await {
        Ok(_) => {
            let backup = staging_path(destination, "old")?;
            tokio::fs::rename(destination, &backup)
                .await
                .map_err(|e| Error::fs("move aside", destination, e))?;
            Some(backup)
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(Error::fs("inspect", destination, e)),
    };

    if let Err(e) = tokio::fs::rename(staging, destination).await {
        if let Some(backup) = &backup
            && let Err(restore) = tokio::fs::rename(backup, destination).await
        {
            warn!(
                backup = %backup.display(),
                error = %restore,
                "failed to restore previous content"
            );
        }
        return Err(Error::fs("promote staging to", destination, e));
    }

    if let Some(backup) = backup {
        remove_best_effort(&backup).await;
    }
    Ok(())
}

/// Remove a file, symlink or directory tree, logging instead of failing.
pub(crate) async fn remove_best_effort(path: &Path) {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "cleanup failed");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{error::ErrorKind, memory::MemoryTree, types::RemoteEntry},
        async_trait::async_trait,
        std::{
            sync::atomic::{AtomicUsize, Ordering},
            time::Duration,
        },
    };

    fn source() -> SourceRef {
        SourceRef::parse("https://github.com/o/r/tree/main/skills/demo").unwrap()
    }

    fn demo_tree() -> MemoryTree {
        MemoryTree::new()
            .with_file("skills/demo/SKILL.md", "# demo\n")
            .with_file("skills/demo/lib/a.txt", "aaaa")
            .with_file("skills/demo/lib/deep/b.txt", "bb")
            .with_file("skills/demo/assets/logo.svg", "<svg/>")
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with('.'))
            .collect()
    }

    #[tokio::test]
    async fn counts_match_remote_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("store").join("demo");
        let m = Materializer::new(Arc::new(demo_tree()), 3);

        let stats = m
            .materialize(&source(), "skills/demo", &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats, MaterializeStats {
            files: 4,
            dirs: 3,
            bytes: 7 + 4 + 2 + 6,
        });
        assert_eq!(
            std::fs::read_to_string(dest.join("lib/deep/b.txt")).unwrap(),
            "bb"
        );
        assert!(dest.join("assets").is_dir());
        assert!(leftovers(dest.parent().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn empty_directory_succeeds_with_zero_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("empty");
        let tree = MemoryTree::new();
        tree.insert_dir("skills/empty");
        let m = Materializer::new(Arc::new(tree), 3);

        let stats = m
            .materialize(&source(), "skills/empty", &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats, MaterializeStats::default());
        assert!(dest.is_dir());
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failure_leaves_destination_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("demo");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("SKILL.md"), "old").unwrap();

        let tree = demo_tree();
        tree.fail_fetch("skills/demo/lib/deep/b.txt");
        let m = Materializer::new(Arc::new(tree), 2);

        let err = m
            .materialize(&source(), "skills/demo", &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(std::fs::read_to_string(dest.join("SKILL.md")).unwrap(), "old");
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 1);
        assert!(leftovers(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn success_replaces_previous_content() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("demo");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), "gone soon").unwrap();

        let m = Materializer::new(Arc::new(demo_tree()), 3);
        m.materialize(&source(), "skills/demo", &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!dest.join("stale.txt").exists());
        assert!(dest.join("SKILL.md").is_file());
        assert!(leftovers(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_start_does_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("demo");
        let tree = Arc::new(demo_tree());
        let m = Materializer::new(Arc::clone(&tree) as Arc<dyn RemoteTreeClient>, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = m
            .materialize(&source(), "skills/demo", &dest, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!dest.exists());
        assert_eq!(tree.fetch_count(), 0);
        assert!(leftovers(tmp.path()).is_empty());
    }

    /// Wraps a tree and records the peak number of concurrent listings.
    struct Gauge {
        inner: MemoryTree,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl RemoteTreeClient for Gauge {
        async fn list_children(
            &self,
            source: &SourceRef,
            path: &str,
            cancel: &CancellationToken,
        ) -> Result<Vec<RemoteEntry>> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let out = self.inner.list_children(source, path, cancel).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            out
        }

        async fn fetch_raw(&self, locator: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
            self.inner.fetch_raw(locator, cancel).await
        }

        async fn latest_revision(
            &self,
            source: &SourceRef,
            cancel: &CancellationToken,
        ) -> Result<String> {
            self.inner.latest_revision(source, cancel).await
        }

        async fn path_exists(
            &self,
            source: &SourceRef,
            path: &str,
            cancel: &CancellationToken,
        ) -> Result<bool> {
            self.inner.path_exists(source, path, cancel).await
        }
    }

    /// Wraps a tree and cancels `cancel` once `after` files were delivered.
    struct CancelAfter {
        inner: MemoryTree,
        cancel: CancellationToken,
        after: usize,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl RemoteTreeClient for CancelAfter {
        async fn list_children(
            &self,
            source: &SourceRef,
            path: &str,
            cancel: &CancellationToken,
        ) -> Result<Vec<RemoteEntry>> {
            self.inner.list_children(source, path, cancel).await
        }

        async fn fetch_raw(&self, locator: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
            let bytes = self.inner.fetch_raw(locator, cancel).await?;
            if self.delivered.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
                self.cancel.cancel();
            }
            Ok(bytes)
        }

        async fn latest_revision(
            &self,
            source: &SourceRef,
            cancel: &CancellationToken,
        ) -> Result<String> {
            self.inner.latest_revision(source, cancel).await
        }

        async fn path_exists(
            &self,
            source: &SourceRef,
            path: &str,
            cancel: &CancellationToken,
        ) -> Result<bool> {
            self.inner.path_exists(source, path, cancel).await
        }
    }

    #[tokio::test]
    async fn cancelled_mid_download_keeps_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("demo");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("SKILL.md"), "old").unwrap();

        let tree = MemoryTree::new().with_file("skills/demo/SKILL.md", "# demo\n");
        for i in 0..6 {
            tree.insert_file(&format!("skills/demo/d{i}/one.txt"), "1");
            tree.insert_file(&format!("skills/demo/d{i}/two.txt"), "2");
        }
        let cancel = CancellationToken::new();
        let client = Arc::new(CancelAfter {
            inner: tree,
            cancel: cancel.clone(),
            after: 2,
            delivered: AtomicUsize::new(0),
        });
        let m = Materializer::new(Arc::clone(&client) as Arc<dyn RemoteTreeClient>, 2);

        let err = m
            .materialize(&source(), "skills/demo", &dest, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        // At most one in-flight fetch per pool slot lands after the cancel.
        let delivered = client.delivered.load(Ordering::SeqCst);
        assert!((2..=4).contains(&delivered), "{delivered}");
        assert_eq!(std::fs::read_to_string(dest.join("SKILL.md")).unwrap(), "old");
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 1);
        assert!(leftovers(tmp.path()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_bounds_concurrent_listings() {
        let tree = MemoryTree::new();
        for i in 0..12 {
            tree.insert_file(&format!("skills/wide/d{i}/f.txt"), "x");
        }
        let gauge = Arc::new(Gauge {
            inner: tree,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let tmp = tempfile::tempdir().unwrap();
        let m = Materializer::new(Arc::clone(&gauge) as Arc<dyn RemoteTreeClient>, 2);

        let stats = m
            .materialize(
                &source(),
                "skills/wide",
                &tmp.path().join("wide"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(stats.files, 12);
        assert_eq!(stats.dirs, 12);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn unsafe_names_are_refused() {
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(safe_entry_name(bad).is_err(), "{bad:?}");
        }
        assert_eq!(safe_entry_name("SKILL.md").unwrap(), "SKILL.md");
        assert_eq!(safe_entry_name(".hidden").unwrap(), ".hidden");
    }

    #[test]
    fn staging_lives_beside_destination() {
        let p = staging_path(Path::new("/data/skills/demo"), "staging").unwrap();
        assert_eq!(p.parent().unwrap(), Path::new("/data/skills"));
        let name = p.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".demo.staging-"));
    }
}
