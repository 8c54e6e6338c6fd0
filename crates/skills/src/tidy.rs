//! Reconciliation of registry links against the filesystem.
//!
//! Phase one drops `linked_projects` entries whose symlink is gone. Phase two
//! walks the link directory of every project seen in phase one and deletes
//! symlinks that do not point at the store path of a registered bundle with
//! the same name.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use {
    tokio::{sync::Semaphore, task::JoinSet},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    pool::{acquire, collect_indexed},
    registry::RegistryStore,
};

pub const DEFAULT_CONCURRENCY: usize = 10;

/// Something tidy could not check or fix. The run continues past it.
#[derive(Debug)]
pub struct TidyIssue {
    pub path: PathBuf,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct TidyReport {
    pub stale_registry_entries: usize,
    pub orphaned_symlinks: usize,
    /// Every registered record, linked or not.
    pub skills_checked: usize,
    pub projects_scanned: usize,
    pub issues: Vec<TidyIssue>,
}

pub struct Tidier {
    registry: Arc<RegistryStore>,
    link_dir: PathBuf,
    concurrency: usize,
}

/// A recorded link to verify in phase one.
struct LinkCheck {
    id: String,
    project: String,
    symlink: PathBuf,
}

enum LinkState {
    Present,
    Missing,
    Unknown(Error),
}

impl Tidier {
    pub fn new(registry: Arc<RegistryStore>, link_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            link_dir: link_dir.into(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn tidy(&self, cancel: &CancellationToken) -> Result<TidyReport> {
        let records = self.registry.load()?;
        let mut report = TidyReport {
            skills_checked: records.len(),
            ..TidyReport::default()
        };

        let mut checks = Vec::new();
        let mut projects = BTreeSet::new();
        for record in records.iter().filter(|r| r.is_linked()) {
            for (project, linked) in &record.linked_projects {
                projects.insert(PathBuf::from(project));
                checks.push(LinkCheck {
                    id: record.id.clone(),
                    project: project.clone(),
                    symlink: linked.symlink_path.clone(),
                });
            }
        }

        report.stale_registry_entries = self.prune_stale(checks, &mut report.issues, cancel).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        report.projects_scanned = projects.len();
        report.orphaned_symlinks = self
            .remove_orphans(projects, &mut report.issues, cancel)
            .await?;

        info!(
            stale = report.stale_registry_entries,
            orphaned = report.orphaned_symlinks,
            skills = report.skills_checked,
            projects = report.projects_scanned,
            issues = report.issues.len(),
            "tidy finished"
        );
        Ok(report)
    }

    /// Phase one. Returns the number of entries removed from the registry.
    async fn prune_stale(
        &self,
        checks: Vec<LinkCheck>,
        issues: &mut Vec<TidyIssue>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (index, check) in checks.into_iter().enumerate() {
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let state = match acquire(&permits, &cancel).await {
                    Ok(_permit) => match tokio::fs::symlink_metadata(&check.symlink).await {
                        Ok(_) => LinkState::Present,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => LinkState::Missing,
                        Err(e) => LinkState::Unknown(Error::fs("inspect", &check.symlink, e)),
                    },
                    Err(e) => LinkState::Unknown(e),
                };
                (index, (check, state))
            });
        }
        let results = collect_indexed(&mut tasks).await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut stale: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (_, (check, state)) in results {
            match state {
                LinkState::Present => {},
                LinkState::Missing => {
                    debug!(link = %check.symlink.display(), project = %check.project, "stale link entry");
                    stale.entry(check.id).or_default().push(check.project);
                },
                LinkState::Unknown(error) => issues.push(TidyIssue {
                    path: check.symlink,
                    error,
                }),
            }
        }

        let mut removed = 0;
        for (id, gone) in stale {
            let outcome = self
                .registry
                .update_with_blocking(&id, move |record| {
                    gone.iter()
                        .filter(|project| record.linked_projects.remove(*project).is_some())
                        .count()
                })
                .await;
            match outcome {
                Ok(count) => removed += count,
                Err(error) => {
                    warn!(id = %id, error = %error, "could not prune stale links");
                    issues.push(TidyIssue {
                        path: self.registry.path().to_path_buf(),
                        error,
                    });
                },
            }
        }
        Ok(removed)
    }

    /// Phase two. Returns the number of symlinks deleted.
    async fn remove_orphans(
        &self,
        projects: BTreeSet<PathBuf>,
        issues: &mut Vec<TidyIssue>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut owners: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for record in self.registry.load()? {
            owners
                .entry(record.name)
                .or_default()
                .push(normalize(&record.store_path));
        }
        let owners = Arc::new(owners);

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (index, project) in projects.into_iter().enumerate() {
            let dir = project.join(&self.link_dir);
            let owners = Arc::clone(&owners);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let scanned = match acquire(&permits, &cancel).await {
                    Ok(_permit) => scan_link_dir(&dir, &owners, &cancel).await,
                    Err(e) => Err(e),
                };
                (index, (dir, scanned))
            });
        }

        let mut removed = 0;
        for (_, (dir, scanned)) in collect_indexed(&mut tasks).await {
            match scanned {
                Ok((count, mut found)) => {
                    removed += count;
                    issues.append(&mut found);
                },
                Err(e) if e.is_cancelled() => {},
                Err(error) => issues.push(TidyIssue { path: dir, error }),
            }
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(removed)
    }
}

/// Delete orphaned symlinks directly inside `dir`. Non-symlinks are ignored.
async fn scan_link_dir(
    dir: &Path,
    owners: &HashMap<String, Vec<PathBuf>>,
    cancel: &CancellationToken,
) -> Result<(usize, Vec<TidyIssue>)> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, Vec::new())),
        Err(e) => return Err(Error::fs("read directory", dir, e)),
    };

    let mut removed = 0;
    let mut issues = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(Error::fs("read directory", dir, e)),
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let path = entry.path();
        let is_symlink = match entry.file_type().await {
            Ok(ft) => ft.is_symlink(),
            Err(e) => {
                issues.push(TidyIssue {
                    error: Error::fs("inspect", &path, e),
                    path,
                });
                continue;
            },
        };
        if !is_symlink {
            continue;
        }
        let target = match tokio::fs::read_link(&path).await {
            Ok(target) => resolve_link_target(&path, &target),
            Err(e) => {
                issues.push(TidyIssue {
                    error: Error::fs("read symlink", &path, e),
                    path,
                });
                continue;
            },
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        let owned = owners
            .get(&name)
            .is_some_and(|stores| stores.iter().any(|s| *s == target));
        if owned {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(link = %path.display(), target = %target.display(), "removed orphaned symlink");
                removed += 1;
            },
            Err(e) => issues.push(TidyIssue {
                error: Error::fs("remove symlink", &path, e),
                path,
            }),
        }
    }
    Ok((removed, issues))
}

/// Absolute, lexically normalized target of the symlink at `link`. Relative
/// targets are taken relative to the directory holding the link.
pub(crate) fn resolve_link_target(link: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        return normalize(target);
    }
    let base = link.parent().unwrap_or_else(|| Path::new(""));
    normalize(&base.join(target))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}
