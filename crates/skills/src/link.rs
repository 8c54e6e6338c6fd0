use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    chrono::{DateTime, Utc},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    error::{Error, Result},
    registry::RegistryStore,
    types::{BundleRecord, LinkedProject},
};

/// Link namespace inside a consumer project.
pub const DEFAULT_LINK_DIR: &str = ".opencode/skills";

/// One row of [`LinkInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub project: String,
    pub symlink_path: PathBuf,
    pub linked_at: DateTime<Utc>,
    /// Whether something still exists at `symlink_path`.
    pub present: bool,
}

#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub record: BundleRecord,
    /// Sorted by project path.
    pub links: Vec<LinkStatus>,
}

/// Creates and removes project symlinks and keeps `linked_projects` in sync.
pub struct Linker {
    registry: Arc<RegistryStore>,
    link_dir: PathBuf,
}

impl Linker {
    pub fn new(registry: Arc<RegistryStore>, link_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            link_dir: link_dir.into(),
        }
    }

    pub fn link_dir(&self) -> &Path {
        &self.link_dir
    }

    /// `<project>/<link_dir>/<name>`
    pub fn link_path(&self, project: &Path, name: &str) -> PathBuf {
        project.join(&self.link_dir).join(name)
    }

    /// Symlink the bundle's store path into `project` and record the link.
    ///
    /// Returns the symlink path. An existing entry at that path is never
    /// replaced. If recording fails the new symlink is removed again.
    pub fn link(&self, name: &str, project: &Path, cancel: &CancellationToken) -> Result<PathBuf> {
        self.link_and_record(name, project, cancel, |id, key, entry| {
            self.registry.update_with(id, |r| {
                r.linked_projects.insert(key, entry);
            })
        })
    }

    /// Body of [`Linker::link`] with the registry write supplied by `record_link`.
    fn link_and_record(
        &self,
        name: &str,
        project: &Path,
        cancel: &CancellationToken,
        record_link: impl FnOnce(&str, String, LinkedProject) -> Result<()>,
    ) -> Result<PathBuf> {
        if name.trim().is_empty() {
            return Err(Error::invalid_input("skill name cannot be empty"));
        }
        let project = absolute_project(project)?;
        check_cancel(cancel)?;

        let record = self.registry.find_by_name(name)?;
        match std::fs::metadata(&record.store_path) {
            Ok(meta) if meta.is_dir() => {},
            Ok(_) => {
                return Err(Error::conflict(format!(
                    "store path {} of '{name}' is not a directory",
                    record.store_path.display()
                )));
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!(
                    "store directory {} of '{name}'",
                    record.store_path.display()
                )));
            },
            Err(e) => return Err(Error::fs("inspect", &record.store_path, e)),
        }

        let link = self.link_path(&project, &record.name);
        match std::fs::symlink_metadata(&link) {
            Ok(_) => {
                return Err(Error::conflict(format!(
                    "skill '{name}' is already linked in project '{}' ({} exists)",
                    project.display(),
                    link.display()
                )));
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(Error::fs("inspect", &link, e)),
        }
        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::fs("create directory", parent, e))?;
        }
        check_cancel(cancel)?;

        create_symlink(&record.store_path, &link)
            .map_err(|e| Error::fs("create symlink", &link, e))?;

        let key = project_key(&project);
        let entry = LinkedProject {
            symlink_path: link.clone(),
            linked_at: Utc::now(),
        };
        if let Err(e) = record_link(&record.id, key, entry) {
            if let Err(rollback) = std::fs::remove_file(&link) {
                warn!(
                    path = %link.display(),
                    error = %rollback,
                    "failed to remove symlink after registry update failed"
                );
            }
            return Err(e.context("link", name.to_string()));
        }

        info!(skill = name, project = %project.display(), link = %link.display(), "linked");
        Ok(link)
    }

    /// Remove the recorded symlink for `project` and forget the link.
    pub fn unlink(&self, name: &str, project: &Path) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::invalid_input("skill name cannot be empty"));
        }
        let project = absolute_project_path(project)?;
        let key = project_key(&project);

        let record = self.registry.find_by_name(name)?;
        let Some(linked) = record.linked_projects.get(&key) else {
            return Err(Error::not_found(format!(
                "link of skill '{name}' in project '{key}'"
            )));
        };

        remove_symlink(&linked.symlink_path)?;
        self.registry.update_with(&record.id, |r| {
            r.linked_projects.remove(&key);
        })?;

        info!(skill = name, project = %key, "unlinked");
        Ok(())
    }

    /// The record plus the state of each recorded link.
    pub fn link_info(&self, name: &str) -> Result<LinkInfo> {
        let record = self.registry.find_by_name(name)?;
        let links = record
            .linked_projects
            .iter()
            .map(|(project, linked)| LinkStatus {
                project: project.clone(),
                symlink_path: linked.symlink_path.clone(),
                linked_at: linked.linked_at,
                present: std::fs::symlink_metadata(&linked.symlink_path).is_ok(),
            })
            .collect();
        Ok(LinkInfo { record, links })
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Absolute form of `project` without requiring it to exist.
fn absolute_project_path(project: &Path) -> Result<PathBuf> {
    if project.as_os_str().is_empty() {
        return Err(Error::invalid_input("project path cannot be empty"));
    }
    std::path::absolute(project).map_err(|e| Error::fs("resolve", project, e))
}

/// Absolute form of `project`, which must be an existing directory.
fn absolute_project(project: &Path) -> Result<PathBuf> {
    let abs = absolute_project_path(project)?;
    match std::fs::metadata(&abs) {
        Ok(meta) if meta.is_dir() => Ok(abs),
        Ok(_) => Err(Error::invalid_input(format!(
            "project path '{}' is not a directory",
            abs.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found(format!(
            "project path '{}'",
            abs.display()
        ))),
        Err(e) => Err(Error::fs("inspect", abs, e)),
    }
}

pub(crate) fn project_key(project: &Path) -> String {
    project.to_string_lossy().into_owned()
}

/// Delete `path` if it is a symlink. A missing path is fine; anything else
/// at that path is left alone and reported.
pub(crate) fn remove_symlink(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            std::fs::remove_file(path).map_err(|e| Error::fs("remove symlink", path, e))
        },
        Ok(_) => Err(Error::conflict(format!(
            "{} is not a symlink, refusing to remove it",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::fs("inspect", path, e)),
    }
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
