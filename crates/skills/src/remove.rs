use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    confirm::Confirm,
    error::{Error, Result},
    link::remove_symlink,
    registry::RegistryStore,
    types::BundleRecord,
};

#[derive(Debug)]
pub enum RemoveOutcome {
    Removed(BundleRecord),
    Cancelled,
}

/// Deletes an installed bundle: its project links, its stored copy and its
/// registry entry, in that order.
pub struct Remover {
    registry: Arc<RegistryStore>,
}

impl Remover {
    pub fn new(registry: Arc<RegistryStore>) -> Self {
        Self { registry }
    }

    pub async fn remove(&self, name: &str, confirm: &dyn Confirm) -> Result<RemoveOutcome> {
        let record = self.registry.find_by_name(name)?;
        let prompt = format!("Are you sure you want to remove skill '{name}'?");
        if !confirm.confirm(&prompt).await {
            info!(skill = name, "remove cancelled by user");
            return Ok(RemoveOutcome::Cancelled);
        }

        for (project, link) in &record.linked_projects {
            if let Err(e) = remove_symlink(&link.symlink_path) {
                warn!(skill = name, %project, error = %e, "could not remove link");
            }
        }

        match tokio::fs::remove_dir_all(&record.store_path).await {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => {
                return Err(Error::fs("remove directory", &record.store_path, e)
                    .context("remove", name));
            },
        }

        if !self.registry.remove(&record.id)? {
            warn!(skill = name, id = %record.id, "registry entry vanished during remove");
        }
        info!(
            skill = name,
            links = record.linked_projects.len(),
            "removed"
        );
        Ok(RemoveOutcome::Removed(record))
    }
}
