use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {chrono::Utc, tokio_util::sync::CancellationToken, tracing::info};

use crate::{
    confirm::Confirm,
    error::{Error, Result},
    materialize::Materializer,
    parse,
    registry::RegistryStore,
    source::SourceRef,
    types::{BundleRecord, MaterializeStats},
};

const SKILL_FILE: &str = "SKILL.md";

#[derive(Debug)]
pub enum InstallOutcome {
    Installed {
        record: BundleRecord,
        stats: MaterializeStats,
    },
    /// The user declined to overwrite an existing installation.
    Cancelled,
}

/// Fetches a skill directory from GitHub into `<store_dir>/<name>` and
/// registers it.
pub struct Installer {
    materializer: Arc<Materializer>,
    registry: Arc<RegistryStore>,
    store_dir: PathBuf,
}

impl Installer {
    pub fn new(
        materializer: Arc<Materializer>,
        registry: Arc<RegistryStore>,
        store_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            materializer,
            registry,
            store_dir: store_dir.into(),
        }
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub async fn install(
        &self,
        url: &str,
        confirm: &dyn Confirm,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome> {
        let source = SourceRef::parse(url)?;
        let name = source.bundle_name().to_string();
        self.install_source(&source, confirm, cancel)
            .await
            .map_err(|e| e.context("install", name))
    }

    async fn install_source(
        &self,
        source: &SourceRef,
        confirm: &dyn Confirm,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome> {
        let client = self.materializer.client();
        let name = source.bundle_name();
        let id = source.bundle_id();

        // An empty or wrong path would otherwise "succeed" with nothing in it.
        if !client
            .path_exists(source, &source.child_path(SKILL_FILE), cancel)
            .await?
        {
            return Err(Error::not_found(format!(
                "valid skill package ({SKILL_FILE}) at {}",
                source.canonical_url()
            )));
        }

        let destination = self.store_dir.join(name);
        let previous = self.registry.find_by_id(&id)?;
        if let Some(owner) = self
            .registry
            .load()?
            .into_iter()
            .find(|r| r.id != id && r.store_path == destination)
        {
            return Err(Error::conflict(format!(
                "{} already holds '{}' from {}",
                destination.display(),
                owner.name,
                owner.source_ref
            )));
        }

        if destination.exists() {
            let prompt = format!(
                "Skill '{name}' already exists at {}. Overwrite?",
                destination.display()
            );
            if !confirm.confirm(&prompt).await {
                info!(skill = name, "install cancelled by user");
                return Ok(InstallOutcome::Cancelled);
            }
        }

        let revision = client.latest_revision(source, cancel).await?;
        let stats = self
            .materializer
            .materialize(source, &source.path, &destination, cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let description = tokio::fs::read_to_string(destination.join(SKILL_FILE))
            .await
            .ok()
            .and_then(|content| parse::description(&content));
        let record = BundleRecord {
            id,
            name: name.to_string(),
            source_ref: source.canonical_url(),
            revision,
            store_path: destination,
            updated_at: Utc::now(),
            description,
            linked_projects: previous.map(|p| p.linked_projects).unwrap_or_default(),
        };
        self.registry.upsert(record.clone())?;

        info!(
            skill = name,
            revision = %record.short_revision(),
            files = stats.files,
            dirs = stats.dirs,
            bytes = stats.bytes,
            "installed"
        );
        Ok(InstallOutcome::Installed { record, stats })
    }
}
