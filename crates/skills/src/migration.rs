//! Folds link records written by older releases into their skill's record.
//!
//! Older releases stored every project link as a registry entry of its own,
//! with `id = "linked-<skill>@<project>"`, `source_url = "linked:<project>"`
//! and `store_path` pointing at the symlink. Current releases keep links in
//! [`BundleRecord::linked_projects`](crate::types::BundleRecord). Running the
//! migration twice is a no-op.

use tracing::{debug, info, warn};

use crate::{
    error::Result,
    registry::RegistryStore,
    types::{BundleRecord, LinkedProject},
};

const LEGACY_ID_PREFIX: &str = "linked-";
const LEGACY_SOURCE_PREFIX: &str = "linked:";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: usize,
}

fn is_legacy(record: &BundleRecord) -> bool {
    record.id.starts_with(LEGACY_ID_PREFIX)
}

/// Splits `linked-<skill>@<project>` into the skill name.
fn legacy_skill_name(id: &str) -> Option<&str> {
    let rest = id.strip_prefix(LEGACY_ID_PREFIX)?;
    let (skill, project) = rest.split_once('@')?;
    (!skill.is_empty() && !project.is_empty()).then_some(skill)
}

/// Number of legacy link entries still present in the registry.
pub fn count_legacy_links(registry: &RegistryStore) -> Result<usize> {
    Ok(registry.load()?.iter().filter(|r| is_legacy(r)).count())
}

/// Rewrites the registry in one locked pass. Entries that cannot be matched
/// to an installed skill stay where they are and count as skipped.
pub fn migrate_legacy_links(registry: &RegistryStore) -> Result<MigrationReport> {
    let report = registry.modify(|records| {
        let mut report = MigrationReport::default();
        let (legacy, mut kept): (Vec<_>, Vec<_>) =
            std::mem::take(records).into_iter().partition(is_legacy);

        for entry in legacy {
            let Some(skill) = legacy_skill_name(&entry.id) else {
                warn!(id = %entry.id, "invalid legacy link id, leaving it in place");
                report.skipped += 1;
                kept.push(entry);
                continue;
            };
            let project = entry
                .source_ref
                .strip_prefix(LEGACY_SOURCE_PREFIX)
                .unwrap_or(&entry.source_ref)
                .to_string();
            let Some(slot) = kept.iter().position(|r| !is_legacy(r) && r.name == skill) else {
                warn!(id = %entry.id, skill, "original skill not found, leaving legacy link");
                report.skipped += 1;
                kept.push(entry);
                continue;
            };
            debug!(skill, %project, "migrating legacy link");
            kept[slot].linked_projects.insert(project, LinkedProject {
                symlink_path: entry.store_path,
                linked_at: entry.updated_at,
            });
            report.migrated += 1;
        }

        *records = kept;
        Ok(report)
    })?;

    if report.migrated > 0 || report.skipped > 0 {
        info!(
            migrated = report.migrated,
            skipped = report.skipped,
            "legacy link migration finished"
        );
    }
    Ok(report)
}
