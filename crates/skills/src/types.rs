use std::{collections::BTreeMap, path::PathBuf};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

// ── Registry records ─────────────────────────────────────────────────────────

/// One installed bundle, as persisted in `skills.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRecord {
    /// Stable key derived from the source coordinates, e.g. `owner/repo/skills/demo@main`.
    pub id: String,
    /// Human-readable name, also the link name inside projects.
    pub name: String,
    /// Canonical `https://github.com/<owner>/<repo>/tree/<branch>/<path>` locator.
    #[serde(rename = "source_url")]
    pub source_ref: String,
    /// Commit SHA of the tracked branch at the last successful fetch.
    #[serde(default, alias = "commit_sha", alias = "version")]
    pub revision: String,
    pub store_path: PathBuf,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Absolute project path to link details.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub linked_projects: BTreeMap<String, LinkedProject>,
}

impl BundleRecord {
    pub fn is_linked(&self) -> bool {
        !self.linked_projects.is_empty()
    }

    /// Short form of the revision for display.
    pub fn short_revision(&self) -> &str {
        short_sha(&self.revision)
    }
}

/// Where a bundle is linked inside one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedProject {
    pub symlink_path: PathBuf,
    pub linked_at: DateTime<Utc>,
}

pub fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

// ── Remote tree ──────────────────────────────────────────────────────────────

/// Node type reported by the contents API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    /// Symlinks and submodules; never materialized.
    #[serde(other)]
    Other,
}

/// One child of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    /// Path from the repository root.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub download_url: Option<String>,
}

/// Counters for one materialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeStats {
    pub files: usize,
    pub dirs: usize,
    pub bytes: u64,
}
