//! GitHub source references: `https://github.com/<owner>/<repo>/tree/<branch>/<path>`.

use std::fmt;

use url::Url;

use crate::error::{Error, Result};

const TREE_HINT: &str = "use format: https://github.com/owner/repo/tree/branch/path";

/// Coordinates of a bundle inside a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Directory inside the repository, without leading or trailing slash.
    pub path: String,
}

impl SourceRef {
    /// Parse a GitHub tree URL. Branch and path are both required.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::invalid_input("source URL cannot be empty"));
        }
        let url = Url::parse(raw)
            .map_err(|e| Error::invalid_input(format!("invalid URL '{raw}': {e}")))?;
        if url.host_str() != Some("github.com") {
            return Err(Error::invalid_input(format!(
                "only GitHub URLs are supported: '{raw}'"
            )));
        }

        let parts: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        if parts.len() < 2 {
            return Err(Error::invalid_input(format!(
                "invalid GitHub URL '{raw}': expected owner and repository"
            )));
        }
        if parts.len() < 4 || parts[2] != "tree" {
            return Err(Error::invalid_input(format!(
                "branch must be specified in URL ({TREE_HINT})"
            )));
        }
        if parts.len() == 4 {
            return Err(Error::invalid_input(format!(
                "path must be specified in URL ({TREE_HINT})"
            )));
        }
        if parts[4..].iter().any(|p| *p == "." || *p == "..") {
            return Err(Error::invalid_input(format!(
                "path in '{raw}' must not contain '.' or '..' segments"
            )));
        }

        Ok(Self {
            owner: parts[0].to_string(),
            repo: parts[1].to_string(),
            branch: parts[3].to_string(),
            path: parts[4..].join("/"),
        })
    }

    pub fn canonical_url(&self) -> String {
        format!(
            "https://github.com/{}/{}/tree/{}/{}",
            self.owner, self.repo, self.branch, self.path
        )
    }

    /// Registry key: `<owner>/<repo>/<path>@<branch>`.
    pub fn bundle_id(&self) -> String {
        format!("{}/{}/{}@{}", self.owner, self.repo, self.path, self.branch)
    }

    /// Last path segment, used as the bundle and link name.
    pub fn bundle_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Path of a child below the bundle root, in repository terms.
    pub fn child_path(&self, relative: &str) -> String {
        format!("{}/{}", self.path, relative.trim_start_matches('/'))
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_url())
    }
}

/// What a GitHub URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// `owner/repo` or a tree URL with no path.
    RepoRoot,
    /// A single skill directory.
    SkillDir,
    /// A file inside a skill under `skills/`.
    SkillFile,
    Unknown,
}

impl SourceKind {
    pub fn detect(raw: &str) -> Self {
        let Ok(url) = Url::parse(raw.trim()) else {
            return Self::Unknown;
        };
        if !url.host_str().is_some_and(|h| h.ends_with("github.com")) {
            return Self::Unknown;
        }
        let parts: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        match parts.as_slice() {
            [_, _] => Self::RepoRoot,
            [_, _, "tree", _] => Self::RepoRoot,
            [_, _, "tree", _, "skills", _, _, ..] => Self::SkillFile,
            [_, _, "tree", _, _, ..] => Self::SkillDir,
            _ => Self::Unknown,
        }
    }
}
