use serde::Deserialize;

/// The frontmatter fields gskills reads from a `SKILL.md`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SkillFrontmatter {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Parse the YAML frontmatter of a `SKILL.md`. Returns `None` when the file
/// has no frontmatter or it does not parse.
pub fn parse_frontmatter(content: &str) -> Option<SkillFrontmatter> {
    let frontmatter = split_frontmatter(content)?;
    match serde_yaml::from_str::<SkillFrontmatter>(frontmatter) {
        Ok(meta) => Some(meta),
        Err(e) => {
            tracing::debug!(error = %e, "ignoring malformed SKILL.md frontmatter");
            None
        },
    }
}

/// Trimmed single-line description, if any.
pub fn description(content: &str) -> Option<String> {
    parse_frontmatter(content)?
        .description
        .map(|d| d.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|d| !d.is_empty())
}

fn split_frontmatter(content: &str) -> Option<&str> {
    let trimmed = content.trim_start_matches('\u{feff}').trim_start();
    let after_open = trimmed.strip_prefix("---")?;
    let close_pos = after_open.find("\n---")?;
    Some(after_open[..close_pos].trim())
}
