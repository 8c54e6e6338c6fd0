use std::{
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use {
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::{
    env_subst::substitute_env,
    error::{Context, Error, Result},
    schema::GskillsConfig,
};

/// Config file names inside the data directory, checked in order.
const CONFIG_FILENAMES: &[&str] = &["config.toml", "config.json", "config.yaml", "config.yml"];

const REGISTRY_FILENAME: &str = "skills.json";
const STORE_DIRNAME: &str = "skills";

static DATA_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Override the data directory for the rest of the process (`--data-dir`).
pub fn set_data_dir(dir: PathBuf) {
    *DATA_DIR_OVERRIDE
        .write()
        .unwrap_or_else(PoisonError::into_inner) = Some(dir);
}

pub fn clear_data_dir() {
    *DATA_DIR_OVERRIDE
        .write()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

/// Root of all gskills state.
///
/// Resolution order: [`set_data_dir`] override, `GSKILLS_HOME`, `~/.gskills`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = DATA_DIR_OVERRIDE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
    {
        return dir;
    }
    if let Some(dir) = std::env::var_os("GSKILLS_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".gskills"))
        .unwrap_or_else(|| PathBuf::from(".gskills"))
}

/// `<data>/skills.json`
pub fn registry_path() -> PathBuf {
    data_dir().join(REGISTRY_FILENAME)
}

/// `<data>/skills/`, where bundle directories are materialized.
pub fn store_dir() -> PathBuf {
    data_dir().join(STORE_DIRNAME)
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn config_path() -> PathBuf {
    config_path_in(&data_dir())
}

fn config_path_in(dir: &Path) -> PathBuf {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
        .unwrap_or_else(|| dir.join(CONFIG_FILENAMES[0]))
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<GskillsConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Load the config file from the data directory and apply env overrides.
///
/// Returns defaults (plus env overrides) if the file is missing or broken.
pub fn discover_and_load() -> GskillsConfig {
    let path = config_path();
    let config = if path.exists() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                GskillsConfig::default()
            },
        }
    } else {
        debug!("no config file found, using defaults");
        GskillsConfig::default()
    };
    apply_env_overrides(config)
}

/// Apply `GITHUB_TOKEN` / `GSKILLS_GITHUB_TOKEN` and `GSKILLS_PROXY`.
pub fn apply_env_overrides(config: GskillsConfig) -> GskillsConfig {
    apply_env_overrides_with(config, |name| std::env::var(name).ok())
}

fn apply_env_overrides_with(
    mut config: GskillsConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> GskillsConfig {
    let token = lookup("GSKILLS_GITHUB_TOKEN")
        .or_else(|| lookup("GITHUB_TOKEN"))
        .filter(|t| !t.trim().is_empty());
    if let Some(token) = token {
        config.github_token = Some(Secret::new(token.trim().to_string()));
    }
    if let Some(proxy) = lookup("GSKILLS_PROXY").filter(|p| !p.trim().is_empty()) {
        config.proxy = Some(proxy.trim().to_string());
    }
    config
}

/// Serialize `config` and write it to the config path in the data directory.
///
/// The file holds the token, so it is created owner-only on Unix.
pub fn save_config(config: &GskillsConfig) -> Result<PathBuf> {
    let path = config_path();
    save_config_to(config, &path)?;
    Ok(path)
}

fn save_config_to(config: &GskillsConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let text = match ext {
        "toml" => toml::to_string_pretty(config)?,
        "json" => serde_json::to_string_pretty(config)?,
        "yaml" | "yml" => serde_yaml::to_string(config)?,
        other => return Err(Error::unsupported_format(other)),
    };
    std::fs::write(path, text)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    debug!(path = %path.display(), "saved config");
    Ok(())
}

/// Load the on-disk config (without env overrides), mutate it, save it back.
pub fn update_config(f: impl FnOnce(&mut GskillsConfig)) -> Result<PathBuf> {
    let path = config_path();
    let mut config = if path.exists() {
        load_config(&path)?
    } else {
        GskillsConfig::default()
    };
    f(&mut config);
    save_config_to(&config, &path)?;
    Ok(path)
}

fn parse_config(raw: &str, path: &Path) -> Result<GskillsConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::unsupported_format(other)),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::schema::ConfigKey};

    #[test]
    fn missing_config_falls_back_to_toml_path() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(config_path_in(tmp.path()), tmp.path().join("config.toml"));
    }

    #[test]
    fn existing_json_config_is_found() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.json"), "{}").unwrap();
        assert_eq!(config_path_in(tmp.path()), tmp.path().join("config.json"));
    }

    #[test]
    fn loads_each_format() {
        let tmp = tempfile::tempdir().unwrap();
        let toml_path = tmp.path().join("config.toml");
        std::fs::write(&toml_path, "proxy = \"http://a:1\"\n").unwrap();
        assert_eq!(
            load_config(&toml_path).unwrap().proxy.as_deref(),
            Some("http://a:1")
        );

        let json_path = tmp.path().join("config.json");
        std::fs::write(&json_path, r#"{"link_dir": ".agents/skills"}"#).unwrap();
        assert_eq!(load_config(&json_path).unwrap().link_dir, ".agents/skills");

        let yaml_path = tmp.path().join("config.yaml");
        std::fs::write(&yaml_path, "request_timeout_secs: 5\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().request_timeout_secs, 5);

        let ini_path = tmp.path().join("config.ini");
        std::fs::write(&ini_path, "x=1").unwrap();
        assert!(matches!(
            load_config(&ini_path),
            Err(Error::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let lookup = |name: &str| match name {
            "GITHUB_TOKEN" => Some("from-env".to_string()),
            "GSKILLS_PROXY" => Some(" http://proxy:3128 ".to_string()),
            _ => None,
        };
        let mut cfg = GskillsConfig::default();
        cfg.set(ConfigKey::GithubToken, "from-file");
        let cfg = apply_env_overrides_with(cfg, lookup);
        assert_eq!(cfg.token(), Some("from-env"));
        assert_eq!(cfg.proxy.as_deref(), Some("http://proxy:3128"));
    }

    #[test]
    fn scoped_token_beats_generic_token() {
        let lookup = |name: &str| match name {
            "GITHUB_TOKEN" => Some("generic".to_string()),
            "GSKILLS_GITHUB_TOKEN" => Some("scoped".to_string()),
            _ => None,
        };
        let cfg = apply_env_overrides_with(GskillsConfig::default(), lookup);
        assert_eq!(cfg.token(), Some("scoped"));
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        let mut cfg = GskillsConfig::default();
        cfg.set(ConfigKey::Proxy, "http://proxy:8080");
        cfg.set(ConfigKey::GithubToken, "tok");
        save_config_to(&cfg, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.proxy.as_deref(), Some("http://proxy:8080"));
        assert_eq!(loaded.token(), Some("tok"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
