//! Configuration loading, validation and env substitution for gskills.
//!
//! Everything lives under the data directory (`~/.gskills` by default):
//! `config.toml` (or `config.json` / `config.yaml`), the `skills.json`
//! registry and the `skills/` store.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{
        apply_env_overrides, clear_data_dir, config_path, data_dir, discover_and_load,
        load_config, registry_path, save_config, set_data_dir, store_dir, update_config,
    },
    schema::{ConcurrencyConfig, ConfigKey, GskillsConfig, RetryConfig},
    validate::{Diagnostic, Severity, ValidationResult},
};
