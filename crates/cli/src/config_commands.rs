use {anyhow::Result, clap::Subcommand};

use gskills_config::{
    ConfigKey, GskillsConfig,
    validate::{self, Severity},
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print one settable value. The token is always masked.
    Get { key: String },
    /// Set `github_token` or `proxy`. An empty value clears it.
    Set { key: String, value: String },
    /// Print every settable value.
    List,
    /// Validate the configuration file and report errors/warnings.
    Check,
}

pub fn handle_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let key: ConfigKey = key.parse()?;
            let config = gskills_config::discover_and_load();
            println!("{}", display_value(&config, key));
            Ok(())
        },
        ConfigAction::Set { key, value } => {
            let key: ConfigKey = key.parse()?;
            let path = gskills_config::update_config(|config| config.set(key, &value))?;
            println!("Set {key} in {}", path.display());
            Ok(())
        },
        ConfigAction::List => {
            let config = gskills_config::discover_and_load();
            for key in ConfigKey::ALL {
                println!("{key} = {}", display_value(&config, key));
            }
            Ok(())
        },
        ConfigAction::Check => check(),
    }
}

fn display_value(config: &GskillsConfig, key: ConfigKey) -> String {
    config.get(key).unwrap_or_else(|| "(not set)".to_string())
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check() -> Result<()> {
    let path = gskills_config::config_path();
    if path.exists() {
        eprintln!("Checking {}\n", path.display());
        // Surface parse errors instead of the silent fallback to defaults.
        gskills_config::load_config(&path)?;
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let result = validate::validate(&gskills_config::discover_and_load());
    for d in &result.diagnostics {
        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
        };
        eprintln!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message);
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if !result.diagnostics.is_empty() {
        eprintln!();
    }
    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}
