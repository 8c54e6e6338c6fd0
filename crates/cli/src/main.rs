mod config_commands;
mod prompt;
mod skill_commands;
mod table;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::skill_commands::Context;

#[derive(Parser)]
#[command(
    name = "gskills",
    version,
    about = "Install, update and link agent skills from GitHub"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Data directory (overrides `GSKILLS_HOME` and the default ~/.gskills).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a skill from a GitHub tree URL.
    Add {
        /// e.g. https://github.com/owner/repo/tree/main/skills/my-skill
        url: String,
        /// Overwrite an existing installation without asking.
        #[arg(short, long)]
        yes: bool,
    },
    /// List installed skills.
    List {
        /// Print the registry as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Remove an installed skill, its links and its files.
    Remove {
        name: String,
        #[arg(short, long)]
        yes: bool,
    },
    /// Check for and apply upstream changes.
    Update {
        /// Only this skill; all skills when omitted.
        name: Option<String>,
        /// Apply without asking.
        #[arg(short, long)]
        yes: bool,
        /// Report available updates without applying them.
        #[arg(long, conflicts_with = "yes")]
        check: bool,
    },
    /// Symlink an installed skill into a project.
    Link {
        name: String,
        /// Project root; defaults to the current directory.
        project: Option<PathBuf>,
    },
    /// Remove a skill's symlink from a project.
    Unlink {
        name: String,
        /// Project root; defaults to the current directory.
        project: Option<PathBuf>,
    },
    /// Show a skill and the projects it is linked into.
    Info { name: String },
    /// Drop stale link records and orphaned symlinks.
    Tidy,
    /// Fold link entries written by older releases into their skills.
    Migrate,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Cancels `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    if let Some(ref dir) = cli.data_dir {
        gskills_config::set_data_dir(dir.clone());
    }
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %gskills_config::data_dir().display(),
        "gskills starting"
    );

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let command = match cli.command {
        Commands::Config { action } => return config_commands::handle_config(action),
        command => command,
    };
    let ctx = Context::load()?;
    let result = match command {
        Commands::Add { url, yes } => skill_commands::add(&ctx, &url, yes, &cancel).await,
        Commands::List { json } => skill_commands::list(&ctx, json),
        Commands::Remove { name, yes } => skill_commands::remove(&ctx, &name, yes).await,
        Commands::Update { name, yes, check } => {
            skill_commands::update(&ctx, name.as_deref(), yes, check, &cancel).await
        },
        Commands::Link { name, project } => {
            skill_commands::link(&ctx, &name, project.as_deref(), &cancel)
        },
        Commands::Unlink { name, project } => {
            skill_commands::unlink(&ctx, &name, project.as_deref())
        },
        Commands::Info { name } => skill_commands::info(&ctx, &name),
        Commands::Tidy => skill_commands::tidy(&ctx, &cancel).await,
        Commands::Migrate => skill_commands::migrate(&ctx),
        // Dispatched before the context is loaded.
        Commands::Config { .. } => Ok(()),
    };
    skill_commands::finish(result)
}
