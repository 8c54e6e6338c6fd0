use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    anyhow::{Result, bail},
    gskills_config::{GskillsConfig, Severity},
    gskills_skills::{
        ClientOptions, Error, GithubClient, InstallOutcome, Installer, Linker, Materializer,
        RegistryStore, RemoveOutcome, Remover, Tidier, Updater, confirm::Confirm, migration,
        retry::RetryPolicy, types::short_sha,
    },
    tokio_util::sync::CancellationToken,
    tracing::warn,
};

use crate::{prompt::Prompt, table};

/// Loaded configuration plus the registry handle shared by every command.
pub struct Context {
    config: GskillsConfig,
    registry: Arc<RegistryStore>,
}

impl Context {
    pub fn load() -> Result<Self> {
        let config = gskills_config::discover_and_load();
        let result = gskills_config::validate::validate(&config);
        for d in &result.diagnostics {
            if d.severity == Severity::Warning {
                warn!(path = %d.path, "{}", d.message);
            }
        }
        if result.has_errors() {
            bail!(
                "configuration has {} error(s); run `gskills config check` for details",
                result.count(Severity::Error)
            );
        }
        Ok(Self {
            config,
            registry: Arc::new(RegistryStore::new(gskills_config::registry_path())),
        })
    }

    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            api_base_url: self.config.api_base_url.clone(),
            token: self.config.github_token.clone(),
            proxy: self.config.proxy.clone(),
            timeout: Duration::from_secs(self.config.request_timeout_secs),
            retry: RetryPolicy::new(
                self.config.retry.max_attempts,
                Duration::from_secs(self.config.retry.max_backoff_secs),
            ),
        }
    }

    fn materializer(&self) -> Result<Arc<Materializer>> {
        let client = GithubClient::new(self.client_options())?;
        Ok(Arc::new(Materializer::new(
            Arc::new(client),
            self.config.concurrency.materialize,
        )))
    }

    fn linker(&self) -> Linker {
        Linker::new(Arc::clone(&self.registry), &self.config.link_dir)
    }
}

/// Turn an interrupted command into a normal exit.
pub fn finish(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if is_cancelled(&e) => {
            println!("Cancelled.");
            Ok(())
        },
        other => other,
    }
}

fn is_cancelled(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<Error>().is_some_and(Error::is_cancelled))
}

fn project_dir(project: Option<&Path>) -> Result<PathBuf> {
    let dir = match project {
        Some(p) => p.to_path_buf(),
        None => std::env::current_dir()?,
    };
    Ok(std::path::absolute(dir)?)
}

pub async fn add(ctx: &Context, url: &str, yes: bool, cancel: &CancellationToken) -> Result<()> {
    let installer = Installer::new(
        ctx.materializer()?,
        Arc::clone(&ctx.registry),
        gskills_config::store_dir(),
    );
    match installer.install(url, &Prompt::new(yes), cancel).await? {
        InstallOutcome::Installed { record, stats } => {
            println!(
                "Installed '{}' at {} ({})",
                record.name,
                short_sha(&record.revision),
                record.store_path.display()
            );
            println!(
                "  {} files, {} directories, {} bytes",
                stats.files, stats.dirs, stats.bytes
            );
            if let Some(description) = &record.description {
                println!("  {description}");
            }
        },
        InstallOutcome::Cancelled => println!("Installation cancelled."),
    }
    Ok(())
}

pub fn list(ctx: &Context, json: bool) -> Result<()> {
    let records = ctx.registry.load()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No skills installed.");
    } else {
        let rows: Vec<Vec<String>> = records
            .iter()
            .map(|r| {
                vec![
                    r.name.clone(),
                    r.short_revision().to_string(),
                    r.linked_projects.len().to_string(),
                    r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    r.source_ref.clone(),
                ]
            })
            .collect();
        print!(
            "{}",
            table::render(&["NAME", "REVISION", "LINKS", "UPDATED", "SOURCE"], &rows)
        );
    }

    let legacy = migration::count_legacy_links(&ctx.registry)?;
    if legacy > 0 {
        eprintln!("\n{legacy} legacy link entries found; run `gskills migrate` to convert them.");
    }
    Ok(())
}

pub async fn remove(ctx: &Context, name: &str, yes: bool) -> Result<()> {
    match Remover::new(Arc::clone(&ctx.registry))
        .remove(name, &Prompt::new(yes))
        .await?
    {
        RemoveOutcome::Removed(record) => {
            println!("Removed '{}'.", record.name);
            if record.is_linked() {
                println!(
                    "  unlinked from {} project(s)",
                    record.linked_projects.len()
                );
            }
        },
        RemoveOutcome::Cancelled => println!("Remove cancelled."),
    }
    Ok(())
}

pub async fn update(
    ctx: &Context,
    name: Option<&str>,
    yes: bool,
    check_only: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let records = match name {
        Some(name) => vec![ctx.registry.find_by_name(name)?],
        None => ctx.registry.load()?,
    };
    if records.is_empty() {
        println!("No skills installed.");
        return Ok(());
    }

    let concurrency = &ctx.config.concurrency;
    let updater = Arc::new(
        Updater::new(Arc::clone(&ctx.registry), ctx.materializer()?)
            .with_concurrency(concurrency.update_checks, concurrency.update_apply),
    );
    let checks = updater.check_all_updates(records, cancel).await;
    if cancel.is_cancelled() {
        return Err(Error::Cancelled.into());
    }

    let mut rows = Vec::new();
    let mut pending = Vec::new();
    let mut failed_checks = 0;
    for check in checks {
        let (latest, status) = match &check.outcome {
            Ok(u) => (
                short_sha(&u.latest_revision).to_string(),
                if u.has_update {
                    "update available".to_string()
                } else {
                    "up to date".to_string()
                },
            ),
            Err(e) => {
                failed_checks += 1;
                ("-".to_string(), format!("error: {e}"))
            },
        };
        rows.push(vec![
            check.record.name.clone(),
            check.record.short_revision().to_string(),
            latest,
            status,
        ]);
        if check.outcome.as_ref().is_ok_and(|u| u.has_update) {
            pending.push(check.record);
        }
    }
    print!(
        "{}",
        table::render(&["NAME", "CURRENT", "LATEST", "STATUS"], &rows)
    );

    if pending.is_empty() {
        if failed_checks > 0 {
            bail!("{failed_checks} update check(s) failed");
        }
        println!("\nAll skills are up to date.");
        return Ok(());
    }
    if check_only {
        println!("\n{} update(s) available.", pending.len());
        return Ok(());
    }
    let prompt = format!("Apply {} update(s)?", pending.len());
    if !Prompt::new(yes).confirm(&prompt).await {
        println!("Update cancelled.");
        return Ok(());
    }

    let stats = updater.apply_all_updates(pending, cancel).await;
    println!(
        "\nUpdated {} of {} skill(s) in {:.1}s.",
        stats.updated,
        stats.total,
        stats.duration.as_secs_f64()
    );
    if cancel.is_cancelled() {
        return Err(Error::Cancelled.into());
    }
    for failure in &stats.failures {
        eprintln!("  {}: {}", failure.name, failure.error);
    }
    if stats.failed > 0 {
        bail!("{} update(s) failed", stats.failed);
    }
    Ok(())
}

pub fn link(
    ctx: &Context,
    name: &str,
    project: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let project = project_dir(project)?;
    let path = ctx.linker().link(name, &project, cancel)?;
    println!("Linked '{name}' into {}", path.display());
    Ok(())
}

pub fn unlink(ctx: &Context, name: &str, project: Option<&Path>) -> Result<()> {
    let project = project_dir(project)?;
    ctx.linker().unlink(name, &project)?;
    println!("Unlinked '{name}' from {}", project.display());
    Ok(())
}

pub fn info(ctx: &Context, name: &str) -> Result<()> {
    let info = ctx.linker().link_info(name)?;
    let r = &info.record;
    println!("Name:        {}", r.name);
    println!("ID:          {}", r.id);
    println!("Source:      {}", r.source_ref);
    println!("Revision:    {}", r.revision);
    println!("Store:       {}", r.store_path.display());
    println!("Updated:     {}", r.updated_at.to_rfc3339());
    if let Some(description) = &r.description {
        println!("Description: {description}");
    }

    if info.links.is_empty() {
        println!("\nNot linked into any project.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = info
        .links
        .iter()
        .map(|l| {
            vec![
                l.project.clone(),
                if l.present { "ok" } else { "missing" }.to_string(),
                l.linked_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    println!();
    print!("{}", table::render(&["PROJECT", "STATUS", "LINKED"], &rows));
    Ok(())
}

pub async fn tidy(ctx: &Context, cancel: &CancellationToken) -> Result<()> {
    let report = Tidier::new(Arc::clone(&ctx.registry), &ctx.config.link_dir)
        .with_concurrency(ctx.config.concurrency.tidy)
        .tidy(cancel)
        .await?;
    println!(
        "Checked {} skill(s) across {} project(s).",
        report.skills_checked, report.projects_scanned
    );
    println!(
        "Removed {} stale registry entries and {} orphaned symlink(s).",
        report.stale_registry_entries, report.orphaned_symlinks
    );
    for issue in &report.issues {
        eprintln!("  {}: {}", issue.path.display(), issue.error);
    }
    Ok(())
}

pub fn migrate(ctx: &Context) -> Result<()> {
    if migration::count_legacy_links(&ctx.registry)? == 0 {
        println!("No legacy links found to migrate.");
        return Ok(());
    }
    let report = migration::migrate_legacy_links(&ctx.registry)?;
    println!("Migrated {} legacy link(s).", report.migrated);
    if report.skipped > 0 {
        println!(
            "Skipped {} entries that could not be matched to an installed skill.",
            report.skipped
        );
    }
    Ok(())
}
