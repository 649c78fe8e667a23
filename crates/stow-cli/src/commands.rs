use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use colored::Colorize;
use serde_json::json;
use stow_engine::{BackupSettings, EmbeddedStorage, EngineConfig, StoreGraphHandler};
use stow_net::NetworkServer;
use stow_storage::RecordView;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format.clone();
    match cli.command {
        Command::Init(ref args) => cmd_init(&cli, args),
        Command::Stats(_) => cmd_stats(&open(&cli)?, &format),
        Command::Dictionary(_) => cmd_dictionary(&open(&cli)?, &format),
        Command::Records(ref args) => cmd_records(&open(&cli)?, args, &format),
        Command::Backup(_) => cmd_backup(&open_with_backup(&cli)?),
        Command::VerifyBackup(_) => cmd_verify_backup(&open_with_backup(&cli)?),
        Command::Housekeep(ref args) => cmd_housekeep(&open(&cli)?, args),
        Command::Check(_) => cmd_check(&open(&cli)?, &format),
        Command::Serve(ref args) => cmd_serve(resolve_config(&cli)?, args),
    }
}

/// The configuration file if present, else defaults, with `--root` applied.
fn resolve_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = if cli.config.exists() {
        EngineConfig::load(&cli.config)?
    } else {
        EngineConfig::default()
    };
    if let Some(root) = &cli.root {
        config.storage.root = root.clone();
    }
    Ok(config)
}

fn open(cli: &Cli) -> anyhow::Result<EmbeddedStorage> {
    let config = resolve_config(cli)?;
    if !config.storage.root.exists() {
        bail!(
            "storage root {} does not exist (run `stow init` first)",
            config.storage.root.display()
        );
    }
    let root = config.storage.root.clone();
    EmbeddedStorage::start(config).with_context(|| format!("opening storage in {}", root.display()))
}

fn open_with_backup(cli: &Cli) -> anyhow::Result<EmbeddedStorage> {
    let engine = open(cli)?;
    if engine.config().backup.is_none() {
        bail!("no backup configured in {}", cli.config.display());
    }
    Ok(engine)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_init(cli: &Cli, args: &InitArgs) -> anyhow::Result<()> {
    if cli.config.exists() && !args.force {
        bail!("{} already exists (use --force to overwrite)", cli.config.display());
    }
    let root = cli.root.clone().unwrap_or_else(|| EngineConfig::default().storage.root);
    let mut config = EngineConfig::new(root, args.channels);
    if let Some(dir) = &args.backup {
        config = config.with_backup(BackupSettings::new(dir));
    }
    write_config(&cli.config, &config)?;
    EmbeddedStorage::start(config.clone())?.shutdown();

    println!(
        "{} Initialized storage in {}",
        "✓".green().bold(),
        config.storage.root.display().to_string().bold()
    );
    println!("  Config: {}", cli.config.display());
    println!("  Channels: {}", config.storage.channel_count.to_string().yellow());
    if let Some(backup) = &config.backup {
        println!("  Backup: {}", backup.directory.display().to_string().cyan());
    }
    Ok(())
}

fn write_config(path: &Path, config: &EngineConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, config.to_toml_string()?).with_context(|| format!("writing {}", path.display()))
}

fn cmd_stats(engine: &EmbeddedStorage, format: &OutputFormat) -> anyhow::Result<()> {
    let stats = engine.stats()?;
    if let OutputFormat::Json = format {
        return print_json(&json!({
            "root": stats.root,
            "types": stats.types,
            "registry": {
                "known": stats.registry.known,
                "resident": stats.registry.resident,
                "next_oid": stats.registry.next_oid,
            },
            "channels": stats.channels,
        }));
    }

    match stats.root {
        Some(oid) => println!("Root: {}", oid.to_string().yellow()),
        None => println!("Root: {}", "none".dimmed()),
    }
    println!("Types: {}", stats.types);
    println!(
        "Records: {} live in {} files ({} of {} bytes live)",
        stats.live_records().to_string().bold(),
        stats.file_count(),
        stats.live_bytes(),
        stats.total_bytes()
    );
    println!();
    println!(
        "{:>7}  {:<12}  {:>5}  {:>5}  {:>9}  {:>12}  {:>12}  {:>10}  backup",
        "channel", "state", "files", "head", "live", "live bytes", "total bytes", "tombstones"
    );
    for c in &stats.channels {
        let backup = if c.backup_disrupted { "disrupted".red() } else { "ok".green() };
        println!(
            "{:>7}  {:<12}  {:>5}  {:>5}  {:>9}  {:>12}  {:>12}  {:>10}  {}",
            c.channel,
            format!("{:?}", c.state),
            c.file_count,
            c.head_file,
            c.live_records,
            c.live_bytes,
            c.total_bytes,
            c.tombstones,
            backup
        );
    }
    Ok(())
}

fn cmd_dictionary(engine: &EmbeddedStorage, format: &OutputFormat) -> anyhow::Result<()> {
    let entries = engine.dictionary().entries();
    let migrations = engine.dictionary().migrations();
    if let OutputFormat::Json = format {
        return print_json(&json!({ "types": entries, "migrations": migrations }));
    }

    if entries.is_empty() {
        println!("No types stored.");
        return Ok(());
    }
    for entry in &entries {
        println!("{} {}", entry.tid.to_string().yellow(), entry.descriptor.name().bold());
        for field in entry.descriptor.fields() {
            println!("    {}: {}", field.name, field.kind.to_string().cyan());
        }
    }
    if !migrations.is_empty() {
        println!();
        for migration in &migrations {
            let origin = if migration.inferred { " (inferred)" } else { "" };
            println!("{} {} → {}{}", "migration".dimmed(), migration.from, migration.to, origin);
        }
    }
    Ok(())
}

fn record_status(view: &RecordView) -> &'static str {
    match (view.live, view.record.is_tombstone()) {
        (true, true) => "tombstone",
        (true, false) => "live",
        (false, _) => "superseded",
    }
}

fn cmd_records(engine: &EmbeddedStorage, args: &RecordsArgs, format: &OutputFormat) -> anyhow::Result<()> {
    if args.channel >= engine.channel_count() {
        bail!(
            "channel {} does not exist ({} channels configured)",
            args.channel,
            engine.channel_count()
        );
    }
    let views: Vec<RecordView> = engine
        .records(args.channel)?
        .into_iter()
        .filter(|v| args.all || v.live)
        .collect();

    if let OutputFormat::Json = format {
        let rows: Vec<serde_json::Value> = views
            .iter()
            .map(|v| {
                let mut row = json!({
                    "file": v.file,
                    "offset": v.offset,
                    "oid": v.record.oid,
                    "tid": v.record.tid,
                    "length": v.record.total_length(),
                    "status": record_status(v),
                });
                if args.hex {
                    row["payload"] = json!(hex::encode(&v.record.payload));
                }
                row
            })
            .collect();
        return print_json(&json!(rows));
    }

    for v in &views {
        let status = match record_status(v) {
            "live" => "live".green(),
            "tombstone" => "tombstone".red(),
            other => other.dimmed(),
        };
        println!(
            "{:>4}:{:<10} oid {} tid {} {:>8} bytes  {}",
            v.file,
            v.offset,
            v.record.oid.to_string().yellow(),
            v.record.tid,
            v.record.total_length(),
            status
        );
        if args.hex && !v.record.payload.is_empty() {
            println!("    {}", hex::encode(&v.record.payload).dimmed());
        }
    }
    println!("{} records in channel {}", views.len(), args.channel);
    Ok(())
}

fn cmd_backup(engine: &EmbeddedStorage) -> anyhow::Result<()> {
    for report in engine.backup_pass()? {
        println!(
            "  channel {}: {} files copied ({} bytes), {} retired",
            report.channel, report.files_copied, report.bytes_copied, report.files_retired
        );
    }
    println!("{} Backup synchronized.", "✓".green().bold());
    Ok(())
}

fn cmd_verify_backup(engine: &EmbeddedStorage) -> anyhow::Result<()> {
    let reports = engine.verify_backup()?;
    let mut converged = true;
    for report in &reports {
        if report.is_converged() {
            println!("  channel {}: {} files match", report.channel, report.matched.len());
            continue;
        }
        converged = false;
        for m in &report.mismatched {
            let backup = m
                .backup_length
                .map_or_else(|| "missing".to_string(), |len| format!("{len} bytes"));
            println!(
                "  {} channel {} file {}: storage {} bytes, backup {}",
                "✗".red().bold(),
                report.channel,
                m.number,
                m.storage_length,
                backup
            );
        }
        for orphan in &report.orphaned {
            println!("  {} orphaned backup file {}", "✗".red().bold(), orphan);
        }
    }
    if !converged {
        bail!("backup does not match storage");
    }
    println!("{} Backup matches storage.", "✓".green().bold());
    Ok(())
}

fn cmd_housekeep(engine: &EmbeddedStorage, args: &HousekeepArgs) -> anyhow::Result<()> {
    let report = engine.issue_housekeeping(Duration::from_millis(args.budget_ms))?;
    println!("  Evicted cache entries: {}", report.evicted_entries);
    println!(
        "  Dissolved files: {} ({} records, {} bytes relocated)",
        report.dissolved_files, report.relocated_records, report.relocated_bytes
    );
    println!("  Dropped tombstones: {}", report.dropped_tombstones);
    if report.completed {
        println!("{} Housekeeping complete.", "✓".green().bold());
    } else {
        println!("{} Budget exhausted, work remains.", "…".yellow().bold());
    }
    Ok(())
}

fn cmd_check(engine: &EmbeddedStorage, format: &OutputFormat) -> anyhow::Result<()> {
    let report = engine.check_integrity()?;
    if let OutputFormat::Json = format {
        print_json(&json!(report))?;
    } else {
        for problem in &report.problems {
            println!("  {} {}", "✗".red().bold(), problem);
        }
        println!(
            "Checked {} records and {} references.",
            report.records_checked, report.references_checked
        );
    }
    if !report.is_clean() {
        bail!("{} integrity problem(s) found", report.problems.len());
    }
    if let OutputFormat::Text = format {
        println!("{} No issues.", "✓".green().bold());
    }
    Ok(())
}

fn cmd_serve(config: EngineConfig, args: &ServeArgs) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let network = config.network.clone();
        let engine = Arc::new(EmbeddedStorage::start(config)?);
        let listener = tokio::net::TcpListener::bind(&args.bind)
            .await
            .with_context(|| format!("binding {}", args.bind))?;
        println!("Serving on {} (ctrl-c to stop)", listener.local_addr()?.to_string().bold());

        let server = NetworkServer::new(network, Arc::new(StoreGraphHandler::new(Arc::clone(&engine))));
        server
            .serve_until(listener, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "cannot listen for ctrl-c");
                }
            })
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("stow").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn init_writes_a_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("stow.toml");
        let root = dir.path().join("data");
        let config_arg = config_path.to_str().unwrap();
        let root_arg = root.to_str().unwrap();

        run_command(cli(&["init", "--channels", "3", "-c", config_arg, "--root", root_arg])).unwrap();
        let config = EngineConfig::load(&config_path).unwrap();
        assert_eq!(config.storage.channel_count, 3);
        assert_eq!(config.storage.root, root);
        assert!(root.join("channel_2").is_dir());

        // a second init refuses to clobber the file
        assert!(run_command(cli(&["init", "-c", config_arg, "--root", root_arg])).is_err());
        run_command(cli(&["check", "-c", config_arg])).unwrap();
        run_command(cli(&["records", "--channel", "0", "-c", config_arg])).unwrap();
        assert!(run_command(cli(&["records", "--channel", "3", "-c", config_arg])).is_err());
    }

    #[test]
    fn root_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("missing.toml");
        let parsed = cli(&["stats", "-c", config_path.to_str().unwrap(), "--root", "/srv/stow"]);
        let config = resolve_config(&parsed).unwrap();
        assert_eq!(config.storage.root, Path::new("/srv/stow"));
        assert_eq!(config.storage.channel_count, 1);
    }

    #[test]
    fn backup_commands_need_a_backup() {
        let dir = tempfile::tempdir().unwrap();
        let config_arg = dir.path().join("stow.toml");
        let config_arg = config_arg.to_str().unwrap();
        let root = dir.path().join("data");
        run_command(cli(&["init", "-c", config_arg, "--root", root.to_str().unwrap()])).unwrap();
        assert!(run_command(cli(&["backup", "-c", config_arg])).is_err());
    }

    #[test]
    fn missing_storage_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nothing-here");
        let parsed = cli(&["stats", "-c", "/nonexistent/stow.toml", "--root", root.to_str().unwrap()]);
        assert!(run_command(parsed).is_err());
        assert!(!root.exists());
    }
}
