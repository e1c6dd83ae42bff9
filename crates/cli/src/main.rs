use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mirrorsync_core::{
    init_logging, LocalDisk, LogLevel, MirrorConfig, ReconcileEngine, StateStore, SyncReport,
    TracingSink,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mirrorsync")]
#[command(about = "Mirror monitored folders into a backup tree")]
#[command(version, author)]
struct Cli {
    /// Config file (default: ./config.yaml, then the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at DEBUG regardless of the configured level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the backup tree in line with the monitored folders
    Sync,
    /// List tracked files
    List {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a starter config file
    Init {
        /// Where to write it (default: the user config directory)
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Sync => handle_sync(cli.config.as_deref(), cli.verbose),
        Commands::List { json } => handle_list(cli.config.as_deref(), cli.verbose, json),
        Commands::Init { path } => handle_init(path),
    };

    if let Err(e) = &result {
        // Fails harmlessly when the config already installed a subscriber.
        let _ = init_logging(LogLevel::Error, None);
        error!("{:#}", e);
    }
    result
}

fn load_config(explicit: Option<&Path>, verbose: bool) -> Result<MirrorConfig> {
    let path = MirrorConfig::locate(explicit)?;
    let config = MirrorConfig::load(&path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;

    let level = if verbose { LogLevel::Debug } else { config.log_level };
    init_logging(level, config.log_file.as_deref()).context("Failed to initialise logging")?;
    info!("Using config {}", path.display());

    Ok(config)
}

fn open_store(config: &MirrorConfig) -> Result<StateStore> {
    StateStore::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))
}

fn handle_sync(explicit: Option<&Path>, verbose: bool) -> Result<()> {
    let config = load_config(explicit, verbose)?;
    let store = open_store(&config)?;

    info!(
        "Starting sync of {} folder(s) into {}",
        config.folders.len(),
        config.backup_path.display()
    );

    let mut engine = ReconcileEngine::new(
        store,
        LocalDisk::new(),
        &config.backup_path,
        Arc::new(TracingSink),
    );
    let report = engine.run(config.folders.as_slice())?;

    print_report(&report, &config.backup_path);
    Ok(())
}

fn print_report(report: &SyncReport, backup_path: &Path) {
    let stats = report.totals();

    println!("Sync completed!");
    println!("===============");
    println!("Backup path:        {}", backup_path.display());
    println!("Directories created: {}", stats.dirs_created);
    println!("Files copied:       {}", stats.files_copied);
    println!("Files updated:      {}", stats.files_updated);
    println!("Files restored:     {}", stats.files_restored);
    println!("Files unchanged:    {}", stats.files_unchanged);
    println!("Backups removed:    {}", stats.backups_removed);
    println!("Directories pruned: {}", stats.dirs_pruned);

    if stats.records_purged > 0 {
        println!("Unmonitored purged: {}", stats.records_purged);
    }
    if stats.missing_backups > 0 {
        println!("Missing backups:    {}", stats.missing_backups);
    }
    if stats.files_failed > 0 {
        println!("Failed files:       {}", stats.files_failed);
    }

    if report.partitions.len() > 1 {
        println!();
        println!("{:<20} {:<40} {:<10}", "Root", "Ancestor", "Changes");
        println!("{}", "-".repeat(72));
        for partition in &report.partitions {
            println!(
                "{:<20} {:<40} {:<10}",
                partition.root.display(),
                partition.ancestor.display(),
                partition.stats.writes()
            );
        }
    }
}

fn handle_list(explicit: Option<&Path>, verbose: bool, json: bool) -> Result<()> {
    let config = load_config(explicit, verbose)?;
    let records = open_store(&config)?.load_all()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No files tracked in {}", config.database_path.display());
        return Ok(());
    }

    println!("Tracked Files:");
    println!("==============");
    println!("{:<50} {:<26} {:<12}", "Source", "Modified", "Hash");
    println!("{}", "-".repeat(90));

    for record in &records {
        println!(
            "{:<50} {:<26} {:<12}",
            record.original_path.display(),
            record.modified_time.get(..19).unwrap_or(record.modified_time.as_str()).replace('T', " "),
            record.content_hash.short()
        );
        println!("  -> {}", record.backup_path.display());
    }

    println!();
    println!("{} file(s) tracked", records.len());
    Ok(())
}

fn handle_init(path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => MirrorConfig::default_path()?,
    };

    if path.exists() {
        bail!("Config file {} already exists", path.display());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(&path, MirrorConfig::template())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Wrote starter config to {}", path.display());
    println!("Edit `folders` and `backup_path`, then run `mirrorsync sync`.");
    Ok(())
}
