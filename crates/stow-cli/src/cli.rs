use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "stow",
    about = "Inspect and maintain stowage storage directories",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Engine configuration file
    #[arg(short, long, global = true, default_value = "stow.toml")]
    pub config: PathBuf,

    /// Storage root, overriding the configuration file
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a default configuration file and create the storage layout
    Init(InitArgs),
    /// Show per-channel file and record figures
    Stats(StatsArgs),
    /// List stored type layouts and migrations
    Dictionary(DictionaryArgs),
    /// List the records in one channel's files
    Records(RecordsArgs),
    /// Synchronize every channel with the configured backup
    Backup(BackupArgs),
    /// Compare storage files with their backup copies
    VerifyBackup(VerifyBackupArgs),
    /// Run one housekeeping slice on every channel
    Housekeep(HousekeepArgs),
    /// Check that every record decodes and every reference resolves
    Check(CheckArgs),
    /// Accept graphs over the network and store each as the new root
    Serve(ServeArgs),
}

#[derive(Args)]
pub struct InitArgs {
    /// Number of storage channels
    #[arg(long, default_value = "1")]
    pub channels: u32,
    /// Directory for continuous backup copies
    #[arg(long)]
    pub backup: Option<PathBuf>,
    /// Overwrite an existing configuration file
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct StatsArgs {}

#[derive(Args)]
pub struct DictionaryArgs {}

#[derive(Args)]
pub struct RecordsArgs {
    #[arg(long)]
    pub channel: u32,
    /// Print each payload as hex
    #[arg(long)]
    pub hex: bool,
    /// Include superseded copies
    #[arg(long)]
    pub all: bool,
}

#[derive(Args)]
pub struct BackupArgs {}

#[derive(Args)]
pub struct VerifyBackupArgs {}

#[derive(Args)]
pub struct HousekeepArgs {
    /// Time budget of the slice in milliseconds
    #[arg(long, default_value = "1000")]
    pub budget_ms: u64,
}

#[derive(Args)]
pub struct CheckArgs {}

#[derive(Args)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:7070")]
    pub bind: String,
}
