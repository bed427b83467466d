use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::model::{SourceKind, ValidateTarget};

#[derive(Parser, Debug)]
#[command(
    name = "csv-import",
    version,
    about = "CSV-to-record import pipeline with progress tracking and scheduling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show or edit the persisted import settings.
    Configure(ConfigureArgs),
    /// Validate the configuration or preview one source.
    Validate(ValidateArgs),
    /// Run an import now.
    Import(ImportArgs),
    Progress(ProgressArgs),
    /// Ask a running import to stop after its current batch.
    Cancel(StoreArgs),
    /// Clear lock, progress, cancel flag and schedule unconditionally.
    Reset(StoreArgs),
    Schedule(ScheduleArgs),
    Unschedule(StoreArgs),
    SchedulerStatus(StoreArgs),
    /// Check that the timer substrate registers and reports triggers.
    SchedulerTest(StoreArgs),
    /// List pending schedule registrations and the raw run-state values.
    SchedulerDebug(StoreArgs),
    Health(StoreArgs),
    /// Fire due timer registrations.
    Tick(StoreArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, default_value = ".cache/csv-import")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, default_value_t = 1024)]
    pub host_max_memory_mb: u64,

    #[arg(long, default_value_t = 3600)]
    pub host_max_execution_secs: u64,

    /// Name recorded as the lock holder; defaults to $USER.
    #[arg(long)]
    pub actor: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ConfigureArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub remote_url: Option<String>,

    #[arg(long)]
    pub remote_token: Option<String>,

    #[arg(long, default_value_t = false)]
    pub clear_remote_token: bool,

    #[arg(long)]
    pub local_path: Option<String>,

    #[arg(long)]
    pub local_root: Option<PathBuf>,

    #[arg(long)]
    pub record_kind: Option<String>,

    /// Replaces the required field list when given at least once.
    #[arg(long = "required-field")]
    pub required_fields: Vec<String>,

    /// Replaces the destination field whitelist when given at least once.
    #[arg(long = "known-field")]
    pub known_fields: Vec<String>,

    #[arg(long)]
    pub key_field: Option<String>,

    #[arg(long)]
    pub skip_duplicates: Option<bool>,

    #[arg(long)]
    pub delimiter: Option<char>,

    #[arg(long)]
    pub max_memory_mb: Option<u64>,

    #[arg(long)]
    pub max_execution_secs: Option<u64>,

    #[arg(long)]
    pub sample_rows: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(value_enum, default_value_t = ValidateTarget::Config)]
    pub target: ValidateTarget,
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(value_enum)]
    pub source: SourceKind,

    /// JSON object of header name to field name (null or "" ignores a column).
    #[arg(long)]
    pub mapping_file: Option<PathBuf>,

    /// `HEADER=FIELD` pair; `HEADER=` ignores the column.
    #[arg(long = "map")]
    pub map: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ProgressArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, default_value_t = false)]
    pub extended: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ScheduleArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// hourly, twicedaily, daily or weekly.
    pub frequency: String,

    /// remote or local.
    pub source: String,
}
