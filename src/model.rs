use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::mapping::RejectedTarget;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[serde(alias = "dropbox")]
    #[value(alias = "dropbox")]
    Remote,
    Local,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "remote" | "dropbox" => Ok(Self::Remote),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown import source: {other}")),
        }
    }
}

/// What `validate` inspects: the whole configuration or one source preview.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ValidateTarget {
    Config,
    #[value(alias = "dropbox")]
    Remote,
    Local,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    #[value(name = "twicedaily", alias = "twice-daily")]
    TwiceDaily,
    Daily,
    Weekly,
}

impl Frequency {
    pub const ALL: [Frequency; 4] = [
        Frequency::Hourly,
        Frequency::TwiceDaily,
        Frequency::Daily,
        Frequency::Weekly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::TwiceDaily => "twicedaily",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Hourly => "Hourly",
            Self::TwiceDaily => "Twice daily",
            Self::Daily => "Daily",
            Self::Weekly => "Weekly",
        }
    }

    pub fn interval_secs(self) -> i64 {
        match self {
            Self::Hourly => 3_600,
            Self::TwiceDaily => 43_200,
            Self::Daily => 86_400,
            Self::Weekly => 604_800,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', '_'], "");
        Self::ALL
            .into_iter()
            .find(|frequency| frequency.as_str() == normalized)
            .ok_or_else(|| format!("unsupported frequency: {value}"))
    }
}

/// Operator settings persisted under the `settings` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfiguration {
    pub remote_url: String,
    pub remote_token: Option<String>,
    pub local_path: String,
    pub local_root: PathBuf,
    pub record_kind: String,
    pub required_fields: Vec<String>,
    pub known_fields: Vec<String>,
    pub key_field: String,
    pub skip_duplicates: bool,
    pub delimiter: char,
    pub max_memory_mb: u64,
    pub max_execution_secs: u64,
    pub sample_rows: usize,
}

impl Default for ImportConfiguration {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            remote_token: None,
            local_path: String::new(),
            local_root: PathBuf::from("."),
            record_kind: "page".to_string(),
            required_fields: vec!["title".to_string()],
            known_fields: vec![
                "title".to_string(),
                "content".to_string(),
                "excerpt".to_string(),
                "slug".to_string(),
            ],
            key_field: "title".to_string(),
            skip_duplicates: true,
            delimiter: ',',
            max_memory_mb: 256,
            max_execution_secs: 300,
            sample_rows: 50,
        }
    }
}

impl ImportConfiguration {
    pub fn location(&self, kind: SourceKind) -> &str {
        match kind {
            SourceKind::Remote => self.remote_url.trim(),
            SourceKind::Local => self.local_path.trim(),
        }
    }
}

/// Ceilings imposed by the hosting environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostLimits {
    pub max_memory_mb: u64,
    pub max_execution_secs: u64,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 1024,
            max_execution_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReadiness {
    pub remote_ready: bool,
    pub local_ready: bool,
}

impl SourceReadiness {
    pub fn is_ready(&self, kind: SourceKind) -> bool {
        match kind {
            SourceKind::Remote => self.remote_ready,
            SourceKind::Local => self.local_ready,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Progress {
    pub running: bool,
    pub status: RunStatus,
    pub processed: u64,
    pub total: u64,
    pub percent: u8,
    pub errors: u64,
    pub source: Option<SourceKind>,
    pub actor: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub eta_human: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Unix seconds; compared inside SQLite during acquisition.
    pub locked_at: i64,
    pub locked_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub locked_at: DateTime<Utc>,
    pub locked_by: String,
    pub lock_age_seconds: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub success: bool,
    pub source: SourceKind,
    pub processed: u64,
    pub total: u64,
    pub errors: u64,
    pub parse_errors: u64,
    pub created: u64,
    pub updated: u64,
    pub cancelled: bool,
    pub execution_time: f64,
    /// Mapped columns dropped because their field is not in the whitelist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_columns: Vec<RejectedTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastRun {
    pub finished_at: DateTime<Utc>,
    pub source: SourceKind,
    pub actor: String,
    pub status: RunStatus,
    pub processed: u64,
    pub errors: u64,
    pub source_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntervalOption {
    pub name: &'static str,
    pub label: &'static str,
    pub interval_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub is_scheduled: bool,
    pub frequency: Option<Frequency>,
    pub source: Option<SourceKind>,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub pending_registrations: usize,
    pub timers_disabled: bool,
    pub degraded: bool,
    pub available_intervals: Vec<IntervalOption>,
}
