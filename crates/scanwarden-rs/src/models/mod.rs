use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct MonitoredTarget {
    pub id: i64,
    pub address: String,
    pub last_scan_date: Option<DateTime<Utc>>,
    pub scheduler_enabled: bool,
    pub tool_enabled: bool,
    pub total_findings_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobKind {
    /// Primary scanner run against a target.
    Scan,
    /// Single-template rescan of one finding.
    Rescan,
    /// Secondary liveness probe.
    Probe,
    /// Results supplied from a file instead of a process.
    Import,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Rescan => "rescan",
            Self::Probe => "probe",
            Self::Import => "import",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct ScanJob {
    pub id: String,
    pub target: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub config: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub failure_kind: Option<String>,
    pub failure_reason: Option<String>,
    pub inserted_count: i64,
    pub updated_count: i64,
    pub log_path: Option<String>,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
pub enum FindingStatus {
    New,
    Confirmed,
    FalsePositive,
    Closed,
    Fixed,
    Regression,
}

impl FindingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Confirmed => "Confirmed",
            Self::FalsePositive => "FalsePositive",
            Self::Closed => "Closed",
            Self::Fixed => "Fixed",
            Self::Regression => "Regression",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct FindingRecord {
    pub id: i64,
    pub scan_id: String,
    pub template_id: String,
    pub template_path: Option<String>,
    pub name: String,
    pub severity: String,
    pub finding_type: Option<String>,
    pub host: String,
    pub matched_at: String,
    pub matcher_name: Option<String>,
    pub request_raw: Option<String>,
    pub response_raw: Option<String>,
    pub timestamp: String,
    pub content_hash: String,
    pub status: FindingStatus,
    pub raw_payload: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A finding as produced by a scanner, before it has a row of its own.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct NormalizedFinding {
    pub template_id: String,
    pub template_path: Option<String>,
    pub name: String,
    pub severity: String,
    pub finding_type: Option<String>,
    pub host: String,
    pub matched_at: String,
    pub matcher_name: Option<String>,
    pub request_raw: Option<String>,
    pub response_raw: Option<String>,
    pub timestamp: String,
    pub raw_payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Frequency {
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "24h")]
    Daily,
    #[serde(rename = "168h")]
    Weekly,
}

impl Frequency {
    pub fn interval(self) -> chrono::Duration {
        match self {
            Self::SixHours => chrono::Duration::hours(6),
            Self::TwelveHours => chrono::Duration::hours(12),
            Self::Daily => chrono::Duration::hours(24),
            Self::Weekly => chrono::Duration::hours(168),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SixHours => "6h",
            Self::TwelveHours => "12h",
            Self::Daily => "24h",
            Self::Weekly => "168h",
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

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "6h" => Ok(Self::SixHours),
            "12h" => Ok(Self::TwelveHours),
            "24h" => Ok(Self::Daily),
            "168h" => Ok(Self::Weekly),
            other => Err(format!("unknown frequency: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyMode {
    Always,
    NewOnly,
}

impl NotifyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::NewOnly => "new_only",
        }
    }
}

impl FromStr for NotifyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "new_only" => Ok(Self::NewOnly),
            other => Err(format!("unknown notify mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub frequency: Frequency,
    pub hour_of_day: u32,
    pub notify_mode: NotifyMode,
    pub auto_secondary_scan: bool,
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: Frequency::Daily,
            hour_of_day: 2,
            notify_mode: NotifyMode::NewOnly,
            auto_secondary_scan: false,
            last_run: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// CVE templates only.
    Quick,
    /// CVEs plus exposures.
    Standard,
    /// Every installed template.
    Full,
}

impl ScanMode {
    pub fn tags(self) -> &'static [&'static str] {
        match self {
            Self::Quick => &["cve"],
            Self::Standard => &["cve", "exposure"],
            Self::Full => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Full => "full",
        }
    }
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "standard" => Ok(Self::Standard),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown scan mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolSettings {
    pub scan_mode: ScanMode,
    pub template_selectors: Vec<String>,
    pub severity_filter: Vec<String>,
    pub rate_limit: Option<u32>,
    pub concurrency: Option<u32>,
    pub bulk_size: Option<u32>,
    pub custom_args: Option<String>,
    pub max_new_findings_threshold: u32,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            scan_mode: ScanMode::Standard,
            template_selectors: vec![],
            severity_filter: vec![
                "critical".to_string(),
                "high".to_string(),
                "medium".to_string(),
            ],
            rate_limit: Some(150),
            concurrency: Some(25),
            bulk_size: None,
            custom_args: None,
            max_new_findings_threshold: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

/// Counts reported by one ingestion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    pub regressions: usize,
}

impl IngestReport {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}
