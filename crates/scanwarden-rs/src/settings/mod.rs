//! Mapping between typed settings and the flat key/value settings table.
//!
//! Writers only touch the keys they own; everything else in the table is
//! preserved.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::{
    db::SettingsStore,
    error::{Result, ScanError},
    models::{Frequency, NotificationSettings, NotifyMode, ScanMode, SchedulerSettings, ToolSettings},
};

pub const SCHEDULER_ENABLED: &str = "scheduler.enabled";
pub const SCHEDULER_FREQUENCY: &str = "scheduler.frequency";
pub const SCHEDULER_HOUR: &str = "scheduler.hour";
pub const SCHEDULER_NOTIFY_MODE: &str = "scheduler.notify_mode";
pub const SCHEDULER_AUTO_SECONDARY: &str = "scheduler.auto_secondary_scan";
pub const SCHEDULER_LAST_RUN: &str = "scheduler.last_run";

pub const TOOL_SCAN_MODE: &str = "tool.scan_mode";
pub const TOOL_TEMPLATES: &str = "tool.templates";
pub const TOOL_SEVERITY: &str = "tool.severity";
pub const TOOL_RATE_LIMIT: &str = "tool.rate_limit";
pub const TOOL_CONCURRENCY: &str = "tool.concurrency";
pub const TOOL_BULK_SIZE: &str = "tool.bulk_size";
pub const TOOL_CUSTOM_ARGS: &str = "tool.custom_args";
pub const TOOL_MAX_NEW_FINDINGS: &str = "tool.max_new_findings";

pub const NOTIFY_ENABLED: &str = "notify.enabled";
pub const NOTIFY_TELEGRAM_TOKEN: &str = "notify.telegram_token";
pub const NOTIFY_TELEGRAM_CHAT_ID: &str = "notify.telegram_chat_id";

const SEVERITIES: [&str; 5] = ["info", "low", "medium", "high", "critical"];

async fn parsed<T: FromStr>(store: &dyn SettingsStore, key: &str) -> Result<Option<T>> {
    let Some(raw) = store.get_setting(key).await? else {
        return Ok(None);
    };
    match raw.parse::<T>() {
        Ok(v) => Ok(Some(v)),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            Ok(None)
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn load_scheduler_settings(store: &dyn SettingsStore) -> Result<SchedulerSettings> {
    let defaults = SchedulerSettings::default();
    let last_run = match store.get_setting(SCHEDULER_LAST_RUN).await? {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                // unix seconds
                raw.parse::<i64>()
                    .ok()
                    .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
            }),
        None => None,
    };

    Ok(SchedulerSettings {
        enabled: parsed(store, SCHEDULER_ENABLED).await?.unwrap_or(defaults.enabled),
        frequency: parsed(store, SCHEDULER_FREQUENCY).await?.unwrap_or(defaults.frequency),
        hour_of_day: parsed::<u32>(store, SCHEDULER_HOUR)
            .await?
            .filter(|h| *h < 24)
            .unwrap_or(defaults.hour_of_day),
        notify_mode: parsed(store, SCHEDULER_NOTIFY_MODE).await?.unwrap_or(defaults.notify_mode),
        auto_secondary_scan: parsed(store, SCHEDULER_AUTO_SECONDARY)
            .await?
            .unwrap_or(defaults.auto_secondary_scan),
        last_run,
    })
}

pub async fn save_last_run(store: &dyn SettingsStore, at: DateTime<Utc>) -> Result<()> {
    store.set_setting(SCHEDULER_LAST_RUN, &at.to_rfc3339()).await?;
    Ok(())
}

/// Partial update of the scheduler settings; `None` fields are left alone.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SchedulerSettingsPatch {
    pub enabled: Option<bool>,
    pub frequency: Option<String>,
    #[serde(alias = "hour")]
    pub hour_of_day: Option<u32>,
    pub notify_mode: Option<String>,
    pub auto_secondary_scan: Option<bool>,
}

impl SchedulerSettingsPatch {
    pub async fn apply(&self, store: &dyn SettingsStore) -> Result<SchedulerSettings> {
        let frequency = self
            .frequency
            .as_deref()
            .map(Frequency::from_str)
            .transpose()
            .map_err(ScanError::Validation)?;
        let notify_mode = self
            .notify_mode
            .as_deref()
            .map(NotifyMode::from_str)
            .transpose()
            .map_err(ScanError::Validation)?;
        if let Some(hour) = self.hour_of_day {
            if hour > 23 {
                return Err(ScanError::Validation(format!("hour must be 0-23, got {hour}")));
            }
            store.set_setting(SCHEDULER_HOUR, &hour.to_string()).await?;
        }
        if let Some(enabled) = self.enabled {
            store.set_setting(SCHEDULER_ENABLED, &enabled.to_string()).await?;
        }
        if let Some(frequency) = frequency {
            store.set_setting(SCHEDULER_FREQUENCY, frequency.as_str()).await?;
        }
        if let Some(mode) = notify_mode {
            store.set_setting(SCHEDULER_NOTIFY_MODE, mode.as_str()).await?;
        }
        if let Some(auto) = self.auto_secondary_scan {
            store.set_setting(SCHEDULER_AUTO_SECONDARY, &auto.to_string()).await?;
        }
        load_scheduler_settings(store).await
    }
}

pub async fn load_tool_settings(store: &dyn SettingsStore) -> Result<ToolSettings> {
    let defaults = ToolSettings::default();
    let opt_u32 = |v: Option<String>, default: Option<u32>| match v {
        Some(raw) if raw.trim().is_empty() => None,
        Some(raw) => raw.trim().parse().ok().or(default),
        None => default,
    };

    Ok(ToolSettings {
        scan_mode: parsed::<ScanMode>(store, TOOL_SCAN_MODE)
            .await?
            .unwrap_or(defaults.scan_mode),
        template_selectors: store
            .get_setting(TOOL_TEMPLATES)
            .await?
            .map(|raw| split_list(&raw))
            .unwrap_or(defaults.template_selectors),
        severity_filter: store
            .get_setting(TOOL_SEVERITY)
            .await?
            .map(|raw| split_list(&raw))
            .unwrap_or(defaults.severity_filter),
        rate_limit: opt_u32(store.get_setting(TOOL_RATE_LIMIT).await?, defaults.rate_limit),
        concurrency: opt_u32(store.get_setting(TOOL_CONCURRENCY).await?, defaults.concurrency),
        bulk_size: opt_u32(store.get_setting(TOOL_BULK_SIZE).await?, defaults.bulk_size),
        custom_args: store
            .get_setting(TOOL_CUSTOM_ARGS)
            .await?
            .filter(|s| !s.trim().is_empty()),
        max_new_findings_threshold: parsed(store, TOOL_MAX_NEW_FINDINGS)
            .await?
            .unwrap_or(defaults.max_new_findings_threshold),
    })
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ToolSettingsPatch {
    pub scan_mode: Option<String>,
    pub template_selectors: Option<Vec<String>>,
    pub severity_filter: Option<Vec<String>>,
    pub rate_limit: Option<u32>,
    pub concurrency: Option<u32>,
    pub bulk_size: Option<u32>,
    pub custom_args: Option<String>,
    pub max_new_findings_threshold: Option<u32>,
}

impl ToolSettingsPatch {
    pub async fn apply(&self, store: &dyn SettingsStore) -> Result<ToolSettings> {
        let scan_mode = self
            .scan_mode
            .as_deref()
            .map(ScanMode::from_str)
            .transpose()
            .map_err(ScanError::Validation)?;
        if let Some(severities) = &self.severity_filter {
            if let Some(bad) = severities.iter().find(|s| !SEVERITIES.contains(&s.as_str())) {
                return Err(ScanError::Validation(format!("unknown severity: {bad}")));
            }
        }
        for (name, value) in [("rate_limit", self.rate_limit), ("concurrency", self.concurrency)] {
            if value == Some(0) {
                return Err(ScanError::Validation(format!("{name} must be positive")));
            }
        }
        if let Some(selectors) = &self.template_selectors {
            if let Some(bad) = selectors.iter().find(|s| s.starts_with('-')) {
                return Err(ScanError::Validation(format!("invalid template selector: {bad}")));
            }
        }

        if let Some(mode) = scan_mode {
            store.set_setting(TOOL_SCAN_MODE, mode.as_str()).await?;
        }
        if let Some(selectors) = &self.template_selectors {
            store.set_setting(TOOL_TEMPLATES, &selectors.join(",")).await?;
        }
        if let Some(severities) = &self.severity_filter {
            store.set_setting(TOOL_SEVERITY, &severities.join(",")).await?;
        }
        if let Some(v) = self.rate_limit {
            store.set_setting(TOOL_RATE_LIMIT, &v.to_string()).await?;
        }
        if let Some(v) = self.concurrency {
            store.set_setting(TOOL_CONCURRENCY, &v.to_string()).await?;
        }
        if let Some(v) = self.bulk_size {
            store.set_setting(TOOL_BULK_SIZE, &v.to_string()).await?;
        }
        if let Some(v) = &self.custom_args {
            store.set_setting(TOOL_CUSTOM_ARGS, v).await?;
        }
        if let Some(v) = self.max_new_findings_threshold {
            store.set_setting(TOOL_MAX_NEW_FINDINGS, &v.to_string()).await?;
        }
        load_tool_settings(store).await
    }
}

/// Stored credentials win; the environment fills the gaps.
pub async fn load_notification_settings(store: &dyn SettingsStore) -> Result<NotificationSettings> {
    let env = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
    let telegram_token = store
        .get_setting(NOTIFY_TELEGRAM_TOKEN)
        .await?
        .filter(|v| !v.is_empty())
        .or_else(|| env("TELEGRAM_BOT_TOKEN"));
    let telegram_chat_id = store
        .get_setting(NOTIFY_TELEGRAM_CHAT_ID)
        .await?
        .filter(|v| !v.is_empty())
        .or_else(|| env("TELEGRAM_CHAT_ID"));
    // an explicit "false" always wins; otherwise credentials enable delivery
    let enabled = match parsed::<bool>(store, NOTIFY_ENABLED).await? {
        Some(flag) => flag,
        None => telegram_token.is_some(),
    };

    Ok(NotificationSettings {
        enabled,
        telegram_token,
        telegram_chat_id,
    })
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NotificationSettingsPatch {
    pub enabled: Option<bool>,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl NotificationSettingsPatch {
    pub async fn apply(&self, store: &dyn SettingsStore) -> Result<NotificationSettings> {
        if let Some(enabled) = self.enabled {
            store.set_setting(NOTIFY_ENABLED, &enabled.to_string()).await?;
        }
        if let Some(token) = &self.telegram_token {
            store.set_setting(NOTIFY_TELEGRAM_TOKEN, token.trim()).await?;
        }
        if let Some(chat) = &self.telegram_chat_id {
            store.set_setting(NOTIFY_TELEGRAM_CHAT_ID, chat.trim()).await?;
        }
        load_notification_settings(store).await
    }
}
