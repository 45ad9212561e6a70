//! Outbound scan summaries.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{db::SettingsStore, models::IngestReport, settings::load_notification_settings};

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification settings unavailable: {0}")]
    Settings(String),

    #[error("delivery failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification endpoint returned {0}")]
    Rejected(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Disabled, or credentials are missing.
    Skipped,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<Delivery, NotifyError>;
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _message: &str) -> Result<Delivery, NotifyError> {
        Ok(Delivery::Skipped)
    }
}

/// Sends through the Telegram Bot API. Credentials are read from the
/// settings store on every send so updates apply without a restart.
pub struct TelegramNotifier {
    store: Arc<dyn SettingsStore>,
    http: reqwest::Client,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self::with_api_base(store, TELEGRAM_API)
    }

    pub fn with_api_base(store: Arc<dyn SettingsStore>, api_base: impl Into<String>) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) -> Result<Delivery, NotifyError> {
        let settings = load_notification_settings(self.store.as_ref())
            .await
            .map_err(|e| NotifyError::Settings(e.to_string()))?;
        let (true, Some(token), Some(chat_id)) =
            (settings.enabled, settings.telegram_token, settings.telegram_chat_id)
        else {
            debug!("notification skipped: disabled or not configured");
            return Ok(Delivery::Skipped);
        };

        let res = self
            .http
            .post(format!("{}/bot{token}/sendMessage", self.api_base))
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": message,
                "parse_mode": "Markdown",
            }))
            .send()
            .await?;
        if !res.status().is_success() {
            warn!(status = res.status().as_u16(), "notification rejected");
            return Err(NotifyError::Rejected(res.status().as_u16()));
        }
        Ok(Delivery::Sent)
    }
}

/// Escapes the characters Telegram's legacy Markdown treats as markup.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Markdown summary of one scheduled scan.
pub fn format_scan_summary(target: &str, report: &IngestReport, new_names: &[String]) -> String {
    let mut msg = format!("🔍 *Scheduled Scan*\n\n🎯 *Target:* {}\n", escape_markdown(target));
    msg.push_str(&format!("📊 *Findings:* {}\n", report.total()));
    if report.inserted > 0 {
        msg.push_str(&format!("🆕 *New:* {}\n", report.inserted));
        for name in new_names.iter().take(10) {
            msg.push_str(&format!("   • {}\n", escape_markdown(name)));
        }
        if new_names.len() > 10 {
            msg.push_str(&format!("   _...and {} more_\n", new_names.len() - 10));
        }
    } else {
        msg.push_str("✓ *No new findings*\n");
    }
    if report.regressions > 0 {
        msg.push_str(&format!("⚠️ *Regressions:* {}\n", report.regressions));
    }
    msg.push_str("\n✅ *Status:* Completed");
    msg
}

pub fn format_scan_failure(target: &str, reason: &str) -> String {
    format!(
        "🔍 *Scheduled Scan*\n\n🎯 *Target:* {}\n❌ *Status:* Failed\n{}",
        escape_markdown(target),
        escape_markdown(reason)
    )
}
