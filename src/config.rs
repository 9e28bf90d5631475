use std::env;
use std::fs;
use std::path::Path;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::models::{PipelineError, ScreeningConditions};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineConfig {
    pub user_id: String,
    #[serde(default)]
    pub channel_secret: String,
    pub channel_access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    /// goodinfo session cookie; some sheets serve truncated tables without it
    pub cookie: Option<String>,
    pub lookback_days: i64,
    pub timeout_seconds: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cookie: None,
            lookback_days: 365,
            timeout_seconds: 30,
        }
    }
}

fn default_openai_base_url() -> String {
    DEFAULT_OPENAI_BASE_URL.to_string()
}

fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Application configuration. Credentials have no built-in fallback values:
/// they come from a JSON config file or the environment, and `validate`
/// failure is fatal at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub line: LineConfig,
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub screening: ScreeningConditions,
    /// Pinned revenue labels; when absent they follow the calendar.
    #[serde(default)]
    pub revenue_labels: Option<Vec<String>>,
}

impl AppConfig {
    /// Load from a JSON file when a path is given, otherwise from the
    /// environment (LINE_USER_ID, LINE_CHANNEL_SECRET,
    /// LINE_CHANNEL_ACCESS_TOKEN, OPENAI_API_KEY, OPENAI_BASE_URL,
    /// OPENAI_MODEL, GOODINFO_COOKIE).
    pub fn load(path: Option<&Path>) -> Result<AppConfig, PipelineError> {
        match path {
            Some(p) => {
                let text = fs::read_to_string(p).map_err(|e| {
                    PipelineError::Config(format!("cannot read {}: {}", p.display(), e))
                })?;
                serde_json::from_str(&text).map_err(|e| {
                    PipelineError::Config(format!("cannot parse {}: {}", p.display(), e))
                })
            }
            None => Ok(AppConfig::from_env()),
        }
    }

    fn from_env() -> AppConfig {
        AppConfig {
            line: LineConfig {
                user_id: env::var("LINE_USER_ID").unwrap_or_default(),
                channel_secret: env::var("LINE_CHANNEL_SECRET").unwrap_or_default(),
                channel_access_token: env::var("LINE_CHANNEL_ACCESS_TOKEN").unwrap_or_default(),
            },
            openai: OpenAiConfig {
                api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| default_openai_base_url()),
                model: env::var("OPENAI_MODEL").unwrap_or_else(|_| default_openai_model()),
                timeout_seconds: env::var("OPENAI_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_timeout),
            },
            fetch: FetchConfig {
                cookie: env::var("GOODINFO_COOKIE").ok(),
                ..FetchConfig::default()
            },
            screening: ScreeningConditions::default(),
            revenue_labels: None,
        }
    }

    /// Missing credentials are a fatal startup error, not a silent fallback.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut missing = Vec::new();
        if self.line.user_id.is_empty() {
            missing.push("line.user_id (LINE_USER_ID)");
        }
        if self.line.channel_access_token.is_empty() {
            missing.push("line.channel_access_token (LINE_CHANNEL_ACCESS_TOKEN)");
        }
        if self.openai.api_key.is_empty() {
            missing.push("openai.api_key (OPENAI_API_KEY)");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(format!(
                "missing required credentials: {}",
                missing.join(", ")
            )))
        }
    }

    /// The 12 expected revenue column labels, oldest first: the 12 calendar
    /// months preceding `today`'s month. The revenue sheet lags a month, so
    /// the current month never appears. Supplied to the merger from here,
    /// never derived from scraped data.
    pub fn expected_revenue_labels(&self, today: NaiveDate) -> Vec<String> {
        if let Some(labels) = &self.revenue_labels {
            return labels.clone();
        }
        let mut labels = Vec::with_capacity(12);
        let mut year = today.year();
        let mut month = today.month();
        for _ in 0..12 {
            if month == 1 {
                year -= 1;
                month = 12;
            } else {
                month -= 1;
            }
            labels.push(format!("{}年{}月營收 (億)", year, month));
        }
        labels.reverse();
        labels
    }
}
