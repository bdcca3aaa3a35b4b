//! Configuration types.
//!
//! `AppConfig` is process configuration read from the environment at startup.
//! `SystemConfig` is the persisted, admin-editable singleton consulted on
//! every polling pass.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default cron expression for the cold-lead sweep (daily at 09:00 UTC).
pub const DEFAULT_COLD_SWEEP_CRON: &str = "0 0 9 * * *";

/// Language-model backends the engine can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Grok,
    #[serde(rename = "openai")]
    OpenAi,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grok => write!(f, "grok"),
            Self::OpenAi => write!(f, "openai"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grok" => Ok(Self::Grok),
            "openai" => Ok(Self::OpenAi),
            other => Err(ConfigError::InvalidValue {
                key: "provider".into(),
                message: format!("unknown provider '{other}' (expected grok or openai)"),
            }),
        }
    }
}

/// Persisted system settings. Exactly one instance exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub polling_interval_minutes: u32,
    pub cold_lead_threshold_days: u32,
    pub cold_lead_notifications_enabled: bool,
    pub max_message_exchanges: u32,
    pub primary_provider: ProviderKind,
    pub fallback_provider: ProviderKind,
}

impl SystemConfig {
    /// Build a validated config.
    pub fn new(
        polling_interval_minutes: u32,
        cold_lead_threshold_days: u32,
        cold_lead_notifications_enabled: bool,
        max_message_exchanges: u32,
        primary_provider: ProviderKind,
        fallback_provider: ProviderKind,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            polling_interval_minutes,
            cold_lead_threshold_days,
            cold_lead_notifications_enabled,
            max_message_exchanges,
            primary_provider,
            fallback_provider,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants `new` enforces. Rows read back from the
    /// database go through this too.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling_interval_minutes == 0 {
            return Err(invalid("polling_interval_minutes", "must be at least 1"));
        }
        if self.cold_lead_threshold_days == 0 {
            return Err(invalid("cold_lead_threshold_days", "must be at least 1"));
        }
        if self.max_message_exchanges == 0 {
            return Err(invalid("max_message_exchanges", "must be at least 1"));
        }
        if self.primary_provider == self.fallback_provider {
            return Err(invalid(
                "fallback_provider",
                "must differ from primary_provider",
            ));
        }
        Ok(())
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            polling_interval_minutes: 5,
            cold_lead_threshold_days: 7,
            cold_lead_notifications_enabled: false,
            max_message_exchanges: 10,
            primary_provider: ProviderKind::Grok,
            fallback_provider: ProviderKind::OpenAi,
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Lead-scoring thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    /// Score at or above which a lead is hot.
    pub hot_threshold: f64,
    /// Score at or above which a lead is worth logging as warm.
    pub warm_threshold: f64,
    /// First hour (UTC, inclusive) of the business-hours window.
    pub business_hours_start: u32,
    /// Last hour (UTC, inclusive) of the business-hours window.
    pub business_hours_end: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            hot_threshold: 0.7,
            warm_threshold: 0.5,
            business_hours_start: 9,
            business_hours_end: 17,
        }
    }
}

/// Connection settings for one chat-completions backend.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
}

/// Process configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    pub grok: ProviderSettings,
    pub openai: ProviderSettings,
    /// Provider the outcome classifier is pinned to.
    pub classifier_provider: ProviderKind,
    pub scoring: ScoringConfig,
    pub sales_team_email: Option<String>,
    pub cold_sweep_cron: String,
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("LEADS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/leads.db"));

        let http_port: u16 = parse_env("LEADS_HTTP_PORT", 8080)?;

        let grok = ProviderSettings {
            api_key: SecretString::from(std::env::var("GROK_API_KEY").unwrap_or_default()),
            base_url: std::env::var("GROK_BASE_URL")
                .unwrap_or_else(|_| "https://api.x.ai/v1".to_string()),
            model: std::env::var("GROK_MODEL").unwrap_or_else(|_| "grok-3-mini".to_string()),
        };

        let openai = ProviderSettings {
            api_key: SecretString::from(std::env::var("OPENAI_API_KEY").unwrap_or_default()),
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        };

        let classifier_provider = match std::env::var("LEADS_CLASSIFIER_PROVIDER") {
            Ok(v) => v.parse()?,
            Err(_) => ProviderKind::OpenAi,
        };

        let scoring = ScoringConfig {
            hot_threshold: parse_env("LEADS_HOT_THRESHOLD", 0.7)?,
            warm_threshold: parse_env("LEADS_WARM_THRESHOLD", 0.5)?,
            business_hours_start: parse_env("LEADS_BUSINESS_HOURS_START", 9)?,
            business_hours_end: parse_env("LEADS_BUSINESS_HOURS_END", 17)?,
        };
        if !(0.0..=1.0).contains(&scoring.hot_threshold) {
            return Err(invalid("LEADS_HOT_THRESHOLD", "must be between 0 and 1"));
        }
        if scoring.business_hours_start > scoring.business_hours_end
            || scoring.business_hours_end > 23
        {
            return Err(invalid(
                "LEADS_BUSINESS_HOURS_END",
                "business hours must be an ordered range within 0..=23",
            ));
        }

        let sales_team_email = std::env::var("SALES_TEAM_EMAIL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let cold_sweep_cron = std::env::var("LEADS_COLD_SWEEP_CRON")
            .unwrap_or_else(|_| DEFAULT_COLD_SWEEP_CRON.to_string());

        let log_dir = std::env::var("LEADS_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            db_path,
            http_port,
            grok,
            openai,
            classifier_provider,
            scoring,
            sales_team_email,
            cold_sweep_cron,
            log_dir,
        })
    }

    /// Settings for the given backend.
    pub fn provider(&self, kind: ProviderKind) -> &ProviderSettings {
        match kind {
            ProviderKind::Grok => &self.grok,
            ProviderKind::OpenAi => &self.openai,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}
