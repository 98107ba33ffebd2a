use chrono::Duration;
use chrono_tz::Tz;

use crate::backend::OpenAiConfig;
use crate::ledger::{DEFAULT_SYSTEM_PROMPT, QuotaPolicy};
use crate::verify::FIREBASE_JWKS_URL;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_DISPLAY_TZ: &str = "Europe/Istanbul";
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be set")]
    Missing { name: &'static str },
    #[error("{name} has an invalid value: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// How bearer tokens are checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifierConfig {
    Jwks { project_id: String, jwks_url: String },
    SharedSecret { project_id: String, secret: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub quota: QuotaPolicy,
    pub display_tz: Tz,
    pub system_prompt: String,
    pub cors_origins: Vec<String>,
    pub openai: OpenAiConfig,
    pub verifier: VerifierConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = match get("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                name: "PORT",
                reason: e.to_string(),
            })?,
            None => DEFAULT_PORT,
        };

        let mut quota = QuotaPolicy::default();
        if let Some(raw) = get("MOTORCHAT_QUOTA_LIMIT") {
            quota.limit = raw.parse::<u32>().map_err(|e| ConfigError::Invalid {
                name: "MOTORCHAT_QUOTA_LIMIT",
                reason: e.to_string(),
            })?;
        }
        if let Some(raw) = get("MOTORCHAT_QUOTA_WINDOW_SECS") {
            let secs = raw
                .parse::<i64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "MOTORCHAT_QUOTA_WINDOW_SECS",
                    reason: format!("expected a positive number of seconds, got '{raw}'"),
                })?;
            quota.window = Duration::seconds(secs);
        }

        let tz_name = get("MOTORCHAT_DISPLAY_TZ").unwrap_or_else(|| DEFAULT_DISPLAY_TZ.to_string());
        let display_tz = tz_name.parse::<Tz>().map_err(|e| ConfigError::Invalid {
            name: "MOTORCHAT_DISPLAY_TZ",
            reason: e.to_string(),
        })?;

        let cors_origins = get("MOTORCHAT_CORS_ORIGINS")
            .unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();

        let openai = OpenAiConfig {
            api_key: get("OPENAI_API_KEY").ok_or(ConfigError::Missing {
                name: "OPENAI_API_KEY",
            })?,
            base_url: get("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
        };

        let project_id = get("FIREBASE_PROJECT_ID").ok_or(ConfigError::Missing {
            name: "FIREBASE_PROJECT_ID",
        })?;
        let verifier = match get("MOTORCHAT_JWT_SECRET") {
            Some(secret) => VerifierConfig::SharedSecret { project_id, secret },
            None => VerifierConfig::Jwks {
                project_id,
                jwks_url: get("MOTORCHAT_JWKS_URL").unwrap_or_else(|| FIREBASE_JWKS_URL.to_string()),
            },
        };

        Ok(Self {
            port,
            quota,
            display_tz,
            system_prompt: get("MOTORCHAT_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            cors_origins,
            openai,
            verifier,
        })
    }
}
