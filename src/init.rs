use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::delivery::{DeliveryTarget, SurfaceConfig};
use crate::error::{ErrorContext, RelayError, Result};
use crate::relay::RelaySettings;
use crate::stream::DeltaSource;

const DEFAULT_API_URL: &str = "https://slack.com/api";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Configuration
// ============================================================================

/// Where the inbound delta stream comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceConfig {
    File(PathBuf),
    Url { url: String, token: Option<String> },
}

/// Everything needed to relay a stream to a live message.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub surface: SurfaceConfig,
    pub target: DeliveryTarget,
    pub settings: RelaySettings,
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| RelayError::config(format!("{} is not set", key)))
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| RelayError::config(format!("{} has an invalid value: {}", key, raw))),
    }
}

impl SourceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// A file source takes precedence over a URL.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = lookup("DELTA_STREAM_FILE").filter(|p| !p.is_empty()) {
            return Ok(Self::File(PathBuf::from(path)));
        }
        let url = required(&lookup, "DELTA_STREAM_URL")
            .map_err(|_| RelayError::config("set DELTA_STREAM_FILE or DELTA_STREAM_URL"))?;
        Ok(Self::Url {
            url,
            token: lookup("DELTA_STREAM_TOKEN").filter(|t| !t.is_empty()),
        })
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            surface: SurfaceConfig {
                api_url: lookup("SURFACE_API_URL")
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
                token: required(&lookup, "SURFACE_TOKEN")?,
                timeout: Duration::from_secs(parsed(
                    &lookup,
                    "SURFACE_TIMEOUT_SECS",
                    DEFAULT_TIMEOUT_SECS,
                )?),
            },
            target: DeliveryTarget {
                channel: required(&lookup, "RELAY_CHANNEL")?,
                thread: lookup("RELAY_THREAD").filter(|v| !v.is_empty()),
            },
            settings: RelaySettings {
                debounce: Duration::from_millis(parsed(
                    &lookup,
                    "RELAY_DEBOUNCE_MS",
                    RelaySettings::default().debounce.as_millis() as u64,
                )?),
            },
        })
    }
}

// ============================================================================
// Source opening
// ============================================================================

pub async fn open_source(config: &SourceConfig) -> Result<DeltaSource> {
    match config {
        SourceConfig::File(path) => {
            log::info!("📂 Reading delta stream from {}", path.display());
            let data = tokio::fs::read(path)
                .await
                .context(format!("reading {}", path.display()))?;
            Ok(DeltaSource::from_bytes(data))
        }
        SourceConfig::Url { url, token } => {
            log::info!("🔌 Connecting to delta stream at {}", url);
            let mut request = reqwest::Client::new()
                .get(url)
                .header(reqwest::header::ACCEPT, "text/event-stream");
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| RelayError::stream(format!("connecting to delta stream: {}", e)))?;
            log::info!("✅ Delta stream connected ({})", response.status());
            Ok(DeltaSource::from_response(response))
        }
    }
}
