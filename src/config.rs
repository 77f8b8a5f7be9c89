use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use axum::http::HeaderName;
use thiserror::Error;

use crate::lease::ReleasePolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Where slots live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-memory table with a journal file under `data_dir`.
    Journal { data_dir: PathBuf },
    /// PostgreSQL `slots` table.
    Postgres { url: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub backend: StoreBackend,
    /// Journal appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Header carrying the caller identity set by the auth gateway.
    pub identity_header: HeaderName,
    pub release_policy: ReleasePolicy,
    /// Include store error detail in 500 responses.
    pub expose_errors: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let backend = match get("SLOTLEASE_DATABASE_URL") {
            Some(url) => StoreBackend::Postgres { url },
            None => StoreBackend::Journal {
                data_dir: PathBuf::from(get("SLOTLEASE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            },
        };

        let identity_header = match get("SLOTLEASE_IDENTITY_HEADER") {
            Some(raw) => HeaderName::from_str(raw.trim()).map_err(|e| ConfigError::Invalid {
                var: "SLOTLEASE_IDENTITY_HEADER",
                reason: e.to_string(),
            })?,
            None => HeaderName::from_static("x-caller-id"),
        };

        let expose_errors = match get("SLOTLEASE_EXPOSE_ERRORS") {
            Some(raw) => parse_bool("SLOTLEASE_EXPOSE_ERRORS", &raw)?,
            None => cfg!(debug_assertions),
        };

        Ok(Self {
            bind: get("SLOTLEASE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or("SLOTLEASE_PORT", get("SLOTLEASE_PORT"), 8080)?,
            backend,
            compact_threshold: parse_or("SLOTLEASE_COMPACT_THRESHOLD", get("SLOTLEASE_COMPACT_THRESHOLD"), 1000)?,
            metrics_port: get("SLOTLEASE_METRICS_PORT")
                .map(|raw| parse("SLOTLEASE_METRICS_PORT", &raw))
                .transpose()?,
            identity_header,
            release_policy: parse_or(
                "SLOTLEASE_RELEASE_POLICY",
                get("SLOTLEASE_RELEASE_POLICY"),
                ReleasePolicy::default(),
            )?,
            expose_errors,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: format!("{raw:?}: {e}"),
    })
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match raw {
        Some(raw) => parse(var, &raw),
        None => Ok(default),
    }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            reason: format!("{raw:?} is not a boolean"),
        }),
    }
}
