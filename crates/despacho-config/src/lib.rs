// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading and validation for the despacho backplane.
//!
//! All settings come from the environment: `IMAP_*`, `DATABASE_URL`,
//! `FUZZY_MATCH_THRESHOLD`, plus the server-edge `HTTP_ADDR` and
//! `PDF_DIR`. Loading returns the typed config together with advisory
//! [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is absent.
    #[error("missing required environment variable: {name}")]
    MissingVar {
        /// Variable name.
        name: &'static str,
    },

    /// A variable is present but unusable.
    #[error("invalid value for {name}: {reason}")]
    InvalidVar {
        /// Variable name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory issues that do not prevent startup but deserve attention.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    /// TLS is disabled for the IMAP connection.
    InsecureImap,
    /// The poll interval is short enough to hammer the mailbox.
    ShortPollInterval {
        /// Configured interval in seconds.
        secs: u64,
    },
    /// The fuzzy threshold is permissive enough to mismatch products.
    LowFuzzyThreshold {
        /// Configured threshold in ratio points.
        threshold: f64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::InsecureImap => write!(f, "IMAP_SECURE=false — mailbox traffic is unencrypted"),
            ConfigWarning::ShortPollInterval { secs } => {
                write!(f, "IMAP_POLL_SECONDS={secs} is very aggressive")
            }
            ConfigWarning::LowFuzzyThreshold { threshold } => {
                write!(f, "FUZZY_MATCH_THRESHOLD={threshold} is permissive")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// IMAP mailbox settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImapConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: String,
    /// Folder to poll.
    pub folder: String,
    /// Poll interval.
    pub poll_interval: Duration,
    /// Whether to wrap the connection in TLS.
    pub secure: bool,
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// SQLite connection string.
    pub database_url: String,
    /// Mailbox settings.
    pub imap: ImapConfig,
    /// Fuzzy match acceptance threshold in ratio points (0–100).
    pub fuzzy_threshold: f64,
    /// HTTP listen address.
    pub http_addr: String,
    /// Directory for generated print documents.
    pub pdf_dir: String,
    /// Graceful-shutdown drain deadline.
    pub drain_deadline: Duration,
}

/// Default IMAP folder.
pub const DEFAULT_FOLDER: &str = "INBOX";
/// Default poll interval in seconds.
pub const DEFAULT_POLL_SECONDS: u64 = 15;
/// Default fuzzy threshold in ratio points.
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 80.0;
/// Default HTTP listen address.
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
/// Default document directory.
pub const DEFAULT_PDF_DIR: &str = "./comandas-pdf";
/// Default shutdown drain deadline in seconds.
pub const DEFAULT_DRAIN_SECONDS: u64 = 30;

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load through an arbitrary lookup function (injectable for tests).
    pub fn from_lookup<F>(lookup: F) -> Result<(Self, Vec<ConfigWarning>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = require(&lookup, "DATABASE_URL")?;
        let imap = ImapConfig {
            host: require(&lookup, "IMAP_HOST")?,
            port: parse_or(&lookup, "IMAP_PORT", 993)?,
            user: require(&lookup, "IMAP_USER")?,
            password: require(&lookup, "IMAP_PASSWORD")?,
            folder: lookup("IMAP_FOLDER").unwrap_or_else(|| DEFAULT_FOLDER.to_string()),
            poll_interval: Duration::from_secs(parse_or(
                &lookup,
                "IMAP_POLL_SECONDS",
                DEFAULT_POLL_SECONDS,
            )?),
            secure: parse_or(&lookup, "IMAP_SECURE", true)?,
        };
        let fuzzy_threshold = parse_or(&lookup, "FUZZY_MATCH_THRESHOLD", DEFAULT_FUZZY_THRESHOLD)?;
        if !(0.0..=100.0).contains(&fuzzy_threshold) {
            return Err(ConfigError::InvalidVar {
                name: "FUZZY_MATCH_THRESHOLD",
                reason: format!("{fuzzy_threshold} is outside 0..=100"),
            });
        }

        let config = Self {
            database_url,
            imap,
            fuzzy_threshold,
            http_addr: lookup("HTTP_ADDR").unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            pdf_dir: lookup("PDF_DIR").unwrap_or_else(|| DEFAULT_PDF_DIR.to_string()),
            drain_deadline: Duration::from_secs(parse_or(
                &lookup,
                "SHUTDOWN_DRAIN_SECONDS",
                DEFAULT_DRAIN_SECONDS,
            )?),
        };
        let warnings = config.validate();
        Ok((config, warnings))
    }

    /// Produce advisory warnings for a loaded configuration.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if !self.imap.secure {
            warnings.push(ConfigWarning::InsecureImap);
        }
        let secs = self.imap.poll_interval.as_secs();
        if secs < 5 {
            warnings.push(ConfigWarning::ShortPollInterval { secs });
        }
        if self.fuzzy_threshold < 60.0 {
            warnings.push(ConfigWarning::LowFuzzyThreshold {
                threshold: self.fuzzy_threshold,
            });
        }
        warnings
    }
}

fn require<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar { name }),
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidVar {
            name,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DATABASE_URL", "sqlite://despacho.db"),
            ("IMAP_HOST", "mail.example.com"),
            ("IMAP_USER", "pedidos"),
            ("IMAP_PASSWORD", "secret"),
        ]
    }

    #[test]
    fn defaults_apply() {
        let (config, warnings) = AppConfig::from_lookup(env(&minimal())).unwrap();
        assert_eq!(config.imap.port, 993);
        assert_eq!(config.imap.folder, "INBOX");
        assert_eq!(config.imap.poll_interval, Duration::from_secs(15));
        assert!(config.imap.secure);
        assert_eq!(config.fuzzy_threshold, 80.0);
        assert_eq!(config.http_addr, DEFAULT_HTTP_ADDR);
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_required_var() {
        let mut pairs = minimal();
        pairs.retain(|(k, _)| *k != "IMAP_HOST");
        let err = AppConfig::from_lookup(env(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar { name: "IMAP_HOST" }));
    }

    #[test]
    fn blank_required_var_is_missing() {
        let mut pairs = minimal();
        pairs.retain(|(k, _)| *k != "IMAP_PASSWORD");
        pairs.push(("IMAP_PASSWORD", "  "));
        let err = AppConfig::from_lookup(env(&pairs)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingVar {
                name: "IMAP_PASSWORD"
            }
        ));
    }

    #[test]
    fn invalid_port_rejected() {
        let mut pairs = minimal();
        pairs.push(("IMAP_PORT", "not-a-port"));
        let err = AppConfig::from_lookup(env(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "IMAP_PORT", .. }));
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let mut pairs = minimal();
        pairs.push(("FUZZY_MATCH_THRESHOLD", "140"));
        let err = AppConfig::from_lookup(env(&pairs)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidVar {
                name: "FUZZY_MATCH_THRESHOLD",
                ..
            }
        ));
    }

    #[test]
    fn insecure_and_aggressive_settings_warn() {
        let mut pairs = minimal();
        pairs.push(("IMAP_SECURE", "false"));
        pairs.push(("IMAP_POLL_SECONDS", "2"));
        pairs.push(("FUZZY_MATCH_THRESHOLD", "50"));
        let (config, warnings) = AppConfig::from_lookup(env(&pairs)).unwrap();
        assert!(!config.imap.secure);
        assert!(warnings.contains(&ConfigWarning::InsecureImap));
        assert!(warnings.contains(&ConfigWarning::ShortPollInterval { secs: 2 }));
        assert!(warnings.contains(&ConfigWarning::LowFuzzyThreshold { threshold: 50.0 }));
    }
}
