use std::path::PathBuf;
use std::str::FromStr;

use chrono::FixedOffset;

use crate::model::{AccountDraft, Profile};

/// Server settings, read from `TUTORBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Offset in which window weekdays and times are interpreted.
    pub zone: FixedOffset,
    /// Admin account ensured at startup, if configured.
    pub admin: Option<AccountDraft>,
}

#[derive(Debug)]
pub struct ConfigError(String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.parse().ok())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let offset_minutes: i32 = parsed(&lookup, "TUTORBOOK_UTC_OFFSET_MINUTES").unwrap_or(0);
        let zone = FixedOffset::east_opt(offset_minutes * 60)
            .ok_or_else(|| ConfigError(format!("UTC offset out of range: {offset_minutes} minutes")))?;

        let admin = match (lookup("TUTORBOOK_ADMIN_NUID"), lookup("TUTORBOOK_ADMIN_EMAIL")) {
            (Some(nuid), Some(email)) => Some(AccountDraft {
                first_name: lookup("TUTORBOOK_ADMIN_FIRST_NAME").unwrap_or_else(|| "Site".into()),
                last_name: lookup("TUTORBOOK_ADMIN_LAST_NAME").unwrap_or_else(|| "Admin".into()),
                email,
                nuid,
                profile: Profile::Admin,
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError(
                    "TUTORBOOK_ADMIN_NUID and TUTORBOOK_ADMIN_EMAIL must be set together".into(),
                ));
            }
        };

        Ok(Self {
            port: parsed(&lookup, "TUTORBOOK_PORT").unwrap_or(7878),
            bind: lookup("TUTORBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("TUTORBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("TUTORBOOK_PASSWORD").unwrap_or_else(|| "tutorbook".into()),
            max_connections: parsed(&lookup, "TUTORBOOK_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&lookup, "TUTORBOOK_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed(&lookup, "TUTORBOOK_METRICS_PORT"),
            zone,
            admin,
        })
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("tutorbook.journal")
    }
}
