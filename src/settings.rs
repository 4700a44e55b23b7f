use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::core::{parse_jobs, Job, JobParseError};
use crate::upstream::gocardless::{self, Credentials};
use crate::CLIENT_NAME;

const CONFIG_NAME: &str = "config.toml";
const ENV_PREFIX: &str = "TALLY";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load configuration")]
    Config(#[from] config::ConfigError),
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid jobs setting")]
    Jobs(#[from] JobParseError),
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub http_timeout_secs: u64,
    pub schedule: String,
    pub gocardless: GoCardless,
    pub ynab: Ynab,
    pub link: Link,
    #[serde(default)]
    jobs: Option<JobsConfig>,
}

#[derive(Deserialize)]
pub struct GoCardless {
    pub secret_id: String,
    pub secret_key: String,
    pub base_url: String,
}

#[derive(Deserialize)]
pub struct Ynab {
    pub token: String,
    pub base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct Link {
    pub institution_id: Option<String>,
    pub port: u16,
    pub auth_timeout_secs: u64,
    pub open_browser: bool,
}

/// Jobs are either a list of tables or the compact
/// `SRC,BUDGET,DEST|SRC,BUDGET,DEST` form, which fits in one env var.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JobsConfig {
    List(Vec<Job>),
    Compact(String),
}

impl std::fmt::Debug for GoCardless {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoCardless")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl std::fmt::Debug for Ynab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ynab")
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, Error> {
        let s = Config::builder()
            .set_default("http_timeout_secs", 20)?
            .set_default("schedule", "0 0 6,18 * * *")?
            .set_default("gocardless.secret_id", "")?
            .set_default("gocardless.secret_key", "")?
            .set_default("gocardless.base_url", gocardless::DEFAULT_BASE_URL)?
            .set_default("ynab.token", "")?
            .set_default("ynab.base_url", crate::ledger::ynab::DEFAULT_BASE_URL)?
            .set_default("link.port", 8080)?
            .set_default("link.auth_timeout_secs", 300)?
            .set_default("link.open_browser", true)?;

        let s = match config_path {
            Some(path) => s.add_source(File::with_name(path)),
            None => s.add_source(File::with_name(&default_config_path()).required(false)),
        };

        Ok(s
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Configured jobs; an empty list is an error since there is nothing to
    /// sync.
    pub fn jobs(&self) -> Result<Vec<Job>, Error> {
        let jobs = match &self.jobs {
            Some(JobsConfig::List(jobs)) => jobs
                .iter()
                .cloned()
                .map(Job::validate)
                .collect::<Result<Vec<_>, _>>()?,
            Some(JobsConfig::Compact(raw)) => parse_jobs(raw)?,
            None => vec![],
        };

        if jobs.is_empty() {
            return Err(Error::Jobs(JobParseError::Empty));
        }

        Ok(jobs)
    }
}

impl GoCardless {
    pub fn credentials(&self) -> Result<Credentials, Error> {
        if self.secret_id.is_empty() {
            return Err(Error::Missing("gocardless.secret_id"));
        }
        if self.secret_key.is_empty() {
            return Err(Error::Missing("gocardless.secret_key"));
        }

        Ok(Credentials {
            secret_id: self.secret_id.clone(),
            secret_key: self.secret_key.clone(),
        })
    }
}

impl Ynab {
    pub fn token(&self) -> Result<String, Error> {
        if self.token.is_empty() {
            return Err(Error::Missing("ynab.token"));
        }

        Ok(self.token.clone())
    }
}

pub(crate) fn default_config_path() -> String {
    dirs::config_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()))
        .join(CLIENT_NAME)
        .join(CONFIG_NAME)
        .display()
        .to_string()
}
