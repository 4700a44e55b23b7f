use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobParseError {
    #[error("no jobs configured")]
    Empty,
    #[error("invalid job configuration: {0:?}, expected SOURCE_ACCOUNT,BUDGET,DESTINATION_ACCOUNT")]
    Invalid(String),
}

/// Job pairs one upstream bank account with one account of a budget.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    pub source_account: String,
    pub budget: String,
    pub destination_account: String,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}/{}",
            self.source_account, self.budget, self.destination_account
        )
    }
}

impl FromStr for Job {
    type Err = JobParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();

        match parts.as_slice() {
            [source, budget, destination] => Job {
                source_account: source.to_string(),
                budget: budget.to_string(),
                destination_account: destination.to_string(),
            }
            .validate()
            .map_err(|_| JobParseError::Invalid(s.to_string())),
            _ => Err(JobParseError::Invalid(s.to_string())),
        }
    }
}

impl Job {
    /// Checks every identifier is present, naming the entry when one is not.
    pub fn validate(self) -> Result<Self, JobParseError> {
        if self.source_account.trim().is_empty()
            || self.budget.trim().is_empty()
            || self.destination_account.trim().is_empty()
        {
            return Err(JobParseError::Invalid(format!(
                "{},{},{}",
                self.source_account, self.budget, self.destination_account
            )));
        }

        Ok(self)
    }
}

/// Parses the compact `SRC,BUDGET,DEST|SRC,BUDGET,DEST` job list form.
pub fn parse_jobs(source: &str) -> Result<Vec<Job>, JobParseError> {
    if source.trim().is_empty() {
        return Err(JobParseError::Empty);
    }

    source
        .split('|')
        .filter(|entry| !entry.trim().is_empty())
        .map(str::parse)
        .collect()
}
