mod job;
mod txn;

pub use job::{parse_jobs, Job, JobParseError};
pub use txn::{Milliunits, Transaction};
