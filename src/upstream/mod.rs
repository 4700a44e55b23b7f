pub mod gocardless;
pub mod session;

use std::fmt;
use std::time::Duration;

use axum::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

pub use gocardless::{RawTransaction, RawTransactions, Requisition, RequisitionStatus};
pub use session::SessionManager;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication rejected with status {status}: {body}")]
    Authentication { status: u16, body: String },
    #[error("rate limited by upstream, reset in {}", display_reset(.reset))]
    RateLimited { reset: Option<Duration> },
    #[error("failed to list transactions: status {status}")]
    Fetch {
        status: u16,
        headers: Vec<(String, String)>,
    },
    #[error("upstream request failed with status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("upstream request failed")]
    Http(#[from] reqwest::Error),
    #[error("failed to decode upstream response")]
    Decode(#[from] serde_json::Error),
}

impl Error {
    /// True when the provider rejected the access token itself.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Error::Fetch { status: 401, .. } | Error::Api { status: 401, .. }
        )
    }
}

fn display_reset(reset: &Option<Duration>) -> String {
    match reset {
        Some(d) => format!("{}s", d.as_secs()),
        None => "unknown".to_string(),
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Session is the token pair issued by the data provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access: String,
    pub refresh: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait Authenticator {
    /// Exchanges the long-lived credentials for a fresh token pair.
    async fn login(&self) -> Result<Session>;
    /// Exchanges the refresh token of `session` for a new access token.
    async fn refresh(&self, session: &Session) -> Result<Session>;
}

#[async_trait]
pub trait TransactionSource {
    /// Lists booked and pending transactions of `account_id` between `from`
    /// and `to`, both inclusive.
    async fn transactions(
        &self,
        session: &Session,
        account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<RawTransactions>;
}

#[async_trait]
pub trait LinkSource: Authenticator {
    async fn create_agreement(&self, session: &Session, institution_id: &str) -> Result<String>;
    async fn create_requisition(
        &self,
        session: &Session,
        request: &RequisitionRequest,
    ) -> Result<Requisition>;
    async fn requisition(&self, session: &Session, id: &str) -> Result<Requisition>;
    async fn requisitions(&self, session: &Session) -> Result<Vec<Requisition>>;
}

/// Parameters of a new requisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequisitionRequest {
    pub institution_id: String,
    pub agreement_id: String,
    pub redirect: String,
    pub reference: String,
}
