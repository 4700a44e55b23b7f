use std::fmt;
use std::time::Duration;

use axum::async_trait;
use chrono::NaiveDate;
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    Authenticator, Error, LinkSource, RequisitionRequest, Result, Session, TransactionSource,
};

pub const DEFAULT_BASE_URL: &str = "https://bankaccountdata.gocardless.com";

pub const MAX_HISTORICAL_DAYS: u32 = 90;
pub const ACCESS_VALID_FOR_DAYS: u32 = 179;
pub const ACCESS_SCOPE: [&str; 3] = ["balances", "details", "transactions"];

const USER_LANGUAGE: &str = "EN";
const DATE_FORMAT: &str = "%Y-%m-%d";

const RATE_LIMIT_RESET_HEADER: &str = "http_x_ratelimit_account_success_reset";
const RATE_LIMIT_HEADERS: [&str; 6] = [
    "http_x_ratelimit_limit",
    "http_x_ratelimit_remaining",
    "http_x_ratelimit_reset",
    "http_x_ratelimit_account_success_limit",
    "http_x_ratelimit_account_success_remaining",
    RATE_LIMIT_RESET_HEADER,
];

const MAX_DIAGNOSTIC_HEADERS: usize = 16;
const MAX_DIAGNOSTIC_VALUE: usize = 128;

#[derive(Clone)]
pub struct Credentials {
    pub secret_id: String,
    pub secret_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Client talks to the GoCardless Bank Account Data API.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum RequisitionStatus {
    Created,
    GivingConsent,
    UndergoingAuthentication,
    Rejected,
    SelectingAccounts,
    GrantingAccess,
    Linked,
    Expired,
    Other(String),
}

impl RequisitionStatus {
    pub fn code(&self) -> &str {
        match self {
            RequisitionStatus::Created => "CR",
            RequisitionStatus::GivingConsent => "GC",
            RequisitionStatus::UndergoingAuthentication => "UA",
            RequisitionStatus::Rejected => "RJ",
            RequisitionStatus::SelectingAccounts => "SA",
            RequisitionStatus::GrantingAccess => "GA",
            RequisitionStatus::Linked => "LN",
            RequisitionStatus::Expired => "EX",
            RequisitionStatus::Other(code) => code,
        }
    }
}

impl From<String> for RequisitionStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CR" => RequisitionStatus::Created,
            "GC" => RequisitionStatus::GivingConsent,
            "UA" => RequisitionStatus::UndergoingAuthentication,
            "RJ" => RequisitionStatus::Rejected,
            "SA" => RequisitionStatus::SelectingAccounts,
            "GA" => RequisitionStatus::GrantingAccess,
            "LN" => RequisitionStatus::Linked,
            "EX" => RequisitionStatus::Expired,
            _ => RequisitionStatus::Other(value),
        }
    }
}

impl fmt::Display for RequisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Requisition {
    pub id: String,
    pub status: RequisitionStatus,
    #[serde(default)]
    pub institution_id: String,
    #[serde(default)]
    pub agreement: Option<String>,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub accounts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawTransactions {
    #[serde(default)]
    pub booked: Vec<RawTransaction>,
    #[serde(default)]
    pub pending: Vec<RawTransaction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTransaction {
    pub transaction_id: Option<String>,
    pub internal_transaction_id: Option<String>,
    pub booking_date: Option<String>,
    pub value_date: Option<String>,
    pub transaction_amount: RawAmount,
    pub remittance_information_unstructured: Option<String>,
    pub debtor_name: Option<String>,
    pub creditor_name: Option<String>,
    pub additional_information: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawAmount {
    pub amount: String,
    pub currency: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    secret_id: &'a str,
    secret_key: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access: String,
    refresh: String,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
}

#[derive(Serialize)]
struct AgreementRequest<'a> {
    institution_id: &'a str,
    max_historical_days: String,
    access_valid_for_days: String,
    access_scope: &'a [&'a str],
}

#[derive(Deserialize)]
struct AgreementResponse {
    id: String,
}

#[derive(Serialize)]
struct CreateRequisitionRequest<'a> {
    redirect: &'a str,
    institution_id: &'a str,
    reference: &'a str,
    agreement: &'a str,
    user_language: &'a str,
}

#[derive(Deserialize)]
struct RequisitionsResponse {
    #[serde(default)]
    results: Vec<Requisition>,
}

#[derive(Deserialize)]
struct TransactionsResponse {
    #[serde(default)]
    transactions: RawTransactions,
}

impl Client {
    pub fn new(credentials: Credentials, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.base_url, path)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        session: &Session,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .bearer_auth(&session.access)
            .json(body)
            .send()
            .await?;

        decode(resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, session: &Session) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(&session.access)
            .send()
            .await?;

        decode(resp).await
    }

    async fn token<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self.http.post(self.url(path)).json(body).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(Error::Authentication {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        return Err(Error::Api {
            status: status.as_u16(),
            body,
        });
    }

    Ok(serde_json::from_str(&body)?)
}

/// Reads the account success reset header, a count of seconds.
fn rate_limit_reset(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RATE_LIMIT_RESET_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .trim_end_matches('s')
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn diagnostic_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .take(MAX_DIAGNOSTIC_HEADERS)
        .map(|(name, value)| {
            let value = String::from_utf8_lossy(value.as_bytes());
            (
                name.to_string(),
                value.chars().take(MAX_DIAGNOSTIC_VALUE).collect(),
            )
        })
        .collect()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

#[async_trait]
impl Authenticator for Client {
    #[tracing::instrument(skip(self))]
    async fn login(&self) -> Result<Session> {
        let resp: LoginResponse = self
            .token(
                "token/new/",
                &LoginRequest {
                    secret_id: &self.credentials.secret_id,
                    secret_key: &self.credentials.secret_key,
                },
            )
            .await?;

        info!("logged in");

        Ok(Session {
            access: resp.access,
            refresh: resp.refresh,
        })
    }

    #[tracing::instrument(skip(self, session))]
    async fn refresh(&self, session: &Session) -> Result<Session> {
        let resp: RefreshResponse = self
            .token(
                "token/refresh/",
                &RefreshRequest {
                    refresh: &session.refresh,
                },
            )
            .await?;

        info!("refreshed access token");

        Ok(Session {
            access: resp.access,
            refresh: session.refresh.clone(),
        })
    }
}

#[async_trait]
impl TransactionSource for Client {
    #[tracing::instrument(skip(self, session, from, to), fields(from = %from, to = %to))]
    async fn transactions(
        &self,
        session: &Session,
        account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<RawTransactions> {
        let resp = self
            .http
            .get(self.url(&format!("accounts/{}/transactions/", account_id)))
            .bearer_auth(&session.access)
            .query(&[
                ("date_from", from.format(DATE_FORMAT).to_string()),
                ("date_to", to.format(DATE_FORMAT).to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let headers = resp.headers();
            let reset = rate_limit_reset(headers);
            warn!(
                %status,
                limit = header_value(headers, RATE_LIMIT_HEADERS[0]),
                remaining = header_value(headers, RATE_LIMIT_HEADERS[1]),
                reset = header_value(headers, RATE_LIMIT_HEADERS[2]),
                account_success_limit = header_value(headers, RATE_LIMIT_HEADERS[3]),
                account_success_remaining = header_value(headers, RATE_LIMIT_HEADERS[4]),
                account_success_reset = header_value(headers, RATE_LIMIT_HEADERS[5]),
                reset_in = ?reset,
                "too many requests"
            );

            return Err(Error::RateLimited { reset });
        }

        if !status.is_success() {
            let headers = diagnostic_headers(resp.headers());
            warn!(%status, ?headers, "failed to list transactions");

            return Err(Error::Fetch {
                status: status.as_u16(),
                headers,
            });
        }

        let body = resp.text().await?;
        let parsed: TransactionsResponse = serde_json::from_str(&body)?;
        info!(
            booked = parsed.transactions.booked.len(),
            pending = parsed.transactions.pending.len(),
            "got transactions"
        );

        Ok(parsed.transactions)
    }
}

#[async_trait]
impl LinkSource for Client {
    #[tracing::instrument(skip(self, session))]
    async fn create_agreement(&self, session: &Session, institution_id: &str) -> Result<String> {
        let resp: AgreementResponse = self
            .post(
                "agreements/enduser/",
                session,
                &AgreementRequest {
                    institution_id,
                    max_historical_days: MAX_HISTORICAL_DAYS.to_string(),
                    access_valid_for_days: ACCESS_VALID_FOR_DAYS.to_string(),
                    access_scope: &ACCESS_SCOPE,
                },
            )
            .await?;

        info!(id = %resp.id, "created agreement");

        Ok(resp.id)
    }

    #[tracing::instrument(skip(self, session))]
    async fn create_requisition(
        &self,
        session: &Session,
        request: &RequisitionRequest,
    ) -> Result<Requisition> {
        let requisition: Requisition = self
            .post(
                "requisitions/",
                session,
                &CreateRequisitionRequest {
                    redirect: &request.redirect,
                    institution_id: &request.institution_id,
                    reference: &request.reference,
                    agreement: &request.agreement_id,
                    user_language: USER_LANGUAGE,
                },
            )
            .await?;

        info!(id = %requisition.id, "created requisition");

        Ok(requisition)
    }

    #[tracing::instrument(skip(self, session))]
    async fn requisition(&self, session: &Session, id: &str) -> Result<Requisition> {
        let requisition: Requisition = self.get(&format!("requisitions/{}/", id), session).await?;

        info!(
            status = %requisition.status,
            accounts = requisition.accounts.len(),
            "requisition status"
        );

        Ok(requisition)
    }

    #[tracing::instrument(skip(self, session))]
    async fn requisitions(&self, session: &Session) -> Result<Vec<Requisition>> {
        let resp: RequisitionsResponse = self.get("requisitions/", session).await?;

        debug!(count = resp.results.len(), "listed requisitions");

        Ok(resp.results)
    }
}
