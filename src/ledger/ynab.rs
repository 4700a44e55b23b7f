use std::fmt;
use std::time::Duration;

use axum::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Error, Ledger, PayloadTransaction, SaveSummary};

pub const DEFAULT_BASE_URL: &str = "https://api.ynab.com/v1";

/// Client submits transactions to the YNAB API.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize)]
struct SaveTransactionsRequest<'a> {
    transactions: &'a [PayloadTransaction],
}

#[derive(Deserialize)]
struct SaveTransactionsResponse {
    data: SaveSummary,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    detail: String,
}

impl Client {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Ledger for Client {
    #[tracing::instrument(skip(self, transactions), fields(count = transactions.len()))]
    async fn create_transactions(
        &self,
        budget_id: &str,
        transactions: &[PayloadTransaction],
    ) -> Result<SaveSummary, Error> {
        let resp = self
            .http
            .post(format!("{}/budgets/{}/transactions", self.base_url, budget_id))
            .bearer_auth(&self.token)
            .json(&SaveTransactionsRequest { transactions })
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            warn!(%status, "ledger rejected transactions");
            // Non-JSON error bodies still surface with their raw text.
            let detail = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(parsed) => parsed.error,
                Err(_) => ErrorDetail {
                    id: status.as_u16().to_string(),
                    name: status.canonical_reason().unwrap_or_default().to_string(),
                    detail: body,
                },
            };

            return Err(Error::Api {
                status: status.as_u16(),
                id: detail.id,
                name: detail.name,
                detail: detail.detail,
            });
        }

        let parsed: SaveTransactionsResponse = serde_json::from_str(&body)?;
        debug!(
            created = parsed.data.transaction_ids.len(),
            duplicates = parsed.data.duplicate_import_ids.len(),
            "saved transactions"
        );

        Ok(parsed.data)
    }
}
