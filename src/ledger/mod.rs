pub mod ynab;

use std::collections::HashMap;

use axum::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::{Milliunits, Transaction};

const IMPORT_ID_PREFIX: &str = "YNAB";

#[derive(Debug, Error)]
pub enum Error {
    #[error("ledger rejected request with status {status}: {name} ({id}): {detail}")]
    Api {
        status: u16,
        id: String,
        name: String,
        detail: String,
    },
    #[error("ledger request failed")]
    Http(#[from] reqwest::Error),
    #[error("failed to decode ledger response")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
#[error("failed to upload {count} transactions to budget {budget}")]
pub struct UploadError {
    pub budget: String,
    pub count: usize,
    #[source]
    pub source: Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClearingStatus {
    Cleared,
    Uncleared,
    Reconciled,
}

/// PayloadTransaction is a transaction as submitted to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadTransaction {
    pub account_id: String,
    pub date: NaiveDate,
    pub amount: Milliunits,
    pub payee_name: Option<String>,
    pub memo: Option<String>,
    pub cleared: ClearingStatus,
    pub approved: bool,
    pub import_id: Option<String>,
}

/// Summary of a batch submission as reported by the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SaveSummary {
    #[serde(default)]
    pub transaction_ids: Vec<String>,
    #[serde(default)]
    pub duplicate_import_ids: Vec<String>,
}

#[async_trait]
pub trait Ledger {
    async fn create_transactions(
        &self,
        budget_id: &str,
        transactions: &[PayloadTransaction],
    ) -> Result<SaveSummary, Error>;
}

pub fn import_id(tx: &Transaction) -> String {
    format!(
        "{}:{}:{}",
        IMPORT_ID_PREFIX,
        tx.amount,
        tx.date.format("%Y-%m-%d")
    )
}

pub fn import_id_with_occurrence(tx: &Transaction, occurrence: u32) -> String {
    format!("{}:{}", import_id(tx), occurrence)
}

/// Maps a batch into ledger payloads. Transactions sharing amount and date
/// are told apart by their occurrence within the batch, counted from 1 in
/// encounter order.
pub fn to_payload(account_id: &str, txs: &[Transaction]) -> Vec<PayloadTransaction> {
    let mut occurrences: HashMap<(Milliunits, NaiveDate), u32> = HashMap::new();

    txs.iter()
        .map(|tx| {
            let occurrence = occurrences.entry((tx.amount, tx.date)).or_insert(0);
            *occurrence += 1;

            PayloadTransaction {
                account_id: account_id.to_string(),
                date: tx.date,
                amount: tx.amount,
                payee_name: Some(tx.name.clone()),
                memo: Some(tx.memo.clone()),
                cleared: ClearingStatus::Cleared,
                approved: false,
                import_id: Some(import_id_with_occurrence(tx, *occurrence)),
            }
        })
        .collect()
}

/// Submits `txs` to `account_id` of `budget_id` as one batch.
#[tracing::instrument(skip(ledger, txs), fields(count = txs.len()))]
pub async fn upload<L: Ledger + ?Sized>(
    ledger: &L,
    account_id: &str,
    budget_id: &str,
    txs: &[Transaction],
) -> Result<SaveSummary, UploadError> {
    if txs.is_empty() {
        info!("nothing to upload");
        return Ok(SaveSummary::default());
    }

    let payload = to_payload(account_id, txs);
    for tx in &payload {
        debug!(
            date = %tx.date,
            amount = tx.amount,
            payee = ?tx.payee_name,
            memo = ?tx.memo,
            import_id = ?tx.import_id,
            "uploading transaction"
        );
    }

    let summary = ledger
        .create_transactions(budget_id, &payload)
        .await
        .map_err(|source| UploadError {
            budget: budget_id.to_string(),
            count: payload.len(),
            source,
        })?;

    info!(
        created = summary.transaction_ids.len(),
        duplicates = summary.duplicate_import_ids.len(),
        "uploaded transactions"
    );

    Ok(summary)
}
