use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::{Milliunits, Transaction};
use crate::upstream::{RawTransaction, RawTransactions};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid value date {value:?}")]
    InvalidDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("invalid amount {0:?}")]
    InvalidAmount(String),
    #[error("amount {0:?} does not fit in milliunits")]
    AmountOutOfRange(String),
}

/// Converts a provider batch into canonical transactions, booked first and
/// pending after. Records that fail to parse are logged and left out.
pub fn normalize(raw: RawTransactions) -> Vec<Transaction> {
    raw.booked
        .iter()
        .chain(raw.pending.iter())
        .filter_map(|tx| match to_canonical_txn(tx) {
            Ok(canonical) => Some(canonical),
            Err(err) => {
                warn!(
                    %err,
                    transaction_id = ?tx.transaction_id,
                    internal_transaction_id = ?tx.internal_transaction_id,
                    "skipping transaction"
                );
                None
            }
        })
        .collect()
}

fn to_canonical_txn(tx: &RawTransaction) -> Result<Transaction, ParseError> {
    let value_date = tx.value_date.as_deref().unwrap_or_default();
    let date = NaiveDate::parse_from_str(value_date, "%Y-%m-%d").map_err(|source| {
        ParseError::InvalidDate {
            value: value_date.to_string(),
            source,
        }
    })?;
    let amount = to_milliunits(&tx.transaction_amount.amount)?;
    let name = counterparty(tx, amount).to_string();

    debug!(
        %date,
        amount,
        name = %name,
        debtor_name = ?tx.debtor_name,
        creditor_name = ?tx.creditor_name,
        additional_information = ?tx.additional_information,
        "normalized transaction"
    );

    Ok(Transaction {
        id: transaction_id(tx).to_string(),
        date,
        amount,
        memo: remittance(tx).to_string(),
        name,
    })
}

/// Parses a decimal amount into milliunits, rounding to the nearest
/// milliunit and keeping the sign.
pub fn to_milliunits(amount: &str) -> Result<Milliunits, ParseError> {
    let parsed: f64 = amount
        .trim()
        .parse()
        .map_err(|_| ParseError::InvalidAmount(amount.to_string()))?;
    if !parsed.is_finite() {
        return Err(ParseError::InvalidAmount(amount.to_string()));
    }

    let scaled = (parsed * 1000.0).round();
    // i64::MAX as f64 rounds up to 2^63, which is already out of range.
    if scaled >= i64::MAX as f64 || scaled < i64::MIN as f64 {
        return Err(ParseError::AmountOutOfRange(amount.to_string()));
    }

    Ok(scaled as Milliunits)
}

fn transaction_id(tx: &RawTransaction) -> &str {
    match tx.transaction_id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => tx.internal_transaction_id.as_deref().unwrap_or_default(),
    }
}

fn remittance(tx: &RawTransaction) -> &str {
    tx.remittance_information_unstructured
        .as_deref()
        .unwrap_or_default()
}

fn non_empty(name: &Option<String>) -> Option<&str> {
    name.as_deref().filter(|n| !n.is_empty())
}

fn counterparty(tx: &RawTransaction, amount: Milliunits) -> &str {
    let name = if amount >= 0 {
        non_empty(&tx.debtor_name)
    } else {
        non_empty(&tx.creditor_name)
    };

    name.unwrap_or_else(|| remittance(tx))
}
