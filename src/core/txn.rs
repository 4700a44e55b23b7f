use chrono::naive::NaiveDate;

/// Milliunits are thousandths of the major currency unit, the fixed-point
/// representation the budget ledger works in.
pub type Milliunits = i64;

/// Transaction is the provider-agnostic view of a single bank transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Provider transaction id, or the internal id when the former is absent.
    pub id: String,
    /// Value date of the transaction.
    pub date: NaiveDate,
    pub amount: Milliunits,
    pub memo: String,
    /// Counterparty display name.
    pub name: String,
}
