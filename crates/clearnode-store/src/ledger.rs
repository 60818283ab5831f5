//! Append-only double-entry balance store.
//!
//! Every movement is an entry `(account, asset, signed delta)`. Balances are
//! sums over entries; nothing stores a running balance. The ledger does no
//! business validation: callers decide whether a posting is allowed before
//! making it.

use chrono::{DateTime, Utc};
use clearnode_core::types::amount_str;
use clearnode_core::{AccountId, LedgerTransaction, TransactionType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::backend::Table;
use crate::error::StoreError;
use crate::tx::{seq_key, StoreTx};

const ENTRY_SEQUENCE: &str = "ledger_entries";
const TRANSACTION_SEQUENCE: &str = "ledger_transactions";

/// One posted balance movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub account: AccountId,
    pub asset: String,
    #[serde(with = "amount_str::signed")]
    pub delta: i128,
    pub created_at: DateTime<Utc>,
}

fn entry_prefix(account: &AccountId, asset: Option<&str>) -> String {
    match asset {
        Some(asset) => format!("{}|{}|", account.storage_key(), asset),
        None => format!("{}|", account.storage_key()),
    }
}

/// Ledger access within a transaction.
pub struct Ledger<'t, 'a> {
    tx: &'t mut StoreTx<'a>,
}

impl<'t, 'a> Ledger<'t, 'a> {
    pub(crate) fn new(tx: &'t mut StoreTx<'a>) -> Self {
        Self { tx }
    }

    /// Post one signed movement on `account` for `asset`.
    pub fn record(
        &mut self,
        account: &AccountId,
        asset: &str,
        delta: i128,
    ) -> Result<LedgerEntry, StoreError> {
        let id = self.tx.next_sequence(ENTRY_SEQUENCE)?;
        let entry = LedgerEntry {
            id,
            account: account.clone(),
            asset: asset.to_string(),
            delta,
            created_at: Utc::now(),
        };
        let key = format!("{}{}", entry_prefix(account, Some(asset)), seq_key(id));
        self.tx.put_json(Table::LedgerEntries, key.as_bytes(), &entry)?;
        tracing::trace!(account = %account, asset, delta, "ledger entry posted");
        Ok(entry)
    }

    /// Balance of `account` in `asset`.
    pub fn balance(&self, account: &AccountId, asset: &str) -> Result<i128, StoreError> {
        let prefix = entry_prefix(account, Some(asset));
        self.sum(&prefix, account)
    }

    /// Every non-empty balance of `account`, keyed by asset symbol.
    pub fn balances(&self, account: &AccountId) -> Result<BTreeMap<String, i128>, StoreError> {
        let prefix = entry_prefix(account, None);
        let mut balances = BTreeMap::new();
        for (_, value) in self.tx.scan_prefix(Table::LedgerEntries, prefix.as_bytes())? {
            let entry: LedgerEntry = serde_json::from_slice(&value)?;
            let slot = balances.entry(entry.asset).or_insert(0i128);
            *slot = slot
                .checked_add(entry.delta)
                .ok_or_else(|| StoreError::Overflow(account.to_string()))?;
        }
        balances.retain(|_, v| *v != 0);
        Ok(balances)
    }

    /// Entries of `account`, oldest first.
    pub fn entries(&self, account: &AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        let prefix = entry_prefix(account, None);
        let mut entries = self
            .tx
            .scan_prefix(Table::LedgerEntries, prefix.as_bytes())?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice::<LedgerEntry>(&value))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    /// Sum of all deltas per asset across every account.
    pub fn asset_totals(&self) -> Result<BTreeMap<String, i128>, StoreError> {
        let mut totals = BTreeMap::new();
        for (_, value) in self.tx.scan_prefix(Table::LedgerEntries, b"")? {
            let entry: LedgerEntry = serde_json::from_slice(&value)?;
            let slot = totals.entry(entry.asset).or_insert(0i128);
            *slot = slot
                .checked_add(entry.delta)
                .ok_or_else(|| StoreError::Overflow("ledger".into()))?;
        }
        Ok(totals)
    }

    /// Record a balanced money movement for the audit trail.
    pub fn record_transaction(
        &mut self,
        tx_type: TransactionType,
        from_account: &AccountId,
        to_account: &AccountId,
        asset: &str,
        amount: u128,
    ) -> Result<LedgerTransaction, StoreError> {
        let id = self.tx.next_sequence(TRANSACTION_SEQUENCE)?;
        let record = LedgerTransaction {
            id,
            tx_type,
            from_account: from_account.clone(),
            to_account: to_account.clone(),
            asset_symbol: asset.to_string(),
            amount,
            created_at: Utc::now(),
        };
        let key = seq_key(id);
        self.tx
            .put_json(Table::LedgerTransactions, key.as_bytes(), &record)?;
        for account in [from_account, to_account] {
            let index = format!("{}|{}", account.storage_key(), key);
            self.tx.put(Table::AccountTransactions, index.as_bytes(), Vec::new());
        }
        tracing::debug!(id, tx_type = %tx_type, from = %from_account, to = %to_account, asset, amount = %amount, "ledger transaction recorded");
        Ok(record)
    }

    /// Transactions touching `account`, oldest first.
    pub fn transactions_by_account(
        &self,
        account: &AccountId,
    ) -> Result<Vec<LedgerTransaction>, StoreError> {
        let prefix = format!("{}|", account.storage_key());
        let mut records = Vec::new();
        for (key, _) in self
            .tx
            .scan_prefix(Table::AccountTransactions, prefix.as_bytes())?
        {
            let seq = &key[prefix.len()..];
            if let Some(record) = self
                .tx
                .get_json::<LedgerTransaction>(Table::LedgerTransactions, seq)?
            {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Every recorded transaction, oldest first.
    pub fn transactions(&self) -> Result<Vec<LedgerTransaction>, StoreError> {
        self.tx
            .scan_prefix(Table::LedgerTransactions, b"")?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
            .collect()
    }

    fn sum(&self, prefix: &str, account: &AccountId) -> Result<i128, StoreError> {
        let mut total = 0i128;
        for (_, value) in self.tx.scan_prefix(Table::LedgerEntries, prefix.as_bytes())? {
            let entry: LedgerEntry = serde_json::from_slice(&value)?;
            total = total
                .checked_add(entry.delta)
                .ok_or_else(|| StoreError::Overflow(account.to_string()))?;
        }
        Ok(total)
    }
}
