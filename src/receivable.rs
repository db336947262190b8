//! Customer debt recorded for posted sale documents
use sled::Transactional;
use sled::transaction::ConflictableTransactionError;

use crate::document::{Document, DocumentKind};
use crate::error::StoreError;
use crate::storage::{PURCHASES, RECEIVABLES, Storage, decode, encode};
use crate::types::{CustomerId, DocumentId, TimeStamp};

use chrono::Utc;

/// Side effect run once a sale has been committed. Failures are reported but
/// never undo the posting.
pub trait SaleHook: Send + Sync {
    fn on_sale_posted(&self, document: &Document) -> anyhow::Result<()>;
}

/// Hook that does nothing, for deployments without a debt ledger.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl SaleHook for NoopHook {
    fn on_sale_posted(&self, _: &Document) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Purchase {
    #[n(0)]
    pub customer: CustomerId,
    #[n(1)]
    pub document: DocumentId,
    #[n(2)]
    pub total_value: u64,
    #[n(3)]
    pub recorded_at: TimeStamp<Utc>,
}

/// Per-customer debt balance plus one purchase record per sale document.
#[derive(Clone, Debug)]
pub struct ReceivableLedger {
    balances: sled::Tree,
    purchases: sled::Tree,
}

fn purchase_key(customer: &CustomerId, document: &DocumentId) -> Vec<u8> {
    let mut key = customer.as_str().as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(document.as_str().as_bytes());
    key
}

impl ReceivableLedger {
    pub fn new(storage: &Storage) -> Result<Self, StoreError> {
        Ok(Self {
            balances: storage.tree(RECEIVABLES)?,
            purchases: storage.tree(PURCHASES)?,
        })
    }

    /// Adds the document's value to the customer's balance. Recording the
    /// same document twice is a no-op.
    pub fn record_purchase(
        &self,
        customer: &CustomerId,
        document: &DocumentId,
        total_value: u64,
    ) -> Result<bool, StoreError> {
        let key = purchase_key(customer, document);
        let purchase = encode(&Purchase {
            customer: customer.clone(),
            document: document.clone(),
            total_value,
            recorded_at: TimeStamp::new(),
        })?;

        let recorded = (&self.balances, &self.purchases).transaction(|(balances, purchases)| {
            if purchases.get(&key)?.is_some() {
                return Ok(false);
            }
            let balance = match balances.get(customer.as_str())? {
                Some(raw) => match <[u8; 8]>::try_from(&raw[..]) {
                    Ok(bytes) => u64::from_be_bytes(bytes),
                    Err(_) => {
                        return Err(ConflictableTransactionError::Abort(
                            StoreError::CorruptQuantity(raw.to_vec()),
                        ));
                    }
                },
                None => 0,
            };
            balances.insert(
                customer.as_str(),
                balance.saturating_add(total_value).to_be_bytes().to_vec(),
            )?;
            purchases.insert(key.clone(), purchase.clone())?;
            Ok(true)
        });

        crate::storage::settle(recorded)
    }

    pub fn balance(&self, customer: &CustomerId) -> Result<u64, StoreError> {
        match self.balances.get(customer.as_str())? {
            Some(raw) => {
                let bytes = <[u8; 8]>::try_from(&raw[..])
                    .map_err(|_| StoreError::CorruptQuantity(raw.to_vec()))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub fn purchases(&self, customer: &CustomerId) -> Result<Vec<Purchase>, StoreError> {
        let mut prefix = customer.as_str().as_bytes().to_vec();
        prefix.push(0);

        let mut found = vec![];
        for entry in self.purchases.scan_prefix(prefix) {
            let (_, bytes) = entry?;
            found.push(decode(&bytes)?);
        }
        Ok(found)
    }
}

impl SaleHook for ReceivableLedger {
    fn on_sale_posted(&self, document: &Document) -> anyhow::Result<()> {
        if document.kind != DocumentKind::Sale {
            return Ok(());
        }
        let Some(customer) = &document.customer else {
            tracing::debug!(document = %document.id, "sale without customer, no receivable");
            return Ok(());
        };

        let total = document.total_value();
        if self.record_purchase(customer, &document.id, total)? {
            tracing::info!(document = %document.id, %customer, total, "receivable recorded");
        }
        Ok(())
    }
}
