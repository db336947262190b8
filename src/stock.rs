//! Quantity-on-hand per (warehouse, product) with a floor at zero.
//!
//! Quantities are stored as big-endian `u64` values under a length-prefixed
//! key, so all products of a warehouse share a scannable prefix. A row that
//! reaches zero is deleted. The `occupancy` tree counts the non-zero rows of
//! every warehouse and is maintained in the same transaction as the rows.
use std::collections::BTreeMap;
use std::fmt;

use sled::transaction::TransactionalTree;

use crate::error::{StockError, StoreError};
use crate::storage::{Storage, TxResult, UnitOfWork, abort_store, settle};
use crate::types::{ProductId, WarehouseId};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StockKey {
    pub warehouse: WarehouseId,
    pub product: ProductId,
}

impl StockKey {
    pub fn new(warehouse: WarehouseId, product: ProductId) -> Self {
        Self { warehouse, product }
    }

    /// Fails for warehouse ids longer than the `u16` length prefix can hold.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let mut key = warehouse_prefix(&self.warehouse)?;
        key.extend_from_slice(self.product.as_str().as_bytes());
        Ok(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (len, rest) = bytes.split_at_checked(2)?;
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        let (warehouse, product) = rest.split_at_checked(len)?;

        Some(Self {
            warehouse: WarehouseId::from(std::str::from_utf8(warehouse).ok()?),
            product: ProductId::from(std::str::from_utf8(product).ok()?),
        })
    }
}

fn warehouse_prefix(warehouse: &WarehouseId) -> Result<Vec<u8>, StoreError> {
    let id = warehouse.as_str().as_bytes();
    let len = u16::try_from(id.len()).map_err(|_| StoreError::KeyTooLong(id.len()))?;
    let mut prefix = Vec::with_capacity(2 + id.len());
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(id);
    Ok(prefix)
}

/// Which key ran short and by how much.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Shortfall {
    #[n(0)]
    pub warehouse: WarehouseId,
    #[n(1)]
    pub product: ProductId,
    #[n(2)]
    pub available: u64,
    #[n(3)]
    pub requested: u64,
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "insufficient stock of {} in {}: available {}, requested {}",
            self.product, self.warehouse, self.available, self.requested
        )
    }
}

/// Stock level after a committed delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevel {
    pub key: StockKey,
    pub quantity: u64,
}

/// Deltas applied together, all-or-nothing.
///
/// Deltas targeting the same key are summed and keys are visited in their
/// `Ord` order, which is the single ordering every batch agrees on. Sums are
/// kept in `i128` so any number of `u64` quantities nets exactly; a total
/// outside the stored range is rejected when the batch is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaBatch {
    deltas: BTreeMap<StockKey, i128>,
}

impl DeltaBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, warehouse: WarehouseId, product: ProductId, delta: i128) {
        *self
            .deltas
            .entry(StockKey::new(warehouse, product))
            .or_insert(0) += delta;
    }

    pub fn with(mut self, warehouse: WarehouseId, product: ProductId, delta: i128) -> Self {
        self.push(warehouse, product, delta);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StockKey, i128)> {
        self.deltas.iter().map(|(key, delta)| (key, *delta))
    }
}

/// Authoritative quantities. Every mutation runs inside a unit of work.
#[derive(Clone, Debug)]
pub struct StockStore {
    storage: Storage,
}

impl StockStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Absence of a row means zero.
    pub fn quantity(&self, warehouse: &WarehouseId, product: &ProductId) -> Result<u64, StockError> {
        let key = StockKey::new(warehouse.clone(), product.clone()).to_bytes()?;
        let quantity = match self.storage.stock.get(&key).map_err(StoreError::from)? {
            Some(value) => read_quantity(&key, &value)?,
            None => 0,
        };
        Ok(quantity)
    }

    /// Applies one delta and returns the new quantity.
    pub fn apply_delta(
        &self,
        warehouse: &WarehouseId,
        product: &ProductId,
        delta: i64,
    ) -> Result<u64, StockError> {
        let batch = DeltaBatch::new().with(warehouse.clone(), product.clone(), i128::from(delta));
        let levels = self.apply_delta_batch(&batch)?;

        Ok(levels.first().map(|level| level.quantity).unwrap_or(0))
    }

    /// Applies `batch` atomically: either every delta lands or none does.
    pub fn apply_delta_batch(&self, batch: &DeltaBatch) -> Result<Vec<StockLevel>, StockError> {
        settle(self.storage.unit_of_work(|uow| {
            match Self::apply_batch_in::<StockError>(uow, batch)? {
                Ok(levels) => Ok(levels),
                Err(e) => sled::transaction::abort(e),
            }
        }))
    }

    /// Applies `batch` within the caller's unit of work.
    ///
    /// All quantities are read and checked before the first write. A rejected
    /// batch comes back as the inner `Err` with nothing written, leaving the
    /// caller free to commit other work in the same transaction.
    pub fn apply_batch_in<E>(
        uow: &UnitOfWork<'_>,
        batch: &DeltaBatch,
    ) -> TxResult<Result<Vec<StockLevel>, StockError>, E>
    where
        E: From<StoreError>,
    {
        let mut planned = Vec::with_capacity(batch.len());

        for (key, delta) in batch.iter() {
            let raw = match key.to_bytes() {
                Ok(raw) => raw,
                Err(e) => return abort_store(e),
            };
            let current = quantity_in::<E>(uow.stock, &raw)?;
            let next = i128::from(current) + delta;

            if next < 0 {
                return Ok(Err(StockError::InsufficientStock(Shortfall {
                    warehouse: key.warehouse.clone(),
                    product: key.product.clone(),
                    available: current,
                    // beyond u64 nothing could ever satisfy it
                    requested: u64::try_from(delta.unsigned_abs()).unwrap_or(u64::MAX),
                })));
            }
            let Ok(next) = u64::try_from(next) else {
                return Ok(Err(StockError::Overflow {
                    warehouse: key.warehouse.clone(),
                    product: key.product.clone(),
                }));
            };
            planned.push((key, raw, current, next));
        }

        let mut levels = Vec::with_capacity(planned.len());
        for (key, raw, current, next) in planned {
            if next == 0 {
                uow.stock.remove(raw)?;
            } else {
                uow.stock.insert(raw, next.to_be_bytes().to_vec())?;
            }

            match (current == 0, next == 0) {
                (true, false) => adjust_occupancy::<E>(uow.occupancy, &key.warehouse, 1)?,
                (false, true) => adjust_occupancy::<E>(uow.occupancy, &key.warehouse, -1)?,
                _ => {}
            }
            tracing::debug!(warehouse = %key.warehouse, product = %key.product, from = current, to = next, "stock row updated");

            levels.push(StockLevel {
                key: key.clone(),
                quantity: next,
            });
        }

        Ok(Ok(levels))
    }

    /// Number of products with non-zero stock in `warehouse`, read
    /// transactionally so warehouse removal cannot race a posting.
    pub fn occupancy_in<E>(uow: &UnitOfWork<'_>, warehouse: &WarehouseId) -> TxResult<u64, E>
    where
        E: From<StoreError>,
    {
        let key = warehouse.as_str().as_bytes();
        quantity_in::<E>(uow.occupancy, key)
    }

    /// All non-zero rows of a warehouse, ordered by product id.
    pub fn warehouse_stock(&self, warehouse: &WarehouseId) -> Result<Vec<StockLevel>, StockError> {
        let mut rows = vec![];
        for entry in self.storage.stock.scan_prefix(warehouse_prefix(warehouse)?) {
            let (key, value) = entry.map_err(StoreError::from)?;
            let quantity = read_quantity(&key, &value)?;
            let key = StockKey::from_bytes(&key)
                .ok_or_else(|| StoreError::CorruptQuantity(key.to_vec()))?;
            rows.push(StockLevel { key, quantity });
        }
        Ok(rows)
    }

    /// Quantity of `product` summed over every warehouse.
    pub fn product_total(&self, product: &ProductId) -> Result<u64, StockError> {
        let mut total = 0u64;
        for entry in self.storage.stock.iter() {
            let (key, value) = entry.map_err(StoreError::from)?;
            let Some(parsed) = StockKey::from_bytes(&key) else {
                return Err(StoreError::CorruptQuantity(key.to_vec()).into());
            };
            if &parsed.product == product {
                total = total.saturating_add(read_quantity(&key, &value)?);
            }
        }
        Ok(total)
    }
}

fn read_quantity(key: &[u8], value: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| StoreError::CorruptQuantity(key.to_vec()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn quantity_in<E>(tree: &TransactionalTree, key: &[u8]) -> TxResult<u64, E>
where
    E: From<StoreError>,
{
    match tree.get(key)? {
        Some(value) => match read_quantity(key, &value) {
            Ok(quantity) => Ok(quantity),
            Err(e) => abort_store(e),
        },
        None => Ok(0),
    }
}

fn adjust_occupancy<E>(tree: &TransactionalTree, warehouse: &WarehouseId, step: i64) -> TxResult<(), E>
where
    E: From<StoreError>,
{
    let key = warehouse.as_str().as_bytes();
    let next = quantity_in::<E>(tree, key)?.saturating_add_signed(step);

    if next == 0 {
        tree.remove(key)?;
    } else {
        tree.insert(key, next.to_be_bytes().to_vec())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_key_round_trips_through_bytes() {
        let key = StockKey::new(WarehouseId::from("wh_a"), ProductId::from("prod_b"));
        assert_eq!(StockKey::from_bytes(&key.to_bytes().unwrap()), Some(key));
    }

    #[test]
    fn warehouse_prefix_does_not_match_longer_ids() {
        let prefix = warehouse_prefix(&WarehouseId::from("wh_a")).unwrap();
        let short = StockKey::new(WarehouseId::from("wh_a"), ProductId::from("p"))
            .to_bytes()
            .unwrap();
        let long = StockKey::new(WarehouseId::from("wh_ab"), ProductId::from("p"))
            .to_bytes()
            .unwrap();

        assert!(short.starts_with(&prefix));
        assert!(!long.starts_with(&prefix));
    }

    #[test]
    fn oversized_warehouse_ids_are_rejected() {
        let store = StockStore::new(Storage::temporary().unwrap());
        let huge = WarehouseId::from("w".repeat(usize::from(u16::MAX) + 1));
        let p = ProductId::from("p");

        assert!(matches!(
            StockKey::new(huge.clone(), p.clone()).to_bytes(),
            Err(StoreError::KeyTooLong(65_536))
        ));
        assert!(matches!(
            store.apply_delta(&huge, &p, 1),
            Err(StockError::Store(StoreError::KeyTooLong(_)))
        ));
        assert!(store.quantity(&huge, &p).is_err());

        let widest = WarehouseId::from("w".repeat(usize::from(u16::MAX)));
        let key = StockKey::new(widest, p);
        assert_eq!(StockKey::from_bytes(&key.to_bytes().unwrap()), Some(key));
    }

    #[test]
    fn batch_sums_deltas_per_key() {
        let batch = DeltaBatch::new()
            .with(WarehouseId::from("w"), ProductId::from("p"), -3)
            .with(WarehouseId::from("w"), ProductId::from("p"), -4);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.iter().next().map(|(_, d)| d), Some(-7));
    }

    #[test]
    fn missing_rows_read_as_zero() {
        let store = StockStore::new(Storage::temporary().unwrap());
        let qty = store
            .quantity(&WarehouseId::from("w"), &ProductId::from("p"))
            .unwrap();
        assert_eq!(qty, 0);
    }

    #[test]
    fn rejected_batch_leaves_no_trace() {
        let store = StockStore::new(Storage::temporary().unwrap());
        let (w1, w2, p) = (
            WarehouseId::from("w1"),
            WarehouseId::from("w2"),
            ProductId::from("p"),
        );
        store.apply_delta(&w1, &p, 2).unwrap();

        let batch = DeltaBatch::new()
            .with(w2.clone(), p.clone(), 5)
            .with(w1.clone(), p.clone(), -5);
        let err = store.apply_delta_batch(&batch).unwrap_err();

        assert!(matches!(err, StockError::InsufficientStock(ref s) if s.available == 2 && s.requested == 5));
        assert_eq!(store.quantity(&w1, &p).unwrap(), 2);
        assert_eq!(store.quantity(&w2, &p).unwrap(), 0);
    }

    #[test]
    fn removal_to_zero_deletes_the_row() {
        let store = StockStore::new(Storage::temporary().unwrap());
        let (w, p) = (WarehouseId::from("w"), ProductId::from("p"));

        store.apply_delta(&w, &p, 4).unwrap();
        assert_eq!(store.apply_delta(&w, &p, -4).unwrap(), 0);
        assert!(store.warehouse_stock(&w).unwrap().is_empty());
        assert!(matches!(
            store.apply_delta(&w, &p, -1),
            Err(StockError::InsufficientStock(_))
        ));
    }

    #[test]
    fn summed_deltas_are_not_capped() {
        let max = i128::from(i64::MAX);
        let batch = DeltaBatch::new()
            .with(WarehouseId::from("w"), ProductId::from("p"), max)
            .with(WarehouseId::from("w"), ProductId::from("p"), max);

        assert_eq!(batch.iter().next().map(|(_, d)| d), Some(2 * max));
    }

    #[test]
    fn summed_overflow_rejects_the_whole_batch() {
        let store = StockStore::new(Storage::temporary().unwrap());
        let (w, p, q) = (
            WarehouseId::from("w"),
            ProductId::from("p"),
            ProductId::from("q"),
        );
        store.apply_delta(&w, &p, 2).unwrap();

        let max = i128::from(i64::MAX);
        let batch = DeltaBatch::new()
            .with(w.clone(), q.clone(), 1)
            .with(w.clone(), p.clone(), max)
            .with(w.clone(), p.clone(), max);
        assert!(matches!(
            store.apply_delta_batch(&batch),
            Err(StockError::Overflow { .. })
        ));
        assert_eq!(store.quantity(&w, &p).unwrap(), 2);
        assert_eq!(store.quantity(&w, &q).unwrap(), 0);
    }

    #[test]
    fn overflow_is_rejected() {
        let store = StockStore::new(Storage::temporary().unwrap());
        let (w, p) = (WarehouseId::from("w"), ProductId::from("p"));

        store.apply_delta(&w, &p, i64::MAX).unwrap();
        store.apply_delta(&w, &p, i64::MAX).unwrap();
        assert!(matches!(
            store.apply_delta(&w, &p, 2),
            Err(StockError::Overflow { .. })
        ));
    }
}
