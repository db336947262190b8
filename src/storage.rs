//! Embedded database handle and the unit of work shared by every store.
//!
//! All writes attributable to a document happen inside a single sled
//! transaction opened by [`Storage::unit_of_work`]. The transaction hands out
//! a [`UnitOfWork`] which the stock store, the document repository and the
//! catalog accept as a parameter. Returning `Ok` from the closure commits
//! every tree at once, aborting rolls all of them back.
use std::path::Path;

use sled::Transactional;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};

use crate::error::StoreError;

pub(crate) const DOCUMENTS: &str = "documents";
pub(crate) const STOCK: &str = "stock";
pub(crate) const OCCUPANCY: &str = "occupancy";
pub(crate) const WAREHOUSES: &str = "warehouses";
pub(crate) const PRODUCTS: &str = "products";
pub(crate) const RECEIVABLES: &str = "receivables";
pub(crate) const PURCHASES: &str = "purchases";

/// Result type of work executed inside a unit of work.
pub type TxResult<T, E> = ConflictableTransactionResult<T, E>;

#[derive(Clone, Debug)]
pub struct Storage {
    db: sled::Db,
    pub(crate) documents: sled::Tree,
    pub(crate) stock: sled::Tree,
    pub(crate) occupancy: sled::Tree,
    pub(crate) warehouses: sled::Tree,
    pub(crate) products: sled::Tree,
}

/// Transactional view over the trees touched by a posting.
pub struct UnitOfWork<'a> {
    pub(crate) documents: &'a TransactionalTree,
    pub(crate) stock: &'a TransactionalTree,
    pub(crate) occupancy: &'a TransactionalTree,
    pub(crate) warehouses: &'a TransactionalTree,
    pub(crate) products: &'a TransactionalTree,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// Database that is removed when the last handle is dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    pub fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            documents: db.open_tree(DOCUMENTS)?,
            stock: db.open_tree(STOCK)?,
            occupancy: db.open_tree(OCCUPANCY)?,
            warehouses: db.open_tree(WAREHOUSES)?,
            products: db.open_tree(PRODUCTS)?,
            db,
        })
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    pub(crate) fn tree(&self, name: &str) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(name)?)
    }

    /// Runs `work` as one atomic transaction across every store.
    ///
    /// sled retries the closure on optimistic conflicts, so it must not
    /// carry side effects outside the trees.
    pub fn unit_of_work<T, E, F>(&self, work: F) -> Result<T, TransactionError<E>>
    where
        F: Fn(&UnitOfWork<'_>) -> TxResult<T, E>,
    {
        (
            &self.documents,
            &self.stock,
            &self.occupancy,
            &self.warehouses,
            &self.products,
        )
            .transaction(|(documents, stock, occupancy, warehouses, products)| {
                let uow = UnitOfWork {
                    documents,
                    stock,
                    occupancy,
                    warehouses,
                    products,
                };
                work(&uow)
            })
    }

    pub fn flush(&self) -> Result<usize, StoreError> {
        Ok(self.db.flush()?)
    }
}

/// Collapses a finished transaction back into the caller's error type.
pub(crate) fn settle<T, E>(result: Result<T, TransactionError<E>>) -> Result<T, E>
where
    E: From<StoreError>,
{
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => E::from(StoreError::Storage(e)),
    })
}

/// Aborts the surrounding transaction with a store error.
pub(crate) fn abort_store<T, E>(error: StoreError) -> TxResult<T, E>
where
    E: From<StoreError>,
{
    Err(ConflictableTransactionError::Abort(E::from(error)))
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, StoreError> {
    minicbor::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, StoreError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

/// Decodes inside a transaction, aborting on corrupt records.
pub(crate) fn decode_in<T, E>(bytes: &[u8]) -> TxResult<T, E>
where
    T: for<'b> minicbor::Decode<'b, ()>,
    E: From<StoreError>,
{
    match decode(bytes) {
        Ok(value) => Ok(value),
        Err(e) => abort_store(e),
    }
}

pub(crate) fn encode_in<T, E>(value: &T) -> TxResult<Vec<u8>, E>
where
    T: minicbor::Encode<()>,
    E: From<StoreError>,
{
    match encode(value) {
        Ok(bytes) => Ok(bytes),
        Err(e) => abort_store(e),
    }
}
