use crate::document::{DocumentStatus, Violations};
use crate::stock::Shortfall;
use crate::types::{DocumentId, ProductId, WarehouseId};

/// Failures of the embedded database or of record encoding.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("failed to generate id: {0}")]
    Id(String),
    #[error("key component of {0} bytes exceeds the supported length")]
    KeyTooLong(usize),
    #[error("corrupt stock quantity for key {0:?}")]
    CorruptQuantity(Vec<u8>),
}

#[derive(thiserror::Error, Debug)]
pub enum StockError {
    #[error("{0}")]
    InsufficientStock(Shortfall),
    #[error("quantity of {product} in {warehouse} would overflow")]
    Overflow {
        warehouse: WarehouseId,
        product: ProductId,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("warehouse {0} not found")]
    WarehouseNotFound(WarehouseId),
    #[error("product {0} not found")]
    ProductNotFound(ProductId),
    #[error("warehouse {0} still holds stock")]
    WarehouseNotEmpty(WarehouseId),
    #[error("{0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("document {0} not found")]
    NotFound(DocumentId),
    #[error("document {0} already exists")]
    Duplicate(DocumentId),
    #[error("document {id} is {found:?}, expected {expected:?}")]
    Conflict {
        id: DocumentId,
        expected: DocumentStatus,
        found: DocumentStatus,
    },
    #[error("illegal status transition of {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: DocumentId,
        from: DocumentStatus,
        to: DocumentStatus,
    },
    #[error("only draft documents can be stored, {id} is {status:?}")]
    NotDraft {
        id: DocumentId,
        status: DocumentStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Typed outcome of a failed posting attempt.
#[derive(thiserror::Error, Debug)]
pub enum PostingError {
    #[error("document {0} not found")]
    NotFound(DocumentId),
    #[error("warehouse {0} not found")]
    WarehouseNotFound(WarehouseId),
    #[error("product {0} not found")]
    ProductNotFound(ProductId),
    #[error("document {id} is already {status:?}")]
    AlreadyPosted {
        id: DocumentId,
        status: DocumentStatus,
    },
    #[error("document {0} was modified concurrently")]
    Conflict(DocumentId),
    #[error("invalid document: {0}")]
    InvalidDocument(Violations),
    #[error("{0}")]
    InsufficientStock(Shortfall),
    #[error("quantity of {product} in {warehouse} would overflow")]
    Overflow {
        warehouse: WarehouseId,
        product: ProductId,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PostingError {
    /// Only database failures may be retried. Re-posting after any other
    /// failure is rejected by the draft guard.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PostingError::Store(StoreError::Storage(_)))
    }
}

impl From<RepositoryError> for PostingError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound(id) => PostingError::NotFound(id),
            RepositoryError::Conflict { id, .. } => PostingError::Conflict(id),
            RepositoryError::Duplicate(id) => PostingError::Conflict(id),
            RepositoryError::IllegalTransition { id, from, .. } => {
                PostingError::AlreadyPosted { id, status: from }
            }
            RepositoryError::NotDraft { id, status } => PostingError::AlreadyPosted { id, status },
            RepositoryError::Store(e) => PostingError::Store(e),
        }
    }
}

impl From<StockError> for PostingError {
    fn from(value: StockError) -> Self {
        match value {
            StockError::InsufficientStock(shortfall) => PostingError::InsufficientStock(shortfall),
            StockError::Overflow { warehouse, product } => {
                PostingError::Overflow { warehouse, product }
            }
            StockError::Store(e) => PostingError::Store(e),
        }
    }
}

impl From<sled::Error> for PostingError {
    fn from(value: sled::Error) -> Self {
        PostingError::Store(StoreError::Storage(value))
    }
}
