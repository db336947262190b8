//! Service layer API for document workflow operations
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::Settings;
use crate::document::{Document, DocumentLine, DocumentStatus, Violations};
use crate::engine::PostingEngine;
use crate::error::{CatalogError, PostingError, RepositoryError, StockError, StoreError};
use crate::receivable::ReceivableLedger;
use crate::repository::DocumentRepository;
use crate::stock::{Shortfall, StockLevel, StockStore};
use crate::storage::Storage;
use crate::types::{CustomerId, DocumentId, Product, ProductId, Warehouse, WarehouseId};

/// Classification handed to the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    Conflict,
    BadRequest,
    Unprocessable,
    Unavailable,
    Internal,
}

impl ErrorCode {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::BadRequest => 400,
            ErrorCode::Unprocessable => 422,
            ErrorCode::Unavailable => 503,
            ErrorCode::Internal => 500,
        }
    }

    pub fn retryable(self) -> bool {
        self == ErrorCode::Unavailable
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("invalid document: {0}")]
    InvalidDocument(Violations),
    #[error(transparent)]
    Posting(#[from] PostingError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Stock(#[from] StockError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn store_code(error: &StoreError) -> ErrorCode {
    match error {
        StoreError::Storage(_) => ErrorCode::Unavailable,
        StoreError::KeyTooLong(_) => ErrorCode::BadRequest,
        _ => ErrorCode::Internal,
    }
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::InvalidDocument(_) => ErrorCode::BadRequest,
            ServiceError::Posting(e) => match e {
                PostingError::NotFound(_)
                | PostingError::WarehouseNotFound(_)
                | PostingError::ProductNotFound(_) => ErrorCode::NotFound,
                PostingError::AlreadyPosted { .. } | PostingError::Conflict(_) => {
                    ErrorCode::Conflict
                }
                PostingError::InvalidDocument(_) => ErrorCode::BadRequest,
                PostingError::InsufficientStock(_) | PostingError::Overflow { .. } => {
                    ErrorCode::Unprocessable
                }
                PostingError::Store(e) => store_code(e),
            },
            ServiceError::Catalog(e) => match e {
                CatalogError::WarehouseNotFound(_) | CatalogError::ProductNotFound(_) => {
                    ErrorCode::NotFound
                }
                CatalogError::WarehouseNotEmpty(_) => ErrorCode::Conflict,
                CatalogError::Invalid(_) => ErrorCode::BadRequest,
                CatalogError::Store(e) => store_code(e),
            },
            ServiceError::Repository(e) => match e {
                RepositoryError::NotFound(_) => ErrorCode::NotFound,
                RepositoryError::Duplicate(_)
                | RepositoryError::Conflict { .. }
                | RepositoryError::IllegalTransition { .. }
                | RepositoryError::NotDraft { .. } => ErrorCode::Conflict,
                RepositoryError::Store(e) => store_code(e),
            },
            ServiceError::Stock(e) => match e {
                StockError::InsufficientStock(_) | StockError::Overflow { .. } => {
                    ErrorCode::Unprocessable
                }
                StockError::Store(e) => store_code(e),
            },
            ServiceError::Store(e) => store_code(e),
        }
    }
}

/// A document together with the catalog entries it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDetails {
    pub document: Document,
    pub source: Option<Warehouse>,
    pub destination: Option<Warehouse>,
    pub products: Vec<Option<Product>>, // one per line, None once removed
    pub total_value: u64,
}

pub struct DocumentService {
    catalog: Catalog,
    documents: DocumentRepository,
    stock: StockStore,
    receivables: ReceivableLedger,
    engine: PostingEngine,
}

fn new_document(document: anyhow::Result<Document>) -> Result<Document, ServiceError> {
    document.map_err(|e| ServiceError::Store(StoreError::Id(e.to_string())))
}

impl DocumentService {
    /// Service over `storage` with sale receivables recorded in the same
    /// database.
    pub fn new(storage: Storage) -> Result<Self, StoreError> {
        let receivables = ReceivableLedger::new(&storage)?;
        Ok(Self {
            catalog: Catalog::new(storage.clone()),
            documents: DocumentRepository::new(storage.clone()),
            stock: StockStore::new(storage.clone()),
            engine: PostingEngine::new(storage).with_hook(Arc::new(receivables.clone())),
            receivables,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, StoreError> {
        Ok(Self::new(settings.open_storage()?)?.sync_on_commit(settings.posting.sync_on_commit))
    }

    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.engine = self.engine.sync_on_commit(sync);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn receivables(&self) -> &ReceivableLedger {
        &self.receivables
    }

    pub fn create_import(
        &self,
        destination: &WarehouseId,
        lines: Vec<DocumentLine>,
        created_by: &str,
        note: Option<&str>,
    ) -> Result<Document, ServiceError> {
        let document = new_document(Document::import(destination.clone(), created_by))?;
        self.create(document.lines(lines), note)
    }

    /// Export drafts may exceed current stock; availability is settled at
    /// posting.
    pub fn create_export(
        &self,
        source: &WarehouseId,
        lines: Vec<DocumentLine>,
        created_by: &str,
        note: Option<&str>,
    ) -> Result<Document, ServiceError> {
        let document = new_document(Document::export(source.clone(), created_by))?;
        self.create(document.lines(lines), note)
    }

    /// Transfers are checked against the source's current stock at creation
    /// as well as at posting.
    pub fn create_transfer(
        &self,
        source: &WarehouseId,
        destination: &WarehouseId,
        lines: Vec<DocumentLine>,
        created_by: &str,
        note: Option<&str>,
    ) -> Result<Document, ServiceError> {
        let document = new_document(Document::transfer(
            source.clone(),
            destination.clone(),
            created_by,
        ))?
        .lines(lines);

        document.validate().map_err(ServiceError::InvalidDocument)?;
        self.check_available(&document)?;
        self.create(document, note)
    }

    pub fn create_sale(
        &self,
        source: &WarehouseId,
        customer: Option<CustomerId>,
        lines: Vec<DocumentLine>,
        created_by: &str,
        note: Option<&str>,
    ) -> Result<Document, ServiceError> {
        let document = new_document(Document::sale(source.clone(), customer, created_by))?;
        self.create(document.lines(lines), note)
    }

    fn create(&self, mut document: Document, note: Option<&str>) -> Result<Document, ServiceError> {
        if let Some(note) = note {
            document = document.note(note);
        }
        document.validate().map_err(ServiceError::InvalidDocument)?;

        for warehouse in document.warehouses() {
            self.catalog.warehouse(warehouse)?;
        }
        for line in &document.lines {
            self.catalog.product(&line.product_id)?;
        }

        self.documents.insert(&document)?;
        tracing::info!(document = %document.id, kind = ?document.kind, created_by = %document.created_by, "draft created");
        Ok(document)
    }

    fn check_available(&self, document: &Document) -> Result<(), ServiceError> {
        for (key, delta) in document.deltas().iter() {
            if delta >= 0 {
                continue;
            }
            let available = self.stock.quantity(&key.warehouse, &key.product)?;
            if u128::from(available) < delta.unsigned_abs() {
                return Err(StockError::InsufficientStock(Shortfall {
                    warehouse: key.warehouse.clone(),
                    product: key.product.clone(),
                    available,
                    requested: u64::try_from(delta.unsigned_abs()).unwrap_or(u64::MAX),
                })
                .into());
            }
        }
        Ok(())
    }

    /// Posts a draft. Errors carry an [`ErrorCode`] through [`ServiceError::code`].
    #[tracing::instrument(skip(self, document_id), fields(document = %document_id))]
    pub fn post_document(
        &self,
        document_id: &DocumentId,
        approved_by: &str,
    ) -> Result<Document, ServiceError> {
        self.engine.post(document_id, approved_by).map_err(|e| {
            let e = ServiceError::from(e);
            tracing::debug!(code = ?e.code(), status = e.code().http_status(), "post rejected");
            e
        })
    }

    pub fn void_document(
        &self,
        document_id: &DocumentId,
        voided_by: &str,
        reason: Option<&str>,
    ) -> Result<Document, ServiceError> {
        Ok(self.engine.void(document_id, voided_by, reason)?)
    }

    pub fn get_document(&self, document_id: &DocumentId) -> Result<Document, ServiceError> {
        Ok(self.documents.load(document_id)?)
    }

    /// Document with its warehouses and products resolved. Line values use
    /// the prices on the document, never the current catalog price.
    pub fn document_details(&self, document_id: &DocumentId) -> Result<DocumentDetails, ServiceError> {
        let document = self.documents.load(document_id)?;

        let source = document
            .source
            .as_ref()
            .map(|id| self.lookup_warehouse(id))
            .transpose()?
            .flatten();
        let destination = document
            .destination
            .as_ref()
            .map(|id| self.lookup_warehouse(id))
            .transpose()?
            .flatten();

        let mut products = Vec::with_capacity(document.lines.len());
        for line in &document.lines {
            products.push(match self.catalog.product(&line.product_id) {
                Ok(product) => Some(product),
                Err(CatalogError::ProductNotFound(_)) => None,
                Err(e) => return Err(e.into()),
            });
        }

        Ok(DocumentDetails {
            total_value: document.total_value(),
            document,
            source,
            destination,
            products,
        })
    }

    fn lookup_warehouse(&self, id: &WarehouseId) -> Result<Option<Warehouse>, ServiceError> {
        match self.catalog.warehouse(id) {
            Ok(warehouse) => Ok(Some(warehouse)),
            Err(CatalogError::WarehouseNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn pending_documents(&self) -> Result<Vec<Document>, ServiceError> {
        self.documents_by_status(DocumentStatus::Draft)
    }

    pub fn documents_by_status(&self, status: DocumentStatus) -> Result<Vec<Document>, ServiceError> {
        Ok(self.documents.list_by_status(status)?)
    }

    pub fn get_stock_quantity(
        &self,
        warehouse: &WarehouseId,
        product: &ProductId,
    ) -> Result<u64, ServiceError> {
        Ok(self.stock.quantity(warehouse, product)?)
    }

    pub fn warehouse_stock(&self, warehouse: &WarehouseId) -> Result<Vec<StockLevel>, ServiceError> {
        self.catalog.warehouse(warehouse)?;
        Ok(self.stock.warehouse_stock(warehouse)?)
    }

    pub fn product_total(&self, product: &ProductId) -> Result<u64, ServiceError> {
        Ok(self.stock.product_total(product)?)
    }
}
