//! Posting engine: turns a draft document into committed stock movements.
//!
//! A posting is one sled transaction spanning the document and stock trees.
//! Inside it the engine re-reads the document, checks that every referenced
//! warehouse and product exists, applies the delta batch and writes the
//! status transition. A shortfall commits the Failed transition alone, so
//! stock is never partially applied and a crash can never leave stock moved
//! for a document that is still a draft.
use std::sync::Arc;

use chrono::Utc;

use crate::catalog::Catalog;
use crate::document::{
    Document, DocumentKind, DocumentStatus, FailureReason, FailureRecord, PostingRecord,
    TransitionMetadata,
};
use crate::error::{PostingError, StockError};
use crate::receivable::{NoopHook, SaleHook};
use crate::repository::DocumentRepository;
use crate::stock::StockStore;
use crate::storage::{Storage, settle};
use crate::types::{DocumentId, TimeStamp};

use sled::transaction::abort;

/// How a committed unit of work ended.
enum Outcome {
    Posted(Document),
    Rejected(PostingError),
}

pub struct PostingEngine {
    storage: Storage,
    documents: DocumentRepository,
    hook: Arc<dyn SaleHook>,
    sync_on_commit: bool,
}

impl PostingEngine {
    pub fn new(storage: Storage) -> Self {
        Self {
            documents: DocumentRepository::new(storage.clone()),
            storage,
            hook: Arc::new(NoopHook),
            sync_on_commit: false,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn SaleHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Flush to disk before reporting a posting as done.
    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Posts a draft document.
    ///
    /// Structural violations and unknown warehouses/products leave the
    /// document as a draft. A shortfall moves it to Failed. Only
    /// [`PostingError::Store`] is worth retrying; a retry after success
    /// fails cleanly with [`PostingError::AlreadyPosted`].
    #[tracing::instrument(skip(self, document_id), fields(document = %document_id))]
    pub fn post(&self, document_id: &DocumentId, approved_by: &str) -> Result<Document, PostingError> {
        let document = self.documents.load(document_id)?;
        if document.status != DocumentStatus::Draft {
            return Err(PostingError::AlreadyPosted {
                id: document.id,
                status: document.status,
            });
        }
        document
            .validate_for_posting(approved_by)
            .map_err(PostingError::InvalidDocument)?;

        let batch = document.deltas();
        let content_hash = document
            .content_hash()
            .map_err(|e| crate::error::StoreError::Encode(e.to_string()))?;
        let now = TimeStamp::new();

        let outcome = settle(self.storage.unit_of_work(|uow| {
            let current = DocumentRepository::load_in::<PostingError>(uow, document_id)?;
            if current.status != DocumentStatus::Draft {
                return abort(PostingError::AlreadyPosted {
                    id: current.id,
                    status: current.status,
                });
            }
            // the stored lines are what gets applied
            if current.lines != document.lines || current.kind != document.kind {
                return abort(PostingError::Conflict(current.id));
            }

            for warehouse in current.warehouses() {
                if Catalog::warehouse_in::<PostingError>(uow, warehouse)?.is_none() {
                    return abort(PostingError::WarehouseNotFound(warehouse.clone()));
                }
            }
            for line in &current.lines {
                if Catalog::product_in::<PostingError>(uow, &line.product_id)?.is_none() {
                    return abort(PostingError::ProductNotFound(line.product_id.clone()));
                }
            }

            match StockStore::apply_batch_in::<PostingError>(uow, &batch)? {
                Ok(_) => {
                    let metadata = TransitionMetadata::Posting(PostingRecord {
                        approved_by: approved_by.to_owned(),
                        posted_at: now.clone(),
                        content_hash: content_hash.clone(),
                    });
                    let posted = DocumentRepository::save_status_transition_in::<PostingError>(
                        uow,
                        document_id,
                        DocumentStatus::Draft,
                        DocumentStatus::Posted,
                        &metadata,
                    )?;
                    Ok(Outcome::Posted(posted))
                }
                Err(StockError::InsufficientStock(shortfall)) => {
                    let metadata = TransitionMetadata::Failure(FailureRecord {
                        reason: FailureReason::InsufficientStock(shortfall.clone()),
                        failed_at: now.clone(),
                    });
                    DocumentRepository::save_status_transition_in::<PostingError>(
                        uow,
                        document_id,
                        DocumentStatus::Draft,
                        DocumentStatus::Failed,
                        &metadata,
                    )?;
                    Ok(Outcome::Rejected(PostingError::InsufficientStock(shortfall)))
                }
                Err(other) => abort(PostingError::from(other)),
            }
        }));

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "posting aborted");
                return Err(e);
            }
        };

        if self.sync_on_commit {
            self.storage.flush()?;
        }

        match outcome {
            Outcome::Posted(posted) => {
                tracing::info!(kind = ?posted.kind, lines = posted.lines.len(), approved_by, "document posted");
                if posted.kind == DocumentKind::Sale {
                    self.run_sale_hook(&posted);
                }
                Ok(posted)
            }
            Outcome::Rejected(e) => {
                tracing::warn!(error = %e, "document failed");
                Err(e)
            }
        }
    }

    /// Moves a draft to Failed without touching stock.
    #[tracing::instrument(skip(self, document_id, reason), fields(document = %document_id))]
    pub fn void(
        &self,
        document_id: &DocumentId,
        voided_by: &str,
        reason: Option<&str>,
    ) -> Result<Document, PostingError> {
        let metadata = TransitionMetadata::Failure(FailureRecord {
            reason: FailureReason::Voided {
                by: voided_by.to_owned(),
                reason: reason.map(str::to_owned),
            },
            failed_at: TimeStamp::<Utc>::new(),
        });

        let voided = settle(self.storage.unit_of_work(|uow| {
            let current = DocumentRepository::load_in::<PostingError>(uow, document_id)?;
            if current.status != DocumentStatus::Draft {
                return abort(PostingError::AlreadyPosted {
                    id: current.id,
                    status: current.status,
                });
            }
            DocumentRepository::save_status_transition_in::<PostingError>(
                uow,
                document_id,
                DocumentStatus::Draft,
                DocumentStatus::Failed,
                &metadata,
            )
        }))?;

        if self.sync_on_commit {
            self.storage.flush()?;
        }
        tracing::info!(voided_by, "document voided");
        Ok(voided)
    }

    fn run_sale_hook(&self, document: &Document) {
        if let Err(e) = self.hook.on_sale_posted(document) {
            tracing::warn!(document = %document.id, error = %e, "sale hook failed after commit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentLine;
    use crate::types::{ProductId, WarehouseId};

    struct Fixture {
        engine: PostingEngine,
        repo: DocumentRepository,
        stock: StockStore,
        warehouse: WarehouseId,
        product: ProductId,
    }

    fn fixture() -> Fixture {
        let storage = Storage::temporary().unwrap();
        let catalog = Catalog::new(storage.clone());
        Fixture {
            engine: PostingEngine::new(storage.clone()),
            repo: DocumentRepository::new(storage.clone()),
            stock: StockStore::new(storage),
            warehouse: catalog.add_warehouse("Main").unwrap().id,
            product: catalog.add_product("Bolt", 10).unwrap().id,
        }
    }

    #[test]
    fn invalid_documents_stay_draft() {
        let fx = fixture();
        let doc = Document::import(fx.warehouse.clone(), "alice")
            .unwrap()
            .line(DocumentLine::new(fx.product.clone(), 3));
        fx.repo.insert(&doc).unwrap();

        let err = fx.engine.post(&doc.id, "bob").unwrap_err();
        assert!(matches!(err, PostingError::InvalidDocument(_)));
        assert!(!err.is_retryable());
        assert_eq!(fx.repo.load(&doc.id).unwrap().status, DocumentStatus::Draft);
    }

    #[test]
    fn unknown_product_leaves_stock_untouched() {
        let fx = fixture();
        let doc = Document::import(fx.warehouse.clone(), "alice")
            .unwrap()
            .line(DocumentLine::priced(fx.product.clone(), 3, 10))
            .line(DocumentLine::priced(ProductId::from("prod_ghost"), 1, 10));
        fx.repo.insert(&doc).unwrap();

        let err = fx.engine.post(&doc.id, "bob").unwrap_err();
        assert!(matches!(err, PostingError::ProductNotFound(_)));
        assert_eq!(fx.stock.quantity(&fx.warehouse, &fx.product).unwrap(), 0);
        assert_eq!(fx.repo.load(&doc.id).unwrap().status, DocumentStatus::Draft);
    }

    #[test]
    fn posted_document_records_approver_and_hash() {
        let fx = fixture();
        let doc = Document::import(fx.warehouse.clone(), "alice")
            .unwrap()
            .line(DocumentLine::priced(fx.product.clone(), 3, 10));
        fx.repo.insert(&doc).unwrap();

        let posted = fx.engine.post(&doc.id, "bob").unwrap();
        let record = posted.posting.clone().unwrap();
        assert_eq!(record.approved_by, "bob");
        assert!(posted.verify_content().unwrap());
        assert_eq!(fx.repo.load(&doc.id).unwrap(), posted);
    }

    #[test]
    fn repeated_lines_past_the_quantity_range_stay_draft() {
        let fx = fixture();
        let max = i64::MAX as u64;
        let doc = Document::import(fx.warehouse.clone(), "alice")
            .unwrap()
            .line(DocumentLine::priced(fx.product.clone(), max, 1))
            .line(DocumentLine::priced(fx.product.clone(), max, 1))
            .line(DocumentLine::priced(fx.product.clone(), 2, 1));
        fx.repo.insert(&doc).unwrap();

        let err = fx.engine.post(&doc.id, "bob").unwrap_err();
        assert!(matches!(err, PostingError::Overflow { .. }));
        assert_eq!(fx.stock.quantity(&fx.warehouse, &fx.product).unwrap(), 0);
        assert_eq!(fx.repo.load(&doc.id).unwrap().status, DocumentStatus::Draft);
    }

    #[test]
    fn repeated_lines_are_applied_in_full() {
        let fx = fixture();
        let max = i64::MAX as u64;
        let doc = Document::import(fx.warehouse.clone(), "alice")
            .unwrap()
            .line(DocumentLine::priced(fx.product.clone(), max, 1))
            .line(DocumentLine::priced(fx.product.clone(), max, 1));
        fx.repo.insert(&doc).unwrap();

        fx.engine.post(&doc.id, "bob").unwrap();
        assert_eq!(
            fx.stock.quantity(&fx.warehouse, &fx.product).unwrap(),
            doc.total_quantity()
        );
    }

    #[test]
    fn void_only_applies_to_drafts() {
        let fx = fixture();
        let doc = Document::export(fx.warehouse.clone(), "alice")
            .unwrap()
            .line(DocumentLine::new(fx.product.clone(), 1));
        fx.repo.insert(&doc).unwrap();

        let voided = fx.engine.void(&doc.id, "carol", Some("typo")).unwrap();
        assert_eq!(voided.status, DocumentStatus::Failed);
        assert!(matches!(
            fx.engine.void(&doc.id, "carol", None),
            Err(PostingError::AlreadyPosted { .. })
        ));
        assert!(matches!(
            fx.engine.post(&doc.id, "bob"),
            Err(PostingError::AlreadyPosted { .. })
        ));
    }
}
