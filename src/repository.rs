//! Durable store of documents keyed by id.
//!
//! Status changes use compare-and-set semantics: a transition names the
//! status it expects to replace and fails with a conflict when the persisted
//! status differs at write time. This is what keeps two concurrent posting
//! attempts of one document from both succeeding.
use crate::document::{Document, DocumentStatus, TransitionMetadata};
use crate::error::{RepositoryError, StoreError};
use crate::storage::{Storage, TxResult, UnitOfWork, decode, decode_in, encode, encode_in, settle};
use crate::types::DocumentId;

use sled::transaction::abort;

#[derive(Clone, Debug)]
pub struct DocumentRepository {
    storage: Storage,
}

impl DocumentRepository {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Stores a new draft. Documents enter the system only as drafts.
    pub fn insert(&self, document: &Document) -> Result<(), RepositoryError> {
        if document.status != DocumentStatus::Draft {
            return Err(RepositoryError::NotDraft {
                id: document.id.clone(),
                status: document.status,
            });
        }
        let bytes = encode(document)?;
        let swapped = self
            .storage
            .documents
            .compare_and_swap(document.id.as_str(), None as Option<&[u8]>, Some(bytes))
            .map_err(StoreError::from)?;

        match swapped {
            Ok(()) => Ok(()),
            Err(_) => Err(RepositoryError::Duplicate(document.id.clone())),
        }
    }

    pub fn load(&self, id: &DocumentId) -> Result<Document, RepositoryError> {
        match self
            .storage
            .documents
            .get(id.as_str())
            .map_err(StoreError::from)?
        {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(RepositoryError::NotFound(id.clone())),
        }
    }

    pub fn list(&self) -> Result<Vec<Document>, RepositoryError> {
        let mut documents = vec![];
        for entry in self.storage.documents.iter() {
            let (_, bytes) = entry.map_err(StoreError::from)?;
            documents.push(decode(&bytes)?);
        }
        Ok(documents)
    }

    pub fn list_by_status(&self, status: DocumentStatus) -> Result<Vec<Document>, RepositoryError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|doc| doc.status == status)
            .collect())
    }

    /// Moves `id` from `from` to `to` in its own transaction.
    pub fn save_status_transition(
        &self,
        id: &DocumentId,
        from: DocumentStatus,
        to: DocumentStatus,
        metadata: &TransitionMetadata,
    ) -> Result<Document, RepositoryError> {
        settle(self.storage.unit_of_work(|uow| {
            Self::save_status_transition_in::<RepositoryError>(uow, id, from, to, metadata)
        }))
    }

    pub fn load_in<E>(uow: &UnitOfWork<'_>, id: &DocumentId) -> TxResult<Document, E>
    where
        E: From<StoreError> + From<RepositoryError>,
    {
        match uow.documents.get(id.as_str())? {
            Some(bytes) => decode_in::<_, E>(&bytes),
            None => abort(E::from(RepositoryError::NotFound(id.clone()))),
        }
    }

    /// Transition inside the caller's unit of work. A conflict aborts the
    /// whole unit, rolling back anything else it wrote.
    pub fn save_status_transition_in<E>(
        uow: &UnitOfWork<'_>,
        id: &DocumentId,
        from: DocumentStatus,
        to: DocumentStatus,
        metadata: &TransitionMetadata,
    ) -> TxResult<Document, E>
    where
        E: From<StoreError> + From<RepositoryError>,
    {
        if from.is_terminal() || to != metadata.target() {
            return abort(E::from(RepositoryError::IllegalTransition {
                id: id.clone(),
                from,
                to,
            }));
        }

        let mut document = Self::load_in::<E>(uow, id)?;
        if document.status != from {
            return abort(E::from(RepositoryError::Conflict {
                id: id.clone(),
                expected: from,
                found: document.status,
            }));
        }

        document.status = to;
        match metadata {
            TransitionMetadata::Posting(record) => document.posting = Some(record.clone()),
            TransitionMetadata::Failure(record) => document.failure = Some(record.clone()),
        }
        uow.documents
            .insert(id.as_str(), encode_in::<_, E>(&document)?)?;

        tracing::debug!(document = %id, ?from, ?to, "document status saved");
        Ok(document)
    }
}
