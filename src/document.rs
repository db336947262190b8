//! Stock-moving documents and their lifecycle rules
use std::fmt;

use chrono::Utc;

use crate::stock::{DeltaBatch, Shortfall};
use crate::types::{CustomerId, DocumentId, ProductId, TimeStamp, WarehouseId};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    #[n(0)]
    Import,
    #[n(1)]
    Export,
    #[n(2)]
    Transfer,
    #[n(3)]
    Sale,
}

/// Draft is the only non-terminal status.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Posted,
    #[n(2)]
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DocumentStatus::Draft)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DocumentLine {
    #[n(0)]
    pub product_id: ProductId,
    #[n(1)]
    pub quantity: u64,
    #[n(2)]
    pub unit_price: Option<u64>, // required on imports
}

impl DocumentLine {
    pub fn new(product_id: ProductId, quantity: u64) -> Self {
        Self {
            product_id,
            quantity,
            unit_price: None,
        }
    }

    pub fn priced(product_id: ProductId, quantity: u64, unit_price: u64) -> Self {
        Self {
            product_id,
            quantity,
            unit_price: Some(unit_price),
        }
    }

    pub fn total_value(&self) -> u64 {
        self.quantity
            .saturating_mul(self.unit_price.unwrap_or_default())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PostingRecord {
    #[n(0)]
    pub approved_by: String,
    #[n(1)]
    pub posted_at: TimeStamp<Utc>,
    #[n(2)]
    pub content_hash: String, // sha256 of the cbor encoded lines
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[n(0)]
    InsufficientStock(#[n(0)] Shortfall),
    #[n(1)]
    Voided {
        #[n(0)]
        by: String,
        #[n(1)]
        reason: Option<String>,
    },
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    #[n(0)]
    pub reason: FailureReason,
    #[n(1)]
    pub failed_at: TimeStamp<Utc>,
}

/// What gets recorded alongside a status change out of Draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionMetadata {
    Posting(PostingRecord),
    Failure(FailureRecord),
}

impl TransitionMetadata {
    pub fn target(&self) -> DocumentStatus {
        match self {
            TransitionMetadata::Posting(_) => DocumentStatus::Posted,
            TransitionMetadata::Failure(_) => DocumentStatus::Failed,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Document {
    #[n(0)]
    pub id: DocumentId,
    #[n(1)]
    pub kind: DocumentKind,
    #[n(2)]
    pub status: DocumentStatus,
    #[n(3)]
    pub created_by: String,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
    #[n(5)]
    pub source: Option<WarehouseId>,
    #[n(6)]
    pub destination: Option<WarehouseId>,
    #[n(7)]
    pub customer: Option<CustomerId>,
    #[n(8)]
    pub note: Option<String>,
    #[n(9)]
    pub lines: Vec<DocumentLine>,
    #[n(10)]
    pub posting: Option<PostingRecord>,
    #[n(11)]
    pub failure: Option<FailureRecord>,
}

/// A single structural rule violation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("import document must have a destination warehouse")]
    MissingDestination,
    #[error("{0:?} document must have a source warehouse")]
    MissingSource(DocumentKind),
    #[error("{0:?} document cannot have a destination warehouse")]
    UnexpectedDestination(DocumentKind),
    #[error("import document cannot have a source warehouse")]
    UnexpectedSource,
    #[error("transfer source and destination must differ")]
    SameWarehouse,
    #[error("customer reference is only allowed on sale documents")]
    UnexpectedCustomer,
    #[error("document has no lines")]
    NoLines,
    #[error("line {0}: quantity must be positive")]
    NonPositiveQuantity(usize),
    #[error("line {0}: quantity exceeds the supported range")]
    QuantityTooLarge(usize),
    #[error("line {0}: import and sale lines require a unit price")]
    MissingUnitPrice(usize),
    #[error("created by cannot be empty")]
    MissingCreator,
    #[error("approved by cannot be empty")]
    MissingApprover,
}

/// Every violation found, in a deterministic order: header rules first,
/// then lines by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violations(pub Vec<Violation>);

impl Violations {
    pub fn first(&self) -> Option<&Violation> {
        self.0.first()
    }
    pub fn contains(&self, violation: &Violation) -> bool {
        self.0.contains(violation)
    }
}

impl From<Violation> for Violations {
    fn from(value: Violation) -> Self {
        Violations(vec![value])
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

impl Document {
    /// Construct a new draft, this becomes the basis for the builder calls.
    pub fn draft(kind: DocumentKind, created_by: &str) -> anyhow::Result<Self> {
        Ok(Self {
            id: DocumentId::generate()?,
            kind,
            status: DocumentStatus::Draft,
            created_by: created_by.to_owned(),
            created_at: TimeStamp::new(),
            source: None,
            destination: None,
            customer: None,
            note: None,
            lines: vec![],
            posting: None,
            failure: None,
        })
    }
    pub fn import(destination: WarehouseId, created_by: &str) -> anyhow::Result<Self> {
        Ok(Self::draft(DocumentKind::Import, created_by)?.destination_warehouse(destination))
    }
    pub fn export(source: WarehouseId, created_by: &str) -> anyhow::Result<Self> {
        Ok(Self::draft(DocumentKind::Export, created_by)?.source_warehouse(source))
    }
    pub fn transfer(
        source: WarehouseId,
        destination: WarehouseId,
        created_by: &str,
    ) -> anyhow::Result<Self> {
        Ok(Self::draft(DocumentKind::Transfer, created_by)?
            .source_warehouse(source)
            .destination_warehouse(destination))
    }
    pub fn sale(
        source: WarehouseId,
        customer: Option<CustomerId>,
        created_by: &str,
    ) -> anyhow::Result<Self> {
        let mut doc = Self::draft(DocumentKind::Sale, created_by)?.source_warehouse(source);
        doc.customer = customer;
        Ok(doc)
    }
    pub fn source_warehouse(mut self, warehouse: WarehouseId) -> Self {
        self.source = Some(warehouse);
        self
    }
    pub fn destination_warehouse(mut self, warehouse: WarehouseId) -> Self {
        self.destination = Some(warehouse);
        self
    }
    pub fn customer(mut self, customer: CustomerId) -> Self {
        self.customer = Some(customer);
        self
    }
    pub fn note(mut self, note: &str) -> Self {
        self.note = Some(note.to_owned());
        self
    }
    pub fn line(mut self, line: DocumentLine) -> Self {
        self.lines.push(line);
        self
    }
    pub fn lines(mut self, lines: impl IntoIterator<Item = DocumentLine>) -> Self {
        self.lines.extend(lines);
        self
    }

    pub fn is_draft(&self) -> bool {
        self.status == DocumentStatus::Draft
    }

    /// Checks the structural rules for the document's kind.
    pub fn validate(&self) -> Result<(), Violations> {
        let mut found = vec![];

        if self.created_by.trim().is_empty() {
            found.push(Violation::MissingCreator);
        }

        match self.kind {
            DocumentKind::Import => {
                if self.destination.is_none() {
                    found.push(Violation::MissingDestination);
                }
                if self.source.is_some() {
                    found.push(Violation::UnexpectedSource);
                }
            }
            DocumentKind::Export | DocumentKind::Sale => {
                if self.source.is_none() {
                    found.push(Violation::MissingSource(self.kind));
                }
                if self.destination.is_some() {
                    found.push(Violation::UnexpectedDestination(self.kind));
                }
            }
            DocumentKind::Transfer => {
                if self.source.is_none() {
                    found.push(Violation::MissingSource(self.kind));
                }
                if self.destination.is_none() {
                    found.push(Violation::MissingDestination);
                }
                if self.source.is_some() && self.source == self.destination {
                    found.push(Violation::SameWarehouse);
                }
            }
        }

        if self.customer.is_some() && self.kind != DocumentKind::Sale {
            found.push(Violation::UnexpectedCustomer);
        }

        if self.lines.is_empty() {
            found.push(Violation::NoLines);
        }
        for (i, line) in self.lines.iter().enumerate() {
            if line.quantity == 0 {
                found.push(Violation::NonPositiveQuantity(i));
            }
            if i64::try_from(line.quantity).is_err() {
                found.push(Violation::QuantityTooLarge(i));
            }
            // sale prices become the customer's debt
            let priced = matches!(self.kind, DocumentKind::Import | DocumentKind::Sale);
            if priced && line.unit_price.is_none() {
                found.push(Violation::MissingUnitPrice(i));
            }
        }

        if found.is_empty() {
            Ok(())
        } else {
            Err(Violations(found))
        }
    }

    /// [`Document::validate`] plus the approver check applied at posting.
    pub fn validate_for_posting(&self, approved_by: &str) -> Result<(), Violations> {
        let mut found = match self.validate() {
            Ok(()) => vec![],
            Err(Violations(found)) => found,
        };
        if approved_by.trim().is_empty() {
            found.push(Violation::MissingApprover);
        }

        if found.is_empty() {
            Ok(())
        } else {
            Err(Violations(found))
        }
    }

    /// The stock changes this document implies. Only meaningful for a
    /// document that passed validation.
    pub fn deltas(&self) -> DeltaBatch {
        let mut batch = DeltaBatch::new();

        for line in &self.lines {
            let qty = i128::from(line.quantity);

            match self.kind {
                DocumentKind::Import => {
                    if let Some(to) = &self.destination {
                        batch.push(to.clone(), line.product_id.clone(), qty);
                    }
                }
                DocumentKind::Export | DocumentKind::Sale => {
                    if let Some(from) = &self.source {
                        batch.push(from.clone(), line.product_id.clone(), -qty);
                    }
                }
                DocumentKind::Transfer => {
                    if let (Some(from), Some(to)) = (&self.source, &self.destination) {
                        batch.push(from.clone(), line.product_id.clone(), -qty);
                        batch.push(to.clone(), line.product_id.clone(), qty);
                    }
                }
            }
        }

        batch
    }

    /// Warehouses the document references, source first.
    pub fn warehouses(&self) -> impl Iterator<Item = &WarehouseId> {
        self.source.iter().chain(self.destination.iter())
    }

    pub fn total_value(&self) -> u64 {
        self.lines
            .iter()
            .fold(0u64, |acc, line| acc.saturating_add(line.total_value()))
    }

    pub fn total_quantity(&self) -> u64 {
        self.lines
            .iter()
            .fold(0u64, |acc, line| acc.saturating_add(line.quantity))
    }

    // hash of the lines serialised into cbor
    pub fn content_hash(&self) -> anyhow::Result<String> {
        let contents = minicbor::to_vec(&self.lines)?;
        Ok(crate::utils::digest(&contents))
    }

    /// True when the lines still match the hash recorded at posting. Drafts
    /// and failed documents have nothing to verify against.
    pub fn verify_content(&self) -> anyhow::Result<bool> {
        match &self.posting {
            Some(posting) => Ok(posting.content_hash == self.content_hash()?),
            None => Ok(false),
        }
    }
}
