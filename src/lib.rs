pub mod catalog;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod receivable;
pub mod repository;
pub mod service;
pub mod stock;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use document::{Document, DocumentKind, DocumentLine, DocumentStatus};
pub use engine::PostingEngine;
pub use error::PostingError;
pub use service::{DocumentService, ErrorCode, ServiceError};
pub use storage::Storage;
