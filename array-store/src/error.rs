use std::path::PathBuf;
use thiserror::Error;

use crate::codec::ElementType;

/// Errors produced by [`ArrayStore`](crate::ArrayStore) operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Load mode requires both backing files to exist.
    #[error("could not find the store files {} and {}", .data.display(), .map.display())]
    MissingStore {
        /// Expected data file path.
        data: PathBuf,
        /// Expected index file path.
        map: PathBuf,
    },

    /// No record carries the requested identifier.
    #[error("identifier not found: {0:?}")]
    NotFound(String),

    /// Identifier cannot survive a round trip through the index file.
    #[error("invalid identifier {0:?}: must be non-empty, single-line and untrimmed")]
    InvalidIdentifier(String),

    /// Index file line could not be parsed.
    #[error("malformed index line {line}: {content:?}")]
    MalformedIndex {
        /// One-based line number.
        line: usize,
        /// Raw line content.
        content: String,
    },

    /// Stored element type differs from the requested one.
    #[error("element type mismatch: expected {expected}, found {found}")]
    DtypeMismatch {
        expected: ElementType,
        found: ElementType,
    },

    /// Blob header or payload is damaged.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
