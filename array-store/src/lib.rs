//! Append-only flat-file database for named numeric arrays.
//!
//! A store is a pair of files sharing a base name:
//! - `<name>.dat` holds array blobs back to back, in write order
//! - `<name>.map` holds one `offset<whitespace>identifier` line per blob
//!
//! Records are never updated or deleted. Identifiers may repeat; lookups return
//! the first match in insertion order. The store assumes a single writer and
//! performs no locking.

pub mod codec;
pub mod error;
pub mod store;

pub use codec::{ElementType, StoreElement};
pub use error::{StoreError, StoreResult};
pub use store::{ArrayStore, DbRecord, StoreMode};
