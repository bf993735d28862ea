//! Document identity model and storage boundaries
//!
//! Provides kind-tagged document identifiers, the common document envelope,
//! and the two storage seams the issuance engine depends on: a
//! read/write-by-key document store and a blob content store.

pub mod content;
pub mod document;
pub mod envelope;
pub mod error;
pub mod fs;
pub mod id;

pub use content::{certificate_blob_path, ContentStore, MemoryContentStore};
pub use document::{DocumentStore, DocumentStoreExt, MemoryDocumentStore};
pub use envelope::{Document, DocumentEnvelope};
pub use error::StoreError;
pub use fs::{FsContentStore, FsDocumentStore};
pub use id::{DocumentId, DocumentIdError, DocumentKind};

// Re-export for implementors of the store traits
pub use async_trait::async_trait;
