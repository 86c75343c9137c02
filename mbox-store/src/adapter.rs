//! The permanent-store adapter contract.
//!
//! The core only ever talks to `Arc<dyn PermanentStore>`, so it can be built
//! and tested against the shipped in-memory adapter today and a networked
//! one later without conditional compilation, the same way `LoginProvider`
//! is an `async_trait` object in the rest of this workspace.

use async_trait::async_trait;

use mbox_core::model::{DocId, Document, DocType};

use crate::error::StorageError;

pub type Result<T> = std::result::Result<T, StorageError>;

/// The seven secondary indexes the core requires.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexQuery {
    ByType(DocType),
    ByTypeAndMbox(DocType, String),
    ByTypeAndMboxAndUid(DocType, String, u32),
    ByTypeAndSubscribed(DocType, bool),
    ByTypeAndMboxSeen(DocType, String, bool),
    ByTypeAndMboxRecent(DocType, String, bool),
    ByChash(DocType, String),
}

#[async_trait]
pub trait PermanentStore: Send + Sync {
    /// Creates a brand new document, assigning it a fresh id.
    async fn create_doc(&self, content: Document) -> Result<DocId>;

    /// Overwrites an existing document in place.
    async fn put_doc(&self, id: DocId, content: Document) -> Result<()>;

    /// Removes a document. Deleting an id that does not exist is not an
    /// error (matches `delete_doc` semantics used by `expunge`/`delete`).
    async fn delete_doc(&self, id: DocId) -> Result<()>;

    /// Fetches every document whose indexed fields match `query`.
    async fn get_from_index(&self, query: &IndexQuery) -> Result<Vec<(DocId, Document)>>;

    /// Declares the index definitions a conforming mailbox listing needs. A conforming adapter
    /// either already maintains them or builds them lazily on first use;
    /// the in-memory adapter recomputes indexes on every query and treats
    /// this as a no-op.
    async fn create_index(&self, name: &str) -> Result<()>;

    /// Flushes/synchronizes with whatever remote replication the concrete
    /// adapter performs. A no-op for the in-memory adapter.
    async fn sync(&self) -> Result<()>;
}
