use thiserror::Error;

/// Typed error boundary for mailbox/account operations. Internal plumbing
/// keeps using `anyhow::Result`; callers of this crate's public surface see
/// this enum instead.
#[derive(Error, Debug)]
pub enum MailError {
    #[error("no such mailbox: {0}")]
    NoSuchMailbox(String),
    #[error("mailbox already exists: {0}")]
    MailboxCollision(String),
    #[error("mailbox exception: {0}")]
    MailboxException(String),
    #[error("mailbox is read-only: {0}")]
    ReadOnlyMailbox(String),
    #[error("unsupported search query: {0}")]
    IllegalQuery(String),
    #[error("could not decrypt incoming message: {0}")]
    DecryptFailure(String),
    #[error("could not synchronize with remote queue: {0}")]
    SyncFailure(String),
    #[error("storage error: {0}")]
    Storage(#[from] mbox_store::StorageError),
}

pub type Result<T> = std::result::Result<T, MailError>;
