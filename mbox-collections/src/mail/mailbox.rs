//! IMAP-level mailbox surface (RFC 3501 §6.4). Wraps a [`Collection`] and
//! the shared [`Memstore`], and owns nothing else persistent: the backing
//! `MailboxDoc` lives with the `Account`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use mbox_core::model::{DocType, Flag, ImapUid, ImapUidvalidity};
use mbox_store::{IndexQuery, Memstore, PermanentStore};

use crate::error::{MailError, Result};
use crate::mail::collection::{Collection, FlagMode};
use crate::notifier::Notifier;

#[derive(Clone, Copy, Debug, Default)]
pub struct MailboxStatus {
    pub messages: Option<u64>,
    pub recent: Option<u64>,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
    pub unseen: Option<u64>,
}

pub struct Mailbox {
    name: String,
    uidvalidity: ImapUidvalidity,
    rw: bool,
    collection: Collection,
    memstore: Arc<Memstore>,
    notifier: Arc<Notifier>,
}

impl Mailbox {
    /// Opens `name`, priming the memstore's per-mailbox UID counter from
    /// whatever fdocs the permanent store already holds for it.
    pub async fn open(
        name: String,
        uidvalidity: ImapUidvalidity,
        rw: bool,
        memstore: Arc<Memstore>,
        backend: Arc<dyn PermanentStore>,
        notifier: Arc<Notifier>,
    ) -> Result<Self> {
        let existing = backend
            .get_from_index(&IndexQuery::ByTypeAndMbox(DocType::Flags, name.clone()))
            .await?;
        let max_uid = existing
            .iter()
            .filter_map(|(_, doc)| doc.as_flags().map(|f| f.uid.get()))
            .max()
            .unwrap_or(0);
        memstore.set_last_soledad_uid(&name, max_uid).await;

        Ok(Self {
            collection: Collection::new(name.clone(), memstore.clone()),
            name,
            uidvalidity,
            rw,
            memstore,
            notifier,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn add_message(&self, bytes: &[u8], flags: BTreeSet<Flag>) -> Result<ImapUid> {
        let uid = self.collection.add_msg(bytes, flags).await?;
        self.notify_new_messages().await;
        Ok(uid)
    }

    /// The cached container for `uid`, if present. Used by callers that
    /// want to `copy_from` a message fetched here into another mailbox.
    pub async fn get_container(&self, uid: ImapUid) -> Option<mbox_core::container::MessageContainer> {
        self.collection.get_msg_by_uid(uid).await
    }

    /// Returns `(seqno, uid)` pairs for the requested UIDs, bounded to
    /// `last_uid` if the range is open-ended and intersected with the set
    /// of UIDs that actually exist.
    pub async fn fetch(&self, uids: &[ImapUid]) -> Vec<(u64, ImapUid)> {
        let existing: BTreeSet<ImapUid> = self.collection.all_uid_iter().await.into_iter().collect();
        existing
            .iter()
            .enumerate()
            .filter(|(_, uid)| uids.contains(uid))
            .map(|(i, uid)| ((i + 1) as u64, *uid))
            .collect()
    }

    pub async fn fetch_flags(&self) -> BTreeMap<ImapUid, BTreeSet<Flag>> {
        self.collection.all_flags().await
    }

    pub async fn fetch_headers(&self) -> BTreeMap<ImapUid, mbox_core::model::HeadersDoc> {
        self.collection.all_headers().await
    }

    pub async fn store(
        &self,
        uids: &[ImapUid],
        flags: BTreeSet<Flag>,
        mode: FlagMode,
    ) -> Result<BTreeMap<ImapUid, BTreeSet<Flag>>> {
        if !self.rw {
            return Err(MailError::ReadOnlyMailbox(self.name.clone()));
        }
        Ok(self.collection.set_flags(uids, &flags, mode).await)
    }

    /// Deep-copies the source container into this mailbox, deduplicating
    /// against an existing non-deleted fdoc with the same `chash`.
    pub async fn copy_from(&self, source: &mbox_core::container::MessageContainer) -> Result<ImapUid> {
        let fdoc = source
            .fdoc
            .as_ref()
            .ok_or_else(|| MailError::IllegalQuery("copy source has no flags document".into()))?;

        if let Some(existing) = self
            .memstore
            .get_fdoc_from_chash(&fdoc.chash, &self.name)
            .await
        {
            return Ok(existing.uid);
        }

        let uid = self.memstore.increment_last_soledad_uid(&self.name).await;
        let mut new_fdoc = fdoc.clone();
        new_fdoc.mbox = self.name.clone();
        new_fdoc.uid = uid;

        let mut container = source.clone();
        container.fdoc = Some(new_fdoc);

        let done = self
            .memstore
            .create_message(&self.name, uid, container, false)
            .await;
        let _ = done.await;
        self.notify_new_messages().await;
        Ok(uid)
    }

    pub async fn expunge(&self) -> Result<BTreeSet<ImapUid>> {
        if !self.rw {
            return Err(MailError::ReadOnlyMailbox(self.name.clone()));
        }
        let deleted = self.memstore.expunge(&self.name).await.map_err(|e| {
            MailError::Storage(mbox_store::StorageError::Backend(e))
        })?;
        self.notify_new_messages().await;
        Ok(deleted)
    }

    pub async fn close(&self) -> Result<BTreeSet<ImapUid>> {
        self.expunge().await
    }

    pub async fn get_uid_next(&self) -> u32 {
        self.memstore.peek_last_uid(&self.name).await + 1
    }

    pub fn get_uid_validity(&self) -> ImapUidvalidity {
        self.uidvalidity
    }

    pub async fn request_status(&self, names: &[&str]) -> MailboxStatus {
        let mut status = MailboxStatus::default();
        for &name in names {
            match name {
                "MESSAGES" => status.messages = Some(self.collection.count().await as u64),
                "RECENT" => status.recent = Some(self.collection.count_recent().await as u64),
                "UIDNEXT" => status.uid_next = Some(self.get_uid_next().await),
                "UIDVALIDITY" => status.uid_validity = Some(self.uidvalidity.get()),
                "UNSEEN" => status.unseen = Some(self.collection.count_unseen().await as u64),
                _ => {}
            }
        }
        status
    }

    /// Minimum required support: `HEADER Message-ID <id>`. Anything else
    /// returns the empty list rather than an `IllegalQuery` error.
    pub async fn search(&self, query: &[&str]) -> Vec<ImapUid> {
        match query {
            ["HEADER", "Message-ID", id] => self
                .collection
                .get_uid_from_msgid(id)
                .await
                .into_iter()
                .collect(),
            _ => {
                tracing::warn!("unsupported search query: {:?}", query);
                Vec::new()
            }
        }
    }

    async fn notify_new_messages(&self) {
        let exists = self.collection.count().await as u64;
        let recent = self.collection.count_recent().await as u64;
        self.notifier.notify(&self.name, exists, recent).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbox_store::InMemoryStore;
    use std::num::NonZeroU32;

    async fn open_mailbox(name: &str) -> Mailbox {
        let backend: Arc<dyn PermanentStore> = Arc::new(InMemoryStore::new());
        let memstore = Memstore::new(backend.clone());
        Mailbox::open(
            name.to_string(),
            NonZeroU32::new(1).unwrap(),
            true,
            memstore,
            backend,
            Arc::new(Notifier::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn uid_next_starts_at_one_on_empty_mailbox() {
        let mbox = open_mailbox("INBOX").await;
        assert_eq!(mbox.get_uid_next().await, 1);
    }

    #[tokio::test]
    async fn store_on_readonly_mailbox_fails() {
        let backend: Arc<dyn PermanentStore> = Arc::new(InMemoryStore::new());
        let memstore = Memstore::new(backend.clone());
        let mbox = Mailbox::open(
            "INBOX".to_string(),
            NonZeroU32::new(1).unwrap(),
            false,
            memstore,
            backend,
            Arc::new(Notifier::new()),
        )
        .await
        .unwrap();

        let result = mbox.store(&[], BTreeSet::new(), FlagMode::Add).await;
        assert!(matches!(result, Err(MailError::ReadOnlyMailbox(_))));
    }

    #[tokio::test]
    async fn search_missing_message_id_returns_empty() {
        let mbox = open_mailbox("INBOX").await;
        assert!(mbox.search(&["HEADER", "Message-ID", "<x@y>"]).await.is_empty());
    }

    #[tokio::test]
    async fn status_reports_requested_fields() {
        let mbox = open_mailbox("INBOX").await;
        let status = mbox.request_status(&["MESSAGES", "RECENT", "UIDNEXT"]).await;
        assert_eq!(status.messages, Some(0));
        assert_eq!(status.recent, Some(0));
        assert_eq!(status.uid_next, Some(1));
        assert_eq!(status.uid_validity, None);
    }
}
