//! Per-mailbox view over the memstore: message ingestion, flag mutation
//! and the UID/FLAGS listings IMAP's FETCH/STORE commands read from.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use mbox_core::container::MessageContainer;
use mbox_core::hash;
use mbox_core::mime_walk;
use mbox_core::model::{Flag, FlagsDoc, HeadersDoc, ImapUid};
use mbox_store::Memstore;

use crate::error::Result;

/// `mode` argument to [`Collection::set_flags`]: remove, replace, or add.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagMode {
    Remove,
    Replace,
    Add,
}

pub struct Collection {
    mbox: String,
    memstore: Arc<Memstore>,
}

impl Collection {
    pub fn new(mbox: String, memstore: Arc<Memstore>) -> Self {
        Self { mbox, memstore }
    }

    /// Parses `raw`, walks its MIME structure, deduplicates on content
    /// hash, and either returns the UID of an existing non-deleted
    /// duplicate or allocates a fresh one and stores the message.
    pub async fn add_msg(&self, raw: &[u8], flags: BTreeSet<Flag>) -> Result<ImapUid> {
        let chash = hash::chash(raw);

        if let Some(existing) = self.memstore.get_fdoc_from_chash(&chash, &self.mbox).await {
            return Ok(existing.uid);
        }

        let walked = mime_walk::walk(raw).map_err(|e| {
            crate::error::MailError::IllegalQuery(format!("unparsable message: {e}"))
        })?;

        let uid = self.memstore.increment_last_soledad_uid(&self.mbox).await;

        let fdoc = FlagsDoc::new(self.mbox.clone(), uid, chash.clone(), flags.clone());
        let hdoc = HeadersDoc {
            chash: chash.clone(),
            ..walked.headers
        };
        let cdocs: BTreeMap<u32, _> = walked
            .content
            .into_iter()
            .enumerate()
            .map(|(i, cdoc)| ((i + 1) as u32, cdoc))
            .collect();

        let container = MessageContainer::full(fdoc, hdoc, cdocs);
        let done = self
            .memstore
            .create_message(&self.mbox, uid, container, false)
            .await;
        let _ = done.await;

        if flags.contains(mbox_core::model::FLAG_RECENT) {
            self.memstore.mark_recent(&self.mbox, uid).await;
        }

        Ok(uid)
    }

    pub async fn get_msg_by_uid(&self, uid: ImapUid) -> Option<MessageContainer> {
        self.memstore.get_message(&self.mbox, uid).await
    }

    /// Applies a flag operation to each target UID, lazily creating an
    /// fdoc-only container if one is not already cached (it should always
    /// be, in practice, since `add_msg` always creates one).
    pub async fn set_flags(
        &self,
        uids: &[ImapUid],
        change: &BTreeSet<Flag>,
        mode: FlagMode,
    ) -> BTreeMap<ImapUid, BTreeSet<Flag>> {
        let mut result = BTreeMap::new();

        for &uid in uids {
            let mut container = match self.memstore.get_message(&self.mbox, uid).await {
                Some(c) => c,
                None => continue,
            };

            let mut flags = container
                .fdoc
                .as_ref()
                .map(|f| f.flags.clone())
                .unwrap_or_default();

            match mode {
                FlagMode::Remove => {
                    for f in change {
                        flags.remove(f);
                    }
                }
                FlagMode::Replace => {
                    flags = change.clone();
                }
                FlagMode::Add => {
                    for f in change {
                        // \Recent is session-scoped; STORE never re-adds it.
                        if f != mbox_core::model::FLAG_RECENT {
                            flags.insert(f.clone());
                        }
                    }
                }
            }

            let chash = container
                .fdoc
                .as_ref()
                .map(|f| f.chash.clone())
                .unwrap_or_default();
            let new_fdoc = FlagsDoc::new(self.mbox.clone(), uid, chash, flags.clone());
            container.fdoc = Some(new_fdoc.clone());
            container.mark_dirty();
            self.memstore.update_fdoc(&self.mbox, uid, new_fdoc).await;

            result.insert(uid, flags);
        }

        result
    }

    pub async fn all_uid_iter(&self) -> Vec<ImapUid> {
        self.memstore
            .all_in_mbox(&self.mbox)
            .await
            .into_iter()
            .map(|(uid, _)| uid)
            .collect()
    }

    pub async fn all_flags(&self) -> BTreeMap<ImapUid, BTreeSet<Flag>> {
        self.memstore
            .all_in_mbox(&self.mbox)
            .await
            .into_iter()
            .filter_map(|(uid, c)| c.fdoc.map(|f| (uid, f.flags)))
            .collect()
    }

    pub async fn all_headers(&self) -> BTreeMap<ImapUid, HeadersDoc> {
        self.memstore
            .all_in_mbox(&self.mbox)
            .await
            .into_iter()
            .filter_map(|(uid, c)| c.hdoc.map(|h| (uid, h)))
            .collect()
    }

    pub async fn all_flags_chash(&self) -> BTreeMap<ImapUid, String> {
        self.memstore
            .all_in_mbox(&self.mbox)
            .await
            .into_iter()
            .filter_map(|(uid, c)| c.fdoc.map(|f| (uid, f.chash)))
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.memstore.all_in_mbox(&self.mbox).await.len()
    }

    pub async fn count_unseen(&self) -> usize {
        self.memstore
            .all_in_mbox(&self.mbox)
            .await
            .into_iter()
            .filter(|(_, c)| c.fdoc.as_ref().map(|f| !f.seen()).unwrap_or(false))
            .count()
    }

    pub async fn count_recent(&self) -> usize {
        self.memstore.recent_uids(&self.mbox).await.len()
    }

    pub async fn unset_recent_flags(&self) {
        self.memstore.clear_recent(&self.mbox).await;
        for (uid, mut container) in self.memstore.all_in_mbox(&self.mbox).await {
            if let Some(fdoc) = container.fdoc.as_mut() {
                if fdoc.recent {
                    fdoc.recent = false;
                    fdoc.flags.remove(mbox_core::model::FLAG_RECENT);
                    let updated = fdoc.clone();
                    self.memstore.update_fdoc(&self.mbox, uid, updated).await;
                }
            }
        }
    }

    pub async fn get_uid_from_msgid(&self, message_id: &str) -> Option<ImapUid> {
        let wanted = message_id.trim();
        for (uid, container) in self.memstore.all_in_mbox(&self.mbox).await {
            if let Some(hdoc) = &container.hdoc {
                if let Some(got) = hdoc.headers.get("message-id") {
                    if got.trim() == wanted {
                        return Some(uid);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbox_store::InMemoryStore;

    const RAW: &[u8] = b"From: a@example.org\r\nTo: b@example.org\r\nMessage-ID: <abc@example.org>\r\nSubject: hi\r\n\r\nhello world\r\n";

    fn collection() -> Collection {
        let memstore = Memstore::new(Arc::new(InMemoryStore::new()));
        Collection::new("INBOX".to_string(), memstore)
    }

    #[tokio::test]
    async fn add_then_fetch_roundtrips_flags() {
        let c = collection();
        let mut flags = BTreeSet::new();
        flags.insert("\\Recent".to_string());
        let uid = c.add_msg(RAW, flags.clone()).await.unwrap();

        let got = c.get_msg_by_uid(uid).await.unwrap();
        assert_eq!(got.fdoc.unwrap().flags, flags);
    }

    #[tokio::test]
    async fn adding_same_raw_twice_does_not_duplicate() {
        let c = collection();
        let uid1 = c.add_msg(RAW, BTreeSet::new()).await.unwrap();
        let uid2 = c.add_msg(RAW, BTreeSet::new()).await.unwrap();
        assert_eq!(uid1, uid2);
        assert_eq!(c.count().await, 1);
    }

    #[tokio::test]
    async fn flag_add_then_remove_is_noop_modulo_recent() {
        let c = collection();
        let uid = c.add_msg(RAW, BTreeSet::new()).await.unwrap();

        let mut seen = BTreeSet::new();
        seen.insert("\\Seen".to_string());
        c.set_flags(&[uid], &seen, FlagMode::Add).await;
        c.set_flags(&[uid], &seen, FlagMode::Remove).await;

        let got = c.get_msg_by_uid(uid).await.unwrap();
        assert!(got.fdoc.unwrap().flags.is_empty());
    }

    #[tokio::test]
    async fn search_by_message_id_finds_existing() {
        let c = collection();
        let uid = c.add_msg(RAW, BTreeSet::new()).await.unwrap();
        assert_eq!(c.get_uid_from_msgid("<abc@example.org>").await, Some(uid));
        assert_eq!(c.get_uid_from_msgid("<missing@example.org>").await, None);
    }
}
