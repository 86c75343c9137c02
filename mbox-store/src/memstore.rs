//! The write-back cache sitting between the per-mailbox collections and the
//! permanent store. Reads are served from here; writes land
//! here first and are drained to the permanent store by a background loop
//! modeled after the corpus's own bayou watch/drain task: a `tokio::spawn`
//! background loop, a `watch` channel used as a stop signal, and a
//! single-holder `writing` marker rather than a mutex around the drain
//! itself.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use mbox_core::container::MessageContainer;
use mbox_core::model::{ContentDoc, DocId, Document, FlagsDoc, HeadersDoc, ImapUid, RecentDoc};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{error, info, warn};

use crate::adapter::{IndexQuery, PermanentStore};

pub const SOLEDAD_WRITE_PERIOD: Duration = Duration::from_secs(10);

type Key = (String, ImapUid);

#[derive(Default)]
struct Indexes {
    store: BTreeMap<Key, MessageContainer>,
    content_by_phash: HashMap<String, ContentDoc>,
    headers_by_chash: HashMap<String, HeadersDoc>,
    /// chash -> mbox -> uid, resolved back through `store` to reach the
    /// live fdoc rather than holding a second owning reference to it.
    chash_index: HashMap<String, HashMap<String, ImapUid>>,
    last_uid: HashMap<String, u32>,
    recent: HashMap<String, (Option<DocId>, BTreeSet<ImapUid>)>,
    new: BTreeSet<Key>,
    dirty: BTreeSet<Key>,
    /// Permanent-store id of each message's fdoc, once it has been
    /// persisted at least once. Lets a later drain address the same
    /// document with `put_doc` instead of minting a duplicate, and lets
    /// `expunge` delete the document it actually wrote.
    fdoc_ids: HashMap<Key, DocId>,
    /// Permanent-store id of each distinct hdoc, keyed by chash. hdocs are
    /// immutable once written, so this is only ever populated, never
    /// updated.
    hdoc_ids: HashMap<String, DocId>,
    /// Permanent-store id of each distinct cdoc, keyed by phash. Same
    /// write-once contract as `hdoc_ids`.
    cdoc_ids: HashMap<String, DocId>,
}

pub struct Memstore {
    indexes: Mutex<Indexes>,
    deferreds: Mutex<HashMap<Key, Vec<oneshot::Sender<()>>>>,
    writing: AtomicBool,
    backend: Arc<dyn PermanentStore>,
    stop_tx: watch::Sender<bool>,
}

impl Memstore {
    pub fn new(backend: Arc<dyn PermanentStore>) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let this = Arc::new(Self {
            indexes: Mutex::new(Indexes::default()),
            deferreds: Mutex::new(HashMap::new()),
            writing: AtomicBool::new(false),
            backend,
            stop_tx,
        });

        tokio::spawn(Self::drain_loop(Arc::downgrade(&this), stop_rx));

        this
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::SeqCst)
    }

    /// Seeds `last_uid[mbox]` the first time it is observed (first-writer-
    /// wins, matching `last_uid_lock`'s priming contract).
    pub async fn set_last_soledad_uid(&self, mbox: &str, uid: u32) {
        let mut idx = self.indexes.lock().await;
        idx.last_uid.entry(mbox.to_string()).or_insert(uid);
    }

    /// Allocates the next UID for `mbox`. The critical section is exactly
    /// the increment; no store operation runs while the guard is held.
    pub async fn increment_last_soledad_uid(&self, mbox: &str) -> ImapUid {
        let mut idx = self.indexes.lock().await;
        let next = idx.last_uid.entry(mbox.to_string()).or_insert(0);
        *next += 1;
        NonZeroU32::new(*next).expect("uid counter starts at 1 and only grows")
    }

    pub async fn create_message(
        &self,
        mbox: &str,
        uid: ImapUid,
        container: MessageContainer,
        notify_on_disk: bool,
    ) -> oneshot::Receiver<()> {
        self.insert(mbox, uid, container, true).await;
        self.register_deferred(mbox, uid, notify_on_disk).await
    }

    pub async fn put_message(
        &self,
        mbox: &str,
        uid: ImapUid,
        container: MessageContainer,
    ) -> oneshot::Receiver<()> {
        self.insert(mbox, uid, container, false).await;
        self.register_deferred(mbox, uid, true).await
    }

    async fn insert(&self, mbox: &str, uid: ImapUid, mut container: MessageContainer, is_new: bool) {
        let mut idx = self.indexes.lock().await;
        let key: Key = (mbox.to_string(), uid);

        if is_new {
            container.mark_new();
        } else {
            container.mark_dirty();
        }

        if let Some(fdoc) = &container.fdoc {
            idx.chash_index
                .entry(fdoc.chash.clone())
                .or_default()
                .insert(mbox.to_string(), uid);
        }
        if let Some(hdoc) = &container.hdoc {
            idx.headers_by_chash
                .insert(hdoc.chash.clone(), hdoc.clone());
        }
        for cdoc in container.cdocs.values() {
            idx.content_by_phash
                .entry(cdoc.phash.clone())
                .or_insert_with(|| cdoc.clone());
        }

        idx.store.insert(key.clone(), container);
        if is_new {
            idx.new.insert(key);
        } else {
            idx.dirty.insert(key);
        }
    }

    async fn register_deferred(
        &self,
        mbox: &str,
        uid: ImapUid,
        notify_on_disk: bool,
    ) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if notify_on_disk {
            let key: Key = (mbox.to_string(), uid);
            self.deferreds.lock().await.entry(key).or_default().push(tx);
        } else {
            let _ = tx.send(());
        }
        rx
    }

    pub async fn get_message(&self, mbox: &str, uid: ImapUid) -> Option<MessageContainer> {
        self.indexes
            .lock()
            .await
            .store
            .get(&(mbox.to_string(), uid))
            .cloned()
    }

    /// Returns the fdoc for a duplicate-detection check, or none if absent
    /// or deleted.
    pub async fn get_fdoc_from_chash(&self, chash: &str, mbox: &str) -> Option<FlagsDoc> {
        let idx = self.indexes.lock().await;
        let uid = *idx.chash_index.get(chash)?.get(mbox)?;
        let fdoc = idx.store.get(&(mbox.to_string(), uid))?.fdoc.clone()?;
        if fdoc.deleted() {
            None
        } else {
            Some(fdoc)
        }
    }

    pub async fn all_new_dirty_msg_iter(&self) -> Vec<(Key, MessageContainer)> {
        let idx = self.indexes.lock().await;
        idx.new
            .iter()
            .chain(idx.dirty.iter())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|k| idx.store.get(k).map(|c| (k.clone(), c.clone())))
            .collect()
    }

    pub async fn all_rdocs_iter(&self) -> Vec<(String, RecentDoc)> {
        let idx = self.indexes.lock().await;
        idx.recent
            .iter()
            .map(|(mbox, (_, recent))| {
                (
                    mbox.clone(),
                    RecentDoc {
                        mbox: mbox.clone(),
                        recent: recent.clone(),
                    },
                )
            })
            .collect()
    }

    pub async fn remove_message(&self, mbox: &str, uid: ImapUid) {
        let mut idx = self.indexes.lock().await;
        let key: Key = (mbox.to_string(), uid);
        idx.store.remove(&key);
        idx.new.remove(&key);
        idx.dirty.remove(&key);
        idx.fdoc_ids.remove(&key);
    }

    /// All messages currently cached for `mbox`, in UID order.
    pub async fn all_in_mbox(&self, mbox: &str) -> Vec<(ImapUid, MessageContainer)> {
        let idx = self.indexes.lock().await;
        idx.store
            .range((mbox.to_string(), NonZeroU32::new(1).unwrap())..)
            .take_while(|((m, _), _)| m == mbox)
            .map(|((_, uid), c)| (*uid, c.clone()))
            .collect()
    }

    /// The current high-water mark for `mbox`, without allocating a new
    /// UID. Zero if the mailbox has never been primed.
    pub async fn peek_last_uid(&self, mbox: &str) -> u32 {
        self.indexes
            .lock()
            .await
            .last_uid
            .get(mbox)
            .copied()
            .unwrap_or(0)
    }

    pub async fn recent_uids(&self, mbox: &str) -> BTreeSet<ImapUid> {
        self.indexes
            .lock()
            .await
            .recent
            .get(mbox)
            .map(|(_, uids)| uids.clone())
            .unwrap_or_default()
    }

    pub async fn clear_recent(&self, mbox: &str) {
        let mut idx = self.indexes.lock().await;
        if let Some((_, uids)) = idx.recent.get_mut(mbox) {
            uids.clear();
        }
    }

    pub async fn mark_recent(&self, mbox: &str, uid: ImapUid) {
        let mut idx = self.indexes.lock().await;
        idx.recent.entry(mbox.to_string()).or_default().1.insert(uid);
    }

    /// Replaces the fdoc for `(mbox, uid)` and marks the container dirty.
    /// Returns `false` if no such message is cached.
    pub async fn update_fdoc(&self, mbox: &str, uid: ImapUid, fdoc: FlagsDoc) -> bool {
        let mut idx = self.indexes.lock().await;
        let key: Key = (mbox.to_string(), uid);
        match idx.store.get_mut(&key) {
            Some(container) => {
                container.fdoc = Some(fdoc);
                container.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Rewrites every fdoc's `mbox` field from `old` to `new`, batched as a
    /// single critical section per mailbox rather than assumed atomic
    /// across the whole rename.
    pub async fn rename_mbox(&self, old: &str, new: &str) {
        let mut idx = self.indexes.lock().await;

        let keys: Vec<Key> = idx
            .store
            .range((old.to_string(), NonZeroU32::new(1).unwrap())..)
            .take_while(|((m, _), _)| m == old)
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            if let Some(mut container) = idx.store.remove(&key) {
                if let Some(fdoc) = container.fdoc.as_mut() {
                    fdoc.mbox = new.to_string();
                }
                let new_key: Key = (new.to_string(), key.1);
                if idx.new.remove(&key) {
                    idx.new.insert(new_key.clone());
                }
                if idx.dirty.remove(&key) {
                    idx.dirty.insert(new_key.clone());
                }
                if let Some(id) = idx.fdoc_ids.remove(&key) {
                    idx.fdoc_ids.insert(new_key.clone(), id);
                }
                idx.store.insert(new_key, container);
            }
        }

        for table in idx.chash_index.values_mut() {
            if let Some(uid) = table.remove(old) {
                table.insert(new.to_string(), uid);
            }
        }

        if let Some(last) = idx.last_uid.remove(old) {
            idx.last_uid.insert(new.to_string(), last);
        }
        if let Some(recent) = idx.recent.remove(old) {
            idx.recent.insert(new.to_string(), recent);
        }
    }

    /// Pauses the drain, deletes `\Deleted` messages on the permanent
    /// store and in memory, then resumes. Returns the UIDs removed.
    pub async fn expunge(&self, mbox: &str) -> Result<BTreeSet<ImapUid>> {
        while self.is_writing() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.writing.store(true, Ordering::SeqCst);

        let result = async {
            let (to_delete, doc_ids) = {
                let idx = self.indexes.lock().await;
                let to_delete: Vec<Key> = idx
                    .store
                    .range((mbox.to_string(), NonZeroU32::new(1).unwrap())..)
                    .take_while(|((m, _), _)| m == mbox)
                    .filter(|(_, c)| c.fdoc.as_ref().map(|f| f.deleted()).unwrap_or(false))
                    .map(|(k, _)| k.clone())
                    .collect();
                let doc_ids: Vec<DocId> = to_delete
                    .iter()
                    .filter_map(|key| idx.fdoc_ids.get(key).copied())
                    .collect();
                (to_delete, doc_ids)
            };

            for id in doc_ids {
                self.backend.delete_doc(id).await?;
            }

            let mut idx = self.indexes.lock().await;
            let mut deleted_uids = BTreeSet::new();
            for key in &to_delete {
                idx.store.remove(key);
                idx.new.remove(key);
                idx.dirty.remove(key);
                idx.fdoc_ids.remove(key);
                deleted_uids.insert(key.1);
            }
            Ok(deleted_uids)
        }
        .await;

        self.writing.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_loop(this: Weak<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SOLEDAD_WRITE_PERIOD);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        info!("memstore drain loop stopping");
                        return;
                    }
                }
            }

            let this = match Weak::upgrade(&this) {
                Some(this) => this,
                None => return,
            };

            if this.is_writing() {
                continue;
            }
            this.writing.store(true, Ordering::SeqCst);
            if let Err(e) = this.drain_once().await {
                error!("memstore drain failed: {}", e);
            }
            this.writing.store(false, Ordering::SeqCst);
        }
    }

    async fn drain_once(&self) -> Result<()> {
        for (mbox, rdoc) in self.all_rdocs_iter().await {
            let doc_id = {
                let idx = self.indexes.lock().await;
                idx.recent.get(&mbox).and_then(|(id, _)| *id)
            };
            match doc_id {
                Some(id) => self.backend.put_doc(id, Document::Recent(rdoc)).await?,
                None => {
                    let id = self.backend.create_doc(Document::Recent(rdoc)).await?;
                    let mut idx = self.indexes.lock().await;
                    if let Some(entry) = idx.recent.get_mut(&mbox) {
                        entry.0 = Some(id);
                    }
                }
            }
        }

        let pending = self.all_new_dirty_msg_iter().await;
        for (key, container) in pending {
            if let Err(e) = self.persist_container(&key, &container).await {
                warn!("failed to persist message {:?}: {}", key, e);
                continue;
            }

            let mut idx = self.indexes.lock().await;
            idx.new.remove(&key);
            idx.dirty.remove(&key);
            if let Some(c) = idx.store.get_mut(&key) {
                c.mark_clean();
            }
            drop(idx);

            let mut deferreds = self.deferreds.lock().await;
            if let Some(waiters) = deferreds.remove(&key) {
                for tx in waiters {
                    let _ = tx.send(());
                }
            }
        }

        Ok(())
    }

    /// Persists a container's documents, addressing already-written docs with
    /// `put_doc` instead of minting duplicates on a second drain. fdocs are
    /// mutable and tracked per `(mbox,uid)` key; hdocs and cdocs are
    /// content-addressed and write-once, so a later drain of the same
    /// container just skips them once their id is known.
    async fn persist_container(&self, key: &Key, container: &MessageContainer) -> Result<()> {
        if let Some(fdoc) = &container.fdoc {
            let existing = self.indexes.lock().await.fdoc_ids.get(key).copied();
            match existing {
                Some(id) => self.backend.put_doc(id, Document::Flags(fdoc.clone())).await?,
                None => {
                    let id = self
                        .backend
                        .create_doc(Document::Flags(fdoc.clone()))
                        .await?;
                    self.indexes.lock().await.fdoc_ids.insert(key.clone(), id);
                }
            }
        }

        if let Some(hdoc) = &container.hdoc {
            let existing = self.indexes.lock().await.hdoc_ids.get(&hdoc.chash).copied();
            if existing.is_none() {
                let id = self
                    .backend
                    .create_doc(Document::Headers(hdoc.clone()))
                    .await?;
                self.indexes
                    .lock()
                    .await
                    .hdoc_ids
                    .entry(hdoc.chash.clone())
                    .or_insert(id);
            }
        }

        for cdoc in container.cdocs.values() {
            let existing = self.indexes.lock().await.cdoc_ids.get(&cdoc.phash).copied();
            if existing.is_none() {
                let id = self
                    .backend
                    .create_doc(Document::Content(cdoc.clone()))
                    .await?;
                self.indexes
                    .lock()
                    .await
                    .cdoc_ids
                    .entry(cdoc.phash.clone())
                    .or_insert(id);
            }
        }

        Ok(())
    }

    pub async fn find_fdocs_by_index(&self, query: &IndexQuery) -> Result<Vec<(DocId, Document)>> {
        Ok(self.backend.get_from_index(query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryStore;
    use std::collections::BTreeSet as Set;

    fn uid(n: u32) -> ImapUid {
        NonZeroU32::new(n).unwrap()
    }

    #[tokio::test]
    async fn uid_allocation_is_monotonic() {
        let backend = Arc::new(InMemoryStore::new());
        let store = Memstore::new(backend);
        let a = store.increment_last_soledad_uid("INBOX").await;
        let b = store.increment_last_soledad_uid("INBOX").await;
        assert!(b.get() > a.get());
    }

    #[tokio::test]
    async fn create_message_is_visible_immediately() {
        let backend = Arc::new(InMemoryStore::new());
        let store = Memstore::new(backend);
        let fdoc = FlagsDoc::new("INBOX".into(), uid(1), "ABC".into(), Set::new());
        let container = MessageContainer::flags_only(fdoc);
        let _ = store
            .create_message("INBOX", uid(1), container, false)
            .await;

        let got = store.get_message("INBOX", uid(1)).await;
        assert!(got.is_some());
        assert!(got.unwrap().new);
    }

    #[tokio::test]
    async fn dedup_lookup_skips_deleted_fdoc() {
        let backend = Arc::new(InMemoryStore::new());
        let store = Memstore::new(backend);
        let mut flags = Set::new();
        flags.insert(mbox_core::model::FLAG_DELETED.to_string());
        let fdoc = FlagsDoc::new("INBOX".into(), uid(1), "ABC".into(), flags);
        let container = MessageContainer::flags_only(fdoc);
        let _ = store
            .create_message("INBOX", uid(1), container, false)
            .await;

        assert!(store.get_fdoc_from_chash("ABC", "INBOX").await.is_none());
    }

    #[tokio::test]
    async fn expunge_removes_only_deleted_messages() {
        let backend = Arc::new(InMemoryStore::new());
        let store = Memstore::new(backend);

        let clean = FlagsDoc::new("INBOX".into(), uid(1), "A".into(), Set::new());
        let mut deleted_flags = Set::new();
        deleted_flags.insert(mbox_core::model::FLAG_DELETED.to_string());
        let deleted = FlagsDoc::new("INBOX".into(), uid(2), "B".into(), deleted_flags);

        store
            .create_message("INBOX", uid(1), MessageContainer::flags_only(clean), false)
            .await;
        store
            .create_message("INBOX", uid(2), MessageContainer::flags_only(deleted), false)
            .await;

        let removed = store.expunge("INBOX").await.unwrap();
        assert_eq!(removed, Set::from([uid(2)]));
        assert!(store.get_message("INBOX", uid(1)).await.is_some());
        assert!(store.get_message("INBOX", uid(2)).await.is_none());
    }

    #[tokio::test]
    async fn expunge_after_drain_deletes_backend_fdoc() {
        let backend = Arc::new(InMemoryStore::new());
        let store = Memstore::new(backend.clone());

        let mut deleted_flags = Set::new();
        deleted_flags.insert(mbox_core::model::FLAG_DELETED.to_string());
        let deleted = FlagsDoc::new("INBOX".into(), uid(1), "A".into(), deleted_flags);
        store
            .create_message("INBOX", uid(1), MessageContainer::flags_only(deleted), false)
            .await;

        store.drain_once().await.unwrap();
        let persisted = backend
            .get_from_index(&IndexQuery::ByType(mbox_core::model::DocType::Flags))
            .await
            .unwrap();
        assert_eq!(persisted.len(), 1);

        store.expunge("INBOX").await.unwrap();
        let remaining = backend
            .get_from_index(&IndexQuery::ByType(mbox_core::model::DocType::Flags))
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn redrained_dirty_message_overwrites_instead_of_duplicating() {
        let backend = Arc::new(InMemoryStore::new());
        let store = Memstore::new(backend.clone());

        let fdoc = FlagsDoc::new("INBOX".into(), uid(1), "A".into(), Set::new());
        store
            .create_message("INBOX", uid(1), MessageContainer::flags_only(fdoc), false)
            .await;
        store.drain_once().await.unwrap();

        let mut seen_flags = Set::new();
        seen_flags.insert(mbox_core::model::FLAG_SEEN.to_string());
        let updated_fdoc = FlagsDoc::new("INBOX".into(), uid(1), "A".into(), seen_flags);
        assert!(store.update_fdoc("INBOX", uid(1), updated_fdoc).await);
        store.drain_once().await.unwrap();

        let persisted = backend
            .get_from_index(&IndexQuery::ByType(mbox_core::model::DocType::Flags))
            .await
            .unwrap();
        assert_eq!(persisted.len(), 1);
        let (_, doc) = &persisted[0];
        match doc {
            Document::Flags(f) => assert!(f.seen()),
            _ => panic!("expected a flags document"),
        }
    }
}
