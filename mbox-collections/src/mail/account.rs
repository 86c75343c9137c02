//! The root object bound to one user identity: its personal namespace,
//! mailbox tree, and subscription list (RFC 3501 §6.3.8, RFC 6154).

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use mbox_core::model::{DocId, DocType, Document, ImapUidvalidity, MailboxDoc};
use mbox_core::time::now_msec;
use mbox_store::{IndexQuery, Memstore, PermanentStore};

use crate::error::{MailError, Result};
use crate::mail::mailbox::Mailbox;
use crate::mail::namespace;
use crate::notifier::Notifier;

/// The index definitions required of a conforming permanent store.
const REQUIRED_INDEXES: &[&str] = &[
    "by-type",
    "by-type-and-mbox",
    "by-type-and-mbox-and-uid",
    "by-type-and-subs",
    "by-type-and-mbox-seen",
    "by-type-and-mbox-recent",
    "by-chash",
];

/// `MailboxDoc::created` is a millisecond wall-clock timestamp and does not
/// fit the 32-bit, nonzero UIDVALIDITY wire field on its own; truncate into
/// that space rather than changing the document schema, to keep it
/// compatible with existing accounts.
fn to_uidvalidity(created: u64) -> ImapUidvalidity {
    NonZeroU32::new((created as u32).max(1)).unwrap()
}

pub struct Account {
    backend: Arc<dyn PermanentStore>,
    memstore: Arc<Memstore>,
    notifier: Arc<Notifier>,
    mailboxes: Mutex<BTreeMap<String, (DocId, MailboxDoc)>>,
    ready_rx: watch::Receiver<bool>,
}

impl Account {
    pub async fn new(backend: Arc<dyn PermanentStore>) -> Result<Arc<Self>> {
        for index in REQUIRED_INDEXES {
            backend.create_index(index).await?;
        }

        let memstore = Memstore::new(backend.clone());
        let (ready_tx, ready_rx) = watch::channel(false);

        let account = Arc::new(Self {
            backend,
            memstore,
            notifier: Arc::new(Notifier::new()),
            mailboxes: Mutex::new(BTreeMap::new()),
            ready_rx,
        });

        account.load_existing_mailboxes().await?;
        if account.mailboxes.lock().await.is_empty() {
            account.add_mailbox("INBOX", None).await?;
        }

        let _ = ready_tx.send(true);
        Ok(account)
    }

    async fn load_existing_mailboxes(&self) -> Result<()> {
        let docs = self
            .backend
            .get_from_index(&IndexQuery::ByType(DocType::Mailbox))
            .await?;
        let mut mbxs = self.mailboxes.lock().await;
        for (id, doc) in docs {
            if let Some(mbox) = doc.as_mailbox() {
                mbxs.insert(mbox.mbox.clone(), (id, mbox.clone()));
            }
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Queues `cb` until initialization completes; invokes it immediately
    /// if already ready.
    pub async fn call_when_ready<F, Fut>(&self, cb: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut rx = self.ready_rx.clone();
        if !*rx.borrow() {
            let _ = rx.changed().await;
        }
        cb().await;
    }

    pub async fn add_mailbox(&self, name: &str, creation_ts: Option<u64>) -> Result<()> {
        let canon = namespace::canonicalize(name);
        if canon.is_empty() {
            return Err(MailError::MailboxException("empty mailbox name".into()));
        }

        let mut mbxs = self.mailboxes.lock().await;
        if mbxs.contains_key(&canon) {
            return Err(MailError::MailboxCollision(canon));
        }

        let created = creation_ts.unwrap_or_else(now_msec);
        let doc = MailboxDoc::new(canon.clone(), created);
        let id = self.backend.create_doc(Document::Mailbox(doc.clone())).await?;
        mbxs.insert(canon, (id, doc));
        Ok(())
    }

    /// Splits on `/`, creates each parent prefix ignoring collisions, then
    /// creates the leaf. `true` on success; `false` if the leaf already
    /// exists and `pathspec` did not end with `/`.
    pub async fn create(&self, pathspec: &str) -> Result<bool> {
        let ends_with_delim = pathspec.trim_end().ends_with(namespace::DELIMITER);
        let prefixes = namespace::path_prefixes(pathspec);
        let (parents, leaf) = match prefixes.split_last() {
            Some((leaf, parents)) => (parents, leaf.clone()),
            None => return Err(MailError::MailboxException("empty mailbox name".into())),
        };

        for parent in parents {
            match self.add_mailbox(parent, None).await {
                Ok(()) | Err(MailError::MailboxCollision(_)) => {}
                Err(e) => return Err(e),
            }
        }

        match self.add_mailbox(&leaf, None).await {
            Ok(()) => Ok(true),
            Err(MailError::MailboxCollision(_)) => Ok(ends_with_delim),
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, name: &str, force: bool) -> Result<()> {
        let canon = namespace::canonicalize(name);
        let mut mbxs = self.mailboxes.lock().await;
        let (id, mut doc) = mbxs
            .get(&canon)
            .cloned()
            .ok_or_else(|| MailError::NoSuchMailbox(canon.clone()))?;

        if !force {
            let has_inferior = mbxs.keys().any(|k| namespace::is_inferior(k, &canon));
            if doc.noselect() && has_inferior {
                return Err(MailError::MailboxException(format!(
                    "{canon} has inferior mailboxes and is already \\Noselect"
                )));
            }
        }

        doc.set_noselect(true);

        let fdocs = self
            .backend
            .get_from_index(&IndexQuery::ByTypeAndMbox(DocType::Flags, canon.clone()))
            .await?;
        for (fid, _) in fdocs {
            self.backend.delete_doc(fid).await?;
        }

        self.backend.delete_doc(id).await?;
        mbxs.remove(&canon);
        Ok(())
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = namespace::canonicalize(old);
        let new = namespace::canonicalize(new);

        let mut mbxs = self.mailboxes.lock().await;
        if !mbxs.contains_key(&old) {
            return Err(MailError::NoSuchMailbox(old));
        }

        let affected: Vec<String> = mbxs
            .keys()
            .filter(|k| **k == old || namespace::is_inferior(k, &old))
            .cloned()
            .collect();

        for name in &affected {
            let renamed = format!("{new}{}", &name[old.len()..]);
            if mbxs.contains_key(&renamed) {
                return Err(MailError::MailboxCollision(renamed));
            }
        }

        for name in affected {
            let renamed_name = format!("{new}{}", &name[old.len()..]);
            let (id, mut doc) = mbxs.remove(&name).expect("checked present above");
            doc.mbox = renamed_name.clone();
            self.backend
                .put_doc(id, Document::Mailbox(doc.clone()))
                .await?;
            self.memstore.rename_mbox(&name, &renamed_name).await;
            mbxs.insert(renamed_name, (id, doc));
        }

        Ok(())
    }

    pub async fn subscribe(&self, name: &str) -> Result<()> {
        let canon = namespace::canonicalize(name);
        if !self.mailboxes.lock().await.contains_key(&canon) {
            self.add_mailbox(&canon, None).await?;
        }
        let mut mbxs = self.mailboxes.lock().await;
        let (id, doc) = mbxs.get_mut(&canon).expect("just created if missing");
        doc.subscribed = true;
        self.backend.put_doc(*id, Document::Mailbox(doc.clone())).await?;
        Ok(())
    }

    /// The source reads a nonexistent `self.subscriptions` attribute here;
    /// the correct check is against the mailbox document's own
    /// `subscribed` field, which is what this compares against.
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        let canon = namespace::canonicalize(name);
        let mut mbxs = self.mailboxes.lock().await;
        let (id, doc) = mbxs
            .get_mut(&canon)
            .ok_or_else(|| MailError::NoSuchMailbox(canon.clone()))?;
        if !doc.subscribed {
            return Err(MailError::MailboxException(format!(
                "{canon} is not subscribed"
            )));
        }
        doc.subscribed = false;
        self.backend.put_doc(*id, Document::Mailbox(doc.clone())).await?;
        Ok(())
    }

    pub async fn is_subscribed(&self, name: &str) -> bool {
        let canon = namespace::canonicalize(name);
        self.mailboxes
            .lock()
            .await
            .get(&canon)
            .map(|(_, d)| d.subscribed)
            .unwrap_or(false)
    }

    pub async fn get_subscriptions(&self) -> Vec<String> {
        self.mailboxes
            .lock()
            .await
            .values()
            .filter(|(_, d)| d.subscribed)
            .map(|(_, d)| d.mbox.clone())
            .collect()
    }

    pub async fn list_mailboxes(&self, reference: &str, wildcard: &str) -> Vec<String> {
        self.mailboxes
            .lock()
            .await
            .keys()
            .filter(|n| namespace::matches_wildcard(n, reference, wildcard))
            .cloned()
            .collect()
    }

    pub fn get_personal_namespaces(&self) -> Vec<(String, String)> {
        vec![("".to_string(), namespace::DELIMITER.to_string())]
    }

    pub async fn list_all_mailbox_names(&self) -> Vec<String> {
        self.mailboxes.lock().await.keys().cloned().collect()
    }

    pub async fn get_mailbox(&self, name: &str) -> Result<Mailbox> {
        let canon = namespace::canonicalize(name);
        let doc = self
            .mailboxes
            .lock()
            .await
            .get(&canon)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| MailError::NoSuchMailbox(canon.clone()))?;

        Mailbox::open(
            canon,
            to_uidvalidity(doc.created),
            doc.rw && !doc.noselect(),
            self.memstore.clone(),
            self.backend.clone(),
            self.notifier.clone(),
        )
        .await
    }

    pub fn memstore(&self) -> Arc<Memstore> {
        self.memstore.clone()
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }
}
