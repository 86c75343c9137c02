//! A trivial in-process implementation of [`PermanentStore`], useful for
//! tests and for running the core without a networked backend. It holds
//! documents in a single lock and recomputes index matches on every query
//! rather than maintaining dedicated index structures, the same tradeoff
//! the corpus's own `storage::in_memory` stub makes for its row store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use mbox_core::model::{DocId, Document, DocType};
use mbox_core::unique_ident::gen_ident;

use crate::adapter::{IndexQuery, PermanentStore, Result};

#[derive(Default)]
pub struct InMemoryStore {
    docs: Mutex<BTreeMap<DocId, Document>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PermanentStore for InMemoryStore {
    async fn create_doc(&self, content: Document) -> Result<DocId> {
        let id = gen_ident();
        self.docs.lock().unwrap().insert(id, content);
        Ok(id)
    }

    async fn put_doc(&self, id: DocId, content: Document) -> Result<()> {
        self.docs.lock().unwrap().insert(id, content);
        Ok(())
    }

    async fn delete_doc(&self, id: DocId) -> Result<()> {
        self.docs.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn get_from_index(&self, query: &IndexQuery) -> Result<Vec<(DocId, Document)>> {
        let docs = self.docs.lock().unwrap();
        let matches = docs
            .iter()
            .filter(|(_, doc)| matches_query(doc, query))
            .map(|(id, doc)| (*id, doc.clone()))
            .collect();
        Ok(matches)
    }

    async fn create_index(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn matches_query(doc: &Document, query: &IndexQuery) -> bool {
    match query {
        IndexQuery::ByType(t) => doc.doc_type() == *t,
        IndexQuery::ByTypeAndMbox(t, mbox) => doc.doc_type() == *t && doc_mbox(doc) == Some(mbox),
        IndexQuery::ByTypeAndMboxAndUid(t, mbox, uid) => {
            doc.doc_type() == *t
                && doc_mbox(doc) == Some(mbox)
                && doc.as_flags().map(|f| f.uid.get()) == Some(*uid)
        }
        IndexQuery::ByTypeAndSubscribed(t, subscribed) => {
            doc.doc_type() == *t
                && doc.as_mailbox().map(|m| m.subscribed) == Some(*subscribed)
        }
        IndexQuery::ByTypeAndMboxSeen(t, mbox, seen) => {
            doc.doc_type() == *t
                && doc_mbox(doc) == Some(mbox)
                && doc.as_flags().map(|f| f.seen()) == Some(*seen)
        }
        IndexQuery::ByTypeAndMboxRecent(t, mbox, recent) => {
            doc.doc_type() == *t
                && doc_mbox(doc) == Some(mbox)
                && doc.as_flags().map(|f| f.recent) == Some(*recent)
        }
        IndexQuery::ByChash(t, chash) => {
            doc.doc_type() == *t
                && match doc {
                    Document::Flags(f) => &f.chash == chash,
                    Document::Headers(h) => &h.chash == chash,
                    _ => false,
                }
        }
    }
}

fn doc_mbox(doc: &Document) -> Option<&String> {
    match doc {
        Document::Mailbox(m) => Some(&m.mbox),
        Document::Flags(f) => Some(&f.mbox),
        Document::Recent(r) => Some(&r.mbox),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbox_core::model::MailboxDoc;

    #[tokio::test]
    async fn create_then_find_by_type_and_mbox() {
        let store = InMemoryStore::new();
        store
            .create_doc(Document::Mailbox(MailboxDoc::new("INBOX".into(), 1)))
            .await
            .unwrap();

        let found = store
            .get_from_index(&IndexQuery::ByTypeAndMbox(DocType::Mailbox, "INBOX".into()))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_from_all_indexes() {
        let store = InMemoryStore::new();
        let id = store
            .create_doc(Document::Mailbox(MailboxDoc::new("INBOX".into(), 1)))
            .await
            .unwrap();
        store.delete_doc(id).await.unwrap();

        let found = store
            .get_from_index(&IndexQuery::ByType(DocType::Mailbox))
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
