//! In-memory triple abstraction grouping a message's flags, headers, and
//! content documents, plus the memstore's own bookkeeping bits.

use std::collections::BTreeMap;

use crate::model::{ContentDoc, Document, FlagsDoc, HeadersDoc};

/// A message as seen by the memstore: its flags document, its headers
/// document, and the content documents referenced from its part map,
/// keyed by the 1-based part index used in `HeadersDoc::part_map`.
#[derive(Clone, Debug, Default)]
pub struct MessageContainer {
    pub fdoc: Option<FlagsDoc>,
    pub hdoc: Option<HeadersDoc>,
    pub cdocs: BTreeMap<u32, ContentDoc>,
    /// Set by the memstore when the container has never been persisted.
    pub new: bool,
    /// Set by the memstore when the container has local changes pending
    /// write-back.
    pub dirty: bool,
}

impl MessageContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags_only(fdoc: FlagsDoc) -> Self {
        Self {
            fdoc: Some(fdoc),
            ..Self::default()
        }
    }

    pub fn full(fdoc: FlagsDoc, hdoc: HeadersDoc, cdocs: BTreeMap<u32, ContentDoc>) -> Self {
        Self {
            fdoc: Some(fdoc),
            hdoc: Some(hdoc),
            cdocs,
            new: false,
            dirty: false,
        }
    }

    /// Iterates over every document this container currently holds, in a
    /// stable order: fdoc, then hdoc, then content docs by part index.
    pub fn iter_documents(&self) -> impl Iterator<Item = Document> + '_ {
        self.fdoc
            .clone()
            .map(Document::Flags)
            .into_iter()
            .chain(self.hdoc.clone().map(Document::Headers))
            .chain(self.cdocs.values().cloned().map(Document::Content))
    }

    pub fn mark_new(&mut self) {
        self.new = true;
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        if !self.new {
            self.dirty = true;
        }
    }

    pub fn mark_clean(&mut self) {
        self.new = false;
        self.dirty = false;
    }

    pub fn is_pending_write(&self) -> bool {
        self.new || self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlagsDoc, HeadersDoc};
    use std::collections::BTreeSet;
    use std::num::NonZeroU32;

    fn sample_fdoc() -> FlagsDoc {
        FlagsDoc::new(
            "INBOX".into(),
            NonZeroU32::new(1).unwrap(),
            "ABC".into(),
            BTreeSet::new(),
        )
    }

    fn sample_hdoc() -> HeadersDoc {
        HeadersDoc {
            chash: "ABC".into(),
            headers: BTreeMap::new(),
            part_map: BTreeMap::new(),
            body: None,
        }
    }

    #[test]
    fn iterates_all_present_documents() {
        let container = MessageContainer::full(sample_fdoc(), sample_hdoc(), BTreeMap::new());
        assert_eq!(container.iter_documents().count(), 2);
    }

    #[test]
    fn new_then_dirty_stays_new() {
        let mut container = MessageContainer::flags_only(sample_fdoc());
        container.mark_new();
        container.mark_dirty();
        assert!(container.new);
        assert!(!container.dirty);
        assert!(container.is_pending_write());
    }

    #[test]
    fn mark_clean_resets_both_flags() {
        let mut container = MessageContainer::flags_only(sample_fdoc());
        container.mark_dirty();
        container.mark_clean();
        assert!(!container.is_pending_write());
    }
}
