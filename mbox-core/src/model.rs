//! The typed documents persisted by the permanent store.
//!
//! Every document is a JSON object carrying a `type` discriminator, so the
//! whole family is modeled as one tagged enum. This mirrors the way the
//! corpus's own `UidIndex` is the single source of truth for a mailbox's
//! mutable state, except here each variant maps 1:1 onto a stored document
//! rather than an in-memory projection of an operation log.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use crate::unique_ident::UniqueIdent;

pub type ImapUid = NonZeroU32;
pub type ImapUidvalidity = NonZeroU32;
pub type Flag = String;

/// Opaque document identifier, distinct from message/content identifiers
/// even though it is generated the same way.
pub type DocId = UniqueIdent;

pub const FLAG_DELETED: &str = "\\Deleted";
pub const FLAG_SEEN: &str = "\\Seen";
pub const FLAG_RECENT: &str = "\\Recent";
pub const FLAG_NOSELECT: &str = "\\Noselect";

/// The four persistent document kinds plus the recent-flags snapshot,
/// tagged the way the permanent store's `by-type` index expects.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Document {
    #[serde(rename = "mbox")]
    Mailbox(MailboxDoc),
    #[serde(rename = "flags")]
    Flags(FlagsDoc),
    #[serde(rename = "head")]
    Headers(HeadersDoc),
    #[serde(rename = "cnt")]
    Content(ContentDoc),
    #[serde(rename = "rct")]
    Recent(RecentDoc),
}

impl Document {
    pub fn doc_type(&self) -> DocType {
        match self {
            Document::Mailbox(_) => DocType::Mailbox,
            Document::Flags(_) => DocType::Flags,
            Document::Headers(_) => DocType::Headers,
            Document::Content(_) => DocType::Content,
            Document::Recent(_) => DocType::Recent,
        }
    }

    pub fn as_mailbox(&self) -> Option<&MailboxDoc> {
        match self {
            Document::Mailbox(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_flags(&self) -> Option<&FlagsDoc> {
        match self {
            Document::Flags(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_headers(&self) -> Option<&HeadersDoc> {
        match self {
            Document::Headers(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_content(&self) -> Option<&ContentDoc> {
        match self {
            Document::Content(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_recent(&self) -> Option<&RecentDoc> {
        match self {
            Document::Recent(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DocType {
    Mailbox,
    Flags,
    Headers,
    Content,
    Recent,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Mailbox => "mbox",
            DocType::Flags => "flags",
            DocType::Headers => "head",
            DocType::Content => "cnt",
            DocType::Recent => "rct",
        }
    }
}

/// One per mailbox. `(type, mbox)` uniquely identifies a mailbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailboxDoc {
    pub mbox: String,
    /// Serves as UIDVALIDITY.
    pub created: u64,
    pub flags: Vec<Flag>,
    pub closed: bool,
    pub subscribed: bool,
    pub rw: bool,
}

impl MailboxDoc {
    pub fn new(mbox: String, created: u64) -> Self {
        Self {
            mbox,
            created,
            flags: Vec::new(),
            closed: false,
            subscribed: false,
            rw: true,
        }
    }

    pub fn noselect(&self) -> bool {
        self.flags.iter().any(|f| f == FLAG_NOSELECT)
    }

    pub fn set_noselect(&mut self, value: bool) {
        let has = self.noselect();
        if value && !has {
            self.flags.push(FLAG_NOSELECT.to_string());
        } else if !value && has {
            self.flags.retain(|f| f != FLAG_NOSELECT);
        }
    }
}

/// One per message. `(mbox, uid)` is unique; `chash` is the per-mailbox
/// deduplication key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlagsDoc {
    pub mbox: String,
    pub uid: ImapUid,
    pub chash: String,
    pub flags: BTreeSet<Flag>,
    pub recent: bool,
}

impl FlagsDoc {
    pub fn new(mbox: String, uid: ImapUid, chash: String, flags: BTreeSet<Flag>) -> Self {
        let recent = flags.contains(FLAG_RECENT);
        Self {
            mbox,
            uid,
            chash,
            flags,
            recent,
        }
    }

    pub fn deleted(&self) -> bool {
        self.flags.contains(FLAG_DELETED)
    }

    pub fn seen(&self) -> bool {
        self.flags.contains(FLAG_SEEN)
    }
}

/// A node in the flattened MIME tree: either a leaf content reference or a
/// wrapper over further subparts, keyed by 1-based subpart index.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartNode {
    Leaf { phash: String },
    Wrapper { part_map: BTreeMap<u32, PartNode> },
}

/// One per distinct header-set (deduplicated by `chash`, like a content
/// document but for the envelope + MIME tree rather than a single payload).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeadersDoc {
    pub chash: String,
    pub headers: BTreeMap<String, String>,
    pub part_map: BTreeMap<u32, PartNode>,
    /// phash of the body part, if one could be identified.
    pub body: Option<String>,
}

/// One per distinct payload; `phash` is globally unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentDoc {
    pub phash: String,
    #[serde(with = "serde_bytes_as_base64")]
    pub raw: Vec<u8>,
    pub content_type: String,
    pub content_disposition: Option<String>,
    pub content_transfer_encoding: Option<String>,
}

/// One per mailbox: the set of UIDs currently carrying `\Recent`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecentDoc {
    pub mbox: String,
    pub recent: BTreeSet<ImapUid>,
}

/// `raw` bytes are arbitrary binary MIME payloads; since the persisted
/// document schema is JSON, we base64-encode them rather than rely on a
/// non-UTF8-safe string field.
mod serde_bytes_as_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        encoded.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_type_discriminator_roundtrips() {
        let doc = Document::Mailbox(MailboxDoc::new("INBOX".into(), 1));
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"type\":\"mbox\""));
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back.doc_type(), DocType::Mailbox);
    }

    #[test]
    fn content_doc_preserves_binary_payload() {
        let doc = ContentDoc {
            phash: "ABC".into(),
            raw: vec![0, 159, 146, 150],
            content_type: "application/octet-stream".into(),
            content_disposition: None,
            content_transfer_encoding: None,
        };
        let json = serde_json::to_string(&doc).unwrap();
        let back: ContentDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(back.raw, doc.raw);
    }
}
