//! Recursive decomposition of a parsed RFC-822 message (RFC 2045/2046 MIME)
//! into the flattened part tree and content-addressed leaves used by the
//! rest of the storage core.
//!
//! `eml-codec` already hands us a proper tree (`AnyPart`), so unlike a walk
//! built on top of a flat `Message.walk()` iterator, this descends the tree
//! directly instead of flattening it and then reconstructing the structure
//! from a sequence of sibling counts. The resulting `part_map`/leaf shape is
//! the same one the document model expects, and since the input is already
//! a tree, running this twice on the same parse is trivially idempotent.

use std::collections::BTreeMap;

use eml_codec::{header, mime, part::composite, part::discrete, part::AnyPart};

use crate::hash::phash;
use crate::model::{ContentDoc, HeadersDoc, PartNode};

/// Content types that must never be recursed into even if a lenient parser
/// exposes them as a composite part. `message/delivery-status` is the one
/// real-world case: some generators nest a further nonstandard structure
/// inside it that is not meaningful to decompose further.
const ALWAYS_ATOMIC: &[(&str, &str)] = &[("message", "delivery-status")];

/// Content types considered eligible to stand in as "the body" for the
/// convenience `body` field on a headers document.
const BODY_CANDIDATES: &[(&str, &str)] = &[("text", "plain"), ("text", "html")];

pub struct WalkResult {
    pub headers: HeadersDoc,
    pub content: Vec<ContentDoc>,
}

/// Decomposes a parsed message into a headers document (carrying the part
/// tree) and the list of distinct content documents found in its leaves.
pub fn walk(raw: &[u8]) -> anyhow::Result<WalkResult> {
    let (_, msg) = eml_codec::parse_message(raw)
        .map_err(|e| anyhow::anyhow!("failed to parse message: {:?}", e))?;

    let mut content = Vec::new();
    let part_map = {
        let mut part_map = BTreeMap::new();
        part_map.insert(1u32, walk_node(&msg.child, &mut content));
        part_map
    };

    let headers = top_level_headers(&msg);
    let body = find_body_phash(&msg.child);

    Ok(WalkResult {
        headers: HeadersDoc {
            chash: String::new(),
            headers,
            part_map,
            body,
        },
        content,
    })
}

fn walk_node(part: &AnyPart, content: &mut Vec<ContentDoc>) -> PartNode {
    if is_atomic(part) {
        return leaf(part, content);
    }

    match part {
        AnyPart::Mult(m) => {
            let mut part_map = BTreeMap::new();
            for (i, child) in m.children.iter().enumerate() {
                part_map.insert((i + 1) as u32, walk_node(child, content));
            }
            PartNode::Wrapper { part_map }
        }
        AnyPart::Msg(sub) => {
            let mut part_map = BTreeMap::new();
            part_map.insert(1u32, walk_node(&sub.child, content));
            PartNode::Wrapper { part_map }
        }
        AnyPart::Txt(_) | AnyPart::Bin(_) => leaf(part, content),
    }
}

fn leaf(part: &AnyPart, content: &mut Vec<ContentDoc>) -> PartNode {
    let body = leaf_body(part);
    let h = phash(body);

    let mime = part.mime();
    let (main, sub) = ctype_of(mime);
    let content_type = format!("{}/{}", main, sub);

    content.push(ContentDoc {
        phash: h.clone(),
        raw: body.to_vec(),
        content_type,
        content_disposition: find_header(mime, "content-disposition")
            .map(|v| String::from_utf8_lossy(v).into_owned()),
        content_transfer_encoding: Some(mechanism_str(&mime.transfer_encoding).to_string()),
    });

    PartNode::Leaf { phash: h }
}

fn leaf_body<'a>(part: &'a AnyPart) -> &'a [u8] {
    match part {
        AnyPart::Txt(t) => t.body,
        AnyPart::Bin(b) => b.body,
        AnyPart::Msg(m) => m.raw_part,
        AnyPart::Mult(_) => &[],
    }
}

fn is_atomic(part: &AnyPart) -> bool {
    let mime = part.mime();
    let (main, sub) = ctype_of(mime);
    ALWAYS_ATOMIC
        .iter()
        .any(|(m, s)| main.eq_ignore_ascii_case(m) && sub.eq_ignore_ascii_case(s))
}

fn ctype_of(mime: &mime::NaiveMIME) -> (String, String) {
    match &mime.ctype {
        Some(ct) => (
            String::from_utf8_lossy(ct.main).to_lowercase(),
            String::from_utf8_lossy(ct.sub).to_lowercase(),
        ),
        None => ("text".to_string(), "plain".to_string()),
    }
}

fn mechanism_str(m: &mime::mechanism::Mechanism) -> &'static str {
    match m {
        mime::mechanism::Mechanism::_8Bit => "8bit",
        mime::mechanism::Mechanism::Binary => "binary",
        mime::mechanism::Mechanism::QuotedPrintable => "quoted-printable",
        mime::mechanism::Mechanism::Base64 => "base64",
        _ => "7bit",
    }
}

fn find_header<'a>(mime: &'a mime::NaiveMIME, name: &str) -> Option<&'a [u8]> {
    mime.kv.iter().find_map(|field| match field {
        header::Field::Good(header::Kv2(k, v)) if k.eq_ignore_ascii_case(name.as_bytes()) => {
            Some(*v)
        }
        _ => None,
    })
}

fn top_level_headers(msg: &composite::Message) -> BTreeMap<String, String> {
    let mime = msg.child.mime();
    mime.kv
        .iter()
        .filter_map(|field| match field {
            header::Field::Good(header::Kv2(k, v)) => Some((
                String::from_utf8_lossy(k).to_lowercase(),
                String::from_utf8_lossy(v).into_owned(),
            )),
            _ => None,
        })
        .collect()
}

fn find_body_phash(part: &AnyPart) -> Option<String> {
    if is_body_candidate(part) {
        return Some(phash(leaf_body(part)));
    }

    match part {
        AnyPart::Mult(m) => m.children.iter().find_map(find_body_phash),
        AnyPart::Msg(sub) => find_body_phash(&sub.child),
        _ => None,
    }
}

fn is_body_candidate(part: &AnyPart) -> bool {
    if !matches!(part, AnyPart::Txt(_)) {
        return false;
    }
    let (main, sub) = ctype_of(part.mime());
    BODY_CANDIDATES
        .iter()
        .any(|(m, s)| main == *m && sub == *s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"From: a@example.org\r\nTo: b@example.org\r\nSubject: hi\r\nContent-Type: text/plain\r\n\r\nhello world\r\n";

    const MULTIPART: &[u8] = b"From: a@example.org\r\nTo: b@example.org\r\nSubject: hi\r\nContent-Type: multipart/mixed; boundary=xyz\r\n\r\n--xyz\r\nContent-Type: text/plain\r\n\r\nbody text\r\n--xyz\r\nContent-Type: application/octet-stream\r\n\r\nbinarydata\r\n--xyz--\r\n";

    #[test]
    fn single_part_message_yields_one_leaf() {
        let res = walk(SIMPLE).unwrap();
        assert_eq!(res.content.len(), 1);
        assert_eq!(res.headers.part_map.len(), 1);
        assert!(matches!(
            res.headers.part_map.get(&1),
            Some(PartNode::Leaf { .. })
        ));
    }

    #[test]
    fn multipart_message_yields_wrapper_with_each_child() {
        let res = walk(MULTIPART).unwrap();
        assert_eq!(res.content.len(), 2);
        match res.headers.part_map.get(&1) {
            Some(PartNode::Wrapper { part_map }) => assert_eq!(part_map.len(), 2),
            other => panic!("expected wrapper node, got {:?}", other),
        }
        assert!(res.headers.body.is_some());
    }

    #[test]
    fn walking_twice_is_idempotent() {
        let a = walk(MULTIPART).unwrap();
        let b = walk(MULTIPART).unwrap();
        assert_eq!(a.content.len(), b.content.len());
        assert_eq!(
            serde_json::to_string(&a.headers.part_map).unwrap(),
            serde_json::to_string(&b.headers.part_map).unwrap()
        );
    }

    #[test]
    fn delivery_status_part_is_never_recursed_into() {
        let msg: &[u8] = b"From: a@example.org\r\nTo: b@example.org\r\nSubject: bounce\r\nContent-Type: message/delivery-status\r\n\r\nReporting-MTA: dns; example.org\r\nAction: failed\r\n";
        let res = walk(msg).unwrap();
        assert_eq!(res.content.len(), 1);
    }
}
