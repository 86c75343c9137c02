//! Periodic import of messages waiting in the encrypted document store's
//! incoming queue. Decryption itself is delegated to a [`Decryptor`]: the
//! keyserver/OpenPGP machinery that produces a plaintext envelope from
//! whatever is at rest in the queue is an external collaborator, the same
//! boundary the corpus draws around `cryptoblob` and `sealedbox` in its own
//! incoming-mail loop.
//!
//! What the decryptor hands back is not the raw RFC 5322 message: it is a
//! small JSON envelope, `{"incoming":true,"content":"<base64>"}`. The
//! `incoming` marker guards against ever delivering a payload that was
//! decrypted correctly but was never meant to land in a mailbox this way;
//! `content` carries the base64'd message bytes, since the envelope itself
//! has to be valid JSON.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::mail::account::Account;
use crate::mail::namespace;

#[derive(Deserialize)]
struct IncomingEnvelope {
    incoming: bool,
    content: String,
}

/// Checked in addition to whatever wakes the loop early, matching the
/// corpus's own belt-and-braces poll interval alongside its watch channel.
pub const INCOMING_CHECK_INTERVAL: Duration = Duration::from_secs(600);

/// A pending item in the incoming queue: opaque id plus whatever bytes the
/// queue holds at rest for it.
#[async_trait]
pub trait IncomingSource: Send + Sync {
    async fn list_pending(&self) -> anyhow::Result<Vec<String>>;
    async fn fetch(&self, id: &str) -> anyhow::Result<Vec<u8>>;
    async fn remove(&self, id: &str) -> anyhow::Result<()>;
}

/// Turns whatever is at rest in the queue into a plaintext RFC 5322
/// message. OpenPGP/keyserver-backed decryption is out of scope here; this
/// is the seam a concrete implementation of that machinery plugs into.
#[async_trait]
pub trait Decryptor: Send + Sync {
    async fn decrypt(&self, at_rest: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// A [`Decryptor`] for queues that seal each message directly with the
/// account's public key, the simplest case the corpus's own incoming loop
/// handles (there, one layer further in, to unwrap a per-message symmetric
/// key rather than the message itself).
pub struct SealedBoxDecryptor {
    public_key: sodiumoxide::crypto::box_::PublicKey,
    secret_key: sodiumoxide::crypto::box_::SecretKey,
}

impl SealedBoxDecryptor {
    pub fn new(
        public_key: sodiumoxide::crypto::box_::PublicKey,
        secret_key: sodiumoxide::crypto::box_::SecretKey,
    ) -> Self {
        Self {
            public_key,
            secret_key,
        }
    }
}

#[async_trait]
impl Decryptor for SealedBoxDecryptor {
    async fn decrypt(&self, at_rest: &[u8]) -> anyhow::Result<Vec<u8>> {
        sodiumoxide::crypto::sealedbox::open(at_rest, &self.public_key, &self.secret_key)
            .map_err(|_| anyhow::anyhow!("sealed box could not be opened"))
    }
}

/// Runs until `stop_rx` reports `true` or `account` is dropped. Failures on
/// an individual item are logged and the item is left in the queue for the
/// next pass rather than treated as fatal.
pub async fn run(
    account: Weak<Account>,
    source: Arc<dyn IncomingSource>,
    decryptor: Arc<dyn Decryptor>,
    target_mailbox: String,
    mut stop_rx: watch::Receiver<bool>,
) {
    let target_mailbox = namespace::canonicalize(&target_mailbox);
    let mut ticker = tokio::time::interval(INCOMING_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    info!("incoming fetcher stopping");
                    return;
                }
            }
        }

        let account = match Weak::upgrade(&account) {
            Some(a) => a,
            None => {
                info!("account no longer available, exiting incoming fetcher");
                return;
            }
        };

        if let Err(e) = poll_once(&account, &*source, &*decryptor, &target_mailbox).await {
            error!("incoming fetch pass failed: {}", e);
        }
    }
}

async fn poll_once(
    account: &Account,
    source: &dyn IncomingSource,
    decryptor: &dyn Decryptor,
    target_mailbox: &str,
) -> anyhow::Result<()> {
    let pending = source.list_pending().await?;
    for id in pending {
        if let Err(e) = move_one(account, source, decryptor, target_mailbox, &id).await {
            warn!("could not import incoming message {}: {}", id, e);
        }
    }
    Ok(())
}

async fn move_one(
    account: &Account,
    source: &dyn IncomingSource,
    decryptor: &dyn Decryptor,
    target_mailbox: &str,
    id: &str,
) -> anyhow::Result<()> {
    let at_rest = source.fetch(id).await?;
    let plain = decryptor.decrypt(&at_rest).await?;

    let envelope: IncomingEnvelope = serde_json::from_slice(&plain)
        .map_err(|e| anyhow::anyhow!("incoming envelope for {id} is not valid JSON: {e}"))?;
    if !envelope.incoming {
        return Err(anyhow::anyhow!(
            "incoming envelope for {id} is missing its incoming marker"
        ));
    }
    let raw_message = base64::engine::general_purpose::STANDARD
        .decode(envelope.content.as_bytes())
        .map_err(|e| anyhow::anyhow!("incoming envelope for {id} has invalid content: {e}"))?;

    let mailbox = account
        .get_mailbox(target_mailbox)
        .await
        .map_err(|e| anyhow::anyhow!("opening {target_mailbox}: {e}"))?;

    let mut flags = std::collections::BTreeSet::new();
    flags.insert(mbox_core::model::FLAG_RECENT.to_string());
    mailbox
        .add_message(&raw_message, flags)
        .await
        .map_err(|e| anyhow::anyhow!("appending to {target_mailbox}: {e}"))?;

    source.remove(id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbox_store::InMemoryStore;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct FakeSource {
        items: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl IncomingSource for FakeSource {
        async fn list_pending(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.items.lock().unwrap().keys().cloned().collect())
        }
        async fn fetch(&self, id: &str) -> anyhow::Result<Vec<u8>> {
            self.items
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such item"))
        }
        async fn remove(&self, id: &str) -> anyhow::Result<()> {
            self.items.lock().unwrap().remove(id);
            Ok(())
        }
    }

    struct IdentityDecryptor;

    #[async_trait]
    impl Decryptor for IdentityDecryptor {
        async fn decrypt(&self, at_rest: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(at_rest.to_vec())
        }
    }

    fn envelope(raw_message: &[u8]) -> Vec<u8> {
        let content = base64::engine::general_purpose::STANDARD.encode(raw_message);
        serde_json::to_vec(&serde_json::json!({ "incoming": true, "content": content })).unwrap()
    }

    #[tokio::test]
    async fn move_one_appends_and_removes_from_source() {
        let account = Account::new(Arc::new(InMemoryStore::new())).await.unwrap();
        let mut items = BTreeMap::new();
        items.insert(
            "m1".to_string(),
            envelope(b"Subject: hi\r\n\r\nhello"),
        );
        let source = FakeSource {
            items: Mutex::new(items),
        };

        move_one(&account, &source, &IdentityDecryptor, "INBOX", "m1")
            .await
            .unwrap();

        let mailbox = account.get_mailbox("INBOX").await.unwrap();
        assert_eq!(mailbox.fetch_flags().await.len(), 1);
        assert!(source.items.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_item_in_source() {
        let account = Account::new(Arc::new(InMemoryStore::new())).await.unwrap();
        let source = FakeSource {
            items: Mutex::new(BTreeMap::new()),
        };

        let result = move_one(&account, &source, &IdentityDecryptor, "INBOX", "missing").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_incoming_marker_is_rejected_and_left_in_source() {
        let account = Account::new(Arc::new(InMemoryStore::new())).await.unwrap();
        let mut items = BTreeMap::new();
        items.insert(
            "m1".to_string(),
            serde_json::to_vec(&serde_json::json!({ "incoming": false, "content": "" })).unwrap(),
        );
        let source = FakeSource {
            items: Mutex::new(items),
        };

        let result = move_one(&account, &source, &IdentityDecryptor, "INBOX", "m1").await;
        assert!(result.is_err());
        assert!(source.items.lock().unwrap().contains_key("m1"));
    }

    #[tokio::test]
    async fn non_json_payload_is_rejected() {
        let account = Account::new(Arc::new(InMemoryStore::new())).await.unwrap();
        let mut items = BTreeMap::new();
        items.insert("m1".to_string(), b"Subject: hi\r\n\r\nhello".to_vec());
        let source = FakeSource {
            items: Mutex::new(items),
        };

        let result = move_one(&account, &source, &IdentityDecryptor, "INBOX", "m1").await;
        assert!(result.is_err());
    }
}
