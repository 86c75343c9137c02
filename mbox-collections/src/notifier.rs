//! Per-account listener registry for IMAP's unsolicited-response machinery
//! (RFC 3501 §7): new messages, expunges and flag changes need to reach
//! every other session with the mailbox open.
//!
//! This is an explicit component owned by the `Account` and handed to each
//! `Mailbox`, rather than ambient global state, so tests can inject a stub
//! listener instead of reaching into module globals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

const SKIP_NOTIFY_VAR: &str = "LEAP_SKIPNOTIFY";

#[async_trait]
pub trait Listener: Send + Sync {
    async fn new_messages(&self, exists: u64, recent: u64);
}

#[derive(Default)]
pub struct Notifier {
    listeners: Mutex<HashMap<String, Vec<Arc<dyn Listener>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mbox: &str, listener: Arc<dyn Listener>) {
        self.listeners
            .lock()
            .unwrap()
            .entry(mbox.to_string())
            .or_default()
            .push(listener);
    }

    /// Removing a listener that was never registered is a silent no-op.
    pub fn unregister(&self, mbox: &str, listener: &Arc<dyn Listener>) {
        if let Some(list) = self.listeners.lock().unwrap().get_mut(mbox) {
            list.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    pub async fn notify(&self, mbox: &str, exists: u64, recent: u64) {
        if std::env::var_os(SKIP_NOTIFY_VAR).is_some() {
            return;
        }

        let listeners = self
            .listeners
            .lock()
            .unwrap()
            .get(mbox)
            .cloned()
            .unwrap_or_default();

        for listener in listeners {
            listener.new_messages(exists, recent).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingListener {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Listener for CountingListener {
        async fn new_messages(&self, _exists: u64, _recent: u64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn notifies_registered_listeners() {
        std::env::remove_var(SKIP_NOTIFY_VAR);
        let notifier = Notifier::new();
        let listener = Arc::new(CountingListener {
            calls: AtomicU64::new(0),
        });
        notifier.register("INBOX", listener.clone());
        notifier.notify("INBOX", 1, 1).await;
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregister_missing_listener_is_noop() {
        let notifier = Notifier::new();
        let listener = Arc::new(CountingListener {
            calls: AtomicU64::new(0),
        });
        notifier.unregister("INBOX", &listener);
    }
}
