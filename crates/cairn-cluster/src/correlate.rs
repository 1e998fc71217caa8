//! Tables of callers waiting for a correlated response.
//!
//! Used for WKA handshakes (keyed by nonce), data acks and replies (keyed by
//! responder and sequence number). The receiver task completes entries
//! directly so responses never queue behind the event loop.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::oneshot;

#[derive(Debug)]
pub(crate) struct Correlator<K, V> {
    pending: Mutex<HashMap<K, oneshot::Sender<V>>>,
}

impl<K: Eq + Hash, V> Correlator<K, V> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registers interest in `key`. A previous waiter for the same key is
    /// dropped and observes a closed channel.
    pub fn register(&self, key: K) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, tx);
        rx
    }

    /// Hands `value` to the waiter for `key`. Returns false if nobody was
    /// waiting (late, duplicate or unsolicited response).
    pub fn complete(&self, key: &K, value: V) -> bool {
        match self.take(key) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Removes and returns the waiter for `key`, letting the caller decide
    /// what to do with a response when nobody is waiting.
    pub fn take(&self, key: &K) -> Option<oneshot::Sender<V>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    pub fn cancel(&self, key: &K) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Drops every waiter.
    pub fn clear(&self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_registered_waiter() {
        let table: Correlator<u64, &str> = Correlator::new();
        let rx = table.register(7);
        assert!(table.complete(&7, "pong"));
        assert_eq!(rx.await.unwrap(), "pong");
        assert!(!table.complete(&7, "again"));
    }

    #[tokio::test]
    async fn cancel_and_clear_drop_waiters() {
        let table: Correlator<u64, ()> = Correlator::new();
        let a = table.register(1);
        let b = table.register(2);
        table.cancel(&1);
        assert!(a.await.is_err());
        assert_eq!(table.len(), 1);
        table.clear();
        assert!(b.await.is_err());
    }

    #[test]
    fn unsolicited_completion_is_ignored() {
        let table: Correlator<(String, u64), ()> = Correlator::new();
        assert!(!table.complete(&("b".into(), 1), ()));
    }
}
