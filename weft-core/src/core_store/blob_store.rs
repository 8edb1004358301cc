/*
    BlobStore - local bytes with publish-loop hooks

    An opaque key -> bytes map. Each entry carries the cancel sender of the
    publish loop advertising that key; replacing or removing the entry raises
    the signal so the loop stops republishing.
*/

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

struct Blob {
    bytes: Vec<u8>,
    cancel: mpsc::Sender<()>,
}

/// The local blob store.
pub struct BlobStore {
    blobs: Mutex<HashMap<String, Blob>>,
}

impl BlobStore {
    pub fn new() -> Self {
        BlobStore {
            blobs: Mutex::new(HashMap::new()),
        }
    }

    fn blobs(&self) -> MutexGuard<'_, HashMap<String, Blob>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bytes stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs().get(key).map(|blob| blob.bytes.clone())
    }

    /// Store bytes under `key`. A replaced entry has its publish loop
    /// cancelled.
    pub fn put(&self, key: &str, bytes: Vec<u8>, cancel: mpsc::Sender<()>) {
        let previous = self
            .blobs()
            .insert(key.to_string(), Blob { bytes, cancel });
        if let Some(blob) = previous {
            let _ = blob.cancel.try_send(());
        }
    }

    /// Remove `key`, cancelling its publish loop. Returns whether an entry
    /// existed.
    pub fn delete(&self, key: &str) -> bool {
        match self.blobs().remove(key) {
            Some(blob) => {
                let _ = blob.cancel.try_send(());
                true
            }
            None => false,
        }
    }

    /// Remove everything, cancelling every publish loop.
    pub fn delete_all(&self) {
        for (_, blob) in self.blobs().drain() {
            let _ = blob.cancel.try_send(());
        }
    }

    /// Sorted list of stored keys, for the shell's `list` command.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.blobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs().is_empty()
    }
}

impl Default for BlobStore {
    fn default() -> Self {
        BlobStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = BlobStore::new();
        let (tx, _rx) = mpsc::channel(1);
        store.put("key", b"value".to_vec(), tx);

        assert_eq!(store.get("key"), Some(b"value".to_vec()));
        assert_eq!(store.get("missing"), None);
        assert!(store.delete("key"));
        assert!(!store.delete("key"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_replacing_entry_cancels_previous_publisher() {
        let store = BlobStore::new();
        let (old_tx, mut old_rx) = mpsc::channel(1);
        let (new_tx, mut new_rx) = mpsc::channel(1);

        store.put("key", b"one".to_vec(), old_tx);
        store.put("key", b"two".to_vec(), new_tx);

        assert!(old_rx.try_recv().is_ok());
        assert!(new_rx.try_recv().is_err());
        assert_eq!(store.get("key"), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_raises_cancel_signal() {
        let store = BlobStore::new();
        let (tx, mut rx) = mpsc::channel(1);
        store.put("key", b"value".to_vec(), tx);

        assert!(store.delete("key"));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_delete_all() {
        let store = BlobStore::new();
        let (tx_a, mut rx_a) = mpsc::channel(1);
        let (tx_b, mut rx_b) = mpsc::channel(1);
        store.put("a", b"1".to_vec(), tx_a);
        store.put("b", b"2".to_vec(), tx_b);

        store.delete_all();
        assert!(store.is_empty());
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_keys_sorted() {
        let store = BlobStore::new();
        let (tx, _rx) = mpsc::channel(1);
        store.put("beta", b"2".to_vec(), tx.clone());
        store.put("alpha", b"1".to_vec(), tx);
        assert_eq!(store.keys(), vec!["alpha".to_string(), "beta".to_string()]);
    }
}
