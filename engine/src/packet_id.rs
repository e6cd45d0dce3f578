// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::BTreeSet;

use codec::PacketId;
use tokio::sync::{Mutex, Notify};

/// Allocates packet identifiers for outgoing QoS 1/2 publishes and subscribe/unsubscribe
/// requests.
///
/// Identifiers wrap from 65535 back to 1; 0 is never handed out since the wire format
/// reserves it for packets that carry no identifier at all. An id is held until the
/// matching acknowledgement completes the in-flight transaction, at which point the
/// caller releases it back to the pool. When every one of the 65535 usable ids is in
/// flight, `acquire` suspends the caller until a `release` frees one, rather than
/// failing: this mirrors MQTT v5 flow control, where a sender waits for room instead of
/// erroring out.
pub struct PacketIdStore {
    inner: Mutex<Inner>,
    released: Notify,
}

struct Inner {
    next: u16,
    in_use: BTreeSet<u16>,
}

impl Default for PacketIdStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next: 1,
                in_use: BTreeSet::new(),
            }),
            released: Notify::new(),
        }
    }

    /// Returns the next free id, suspending until one becomes available if every one of
    /// the 65535 usable ids is currently in flight.
    pub async fn acquire(&self) -> PacketId {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.in_use.len() < usize::from(u16::MAX) {
                    loop {
                        let candidate = inner.next;
                        inner.next = if candidate == u16::MAX { 1 } else { candidate + 1 };
                        if inner.in_use.insert(candidate) {
                            return PacketId::from(candidate);
                        }
                    }
                }
            }
            self.released.notified().await;
        }
    }

    pub async fn release(&self, id: PacketId) {
        let mut inner = self.inner.lock().await;
        inner.in_use.remove(&id.value());
        drop(inner);
        self.released.notify_one();
    }

    pub async fn is_in_use(&self, id: PacketId) -> bool {
        self.inner.lock().await.in_use.contains(&id.value())
    }

    /// Frees every id currently in flight and wakes any caller suspended in `acquire`,
    /// used by `disconnect()` to reset the pool before the next connection attempt.
    pub async fn release_all(&self) {
        let mut inner = self.inner.lock().await;
        inner.in_use.clear();
        drop(inner);
        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_never_returns_zero() {
        let store = PacketIdStore::new();
        let id = store.acquire().await;
        assert_ne!(id.value(), 0);
    }

    #[tokio::test]
    async fn test_release_allows_reuse() {
        let store = PacketIdStore::new();
        let id = store.acquire().await;
        store.release(id).await;
        assert!(!store.is_in_use(id).await);
    }

    #[tokio::test]
    async fn test_wraps_around_skipping_in_use_ids() {
        let store = PacketIdStore::new();
        {
            let mut inner = store.inner.lock().await;
            inner.next = u16::MAX;
            inner.in_use.insert(1);
        }
        let first = store.acquire().await;
        assert_eq!(first.value(), u16::MAX);
        let second = store.acquire().await;
        assert_eq!(second.value(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_suspends_caller_until_release() {
        let store = std::sync::Arc::new(PacketIdStore::new());
        {
            let mut inner = store.inner.lock().await;
            for id in 1..=u16::MAX {
                inner.in_use.insert(id);
            }
        }

        let store_clone = std::sync::Arc::clone(&store);
        let waiter = tokio::spawn(async move { store_clone.acquire().await });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        store.release(PacketId::from(42)).await;
        let id = waiter.await.unwrap();
        assert_eq!(id.value(), 42);
    }

    #[tokio::test]
    async fn test_release_all_frees_every_id() {
        let store = PacketIdStore::new();
        let a = store.acquire().await;
        let b = store.acquire().await;
        store.release_all().await;
        assert!(!store.is_in_use(a).await);
        assert!(!store.is_in_use(b).await);
    }
}
