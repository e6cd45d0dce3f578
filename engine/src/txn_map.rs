// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::Arc;

use codec::PacketId;
use tokio::sync::{Mutex, Notify};

use crate::events::PublishMessage;

/// Ordered record of packets exchanged for a single in-flight QoS 1/2 publish.
///
/// For an outgoing QoS 2 publish this grows from `[Publish]` to `[Publish, PubRec,
/// PubRel]` as the handshake advances; an incoming QoS 2 publish starts as
/// `[PublishMessage]` and is replaced wholesale once PubRel arrives.
#[derive(Clone, Debug, Default)]
pub struct TransactionChain(Vec<PublishMessage>);

impl TransactionChain {
    #[must_use]
    pub fn new(first: PublishMessage) -> Self {
        Self(vec![first])
    }

    pub fn push(&mut self, message: PublishMessage) {
        self.0.push(message);
    }

    #[must_use]
    pub fn first(&self) -> Option<&PublishMessage> {
        self.0.first()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Map from packet id to its in-flight `TransactionChain`, bounded to the broker's
/// (or our own) advertised Receive Maximum.
///
/// `add` blocks the caller when the map is at capacity rather than failing outright,
/// modelling MQTT v5 flow control: the sender simply waits for room instead of erroring.
/// Capacity may only be grown, and only while the map is empty (during the CONNECT
/// handshake once ConnAck's Receive Maximum is known).
pub struct BoundedTxnMap {
    inner: Mutex<HashMap<u16, TransactionChain>>,
    capacity: Mutex<usize>,
    not_full: Notify,
}

impl BoundedTxnMap {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            capacity: Mutex::new(capacity),
            not_full: Notify::new(),
        })
    }

    /// Grows capacity. A no-op (and logged) if `new_capacity` is smaller than the
    /// current one, since shrinking a possibly non-empty map is forbidden.
    pub async fn resize(&self, new_capacity: usize) {
        let mut capacity = self.capacity.lock().await;
        if new_capacity < *capacity {
            log::warn!(
                "txn_map: ignoring shrink request from {} to {new_capacity}",
                *capacity
            );
            return;
        }
        *capacity = new_capacity;
        self.not_full.notify_waiters();
    }

    /// Inserts `chain` under `id`, waiting for room if the map is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(chain)` giving the chain back if `id` is already present.
    pub async fn add(&self, id: PacketId, chain: TransactionChain) -> Result<(), TransactionChain> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                let capacity = *self.capacity.lock().await;
                if inner.contains_key(&id.value()) {
                    return Err(chain);
                }
                if inner.len() < capacity {
                    inner.insert(id.value(), chain);
                    return Ok(());
                }
            }
            self.not_full.notified().await;
        }
    }

    pub async fn get(&self, id: PacketId) -> Option<TransactionChain> {
        self.inner.lock().await.get(&id.value()).cloned()
    }

    /// Compare-and-swap: replaces the chain under `id` with `new_chain` only if the
    /// current value equals `expected_len` elements, avoiding a lost update if another
    /// loop is concurrently extending the same chain.
    pub async fn try_update(
        &self,
        id: PacketId,
        expected_len: usize,
        new_chain: TransactionChain,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.get(&id.value()) {
            Some(current) if current.len() == expected_len => {
                inner.insert(id.value(), new_chain);
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, id: PacketId) -> Option<TransactionChain> {
        let mut inner = self.inner.lock().await;
        let removed = inner.remove(&id.value());
        if removed.is_some() {
            drop(inner);
            self.not_full.notify_one();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Drops every in-flight chain and wakes any caller blocked in `add`, used by
    /// `disconnect()` to reset flow-control state before the next connection attempt.
    pub async fn clear(&self) {
        self.inner.lock().await.clear();
        self.not_full.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::QoS;

    fn sample_message(topic: &str) -> PublishMessage {
        PublishMessage {
            topic: topic.to_string(),
            payload: Vec::new(),
            qos: QoS::AtLeastOnce,
            retain: false,
            packet_id: None,
        }
    }

    #[tokio::test]
    async fn test_add_then_remove() {
        let map = BoundedTxnMap::new(4);
        let id = PacketId::from(1);
        map.add(id, TransactionChain::new(sample_message("a")))
            .await
            .unwrap();
        assert_eq!(map.len().await, 1);
        let removed = map.remove(id).await;
        assert!(removed.is_some());
        assert_eq!(map.len().await, 0);
    }

    #[tokio::test]
    async fn test_add_duplicate_id_fails() {
        let map = BoundedTxnMap::new(4);
        let id = PacketId::from(1);
        map.add(id, TransactionChain::new(sample_message("a")))
            .await
            .unwrap();
        let result = map.add(id, TransactionChain::new(sample_message("b"))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_try_update_rejects_stale_expected_len() {
        let map = BoundedTxnMap::new(4);
        let id = PacketId::from(1);
        map.add(id, TransactionChain::new(sample_message("a")))
            .await
            .unwrap();
        let mut chain = map.get(id).await.unwrap();
        chain.push(sample_message("a"));
        assert!(!map.try_update(id, 5, chain.clone()).await);
        assert!(map.try_update(id, 1, chain).await);
        assert_eq!(map.get(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_blocks_when_full_until_remove() {
        let map = BoundedTxnMap::new(1);
        let id_a = PacketId::from(1);
        let id_b = PacketId::from(2);
        map.add(id_a, TransactionChain::new(sample_message("a")))
            .await
            .unwrap();

        let map_clone = Arc::clone(&map);
        let waiter = tokio::spawn(async move {
            map_clone
                .add(id_b, TransactionChain::new(sample_message("b")))
                .await
        });

        tokio::task::yield_now().await;
        map.remove(id_a).await;
        waiter.await.unwrap().unwrap();
        assert_eq!(map.len().await, 1);
    }

    #[tokio::test]
    async fn test_clear_empties_map_and_wakes_waiters() {
        let map = BoundedTxnMap::new(1);
        let id_a = PacketId::from(1);
        let id_b = PacketId::from(2);
        map.add(id_a, TransactionChain::new(sample_message("a")))
            .await
            .unwrap();

        let map_clone = Arc::clone(&map);
        let waiter = tokio::spawn(async move {
            map_clone
                .add(id_b, TransactionChain::new(sample_message("b")))
                .await
        });

        tokio::task::yield_now().await;
        map.clear().await;
        waiter.await.unwrap().unwrap();
        assert_eq!(map.len().await, 1);
    }
}
