// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use tokio::sync::mpsc::{self, Receiver, Sender};

pub const CHANNEL_CAPACITY: usize = 64;

/// Multi-producer single-consumer FIFO linking the public client API and the Handler
/// loop to whichever loop owns the outgoing socket write.
///
/// `AwaitableQueue::sender()` is cheaply `Clone`-able and handed to every task that
/// needs to enqueue a packet; only the loop driving the connection ever owns the
/// receiving half.
pub struct AwaitableQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> AwaitableQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self { sender, receiver }
    }

    #[must_use]
    pub fn sender(&self) -> Sender<T> {
        self.sender.clone()
    }

    /// Waits for the next queued item; resolves to `None` once every sender has been
    /// dropped, signalling the loop that owns this queue should shut down.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }
}

impl<T> Default for AwaitableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_then_recv() {
        let mut queue = AwaitableQueue::new();
        queue.sender().send(42).await.unwrap();
        assert_eq!(queue.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_recv_returns_none_once_closed() {
        let (sender, mut receiver) = mpsc::channel::<u8>(1);
        drop(sender);
        assert_eq!(receiver.recv().await, None);
    }
}
