// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::Receiver;

use crate::events::{EventRegistry, PacketDirection, PacketEvent, PacketKind};
use crate::transport::SharedWriter;

/// Monotonic-ish record of the last time either writer loop successfully flushed
/// bytes, read by the Supervisor's keep-alive task. Stored as epoch milliseconds so it
/// can live in a plain atomic.
#[derive(Default)]
pub struct LastWriteTime(AtomicI64);

impl LastWriteTime {
    pub fn touch(&self) {
        let now = now_millis();
        self.0.store(now, Ordering::SeqCst);
    }

    #[must_use]
    pub fn elapsed_secs(&self) -> u64 {
        let last = self.0.load(Ordering::SeqCst);
        let now = now_millis();
        u64::try_from((now - last).max(0)).unwrap_or(0) / 1000
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A future run by the Writer after its bytes have actually reached the transport,
/// e.g. firing the `OnMessageReceived` event for a QoS 1/2 publish only once the
/// corresponding ack has been written, per the ordering guarantee the Handler loop
/// cannot honor on its own since it never touches the transport.
pub type WriteCompletion = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One already-encoded control packet queued for the Writer, tagged with its type for
/// the generic sent-packet event and, optionally, a completion to run once written.
pub struct QueuedWrite {
    pub bytes: Vec<u8>,
    pub kind: PacketKind,
    pub on_written: Option<WriteCompletion>,
}

impl QueuedWrite {
    #[must_use]
    pub fn plain(bytes: Vec<u8>, kind: PacketKind) -> Self {
        Self {
            bytes,
            kind,
            on_written: None,
        }
    }

    #[must_use]
    pub fn with_completion(bytes: Vec<u8>, kind: PacketKind, on_written: WriteCompletion) -> Self {
        Self {
            bytes,
            kind,
            on_written: Some(on_written),
        }
    }
}

/// Drains `send_rx` in FIFO order and writes each already-encoded control packet to the
/// transport. Publish packets never flow through this queue; that is the Publish-Writer's
/// job. Never touches `ConnectionState`: a write failure here is the Reader's transport
/// to own, since the Reader is the loop the spec assigns connection-loss recovery to.
pub async fn run(
    writer: SharedWriter,
    mut send_rx: Receiver<QueuedWrite>,
    last_write: Arc<LastWriteTime>,
    events: Arc<EventRegistry>,
) {
    while let Some(item) = send_rx.recv().await {
        let write_result = writer.lock().await.write_all(&item.bytes).await;
        match write_result {
            Ok(()) => {
                last_write.touch();
                events.fire_packet_event(PacketEvent {
                    kind: item.kind,
                    direction: PacketDirection::Sent,
                });
                if let Some(on_written) = item.on_written {
                    on_written.await;
                }
            }
            Err(e) => {
                log::error!("writer: write failed: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DuplexTransport;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_writes_queued_bytes_in_order() {
        let (engine_side, mut broker_side) = DuplexTransport::pair(256);
        let (_reader, writer_half) = Box::new(engine_side).split();
        let (send_tx, send_rx) = mpsc::channel(4);
        let last_write = Arc::new(LastWriteTime::default());
        let events = Arc::new(EventRegistry::new());

        let handle = tokio::spawn(run(
            crate::transport::shared_writer(writer_half),
            send_rx,
            last_write,
            events,
        ));

        send_tx
            .send(QueuedWrite::plain(vec![0xd0, 0x00], PacketKind::Disconnect))
            .await
            .unwrap();
        drop(send_tx);

        let mut buf = [0_u8; 2];
        broker_side.read(&mut buf).await.unwrap();
        assert_eq!(buf, [0xd0, 0x00]);

        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_completion_runs_only_after_write() {
        let (engine_side, mut broker_side) = DuplexTransport::pair(256);
        let (_reader, writer_half) = Box::new(engine_side).split();
        let (send_tx, send_rx) = mpsc::channel(4);
        let last_write = Arc::new(LastWriteTime::default());
        let events = Arc::new(EventRegistry::new());

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);

        let handle = tokio::spawn(run(
            crate::transport::shared_writer(writer_half),
            send_rx,
            last_write,
            events,
        ));

        send_tx
            .send(QueuedWrite::with_completion(
                vec![0xd0, 0x00],
                PacketKind::Disconnect,
                Box::pin(async move {
                    fired_clone.store(true, Ordering::SeqCst);
                }),
            ))
            .await
            .unwrap();
        drop(send_tx);

        let mut buf = [0_u8; 2];
        broker_side.read(&mut buf).await.unwrap();
        let _ = handle.await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
