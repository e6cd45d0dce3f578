// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::Arc;

use codec::v5::PublishPacket;
use codec::{EncodePacket, PacketId, QoS};
use tokio::sync::mpsc::Receiver;

use crate::events::{EventRegistry, PacketDirection, PacketEvent, PacketKind, PublishMessage};
use crate::transport::SharedWriter;
use crate::writer::LastWriteTime;
use crate::txn_map::{BoundedTxnMap, TransactionChain};

/// One outbound application message queued by `publish()`, paired with the id already
/// reserved for it when QoS ≥ 1 (QoS 0 publishes carry no id).
pub struct OutgoingPublish {
    pub packet: PublishPacket,
    pub packet_id: Option<PacketId>,
}

/// Drains `publish_rx`, enforcing the broker's advertised Receive Maximum via
/// `outgoing_pubs` before each QoS ≥ 1 publish is allowed onto the wire.
pub async fn run(
    writer: SharedWriter,
    mut publish_rx: Receiver<OutgoingPublish>,
    outgoing_pubs: Arc<BoundedTxnMap>,
    last_write: Arc<LastWriteTime>,
    events: Arc<EventRegistry>,
) {
    while let Some(item) = publish_rx.recv().await {
        if item.packet.qos() != QoS::AtMostOnce {
            let Some(id) = item.packet_id else {
                log::error!("publish_writer: QoS >= 1 publish queued without a packet id");
                continue;
            };
            let message = PublishMessage::from_packet(&item.packet);
            if outgoing_pubs
                .add(id, TransactionChain::new(message))
                .await
                .is_err()
            {
                log::warn!(
                    "publish_writer: dropping publish with duplicate local packet id {}",
                    id.value()
                );
                continue;
            }
        }

        let mut buf = Vec::new();
        if let Err(e) = item.packet.encode(&mut buf) {
            log::error!("publish_writer: failed to encode PUBLISH: {e:?}");
            continue;
        }
        if let Err(e) = writer.lock().await.write_all(&buf).await {
            log::error!("publish_writer: write failed: {e}");
            break;
        }
        last_write.touch();
        events.fire_publish_sent(&item.packet);
        events.fire_packet_event(PacketEvent {
            kind: PacketKind::Publish,
            direction: PacketDirection::Sent,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DuplexTransport;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_qos0_publish_skips_txn_table() {
        let (engine_side, mut broker_side) = DuplexTransport::pair(256);
        let (_reader, writer_half) = Box::new(engine_side).split();
        let (tx, rx) = mpsc::channel(4);
        let outgoing_pubs = BoundedTxnMap::new(4);
        let last_write = Arc::new(LastWriteTime::default());
        let events = Arc::new(EventRegistry::new());

        let handle = tokio::spawn(run(
            crate::transport::shared_writer(writer_half),
            rx,
            Arc::clone(&outgoing_pubs),
            last_write,
            events,
        ));

        let packet = PublishPacket::new("a/b", QoS::AtMostOnce, b"hi").unwrap();
        tx.send(OutgoingPublish {
            packet,
            packet_id: None,
        })
        .await
        .unwrap();
        drop(tx);

        let mut buf = [0_u8; 32];
        let n = broker_side.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(outgoing_pubs.len().await, 0);

        let _ = handle.await;
    }
}
