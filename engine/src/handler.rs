// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::Arc;

use codec::v5::{PublishAckPacket, PublishCompletePacket, PublishReceivedPacket, PublishReleasePacket, ReasonCode};
use codec::{EncodePacket, PacketId, QoS};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::oneshot;

use crate::events::{EventRegistry, PacketKind, PublishMessage};
use crate::framer::Decoded;
use crate::packet_id::PacketIdStore;
use crate::properties::ConnectionProperties;
use crate::state::{ConnectionState, StateCell};
use crate::txn_map::{BoundedTxnMap, TransactionChain};
use crate::writer::QueuedWrite;

/// Pending caller awaiting the result of an operation keyed by packet id: Connect uses
/// a dedicated slot (no packet id involved), Subscribe/Unsubscribe/QoS publish use this
/// table.
pub enum Awaiter {
    Subscribe(oneshot::Sender<Vec<ReasonCode>>),
    Unsubscribe(oneshot::Sender<Vec<ReasonCode>>),
    Publish(oneshot::Sender<ReasonCode>),
}

/// Shared state the Handler loop mutates as it advances per-id transaction machines.
pub struct HandlerContext {
    pub outgoing_pubs: Arc<BoundedTxnMap>,
    pub incoming_pubs: Arc<BoundedTxnMap>,
    pub packet_ids: Arc<PacketIdStore>,
    pub events: Arc<EventRegistry>,
    pub state: Arc<StateCell>,
    pub connect_ack_tx: tokio::sync::Mutex<Option<oneshot::Sender<(ConnectionProperties, ReasonCode)>>>,
    pub awaiters: tokio::sync::Mutex<HashMap<u16, Awaiter>>,
}

/// Runs the connection-loss recovery path §4.8 assigns to the Reader: transition to
/// `Disconnected`, fire `AfterDisconnect(clean=false)`, and abandon every in-flight
/// chain by dropping its awaiter, which resolves the caller's pending `oneshot::Receiver`
/// with an error instead of leaving it to time out on its own.
pub async fn handle_connection_loss(ctx: &Arc<HandlerContext>) {
    ctx.state.set(ConnectionState::Disconnected);
    if let Some(tx) = ctx.connect_ack_tx.lock().await.take() {
        drop(tx);
    }
    ctx.awaiters.lock().await.clear();
    ctx.events.fire_disconnect(false);
}

/// Single consumer of decoded broker packets. Advances transaction chains, enqueues
/// acknowledgement packets on `send_tx`, and fires user events.
pub async fn run(mut received_rx: Receiver<Decoded>, send_tx: Sender<QueuedWrite>, ctx: Arc<HandlerContext>) {
    while let Some(decoded) = received_rx.recv().await {
        match decoded {
            Decoded::ConnectAck(packet) => {
                let properties = ConnectionProperties::from_connect_ack(&packet);
                if packet.reason_code() == ReasonCode::Success {
                    ctx.outgoing_pubs.resize(usize::from(properties.receive_maximum)).await;
                    ctx.state.set(ConnectionState::Connected);
                } else {
                    ctx.state.set(ConnectionState::Disconnected);
                }
                if let Some(tx) = ctx.connect_ack_tx.lock().await.take() {
                    let _ = tx.send((properties, packet.reason_code()));
                }
                ctx.events.fire_connect();
            }

            Decoded::Publish(packet) => {
                let message = PublishMessage::from_packet(&packet);
                match packet.qos() {
                    QoS::AtMostOnce => ctx.events.fire_message(&message),
                    QoS::AtLeastOnce => {
                        let id = packet.packet_id();
                        let mut ack = PublishAckPacket::new(id);
                        ack.set_reason_code(ReasonCode::Success);
                        if !append_incoming(&ctx.incoming_pubs, id, message.clone()).await {
                            continue;
                        }
                        ctx.incoming_pubs.remove(id).await;
                        // §5: user-level delivery must happen no earlier than the ack
                        // actually reaching the wire, so the fire is deferred to a
                        // completion the Writer runs only after a successful write.
                        let events = Arc::clone(&ctx.events);
                        enqueue_with_completion(
                            &send_tx,
                            &ack,
                            PacketKind::PublishAck,
                            Box::pin(async move { events.fire_message(&message) }),
                        )
                        .await;
                    }
                    QoS::ExactOnce => {
                        let id = packet.packet_id();
                        let mut received = PublishReceivedPacket::new(id);
                        received.set_reason_code(ReasonCode::Success);
                        if !append_incoming(&ctx.incoming_pubs, id, message).await {
                            continue;
                        }
                        enqueue(&send_tx, &received, PacketKind::PublishReceived).await;
                    }
                }
            }

            Decoded::PublishRelease(packet) => {
                let id = packet.packet_id();
                if let Some(chain) = ctx.incoming_pubs.remove(id).await {
                    let mut complete = PublishCompletePacket::new(id);
                    complete.set_reason_code(ReasonCode::Success);
                    if let Some(message) = chain.first().cloned() {
                        let events = Arc::clone(&ctx.events);
                        enqueue_with_completion(
                            &send_tx,
                            &complete,
                            PacketKind::PublishComplete,
                            Box::pin(async move { events.fire_message(&message) }),
                        )
                        .await;
                    } else {
                        enqueue(&send_tx, &complete, PacketKind::PublishComplete).await;
                    }
                } else {
                    log::warn!(
                        "handler: PUBREL for unknown incoming packet id {}",
                        id.value()
                    );
                }
            }

            Decoded::PublishAck(packet) => {
                complete_outgoing(&ctx, packet.packet_id(), packet.reason_code()).await;
            }

            Decoded::PublishReceived(packet) => {
                let id = packet.packet_id();
                let chain = ctx.outgoing_pubs.get(id).await;
                let Some(chain) = chain else {
                    log::warn!("handler: PUBREC for unknown outgoing packet id {}", id.value());
                    continue;
                };
                let expected_len = chain.len();
                let mut release = PublishReleasePacket::new(id);
                release.set_reason_code(ReasonCode::Success);
                let mut new_chain = chain;
                new_chain.push(PublishMessage {
                    packet_id: Some(id),
                    qos: QoS::ExactOnce,
                    ..PublishMessage::default()
                });
                if ctx
                    .outgoing_pubs
                    .try_update(id, expected_len, new_chain)
                    .await
                {
                    enqueue(&send_tx, &release, PacketKind::PublishRelease).await;
                } else {
                    log::warn!("handler: lost update racing PUBREC for id {}", id.value());
                }
            }

            Decoded::PublishComplete(packet) => {
                complete_outgoing(&ctx, packet.packet_id(), packet.reason_code()).await;
            }

            Decoded::SubscribeAck(packet) => {
                let id = packet.packet_id();
                if let Some(Awaiter::Subscribe(tx)) = ctx.awaiters.lock().await.remove(&id.value()) {
                    let _ = tx.send(packet.reasons().to_vec());
                }
                ctx.packet_ids.release(id).await;
            }

            Decoded::UnsubscribeAck(packet) => {
                let id = packet.packet_id();
                if let Some(Awaiter::Unsubscribe(tx)) = ctx.awaiters.lock().await.remove(&id.value())
                {
                    let _ = tx.send(packet.reasons().to_vec());
                }
                ctx.packet_ids.release(id).await;
            }

            Decoded::PingResponse(_) => {
                log::debug!("handler: PINGRESP received");
            }

            Decoded::Disconnect(packet) => {
                log::info!("handler: broker DISCONNECT, reason {:?}", packet.reason_code());
                ctx.events.fire_disconnect(false);
                break;
            }
        }
    }
}

async fn append_incoming(incoming_pubs: &BoundedTxnMap, id: PacketId, message: PublishMessage) -> bool {
    if let Some(chain) = incoming_pubs.get(id).await {
        let expected_len = chain.len();
        let mut updated = chain;
        updated.push(message);
        incoming_pubs.try_update(id, expected_len, updated).await
    } else {
        // Reader pre-registers the chain before forwarding; absence means the entry
        // was already consumed or never created, which is a protocol-level bug upstream.
        log::error!("handler: no pre-registered chain for incoming packet id {}", id.value());
        false
    }
}

async fn complete_outgoing(ctx: &Arc<HandlerContext>, id: PacketId, reason_code: ReasonCode) {
    if ctx.outgoing_pubs.remove(id).await.is_some() {
        ctx.packet_ids.release(id).await;
        if let Some(Awaiter::Publish(tx)) = ctx.awaiters.lock().await.remove(&id.value()) {
            let _ = tx.send(reason_code);
        }
    } else {
        log::warn!("handler: ack for unknown outgoing packet id {}", id.value());
    }
}

async fn enqueue(send_tx: &Sender<QueuedWrite>, packet: &impl EncodePacket, kind: PacketKind) {
    let mut buf = Vec::new();
    if let Err(e) = packet.encode(&mut buf) {
        log::error!("handler: failed to encode response packet: {e:?}");
        return;
    }
    if send_tx.send(QueuedWrite::plain(buf, kind)).await.is_err() {
        log::warn!("handler: writer channel closed while enqueueing response");
    }
}

async fn enqueue_with_completion(
    send_tx: &Sender<QueuedWrite>,
    packet: &impl EncodePacket,
    kind: PacketKind,
    on_written: crate::writer::WriteCompletion,
) {
    let mut buf = Vec::new();
    if let Err(e) = packet.encode(&mut buf) {
        log::error!("handler: failed to encode response packet: {e:?}");
        return;
    }
    if send_tx
        .send(QueuedWrite::with_completion(buf, kind, on_written))
        .await
        .is_err()
    {
        log::warn!("handler: writer channel closed while enqueueing response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::v5::PublishPacket;
    use tokio::sync::Mutex;

    fn make_context() -> Arc<HandlerContext> {
        Arc::new(HandlerContext {
            outgoing_pubs: BoundedTxnMap::new(16),
            incoming_pubs: BoundedTxnMap::new(16),
            packet_ids: Arc::new(PacketIdStore::new()),
            events: Arc::new(EventRegistry::new()),
            state: Arc::new(StateCell::default()),
            connect_ack_tx: Mutex::new(None),
            awaiters: Mutex::new(HashMap::new()),
        })
    }

    #[tokio::test]
    async fn test_qos1_publish_enqueues_ack() {
        let ctx = make_context();
        let (received_tx, received_rx) = tokio::sync::mpsc::channel(4);
        let (send_tx, mut send_rx) = tokio::sync::mpsc::channel(4);

        let mut packet = PublishPacket::new("a/b", QoS::AtLeastOnce, b"hi").unwrap();
        packet.set_packet_id(PacketId::from(7));
        // The Reader pre-registers incoming QoS>=1 publishes before forwarding.
        ctx.incoming_pubs
            .add(
                PacketId::from(7),
                TransactionChain::new(PublishMessage::from_packet(&packet)),
            )
            .await
            .unwrap();

        received_tx.send(Decoded::Publish(packet)).await.unwrap();
        drop(received_tx);

        let handle = tokio::spawn(run(received_rx, send_tx, Arc::clone(&ctx)));
        let item = send_rx.recv().await.unwrap();
        assert_eq!(item.bytes[0] >> 4, 4); // PUBACK packet type
        assert!(item.on_written.is_some());
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_message_fires_only_after_ack_write_completes() {
        let ctx = make_context();
        let (received_tx, received_rx) = tokio::sync::mpsc::channel(4);
        let (send_tx, mut send_rx) = tokio::sync::mpsc::channel(4);

        let mut packet = PublishPacket::new("a/b", QoS::AtLeastOnce, b"hi").unwrap();
        packet.set_packet_id(PacketId::from(9));
        ctx.incoming_pubs
            .add(
                PacketId::from(9),
                TransactionChain::new(PublishMessage::from_packet(&packet)),
            )
            .await
            .unwrap();

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        ctx.events.on_message(move |_| {
            fired_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        received_tx.send(Decoded::Publish(packet)).await.unwrap();
        drop(received_tx);

        let handle = tokio::spawn(run(received_rx, send_tx, Arc::clone(&ctx)));
        let item = send_rx.recv().await.unwrap();
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));

        item.on_written.unwrap().await;
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        let _ = handle.await;
    }
}
