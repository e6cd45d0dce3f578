// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::Arc;

use codec::v5::{DisconnectPacket, ReasonCode};
use codec::{EncodePacket, QoS};
use tokio::sync::mpsc::Sender;

use crate::events::{PacketDirection, PacketEvent, PacketKind, PublishMessage};
use crate::framer::{self, Decoded, FrameResult};
use crate::handler::{self, HandlerContext};
use crate::state::ConnectionState;
use crate::transport::TransportReader;
use crate::txn_map::TransactionChain;
use crate::writer::QueuedWrite;

const READ_BUF_SIZE: usize = 4096;

/// Runs until the transport closes, a malformed packet is seen, or a DISCONNECT is
/// received from the broker.
///
/// Decoded control packets are forwarded to `received_tx`. Incoming QoS ≥ 1 publishes
/// are pre-registered in `incoming_pubs` before being forwarded, so the Handler loop
/// never has to race the Reader to create the chain.
///
/// Owns its read half exclusively: unlike the Writer, this loop never shares a lock with
/// anything else, which is what lets it sit blocked in `read` between packets without
/// starving outgoing writes.
///
/// On an unexpected transport loss (`Ok(0)` or a read error) this is the loop that runs
/// connection-loss recovery: flips `ConnectionState` to `Disconnected`, fires
/// `AfterDisconnect(clean=false)` and abandons every in-flight awaiter, per §4.8.
pub async fn run(
    mut transport: Box<dyn TransportReader>,
    received_tx: Sender<Decoded>,
    send_tx: Sender<QueuedWrite>,
    ctx: Arc<HandlerContext>,
    max_packet_size: u32,
) {
    let mut buffer = Vec::new();
    let mut read_buf = vec![0_u8; READ_BUF_SIZE];

    loop {
        let read_result = transport.read(&mut read_buf).await;
        match read_result {
            Ok(0) => {
                log::warn!("reader: transport closed by peer");
                handler::handle_connection_loss(&ctx).await;
                return;
            }
            Ok(n) => buffer.extend_from_slice(&read_buf[..n]),
            Err(e) => {
                log::error!("reader: transport read failed: {e}");
                handler::handle_connection_loss(&ctx).await;
                return;
            }
        }

        loop {
            match framer::try_decode(&buffer) {
                FrameResult::NeedMore => break,
                FrameResult::Malformed => {
                    log::error!("reader: malformed packet, disconnecting");
                    send_disconnect(&send_tx, ReasonCode::MalformedPacket).await;
                    return;
                }
                FrameResult::Packet { decoded, consumed } => {
                    if consumed > max_packet_size as usize {
                        log::error!("reader: packet of {consumed} bytes exceeds configured maximum");
                        send_disconnect(&send_tx, ReasonCode::PacketTooLarge).await;
                        return;
                    }
                    buffer.drain(..consumed);

                    ctx.events.fire_packet_event(PacketEvent {
                        kind: decoded.kind(),
                        direction: PacketDirection::Received,
                    });

                    if let Decoded::Disconnect(packet) = &decoded {
                        log::info!(
                            "reader: broker sent DISCONNECT, reason {:?}",
                            packet.reason_code()
                        );
                        ctx.state.set(ConnectionState::Disconnected);
                        if received_tx.send(decoded).await.is_err() {
                            log::warn!("reader: handler channel closed while forwarding DISCONNECT");
                        }
                        return;
                    }

                    if let Decoded::Publish(publish) = &decoded {
                        if publish.qos() != QoS::AtMostOnce {
                            let id = publish.packet_id();
                            let message = PublishMessage::from_packet(publish);
                            let chain = TransactionChain::new(message);
                            if ctx.incoming_pubs.add(id, chain).await.is_err() {
                                log::error!(
                                    "reader: duplicate incoming packet id {} violates flow control",
                                    id.value()
                                );
                                send_disconnect(&send_tx, ReasonCode::UnspecifiedError).await;
                                return;
                            }
                        }
                    }

                    if received_tx.send(decoded).await.is_err() {
                        log::warn!("reader: handler channel closed, stopping");
                        return;
                    }
                }
            }
        }
    }
}

async fn send_disconnect(send_tx: &Sender<QueuedWrite>, reason_code: ReasonCode) {
    let mut packet = DisconnectPacket::new();
    packet.set_reason_code(reason_code);
    let mut buf = Vec::new();
    if let Err(e) = packet.encode(&mut buf) {
        log::error!("reader: failed to encode DISCONNECT: {e:?}");
        return;
    }
    if send_tx
        .send(QueuedWrite::plain(buf, PacketKind::Disconnect))
        .await
        .is_err()
    {
        log::warn!("reader: writer channel closed while sending DISCONNECT");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventRegistry;
    use crate::packet_id::PacketIdStore;
    use crate::state::StateCell;
    use crate::transport::DuplexTransport;
    use crate::txn_map::BoundedTxnMap;
    use std::collections::HashMap;
    use tokio::sync::{mpsc, oneshot, Mutex};

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
    async fn test_ping_response_is_forwarded() {
        let (engine_side, mut broker_side) = DuplexTransport::pair(256);
        let (read_half, _write_half) = Box::new(engine_side).split();
        let (received_tx, mut received_rx) = mpsc::channel(4);
        let (send_tx, _send_rx) = mpsc::channel(4);
        let ctx = make_context();

        let handle = tokio::spawn(run(read_half, received_tx, send_tx, Arc::clone(&ctx), 1024 * 1024));

        broker_side.write_all(&[0xd0, 0x00]).await.unwrap();

        let decoded = received_rx.recv().await.unwrap();
        assert!(matches!(decoded, Decoded::PingResponse(_)));

        drop(broker_side);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_peer_close_runs_connection_loss_recovery() {
        let (engine_side, broker_side) = DuplexTransport::pair(256);
        let (read_half, _write_half) = Box::new(engine_side).split();
        let (received_tx, _received_rx) = mpsc::channel(4);
        let (send_tx, _send_rx) = mpsc::channel(4);
        let ctx = make_context();
        ctx.state.set(ConnectionState::Connected);

        let (awaiter_tx, awaiter_rx) = oneshot::channel();
        ctx.awaiters
            .lock()
            .await
            .insert(1, crate::handler::Awaiter::Publish(awaiter_tx));

        let disconnected = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let disconnected_clone = Arc::clone(&disconnected);
        ctx.events.on_disconnect(move |clean| {
            disconnected_clone.store(clean, std::sync::atomic::Ordering::SeqCst);
        });

        drop(broker_side);

        run(read_half, received_tx, send_tx, Arc::clone(&ctx), 1024 * 1024).await;

        assert_eq!(ctx.state.get(), ConnectionState::Disconnected);
        assert!(!disconnected.load(std::sync::atomic::Ordering::SeqCst));
        assert!(awaiter_rx.await.is_err());
    }
}
