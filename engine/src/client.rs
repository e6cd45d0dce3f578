// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use codec::v5::{
    ConnectPacket, DisconnectPacket, PingRequestPacket, Property, PublishPacket, ReasonCode,
    RetainHandling, SubscribePacket, SubscribeTopic, UnsubscribePacket,
};
use codec::{
    BinaryData, BoolData, EncodePacket, PubTopic, QoS, StringData, StringPairData, U16Data, U32Data,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::events::{EventRegistry, PacketKind, PublishMessage};
use crate::handler::{self, Awaiter, HandlerContext};
use crate::options::ClientOptions;
use crate::packet_id::PacketIdStore;
use crate::properties::ConnectionProperties;
use crate::publish_writer::{self, OutgoingPublish};
use crate::queue::CHANNEL_CAPACITY;
use crate::reader;
use crate::state::{ConnectionState, StateCell};
use crate::topic_matcher;
use crate::transport::{TcpTransport, Transport};
use crate::txn_map::BoundedTxnMap;
use crate::writer::{self, LastWriteTime, QueuedWrite};

/// One subscription entry, tracked so a future session resumption or diagnostics query
/// can report what the client believes it is subscribed to.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

/// Per-topic flags a caller can request on `subscribe_with_options`, beyond the QoS
/// every subscription already carries.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubscribeOptions {
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

/// Per-message publish properties a caller can attach via `publish_with_options`.
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    pub payload_is_utf8: bool,
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

struct LoopHandles {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    publish_writer: JoinHandle<()>,
    handler: JoinHandle<()>,
    keep_alive: JoinHandle<()>,
}

impl LoopHandles {
    fn abort_all(&self) {
        self.reader.abort();
        self.writer.abort();
        self.publish_writer.abort();
        self.handler.abort();
        self.keep_alive.abort();
    }
}

/// Public handle to one MQTT v5 connection.
///
/// Cloning is intentionally not derived: the connection's loops and the handles that
/// drive them live exactly once, owned by this struct. Callers share a `Client` the way
/// they would any other connection object, by holding it behind an `Arc` if several
/// tasks need to publish concurrently.
pub struct Client {
    options: ClientOptions,
    send_tx: mpsc::Sender<QueuedWrite>,
    publish_tx: mpsc::Sender<OutgoingPublish>,
    packet_ids: Arc<PacketIdStore>,
    events: Arc<EventRegistry>,
    state: Arc<StateCell>,
    last_write: Arc<LastWriteTime>,
    ctx: Arc<HandlerContext>,
    properties: Mutex<ConnectionProperties>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    loops: Mutex<Option<LoopHandles>>,
}

impl Client {
    /// Dials `options.address()` over plain TCP and runs the CONNECT handshake.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Transport` if the socket cannot be established,
    /// `EngineError::Timeout` if no CONNACK arrives within `options.connect_timeout()`,
    /// and `EngineError::Protocol` if the broker rejects the connection.
    pub async fn connect(options: ClientOptions) -> Result<Self, EngineError> {
        let transport = TcpTransport::connect(*options.address()).await?;
        Self::connect_with_transport(options, Box::new(transport)).await
    }

    /// Runs the CONNECT handshake over an already-established transport.
    ///
    /// Exposed so tests (and TLS/WebSocket wrapping performed above this layer) can
    /// supply their own `Transport` impl instead of dialing a real socket.
    ///
    /// # Errors
    ///
    /// See [`Client::connect`].
    pub async fn connect_with_transport(
        options: ClientOptions,
        transport: Box<dyn Transport>,
    ) -> Result<Self, EngineError> {
        let (read_half, write_half) = transport.split();
        let writer = crate::transport::shared_writer(write_half);

        let (received_tx, received_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (send_tx, send_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (publish_tx, publish_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let state = Arc::new(StateCell::new(ConnectionState::Connecting));
        let last_write = Arc::new(LastWriteTime::default());
        let packet_ids = Arc::new(PacketIdStore::new());
        let events = Arc::new(EventRegistry::new());
        let incoming_pubs = BoundedTxnMap::new(usize::from(options.client_receive_maximum()));
        let outgoing_pubs = BoundedTxnMap::new(1);

        let (connect_ack_tx, connect_ack_rx) = oneshot::channel();
        let ctx = Arc::new(HandlerContext {
            outgoing_pubs: Arc::clone(&outgoing_pubs),
            incoming_pubs: Arc::clone(&incoming_pubs),
            packet_ids: Arc::clone(&packet_ids),
            events: Arc::clone(&events),
            state: Arc::clone(&state),
            connect_ack_tx: Mutex::new(Some(connect_ack_tx)),
            awaiters: Mutex::new(HashMap::new()),
        });

        events.fire_before_connect();

        let max_packet_size = options.client_max_packet_size().unwrap_or(u32::MAX);
        let reader_handle = tokio::spawn(reader::run(
            read_half,
            received_tx,
            send_tx.clone(),
            Arc::clone(&ctx),
            max_packet_size,
        ));
        let writer_handle = tokio::spawn(writer::run(
            Arc::clone(&writer),
            send_rx,
            Arc::clone(&last_write),
            Arc::clone(&events),
        ));
        let publish_writer_handle = tokio::spawn(publish_writer::run(
            Arc::clone(&writer),
            publish_rx,
            Arc::clone(&outgoing_pubs),
            Arc::clone(&last_write),
            Arc::clone(&events),
        ));
        let handler_handle = tokio::spawn(handler::run(received_rx, send_tx.clone(), Arc::clone(&ctx)));
        let keep_alive_handle = tokio::spawn(run_keep_alive(
            send_tx.clone(),
            Arc::clone(&last_write),
            Arc::clone(&state),
            options.keep_alive(),
        ));

        let client = Self {
            options: options.clone(),
            send_tx: send_tx.clone(),
            publish_tx,
            packet_ids,
            events,
            state: Arc::clone(&state),
            last_write,
            ctx,
            properties: Mutex::new(ConnectionProperties::default()),
            subscriptions: Mutex::new(HashMap::new()),
            loops: Mutex::new(Some(LoopHandles {
                reader: reader_handle,
                writer: writer_handle,
                publish_writer: publish_writer_handle,
                handler: handler_handle,
                keep_alive: keep_alive_handle,
            })),
        };

        let connect_packet = build_connect_packet(&options)?;
        let mut buf = Vec::new();
        connect_packet.encode(&mut buf)?;
        send_tx
            .send(QueuedWrite::plain(buf, PacketKind::Connect))
            .await
            .map_err(|_err| EngineError::protocol("writer loop gone before CONNECT could be sent"))?;

        let (properties, reason_code) = tokio::time::timeout(options.connect_timeout(), connect_ack_rx)
            .await
            .map_err(|_elapsed| {
                state.set(ConnectionState::Disconnected);
                EngineError::Timeout
            })?
            .map_err(|_err| EngineError::protocol("connection closed while awaiting CONNACK"))?;

        if reason_code != ReasonCode::Success {
            return Err(EngineError::protocol(format!(
                "broker refused connection: {reason_code:?}"
            )));
        }

        log::info!(
            "client: connected, broker receive-maximum {}",
            properties.receive_maximum
        );
        *client.properties.lock().await = properties;
        Ok(client)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    #[must_use]
    pub const fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Capabilities the broker advertised in its CONNACK. Falls back to MQTT v5 defaults
    /// before the handshake completes.
    pub async fn connection_properties(&self) -> ConnectionProperties {
        self.properties.lock().await.clone()
    }

    pub fn on_before_connect(&self, listener: impl FnMut() + Send + 'static) {
        self.events.on_before_connect(listener);
    }

    pub fn on_connect(&self, listener: impl FnMut() + Send + 'static) {
        self.events.on_connect(listener);
    }

    pub fn on_before_disconnect(&self, listener: impl FnMut() + Send + 'static) {
        self.events.on_before_disconnect(listener);
    }

    /// `clean` is `true` for a caller-requested disconnect, `false` for an unexpected
    /// transport loss.
    pub fn on_disconnect(&self, listener: impl FnMut(bool) + Send + 'static) {
        self.events.on_disconnect(listener);
    }

    pub fn on_before_subscribe(&self, listener: impl FnMut(&str) + Send + 'static) {
        self.events.on_before_subscribe(listener);
    }

    pub fn on_after_subscribe(&self, listener: impl FnMut(&str, ReasonCode) + Send + 'static) {
        self.events.on_after_subscribe(listener);
    }

    pub fn on_before_unsubscribe(&self, listener: impl FnMut(&str) + Send + 'static) {
        self.events.on_before_unsubscribe(listener);
    }

    pub fn on_after_unsubscribe(&self, listener: impl FnMut(&str, ReasonCode) + Send + 'static) {
        self.events.on_after_unsubscribe(listener);
    }

    pub fn on_message(&self, listener: impl FnMut(&PublishMessage) + Send + 'static) {
        self.events.on_message(listener);
    }

    pub fn on_publish_sent(&self, listener: impl FnMut(&PublishMessage) + Send + 'static) {
        self.events.on_publish_sent(listener);
    }

    /// Fires once for every packet sent or received on the wire, `Before`/`After` and
    /// per-operation hooks layer the higher-level lifecycle semantics on top of this.
    pub fn on_packet_event(&self, listener: impl FnMut(crate::events::PacketEvent) + Send + 'static) {
        self.events.on_packet_event(listener);
    }

    /// Publishes `payload` to `topic`. For QoS 0 this returns as soon as the message is
    /// queued; for QoS 1/2 it suspends until the broker's final acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Usage` if not connected, `EngineError::Validation` if
    /// `topic` is not a valid publish topic, `EngineError::FeatureUnavailable` if
    /// `retain` is requested but the broker did not advertise `RetainAvailable` or `qos`
    /// exceeds the broker's `MaximumQoS`, or `EngineError::Timeout` if a QoS ≥ 1 publish
    /// is not acknowledged within `options().response_timeout()`.
    pub async fn publish(&self, topic: &str, qos: QoS, payload: &[u8], retain: bool) -> Result<(), EngineError> {
        self.publish_with_options(topic, qos, payload, retain, &PublishOptions::default())
            .await
    }

    /// As [`Client::publish`], additionally attaching the named MQTT v5 PUBLISH
    /// properties.
    ///
    /// # Errors
    ///
    /// See [`Client::publish`].
    pub async fn publish_with_options(
        &self,
        topic: &str,
        qos: QoS,
        payload: &[u8],
        retain: bool,
        options: &PublishOptions,
    ) -> Result<(), EngineError> {
        if !self.is_connected() {
            return Err(EngineError::usage("publish() called while not connected"));
        }

        let properties = self.properties.lock().await.clone();
        if retain && !properties.retain_available {
            return Err(EngineError::feature_unavailable(
                "broker did not advertise RetainAvailable",
            ));
        }
        if qos > properties.maximum_qos {
            return Err(EngineError::feature_unavailable(format!(
                "broker's maximum QoS is {:?}",
                properties.maximum_qos
            )));
        }

        let mut packet = PublishPacket::new(topic, qos, payload)?;
        packet.set_retain(retain);
        apply_publish_options(&mut packet, options)?;

        let (packet_id, wait) = if qos == QoS::AtMostOnce {
            (None, None)
        } else {
            let id = self.packet_ids.acquire().await;
            packet.set_packet_id(id);
            let (tx, rx) = oneshot::channel();
            self.ctx.awaiters.lock().await.insert(id.value(), Awaiter::Publish(tx));
            (Some(id), Some(rx))
        };

        self.publish_tx
            .send(OutgoingPublish { packet, packet_id })
            .await
            .map_err(|_err| EngineError::protocol("publish-writer loop gone"))?;

        let Some(wait) = wait else {
            return Ok(());
        };

        let reason_code = tokio::time::timeout(self.options.response_timeout(), wait)
            .await
            .map_err(|_elapsed| EngineError::Timeout)?
            .map_err(|_err| EngineError::protocol("connection closed while awaiting publish ack"))?;

        if matches!(
            reason_code,
            ReasonCode::Success | ReasonCode::NoMatchingSubscribers
        ) {
            Ok(())
        } else {
            Err(EngineError::protocol(format!("publish rejected: {reason_code:?}")))
        }
    }

    /// Subscribes to `topic` at `qos`, suspending until the broker's SUBACK.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Validation` if `topic` is not a valid topic filter,
    /// `EngineError::Usage` if not connected, `EngineError::FeatureUnavailable` if
    /// `topic` uses a wildcard the broker did not advertise support for or `qos` exceeds
    /// the broker's `MaximumQoS`, `EngineError::Timeout` on no SUBACK within
    /// `options().response_timeout()`.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<ReasonCode, EngineError> {
        self.subscribe_with_options(topic, qos, SubscribeOptions::default())
            .await
    }

    /// As [`Client::subscribe`], additionally requesting the given per-subscription
    /// flags (No Local, Retain As Published, Retain Handling).
    ///
    /// # Errors
    ///
    /// See [`Client::subscribe`].
    pub async fn subscribe_with_options(
        &self,
        topic: &str,
        qos: QoS,
        options: SubscribeOptions,
    ) -> Result<ReasonCode, EngineError> {
        if !topic_matcher::is_valid_filter(topic) {
            return Err(EngineError::validation(format!("invalid topic filter: {topic}")));
        }
        if !self.is_connected() {
            return Err(EngineError::usage("subscribe() called while not connected"));
        }

        let properties = self.properties.lock().await.clone();
        if topic_matcher::is_wildcard_filter(topic) && !properties.wildcard_subscription_available {
            return Err(EngineError::feature_unavailable(
                "broker did not advertise WildcardSubscriptionAvailable",
            ));
        }
        if qos > properties.maximum_qos {
            return Err(EngineError::feature_unavailable(format!(
                "broker's maximum QoS is {:?}",
                properties.maximum_qos
            )));
        }

        self.events.fire_before_subscribe(topic);

        let id = self.packet_ids.acquire().await;
        let mut subscribe_topic = SubscribeTopic::new(topic, qos)?;
        subscribe_topic.set_no_local(options.no_local);
        subscribe_topic.set_retain_as_published(options.retain_as_published);
        subscribe_topic.set_retain_handling(options.retain_handling);
        let mut packet = SubscribePacket::new(topic, qos, id)?;
        packet.set_topics(&[subscribe_topic]);

        let (tx, rx) = oneshot::channel();
        self.ctx.awaiters.lock().await.insert(id.value(), Awaiter::Subscribe(tx));
        self.enqueue_control(&packet, PacketKind::Subscribe).await?;

        let reasons = match tokio::time::timeout(self.options.response_timeout(), rx).await {
            Ok(Ok(reasons)) => reasons,
            Ok(Err(_recv_err)) => {
                return Err(EngineError::protocol("connection closed while awaiting suback"));
            }
            Err(_elapsed) => {
                self.packet_ids.release(id).await;
                return Err(EngineError::Timeout);
            }
        };

        let reason_code = reasons
            .first()
            .copied()
            .ok_or_else(|| EngineError::protocol("SUBACK carried no reason codes"))?;

        self.events.fire_after_subscribe(topic, reason_code);

        if !matches!(
            reason_code,
            ReasonCode::Success | ReasonCode::GrantedQoS1 | ReasonCode::GrantedQoS2
        ) {
            return Err(EngineError::protocol(format!("subscribe rejected: {reason_code:?}")));
        }

        self.subscriptions.lock().await.insert(
            topic.to_string(),
            Subscription {
                qos,
                no_local: options.no_local,
                retain_as_published: options.retain_as_published,
                retain_handling: options.retain_handling,
            },
        );
        Ok(reason_code)
    }

    /// Unsubscribes from `topic`, suspending until the broker's UNSUBACK.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Usage` if not connected or `topic` is not currently
    /// subscribed; `EngineError::Timeout` on no UNSUBACK within
    /// `options().response_timeout()`.
    pub async fn unsubscribe(&self, topic: &str) -> Result<ReasonCode, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::usage("unsubscribe() called while not connected"));
        }
        if !self.subscriptions.lock().await.contains_key(topic) {
            return Err(EngineError::usage(format!("not subscribed to {topic}")));
        }

        self.events.fire_before_unsubscribe(topic);

        let id = self.packet_ids.acquire().await;
        let packet = UnsubscribePacket::new(topic, id)?;

        let (tx, rx) = oneshot::channel();
        self.ctx.awaiters.lock().await.insert(id.value(), Awaiter::Unsubscribe(tx));
        self.enqueue_control(&packet, PacketKind::Unsubscribe).await?;

        let reasons = match tokio::time::timeout(self.options.response_timeout(), rx).await {
            Ok(Ok(reasons)) => reasons,
            Ok(Err(_recv_err)) => {
                return Err(EngineError::protocol("connection closed while awaiting unsuback"));
            }
            Err(_elapsed) => {
                self.packet_ids.release(id).await;
                return Err(EngineError::Timeout);
            }
        };

        let reason_code = reasons
            .first()
            .copied()
            .ok_or_else(|| EngineError::protocol("UNSUBACK carried no reason codes"))?;

        self.events.fire_after_unsubscribe(topic, reason_code);
        self.subscriptions.lock().await.remove(topic);
        Ok(reason_code)
    }

    /// Requests an orderly disconnect: sends DISCONNECT, waits (bounded) for the Writer
    /// to actually flush it, then tears down the loops and drains every piece of
    /// in-flight state the connection was carrying before firing
    /// `AfterDisconnect(clean=true)`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Usage` if already disconnected.
    pub async fn disconnect(&self) -> Result<(), EngineError> {
        if self.state.get() == ConnectionState::Disconnected {
            return Err(EngineError::usage("already disconnected"));
        }
        self.events.fire_before_disconnect();
        self.state.set(ConnectionState::Disconnecting);

        let mut packet = DisconnectPacket::new();
        // `Success` (0x00) doubles as "Normal disconnection" for DISCONNECT packets.
        packet.set_reason_code(ReasonCode::Success);
        let mut buf = Vec::new();
        if packet.encode(&mut buf).is_ok() {
            let (sent_tx, sent_rx) = oneshot::channel();
            let queued = QueuedWrite::with_completion(
                buf,
                PacketKind::Disconnect,
                Box::pin(async move {
                    let _ = sent_tx.send(());
                }),
            );
            if self.send_tx.send(queued).await.is_ok() {
                // Await OnDisconnectSent, bounded so a dead Writer can't hang forever.
                let _ = tokio::time::timeout(self.options.response_timeout(), sent_rx).await;
            }
        }

        if let Some(loops) = self.loops.lock().await.take() {
            loops.abort_all();
        }

        self.ctx.outgoing_pubs.clear().await;
        self.ctx.incoming_pubs.clear().await;
        self.ctx.awaiters.lock().await.clear();
        self.packet_ids.release_all().await;
        self.subscriptions.lock().await.clear();

        self.state.set(ConnectionState::Disconnected);
        self.events.fire_disconnect(true);
        Ok(())
    }

    async fn enqueue_control(&self, packet: &impl EncodePacket, kind: PacketKind) -> Result<(), EngineError> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.send_tx
            .send(QueuedWrite::plain(buf, kind))
            .await
            .map_err(|_err| EngineError::protocol("writer loop gone"))
    }
}

fn apply_publish_options(packet: &mut PublishPacket, options: &PublishOptions) -> Result<(), EngineError> {
    let properties = packet.properties_mut();
    if options.payload_is_utf8 {
        properties.push(Property::PayloadFormatIndicator(BoolData::new(true)))?;
    }
    if let Some(interval) = options.message_expiry_interval {
        properties.push(Property::MessageExpiryInterval(U32Data::new(interval)))?;
    }
    if let Some(alias) = options.topic_alias {
        properties.push(Property::TopicAlias(U16Data::new(alias)))?;
    }
    if let Some(response_topic) = &options.response_topic {
        properties.push(Property::ResponseTopic(PubTopic::new(response_topic)?))?;
    }
    if let Some(correlation_data) = &options.correlation_data {
        properties.push(Property::CorrelationData(BinaryData::from_slice(correlation_data)?))?;
    }
    if let Some(content_type) = &options.content_type {
        let content_type = StringData::from(content_type)
            .map_err(|_err| EngineError::validation("content type is not valid UTF-8/length"))?;
        properties.push(Property::ContentType(content_type))?;
    }
    for (key, value) in &options.user_properties {
        properties.push(Property::UserProperty(StringPairData::new(key, value)?))?;
    }
    Ok(())
}

/// Wakes every `keep_alive / 2` seconds (minimum one second) and enqueues a PINGREQ if
/// nothing has been written to the transport since the last wake-up. A `keep_alive` of
/// zero disables the mechanism entirely, matching the MQTT v5 spec.
async fn run_keep_alive(
    send_tx: mpsc::Sender<QueuedWrite>,
    last_write: Arc<LastWriteTime>,
    state: Arc<StateCell>,
    keep_alive_secs: u16,
) {
    if keep_alive_secs == 0 {
        return;
    }
    let interval_secs = u64::from(keep_alive_secs / 2).max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !state.is_connected() {
            continue;
        }
        if last_write.elapsed_secs() < interval_secs {
            continue;
        }
        let mut buf = Vec::new();
        if let Err(e) = PingRequestPacket::new().encode(&mut buf) {
            log::error!("client: failed to encode PINGREQ: {e:?}");
            continue;
        }
        if send_tx
            .send(QueuedWrite::plain(buf, PacketKind::PingRequest))
            .await
            .is_err()
        {
            log::warn!("client: writer loop gone, stopping keep-alive");
            return;
        }
    }
}

fn build_connect_packet(options: &ClientOptions) -> Result<ConnectPacket, EngineError> {
    let mut packet = ConnectPacket::new(options.client_id())?;
    packet.set_keep_alive(options.keep_alive());
    packet.set_clean_session(options.clean_start());
    packet.set_username(options.username())?;
    packet.set_password(options.password().map(str::as_bytes))?;

    if let Some(will) = options.last_will() {
        packet.set_will(true);
        packet.set_will_qos(will.qos);
        packet.set_will_retain(will.retain);
        packet.set_will_topic(&will.topic)?;
        packet.set_will_message(&will.payload)?;
        if will.delay_interval != 0 {
            packet
                .will_properties_mut()
                .push(Property::WillDelayInterval(U32Data::new(will.delay_interval)))?;
        }
    }

    let properties = packet.properties_mut();
    properties.push(Property::SessionExpiryInterval(U32Data::new(
        options.session_expiry_interval(),
    )))?;
    properties.push(Property::ReceiveMaximum(U16Data::new(options.client_receive_maximum())))?;
    properties.push(Property::TopicAliasMaximum(U16Data::new(
        options.client_topic_alias_maximum(),
    )))?;
    properties.push(Property::RequestResponseInformation(BoolData::new(
        options.request_response_information(),
    )))?;
    properties.push(Property::RequestProblemInformation(BoolData::new(
        options.request_problem_information(),
    )))?;
    if let Some(size) = options.client_max_packet_size() {
        properties.push(Property::MaximumPacketSize(U32Data::new(size)))?;
    }
    if let Some(method) = options.authentication_method() {
        let method = StringData::from(method)
            .map_err(|_err| EngineError::validation("authentication method is not valid UTF-8/length"))?;
        properties.push(Property::AuthenticationMethod(method))?;
        if !options.authentication_data().is_empty() {
            properties.push(Property::AuthenticationData(BinaryData::from_slice(
                options.authentication_data(),
            )?))?;
        }
    }
    for (key, value) in options.user_properties().as_slice() {
        properties.push(Property::UserProperty(StringPairData::new(key, value)?))?;
    }

    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DuplexTransport;
    use codec::v5::ConnectAckPacket;

    #[tokio::test]
    async fn test_connect_success_reaches_connected_state() {
        let (engine_side, mut broker_side) = DuplexTransport::pair(4096);
        let mut options = ClientOptions::default();
        options.set_connect_timeout(Duration::from_secs(2));

        let connect_task = tokio::spawn(Client::connect_with_transport(options, Box::new(engine_side)));

        // Drain the CONNECT bytes the client just wrote, then answer with a CONNACK.
        let mut probe = [0_u8; 512];
        let n = broker_side.read(&mut probe).await.unwrap();
        assert!(n > 0);
        assert_eq!(probe[0] >> 4, 1); // CONNECT packet type

        let mut ack_bytes = Vec::new();
        ConnectAckPacket::new(false, ReasonCode::Success)
            .encode(&mut ack_bytes)
            .unwrap();
        broker_side.write_all(&ack_bytes).await.unwrap();

        let client = connect_task.await.unwrap().unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused_surfaces_protocol_error() {
        let (engine_side, mut broker_side) = DuplexTransport::pair(4096);
        let options = ClientOptions::default();

        let connect_task = tokio::spawn(Client::connect_with_transport(options, Box::new(engine_side)));

        let mut probe = [0_u8; 512];
        broker_side.read(&mut probe).await.unwrap();

        let mut ack_bytes = Vec::new();
        ConnectAckPacket::new(false, ReasonCode::UnspecifiedError)
            .encode(&mut ack_bytes)
            .unwrap();
        broker_side.write_all(&ack_bytes).await.unwrap();

        let result = connect_task.await.unwrap();
        assert!(matches!(result, Err(EngineError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_publish_qos0_returns_without_waiting_for_ack() {
        let (engine_side, mut broker_side) = DuplexTransport::pair(4096);
        let options = ClientOptions::default();
        let connect_task = tokio::spawn(Client::connect_with_transport(options, Box::new(engine_side)));

        let mut probe = [0_u8; 512];
        broker_side.read(&mut probe).await.unwrap();
        let mut ack_bytes = Vec::new();
        ConnectAckPacket::new(false, ReasonCode::Success)
            .encode(&mut ack_bytes)
            .unwrap();
        broker_side.write_all(&ack_bytes).await.unwrap();

        let client = connect_task.await.unwrap().unwrap();
        client.publish("a/b", QoS::AtMostOnce, b"hi", false).await.unwrap();

        let mut buf = [0_u8; 64];
        let n = broker_side.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(buf[0] >> 4, 3); // PUBLISH packet type
    }

    #[tokio::test]
    async fn test_publish_retain_without_retain_available_is_feature_unavailable() {
        let (engine_side, mut broker_side) = DuplexTransport::pair(4096);
        let options = ClientOptions::default();
        let connect_task = tokio::spawn(Client::connect_with_transport(options, Box::new(engine_side)));

        let mut probe = [0_u8; 512];
        broker_side.read(&mut probe).await.unwrap();
        let mut ack_bytes = Vec::new();
        let mut ack = ConnectAckPacket::new(false, ReasonCode::Success);
        ack.properties_mut()
            .push(Property::RetainAvailable(BoolData::new(false)))
            .unwrap();
        ack.encode(&mut ack_bytes).unwrap();
        broker_side.write_all(&ack_bytes).await.unwrap();

        let client = connect_task.await.unwrap().unwrap();
        let result = client.publish("a/b", QoS::AtMostOnce, b"hi", true).await;
        assert!(matches!(result, Err(EngineError::FeatureUnavailable(_))));
    }

    #[tokio::test]
    async fn test_subscribe_wildcard_without_broker_support_is_feature_unavailable() {
        let (engine_side, mut broker_side) = DuplexTransport::pair(4096);
        let options = ClientOptions::default();
        let connect_task = tokio::spawn(Client::connect_with_transport(options, Box::new(engine_side)));

        let mut probe = [0_u8; 512];
        broker_side.read(&mut probe).await.unwrap();
        let mut ack_bytes = Vec::new();
        let mut ack = ConnectAckPacket::new(false, ReasonCode::Success);
        ack.properties_mut()
            .push(Property::WildcardSubscriptionAvailable(BoolData::new(false)))
            .unwrap();
        ack.encode(&mut ack_bytes).unwrap();
        broker_side.write_all(&ack_bytes).await.unwrap();

        let client = connect_task.await.unwrap().unwrap();
        let result = client.subscribe("a/+/c", QoS::AtMostOnce).await;
        assert!(matches!(result, Err(EngineError::FeatureUnavailable(_))));
    }
}
