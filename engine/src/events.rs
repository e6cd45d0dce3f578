// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::Mutex;

use codec::v5::{Property, PublishPacket, ReasonCode};
use codec::{PacketId, QoS};

/// Application-facing view of an incoming or outgoing application message, decoupled
/// from the wire packet it was decoded from or will be encoded into.
#[derive(Clone, Debug, Default)]
pub struct PublishMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub packet_id: Option<PacketId>,
    pub payload_is_utf8: bool,
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub user_properties: Vec<(String, String)>,
    pub subscription_identifiers: Vec<u32>,
}

impl PublishMessage {
    #[must_use]
    pub fn from_packet(packet: &PublishPacket) -> Self {
        let packet_id = if packet.qos() == QoS::AtMostOnce {
            None
        } else {
            Some(packet.packet_id())
        };
        let mut message = Self {
            topic: packet.topic().to_string(),
            payload: packet.message().to_vec(),
            qos: packet.qos(),
            retain: packet.retain(),
            packet_id,
            ..Self::default()
        };
        for property in packet.properties().props() {
            match property {
                Property::PayloadFormatIndicator(v) => message.payload_is_utf8 = v.value(),
                Property::MessageExpiryInterval(v) => message.message_expiry_interval = Some(v.value()),
                Property::TopicAlias(v) => message.topic_alias = Some(v.value()),
                Property::ResponseTopic(v) => message.response_topic = Some(v.as_ref().to_string()),
                Property::CorrelationData(v) => message.correlation_data = Some(v.as_ref().to_vec()),
                Property::ContentType(v) => message.content_type = Some(v.as_ref().to_string()),
                Property::UserProperty(v) => {
                    message
                        .user_properties
                        .push((v.key().as_ref().to_string(), v.value().as_ref().to_string()));
                }
                Property::SubscriptionIdentifier(v) => {
                    message.subscription_identifiers.push(v.value() as u32);
                }
                _ => {}
            }
        }
        message
    }
}

/// Identifies an MQTT control packet type for the generic sent/received event hook.
/// Covers every packet type the engine ever puts on the wire or decodes off it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    ConnectAck,
    Publish,
    PublishAck,
    PublishReceived,
    PublishRelease,
    PublishComplete,
    Subscribe,
    SubscribeAck,
    Unsubscribe,
    UnsubscribeAck,
    PingRequest,
    PingResponse,
    Disconnect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketDirection {
    Sent,
    Received,
}

#[derive(Clone, Copy, Debug)]
pub struct PacketEvent {
    pub kind: PacketKind,
    pub direction: PacketDirection,
}

type VoidListener = Box<dyn FnMut() + Send>;
type DisconnectListener = Box<dyn FnMut(bool) + Send>;
type MessageListener = Box<dyn FnMut(&PublishMessage) + Send>;
type TopicListener = Box<dyn FnMut(&str) + Send>;
type SubscribeResultListener = Box<dyn FnMut(&str, ReasonCode) + Send>;
type PacketEventListener = Box<dyn FnMut(PacketEvent) + Send>;

/// Registry of callbacks the public client API lets callers attach.
///
/// Each list is mutated only by the matching `on_*` registration method, never during
/// dispatch; the loops only ever read it while invoking listeners, so the lock is held
/// for the span of one registration call or one dispatch pass, not across an `await`.
#[derive(Default)]
pub struct EventRegistry {
    before_connect: Mutex<Vec<VoidListener>>,
    connect: Mutex<Vec<VoidListener>>,
    before_disconnect: Mutex<Vec<VoidListener>>,
    disconnect: Mutex<Vec<DisconnectListener>>,
    before_subscribe: Mutex<Vec<TopicListener>>,
    after_subscribe: Mutex<Vec<SubscribeResultListener>>,
    before_unsubscribe: Mutex<Vec<TopicListener>>,
    after_unsubscribe: Mutex<Vec<SubscribeResultListener>>,
    message: Mutex<Vec<MessageListener>>,
    publish_sent: Mutex<Vec<MessageListener>>,
    packet: Mutex<Vec<PacketEventListener>>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_connect(&self, listener: impl FnMut() + Send + 'static) {
        lock(&self.before_connect).push(Box::new(listener));
    }

    pub fn on_connect(&self, listener: impl FnMut() + Send + 'static) {
        lock(&self.connect).push(Box::new(listener));
    }

    pub fn on_before_disconnect(&self, listener: impl FnMut() + Send + 'static) {
        lock(&self.before_disconnect).push(Box::new(listener));
    }

    pub fn on_disconnect(&self, listener: impl FnMut(bool) + Send + 'static) {
        lock(&self.disconnect).push(Box::new(listener));
    }

    pub fn on_before_subscribe(&self, listener: impl FnMut(&str) + Send + 'static) {
        lock(&self.before_subscribe).push(Box::new(listener));
    }

    pub fn on_after_subscribe(&self, listener: impl FnMut(&str, ReasonCode) + Send + 'static) {
        lock(&self.after_subscribe).push(Box::new(listener));
    }

    pub fn on_before_unsubscribe(&self, listener: impl FnMut(&str) + Send + 'static) {
        lock(&self.before_unsubscribe).push(Box::new(listener));
    }

    pub fn on_after_unsubscribe(&self, listener: impl FnMut(&str, ReasonCode) + Send + 'static) {
        lock(&self.after_unsubscribe).push(Box::new(listener));
    }

    pub fn on_message(&self, listener: impl FnMut(&PublishMessage) + Send + 'static) {
        lock(&self.message).push(Box::new(listener));
    }

    pub fn on_publish_sent(&self, listener: impl FnMut(&PublishMessage) + Send + 'static) {
        lock(&self.publish_sent).push(Box::new(listener));
    }

    pub fn on_packet_event(&self, listener: impl FnMut(PacketEvent) + Send + 'static) {
        lock(&self.packet).push(Box::new(listener));
    }

    pub fn fire_before_connect(&self) {
        fire0(&self.before_connect);
    }

    pub fn fire_connect(&self) {
        fire0(&self.connect);
    }

    pub fn fire_before_disconnect(&self) {
        fire0(&self.before_disconnect);
    }

    /// `clean` mirrors the `AfterDisconnect(clean: bool)` lifecycle event: `true` for a
    /// caller-requested disconnect, `false` for an unexpected transport loss.
    pub fn fire_disconnect(&self, clean: bool) {
        for listener in lock(&self.disconnect).iter_mut() {
            listener(clean);
        }
    }

    pub fn fire_before_subscribe(&self, topic: &str) {
        for listener in lock(&self.before_subscribe).iter_mut() {
            listener(topic);
        }
    }

    pub fn fire_after_subscribe(&self, topic: &str, reason_code: ReasonCode) {
        for listener in lock(&self.after_subscribe).iter_mut() {
            listener(topic, reason_code);
        }
    }

    pub fn fire_before_unsubscribe(&self, topic: &str) {
        for listener in lock(&self.before_unsubscribe).iter_mut() {
            listener(topic);
        }
    }

    pub fn fire_after_unsubscribe(&self, topic: &str, reason_code: ReasonCode) {
        for listener in lock(&self.after_unsubscribe).iter_mut() {
            listener(topic, reason_code);
        }
    }

    pub fn fire_publish_sent(&self, packet: &codec::v5::PublishPacket) {
        let message = PublishMessage::from_packet(packet);
        for listener in lock(&self.publish_sent).iter_mut() {
            listener(&message);
        }
    }

    pub fn fire_message(&self, message: &PublishMessage) {
        for listener in lock(&self.message).iter_mut() {
            listener(message);
        }
    }

    pub fn fire_packet_event(&self, event: PacketEvent) {
        for listener in lock(&self.packet).iter_mut() {
            listener(event);
        }
    }
}

fn fire0(list: &Mutex<Vec<VoidListener>>) {
    for listener in lock(list).iter_mut() {
        listener();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fire_connect_invokes_registered_listeners() {
        let registry = EventRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        registry.on_connect(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        registry.fire_connect();
        registry.fire_connect();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fire_message_passes_payload() {
        let registry = EventRegistry::new();
        let received = Arc::new(Mutex::new(None));
        let received_clone = Arc::clone(&received);
        registry.on_message(move |message| {
            *received_clone.lock().unwrap() = Some(message.topic.clone());
        });
        let message = PublishMessage {
            topic: "a/b".to_string(),
            payload: vec![1, 2, 3],
            qos: QoS::AtMostOnce,
            ..PublishMessage::default()
        };
        registry.fire_message(&message);
        assert_eq!(received.lock().unwrap().as_deref(), Some("a/b"));
    }

    #[test]
    fn test_after_subscribe_carries_topic_and_reason() {
        let registry = EventRegistry::new();
        let received = Arc::new(Mutex::new(None));
        let received_clone = Arc::clone(&received);
        registry.on_after_subscribe(move |topic, reason| {
            *received_clone.lock().unwrap() = Some((topic.to_string(), reason));
        });
        registry.fire_after_subscribe("a/b", ReasonCode::GrantedQoS1);
        assert_eq!(
            received.lock().unwrap().clone(),
            Some(("a/b".to_string(), ReasonCode::GrantedQoS1))
        );
    }

    #[test]
    fn test_packet_event_reports_kind_and_direction() {
        let registry = EventRegistry::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        registry.on_packet_event(move |event| {
            received_clone.lock().unwrap().push(event.kind);
        });
        registry.fire_packet_event(PacketEvent {
            kind: PacketKind::PingRequest,
            direction: PacketDirection::Sent,
        });
        assert_eq!(received.lock().unwrap().as_slice(), &[PacketKind::PingRequest]);
    }
}
