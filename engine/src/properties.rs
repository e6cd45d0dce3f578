// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::v5::{ConnectAckPacket, Property};
use codec::QoS;

/// Server-advertised capabilities and session parameters, read off the CONNACK
/// properties list. Every field falls back to the MQTT v5 default when the broker
/// omits the corresponding property.
#[derive(Clone, Debug)]
pub struct ConnectionProperties {
    pub topic_alias_maximum: u16,
    pub retain_available: bool,
    pub maximum_qos: QoS,
    pub wildcard_subscription_available: bool,
    pub subscription_identifiers_available: bool,
    pub shared_subscription_available: bool,
    pub receive_maximum: u16,
    pub maximum_packet_size: u32,
    pub assigned_client_id: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub session_expiry_interval: u32,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            topic_alias_maximum: Property::default_topic_alias_maximum(),
            retain_available: true,
            maximum_qos: QoS::ExactOnce,
            wildcard_subscription_available: Property::default_wildcard_subscription_available(),
            subscription_identifiers_available:
                Property::default_subscription_identifier_available(),
            shared_subscription_available: Property::default_shared_subscription_available(),
            receive_maximum: Property::default_receive_maximum(),
            maximum_packet_size: u32::MAX,
            assigned_client_id: None,
            server_keep_alive: None,
            session_expiry_interval: 0,
        }
    }
}

impl ConnectionProperties {
    /// Builds a `ConnectionProperties` by folding every property the broker sent in its
    /// CONNACK over the MQTT v5 defaults.
    #[must_use]
    pub fn from_connect_ack(packet: &ConnectAckPacket) -> Self {
        let mut properties = Self::default();
        for property in packet.properties().props() {
            match property {
                Property::TopicAliasMaximum(v) => properties.topic_alias_maximum = v.value(),
                Property::RetainAvailable(v) => properties.retain_available = v.value(),
                Property::MaximumQoS(v) => properties.maximum_qos = *v,
                Property::WildcardSubscriptionAvailable(v) => {
                    properties.wildcard_subscription_available = v.value();
                }
                Property::SubscriptionIdentifierAvailable(v) => {
                    properties.subscription_identifiers_available = v.value();
                }
                Property::SharedSubscriptionAvailable(v) => {
                    properties.shared_subscription_available = v.value();
                }
                Property::ReceiveMaximum(v) => properties.receive_maximum = v.value(),
                Property::MaximumPacketSize(v) => properties.maximum_packet_size = v.value(),
                Property::AssignedClientIdentifier(v) => {
                    properties.assigned_client_id = Some(v.as_ref().to_string());
                }
                Property::ServerKeepAlive(v) => properties.server_keep_alive = Some(v.value()),
                Property::SessionExpiryInterval(v) => {
                    properties.session_expiry_interval = v.value();
                }
                _ => {}
            }
        }
        properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::v5::ReasonCode;

    #[test]
    fn test_defaults_match_mqtt_v5_spec() {
        let properties = ConnectionProperties::default();
        assert_eq!(properties.topic_alias_maximum, 0);
        assert!(properties.retain_available);
        assert_eq!(properties.maximum_qos, QoS::ExactOnce);
        assert_eq!(properties.receive_maximum, u16::MAX);
    }

    #[test]
    fn test_from_connect_ack_with_no_properties_keeps_defaults() {
        let packet = ConnectAckPacket::new(false, ReasonCode::Success);
        let properties = ConnectionProperties::from_connect_ack(&packet);
        assert!(properties.retain_available);
        assert!(properties.assigned_client_id.is_none());
    }
}
