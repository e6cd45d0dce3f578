// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::v5::{
    ConnectAckPacket, DisconnectPacket, PacketType, PingResponsePacket, PublishAckPacket,
    PublishCompletePacket, PublishPacket, PublishReceivedPacket, PublishReleasePacket,
    SubscribeAckPacket, UnsubscribeAckPacket,
};
use codec::{ByteArray, DecodePacket};

use crate::events::PacketKind;

/// One fully decoded, broker-to-client packet, tagged with its type.
///
/// The engine never decodes client-to-broker packet types (Connect, Subscribe,
/// Unsubscribe, PingRequest) off the wire, so the Framer does not attempt to recognise
/// them; seeing one is itself a protocol violation.
#[derive(Debug)]
pub enum Decoded {
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    SubscribeAck(SubscribeAckPacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
}

impl Decoded {
    #[must_use]
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::ConnectAck(_) => PacketKind::ConnectAck,
            Self::Publish(_) => PacketKind::Publish,
            Self::PublishAck(_) => PacketKind::PublishAck,
            Self::PublishReceived(_) => PacketKind::PublishReceived,
            Self::PublishRelease(_) => PacketKind::PublishRelease,
            Self::PublishComplete(_) => PacketKind::PublishComplete,
            Self::SubscribeAck(_) => PacketKind::SubscribeAck,
            Self::UnsubscribeAck(_) => PacketKind::UnsubscribeAck,
            Self::PingResponse(_) => PacketKind::PingResponse,
            Self::Disconnect(_) => PacketKind::Disconnect,
        }
    }
}

/// Outcome of one framing attempt over a contiguous receive buffer.
pub enum FrameResult {
    /// A packet was decoded; `consumed` bytes should be dropped from the front of the
    /// buffer before the next call.
    Packet { decoded: Decoded, consumed: usize },
    /// The buffer does not yet contain a full packet. No bytes were consumed.
    NeedMore,
    /// The buffer's head is not a valid MQTT v5 packet and the connection must close.
    Malformed,
}

/// Attempts to decode exactly one packet off the front of `buffer`.
///
/// Never panics and never consumes partial packets: on `NeedMore` the caller should
/// read more bytes and retry with the same, unmodified buffer content.
#[must_use]
pub fn try_decode(buffer: &[u8]) -> FrameResult {
    if buffer.is_empty() {
        return FrameResult::NeedMore;
    }

    let mut probe = ByteArray::new(buffer);
    let type_flags = match probe.read_byte() {
        Ok(byte) => byte,
        Err(_) => return FrameResult::NeedMore,
    };
    let packet_type = match PacketType::try_from(type_flags) {
        Ok(packet_type) => packet_type,
        Err(_) => return FrameResult::Malformed,
    };

    let remaining_length = match read_remaining_length(&mut probe) {
        RemainingLengthResult::Complete(value) => value,
        RemainingLengthResult::Incomplete => return FrameResult::NeedMore,
        RemainingLengthResult::Overlong => return FrameResult::Malformed,
    };

    let header_len = probe.offset();
    let total_len = header_len + remaining_length;
    if buffer.len() < total_len {
        return FrameResult::NeedMore;
    }

    let mut ba = ByteArray::new(&buffer[..total_len]);
    let decoded = match packet_type {
        PacketType::ConnectAck => ConnectAckPacket::decode(&mut ba).map(Decoded::ConnectAck),
        PacketType::Publish { .. } => PublishPacket::decode(&mut ba).map(Decoded::Publish),
        PacketType::PublishAck => PublishAckPacket::decode(&mut ba).map(Decoded::PublishAck),
        PacketType::PublishReceived => {
            PublishReceivedPacket::decode(&mut ba).map(Decoded::PublishReceived)
        }
        PacketType::PublishRelease => {
            PublishReleasePacket::decode(&mut ba).map(Decoded::PublishRelease)
        }
        PacketType::PublishComplete => {
            PublishCompletePacket::decode(&mut ba).map(Decoded::PublishComplete)
        }
        PacketType::SubscribeAck => SubscribeAckPacket::decode(&mut ba).map(Decoded::SubscribeAck),
        PacketType::UnsubscribeAck => {
            UnsubscribeAckPacket::decode(&mut ba).map(Decoded::UnsubscribeAck)
        }
        PacketType::PingResponse => PingResponsePacket::decode(&mut ba).map(Decoded::PingResponse),
        PacketType::Disconnect => DisconnectPacket::decode(&mut ba).map(Decoded::Disconnect),
        PacketType::Connect
        | PacketType::Subscribe
        | PacketType::Unsubscribe
        | PacketType::PingRequest
        | PacketType::Auth => {
            log::error!("framer: received client-only packet type {packet_type:?} from broker");
            return FrameResult::Malformed;
        }
    };

    match decoded {
        Ok(decoded) => FrameResult::Packet {
            decoded,
            consumed: total_len,
        },
        Err(e) => {
            log::error!("framer: failed to decode {packet_type:?}: {e:?}");
            FrameResult::Malformed
        }
    }
}

/// Outcome of reading the variable-byte remaining-length integer.
enum RemainingLengthResult {
    /// A full, valid varint was read.
    Complete(usize),
    /// The buffer ran out before the continuation bit cleared; wait for more bytes.
    Incomplete,
    /// All 4 bytes were present and the 4th still had its continuation bit set, which
    /// the MQTT v5 variable byte integer format forbids (max 4 bytes). This is a
    /// malformed packet, not a truncated one.
    Overlong,
}

fn read_remaining_length(ba: &mut ByteArray) -> RemainingLengthResult {
    let mut multiplier: usize = 1;
    let mut value: usize = 0;
    for i in 0..4 {
        let byte = match ba.read_byte() {
            Ok(byte) => byte,
            Err(_) => return RemainingLengthResult::Incomplete,
        };
        value += usize::from(byte & 0x7f) * multiplier;
        if byte & 0x80 == 0 {
            return RemainingLengthResult::Complete(value);
        }
        if i == 3 {
            return RemainingLengthResult::Overlong;
        }
        multiplier *= 128;
    }
    unreachable!("loop always returns on its 4th iteration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer_needs_more() {
        assert!(matches!(try_decode(&[]), FrameResult::NeedMore));
    }

    #[test]
    fn test_truncated_header_needs_more() {
        assert!(matches!(try_decode(&[0xd0]), FrameResult::NeedMore));
    }

    #[test]
    fn test_reserved_type_zero_is_malformed() {
        assert!(matches!(try_decode(&[0x00, 0x00]), FrameResult::Malformed));
    }

    #[test]
    fn test_ping_response_round_trip() {
        let buf = [0xd0, 0x00];
        match try_decode(&buf) {
            FrameResult::Packet { decoded, consumed } => {
                assert_eq!(consumed, 2);
                assert!(matches!(decoded, Decoded::PingResponse(_)));
            }
            _ => panic!("expected a decoded packet"),
        }
    }

    #[test]
    fn test_declared_body_not_yet_arrived_needs_more() {
        // PINGRESP claims 2 bytes of body that are not actually present.
        let buf = [0xd0, 0x02, 0x00];
        assert!(matches!(try_decode(&buf), FrameResult::NeedMore));
    }

    #[test]
    fn test_overlong_remaining_length_is_malformed() {
        // 4 continuation-flagged bytes with no terminator is an invalid 5-byte prefix.
        let buf = [0x30, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(try_decode(&buf), FrameResult::Malformed));
    }

    #[test]
    fn test_client_only_packet_is_malformed() {
        // CONNECT fixed header type byte (0x10) arriving from the broker.
        let buf = [0x10, 0x00];
        assert!(matches!(try_decode(&buf), FrameResult::Malformed));
    }
}
