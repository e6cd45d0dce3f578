// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Wire-format codec for the MQTT v5 protocol.
//!
//! This crate owns the "dumb" half of the stack: fixed/variable header framing,
//! property lists, reason codes and the small fixed/variable-width data types the
//! wire format is built from. It knows nothing about sockets, reconnection, or
//! packet-id bookkeeping across a session; that belongs to the engine built on
//! top of it.

mod base;
mod binary_data;
mod bool_data;
mod byte_array;
mod connect_flags;
mod error;
mod keep_alive;
mod protocol_level;
mod pub_topic;
mod string_data;
mod string_pair_data;
mod sub_topic;
mod u16_data;
mod u32_data;
mod utils;
mod var_int;

pub mod v5;

pub use base::{PacketId, QoS, PROTOCOL_NAME};
pub use binary_data::BinaryData;
pub use bool_data::BoolData;
pub use byte_array::{ByteArray, ByteArrayError};
pub use connect_flags::ConnectFlags;
pub use error::{DecodeError, DecodePacket, EncodeError, EncodePacket};
pub use keep_alive::{validate_keep_alive, KeepAlive};
pub use protocol_level::ProtocolLevel;
pub use pub_topic::PubTopic;
pub use string_data::StringData;
pub use string_pair_data::StringPairData;
pub use sub_topic::SubTopic;
pub use u16_data::U16Data;
pub use u32_data::U32Data;
pub use utils::{
    random_string, to_utf8_string, validate_client_id, validate_two_bytes_data,
    validate_utf8_string, ClientIdError, StringError,
};
pub use var_int::{VarInt, VarIntError};
