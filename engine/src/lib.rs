// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Async MQTT v5 client connection engine.
//!
//! A [`Client`] drives one broker connection through four cooperating loops (Reader,
//! Writer, Publish-Writer, Handler) plus a keep-alive task, all spawned by
//! [`Client::connect`]. Application code interacts only with [`Client`]'s public methods
//! and the listeners registered through `on_connect`/`on_disconnect`/`on_message`.

pub mod client;
pub mod error;
pub mod events;
pub mod framer;
pub mod handler;
pub mod options;
pub mod packet_id;
pub mod properties;
pub mod publish_writer;
pub mod queue;
pub mod reader;
pub mod state;
pub mod topic_matcher;
pub mod transport;
pub mod txn_map;
pub mod writer;

pub use client::{Client, PublishOptions, SubscribeOptions, Subscription};
pub use error::EngineError;
pub use events::{PacketDirection, PacketEvent, PacketKind, PublishMessage};
pub use options::{
    ClientOptions, HttpProxy, LastWillAndTestament, Proxy, SelfSignedTls, TlsType, UserProperties,
    WebSocketOptions,
};
pub use properties::ConnectionProperties;
pub use transport::{DuplexTransport, SharedWriter, TcpTransport, Transport, TransportReader, TransportWriter};

pub use codec::v5::ReasonCode;
pub use codec::QoS;
