// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::io;

use thiserror::Error;

/// Error surface returned across the public client API.
///
/// Maps onto the taxonomy the connection supervisor and loops use internally to decide
/// whether to tear down the connection (`Transport`, `Protocol`) or simply hand the error
/// back to the caller that issued the operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport read/write failed or the peer closed the connection.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Malformed packet, packet too large, duplicate incoming id, flow-control violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Caller asked for a broker capability that ConnAck advertised as unsupported.
    #[error("feature unavailable: {0}")]
    FeatureUnavailable(String),

    /// A bounded wait (connect/subscribe/unsubscribe/publish ack) elapsed.
    #[error("operation timed out")]
    Timeout,

    /// Operation invoked in the wrong connection state (double-connect, publish while
    /// disconnected, unsubscribe of an unknown filter).
    #[error("usage error: {0}")]
    Usage(String),

    /// Invalid topic filter, bad option value, out-of-range property.
    #[error("validation error: {0}")]
    Validation(String),

    /// Wire-format failure surfaced through the codec crate.
    #[error("codec decode error: {0:?}")]
    Decode(#[from] codec::DecodeError),

    #[error("codec encode error: {0:?}")]
    Encode(#[from] codec::EncodeError),
}

impl EngineError {
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    #[must_use]
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub fn feature_unavailable(message: impl Into<String>) -> Self {
        Self::FeatureUnavailable(message.into())
    }
}
