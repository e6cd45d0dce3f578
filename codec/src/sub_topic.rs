// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, StringData};

/// Topic filter used in SUBSCRIBE/UNSUBSCRIBE, may contain `+`/`#` wildcards.
///
/// Wildcard *syntax* is unconstrained at the wire layer; whether a filter is
/// well-formed (wildcard placement, `$`-prefix interaction) is the concern of
/// the topic matcher, not the codec.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubTopic(StringData);

impl SubTopic {
    /// Create a new subscribe topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `filter` is empty or too large for the wire format.
    pub fn new(filter: &str) -> Result<Self, EncodeError> {
        if filter.is_empty() {
            return Err(EncodeError::InvalidData);
        }
        let data = StringData::from(filter).map_err(|_e| EncodeError::InvalidData)?;
        Ok(Self(data))
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.0.bytes()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let data = StringData::decode(ba)?;
        if data.is_empty() {
            return Err(DecodeError::EmptyTopicFilter);
        }
        Ok(Self(data))
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.0.encode(buf)
    }
}
