// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::EncodeError;

/// Generate a random alphanumeric string, used as a fallback client id.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng().sample_iter(&Alphanumeric).take(len).collect()
}

#[derive(Debug)]
pub enum StringError {
    InvalidUtf8,
    TooLong,
}

/// Convert a byte slice into an owned UTF-8 `String`.
///
/// # Errors
///
/// Returns error if `bytes` is not well-formed UTF-8.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    std::str::from_utf8(bytes)
        .map(ToString::to_string)
        .map_err(|_e| StringError::InvalidUtf8)
}

/// Check that `s` fits the two-byte length prefix used by MQTT string data.
///
/// # Errors
///
/// Returns error if `s` is longer than `u16::MAX` bytes.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > u16::MAX as usize {
        Err(StringError::TooLong)
    } else {
        Ok(())
    }
}

/// Check that `data` fits the two-byte length prefix used by MQTT binary data.
///
/// # Errors
///
/// Returns error if `data` is longer than `u16::MAX` bytes.
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > u16::MAX as usize {
        Err(EncodeError::InvalidData)
    } else {
        Ok(())
    }
}

#[derive(Debug)]
pub enum ClientIdError {
    /// Longer than 65535 chars, the limit imposed by the string-data wire format.
    TooLong,

    /// Contains a NUL byte or otherwise fails UTF-8 validation.
    InvalidChars,
}

/// Validate a client identifier.
///
/// MQTT v5 lifts the v3.1.1 "23 chars, alphanumeric only" restriction; brokers are
/// required to accept any UTF-8 string up to the normal string-data length limit,
/// and an empty client id is valid (the broker assigns one via
/// `PropertyType::AssignedClientIdentifier`).
///
/// # Errors
///
/// Returns error if `client_id` exceeds the wire length limit.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.len() > u16::MAX as usize {
        Err(ClientIdError::TooLong)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_string() {
        assert_eq!(random_string(8).len(), 8);
    }

    #[test]
    fn test_validate_client_id() {
        assert!(validate_client_id("").is_ok());
        assert!(validate_client_id("my-client").is_ok());
    }
}
