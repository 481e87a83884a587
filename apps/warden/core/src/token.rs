use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Number of random bytes in an instance token.
pub const INSTANCE_TOKEN_BYTE_LENGTH: usize = 32;

/// Length of the hex form presented by the child in the `token` query parameter.
pub const INSTANCE_TOKEN_ENCODED_LENGTH: usize = INSTANCE_TOKEN_BYTE_LENGTH * 2;

/// Number of random bytes in a correlation id.
pub const CORRELATION_ID_BYTE_LENGTH: usize = 16;

/// Single-use credential a launched child presents when it opens its control
/// connection. Generated once per instance and never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceToken([u8; INSTANCE_TOKEN_BYTE_LENGTH]);

impl InstanceToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; INSTANCE_TOKEN_BYTE_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses the hex form. Anything that does not decode to exactly
    /// [`INSTANCE_TOKEN_BYTE_LENGTH`] bytes is rejected.
    pub fn parse(encoded: &str) -> Result<Self, TokenError> {
        if encoded.len() != INSTANCE_TOKEN_ENCODED_LENGTH {
            return Err(TokenError::InvalidLength(encoded.len()));
        }
        let mut bytes = [0u8; INSTANCE_TOKEN_BYTE_LENGTH];
        hex::decode_to_slice(encoded, &mut bytes).map_err(TokenError::InvalidHex)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InstanceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Tokens end up in logs through `Debug` derives of surrounding structs.
impl fmt::Debug for InstanceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InstanceToken(..)")
    }
}

/// Errors returned while parsing a presented token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token has length {0}, expected {INSTANCE_TOKEN_ENCODED_LENGTH}")]
    InvalidLength(usize),
    #[error("token is not valid hex: {0}")]
    InvalidHex(hex::FromHexError),
}

/// Stable, time-sortable identifier of a supervised instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Random identifier linking a request frame to its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; CORRELATION_ID_BYTE_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_parse_back() {
        let token = InstanceToken::generate();
        let encoded = token.to_hex();
        assert_eq!(encoded.len(), INSTANCE_TOKEN_ENCODED_LENGTH);
        assert_eq!(InstanceToken::parse(&encoded).unwrap(), token);
    }

    #[test]
    fn tokens_are_not_reused() {
        assert_ne!(InstanceToken::generate(), InstanceToken::generate());
    }

    #[test]
    fn rejects_truncated_and_extended_tokens() {
        let encoded = InstanceToken::generate().to_hex();
        assert!(matches!(
            InstanceToken::parse(&encoded[..encoded.len() - 2]),
            Err(TokenError::InvalidLength(_))
        ));
        let extended = format!("{encoded}00");
        assert!(matches!(
            InstanceToken::parse(&extended),
            Err(TokenError::InvalidLength(_))
        ));
    }

    #[test]
    fn rejects_non_hex_tokens() {
        let bogus = "z".repeat(INSTANCE_TOKEN_ENCODED_LENGTH);
        assert!(matches!(
            InstanceToken::parse(&bogus),
            Err(TokenError::InvalidHex(_))
        ));
    }

    #[test]
    fn debug_output_hides_token_bytes() {
        let token = InstanceToken::generate();
        assert!(!format!("{token:?}").contains(&token.to_hex()));
    }

    #[test]
    fn instance_ids_sort_by_creation() {
        let first = InstanceId::new();
        let second = InstanceId::new();
        assert!(first < second);
    }

    #[test]
    fn correlation_ids_have_fixed_length() {
        let id = CorrelationId::generate();
        assert_eq!(id.as_str().len(), CORRELATION_ID_BYTE_LENGTH * 2);
        assert_ne!(id, CorrelationId::generate());
    }
}
