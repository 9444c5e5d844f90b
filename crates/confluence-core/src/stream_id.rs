//! Stream and node identifiers
//!
//! Both identifiers are fixed-size opaque byte strings. [`StreamId`] names
//! one append-only log; [`NodeAddress`] names the backend node instance that
//! hosts a set of streams. Both are totally ordered and used as map keys
//! throughout the sync layer.

use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Length of a stream identifier in bytes.
pub const STREAM_ID_LEN: usize = 32;

/// Length of a node address in bytes.
pub const NODE_ADDRESS_LEN: usize = 20;

/// Unique identifier for one append-only stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId([u8; STREAM_ID_LEN]);

impl StreamId {
    /// Create a stream id from raw bytes.
    pub fn new(bytes: [u8; STREAM_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a stream id from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let arr: [u8; STREAM_ID_LEN] = bytes.try_into().map_err(|_| {
            SyncError::InvalidArgument(format!(
                "invalid stream id length: expected {STREAM_ID_LEN}, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; STREAM_ID_LEN] {
        &self.0
    }

    /// True if every byte is zero. A zero stream id is never valid.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Short display form for logging (first 4 bytes as hex).
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.short_id())
    }
}

/// Address of one backend node instance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress([u8; NODE_ADDRESS_LEN]);

impl NodeAddress {
    /// Create a node address from raw bytes.
    pub fn new(bytes: [u8; NODE_ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a node address from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let arr: [u8; NODE_ADDRESS_LEN] = bytes.try_into().map_err(|_| {
            SyncError::InvalidArgument(format!(
                "invalid node address length: expected {NODE_ADDRESS_LEN}, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ADDRESS_LEN] {
        &self.0
    }

    /// True if every byte is zero. A zero address is never valid.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Short display form for logging (first 4 bytes as hex).
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self.short_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_from_bytes_roundtrip() {
        let id = StreamId::new([7u8; STREAM_ID_LEN]);
        let recovered = StreamId::from_bytes(id.as_bytes()).unwrap();
        assert_eq!(id, recovered);
    }

    #[test]
    fn test_stream_id_rejects_wrong_length() {
        assert!(StreamId::from_bytes(&[1, 2, 3]).is_err());
        assert!(StreamId::from_bytes(&[0u8; 33]).is_err());
    }

    #[test]
    fn test_zero_detection() {
        assert!(StreamId::new([0u8; STREAM_ID_LEN]).is_zero());
        assert!(!StreamId::new([1u8; STREAM_ID_LEN]).is_zero());
        assert!(NodeAddress::new([0u8; NODE_ADDRESS_LEN]).is_zero());
        assert!(!NodeAddress::new([9u8; NODE_ADDRESS_LEN]).is_zero());
    }

    #[test]
    fn test_short_id_is_prefix() {
        let id = StreamId::new([0xab; STREAM_ID_LEN]);
        assert_eq!(id.short_id(), "abababab");
        assert!(id.to_string().starts_with(&id.short_id()));
    }
}
