//! Wire frames exchanged with the remote multiplexer.
//!
//! One frame per transport message, as an internally tagged JSON object.
//! Only the open/close control surface is meaningful to this crate; data
//! payloads are opaque bytes that belong to the application layer.

use serde::{Deserialize, Serialize};

/// Wire channel id of the implicit control channel that represents the
/// session itself.
pub const CHAN0: u64 = 0;

/// A single message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client asks the remote to open a channel to `service`.
    ///
    /// `ref_id` is the client-chosen correlation id echoed back in the ack;
    /// it is stable across reconnects for a given request.
    OpenChannel {
        ref_id: u64,
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Remote ack for [`Frame::OpenChannel`]. On success `channel` carries
    /// the server-assigned wire id; on failure `error` is set.
    OpenChannelAck {
        ref_id: u64,
        #[serde(default)]
        channel: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Client asks the remote to close a channel.
    CloseChannel { channel: u64 },

    /// Remote ack for [`Frame::CloseChannel`].
    CloseChannelAck { channel: u64 },

    /// Opaque payload for a channel. `channel` 0 addresses chan0.
    Data { channel: u64, payload: Vec<u8> },
}

impl Frame {
    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a received transport message.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
