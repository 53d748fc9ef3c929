//! JSON messages exchanged with the remote editor endpoint.
//!
//! Each message travels in its own length-prefixed frame (4-byte big-endian
//! length, then UTF-8 JSON). Framing is the transport's concern; this module
//! only defines the frame payloads.
//!
//! ```text
//! -> {"id":7,"type":"manage_scene","params":{"action":"load",...}}
//! <- {"id":7,"status":"success","result":{...}}
//! <- {"id":7,"status":"error","error":"Scene not found"}
//! -> {"id":8,"type":"ping","params":{}}
//! <- {"id":8,"status":"pong"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Params;

/// Command type used for liveness probes.
pub const PING: &str = "ping";

/// Failure to turn a message into bytes or back.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed reply: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("command of {len} bytes exceeds the {max}-byte frame limit")]
    FrameTooLarge { len: usize, max: usize },
}

/// One command sent to the remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommand {
    /// Exchange id, echoed back in the reply.
    pub id: u64,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub params: Params,
}

impl RemoteCommand {
    #[must_use]
    pub fn new(id: u64, command_type: impl Into<String>, params: Params) -> Self {
        Self {
            id,
            command_type: command_type.into(),
            params,
        }
    }

    #[must_use]
    pub fn ping(id: u64) -> Self {
        Self::new(id, PING, Params::new())
    }

    /// # Errors
    ///
    /// Returns `WireError::Encode` if the parameters cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }
}

/// Reply to a [`RemoteCommand`], tagged by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteReply {
    Success {
        id: u64,
        #[serde(default)]
        result: Value,
    },
    Error {
        id: u64,
        #[serde(alias = "message")]
        error: String,
    },
    /// Probe acknowledgment.
    Pong { id: u64 },
}

impl RemoteReply {
    #[must_use]
    pub fn pong(id: u64) -> Self {
        RemoteReply::Pong { id }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            RemoteReply::Success { id, .. }
            | RemoteReply::Error { id, .. }
            | RemoteReply::Pong { id } => *id,
        }
    }

    /// Older endpoints acknowledge probes with a success reply carrying
    /// `{"message": "pong"}`; both forms are accepted.
    #[must_use]
    pub fn is_pong(&self) -> bool {
        match self {
            RemoteReply::Pong { .. } => true,
            RemoteReply::Success { result, .. } => {
                result.get("message").and_then(Value::as_str) == Some("pong")
            }
            RemoteReply::Error { .. } => false,
        }
    }

    /// # Errors
    ///
    /// Returns `WireError::Decode` if `bytes` is not a well-formed reply.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }

    /// # Errors
    ///
    /// Returns `WireError::Encode` if the result cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }
}
