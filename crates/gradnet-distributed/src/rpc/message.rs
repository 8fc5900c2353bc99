//! Message - Distributed Autograd Wire Messages
//!
//! Requests and responses exchanged between workers during a distributed
//! backward pass, encoded with `bincode`.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;

use gradnet_core::{Error, Result};
use gradnet_tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::rpc::DeviceMap;
use crate::{ContextId, MessageId, WorkerId};

// =============================================================================
// Autograd Metadata
// =============================================================================

/// Correlates a send node on one worker with its recv node on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AutogradMetadata {
    /// Distributed pass the message belongs to.
    pub context_id: ContextId,
    /// Autograd message id allocated by the forward sender.
    pub message_id: MessageId,
}

impl AutogradMetadata {
    /// Creates metadata for `context_id` and `message_id`.
    #[must_use]
    pub fn new(context_id: ContextId, message_id: MessageId) -> Self {
        Self {
            context_id,
            message_id,
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Gradients flowing back across an RPC boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagateGradientsReq {
    /// Identifies the send node the gradients are for.
    pub metadata: AutogradMetadata,
    /// One gradient per tensor sent in the forward RPC.
    pub grads: Vec<Tensor>,
    /// Whether the receiving worker keeps its graph after running it.
    pub retain_graph: bool,
}

/// Message kind, used for logging and dispatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// [`Message::PropagateGradientsReq`]
    PropagateGradientsReq,
    /// [`Message::PropagateGradientsResp`]
    PropagateGradientsResp,
    /// [`Message::CleanupAutogradContextReq`]
    CleanupAutogradContextReq,
    /// [`Message::CleanupAutogradContextResp`]
    CleanupAutogradContextResp,
    /// [`Message::RemoteException`]
    RemoteException,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A distributed autograd message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Run the send node identified by the metadata with these gradients.
    PropagateGradientsReq(PropagateGradientsReq),
    /// The requested propagation, and everything it chained to, finished.
    PropagateGradientsResp,
    /// Release the local copy of a context.
    CleanupAutogradContextReq {
        /// Context to release.
        context_id: ContextId,
    },
    /// The context was released (or was never present).
    CleanupAutogradContextResp,
    /// The request failed on the remote worker.
    RemoteException {
        /// Description of the failure.
        message: String,
    },
}

impl Message {
    /// Kind of this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::PropagateGradientsReq(_) => MessageType::PropagateGradientsReq,
            Self::PropagateGradientsResp => MessageType::PropagateGradientsResp,
            Self::CleanupAutogradContextReq { .. } => MessageType::CleanupAutogradContextReq,
            Self::CleanupAutogradContextResp => MessageType::CleanupAutogradContextResp,
            Self::RemoteException { .. } => MessageType::RemoteException,
        }
    }

    /// Whether this message answers a request.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::PropagateGradientsResp
                | Self::CleanupAutogradContextResp
                | Self::RemoteException { .. }
        )
    }

    /// Encodes the message for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Decodes a message received from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Moves carried tensors to the devices `device_map` assigns them.
    ///
    /// Devices missing from the map are left unchanged.
    #[must_use]
    pub fn map_devices(self, device_map: &DeviceMap) -> Self {
        match self {
            Self::PropagateGradientsReq(mut req) if !device_map.is_empty() => {
                req.grads = req
                    .grads
                    .into_iter()
                    .map(|grad| match device_map.get(&grad.device()) {
                        Some(&device) => grad.to_device(device),
                        None => grad,
                    })
                    .collect();
                Self::PropagateGradientsReq(req)
            }
            other => other,
        }
    }

    /// Turns a `RemoteException` reply from `worker_id` into an error.
    pub fn into_result(self, worker_id: WorkerId) -> Result<Self> {
        match self {
            Self::RemoteException { message } => Err(Error::remote(worker_id, message)),
            other => Ok(other),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
