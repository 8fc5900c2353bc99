//! RPC - Agent Abstraction for Distributed Autograd
//!
//! The autograd layer talks to other workers only through [`RpcAgent::send`],
//! which returns a future resolved with the reply. Incoming requests are
//! dispatched to a [`RequestHandler`].
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

pub mod local;
pub mod message;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gradnet_autograd::FutureCell;
use gradnet_core::Device;

use crate::WorkerId;

pub use local::LocalRpcAgent;
pub use message::{AutogradMetadata, Message, MessageType, PropagateGradientsReq};

// =============================================================================
// Types
// =============================================================================

/// Maps a sender's devices to the receiver's devices.
pub type DeviceMap = HashMap<Device, Device>;

/// Reply to an RPC, or the error that prevented one.
pub type RpcFuture = Arc<FutureCell<Message>>;

// =============================================================================
// Traits
// =============================================================================

/// Sends messages to other workers.
pub trait RpcAgent: Send + Sync {
    /// Id of the worker this agent belongs to.
    fn worker_id(&self) -> WorkerId;

    /// Number of workers reachable through this agent.
    fn world_size(&self) -> usize;

    /// Sends `message` to worker `to`.
    ///
    /// Tensors in the message are moved according to `device_map` on
    /// arrival. The future fails with a timeout if no reply arrives within
    /// `timeout`, and with a remote error if the receiver answers with a
    /// `RemoteException`.
    fn send(
        &self,
        to: WorkerId,
        message: Message,
        timeout: Option<Duration>,
        device_map: &DeviceMap,
    ) -> RpcFuture;
}

/// Serves requests arriving at a worker.
pub trait RequestHandler: Send + Sync {
    /// Handles `message` from worker `from`; the future resolves with the reply.
    fn handle(&self, from: WorkerId, message: Message) -> RpcFuture;
}
