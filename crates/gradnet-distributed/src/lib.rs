//! Gradnet Distributed - Distributed Autograd over RPC
//!
//! Extends the local autograd engine to backward passes whose graph spans
//! several workers. Every pass is identified by a context id that is unique
//! across workers; tensors crossing an RPC during the forward pass are
//! linked by a send node on the sender and a recv node on the receiver, and
//! during backward the recv node ships gradients back so the sender can
//! continue the pass from its send node.
//!
//! # Features
//!
//! ## Contexts
//! - **DistAutogradContainer** - sharded per-worker registry, id allocation,
//!   current-context tracking and release broadcast
//! - **DistAutogradContext** - boundary nodes, known workers, collected leaf
//!   gradients and outstanding RPCs of one pass
//!
//! ## Execution
//! - **DistEngine** - runs the local share of a pass and waits for the
//!   remote shares it triggered
//! - **DistAutogradRequestHandler** - serves gradient propagation and
//!   cleanup requests
//!
//! ## Communication
//! - **RpcAgent** - `send(to, message, timeout, device_map) -> future`
//! - **LocalRpcAgent** - in-process world of workers for testing
//!
//! # Example
//!
//! ```rust
//! use gradnet_distributed::{DistAutogradConfig, DistAutogradContainer};
//!
//! let container = DistAutogradContainer::new(3, &DistAutogradConfig::default()).unwrap();
//! let scope = container.scope().unwrap();
//! assert_eq!(scope.context_id() >> 48, 3);
//! assert!(container.has_valid_context());
//! drop(scope);
//! assert_eq!(container.num_autograd_contexts(), 0);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unused_self)]
#![allow(clippy::float_cmp)]
#![allow(clippy::missing_fields_in_debug)]

// =============================================================================
// Modules
// =============================================================================

pub mod autograd;
pub mod config;
pub mod container;
pub mod context;
pub mod engine;
pub mod functions;
pub mod request_handler;
pub mod rpc;

// =============================================================================
// Re-exports
// =============================================================================

pub use autograd::{
    add_recv_rpc_backward, add_send_rpc_backward, backward, get_gradients, record_recv,
    record_send,
};
pub use config::DistAutogradConfig;
pub use container::{ContextScope, DistAutogradContainer};
pub use context::DistAutogradContext;
pub use engine::DistEngine;
pub use functions::{RecvRpcBackward, SendRpcBackward};
pub use request_handler::DistAutogradRequestHandler;
pub use rpc::{
    AutogradMetadata, DeviceMap, LocalRpcAgent, Message, MessageType, PropagateGradientsReq,
    RequestHandler, RpcAgent, RpcFuture,
};

// =============================================================================
// Type Aliases
// =============================================================================

/// Identity of a worker; the top 16 bits of every id it allocates.
pub type WorkerId = u16;

/// Identity of a distributed backward pass, unique across workers.
pub type ContextId = i64;

/// Identity of one forward RPC within a pass, correlating its send and recv
/// nodes.
pub type MessageId = i64;

// =============================================================================
// Prelude
// =============================================================================

/// Common imports for distributed autograd.
pub mod prelude {
    pub use crate::{
        // Recording
        backward,
        get_gradients,
        record_recv,
        record_send,
        // Contexts
        ContextScope,
        DistAutogradConfig,
        DistAutogradContainer,
        DistAutogradContext,
        // Execution
        DistAutogradRequestHandler,
        DistEngine,
        // Communication
        LocalRpcAgent,
        RpcAgent,
    };

    pub use gradnet_autograd::Variable;
    pub use gradnet_tensor::Tensor;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use super::DeviceMap;
    use gradnet_autograd::{Engine, EngineConfig};
    use std::sync::Arc;

    #[test]
    fn test_single_worker_workflow() {
        let config = DistAutogradConfig::default();
        let agents = LocalRpcAgent::create_world(1, &config).unwrap();
        let container = Arc::new(DistAutogradContainer::new(0, &config).unwrap());
        let agent: Arc<dyn RpcAgent> = agents[0].clone();
        container.set_rpc_agent(&agent).unwrap();
        let engine = Arc::new(DistEngine::new(
            Arc::new(Engine::new(EngineConfig::default())),
            Arc::clone(&container),
        ));
        agents[0].set_request_handler(Arc::new(DistAutogradRequestHandler::new(Arc::clone(
            &engine,
        ))));

        let scope = container.scope().unwrap();
        let x = Variable::new(Tensor::scalar(2.0), true);

        // A round trip to ourselves crosses the boundary twice.
        let metadata = record_send(&container, &[x.clone()], 0).unwrap();
        let received = record_recv(
            &container,
            metadata,
            vec![x.data().clone()],
            0,
            DeviceMap::new(),
        )
        .unwrap();
        let loss = received[0].mul(&received[0]).unwrap();

        backward(&engine, scope.context_id(), &[loss], false).unwrap();
        let grads = get_gradients(&container, scope.context_id()).unwrap();
        assert_eq!(grads[&x.id()].item().unwrap(), 4.0);
        agents[0].shutdown();
    }

    #[test]
    fn test_worker_id_width() {
        assert_eq!(u32::from(crate::WorkerId::MAX), (1 << 16) - 1);
        assert_eq!(crate::container::LOCAL_ID_BITS, 48);
    }
}
