//! Request Handler - Serving Distributed Autograd Messages
//!
//! Turns incoming gradient propagation and cleanup requests into work on
//! the local container and engine. Failures are answered with a
//! `RemoteException` naming the context, never dropped.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::Arc;

use gradnet_autograd::FutureCell;
use gradnet_core::Error;

use crate::container::DistAutogradContainer;
use crate::engine::DistEngine;
use crate::rpc::{Message, PropagateGradientsReq, RequestHandler, RpcFuture};
use crate::{ContextId, WorkerId};

fn reply(message: Message) -> RpcFuture {
    Arc::new(FutureCell::completed(Ok(message)))
}

fn exception(context_id: ContextId, error: &Error) -> Message {
    Message::RemoteException {
        message: format!("distributed backward pass for context {context_id} failed: {error}"),
    }
}

// =============================================================================
// DistAutogradRequestHandler
// =============================================================================

/// Serves distributed autograd requests for one worker.
pub struct DistAutogradRequestHandler {
    engine: Arc<DistEngine>,
}

impl DistAutogradRequestHandler {
    /// Creates a handler running propagated gradients on `engine`.
    #[must_use]
    pub fn new(engine: Arc<DistEngine>) -> Self {
        Self { engine }
    }

    fn container(&self) -> &DistAutogradContainer {
        self.engine.container()
    }

    fn propagate_gradients(&self, from: WorkerId, req: PropagateGradientsReq) -> RpcFuture {
        let context_id = req.metadata.context_id;
        let context = self.container().get_or_create_context(context_id);
        context.add_known_worker_id(from);

        let send = match context.retrieve_send_function(req.metadata.message_id) {
            Ok(send) => send,
            Err(e) => return reply(exception(context_id, &e)),
        };
        send.set_grads(req.grads);
        tracing::debug!(
            context_id,
            message_id = req.metadata.message_id,
            from,
            "running propagated gradients"
        );

        let response: RpcFuture = Arc::new(FutureCell::new());
        let completion = Arc::clone(&response);
        self.engine
            .execute_send_function_async(&context, send, req.retain_graph)
            .then(move |outcome| {
                let message = match outcome {
                    Ok(()) => Message::PropagateGradientsResp,
                    Err(e) => exception(context_id, e),
                };
                completion.complete(Ok(message));
            });
        response
    }
}

impl RequestHandler for DistAutogradRequestHandler {
    fn handle(&self, from: WorkerId, message: Message) -> RpcFuture {
        match message {
            Message::PropagateGradientsReq(req) => self.propagate_gradients(from, req),
            Message::CleanupAutogradContextReq { context_id } => {
                self.container().release_context_if_present(context_id);
                reply(Message::CleanupAutogradContextResp)
            }
            other => {
                tracing::warn!(from, message = %other.message_type(), "unexpected message");
                reply(Message::RemoteException {
                    message: format!("unexpected message type {}", other.message_type()),
                })
            }
        }
    }
}

impl std::fmt::Debug for DistAutogradRequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistAutogradRequestHandler")
            .field("worker_id", &self.container().worker_id())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::add_send_rpc_backward;
    use crate::config::DistAutogradConfig;
    use crate::rpc::AutogradMetadata;
    use gradnet_autograd::{Engine, EngineConfig, Variable};
    use gradnet_tensor::Tensor;

    fn handler() -> DistAutogradRequestHandler {
        let engine = Arc::new(Engine::new(EngineConfig {
            cpu_threads: 1,
            ..EngineConfig::default()
        }));
        let container =
            Arc::new(DistAutogradContainer::new(1, &DistAutogradConfig::default()).unwrap());
        DistAutogradRequestHandler::new(Arc::new(DistEngine::new(engine, container)))
    }

    fn propagate(context_id: ContextId, message_id: i64, grads: Vec<Tensor>) -> Message {
        Message::PropagateGradientsReq(PropagateGradientsReq {
            metadata: AutogradMetadata::new(context_id, message_id),
            grads,
            retain_graph: false,
        })
    }

    #[test]
    fn test_propagate_runs_send_function() {
        let handler = handler();
        let context = handler.container().get_or_create_context(4);
        let x = Variable::new(Tensor::scalar(5.0), true);
        let y = x.mul_scalar(2.0);
        add_send_rpc_backward(&context, AutogradMetadata::new(4, 11), &[y], 0).unwrap();

        let response = handler.handle(0, propagate(4, 11, vec![Tensor::scalar(1.0)]));
        assert_eq!(response.wait().unwrap(), Message::PropagateGradientsResp);
        assert_eq!(context.get_gradients()[&x.id()].item().unwrap(), 2.0);
    }

    #[test]
    fn test_unknown_send_function_is_exception() {
        let handler = handler();
        let response = handler.handle(0, propagate(8, 1, vec![])).wait().unwrap();
        let Message::RemoteException { message } = response else {
            panic!("expected an exception");
        };
        assert!(message.contains("context 8"));
        assert!(handler.container().is_valid_context(8));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let handler = handler();
        handler.container().get_or_create_context(3);
        let cleanup = Message::CleanupAutogradContextReq { context_id: 3 };
        assert_eq!(
            handler.handle(0, cleanup.clone()).wait().unwrap(),
            Message::CleanupAutogradContextResp
        );
        assert_eq!(
            handler.handle(0, cleanup).wait().unwrap(),
            Message::CleanupAutogradContextResp
        );
        assert!(!handler.container().is_valid_context(3));
    }

    #[test]
    fn test_unexpected_message() {
        let handler = handler();
        let response = handler
            .handle(0, Message::PropagateGradientsResp)
            .wait()
            .unwrap();
        assert!(matches!(response, Message::RemoteException { .. }));
    }
}
