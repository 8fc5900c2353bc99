//! End-to-end tests of backward passes spanning two in-process workers.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gradnet_autograd::{Engine, EngineConfig, FutureCell};
use gradnet_core::{Error, ErrorKind};
use gradnet_distributed::prelude::*;
use gradnet_distributed::{
    AutogradMetadata, ContextId, DeviceMap, Message, RequestHandler, RpcFuture, WorkerId,
};

struct Worker {
    agent: Arc<LocalRpcAgent>,
    container: Arc<DistAutogradContainer>,
    engine: Arc<DistEngine>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn world(size: usize, config: &DistAutogradConfig) -> Vec<Worker> {
    init_tracing();
    LocalRpcAgent::create_world(size, config)
        .unwrap()
        .into_iter()
        .map(|agent| {
            let worker_id = agent.worker_id();
            let container = Arc::new(DistAutogradContainer::new(worker_id, config).unwrap());
            let dyn_agent: Arc<dyn RpcAgent> = agent.clone();
            container.set_rpc_agent(&dyn_agent).unwrap();
            let engine = Arc::new(DistEngine::new(
                Arc::new(Engine::new(EngineConfig {
                    cpu_threads: 2,
                    ..EngineConfig::default()
                })),
                Arc::clone(&container),
            ));
            agent.set_request_handler(Arc::new(DistAutogradRequestHandler::new(Arc::clone(
                &engine,
            ))));
            Worker {
                agent,
                container,
                engine,
            }
        })
        .collect()
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Answers nothing, so every request to it times out.
struct Silent;

impl RequestHandler for Silent {
    fn handle(&self, _from: WorkerId, _message: Message) -> RpcFuture {
        Arc::new(FutureCell::new())
    }
}

#[test]
fn test_backward_across_two_workers() {
    let workers = world(2, &DistAutogradConfig::default());
    let (w0, w1) = (&workers[0], &workers[1]);

    let scope = w0.container.scope().unwrap();
    let context_id = scope.context_id();
    let x = Variable::new(Tensor::scalar(2.0), true);
    let h = x.mul_scalar(3.0);
    let to_w1 = record_send(&w0.container, &[h.clone()], 1).unwrap();
    assert!(to_w1.is_some());

    // Worker 1 serves the forward RPC on its own thread.
    let container = Arc::clone(&w1.container);
    let payload = h.data().clone();
    let (to_w0, y_data, p_id) = thread::spawn(move || {
        container.set_current_context_id(context_id).unwrap();
        let p = Variable::new(Tensor::scalar(4.0), true);
        let received = record_recv(&container, to_w1, vec![payload], 0, DeviceMap::new()).unwrap();
        let y = received[0].mul(&p).unwrap();
        let to_w0 = record_send(&container, &[y.clone()], 0).unwrap();
        container.clear_current_context();
        (to_w0, y.data().clone(), p.id())
    })
    .join()
    .unwrap();
    assert_eq!(y_data.item().unwrap(), 24.0);

    let returned = record_recv(&w0.container, to_w0, vec![y_data], 1, DeviceMap::new()).unwrap();
    let loss = returned[0].mul_scalar(2.0);
    backward(&w0.engine, context_id, &[loss], false).unwrap();

    let local = get_gradients(&w0.container, context_id).unwrap();
    assert_eq!(local[&x.id()].item().unwrap(), 24.0);
    assert!(x.grad().is_none());
    let remote = get_gradients(&w1.container, context_id).unwrap();
    assert_eq!(remote[&p_id].item().unwrap(), 12.0);
    assert!(w1
        .container
        .retrieve_context(context_id)
        .unwrap()
        .known_worker_ids()
        .contains(&0));

    drop(scope);
    assert!(!w0.container.is_valid_context(context_id));
    wait_until("remote context release", || {
        !w1.container.is_valid_context(context_id)
    });
    w0.agent.shutdown();
}

#[test]
fn test_remote_failure_fails_pass() {
    let workers = world(2, &DistAutogradConfig::default());
    let (w0, w1) = (&workers[0], &workers[1]);

    let scope = w0.container.scope().unwrap();
    let context_id: ContextId = scope.context_id();
    // Worker 1 never recorded a send under this message id.
    let metadata = AutogradMetadata::new(context_id, 777);
    let received = record_recv(
        &w0.container,
        Some(metadata),
        vec![Tensor::scalar(1.0)],
        1,
        DeviceMap::new(),
    )
    .unwrap();
    let loss = received[0].mul_scalar(5.0);

    let err = backward(&w0.engine, context_id, &[loss], false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Remote);
    assert!(err.to_string().contains(&format!("context {context_id}")));
    assert!(matches!(err.root_cause(), Error::Remote { worker_id: 1, .. }));
    assert!(scope.context().retrieve_graph_task().is_none());

    // The failed request still joined worker 1 to the pass.
    assert!(w1.container.is_valid_context(context_id));
    drop(scope);
    wait_until("remote context release", || {
        !w1.container.is_valid_context(context_id)
    });
    w0.agent.shutdown();
}

#[test]
fn test_timeout_fails_pass() {
    let config = DistAutogradConfig {
        rpc_timeout_ms: 50,
        ..DistAutogradConfig::default()
    };
    let workers = world(2, &config);
    let w0 = &workers[0];
    workers[1].agent.set_request_handler(Arc::new(Silent));

    let scope = w0.container.scope().unwrap();
    let metadata = AutogradMetadata::new(scope.context_id(), 1);
    let received = record_recv(
        &w0.container,
        Some(metadata),
        vec![Tensor::scalar(1.0)],
        1,
        DeviceMap::new(),
    )
    .unwrap();
    let loss = received[0].mul_scalar(2.0);

    let started = Instant::now();
    let err = backward(&w0.engine, scope.context_id(), &[loss], false).unwrap_err();
    assert!(matches!(err.root_cause(), Error::Timeout { worker_id: 1, .. }));
    assert!(err
        .to_string()
        .contains(&format!("context {}", scope.context_id())));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(scope.context().num_outstanding_rpcs(), 0);

    drop(scope);
    w0.agent.shutdown();
}

#[test]
fn test_contexts_are_independent() {
    let workers = world(2, &DistAutogradConfig::default());
    let w0 = &workers[0];

    let first = w0.container.scope().unwrap();
    let first_id = first.context_id();
    let x = Variable::new(Tensor::scalar(1.0), true);
    let loss = x.mul_scalar(7.0);
    backward(&w0.engine, first_id, &[loss], false).unwrap();
    drop(first);

    let second = w0.container.scope().unwrap();
    assert_ne!(second.context_id(), first_id);
    assert!(get_gradients(&w0.container, second.context_id())
        .unwrap()
        .is_empty());
    assert!(get_gradients(&w0.container, first_id).is_err());
    drop(second);
    w0.agent.shutdown();
}
