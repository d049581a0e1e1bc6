//! End-to-end tests driving a client messenger against a served service.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tabletd_rpc::protocol::ErrorCode;
use tabletd_rpc::{
    InboundCall, Messenger, MessengerBuilder, Proxy, RpcController, RpcError, RpcService,
    ServiceError, ServicePool,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct EchoService;

impl RpcService for EchoService {
    fn service_name(&self) -> &'static str {
        "EchoService"
    }

    fn handle_call(&self, call: &InboundCall) -> Result<Bytes, ServiceError> {
        match call.method() {
            "Echo" => Ok(call.payload().clone()),
            "Fail" => Err(ServiceError::application("requested failure")),
            other => Err(ServiceError::unknown_method(other)),
        }
    }
}

/// A service whose calls block until the test releases the gate, to pin
/// workers and fill the service queue deterministically.
struct GatedService {
    gate: flume::Receiver<()>,
}

impl RpcService for GatedService {
    fn service_name(&self) -> &'static str {
        "GatedService"
    }

    fn handle_call(&self, _call: &InboundCall) -> Result<Bytes, ServiceError> {
        // Bounded wait so a failed test cannot wedge the worker forever.
        let _ = self.gate.recv_timeout(Duration::from_secs(10));
        Ok(Bytes::from_static(b"released"))
    }
}

struct TestServer {
    // Held for their Drop side effects: shutdown of the pool and messenger.
    _pool: ServicePool,
    _messenger: Arc<Messenger>,
    addr: SocketAddr,
}

fn start_server(
    service: Arc<dyn RpcService>,
    queue_capacity: usize,
    num_workers: usize,
) -> TestServer {
    let messenger = MessengerBuilder::new("test-server")
        .set_num_reactors(2)
        .build()
        .unwrap();
    let addr = messenger
        .add_acceptor_pool("127.0.0.1:0".parse().unwrap(), 1)
        .unwrap();
    let pool = ServicePool::new(Arc::clone(&messenger), service, queue_capacity);
    pool.init(num_workers).unwrap();
    TestServer {
        _pool: pool,
        _messenger: messenger,
        addr,
    }
}

fn client_messenger() -> Arc<Messenger> {
    MessengerBuilder::new("test-client").build().unwrap()
}

#[test]
fn test_echo_round_trip() {
    init_logging();
    let server = start_server(Arc::new(EchoService), 10, 2);
    let client = client_messenger();
    let proxy = Proxy::new(Arc::clone(&client), server.addr);

    let controller = RpcController::new();
    controller.set_timeout(Duration::from_secs(10));
    let response = proxy
        .request("Echo", Bytes::from_static(b"hello"), &controller)
        .unwrap();

    assert_eq!(response, Bytes::from_static(b"hello"));
    assert!(controller.finished());
    assert!(controller.status().is_ok());

    // The controller is reusable after a reset, over the same connection.
    controller.reset();
    controller.set_timeout(Duration::from_secs(10));
    let response = proxy
        .request("Echo", Bytes::from_static(b"again"), &controller)
        .unwrap();
    assert_eq!(response, Bytes::from_static(b"again"));
}

#[test]
fn test_remote_errors_surface_through_status() {
    init_logging();
    let server = start_server(Arc::new(EchoService), 10, 2);
    let client = client_messenger();
    let proxy = Proxy::new(client, server.addr);

    let controller = RpcController::new();
    controller.set_timeout(Duration::from_secs(10));
    let err = proxy
        .request("Fail", Bytes::new(), &controller)
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Remote {
            code: ErrorCode::ApplicationError,
            ..
        }
    ));
    assert!(controller.finished());
    assert_eq!(controller.status().error(), Some(&err));

    controller.reset();
    controller.set_timeout(Duration::from_secs(10));
    let err = proxy
        .request("NoSuchMethod", Bytes::new(), &controller)
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Remote {
            code: ErrorCode::UnknownMethod,
            ..
        }
    ));
}

#[test]
fn test_finished_transitions_exactly_once() {
    init_logging();
    let (gate_tx, gate_rx) = flume::unbounded();
    let server = start_server(Arc::new(GatedService { gate: gate_rx }), 10, 1);
    let client = client_messenger();
    let proxy = Proxy::new(client, server.addr);

    let controller = RpcController::new();
    controller.set_timeout(Duration::from_secs(10));
    let (done_tx, done_rx) = flume::bounded(1);
    proxy.async_request("Block", Bytes::new(), &controller, move || {
        let _ = done_tx.send(());
    });

    // The server cannot answer until the gate opens.
    assert!(!controller.finished());
    assert!(controller.status().is_ok());

    gate_tx.send(()).unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(controller.finished());
    assert!(controller.status().is_ok());
    assert_eq!(controller.response(), Some(Bytes::from_static(b"released")));
}

#[test]
fn test_timeout_fires_no_earlier_than_configured() {
    init_logging();
    // A listener that never accepts or answers.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = client_messenger();
    let proxy = Proxy::new(client, addr);

    let timeout = Duration::from_millis(300);
    let controller = RpcController::new();
    controller.set_timeout(timeout);

    let start = Instant::now();
    let err = proxy
        .request("Echo", Bytes::from_static(b"nobody home"), &controller)
        .unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err, RpcError::TimedOut(timeout));
    assert!(elapsed >= timeout, "timed out early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "timed out late: {elapsed:?}");
    drop(listener);
}

#[test]
fn test_connection_refused_fails_fast() {
    init_logging();
    // Grab a port that nothing is listening on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let client = client_messenger();
    let proxy = Proxy::new(client, addr);

    let controller = RpcController::new();
    controller.set_timeout(Duration::from_secs(10));
    let start = Instant::now();
    let err = proxy.request("Echo", Bytes::new(), &controller).unwrap_err();

    assert!(
        matches!(err, RpcError::ConnectionFailed { .. }),
        "unexpected error: {err}"
    );
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_saturated_service_pool_rejects_with_busy() {
    init_logging();
    let (gate_tx, gate_rx) = flume::unbounded();
    // One worker, queue bound of two: the worker pins the first call and
    // the next two fill the queue.
    let server = start_server(Arc::new(GatedService { gate: gate_rx }), 2, 1);
    let client = client_messenger();
    let proxy = Proxy::new(client, server.addr);

    let mut controllers = Vec::new();
    let mut done_rxs = Vec::new();
    let start = Instant::now();
    for _ in 0..4 {
        let controller = RpcController::new();
        controller.set_timeout(Duration::from_secs(5));
        let (done_tx, done_rx) = flume::bounded(1);
        proxy.async_request("Block", Bytes::new(), &controller, move || {
            let _ = done_tx.send(());
        });
        controllers.push(controller);
        done_rxs.push(done_rx);
        // Let each call reach the service queue before the next is issued.
        std::thread::sleep(Duration::from_millis(100));
    }

    // The fourth call is rejected immediately, well under its timeout.
    done_rxs[3].recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(
        controllers[3].status().error(),
        Some(RpcError::ServerTooBusy(_))
    ));
    assert!(start.elapsed() < Duration::from_secs(3));

    // Once workers drain the queue, the admitted calls are serviced.
    for _ in 0..3 {
        gate_tx.send(()).unwrap();
    }
    for (controller, done_rx) in controllers.iter().zip(&done_rxs).take(3) {
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(controller.status().is_ok(), "{}", controller.status());
    }
}

#[test]
fn test_add_acceptor_pool_reports_bind_failure() {
    init_logging();
    // Occupy a port so the messenger cannot bind it.
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();

    let messenger = MessengerBuilder::new("bind-test").build().unwrap();
    let err = messenger.add_acceptor_pool(addr, 1).unwrap_err();
    assert!(matches!(
        err,
        tabletd_rpc::TransportError::Bind { .. }
    ));
    // The failed pool leaves nothing behind.
    assert!(messenger.acceptor_addresses().is_empty());
    drop(taken);
}

#[test]
fn test_messenger_shutdown_is_idempotent() {
    init_logging();
    let messenger = MessengerBuilder::new("shutdown-test")
        .set_num_reactors(2)
        .build()
        .unwrap();
    messenger
        .add_acceptor_pool("127.0.0.1:0".parse().unwrap(), 2)
        .unwrap();

    messenger.shutdown();
    messenger.shutdown();
    // And once more from the destructor.
    drop(messenger);
}

#[test]
fn test_calls_after_shutdown_abort() {
    init_logging();
    let client = client_messenger();
    client.shutdown();

    let proxy = Proxy::new(Arc::clone(&client), "127.0.0.1:7150".parse().unwrap());
    let controller = RpcController::new();
    let err = proxy.request("Echo", Bytes::new(), &controller).unwrap_err();
    assert_eq!(err, RpcError::Aborted);
}

#[test]
fn test_shutdown_cancels_in_flight_calls() {
    init_logging();
    // A listener that accepts nothing, so the call stays in flight.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = client_messenger();
    let proxy = Proxy::new(Arc::clone(&client), addr);

    // No timeout: only shutdown can end this call.
    let controller = RpcController::new();
    let (done_tx, done_rx) = flume::bounded(1);
    proxy.async_request("Echo", Bytes::new(), &controller, move || {
        let _ = done_tx.send(());
    });
    std::thread::sleep(Duration::from_millis(200));
    assert!(!controller.finished());

    client.shutdown();
    done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(controller.status().error(), Some(&RpcError::Aborted));
    drop(listener);
}
