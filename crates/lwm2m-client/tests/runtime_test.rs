//! Runtime tests over an in-memory transport
//!
//! The transport hands scripted requests to the client and records every
//! outbound exchange, so the tests observe exactly what a server would see:
//! - Retransmitted requests are answered from the cache, not re-executed
//! - Disable de-registers, closes the session and re-registers later
//! - Strangers are never answered, and are released
//! - A pinned Bootstrap Server may start a bootstrap again after Finish
//!
//! # Oracle Pattern
//!
//! Tests collect the recorded exchanges and check them with `verify_*`
//! helpers, and read the device through its shared handle.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use lwm2m_client::{
    Client, ClientConfig, ClientError, Inbound, Registrar, ServerConfig, Session, SessionTransport,
    SharedDevice, SystemEnv,
};
use lwm2m_core::{Resource, ServerState, Ssid};
use lwm2m_proto::{Method, Path, Payload, PeerId, Request, Response, ResponseCode, SessionTicket};
use tokio::sync::{Mutex, mpsc};

const WAIT: Duration = Duration::from_secs(5);
const BOOTSTRAP_PEER: PeerId = PeerId(1000);

/// Something the client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Response { peer: PeerId, message_id: u16, response: Response },
    Register { peer: PeerId },
    Update { peer: PeerId },
    Deregister { peer: PeerId },
    Close { peer: PeerId },
}

/// Transport calls that leave the remote end unaware.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Local {
    Pin { peer: PeerId },
    Release { peer: PeerId },
}

struct MockTransport {
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    sent: mpsc::UnboundedSender<Sent>,
    local: mpsc::UnboundedSender<Local>,
    next_peer: AtomicU64,
}

impl MockTransport {
    fn record(&self, sent: Sent) {
        self.sent.send(sent).ok();
    }
}

#[async_trait]
impl SessionTransport for MockTransport {
    async fn connect(&self, _uri: &str) -> Result<Session, ClientError> {
        let peer = PeerId(self.next_peer.fetch_add(1, Ordering::SeqCst));
        let ticket = Some(SessionTicket(bytes::Bytes::from_static(b"ticket")));
        Ok(Session { peer, ticket, resumed: false })
    }

    async fn resume(&self, peer: PeerId, ticket: &SessionTicket) -> Result<Session, ClientError> {
        Ok(Session { peer, ticket: Some(ticket.clone()), resumed: true })
    }

    async fn send(
        &self,
        peer: PeerId,
        message_id: u16,
        response: &Response,
    ) -> Result<(), ClientError> {
        self.record(Sent::Response { peer, message_id, response: response.clone() });
        Ok(())
    }

    async fn bind_peer(&self, _uri: &str) -> Result<PeerId, ClientError> {
        let peer = BOOTSTRAP_PEER;
        self.local.send(Local::Pin { peer }).ok();
        Ok(peer)
    }

    async fn close(&self, peer: PeerId) {
        self.record(Sent::Close { peer });
    }

    async fn release(&self, peer: PeerId) {
        self.local.send(Local::Release { peer }).ok();
    }

    async fn recv(&self) -> Result<Inbound, ClientError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ClientError::Transport("script finished".to_string()))
    }
}

#[async_trait]
impl Registrar for MockTransport {
    async fn register(
        &self,
        peer: PeerId,
        _endpoint: &str,
        _lifetime: Duration,
    ) -> Result<(), ClientError> {
        self.record(Sent::Register { peer });
        Ok(())
    }

    async fn update(&self, peer: PeerId, _endpoint: &str) -> Result<(), ClientError> {
        self.record(Sent::Update { peer });
        Ok(())
    }

    async fn deregister(&self, peer: PeerId, _endpoint: &str) -> Result<(), ClientError> {
        self.record(Sent::Deregister { peer });
        Ok(())
    }

    async fn bootstrap_request(&self, _peer: PeerId, _endpoint: &str) -> Result<(), ClientError> {
        Ok(())
    }
}

struct Harness {
    device: SharedDevice<SystemEnv>,
    inbound: mpsc::UnboundedSender<Inbound>,
    sent: mpsc::UnboundedReceiver<Sent>,
    local: mpsc::UnboundedReceiver<Local>,
}

impl Harness {
    async fn next(&mut self) -> Sent {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("client went quiet")
            .expect("transport dropped")
    }

    fn request(&self, peer: PeerId, message_id: u16, method: Method, path: &str) {
        let request = Request::new(peer, method, path).with_message_id(message_id);
        self.inbound.send(Inbound::Request(request)).expect("client stopped");
    }

    async fn wait_registered(&self, ssid: Ssid) {
        let registered = async {
            loop {
                let state = self.device.read().await.servers().get(ssid).map(|entry| entry.state);
                if matches!(state, Some(ServerState::Registered { .. })) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(WAIT, registered).await.expect("never registered");
    }
}

/// Helper: client with server 1 and a counter object whose `/1337/0/2`
/// increments `/1337/0/1`, started against the mock transport.
fn create_client(disable_timeout: Duration) -> Harness {
    start_client(server_config(disable_timeout))
}

fn server_config(disable_timeout: Duration) -> ClientConfig {
    ClientConfig {
        endpoint: "runtime-test".to_string(),
        servers: vec![ServerConfig {
            ssid: 1,
            uri: "coap://mock".to_string(),
            lifetime: None,
            disable_timeout: Some(disable_timeout),
        }],
        connect_timeout: Duration::from_secs(1),
        ..ClientConfig::default()
    }
}

fn start_client(config: ClientConfig) -> Harness {
    let env = SystemEnv::new();

    let mut device = config.build_device(env).expect("device");
    device.register_object(1337, None);
    device.set_resource(&Path::for_resource(1337, 0, 1), "42").expect("counter");
    device.register_executable(1337, 2, |instance, _| {
        let value = instance.get(&1).and_then(Resource::as_u64).unwrap_or_default();
        instance.insert(1, Resource::text((value + 1).to_string()));
        Ok(())
    });

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (local_tx, local_rx) = mpsc::unbounded_channel();
    let transport = MockTransport {
        inbound: Mutex::new(inbound_rx),
        sent: sent_tx,
        local: local_tx,
        next_peer: AtomicU64::new(1),
    };

    let client = Client::new(device, transport, env, &config);
    let device = client.device();
    tokio::spawn(client.run());

    Harness { device, inbound: inbound_tx, sent: sent_rx, local: local_rx }
}

/// Oracle: `sent` answers `message_id` on `peer` with `code`.
fn verify_response(sent: &Sent, peer: PeerId, message_id: u16, code: ResponseCode) {
    match sent {
        Sent::Response { peer: to, message_id: id, response } => {
            assert_eq!((*to, *id), (peer, message_id), "response routed to the wrong request");
            assert_eq!(response.code, code);
        },
        other => panic!("expected a response, got {other:?}"),
    }
}

/// Oracle: counter value in the tree.
async fn verify_counter(device: &SharedDevice<SystemEnv>, expected: &str) {
    let device = device.read().await;
    let value = device.tree().resource(1337, 0, 1).and_then(Resource::as_text);
    assert_eq!(value, Some(expected));
}

#[tokio::test]
async fn test_retransmitted_execute_runs_once() {
    let mut harness = create_client(Duration::from_secs(86400));
    assert_eq!(harness.next().await, Sent::Register { peer: PeerId(1) });
    harness.wait_registered(Ssid(1)).await;

    harness.request(PeerId(1), 42, Method::Execute, "/1337/0/2");
    verify_response(&harness.next().await, PeerId(1), 42, ResponseCode::Changed);

    // Response lost; the server retransmits with the same message id.
    harness.request(PeerId(1), 42, Method::Execute, "/1337/0/2");
    verify_response(&harness.next().await, PeerId(1), 42, ResponseCode::Changed);

    verify_counter(&harness.device, "43").await;

    harness.request(PeerId(1), 43, Method::Execute, "/1337/0/2");
    verify_response(&harness.next().await, PeerId(1), 43, ResponseCode::Changed);
    verify_counter(&harness.device, "44").await;
}

#[tokio::test]
async fn test_reads_are_served_alongside_writes() {
    let mut harness = create_client(Duration::from_secs(86400));
    assert_eq!(harness.next().await, Sent::Register { peer: PeerId(1) });
    harness.wait_registered(Ssid(1)).await;

    let write = Request::new(PeerId(1), Method::Write, "/1337/0/1")
        .with_message_id(1)
        .with_payload(Payload::text("7"));
    harness.inbound.send(Inbound::Request(write)).expect("client stopped");
    verify_response(&harness.next().await, PeerId(1), 1, ResponseCode::Changed);

    harness.request(PeerId(1), 2, Method::Read, "/1337/0/1");
    match harness.next().await {
        Sent::Response { message_id: 2, response, .. } => {
            assert_eq!(response.code, ResponseCode::Content);
            assert_eq!(&response.payload[..], b"7");
        },
        other => panic!("expected the read response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disable_deregisters_then_reregisters_on_a_new_session() {
    let mut harness = create_client(Duration::from_secs(1));
    assert_eq!(harness.next().await, Sent::Register { peer: PeerId(1) });
    harness.wait_registered(Ssid(1)).await;

    let server_iid = {
        let device = harness.device.read().await;
        device.servers().get(Ssid(1)).expect("server 1").server_iid
    };
    harness.request(PeerId(1), 5, Method::Execute, &format!("/1/{server_iid}/4"));

    verify_response(&harness.next().await, PeerId(1), 5, ResponseCode::Changed);
    assert_eq!(harness.next().await, Sent::Deregister { peer: PeerId(1) });
    assert_eq!(harness.next().await, Sent::Close { peer: PeerId(1) });

    // Nothing but the re-registration follows once the timeout elapses.
    assert_eq!(harness.next().await, Sent::Register { peer: PeerId(2) });
    harness.wait_registered(Ssid(1)).await;
    assert!(harness.sent.try_recv().is_err());
}

#[tokio::test]
async fn test_strangers_are_never_answered() {
    let mut harness = create_client(Duration::from_secs(86400));
    assert_eq!(harness.next().await, Sent::Register { peer: PeerId(1) });
    harness.wait_registered(Ssid(1)).await;

    harness.request(PeerId(99), 1, Method::Read, "/1337/0/1");
    harness.request(PeerId(99), 2, Method::Write, "/1337/0/1");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness.sent.try_recv().is_err(), "stranger got an answer");
    verify_counter(&harness.device, "42").await;
}

#[tokio::test]
async fn test_stranger_flood_releases_every_stranger() {
    let mut harness = create_client(Duration::from_secs(86400));
    assert_eq!(harness.next().await, Sent::Register { peer: PeerId(1) });
    harness.wait_registered(Ssid(1)).await;

    for stranger in 100..200 {
        harness.request(PeerId(stranger), 1, Method::Write, "/1337/0/1");
    }
    for _ in 100..200 {
        let local = tokio::time::timeout(WAIT, harness.local.recv()).await.expect("quiet");
        assert!(matches!(local, Some(Local::Release { peer }) if peer.0 >= 100));
    }

    // The registered server keeps its session and is still served.
    harness.request(PeerId(1), 7, Method::Read, "/1337/0/1");
    verify_response(&harness.next().await, PeerId(1), 7, ResponseCode::Content);
    assert!(harness.local.try_recv().is_err(), "a known peer was released");
    assert_eq!(harness.device.read().await.active_session_count(), 1);
}

#[tokio::test]
async fn test_bootstrap_server_keeps_its_role_after_finish() {
    let config = ClientConfig {
        bootstrap_server: Some("coap://bootstrap".to_string()),
        ..server_config(Duration::from_secs(86400))
    };
    let mut harness = start_client(config);
    assert_eq!(harness.local.recv().await, Some(Local::Pin { peer: BOOTSTRAP_PEER }));
    assert_eq!(harness.next().await, Sent::Register { peer: PeerId(1) });
    harness.wait_registered(Ssid(1)).await;

    for round in 0..2u16 {
        let id = round * 10;
        let write = Request::new(BOOTSTRAP_PEER, Method::Write, "/1337/0/1")
            .with_message_id(id + 1)
            .with_payload(Payload::text("9"));
        harness.inbound.send(Inbound::Request(write)).expect("client stopped");
        verify_response(&harness.next().await, BOOTSTRAP_PEER, id + 1, ResponseCode::Changed);

        // Suspended while bootstrapping.
        harness.request(PeerId(1), id + 2, Method::Read, "/1337/0/1");

        harness.request(BOOTSTRAP_PEER, id + 3, Method::BootstrapFinish, "/");
        verify_response(&harness.next().await, BOOTSTRAP_PEER, id + 3, ResponseCode::Changed);
        assert_eq!(harness.next().await, Sent::Close { peer: BOOTSTRAP_PEER });
        harness.wait_registered(Ssid(1)).await;
    }
    assert!(harness.local.try_recv().is_err(), "a known peer was released");
    verify_counter(&harness.device, "9").await;
}
