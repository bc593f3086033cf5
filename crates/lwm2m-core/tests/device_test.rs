//! Device scenarios across bootstrap, access control and registration
//!
//! These tests drive the sans-IO device through whole exchanges:
//! - Bootstrap with a stranger knocking while bound
//! - Resumption of suspended sessions after Bootstrap-Finish
//! - Discover listings in both modes and both generations
//! - Disable / re-register timing
//!
//! # Oracle Pattern
//!
//! Scenarios end with oracle functions that check the device's observable
//! state rather than individual actions:
//! - Sessions the device services
//! - Server entry states
//! - Resource values in the tree

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;
use lwm2m_core::{
    BootstrapState, Device, DeviceAction, DeviceConfig, DeviceEvent, Environment, PeerRole,
    Resource, ServerProvision, ServerState, Ssid,
};
use lwm2m_proto::{
    ContentFormat, Lwm2mVersion, Method, Path, Payload, PeerId, Request, Response, ResponseCode,
    SessionTicket,
};

const BOOTSTRAP_PEER: PeerId = PeerId(0xB5);
const STRANGER: PeerId = PeerId(0x99);
const SERVER_A: PeerId = PeerId(0xA1);
const SERVER_B: PeerId = PeerId(0xA2);

/// Manually advanced clock.
#[derive(Clone)]
struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    fn new() -> Self {
        Self { now: Arc::new(Mutex::new(Instant::now())) }
    }

    fn advance(&self, by: Duration) -> Instant {
        let mut now = self.now.lock().expect("clock poisoned");
        *now += by;
        *now
    }
}

impl Environment for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().expect("clock poisoned")
    }

    fn sleep(&self, _duration: Duration) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        buffer.fill(0x5A);
    }
}

/// Helper: device with a bootstrap server and one demo object holding an
/// executable counter at `/1337/0/2` over `/1337/0/1`.
fn create_device(version: Lwm2mVersion) -> (ManualClock, Device<ManualClock>) {
    let clock = ManualClock::new();
    let config = DeviceConfig { version, ..DeviceConfig::default() };
    let mut device = Device::new(clock.clone(), config);

    device.provision_bootstrap_server("coap://bootstrap.example").expect("bootstrap server");
    device.register_object(1337, None);
    device.register_executable(1337, 2, |instance, _| {
        let value = instance.get(&1).and_then(Resource::as_u64).unwrap_or_default();
        instance.insert(1, Resource::text((value + 1).to_string()));
        Ok(())
    });

    (clock, device)
}

/// Helper: establish a server session and complete its registration.
fn register(device: &mut Device<ManualClock>, peer: PeerId, ssid: Ssid) {
    device
        .handle(DeviceEvent::SessionEstablished {
            peer,
            role: PeerRole::Server(ssid),
            ticket: Some(SessionTicket(Bytes::from(format!("ticket-{}", ssid.0)))),
        })
        .expect("session established");
    device.handle(DeviceEvent::RegistrationCompleted { ssid }).expect("registration completed");
}

fn send(device: &mut Device<ManualClock>, request: Request) -> Vec<DeviceAction> {
    device.handle(DeviceEvent::Request(request)).expect("requests never fail")
}

fn response(actions: &[DeviceAction]) -> Option<&Response> {
    actions.iter().find_map(|action| match action {
        DeviceAction::Respond { response, .. } => Some(response),
        _ => None,
    })
}

fn code(actions: &[DeviceAction]) -> Option<ResponseCode> {
    response(actions).map(|response| response.code)
}

fn body(actions: &[DeviceAction]) -> String {
    let response = response(actions).expect("expected a response");
    String::from_utf8(response.payload.to_vec()).expect("utf-8 body")
}

fn count(actions: &[DeviceAction], pred: impl Fn(&DeviceAction) -> bool) -> usize {
    actions.iter().filter(|action| pred(action)).count()
}

/// Oracle: the device services exactly `expected` sessions, and `silent`
/// is not among them.
fn verify_sessions(device: &Device<ManualClock>, expected: usize, silent: PeerId) {
    assert_eq!(
        device.active_session_count(),
        expected,
        "expected {expected} active sessions, got {}",
        device.active_session_count()
    );
    assert!(!device.is_session_active(silent), "{silent} must not be serviced");
}

/// Oracle: resource `/oid/iid/rid` holds `expected`.
fn verify_value(device: &Device<ManualClock>, oid: u16, iid: u16, rid: u16, expected: &str) {
    let value = device.tree().resource(oid, iid, rid).and_then(Resource::as_text);
    assert_eq!(value, Some(expected), "/{oid}/{iid}/{rid} holds {value:?}");
}

#[test]
fn test_bootstrap_drops_strangers_and_resumes_after_finish() {
    let (_, mut device) = create_device(Lwm2mVersion::V1_0);
    device.provision_server(ServerProvision::new(Ssid(1), "coap://a.example")).expect("server");
    device.start();
    register(&mut device, SERVER_A, Ssid(1));
    device
        .handle(DeviceEvent::SessionEstablished {
            peer: BOOTSTRAP_PEER,
            role: PeerRole::Bootstrap,
            ticket: None,
        })
        .expect("bootstrap session");

    let actions = device
        .handle(DeviceEvent::BootstrapRequested { peer: BOOTSTRAP_PEER })
        .expect("bootstrap requested");
    assert!(actions.contains(&DeviceAction::SuspendSession { ssid: Ssid(1), peer: SERVER_A }));

    // Bound peer provisions the demo value
    let write = Request::new(BOOTSTRAP_PEER, Method::Write, "/1337/0/1")
        .with_payload(Payload::text("42"));
    assert_eq!(code(&send(&mut device, write)), Some(ResponseCode::Changed));

    // Stranger and suspended server are ignored without any action
    let poke = Request::new(STRANGER, Method::Execute, "/1337/0/2");
    assert!(send(&mut device, poke).is_empty());
    let read = Request::new(SERVER_A, Method::Read, "/1337/0/1");
    assert!(send(&mut device, read).is_empty());
    verify_sessions(&device, 1, STRANGER);

    let execute = Request::new(BOOTSTRAP_PEER, Method::Execute, "/1337/0/2");
    assert_eq!(code(&send(&mut device, execute)), Some(ResponseCode::Changed));
    verify_value(&device, 1337, 0, 1, "43");

    let finish = Request::new(BOOTSTRAP_PEER, Method::BootstrapFinish, "/");
    let actions = send(&mut device, finish);
    assert_eq!(code(&actions), Some(ResponseCode::Changed));
    assert!(actions.contains(&DeviceAction::CloseSession { peer: BOOTSTRAP_PEER }));
    let resumes = count(&actions, |a| {
        matches!(a, DeviceAction::ResumeSession { ssid: Ssid(1), peer: SERVER_A, .. })
    });
    assert_eq!(resumes, 1, "suspended session resumes, no fresh handshake");
    assert_eq!(device.bootstrap_state(), BootstrapState::Operational);

    // Still resuming: the server's traffic waits for the transport
    let read = Request::new(SERVER_A, Method::Read, "/1337/0/1");
    assert!(send(&mut device, read.clone()).is_empty());

    device
        .handle(DeviceEvent::SessionResumed {
            ssid: Ssid(1),
            peer: SERVER_A,
            ticket: None,
            resumed: true,
        })
        .expect("resumed");
    let actions = send(&mut device, read);
    assert_eq!(code(&actions), Some(ResponseCode::Content));
    assert_eq!(body(&actions), "43");
    verify_sessions(&device, 1, BOOTSTRAP_PEER);
}

#[test]
fn test_servers_provisioned_by_bootstrap_register_after_finish() {
    let (_, mut device) = create_device(Lwm2mVersion::V1_1);
    device.start();
    let actions = device
        .handle(DeviceEvent::BootstrapRequested { peer: BOOTSTRAP_PEER })
        .expect("bootstrap requested");
    assert!(actions.contains(&DeviceAction::SendBootstrapRequest { peer: BOOTSTRAP_PEER }));

    let security = Request::new(BOOTSTRAP_PEER, Method::Write, "/0/5").with_payload(
        Payload::Instance(vec![
            (0, Bytes::from_static(b"coap://new.example")),
            (1, Bytes::from_static(b"0")),
            (10, Bytes::from_static(b"7")),
        ]),
    );
    assert_eq!(code(&send(&mut device, security)), Some(ResponseCode::Changed));

    let server = Request::new(BOOTSTRAP_PEER, Method::Write, "/1")
        .with_payload(Payload::Instances(vec![(3, vec![(0, Bytes::from_static(b"7"))])]));
    assert_eq!(code(&send(&mut device, server)), Some(ResponseCode::Changed));

    // No registration while bootstrapping
    assert_eq!(device.servers().get(Ssid(7)).map(|entry| entry.state), Some(ServerState::Idle));

    let actions = send(&mut device, Request::new(BOOTSTRAP_PEER, Method::BootstrapFinish, "/"));
    let registers = count(&actions, |a| match a {
        DeviceAction::Register { ssid: Ssid(7), uri, .. } => uri == "coap://new.example",
        _ => false,
    });
    assert_eq!(registers, 1);
    assert_eq!(
        device.servers().get(Ssid(7)).map(|entry| entry.state),
        Some(ServerState::Registering)
    );
}

#[test]
fn test_discover_lists_instances_in_ascending_order() {
    let (_, mut device) = create_device(Lwm2mVersion::V1_0);
    device.provision_server(ServerProvision::new(Ssid(1), "coap://a.example")).expect("server");
    device.start();
    register(&mut device, SERVER_A, Ssid(1));

    let create = Request::new(SERVER_A, Method::Create, "/1337");
    assert_eq!(code(&send(&mut device, create)), Some(ResponseCode::Created));
    for iid in [42, 24] {
        device.set_resource(&Path::for_resource(1337, iid, 1), "0").expect("set");
    }

    let actions = send(&mut device, Request::new(SERVER_A, Method::Discover, "/1337"));
    let response = response(&actions).expect("response");
    assert_eq!(response.code, ResponseCode::Content);
    assert_eq!(response.content_format, Some(ContentFormat::LinkFormat));
    assert_eq!(
        body(&actions),
        "</1337>,</1337/0>,</1337/24>,</1337/24/1>,</1337/42>,</1337/42/1>"
    );
}

#[test]
fn test_discover_of_missing_object_is_not_found_with_empty_body() {
    let (_, mut device) = create_device(Lwm2mVersion::V1_1);
    device.provision_server(ServerProvision::new(Ssid(1), "coap://a.example")).expect("server");
    device.start();
    register(&mut device, SERVER_A, Ssid(1));

    let actions = send(&mut device, Request::new(SERVER_A, Method::Discover, "/4242"));
    let response = response(&actions).expect("response");
    assert_eq!(response.code, ResponseCode::NotFound);
    assert!(response.payload.is_empty());
}

#[test]
fn test_bootstrap_discover_carries_ssid_and_uri_under_1_1() {
    let (_, mut device) = create_device(Lwm2mVersion::V1_1);
    device.provision_server(ServerProvision::new(Ssid(1), "coap://a.example")).expect("server");
    device.handle(DeviceEvent::BootstrapRequested { peer: BOOTSTRAP_PEER }).expect("bootstrap");

    let actions = send(&mut device, Request::new(BOOTSTRAP_PEER, Method::Discover, "/0"));
    let expected = concat!(
        r#"</>;lwm2m=1.1,</0>,</0/0>;uri="coap://bootstrap.example","#,
        r#"</0/1>;ssid=1;uri="coap://a.example""#,
    );
    assert_eq!(body(&actions), expected);
}

#[test]
fn test_disable_deregisters_once_and_reregisters_once() {
    let (clock, mut device) = create_device(Lwm2mVersion::V1_0);
    let provision = ServerProvision {
        disable_timeout: Some(Duration::from_secs(2)),
        ..ServerProvision::new(Ssid(1), "coap://a.example")
    };
    device.provision_server(provision).expect("server");
    device.start();
    register(&mut device, SERVER_A, Ssid(1));

    let mut observed = send(&mut device, Request::new(SERVER_A, Method::Execute, "/1/1/4"));
    assert_eq!(code(&observed), Some(ResponseCode::Changed));
    assert!(!device.is_session_active(SERVER_A));

    // Tick in 100ms steps for 3 seconds
    let mut registered_at = None;
    for step in 1..=30 {
        let now = clock.advance(Duration::from_millis(100));
        let actions = device.handle(DeviceEvent::Tick { now }).expect("tick");
        let registering = actions.iter().any(|a| matches!(a, DeviceAction::Register { .. }));
        if registering && registered_at.is_none() {
            registered_at = Some(step);
        }
        observed.extend(actions);
    }

    assert_eq!(count(&observed, |a| matches!(a, DeviceAction::Deregister { .. })), 1);
    assert_eq!(count(&observed, |a| matches!(a, DeviceAction::Register { .. })), 1);
    assert_eq!(count(&observed, |a| matches!(a, DeviceAction::Update { .. })), 0);
    assert_eq!(registered_at, Some(20), "re-registration at the disable timeout");
}

#[test]
fn test_update_trigger_on_disabled_server_is_bad_request() {
    let (_, mut device) = create_device(Lwm2mVersion::V1_0);
    for (ssid, uri) in [(Ssid(1), "coap://a.example"), (Ssid(2), "coap://b.example")] {
        device.provision_server(ServerProvision::new(ssid, uri)).expect("server");
    }
    device.add_access_entry("/1/1,2,15".parse().expect("entry")).expect("acl");
    device.start();
    register(&mut device, SERVER_A, Ssid(1));
    register(&mut device, SERVER_B, Ssid(2));

    send(&mut device, Request::new(SERVER_A, Method::Execute, "/1/1/4"));

    let actions = send(&mut device, Request::new(SERVER_B, Method::Execute, "/1/1/8"));
    assert_eq!(code(&actions), Some(ResponseCode::BadRequest));

    let actions = send(&mut device, Request::new(SERVER_B, Method::Execute, "/1/9/8"));
    assert_eq!(code(&actions), Some(ResponseCode::Unauthorized));
}

#[test]
fn test_access_control_scopes_servers() {
    let (_, mut device) = create_device(Lwm2mVersion::V1_0);
    for (ssid, uri) in [(Ssid(1), "coap://a.example"), (Ssid(2), "coap://b.example")] {
        device.provision_server(ServerProvision::new(ssid, uri)).expect("server");
    }
    device.add_access_entry("/1337,1,16".parse().expect("entry")).expect("acl");
    device.start();
    register(&mut device, SERVER_A, Ssid(1));
    register(&mut device, SERVER_B, Ssid(2));

    let actions = send(&mut device, Request::new(SERVER_A, Method::Create, "/1337"));
    assert_eq!(code(&actions), Some(ResponseCode::Created));

    let actions = send(&mut device, Request::new(SERVER_B, Method::Read, "/1337/0/1"));
    assert_eq!(code(&actions), Some(ResponseCode::Unauthorized));

    let actions = send(&mut device, Request::new(SERVER_B, Method::Discover, "/1337"));
    assert_eq!(code(&actions), Some(ResponseCode::NotFound));

    let actions = send(&mut device, Request::new(SERVER_B, Method::Discover, "/1"));
    assert_eq!(body(&actions), "</1>,</1/2>,</1/2/0>,</1/2/1>,</1/2/5>,</1/2/7>");
}

#[test]
fn test_deleting_server_cancels_pending_reregistration() {
    let (clock, mut device) = create_device(Lwm2mVersion::V1_0);
    for (ssid, uri) in [(Ssid(1), "coap://a.example"), (Ssid(2), "coap://b.example")] {
        device.provision_server(ServerProvision::new(ssid, uri)).expect("server");
    }
    device.add_access_entry("/1/1,2,15".parse().expect("entry")).expect("acl");
    device.start();
    register(&mut device, SERVER_A, Ssid(1));
    register(&mut device, SERVER_B, Ssid(2));

    send(&mut device, Request::new(SERVER_A, Method::Execute, "/1/1/4"));
    let actions = send(&mut device, Request::new(SERVER_B, Method::Delete, "/1/1"));
    assert_eq!(code(&actions), Some(ResponseCode::Deleted));

    let now = clock.advance(Duration::from_secs(86400));
    let actions = device.handle(DeviceEvent::Tick { now }).expect("tick");
    assert_eq!(count(&actions, |a| matches!(a, DeviceAction::Register { ssid: Ssid(1), .. })), 0);
    assert!(device.servers().get(Ssid(1)).is_none());
}

#[test]
fn test_bootstrap_timeout_is_an_implicit_finish() {
    let (clock, mut device) = create_device(Lwm2mVersion::V1_0);
    device.provision_server(ServerProvision::new(Ssid(1), "coap://a.example")).expect("server");
    device.start();
    register(&mut device, SERVER_A, Ssid(1));
    device.handle(DeviceEvent::BootstrapRequested { peer: BOOTSTRAP_PEER }).expect("bootstrap");

    // Activity re-arms the deadline
    clock.advance(Duration::from_secs(200));
    send(&mut device, Request::new(BOOTSTRAP_PEER, Method::Discover, "/"));
    let now = clock.advance(Duration::from_secs(100));
    assert!(device.handle(DeviceEvent::Tick { now }).expect("tick").is_empty());
    assert_eq!(device.bootstrap_state(), BootstrapState::Bootstrapping);

    // Server timers are frozen while bootstrapping
    let now = clock.advance(Duration::from_secs(147));
    let actions = device.handle(DeviceEvent::Tick { now }).expect("tick");
    assert_eq!(device.bootstrap_state(), BootstrapState::Operational);
    assert!(actions.contains(&DeviceAction::CloseSession { peer: BOOTSTRAP_PEER }));
    assert_eq!(
        count(&actions, |a| matches!(a, DeviceAction::ResumeSession { ssid: Ssid(1), .. })),
        1
    );
}

#[test]
fn test_session_loss_resumes_with_ticket() {
    let (_, mut device) = create_device(Lwm2mVersion::V1_0);
    device.provision_server(ServerProvision::new(Ssid(1), "coap://a.example")).expect("server");
    device.start();
    register(&mut device, SERVER_A, Ssid(1));

    let actions = device.handle(DeviceEvent::SessionLost { peer: SERVER_A }).expect("lost");
    assert!(matches!(
        actions.as_slice(),
        [DeviceAction::ResumeSession { ssid: Ssid(1), peer: SERVER_A, .. }]
    ));

    // Resumption failing falls back to a fresh registration
    let actions = device.handle(DeviceEvent::SessionLost { peer: SERVER_A }).expect("lost");
    assert_eq!(count(&actions, |a| matches!(a, DeviceAction::Register { .. })), 1);
}
