//! Fuzz target for bootstrap gating in [`Device`]
//!
//! Prevent a regular server (or anyone else) from touching the object tree
//! while the Bootstrap Server holds the device.
//!
//! # Strategy
//!
//! - Request sequences: arbitrary methods, raw paths and payloads from the
//!   bootstrap peer, the regular server and strangers
//! - Session churn: the Bootstrap Server reconnects at random points
//! - Timeout testing: advance time to trigger the implicit finish
//!
//! # Invariants
//!
//! - While Bootstrapping, no peer but the bound one gets any response
//! - Strangers never get a response
//! - Responses only ever go to the requesting peer
//! - Bootstrapping if and only if a peer is bound
//! - NEVER panic on unparseable paths or payloads

#![no_main]

use std::{collections::VecDeque, time::Duration};

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use lwm2m_core::{
    BootstrapState, Device, DeviceAction, DeviceConfig, DeviceEvent, Environment, PeerRole,
    ServerProvision, Ssid,
};
use lwm2m_harness::{PeerSlot, SimEnv};
use lwm2m_proto::{Method, Payload, PeerId, Request};

const METHODS: [Method; 8] = [
    Method::Create,
    Method::Read,
    Method::Write,
    Method::Execute,
    Method::Delete,
    Method::Discover,
    Method::Observe,
    Method::BootstrapFinish,
];

#[derive(Debug, Clone, Arbitrary)]
enum GateEvent {
    Request { from: PeerSlot, method: u8, path: String, payload: FuzzedPayload },
    ConnectBootstrap,
    Tick { advance_secs: u8 },
}

#[derive(Debug, Clone, Arbitrary)]
enum FuzzedPayload {
    Empty,
    Text(Vec<u8>),
    Instance(Vec<(u16, Vec<u8>)>),
}

impl FuzzedPayload {
    fn into_payload(self) -> Payload {
        match self {
            Self::Empty => Payload::Empty,
            Self::Text(bytes) => Payload::Text(Bytes::from(bytes)),
            Self::Instance(resources) => Payload::Instance(
                resources.into_iter().map(|(rid, value)| (rid, Bytes::from(value))).collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Arbitrary)]
struct FuzzInput {
    seed: u64,
    events: Vec<GateEvent>,
}

/// Run actions the way the runtime would, with every session and
/// registration succeeding at once. Returns the responses.
fn execute(device: &mut Device<SimEnv>, actions: Vec<DeviceAction>) -> Vec<(PeerId, u16)> {
    let mut queue: VecDeque<_> = actions.into();
    let mut responses = Vec::new();

    while let Some(action) = queue.pop_front() {
        match action {
            DeviceAction::Respond { peer, message_id, .. } => responses.push((peer, message_id)),
            DeviceAction::Register { ssid, .. } => {
                if device.servers().get(ssid).and_then(|entry| entry.peer).is_none() {
                    let established = DeviceEvent::SessionEstablished {
                        peer: PeerSlot::Server.peer_id(),
                        role: PeerRole::Server(ssid),
                        ticket: None,
                    };
                    queue.extend(device.handle(established).unwrap_or_default());
                }
                let completed = DeviceEvent::RegistrationCompleted { ssid };
                queue.extend(device.handle(completed).unwrap_or_default());
            },
            _ => {},
        }
    }
    responses
}

fn connect_bootstrap(device: &mut Device<SimEnv>) {
    let established = DeviceEvent::SessionEstablished {
        peer: PeerSlot::Bootstrap.peer_id(),
        role: PeerRole::Bootstrap,
        ticket: None,
    };
    let actions = device.handle(established).unwrap_or_default();
    execute(device, actions);
}

fuzz_target!(|input: FuzzInput| {
    let env = SimEnv::manual(input.seed);
    let config =
        DeviceConfig { bootstrap_timeout: Duration::from_secs(60), ..DeviceConfig::default() };
    let mut device = Device::new(env.clone(), config);
    if device.provision_bootstrap_server("coap://bootstrap").is_err()
        || device.provision_server(ServerProvision::new(Ssid(1), "coap://server")).is_err()
    {
        return;
    }
    let actions = device.start();
    execute(&mut device, actions);
    connect_bootstrap(&mut device);

    let mut message_id: u16 = 0;
    for event in input.events {
        let bound_before = device.bound_peer();

        match event {
            GateEvent::Request { from, method, path, payload } => {
                message_id = message_id.wrapping_add(1);
                let peer = from.peer_id();
                let method = METHODS[usize::from(method) % METHODS.len()];
                let request = Request::new(peer, method, path)
                    .with_payload(payload.into_payload())
                    .with_message_id(message_id);

                let actions = match device.try_handle_shared(&request) {
                    Some(actions) => actions,
                    None => device.handle(DeviceEvent::Request(request)).unwrap_or_default(),
                };
                let responses = execute(&mut device, actions);

                for (to, id) in responses.iter().filter(|(_, id)| *id == message_id) {
                    assert_eq!(*to, peer, "response for message {id} went to {to}");
                }
                let answered = responses.iter().any(|(to, id)| *to == peer && *id == message_id);
                if matches!(from, PeerSlot::Stranger(_)) {
                    assert!(!answered, "stranger {peer} was answered");
                }
                if let Some(bound) = bound_before {
                    if bound != peer {
                        assert!(!answered, "{peer} answered while {bound} was bound");
                    }
                }
            },
            GateEvent::ConnectBootstrap => connect_bootstrap(&mut device),
            GateEvent::Tick { advance_secs } => {
                env.advance(Duration::from_secs(u64::from(advance_secs)));
                let now = env.now();
                let actions = device.handle(DeviceEvent::Tick { now }).unwrap_or_default();
                execute(&mut device, actions);
            },
        }

        assert_eq!(
            device.bootstrap_state() == BootstrapState::Bootstrapping,
            device.bound_peer().is_some(),
            "phase and binding disagree"
        );
    }
});
