//! Deterministic simulation harness for LwM2M client testing.
//!
//! Turmoil-based implementations of the Environment and datagram socket
//! seams, plus a scripted LwM2M server, for deterministic, reproducible
//! end-to-end runs of the real client runtime.
//!
//! # Model-Based Testing
//!
//! The `model` module provides a reference implementation of bootstrap
//! gating. Operations are applied to both the model and a real
//! [`lwm2m_core::Device`], and their observable states are compared.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod model;
pub mod sim_env;
pub mod sim_server;
pub mod sim_transport;

pub use model::{
    ModelWorld, ObservableState, Operation, OperationResult, PeerSlot, RequestKind,
};
pub use sim_env::SimEnv;
pub use sim_server::{Observed, SimServer};
pub use sim_transport::{SimClient, SimSocket, SimTransport, bind_client};
