//! Reference model for model-based testing.
//!
//! The model captures bootstrap gating as the protocol describes it, with
//! none of the device's object-tree or registry machinery. It serves as the
//! oracle against which the real [`lwm2m_core::Device`] is verified.
//!
//! # Design Principles
//!
//! - Simplicity: The model should be obviously correct
//! - Behavior, not mechanism: Captures WHAT, not HOW
//! - Deterministic: Same inputs produce same outputs

pub mod operation;
mod world;

pub use operation::{Operation, OperationResult, PeerSlot, RequestKind};
pub use world::{INITIAL_VALUE, ModelWorld, ObservableState};
