//! LwM2M client core
//!
//! Sans-IO state machine for the device side of LwM2M: the object tree,
//! bootstrap session gating, per-server access control, Discover rendering
//! and the lifecycle of every server registration.
//!
//! # Architecture
//!
//! ```text
//! lwm2m-core
//!   ├─ Device            (event in, actions out)
//!   │   ├─ BootstrapSession   (admission while bootstrapping)
//!   │   ├─ AccessControl      (per-SSID rights, derived from object 2)
//!   │   ├─ ServerRegistry     (one entry per Server instance)
//!   │   └─ ObjectTree         (objects / instances / resources)
//!   └─ DiscoverBuilder   (CoRE link-format listings)
//! ```
//!
//! The device never touches sockets or clocks. Time comes from the
//! [`Environment`] and the caller executes the returned [`DeviceAction`]s in
//! order.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod bootstrap;
pub mod device;
pub mod discover;
pub mod dm;
pub mod env;
pub mod error;
pub mod event;
pub mod registry;

pub use access::{AccessControl, AccessEntry, AccessMask, AccessTarget};
pub use bootstrap::{Admission, BootstrapSession, BootstrapState};
pub use device::{Device, DeviceConfig, ExecuteHandler, ServerProvision};
pub use discover::{DiscoverBuilder, DiscoverMode};
pub use dm::{Instance, ObjectTree, Resource};
pub use env::Environment;
pub use error::{DeviceError, RequestError};
pub use event::{DeviceAction, DeviceEvent, LogLevel, PeerRole};
pub use registry::{ServerEntry, ServerRegistry, ServerState, Ssid};
