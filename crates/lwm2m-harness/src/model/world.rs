//! Model world - the bootstrap gate and one resource.
//!
//! The world is the oracle against which the real device is verified. It
//! tracks time in whole seconds, the bootstrap phase with its inactivity
//! deadline, whether the Bootstrap Server's session is up, and the value
//! of the one application resource both servers read and write.

use lwm2m_core::BootstrapState;
use lwm2m_proto::ResponseCode;

use super::operation::{Operation, OperationResult, PeerSlot, RequestKind};

/// Value of the application resource before anyone writes it.
pub const INITIAL_VALUE: &str = "0";

/// Observable state for oracle comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservableState {
    /// Bootstrap phase.
    pub phase: BootstrapState,
    /// True while bound to the Bootstrap Server's session.
    pub bound_to_bootstrap: bool,
    /// True if the regular server's session is serviced.
    pub server_active: bool,
    /// Current value of the application resource.
    pub value: String,
}

/// Model world - the reference implementation.
#[derive(Debug, Clone)]
pub struct ModelWorld {
    bootstrap_timeout: u64,
    now: u64,
    phase: BootstrapState,
    deadline: Option<u64>,
    bootstrap_connected: bool,
    value: String,
}

impl ModelWorld {
    /// Registered with the regular server, Bootstrap Server session up,
    /// never bootstrapped.
    pub fn new(bootstrap_timeout_secs: u64) -> Self {
        Self {
            bootstrap_timeout: bootstrap_timeout_secs,
            now: 0,
            phase: BootstrapState::Idle,
            deadline: None,
            bootstrap_connected: true,
            value: INITIAL_VALUE.to_string(),
        }
    }

    /// Seconds since the start.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// True while Bootstrapping.
    pub fn is_bootstrapping(&self) -> bool {
        self.phase == BootstrapState::Bootstrapping
    }

    /// Apply an operation and return the result.
    pub fn apply(&mut self, op: &Operation) -> OperationResult {
        match op {
            Operation::Request { from, kind } => self.apply_request(*from, *kind),
            Operation::ConnectBootstrap => {
                self.bootstrap_connected = true;
                OperationResult::Ok
            },
            Operation::AdvanceTime { secs } => {
                self.now += u64::from(*secs);
                if self.deadline.is_some_and(|deadline| self.now >= deadline) {
                    self.finish();
                }
                OperationResult::Ok
            },
        }
    }

    /// Extract observable state for comparison.
    pub fn observable_state(&self) -> ObservableState {
        ObservableState {
            phase: self.phase,
            bound_to_bootstrap: self.is_bootstrapping(),
            server_active: !self.is_bootstrapping(),
            value: self.value.clone(),
        }
    }

    fn apply_request(&mut self, from: PeerSlot, kind: RequestKind) -> OperationResult {
        match from {
            PeerSlot::Stranger(_) => OperationResult::Dropped,
            PeerSlot::Server if self.is_bootstrapping() => OperationResult::Dropped,
            PeerSlot::Server => match kind {
                RequestKind::Finish => OperationResult::code(ResponseCode::MethodNotAllowed),
                kind => self.access_value(kind),
            },
            PeerSlot::Bootstrap if self.is_bootstrapping() || self.bootstrap_connected => {
                // Any request on the bootstrap session (re)arms the deadline,
                // entering Bootstrapping first if needed.
                self.phase = BootstrapState::Bootstrapping;
                self.deadline = Some(self.now + self.bootstrap_timeout);
                match kind {
                    RequestKind::Finish => {
                        self.finish();
                        OperationResult::code(ResponseCode::Changed)
                    },
                    kind => self.access_value(kind),
                }
            },
            PeerSlot::Bootstrap => OperationResult::Dropped,
        }
    }

    fn access_value(&mut self, kind: RequestKind) -> OperationResult {
        match kind {
            RequestKind::Read => OperationResult::content(self.value.clone()),
            RequestKind::Write(value) => {
                self.value = value.to_string();
                OperationResult::code(ResponseCode::Changed)
            },
            RequestKind::Finish => OperationResult::code(ResponseCode::MethodNotAllowed),
        }
    }

    /// Leave Bootstrapping; the bootstrap session is closed.
    fn finish(&mut self) {
        self.phase = BootstrapState::Operational;
        self.deadline = None;
        self.bootstrap_connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(from: PeerSlot, kind: RequestKind) -> Operation {
        Operation::Request { from, kind }
    }

    #[test]
    fn bootstrap_request_locks_out_the_server() {
        let mut world = ModelWorld::new(60);
        assert!(!world.apply(&request(PeerSlot::Server, RequestKind::Read)).is_dropped());

        world.apply(&request(PeerSlot::Bootstrap, RequestKind::Write(9)));
        assert!(world.is_bootstrapping());
        assert!(world.apply(&request(PeerSlot::Server, RequestKind::Read)).is_dropped());

        let finish = world.apply(&request(PeerSlot::Bootstrap, RequestKind::Finish));
        assert_eq!(finish, OperationResult::code(ResponseCode::Changed));
        assert_eq!(
            world.apply(&request(PeerSlot::Server, RequestKind::Read)),
            OperationResult::content("9")
        );
    }

    #[test]
    fn inactivity_finishes_implicitly() {
        let mut world = ModelWorld::new(60);
        world.apply(&request(PeerSlot::Bootstrap, RequestKind::Read));

        world.apply(&Operation::AdvanceTime { secs: 59 });
        assert!(world.is_bootstrapping());
        world.apply(&request(PeerSlot::Bootstrap, RequestKind::Read));
        world.apply(&Operation::AdvanceTime { secs: 59 });
        assert!(world.is_bootstrapping());

        world.apply(&Operation::AdvanceTime { secs: 1 });
        assert_eq!(world.observable_state().phase, BootstrapState::Operational);
        assert!(world.apply(&request(PeerSlot::Bootstrap, RequestKind::Read)).is_dropped());
    }

    #[test]
    fn reconnected_bootstrap_server_can_start_again() {
        let mut world = ModelWorld::new(60);
        world.apply(&request(PeerSlot::Bootstrap, RequestKind::Finish));
        assert!(world.apply(&request(PeerSlot::Bootstrap, RequestKind::Read)).is_dropped());

        world.apply(&Operation::ConnectBootstrap);
        world.apply(&request(PeerSlot::Bootstrap, RequestKind::Read));
        assert!(world.is_bootstrapping());
    }
}
