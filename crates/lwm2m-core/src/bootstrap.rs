//! Bootstrap session state machine.
//!
//! ```text
//!  Idle ──begin(peer)──> Bootstrapping{peer} ──finish(peer)──> Operational
//!                              │                                   ▲
//!                              └────────── expire(now) ────────────┘
//! ```
//!
//! A session is single-use: a new bootstrap cycle replaces it with a fresh
//! one from [`BootstrapSession::begin`], which drops the old binding and its
//! deadline in one move.
//!
//! # Invariants
//!
//! - While Bootstrapping, [`BootstrapSession::admit`] returns
//!   [`Admission::Drop`] for every peer except the bound one.
//! - Operational is terminal for a session.
//! - Only the bound peer can finish.

use std::time::{Duration, Instant};

use lwm2m_proto::PeerId;
use thiserror::Error;

/// Observable phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// No bootstrap has taken place in this session.
    Idle,
    /// Bound to one bootstrap peer.
    Bootstrapping,
    /// Bootstrap completed.
    Operational,
}

/// Admission decision for an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Process the request.
    Admit,
    /// Discard without any response.
    Drop,
}

/// Invalid bootstrap transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BootstrapError {
    /// Finish outside of Bootstrapping.
    #[error("not bootstrapping")]
    NotBootstrapping,

    /// Finish from a peer other than the bound one.
    #[error("{0} is not the bound bootstrap peer")]
    WrongPeer(PeerId),
}

#[derive(Debug, Clone)]
enum Phase {
    Idle,
    Bootstrapping { peer: PeerId, timeout: Duration, deadline: Instant },
    Operational,
}

/// Bootstrap session.
#[derive(Debug, Clone)]
pub struct BootstrapSession {
    phase: Phase,
}

impl Default for BootstrapSession {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapSession {
    /// Idle session, as created at device start.
    pub fn new() -> Self {
        Self { phase: Phase::Idle }
    }

    /// Fresh session bound to `peer`, expiring after `timeout` of
    /// inactivity.
    pub fn begin(peer: PeerId, now: Instant, timeout: Duration) -> Self {
        Self { phase: Phase::Bootstrapping { peer, timeout, deadline: now + timeout } }
    }

    /// Current phase.
    pub fn state(&self) -> BootstrapState {
        match self.phase {
            Phase::Idle => BootstrapState::Idle,
            Phase::Bootstrapping { .. } => BootstrapState::Bootstrapping,
            Phase::Operational => BootstrapState::Operational,
        }
    }

    /// True while Bootstrapping.
    pub fn is_bootstrapping(&self) -> bool {
        matches!(self.phase, Phase::Bootstrapping { .. })
    }

    /// Peer bound while Bootstrapping.
    pub fn bound_peer(&self) -> Option<PeerId> {
        match self.phase {
            Phase::Bootstrapping { peer, .. } => Some(peer),
            Phase::Idle | Phase::Operational => None,
        }
    }

    /// Admission check on the raw request's peer.
    pub fn admit(&self, peer: PeerId) -> Admission {
        match self.phase {
            Phase::Bootstrapping { peer: bound, .. } if bound != peer => Admission::Drop,
            _ => Admission::Admit,
        }
    }

    /// Re-arm the inactivity deadline after activity from the bound peer.
    pub fn touch(&mut self, now: Instant) {
        if let Phase::Bootstrapping { timeout, deadline, .. } = &mut self.phase {
            *deadline = now + *timeout;
        }
    }

    /// Bootstrap-Finish from `peer`. Returns the peer that was bound.
    pub fn finish(&mut self, peer: PeerId) -> Result<PeerId, BootstrapError> {
        match self.phase {
            Phase::Bootstrapping { peer: bound, .. } if bound == peer => {
                self.phase = Phase::Operational;
                Ok(bound)
            },
            Phase::Bootstrapping { .. } => Err(BootstrapError::WrongPeer(peer)),
            Phase::Idle | Phase::Operational => Err(BootstrapError::NotBootstrapping),
        }
    }

    /// Inactivity deadline.
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Bootstrapping { deadline, .. } => Some(deadline),
            Phase::Idle | Phase::Operational => None,
        }
    }

    /// Finish implicitly if the deadline has passed. Returns the peer that
    /// was bound.
    pub fn expire(&mut self, now: Instant) -> Option<PeerId> {
        match self.phase {
            Phase::Bootstrapping { peer, deadline, .. } if now >= deadline => {
                self.phase = Phase::Operational;
                Some(peer)
            },
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(247);

    #[test]
    fn idle_admits_everyone() {
        let session = BootstrapSession::new();
        assert_eq!(session.state(), BootstrapState::Idle);
        assert_eq!(session.admit(PeerId(1)), Admission::Admit);
        assert_eq!(session.deadline(), None);
    }

    #[test]
    fn only_bound_peer_is_admitted() {
        let session = BootstrapSession::begin(PeerId(1), Instant::now(), TIMEOUT);
        assert_eq!(session.admit(PeerId(1)), Admission::Admit);
        assert_eq!(session.admit(PeerId(2)), Admission::Drop);
    }

    #[test]
    fn finish_requires_bound_peer() {
        let mut session = BootstrapSession::begin(PeerId(1), Instant::now(), TIMEOUT);

        assert_eq!(session.finish(PeerId(2)), Err(BootstrapError::WrongPeer(PeerId(2))));
        assert!(session.is_bootstrapping());

        assert_eq!(session.finish(PeerId(1)), Ok(PeerId(1)));
        assert_eq!(session.state(), BootstrapState::Operational);
        assert_eq!(session.bound_peer(), None);
        assert_eq!(session.admit(PeerId(2)), Admission::Admit);
    }

    #[test]
    fn operational_is_terminal() {
        let mut session = BootstrapSession::begin(PeerId(1), Instant::now(), TIMEOUT);
        session.finish(PeerId(1)).unwrap();

        assert_eq!(session.finish(PeerId(1)), Err(BootstrapError::NotBootstrapping));
        assert_eq!(session.expire(Instant::now() + TIMEOUT * 2), None);
        assert_eq!(session.state(), BootstrapState::Operational);
    }

    #[test]
    fn touch_rearms_deadline() {
        let start = Instant::now();
        let mut session = BootstrapSession::begin(PeerId(1), start, TIMEOUT);

        let later = start + Duration::from_secs(200);
        session.touch(later);
        assert_eq!(session.deadline(), Some(later + TIMEOUT));

        assert_eq!(session.expire(start + TIMEOUT), None);
        assert_eq!(session.expire(later + TIMEOUT), Some(PeerId(1)));
        assert_eq!(session.state(), BootstrapState::Operational);
    }

    proptest! {
        #[test]
        fn strangers_never_admitted(
            bound in any::<u64>(),
            others in prop::collection::vec(any::<u64>(), 0..32),
        ) {
            let session = BootstrapSession::begin(PeerId(bound), Instant::now(), TIMEOUT);
            for other in others.into_iter().filter(|other| *other != bound) {
                prop_assert_eq!(session.admit(PeerId(other)), Admission::Drop);
            }
            prop_assert_eq!(session.admit(PeerId(bound)), Admission::Admit);
        }
    }
}
