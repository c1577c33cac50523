//! Server-side lease lifecycle.
//!
//! ```text
//!            Acknowledge            Renew / T1            Rebind / T2
//!  OFFERED ──────────────▶ BOUND ──────────────▶ RENEWING ───────────▶ REBINDING
//!     │                      ▲ ▲                     │                     │
//!     │ OfferTimeout         │ └──── Acknowledge ────┘                     │
//!     ▼                      └──────────────── Acknowledge ────────────────┘
//!  EXPIRED ◀──── Expire ──── (any active state) ──── Release ────▶ RELEASED
//! ```
//!
//! Terminal states absorb repeated `Expire` and `Release` so that expiry and
//! release are idempotent. Everything else is an [`Error::InvalidTransition`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of a single lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Address offered in response to a DISCOVER, not yet committed.
    Offered,
    /// Committed by an ACK.
    Bound,
    /// Past T1, or the client renewed by unicast.
    Renewing,
    /// Past T2, or the client broadcast a renewal.
    Rebinding,
    /// Lease time ran out (terminal).
    Expired,
    /// Client released or declined the address (terminal).
    Released,
}

/// Events that drive [`LeaseState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseEvent {
    /// Server acknowledged a REQUEST for this binding.
    Acknowledge,
    /// The offer's validity window closed without a REQUEST.
    OfferTimeout,
    /// Client sent a unicast renewal.
    Renew,
    /// Client broadcast a renewal to any authoritative server.
    Rebind,
    /// Renewal timer T1 elapsed.
    T1Elapsed,
    /// Rebinding timer T2 elapsed.
    T2Elapsed,
    /// Lease time elapsed.
    Expire,
    /// Client released or declined the address.
    Release,
}

impl LeaseState {
    /// Returns true for states that hold an address (everything but the
    /// terminal states).
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Returns true for `Expired` and `Released`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Released)
    }

    /// Applies `event` and returns the next state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] when the event is not defined for
    /// this state. The caller's lease is expected to stay unchanged.
    pub fn on(self, event: LeaseEvent) -> Result<Self> {
        use LeaseEvent as E;
        use LeaseState as S;

        let next = match (self, event) {
            (S::Offered, E::Acknowledge) => S::Bound,
            (S::Offered, E::OfferTimeout) => S::Expired,

            (S::Bound | S::Renewing | S::Rebinding, E::Acknowledge) => S::Bound,

            (S::Bound | S::Renewing, E::Renew) => S::Renewing,
            // Client and server clocks disagree about T2; keep rebinding.
            (S::Rebinding, E::Renew) => S::Rebinding,
            (S::Bound, E::T1Elapsed) => S::Renewing,
            (S::Renewing | S::Rebinding, E::T1Elapsed) => self,

            (S::Bound | S::Renewing | S::Rebinding, E::Rebind) => S::Rebinding,
            (S::Bound | S::Renewing | S::Rebinding, E::T2Elapsed) => S::Rebinding,

            (state, E::Expire) if state.is_active() => S::Expired,
            (state, E::Release) if state.is_active() => S::Released,

            (S::Expired, E::Expire | E::OfferTimeout) => S::Expired,
            (S::Released, E::Release | E::Expire) => S::Released,
            (S::Expired, E::Release) => S::Expired,

            (state, event) => return Err(Error::InvalidTransition { state, event }),
        };

        Ok(next)
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offered => write!(f, "OFFERED"),
            Self::Bound => write!(f, "BOUND"),
            Self::Renewing => write!(f, "RENEWING"),
            Self::Rebinding => write!(f, "REBINDING"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Released => write!(f, "RELEASED"),
        }
    }
}
