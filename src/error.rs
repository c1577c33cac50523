//! Error types for the lease engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;

use crate::state::{LeaseEvent, LeaseState};

/// Errors that can occur while allocating, committing or persisting leases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease journal).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inbound datagram that cannot be turned into a typed request.
    ///
    /// Covers short packets, bad magic cookies, truncated options, missing
    /// message types and missing client identifiers. Never answered.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Every address of the dynamic range is reserved, offered, leased or
    /// quarantined.
    #[error("No available addresses in pool")]
    PoolExhausted,

    /// The address is reserved for a different client, or the client asked
    /// for something other than its own reservation.
    #[error("Address {0} conflicts with a reservation")]
    ReservationConflict(Ipv4Addr),

    /// The address is bound to another client's active lease.
    #[error("Address {0} is leased to another client")]
    AddressInUse(Ipv4Addr),

    /// The request names an address with no outstanding offer, lease or
    /// reservation for this client.
    #[error("No offer or lease for address {0}")]
    NoBinding(Ipv4Addr),

    /// The lease state machine rejected the event.
    #[error("Invalid transition: {event:?} in state {state:?}")]
    InvalidTransition { state: LeaseState, event: LeaseEvent },

    /// The persistence layer could not record a state change.
    ///
    /// The state transition that triggered the write was not applied.
    #[error("Lease store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration rejected at construction time.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No configured subnet matches the given network address.
    #[error("Unknown subnet {0}")]
    UnknownSubnet(Ipv4Addr),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges.
    #[error("Socket error: {0}")]
    Socket(String),
}

impl Error {
    /// Returns true for errors that are resolved at the protocol level with a
    /// Nak or a silent drop rather than surfaced to the operator.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage(_)
                | Self::PoolExhausted
                | Self::ReservationConflict(_)
                | Self::AddressInUse(_)
                | Self::NoBinding(_)
                | Self::InvalidTransition { .. }
                | Self::UnknownSubnet(_)
        )
    }
}

/// A specialized Result type for lease engine operations.
pub type Result<T> = std::result::Result<T, Error>;
