//! Lease records and client identifiers.
//!
//! A [`Lease`] is a time-bounded binding of one address to one
//! [`ClientId`] inside one subnet. It carries its own [`LeaseState`] and
//! only changes state through [`Lease::apply`], which consults the state
//! machine in [`crate::state`].

use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::state::{LeaseEvent, LeaseState};

/// Hardware type for Ethernet, used as the first byte of MAC-derived ids.
pub const HTYPE_ETHERNET: u8 = 1;

/// Opaque client identifier.
///
/// Taken from DHCP option 61 when the client sends one, otherwise built from
/// the hardware type followed by the hardware address. Rendered as
/// colon-separated lowercase hex, which is also the persisted form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Builds the identifier a client with this hardware address would get
    /// when it sends no option 61.
    pub fn from_hardware(htype: u8, address: &[u8]) -> Self {
        let mut id = Vec::with_capacity(address.len() + 1);
        id.push(htype);
        id.extend_from_slice(address);
        Self(id)
    }

    /// Parses an Ethernet MAC (`aa:bb:cc:dd:ee:ff` or `aa-bb-...`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] unless the input is six hex octets.
    pub fn from_mac(mac: &str) -> Result<Self> {
        let octets = parse_hex_octets(mac)?;
        if octets.len() != 6 {
            return Err(Error::InvalidConfiguration(format!(
                "MAC address {mac} must have 6 octets"
            )));
        }
        Ok(Self::from_hardware(HTYPE_ETHERNET, &octets))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the embedded Ethernet MAC, if this id was derived from one.
    pub fn mac(&self) -> Option<[u8; 6]> {
        match self.0.as_slice() {
            [HTYPE_ETHERNET, rest @ ..] if rest.len() == 6 => rest.try_into().ok(),
            _ => None,
        }
    }
}

fn parse_hex_octets(text: &str) -> Result<Vec<u8>> {
    let normalized = text.trim().to_lowercase().replace('-', ":");
    if normalized.is_empty() {
        return Err(Error::InvalidConfiguration(
            "client identifier must not be empty".to_string(),
        ));
    }
    normalized
        .split(':')
        .map(|part| {
            u8::from_str_radix(part, 16).map_err(|_| {
                Error::InvalidConfiguration(format!("invalid hex octet {part:?} in {text:?}"))
            })
        })
        .collect()
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for ClientId {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        parse_hex_octets(text).map(Self)
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A binding between a client and an address.
///
/// Owned by the lease table once committed. An `Offered` lease lives only
/// in the engine's offer map and is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Network address of the subnet the lease belongs to.
    pub subnet: Ipv4Addr,

    pub client_id: ClientId,

    pub ip_address: Ipv4Addr,

    pub state: LeaseState,

    /// Client-provided hostname (option 12) or the reservation's hostname.
    pub hostname: Option<String>,

    /// When the current lease period started (last ACK, or the offer time).
    pub granted_at: DateTime<Utc>,

    /// When the current lease period (or offer window) ends.
    pub expires_at: DateTime<Utc>,

    /// Length of the lease period in seconds.
    pub lease_seconds: u32,

    /// Transaction id of the request that created or last renewed the lease.
    pub transaction_id: u32,

    /// When the lease reached a terminal state.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,

    /// Set when the lease ended with a DECLINE, so the quarantine survives
    /// a restart.
    #[serde(default)]
    pub declined: bool,
}

impl Lease {
    /// Creates an `Offered` lease that is valid for `offer_seconds`.
    ///
    /// `lease_seconds` is the lease time the offer advertises.
    pub fn offered(
        subnet: Ipv4Addr,
        client_id: ClientId,
        ip_address: Ipv4Addr,
        lease_seconds: u32,
        transaction_id: u32,
        now: DateTime<Utc>,
        offer_seconds: u32,
    ) -> Self {
        Self {
            subnet,
            client_id,
            ip_address,
            state: LeaseState::Offered,
            hostname: None,
            granted_at: now,
            expires_at: now + TimeDelta::seconds(i64::from(offer_seconds)),
            lease_seconds,
            transaction_id,
            ended_at: None,
            declined: false,
        }
    }

    /// Applies `event` through the state machine.
    ///
    /// On error the lease is left untouched.
    pub fn apply(&mut self, event: LeaseEvent, now: DateTime<Utc>) -> Result<()> {
        let next = self.state.on(event)?;
        if next.is_terminal() && !self.state.is_terminal() {
            self.ended_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    /// Commits (or re-commits) the lease for `lease_seconds` starting at `now`.
    pub fn acknowledge(
        &mut self,
        now: DateTime<Utc>,
        lease_seconds: u32,
        transaction_id: u32,
    ) -> Result<()> {
        self.apply(LeaseEvent::Acknowledge, now)?;
        self.granted_at = now;
        self.expires_at = now + TimeDelta::seconds(i64::from(lease_seconds));
        self.lease_seconds = lease_seconds;
        self.transaction_id = transaction_id;
        Ok(())
    }

    /// T1: half of the lease period.
    pub fn renewal_at(&self) -> DateTime<Utc> {
        self.granted_at + TimeDelta::seconds(i64::from(self.lease_seconds / 2))
    }

    /// T2: seven eighths of the lease period.
    pub fn rebinding_at(&self) -> DateTime<Utc> {
        self.granted_at + TimeDelta::seconds(i64::from(self.lease_seconds) * 7 / 8)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns true while the lease holds its address at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state.is_active() && !self.is_expired(now)
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }

    /// Returns the timer event due at `now`, if any.
    ///
    /// Offers time out rather than expire.
    pub fn due_event(&self, now: DateTime<Utc>) -> Option<LeaseEvent> {
        match self.state {
            LeaseState::Offered if self.is_expired(now) => Some(LeaseEvent::OfferTimeout),
            LeaseState::Offered => None,
            state if state.is_terminal() => None,
            _ if self.is_expired(now) => Some(LeaseEvent::Expire),
            LeaseState::Bound | LeaseState::Renewing if now >= self.rebinding_at() => {
                Some(LeaseEvent::T2Elapsed)
            }
            LeaseState::Bound if now >= self.renewal_at() => Some(LeaseEvent::T1Elapsed),
            _ => None,
        }
    }

    /// Applies every timer event due at `now`. Returns true if the state changed.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<bool> {
        let before = self.state;
        while let Some(event) = self.due_event(now) {
            self.apply(event, now)?;
        }
        Ok(self.state != before)
    }
}
