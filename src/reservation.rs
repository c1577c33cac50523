//! Fixed client-to-address bindings for one subnet.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::config::SubnetConfig;
use crate::error::Result;
use crate::lease::ClientId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub client_id: ClientId,
    pub ip_address: Ipv4Addr,
    pub hostname: Option<String>,
}

/// Immutable after construction, so it is read without the subnet lock.
#[derive(Debug, Clone, Default)]
pub struct ReservationSet {
    by_client: HashMap<ClientId, Reservation>,
    by_address: HashMap<Ipv4Addr, ClientId>,
}

impl ReservationSet {
    /// Builds the set from an already validated subnet.
    pub fn from_config(subnet: &SubnetConfig) -> Result<Self> {
        let mut set = Self::default();
        for entry in &subnet.reservations {
            set.insert(Reservation {
                client_id: entry.client_id()?,
                ip_address: entry.ip_address,
                hostname: entry.hostname.clone(),
            });
        }
        Ok(set)
    }

    fn insert(&mut self, reservation: Reservation) {
        self.by_address
            .insert(reservation.ip_address, reservation.client_id.clone());
        self.by_client
            .insert(reservation.client_id.clone(), reservation);
    }

    pub fn lookup(&self, client_id: &ClientId) -> Option<&Reservation> {
        self.by_client.get(client_id)
    }

    /// Returns the client an address is reserved for.
    pub fn owner_of(&self, address: Ipv4Addr) -> Option<&ClientId> {
        self.by_address.get(&address)
    }

    pub fn is_reserved(&self, address: Ipv4Addr) -> bool {
        self.by_address.contains_key(&address)
    }

    /// Returns true if `address` is reserved for someone other than `client_id`.
    pub fn is_reserved_for_other(&self, address: Ipv4Addr, client_id: &ClientId) -> bool {
        self.owner_of(address)
            .is_some_and(|owner| owner != client_id)
    }

    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.by_address.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }
}
