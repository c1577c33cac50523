//! Dynamic address pool for one subnet.
//!
//! The pool only knows address status. Who holds an address is recorded in
//! the lease table; the pool is rebuilt from it on startup.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Status of one pool address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressStatus {
    Free,
    /// Held by a reservation; never handed out dynamically.
    Reserved,
    /// Held by an outstanding offer.
    Offered,
    Leased,
    /// Quarantined after a DECLINE until the deadline passes.
    Declined { until: DateTime<Utc> },
}

/// Point-in-time partition of the pool range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub free: Vec<Ipv4Addr>,
    pub reserved: Vec<Ipv4Addr>,
    pub offered: Vec<Ipv4Addr>,
    pub leased: Vec<Ipv4Addr>,
    pub declined: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone)]
pub struct AddressPool {
    start: Ipv4Addr,
    end: Ipv4Addr,
    /// Free addresses, sorted for ascending allocation.
    free: BTreeSet<Ipv4Addr>,
    /// Every address that is not free.
    held: BTreeMap<Ipv4Addr, AddressStatus>,
}

impl AddressPool {
    /// Creates a pool covering `start..=end` with every address free.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        let free = (u32::from(start)..=u32::from(end))
            .map(Ipv4Addr::from)
            .collect();
        Self {
            start,
            end,
            free,
            held: BTreeMap::new(),
        }
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        (self.start..=self.end).contains(&address)
    }

    pub fn size(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Returns the status of `address`, or `None` outside the range.
    pub fn status(&self, address: Ipv4Addr) -> Option<AddressStatus> {
        if !self.contains(address) {
            return None;
        }
        Some(
            self.held
                .get(&address)
                .copied()
                .unwrap_or(AddressStatus::Free),
        )
    }

    /// Removes `address` from dynamic allocation for good.
    ///
    /// Addresses outside the range are ignored.
    pub fn reserve(&mut self, address: Ipv4Addr) {
        if self.contains(address) {
            self.free.remove(&address);
            self.held.insert(address, AddressStatus::Reserved);
        }
    }

    /// Takes the lowest free address and marks it offered.
    ///
    /// Quarantined addresses whose probation has ended are returned to the
    /// free set first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if nothing is free.
    pub fn allocate_next_free(&mut self, now: DateTime<Utc>) -> Result<Ipv4Addr> {
        self.reclaim_declined(now);
        let address = self.free.pop_first().ok_or(Error::PoolExhausted)?;
        self.held.insert(address, AddressStatus::Offered);
        Ok(address)
    }

    /// Marks one specific free address as offered.
    ///
    /// Returns false if the address is outside the range or not free.
    pub fn claim(&mut self, address: Ipv4Addr, now: DateTime<Utc>) -> bool {
        self.reclaim_declined(now);
        if self.free.remove(&address) {
            self.held.insert(address, AddressStatus::Offered);
            true
        } else {
            false
        }
    }

    /// Marks a free or offered address as leased.
    pub fn mark_leased(&mut self, address: Ipv4Addr) {
        if !self.contains(address) {
            return;
        }
        if let Some(AddressStatus::Reserved) = self.held.get(&address) {
            return;
        }
        self.free.remove(&address);
        self.held.insert(address, AddressStatus::Leased);
    }

    /// Returns an offered, leased or declined address to the free set.
    ///
    /// Idempotent: free, reserved and out-of-range addresses are left alone.
    pub fn release(&mut self, address: Ipv4Addr) {
        match self.held.get(&address) {
            Some(AddressStatus::Offered | AddressStatus::Leased | AddressStatus::Declined { .. }) => {
                self.held.remove(&address);
                self.free.insert(address);
            }
            Some(AddressStatus::Reserved | AddressStatus::Free) | None => {}
        }
    }

    /// Quarantines `address` until `until`.
    pub fn mark_declined(&mut self, address: Ipv4Addr, until: DateTime<Utc>) {
        if !self.contains(address) {
            return;
        }
        if let Some(AddressStatus::Reserved) = self.held.get(&address) {
            return;
        }
        self.free.remove(&address);
        self.held.insert(address, AddressStatus::Declined { until });
    }

    /// Frees quarantined addresses whose probation ended. Returns how many.
    pub fn reclaim_declined(&mut self, now: DateTime<Utc>) -> usize {
        let elapsed: Vec<Ipv4Addr> = self
            .held
            .iter()
            .filter(|(_, status)| matches!(status, AddressStatus::Declined { until } if *until <= now))
            .map(|(address, _)| *address)
            .collect();

        for address in &elapsed {
            self.held.remove(address);
            self.free.insert(*address);
        }

        elapsed.len()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut snapshot = PoolSnapshot {
            free: self.free.iter().copied().collect(),
            ..Default::default()
        };
        for (address, status) in &self.held {
            match status {
                AddressStatus::Free => snapshot.free.push(*address),
                AddressStatus::Reserved => snapshot.reserved.push(*address),
                AddressStatus::Offered => snapshot.offered.push(*address),
                AddressStatus::Leased => snapshot.leased.push(*address),
                AddressStatus::Declined { .. } => snapshot.declined.push(*address),
            }
        }
        snapshot
    }
}
