//! Write-through lease table for one subnet.
//!
//! Every mutation goes to the [`LeaseStore`] first and is applied in memory
//! only after the store accepted it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::lease::{ClientId, Lease};
use crate::store::LeaseStore;

#[derive(Debug)]
pub struct LeaseTable<S> {
    subnet: Ipv4Addr,
    store: Arc<S>,
    leases: HashMap<ClientId, Lease>,
    /// Address index over leases in an active state.
    by_address: HashMap<Ipv4Addr, ClientId>,
}

impl<S: LeaseStore> LeaseTable<S> {
    pub fn new(subnet: Ipv4Addr, store: Arc<S>) -> Self {
        Self {
            subnet,
            store,
            leases: HashMap::new(),
            by_address: HashMap::new(),
        }
    }

    /// Loads a persisted record without writing it back.
    ///
    /// Used while rebuilding state on startup.
    pub(crate) fn restore(&mut self, lease: Lease) {
        self.index(&lease);
        self.leases.insert(lease.client_id.clone(), lease);
    }

    fn index(&mut self, lease: &Lease) {
        if let Some(previous) = self.leases.get(&lease.client_id)
            && self.by_address.get(&previous.ip_address) == Some(&lease.client_id)
        {
            self.by_address.remove(&previous.ip_address);
        }
        if lease.state.is_active() {
            self.by_address
                .insert(lease.ip_address, lease.client_id.clone());
        }
    }

    /// Persists `lease` and then makes it the client's record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if
    /// the store rejects the write, in which case the table is unchanged.
    pub async fn commit(&mut self, lease: Lease) -> Result<()> {
        debug_assert_eq!(lease.subnet, self.subnet);
        self.store.put(&lease).await?;
        self.index(&lease);
        self.leases.insert(lease.client_id.clone(), lease);
        Ok(())
    }

    /// Deletes the client's record from the store and the table.
    pub async fn purge(&mut self, client_id: &ClientId) -> Result<Option<Lease>> {
        self.store.remove(self.subnet, client_id).await?;
        let removed = self.leases.remove(client_id);
        if let Some(lease) = &removed
            && self.by_address.get(&lease.ip_address) == Some(client_id)
        {
            self.by_address.remove(&lease.ip_address);
        }
        Ok(removed)
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&Lease> {
        self.leases.get(client_id)
    }

    /// Returns the lease currently holding `address`, if it is still active
    /// at `now`.
    pub fn active_holder(&self, address: Ipv4Addr, now: DateTime<Utc>) -> Option<&Lease> {
        self.by_address
            .get(&address)
            .and_then(|client_id| self.leases.get(client_id))
            .filter(|lease| lease.is_active(now))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn active_count(&self, now: DateTime<Utc>) -> usize {
        self.leases
            .values()
            .filter(|lease| lease.is_active(now))
            .count()
    }
}
