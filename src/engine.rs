//! Lease allocation and lifecycle orchestration.
//!
//! The engine owns one [`AddressPool`], one [`LeaseTable`] and the
//! outstanding offers for every configured subnet, all behind a single
//! per-subnet `RwLock`. Every DHCP event takes the subnet's write lock for
//! its whole duration, so two discovers in the same subnet never observe
//! the same free address. Diagnostics take the read lock and return clones.
//!
//! State changes that outlive a request (ACK, release, decline, expiry,
//! purge) are written to the [`LeaseStore`] before the pool or the offer map
//! is touched. If the store refuses, the request fails and nothing changes.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, SubnetConfig};
use crate::error::{Error, Result};
use crate::lease::{ClientId, Lease};
use crate::message::{ClientMessage, RequestKind};
use crate::pool::{AddressPool, PoolSnapshot};
use crate::reservation::ReservationSet;
use crate::state::{LeaseEvent, LeaseState};
use crate::store::LeaseStore;
use crate::table::LeaseTable;

/// What one [`AllocationEngine::sweep`] pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Offers whose validity window closed.
    pub offers_expired: usize,
    /// Leases moved to `Renewing` or `Rebinding` by T1/T2.
    pub timers_advanced: usize,
    pub leases_expired: usize,
    /// Terminal records removed after the audit retention period.
    pub purged: usize,
    /// Declined addresses returned to the pool.
    pub quarantines_lifted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug)]
struct SubnetState<S> {
    pool: AddressPool,
    table: LeaseTable<S>,
    offers: HashMap<ClientId, Lease>,
}

impl<S: LeaseStore> SubnetState<S> {
    /// Returns `address` to the pool unless a live lease or offer still
    /// holds it.
    fn free_address(&mut self, address: Ipv4Addr, now: DateTime<Utc>) {
        let held = self.table.active_holder(address, now).is_some()
            || self.offers.values().any(|offer| offer.ip_address == address);
        if !held {
            self.pool.release(address);
        }
    }

    fn expire_offers(&mut self, now: DateTime<Utc>) -> usize {
        let stale: Vec<ClientId> = self
            .offers
            .iter()
            .filter(|(_, offer)| offer.due_event(now) == Some(LeaseEvent::OfferTimeout))
            .map(|(client_id, _)| client_id.clone())
            .collect();

        for client_id in &stale {
            if let Some(offer) = self.offers.remove(client_id) {
                debug!("Offer of {} to {} timed out", offer.ip_address, client_id);
                self.free_address(offer.ip_address, now);
            }
        }
        stale.len()
    }
}

#[derive(Debug)]
struct Subnet<S> {
    config: SubnetConfig,
    reservations: ReservationSet,
    state: RwLock<SubnetState<S>>,
}

impl<S> Subnet<S> {
    fn network(&self) -> Ipv4Addr {
        self.config.network
    }
}

#[derive(Debug)]
pub struct AllocationEngine<S> {
    config: Arc<Config>,
    subnets: Vec<Subnet<S>>,
    clock: Arc<dyn Clock>,
}

fn seconds(value: u32) -> TimeDelta {
    TimeDelta::seconds(i64::from(value))
}

impl<S: LeaseStore> AllocationEngine<S> {
    /// Validates `config`, loads every persisted lease from `store` and
    /// rebuilds pool status from the lease table and the reservations.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] for a rejected config, or whatever the
    /// store returns from [`LeaseStore::load`].
    pub async fn start(config: Config, store: Arc<S>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let mut subnets = Vec::with_capacity(config.subnets.len());
        for subnet_config in &config.subnets {
            let reservations = ReservationSet::from_config(subnet_config)?;
            let mut pool = AddressPool::new(subnet_config.range_start, subnet_config.range_end);
            for address in reservations.addresses() {
                pool.reserve(address);
            }

            subnets.push(Subnet {
                config: subnet_config.clone(),
                reservations,
                state: RwLock::new(SubnetState {
                    pool,
                    table: LeaseTable::new(subnet_config.network, Arc::clone(&store)),
                    offers: HashMap::new(),
                }),
            });
        }

        let mut engine = Self {
            config: Arc::new(config),
            subnets,
            clock,
        };

        let persisted = store.load().await?;
        engine.reconcile(persisted);

        for subnet in &engine.subnets {
            let state = subnet.state.read().await;
            info!(
                "Subnet {}/{}: range {} - {}, {} reservation(s), {} free address(es), {} lease record(s)",
                subnet.config.network,
                subnet.config.subnet_mask,
                subnet.config.range_start,
                subnet.config.range_end,
                subnet.reservations.len(),
                state.pool.free_count(),
                state.table.len()
            );
        }

        Ok(engine)
    }

    fn reconcile(&mut self, persisted: Vec<Lease>) {
        let now = self.clock.now();
        let probation = seconds(self.config.decline_probation_seconds);
        let mut skipped = 0usize;

        for lease in persisted {
            let Some(subnet) = self
                .subnets
                .iter_mut()
                .find(|subnet| subnet.config.network == lease.subnet)
            else {
                warn!(
                    "Skipping lease {} for {}: subnet {} is not configured",
                    lease.ip_address, lease.client_id, lease.subnet
                );
                skipped += 1;
                continue;
            };
            let state = subnet.state.get_mut();

            if lease.state == LeaseState::Offered {
                skipped += 1;
                continue;
            }

            if lease.state.is_terminal() {
                if lease.declined
                    && let Some(ended_at) = lease.ended_at
                    && ended_at + probation > now
                    && state.table.active_holder(lease.ip_address, now).is_none()
                {
                    state
                        .pool
                        .mark_declined(lease.ip_address, ended_at + probation);
                }
                state.table.restore(lease);
                continue;
            }

            if !subnet.config.contains(lease.ip_address) {
                warn!(
                    "Skipping lease {} for {}: address is outside subnet {}",
                    lease.ip_address, lease.client_id, lease.subnet
                );
                skipped += 1;
                continue;
            }

            if subnet
                .reservations
                .is_reserved_for_other(lease.ip_address, &lease.client_id)
            {
                warn!(
                    "Skipping lease {} for {}: address is reserved for another client",
                    lease.ip_address, lease.client_id
                );
                skipped += 1;
                continue;
            }

            if let Some(holder) = state.table.active_holder(lease.ip_address, now)
                && holder.client_id != lease.client_id
            {
                warn!(
                    "Skipping lease {} for {}: address is already leased to {}",
                    lease.ip_address, lease.client_id, holder.client_id
                );
                skipped += 1;
                continue;
            }

            state.pool.mark_leased(lease.ip_address);
            state.table.restore(lease);
        }

        if skipped > 0 {
            warn!("Skipped {} persisted lease record(s) during startup", skipped);
        }
    }

    fn subnet(&self, network: Ipv4Addr) -> Result<&Subnet<S>> {
        self.subnets
            .iter()
            .find(|subnet| subnet.network() == network)
            .ok_or(Error::UnknownSubnet(network))
    }

    /// Chooses an address for a DISCOVER and holds it as an offer.
    ///
    /// Priority: the client's reservation, its active lease, its outstanding
    /// offer, the address it asked for (if free), then the lowest free
    /// address. Offers are never persisted.
    ///
    /// # Errors
    ///
    /// - [`Error::ReservationConflict`] if the client's reserved address is
    ///   actively leased to someone else
    /// - [`Error::PoolExhausted`] if nothing is free
    pub async fn handle_discover(&self, network: Ipv4Addr, message: &ClientMessage) -> Result<Lease> {
        let subnet = self.subnet(network)?;
        let now = self.clock.now();
        let client_id = &message.client_id;
        let reservation = subnet.reservations.lookup(client_id);

        let mut state = subnet.state.write().await;
        state.expire_offers(now);

        let active_address = state
            .table
            .get(client_id)
            .filter(|lease| lease.is_active(now))
            .map(|lease| lease.ip_address);
        // Ran out but not yet swept: the pool still marks the address leased.
        let lapsed_address = state
            .table
            .get(client_id)
            .filter(|lease| lease.state.is_active() && !lease.is_active(now))
            .map(|lease| lease.ip_address)
            .filter(|address| state.table.active_holder(*address, now).is_none());

        let address = if let Some(reservation) = reservation {
            if let Some(holder) = state.table.active_holder(reservation.ip_address, now)
                && holder.client_id != *client_id
            {
                warn!(
                    "Reserved address {} for {} is leased to {}",
                    reservation.ip_address, client_id, holder.client_id
                );
                return Err(Error::ReservationConflict(reservation.ip_address));
            }
            reservation.ip_address
        } else if let Some(address) = active_address {
            address
        } else if let Some(offer) = state.offers.get(client_id) {
            offer.ip_address
        } else if let Some(address) = lapsed_address
            && !subnet.reservations.is_reserved_for_other(address, client_id)
        {
            state.pool.release(address);
            state.pool.claim(address, now);
            address
        } else if let Some(requested) = message.requested_address
            && !subnet.reservations.is_reserved(requested)
            && state.pool.claim(requested, now)
        {
            requested
        } else {
            state.pool.allocate_next_free(now).inspect_err(|_| {
                warn!("Pool of subnet {} exhausted, no offer for {}", network, client_id);
            })?
        };

        let lease_seconds = subnet
            .config
            .negotiate_lease_time(message.requested_lease_seconds, self.config.min_lease_seconds);
        let mut offer = Lease::offered(
            network,
            client_id.clone(),
            address,
            lease_seconds,
            message.transaction_id,
            now,
            self.config.offer_timeout_seconds,
        );
        offer.hostname = message
            .hostname
            .clone()
            .or_else(|| reservation.and_then(|reservation| reservation.hostname.clone()));

        // Re-offering the address of an active lease needs no hold.
        if active_address != Some(address) {
            let previous = state.offers.insert(client_id.clone(), offer.clone());
            if let Some(previous) = previous
                && previous.ip_address != address
            {
                state.free_address(previous.ip_address, now);
            }
        }

        debug!("Offering {} to {} in subnet {}", address, client_id, network);
        Ok(offer)
    }

    /// Commits or renews a binding for a REQUEST.
    ///
    /// The requested address (option 50, else `ciaddr`) must match the
    /// client's offer, its current lease or its reservation, and must not be
    /// reserved for or leased to anyone else.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedMessage`] if the request names no address
    /// - [`Error::ReservationConflict`], [`Error::AddressInUse`] or
    ///   [`Error::NoBinding`] when the address cannot be granted
    /// - [`Error::InvalidTransition`] if the lease cannot be renewed
    /// - [`Error::StoreUnavailable`] if the commit fails
    pub async fn handle_request(&self, network: Ipv4Addr, message: &ClientMessage) -> Result<Lease> {
        let subnet = self.subnet(network)?;
        let now = self.clock.now();
        let client_id = &message.client_id;
        let address = message.target_address().ok_or_else(|| {
            Error::MalformedMessage(format!("REQUEST from {client_id} names no address"))
        })?;
        let reservation = subnet.reservations.lookup(client_id);

        if let Some(reservation) = reservation
            && reservation.ip_address != address
        {
            return Err(Error::ReservationConflict(address));
        }
        if subnet.reservations.is_reserved_for_other(address, client_id) {
            return Err(Error::ReservationConflict(address));
        }

        let mut state = subnet.state.write().await;
        state.expire_offers(now);

        if let Some(holder) = state.table.active_holder(address, now)
            && holder.client_id != *client_id
        {
            return Err(Error::AddressInUse(address));
        }

        let lease_seconds = subnet
            .config
            .negotiate_lease_time(message.requested_lease_seconds, self.config.min_lease_seconds);
        let previous = state.table.get(client_id).cloned();
        let current = previous
            .clone()
            .filter(|lease| lease.is_active(now));

        let mut lease = if let Some(offer) = state
            .offers
            .get(client_id)
            .filter(|offer| offer.ip_address == address)
        {
            offer.clone()
        } else if let Some(existing) = current.as_ref().filter(|lease| lease.ip_address == address) {
            let mut lease = existing.clone();
            lease.advance(now)?;
            match message.request_kind() {
                RequestKind::Renewing => lease.apply(LeaseEvent::Renew, now)?,
                RequestKind::Rebinding => lease.apply(LeaseEvent::Rebind, now)?,
                RequestKind::Selecting | RequestKind::InitReboot => {}
            }
            lease
        } else if reservation.is_some() {
            let mut lease = Lease::offered(
                network,
                client_id.clone(),
                address,
                lease_seconds,
                message.transaction_id,
                now,
                self.config.offer_timeout_seconds,
            );
            lease.hostname = reservation.and_then(|reservation| reservation.hostname.clone());
            lease
        } else {
            return Err(Error::NoBinding(address));
        };

        if let Some(hostname) = &message.hostname {
            lease.hostname = Some(hostname.clone());
        }
        lease.acknowledge(now, lease_seconds, message.transaction_id)?;

        state.table.commit(lease.clone()).await?;

        if let Some(offer) = state.offers.remove(client_id)
            && offer.ip_address != address
        {
            state.free_address(offer.ip_address, now);
        }
        state.pool.mark_leased(address);
        if let Some(previous) = previous
            && previous.state.is_active()
            && previous.ip_address != address
        {
            state.free_address(previous.ip_address, now);
        }

        debug!(
            "Bound {} to {} for {}s in subnet {}",
            address, client_id, lease_seconds, network
        );
        Ok(lease)
    }

    /// Ends the client's lease and frees its address.
    ///
    /// Returns false when there is nothing to release: no lease, a lease for
    /// another address, or a lease that already ended.
    pub async fn handle_release(&self, network: Ipv4Addr, message: &ClientMessage) -> Result<bool> {
        let subnet = self.subnet(network)?;
        let now = self.clock.now();
        let client_id = &message.client_id;
        let Some(address) = message.client_address.or(message.requested_address) else {
            return Err(Error::MalformedMessage(format!(
                "RELEASE from {client_id} names no address"
            )));
        };

        let mut state = subnet.state.write().await;
        let Some(current) = state.table.get(client_id) else {
            debug!("RELEASE of {} from {} with no lease", address, client_id);
            return Ok(false);
        };
        if current.ip_address != address {
            warn!(
                "Ignoring RELEASE of {} from {}: its lease is for {}",
                address, client_id, current.ip_address
            );
            return Ok(false);
        }
        if current.state.is_terminal() {
            return Ok(false);
        }

        let mut lease = current.clone();
        lease.apply(LeaseEvent::Release, now)?;
        state.table.commit(lease).await?;
        state.free_address(address, now);

        debug!("Released {} from {}", address, client_id);
        Ok(true)
    }

    /// Quarantines an address the client reports as already in use.
    ///
    /// Applies to the client's outstanding offer or its active lease for that
    /// address. Returns false (and changes nothing) otherwise.
    pub async fn handle_decline(&self, network: Ipv4Addr, message: &ClientMessage) -> Result<bool> {
        let subnet = self.subnet(network)?;
        let now = self.clock.now();
        let client_id = &message.client_id;
        let Some(address) = message.target_address() else {
            return Err(Error::MalformedMessage(format!(
                "DECLINE from {client_id} names no address"
            )));
        };
        let until = now + seconds(self.config.decline_probation_seconds);

        let mut state = subnet.state.write().await;

        let declined_offer = state
            .offers
            .get(client_id)
            .is_some_and(|offer| offer.ip_address == address);
        if declined_offer {
            state.offers.remove(client_id);
            state.pool.mark_declined(address, until);
            warn!("{} declined offered address {}, quarantined until {}", client_id, address, until);
            return Ok(true);
        }

        let Some(current) = state
            .table
            .get(client_id)
            .filter(|lease| lease.ip_address == address && lease.state.is_active())
        else {
            debug!("Ignoring DECLINE of {} from {}: not its address", address, client_id);
            return Ok(false);
        };

        let mut lease = current.clone();
        lease.apply(LeaseEvent::Release, now)?;
        lease.declined = true;
        state.table.commit(lease).await?;
        state.pool.mark_declined(address, until);

        warn!("{} declined leased address {}, quarantined until {}", client_id, address, until);
        Ok(true)
    }

    /// Drops the client's outstanding offer, e.g. when it selected another
    /// server. Returns false if there was none.
    pub async fn withdraw_offer(&self, network: Ipv4Addr, client_id: &ClientId) -> Result<bool> {
        let subnet = self.subnet(network)?;
        let now = self.clock.now();
        let mut state = subnet.state.write().await;
        let Some(offer) = state.offers.remove(client_id) else {
            return Ok(false);
        };
        state.free_address(offer.ip_address, now);
        Ok(true)
    }

    /// Runs one maintenance pass at the engine clock's current time.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(self.clock.now()).await
    }

    /// Expires offers, advances T1/T2 timers, expires leases, purges
    /// terminal records past the retention period and lifts elapsed
    /// quarantines in every subnet.
    ///
    /// # Errors
    ///
    /// Stops at the first store failure. Changes committed before it stay.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let retention = seconds(self.config.expired_retention_seconds);
        let mut report = SweepReport::default();

        for subnet in &self.subnets {
            let mut state = subnet.state.write().await;
            report.offers_expired += state.expire_offers(now);

            let due: Vec<Lease> = state
                .table
                .iter()
                .filter(|lease| lease.due_event(now).is_some())
                .cloned()
                .collect();
            for mut lease in due {
                lease.advance(now)?;
                let address = lease.ip_address;
                let expired = lease.state.is_terminal();
                state.table.commit(lease).await?;
                if expired {
                    report.leases_expired += 1;
                    state.free_address(address, now);
                } else {
                    report.timers_advanced += 1;
                }
            }

            let stale: Vec<ClientId> = state
                .table
                .iter()
                .filter(|lease| {
                    lease.state.is_terminal()
                        && lease.ended_at.is_some_and(|ended_at| ended_at + retention <= now)
                })
                .map(|lease| lease.client_id.clone())
                .collect();
            for client_id in &stale {
                state.table.purge(client_id).await?;
                report.purged += 1;
            }

            report.quarantines_lifted += state.pool.reclaim_declined(now);
        }

        if !report.is_empty() {
            debug!("Sweep: {:?}", report);
        }
        Ok(report)
    }

    /// Every lease record of the subnet, ordered by address.
    pub async fn leases(&self, network: Ipv4Addr) -> Result<Vec<Lease>> {
        let subnet = self.subnet(network)?;
        let state = subnet.state.read().await;
        let mut leases: Vec<Lease> = state.table.iter().cloned().collect();
        leases.sort_by_key(|lease| lease.ip_address);
        Ok(leases)
    }

    pub async fn lease(&self, network: Ipv4Addr, client_id: &ClientId) -> Result<Option<Lease>> {
        let subnet = self.subnet(network)?;
        let state = subnet.state.read().await;
        Ok(state.table.get(client_id).cloned())
    }

    /// Outstanding offers, ordered by address.
    pub async fn offers(&self, network: Ipv4Addr) -> Result<Vec<Lease>> {
        let subnet = self.subnet(network)?;
        let state = subnet.state.read().await;
        let mut offers: Vec<Lease> = state.offers.values().cloned().collect();
        offers.sort_by_key(|offer| offer.ip_address);
        Ok(offers)
    }

    pub async fn pool_snapshot(&self, network: Ipv4Addr) -> Result<PoolSnapshot> {
        let subnet = self.subnet(network)?;
        let state = subnet.state.read().await;
        Ok(state.pool.snapshot())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subnet_config(&self, network: Ipv4Addr) -> Result<&SubnetConfig> {
        self.subnet(network).map(|subnet| &subnet.config)
    }

    /// The configured subnet whose network contains `address`.
    pub fn subnet_for(&self, address: Ipv4Addr) -> Option<&SubnetConfig> {
        self.subnets
            .iter()
            .map(|subnet| &subnet.config)
            .find(|config| config.contains(address))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
