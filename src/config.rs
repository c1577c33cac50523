use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use tracing::warn;

use crate::error::{Error, Result};
use crate::lease::ClientId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the server identifies itself with (option 54).
    pub server_ip: Ipv4Addr,
    pub subnets: Vec<SubnetConfig>,
    /// Path of the append-only lease journal.
    pub leases_file: String,
    /// How long an OFFER holds its address.
    pub offer_timeout_seconds: u32,
    /// How long a declined address stays out of the pool.
    pub decline_probation_seconds: u32,
    /// How long expired and released leases are kept for audit.
    pub expired_retention_seconds: u32,
    pub sweep_interval_seconds: u32,
    /// Lower bound for client-requested lease times.
    pub min_lease_seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub network: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub domain_name: Option<String>,
    pub default_lease_seconds: u32,
    pub max_lease_seconds: u32,
    #[serde(default)]
    pub reservations: Vec<ReservationConfig>,
}

/// A fixed-address binding. Exactly one of `mac_address` and `client_id`
/// must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    #[serde(default)]
    pub mac_address: Option<String>,
    /// Raw option 61 value as colon-separated hex.
    #[serde(default)]
    pub client_id: Option<String>,
    pub ip_address: Ipv4Addr,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl ReservationConfig {
    pub fn client_id(&self) -> Result<ClientId> {
        match (&self.mac_address, &self.client_id) {
            (Some(mac), None) => ClientId::from_mac(mac),
            (None, Some(id)) => id.parse(),
            _ => Err(Error::InvalidConfiguration(format!(
                "reservation for {} needs exactly one of mac_address or client_id",
                self.ip_address
            ))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            subnets: vec![SubnetConfig::default()],
            leases_file: "leases.jsonl".to_string(),
            offer_timeout_seconds: 60,
            decline_probation_seconds: 3600,
            expired_retention_seconds: 3600,
            sweep_interval_seconds: 5,
            min_lease_seconds: 60,
        }
    }
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(192, 168, 1, 0),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 200),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            domain_name: None,
            default_lease_seconds: 86400,
            max_lease_seconds: 86400,
            reservations: Vec::new(),
        }
    }
}

impl Config {
    /// Reads and validates a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.subnets.is_empty() {
            return Err(Error::InvalidConfiguration(
                "at least one subnet must be configured".to_string(),
            ));
        }

        let mut networks = HashSet::new();
        for subnet in &self.subnets {
            subnet.validate()?;
            if !networks.insert(subnet.network) {
                return Err(Error::InvalidConfiguration(format!(
                    "subnet {} is configured twice",
                    subnet.network
                )));
            }
            if subnet.pool_contains(self.server_ip) {
                return Err(Error::InvalidConfiguration(format!(
                    "server_ip {} must not be within the range of subnet {}",
                    self.server_ip, subnet.network
                )));
            }
        }

        if self.offer_timeout_seconds == 0 {
            return Err(Error::InvalidConfiguration(
                "offer_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(Error::InvalidConfiguration(
                "sweep_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.min_lease_seconds == 0 {
            return Err(Error::InvalidConfiguration(
                "min_lease_seconds must be greater than 0".to_string(),
            ));
        }

        // Negotiated leases can be as short as min_lease_seconds.
        let shortest_lease = self
            .subnets
            .iter()
            .map(|subnet| {
                subnet
                    .default_lease_seconds
                    .min(self.min_lease_seconds.min(subnet.max_lease_seconds))
            })
            .min()
            .unwrap_or(0);
        if u64::from(self.sweep_interval_seconds) * 8 >= u64::from(shortest_lease) {
            return Err(Error::InvalidConfiguration(format!(
                "sweep_interval_seconds ({}) must be smaller than the shortest lease time / 8 ({} / 8)",
                self.sweep_interval_seconds, shortest_lease
            )));
        }

        Ok(())
    }

    /// Returns the subnet whose network contains `address`.
    pub fn subnet_for(&self, address: Ipv4Addr) -> Option<&SubnetConfig> {
        self.subnets
            .iter()
            .find(|subnet| subnet.contains(address))
    }
}

impl SubnetConfig {
    pub fn validate(&self) -> Result<()> {
        let mask = u32::from(self.subnet_mask);
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(Error::InvalidConfiguration(format!(
                "subnet_mask {} is not contiguous",
                self.subnet_mask
            )));
        }

        if u32::from(self.network) & !mask != 0 {
            return Err(Error::InvalidConfiguration(format!(
                "network {} has host bits set for mask {}",
                self.network, self.subnet_mask
            )));
        }

        if u32::from(self.range_start) > u32::from(self.range_end) {
            return Err(Error::InvalidConfiguration(format!(
                "range_start {} must be less than or equal to range_end {}",
                self.range_start, self.range_end
            )));
        }

        if !self.contains(self.range_start) || !self.contains(self.range_end) {
            return Err(Error::InvalidConfiguration(format!(
                "range {} - {} must lie within subnet {}",
                self.range_start, self.range_end, self.network
            )));
        }

        if let Some(gateway) = self.gateway
            && !self.contains(gateway)
        {
            return Err(Error::InvalidConfiguration(format!(
                "gateway {} must lie within subnet {}",
                gateway, self.network
            )));
        }

        if self.default_lease_seconds == 0 || self.max_lease_seconds == 0 {
            return Err(Error::InvalidConfiguration(
                "lease durations must be greater than 0".to_string(),
            ));
        }

        if self.default_lease_seconds > self.max_lease_seconds {
            return Err(Error::InvalidConfiguration(format!(
                "default_lease_seconds ({}) exceeds max_lease_seconds ({})",
                self.default_lease_seconds, self.max_lease_seconds
            )));
        }

        let mut clients = HashSet::new();
        let mut addresses = HashSet::new();
        for reservation in &self.reservations {
            let client_id = reservation.client_id()?;

            if !self.contains(reservation.ip_address) {
                return Err(Error::InvalidConfiguration(format!(
                    "reservation {} for {} is outside subnet {}",
                    reservation.ip_address, client_id, self.network
                )));
            }

            if !clients.insert(client_id.clone()) {
                return Err(Error::InvalidConfiguration(format!(
                    "client {} has more than one reservation",
                    client_id
                )));
            }

            if !addresses.insert(reservation.ip_address) {
                return Err(Error::InvalidConfiguration(format!(
                    "address {} is reserved more than once",
                    reservation.ip_address
                )));
            }

            if self.pool_contains(reservation.ip_address) {
                warn!(
                    "Reservation {} for {} overlaps the dynamic range; it will be excluded from allocation",
                    reservation.ip_address, client_id
                );
            }
        }

        Ok(())
    }

    /// Returns true if `address` is inside this subnet.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(address) & mask == u32::from(self.network)
    }

    /// Returns true if `address` is inside the dynamic range.
    pub fn pool_contains(&self, address: Ipv4Addr) -> bool {
        let addr = u32::from(address);
        addr >= u32::from(self.range_start) && addr <= u32::from(self.range_end)
    }

    pub fn pool_size(&self) -> u32 {
        u32::from(self.range_end) - u32::from(self.range_start) + 1
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !u32::from(self.subnet_mask))
    }

    /// Clamps a client-requested lease time to `[min_seconds, max_lease_seconds]`.
    pub fn negotiate_lease_time(&self, requested: Option<u32>, min_seconds: u32) -> u32 {
        match requested {
            Some(requested) => {
                let floor = min_seconds.min(self.max_lease_seconds);
                requested.clamp(floor, self.max_lease_seconds)
            }
            None => self.default_lease_seconds,
        }
    }
}
