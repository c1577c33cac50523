#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::{Arc, Once};

use tracing_subscriber::EnvFilter;

use leasehold::{
    AllocationEngine, ClientId, ClientMessage, ClientMessageType, Config, Lease, LeaseStore,
    ManualClock, ReservationConfig, Result, SubnetConfig,
};

pub const NETWORK: Ipv4Addr = Ipv4Addr::new(172, 22, 0, 0);
pub const SERVER: Ipv4Addr = Ipv4Addr::new(172, 22, 0, 2);
pub const RESERVED: Ipv4Addr = Ipv4Addr::new(172, 22, 0, 5);
pub const RESERVED_MAC: &str = "00:14:22:01:23:45";

static INIT: Once = Once::new();

/// Routes `tracing` output through the test harness. `RUST_LOG` overrides
/// the default `warn` filter.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// 172.22.0.0/24 with a dynamic range of .10 - .45 and one reservation.
pub fn lab_config() -> Config {
    Config {
        server_ip: SERVER,
        subnets: vec![SubnetConfig {
            network: NETWORK,
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            range_start: Ipv4Addr::new(172, 22, 0, 10),
            range_end: Ipv4Addr::new(172, 22, 0, 45),
            gateway: Some(Ipv4Addr::new(172, 22, 0, 1)),
            dns_servers: vec![Ipv4Addr::new(172, 22, 0, 1)],
            domain_name: Some("lab.internal".to_string()),
            default_lease_seconds: 3600,
            max_lease_seconds: 86400,
            reservations: vec![ReservationConfig {
                mac_address: Some(RESERVED_MAC.to_string()),
                client_id: None,
                ip_address: RESERVED,
                hostname: Some("printer".to_string()),
            }],
        }],
        ..Default::default()
    }
}

pub async fn start_engine<S: LeaseStore>(
    config: Config,
    store: Arc<S>,
    clock: Arc<ManualClock>,
) -> AllocationEngine<S> {
    init_tracing();
    AllocationEngine::start(config, store, clock).await.unwrap()
}

/// An Ethernet client whose MAC ends in `index`.
pub fn client(index: u16) -> ClientId {
    let [high, low] = index.to_be_bytes();
    ClientId::from_hardware(1, &[0x52, 0x54, 0x00, 0x00, high, low])
}

pub fn reserved_client() -> ClientId {
    ClientId::from_mac(RESERVED_MAC).unwrap()
}

/// DISCOVER followed by a SELECTING request for the offered address.
pub async fn bind<S: LeaseStore>(engine: &AllocationEngine<S>, client_id: &ClientId) -> Result<Lease> {
    let discover = ClientMessage::new(ClientMessageType::Discover, client_id.clone(), 1);
    let offer = engine.handle_discover(NETWORK, &discover).await?;

    let request = ClientMessage::new(ClientMessageType::Request, client_id.clone(), 2)
        .with_requested_address(offer.ip_address)
        .with_server_identifier(SERVER);
    engine.handle_request(NETWORK, &request).await
}
