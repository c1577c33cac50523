//! Datagram in, datagram out.
//!
//! [`ProtocolHandler`] decodes a request, picks the subnet it belongs to,
//! asks the [`AllocationEngine`] for a decision and encodes the reply
//! together with the address it must be sent to. It never touches a socket.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SubnetConfig;
use crate::engine::AllocationEngine;
use crate::error::{Error, Result};
use crate::message::{ClientMessage, ClientMessageType, ServerMessage};
use crate::options::MessageType;
use crate::packet::DhcpPacket;
use crate::store::LeaseStore;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);
const RATE_LIMIT_MAX_REQUESTS: usize = 10;
const RATE_LIMIT_CLEANUP_THRESHOLD: usize = 1000;

/// Outcome of one client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Reply(ServerMessage),
    /// Nothing goes on the wire.
    Silent,
}

/// An encoded reply and where to send it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub packet: DhcpPacket,
    pub destination: SocketAddrV4,
}

/// Sliding one-second window per hardware address.
#[derive(Debug, Default)]
pub struct RateLimiter {
    clients: Mutex<HashMap<Vec<u8>, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a datagram from `hardware_address` and returns true if it
    /// exceeds the budget and should be dropped.
    pub async fn is_limited(&self, hardware_address: &[u8]) -> bool {
        let mut clients = self.clients.lock().await;
        let now = Instant::now();

        if clients.len() > RATE_LIMIT_CLEANUP_THRESHOLD {
            clients.retain(|_, seen| {
                seen.retain(|instant| now.duration_since(*instant) < RATE_LIMIT_WINDOW);
                !seen.is_empty()
            });
        }

        let seen = clients.entry(hardware_address.to_vec()).or_default();
        seen.retain(|instant| now.duration_since(*instant) < RATE_LIMIT_WINDOW);
        if seen.len() >= RATE_LIMIT_MAX_REQUESTS {
            return true;
        }
        seen.push(now);
        false
    }

    pub async fn tracked_clients(&self) -> usize {
        self.clients.lock().await.len()
    }
}

/// Where a reply to `request` goes (RFC 2131 §4.1).
///
/// Relayed requests go back to the relay on the server port. Otherwise a
/// NAK, a request with the broadcast flag, or a client without an address
/// gets a broadcast; everyone else is unicast at `ciaddr`.
pub fn reply_destination(request: &DhcpPacket, reply_type: MessageType) -> SocketAddrV4 {
    if !request.giaddr.is_unspecified() {
        SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT)
    } else if reply_type == MessageType::Nak
        || request.is_broadcast()
        || request.ciaddr.is_unspecified()
    {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
    } else {
        SocketAddrV4::new(request.ciaddr, DHCP_CLIENT_PORT)
    }
}

#[derive(Debug)]
pub struct ProtocolHandler<S> {
    engine: Arc<AllocationEngine<S>>,
    rate_limiter: RateLimiter,
}

impl<S: LeaseStore> ProtocolHandler<S> {
    pub fn new(engine: Arc<AllocationEngine<S>>) -> Self {
        Self {
            engine,
            rate_limiter: RateLimiter::new(),
        }
    }

    pub fn engine(&self) -> &Arc<AllocationEngine<S>> {
        &self.engine
    }

    /// Picks the subnet a message belongs to: the relay's, else the one
    /// holding `ciaddr`, else the one holding the requested address, else the
    /// server's own.
    ///
    /// A relayed message whose relay address matches no subnet gets none.
    pub fn select_subnet(&self, message: &ClientMessage) -> Option<&SubnetConfig> {
        if let Some(relay) = message.relay_address {
            return self.engine.subnet_for(relay);
        }
        message
            .client_address
            .and_then(|address| self.engine.subnet_for(address))
            .or_else(|| {
                message
                    .requested_address
                    .and_then(|address| self.engine.subnet_for(address))
            })
            .or_else(|| self.engine.subnet_for(self.engine.config().server_ip))
    }

    /// Runs one message through the engine.
    ///
    /// # Errors
    ///
    /// Only operational failures such as [`Error::StoreUnavailable`]. Every
    /// protocol-level rejection becomes a NAK or silence.
    pub async fn decide(&self, message: &ClientMessage) -> Result<Decision> {
        let server_ip = self.engine.config().server_ip;
        let client_id = &message.client_id;

        let Some(subnet) = self.select_subnet(message) else {
            debug!("No subnet for {} from {}", message.message_type, client_id);
            return Ok(Decision::Silent);
        };
        let network = subnet.network;

        match message.message_type {
            ClientMessageType::Discover => {
                match self.engine.handle_discover(network, message).await {
                    Ok(offer) => {
                        info!("OFFER {} to {}", offer.ip_address, client_id);
                        Ok(Decision::Reply(ServerMessage::offer(&offer, subnet, server_ip)))
                    }
                    Err(error) if error.is_protocol_error() => {
                        warn!("No offer for {}: {}", client_id, error);
                        Ok(Decision::Silent)
                    }
                    Err(error) => Err(error),
                }
            }
            ClientMessageType::Request => {
                if let Some(server_id) = message.server_identifier
                    && server_id != server_ip
                {
                    debug!("{} selected server {}", client_id, server_id);
                    self.engine.withdraw_offer(network, client_id).await?;
                    return Ok(Decision::Silent);
                }

                match self.engine.handle_request(network, message).await {
                    Ok(lease) => {
                        info!(
                            "ACK {} to {} for {}s",
                            lease.ip_address, client_id, lease.lease_seconds
                        );
                        Ok(Decision::Reply(ServerMessage::ack(&lease, subnet, server_ip)))
                    }
                    Err(error) if error.is_protocol_error() => {
                        warn!("NAK to {}: {}", client_id, error);
                        Ok(Decision::Reply(ServerMessage::nak(
                            message,
                            server_ip,
                            error.to_string(),
                        )))
                    }
                    Err(error) => Err(error),
                }
            }
            ClientMessageType::Release => {
                match self.engine.handle_release(network, message).await {
                    Ok(true) => info!("RELEASE from {}", client_id),
                    Ok(false) => {}
                    Err(error) if error.is_protocol_error() => {
                        debug!("Ignoring RELEASE from {}: {}", client_id, error);
                    }
                    Err(error) => return Err(error),
                }
                Ok(Decision::Silent)
            }
            ClientMessageType::Decline => {
                match self.engine.handle_decline(network, message).await {
                    Ok(_) => {}
                    Err(error) if error.is_protocol_error() => {
                        debug!("Ignoring DECLINE from {}: {}", client_id, error);
                    }
                    Err(error) => return Err(error),
                }
                Ok(Decision::Silent)
            }
        }
    }

    /// Decodes `data`, decides and encodes the reply, if any.
    ///
    /// Malformed and rate-limited datagrams are dropped with `Ok(None)`.
    pub async fn handle_datagram(&self, data: &[u8]) -> Result<Option<Outbound>> {
        let packet = match DhcpPacket::parse(data) {
            Ok(packet) => packet,
            Err(error) => {
                debug!("Dropping datagram: {}", error);
                return Ok(None);
            }
        };

        if self.rate_limiter.is_limited(packet.hardware_address()).await {
            debug!("Rate limited: xid {:#010x}", packet.xid);
            return Ok(None);
        }

        let message = match ClientMessage::from_packet(&packet) {
            Ok(message) => message,
            Err(Error::MalformedMessage(reason)) => {
                debug!("Dropping datagram: {}", reason);
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        match self.decide(&message).await? {
            Decision::Silent => Ok(None),
            Decision::Reply(reply) => Ok(Some(Outbound {
                packet: reply.to_packet(&packet),
                destination: reply_destination(&packet, reply.message_type),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Config, ReservationConfig};
    use crate::options::DhcpOption;
    use crate::packet::{BOOTREQUEST, HLEN_ETHERNET, HTYPE_ETHERNET};
    use crate::store::MemoryStore;

    const SERVER: Ipv4Addr = Ipv4Addr::new(172, 22, 0, 2);
    const NETWORK: Ipv4Addr = Ipv4Addr::new(172, 22, 0, 0);

    fn test_config() -> Config {
        Config {
            server_ip: SERVER,
            subnets: vec![
                SubnetConfig {
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
                        mac_address: Some("00:14:22:01:23:45".to_string()),
                        client_id: None,
                        ip_address: Ipv4Addr::new(172, 22, 0, 5),
                        hostname: None,
                    }],
                },
                SubnetConfig {
                    network: Ipv4Addr::new(10, 9, 0, 0),
                    subnet_mask: Ipv4Addr::new(255, 255, 0, 0),
                    range_start: Ipv4Addr::new(10, 9, 1, 0),
                    range_end: Ipv4Addr::new(10, 9, 1, 9),
                    gateway: Some(Ipv4Addr::new(10, 9, 0, 1)),
                    dns_servers: Vec::new(),
                    domain_name: None,
                    default_lease_seconds: 3600,
                    max_lease_seconds: 3600,
                    reservations: Vec::new(),
                },
            ],
            ..Default::default()
        }
    }

    async fn test_handler() -> ProtocolHandler<MemoryStore> {
        let engine = AllocationEngine::start(
            test_config(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
        )
        .await
        .unwrap();
        ProtocolHandler::new(Arc::new(engine))
    }

    fn packet(mac: [u8; 6], message_type: MessageType, options: Vec<DhcpOption>) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        let mut all_options = vec![DhcpOption::MessageType(message_type)];
        all_options.extend(options);
        DhcpPacket {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 0x1234,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: all_options,
        }
    }

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x01];

    #[tokio::test]
    async fn test_full_exchange() {
        let handler = test_handler().await;

        let discover = packet(MAC, MessageType::Discover, Vec::new());
        let offer = handler
            .handle_datagram(&discover.encode())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offer.packet.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.packet.yiaddr, Ipv4Addr::new(172, 22, 0, 10));
        assert_eq!(offer.packet.xid, 0x1234);
        assert_eq!(
            offer.destination,
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
        );
        assert!(offer.packet.options.contains(&DhcpOption::LeaseTime(3600)));
        assert!(offer.packet.options.contains(&DhcpOption::RenewalTime(1800)));
        assert!(offer.packet.options.contains(&DhcpOption::RebindingTime(3150)));
        assert!(
            offer
                .packet
                .options
                .contains(&DhcpOption::DomainName("lab.internal".to_string()))
        );

        let request = packet(
            MAC,
            MessageType::Request,
            vec![
                DhcpOption::RequestedIpAddress(offer.packet.yiaddr),
                DhcpOption::ServerIdentifier(SERVER),
            ],
        );
        let ack = handler
            .handle_datagram(&request.encode())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.packet.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.packet.yiaddr, offer.packet.yiaddr);
        assert_eq!(ack.packet.server_identifier(), Some(SERVER));

        let mut renew = packet(MAC, MessageType::Request, Vec::new());
        renew.ciaddr = ack.packet.yiaddr;
        let renewed = handler
            .handle_datagram(&renew.encode())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renewed.packet.message_type(), Some(MessageType::Ack));
        assert_eq!(
            renewed.destination,
            SocketAddrV4::new(ack.packet.yiaddr, DHCP_CLIENT_PORT)
        );

        let mut release = packet(MAC, MessageType::Release, Vec::new());
        release.ciaddr = ack.packet.yiaddr;
        assert!(handler.handle_datagram(&release.encode()).await.unwrap().is_none());
        let leases = handler.engine().leases(NETWORK).await.unwrap();
        assert_eq!(leases[0].state, crate::state::LeaseState::Released);
    }

    #[tokio::test]
    async fn test_nak_carries_reason() {
        let handler = test_handler().await;
        let request = packet(
            MAC,
            MessageType::Request,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(172, 22, 0, 30))],
        );

        let nak = handler
            .handle_datagram(&request.encode())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(nak.packet.message_type(), Some(MessageType::Nak));
        assert_eq!(nak.packet.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            nak.destination,
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
        );
        assert!(
            nak.packet
                .options
                .iter()
                .any(|option| matches!(option, DhcpOption::Message(text) if text.contains("172.22.0.30")))
        );
    }

    #[tokio::test]
    async fn test_request_for_other_server_withdraws_offer() {
        let handler = test_handler().await;
        let offer = handler
            .handle_datagram(&packet(MAC, MessageType::Discover, Vec::new()).encode())
            .await
            .unwrap()
            .unwrap();

        let request = packet(
            MAC,
            MessageType::Request,
            vec![
                DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 0, 2, 50)),
                DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 0, 2, 1)),
            ],
        );
        assert!(handler.handle_datagram(&request.encode()).await.unwrap().is_none());
        assert!(handler.engine().offers(NETWORK).await.unwrap().is_empty());
        let pool = handler.engine().pool_snapshot(NETWORK).await.unwrap();
        assert!(pool.free.contains(&offer.packet.yiaddr));
    }

    #[tokio::test]
    async fn test_relayed_discover_uses_relay_subnet() {
        let handler = test_handler().await;
        let mut discover = packet(MAC, MessageType::Discover, Vec::new());
        discover.giaddr = Ipv4Addr::new(10, 9, 0, 1);

        let offer = handler
            .handle_datagram(&discover.encode())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offer.packet.yiaddr, Ipv4Addr::new(10, 9, 1, 0));
        assert_eq!(offer.packet.giaddr, discover.giaddr);
        assert_eq!(
            offer.destination,
            SocketAddrV4::new(discover.giaddr, DHCP_SERVER_PORT)
        );

        discover.giaddr = Ipv4Addr::new(198, 51, 100, 1);
        assert!(handler.handle_datagram(&discover.encode()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_dropped() {
        let handler = test_handler().await;
        assert!(handler.handle_datagram(&[0u8; 10]).await.unwrap().is_none());

        let offer_from_client = packet(MAC, MessageType::Offer, Vec::new());
        assert!(
            handler
                .handle_datagram(&offer_from_client.encode())
                .await
                .unwrap()
                .is_none()
        );

        let mut bootp = packet(MAC, MessageType::Discover, Vec::new());
        bootp.options.clear();
        assert!(handler.handle_datagram(&bootp.encode()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_silent() {
        let handler = test_handler().await;
        for index in 0..10u8 {
            let mut discover = packet([2, 0, 0, 0, 0, index], MessageType::Discover, Vec::new());
            discover.giaddr = Ipv4Addr::new(10, 9, 0, 1);
            assert!(handler.handle_datagram(&discover.encode()).await.unwrap().is_some());
        }

        let mut discover = packet([2, 0, 0, 0, 0, 99], MessageType::Discover, Vec::new());
        discover.giaddr = Ipv4Addr::new(10, 9, 0, 1);
        assert!(handler.handle_datagram(&discover.encode()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rate_limiting() {
        let handler = test_handler().await;
        let discover = packet(MAC, MessageType::Discover, Vec::new()).encode();

        for _ in 0..RATE_LIMIT_MAX_REQUESTS {
            assert!(handler.handle_datagram(&discover).await.unwrap().is_some());
        }
        assert!(handler.handle_datagram(&discover).await.unwrap().is_none());

        let other = packet([0x52, 0x54, 0, 0, 0, 2], MessageType::Discover, Vec::new());
        assert!(handler.handle_datagram(&other.encode()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rate_limiter_cleanup() {
        let limiter = RateLimiter::new();
        for index in 0..=RATE_LIMIT_CLEANUP_THRESHOLD {
            let address = (index as u32).to_be_bytes();
            assert!(!limiter.is_limited(&address).await);
        }
        assert_eq!(limiter.tracked_clients().await, RATE_LIMIT_CLEANUP_THRESHOLD + 1);
    }

    #[test]
    fn test_reply_destination() {
        let mut request = packet(MAC, MessageType::Request, Vec::new());
        request.ciaddr = Ipv4Addr::new(172, 22, 0, 10);
        assert_eq!(
            reply_destination(&request, MessageType::Ack),
            SocketAddrV4::new(Ipv4Addr::new(172, 22, 0, 10), DHCP_CLIENT_PORT)
        );
        assert_eq!(
            reply_destination(&request, MessageType::Nak),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
        );

        request.flags = 0x8000;
        assert_eq!(
            reply_destination(&request, MessageType::Ack),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
        );
    }
}
