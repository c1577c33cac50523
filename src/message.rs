//! Typed client requests and server replies.
//!
//! [`ClientMessage`] is what the engine consumes; [`ServerMessage`] is what
//! the protocol layer turns back into a [`DhcpPacket`].

use std::net::Ipv4Addr;

use crate::config::SubnetConfig;
use crate::error::{Error, Result};
use crate::lease::{ClientId, Lease};
use crate::options::{DhcpOption, MessageType};
use crate::packet::{BOOTREQUEST, DhcpPacket};

/// Client message types the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessageType {
    Discover,
    Request,
    Release,
    Decline,
}

impl TryFrom<MessageType> for ClientMessageType {
    type Error = Error;

    fn try_from(message_type: MessageType) -> Result<Self> {
        match message_type {
            MessageType::Discover => Ok(Self::Discover),
            MessageType::Request => Ok(Self::Request),
            MessageType::Release => Ok(Self::Release),
            MessageType::Decline => Ok(Self::Decline),
            other => Err(Error::MalformedMessage(format!(
                "unsupported message type {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ClientMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message_type = match self {
            Self::Discover => MessageType::Discover,
            Self::Request => MessageType::Request,
            Self::Release => MessageType::Release,
            Self::Decline => MessageType::Decline,
        };
        write!(f, "{message_type}")
    }
}

/// The client state a REQUEST was sent from (RFC 2131 §4.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Answering an OFFER; carries a server identifier.
    Selecting,
    /// Rebooted client confirming a previous address; `ciaddr` is zero.
    InitReboot,
    /// Unicast renewal past T1; `ciaddr` is set.
    Renewing,
    /// Broadcast renewal past T2; `ciaddr` is set.
    Rebinding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub message_type: ClientMessageType,
    pub client_id: ClientId,
    pub transaction_id: u32,
    /// Option 50.
    pub requested_address: Option<Ipv4Addr>,
    /// `ciaddr`, if non-zero.
    pub client_address: Option<Ipv4Addr>,
    /// `giaddr`, if non-zero.
    pub relay_address: Option<Ipv4Addr>,
    /// Option 54.
    pub server_identifier: Option<Ipv4Addr>,
    /// Option 51.
    pub requested_lease_seconds: Option<u32>,
    /// Option 12.
    pub hostname: Option<String>,
    pub broadcast: bool,
}

fn non_zero(address: Ipv4Addr) -> Option<Ipv4Addr> {
    (!address.is_unspecified()).then_some(address)
}

impl ClientMessage {
    pub fn new(message_type: ClientMessageType, client_id: ClientId, transaction_id: u32) -> Self {
        Self {
            message_type,
            client_id,
            transaction_id,
            requested_address: None,
            client_address: None,
            relay_address: None,
            server_identifier: None,
            requested_lease_seconds: None,
            hostname: None,
            broadcast: false,
        }
    }

    pub fn with_requested_address(mut self, address: Ipv4Addr) -> Self {
        self.requested_address = Some(address);
        self
    }

    pub fn with_client_address(mut self, address: Ipv4Addr) -> Self {
        self.client_address = Some(address);
        self
    }

    pub fn with_server_identifier(mut self, address: Ipv4Addr) -> Self {
        self.server_identifier = Some(address);
        self
    }

    pub fn with_lease_seconds(mut self, seconds: u32) -> Self {
        self.requested_lease_seconds = Some(seconds);
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Validates and converts a decoded packet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] for replies, packets without
    /// option 53, server-only or unsupported message types, and packets that
    /// identify no client.
    pub fn from_packet(packet: &DhcpPacket) -> Result<Self> {
        if packet.op != BOOTREQUEST {
            return Err(Error::MalformedMessage(format!(
                "expected BOOTREQUEST, got op {}",
                packet.op
            )));
        }

        let message_type = packet
            .message_type()
            .ok_or_else(|| Error::MalformedMessage("missing message type".to_string()))?;
        let message_type = ClientMessageType::try_from(message_type)?;

        let client_id = packet.client_id().ok_or_else(|| {
            Error::MalformedMessage("no client identifier or hardware address".to_string())
        })?;

        Ok(Self {
            message_type,
            client_id,
            transaction_id: packet.xid,
            requested_address: packet.requested_ip(),
            client_address: non_zero(packet.ciaddr),
            relay_address: non_zero(packet.giaddr),
            server_identifier: packet.server_identifier(),
            requested_lease_seconds: packet.requested_lease_time(),
            hostname: packet
                .hostname()
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            broadcast: packet.is_broadcast(),
        })
    }

    /// Classifies a REQUEST by the fields the client filled in.
    pub fn request_kind(&self) -> RequestKind {
        match (self.server_identifier, self.client_address) {
            (Some(_), _) => RequestKind::Selecting,
            (None, None) => RequestKind::InitReboot,
            (None, Some(_)) if self.broadcast => RequestKind::Rebinding,
            (None, Some(_)) => RequestKind::Renewing,
        }
    }

    /// The address a REQUEST, RELEASE or DECLINE is about: option 50 if
    /// present, else `ciaddr`.
    pub fn target_address(&self) -> Option<Ipv4Addr> {
        self.requested_address.or(self.client_address)
    }
}

/// A reply the engine decided on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub message_type: MessageType,
    pub client_id: ClientId,
    pub transaction_id: u32,
    /// `yiaddr`; unset for a NAK.
    pub address: Option<Ipv4Addr>,
    pub lease_seconds: Option<u32>,
    pub renewal_seconds: Option<u32>,
    pub rebinding_seconds: Option<u32>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
    pub broadcast_address: Option<Ipv4Addr>,
    pub server_identifier: Ipv4Addr,
    /// Option 56, NAK only.
    pub message: Option<String>,
}

impl ServerMessage {
    fn binding(
        message_type: MessageType,
        lease: &Lease,
        subnet: &SubnetConfig,
        server_identifier: Ipv4Addr,
    ) -> Self {
        Self {
            message_type,
            client_id: lease.client_id.clone(),
            transaction_id: lease.transaction_id,
            address: Some(lease.ip_address),
            lease_seconds: Some(lease.lease_seconds),
            renewal_seconds: Some(lease.lease_seconds / 2),
            rebinding_seconds: Some(
                u32::try_from(u64::from(lease.lease_seconds) * 7 / 8).unwrap_or(u32::MAX),
            ),
            subnet_mask: Some(subnet.subnet_mask),
            gateway: subnet.gateway,
            dns_servers: subnet.dns_servers.clone(),
            domain_name: subnet.domain_name.clone(),
            broadcast_address: Some(subnet.broadcast_address()),
            server_identifier,
            message: None,
        }
    }

    pub fn offer(lease: &Lease, subnet: &SubnetConfig, server_identifier: Ipv4Addr) -> Self {
        Self::binding(MessageType::Offer, lease, subnet, server_identifier)
    }

    pub fn ack(lease: &Lease, subnet: &SubnetConfig, server_identifier: Ipv4Addr) -> Self {
        Self::binding(MessageType::Ack, lease, subnet, server_identifier)
    }

    pub fn nak(
        request: &ClientMessage,
        server_identifier: Ipv4Addr,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            message_type: MessageType::Nak,
            client_id: request.client_id.clone(),
            transaction_id: request.transaction_id,
            address: None,
            lease_seconds: None,
            renewal_seconds: None,
            rebinding_seconds: None,
            subnet_mask: None,
            gateway: None,
            dns_servers: Vec::new(),
            domain_name: None,
            broadcast_address: None,
            server_identifier,
            message: Some(reason.into()),
        }
    }

    /// Options in the order they go on the wire, without option 53.
    pub fn options(&self) -> Vec<DhcpOption> {
        let mut options = vec![DhcpOption::ServerIdentifier(self.server_identifier)];

        if let Some(seconds) = self.lease_seconds {
            options.push(DhcpOption::LeaseTime(seconds));
        }
        if let Some(seconds) = self.renewal_seconds {
            options.push(DhcpOption::RenewalTime(seconds));
        }
        if let Some(seconds) = self.rebinding_seconds {
            options.push(DhcpOption::RebindingTime(seconds));
        }
        if let Some(mask) = self.subnet_mask {
            options.push(DhcpOption::SubnetMask(mask));
        }
        if let Some(gateway) = self.gateway {
            options.push(DhcpOption::Router(vec![gateway]));
        }
        if !self.dns_servers.is_empty() {
            options.push(DhcpOption::DnsServer(self.dns_servers.clone()));
        }
        if let Some(domain) = &self.domain_name {
            options.push(DhcpOption::DomainName(domain.clone()));
        }
        if let Some(broadcast) = self.broadcast_address {
            options.push(DhcpOption::BroadcastAddress(broadcast));
        }
        if let Some(message) = &self.message {
            options.push(DhcpOption::Message(message.clone()));
        }

        options
    }

    /// Builds the reply packet for `request`.
    pub fn to_packet(&self, request: &DhcpPacket) -> DhcpPacket {
        let mut reply = DhcpPacket::create_reply(
            request,
            self.message_type,
            self.address.unwrap_or(Ipv4Addr::UNSPECIFIED),
            self.server_identifier,
            self.options(),
        );
        reply.xid = self.transaction_id;
        reply
    }
}
