//! BOOTP/DHCP wire format (RFC 2131 §2).
//!
//! ```text
//!  offset  size  field
//!       0     1  op        1 = BOOTREQUEST, 2 = BOOTREPLY
//!       1     1  htype     hardware type
//!       2     1  hlen      hardware address length
//!       3     1  hops      relay hop count
//!       4     4  xid       transaction id
//!       8     2  secs
//!      10     2  flags     bit 15 = broadcast
//!      12     4  ciaddr    client address (renewing / rebinding)
//!      16     4  yiaddr    "your" address
//!      20     4  siaddr    next server
//!      24     4  giaddr    relay agent
//!      28    16  chaddr    client hardware address
//!      44    64  sname
//!     108   128  file
//!     236     4  magic cookie 99.130.83.99
//!     240     -  options
//! ```
//!
//! `sname` and `file` are neither interpreted nor preserved; replies carry
//! them zeroed.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::lease::ClientId;
use crate::options::{DhcpOption, MessageType, OptionCode};

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const MAGIC_COOKIE_OFFSET: usize = 236;
const OPTIONS_OFFSET: usize = MAGIC_COOKIE_OFFSET + MAGIC_COOKIE.len();
const CHADDR_OFFSET: usize = 28;
const CHADDR_LEN: usize = 16;

/// BOOTP relay agents expect at least this many bytes.
const MIN_PACKET_SIZE: usize = 300;

/// Relay loop protection.
const MAX_HOPS: u8 = 16;

const BROADCAST_FLAG: u16 = 0x8000;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

pub use crate::lease::HTYPE_ETHERNET;
pub const HLEN_ETHERNET: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; CHADDR_LEN],
    pub options: Vec<DhcpOption>,
}

fn read_ipv4(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

impl DhcpPacket {
    /// Decodes a datagram.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] for datagrams shorter than the
    /// fixed header, a wrong magic cookie, more than 16 hops, a hardware
    /// address length that does not fit `chaddr` (or is not 6 for Ethernet),
    /// and truncated or ill-sized options.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < OPTIONS_OFFSET {
            return Err(Error::MalformedMessage(format!(
                "packet too short: {} bytes (minimum {})",
                data.len(),
                OPTIONS_OFFSET
            )));
        }

        if data[MAGIC_COOKIE_OFFSET..OPTIONS_OFFSET] != MAGIC_COOKIE {
            return Err(Error::MalformedMessage("invalid magic cookie".to_string()));
        }

        let (op, htype, hlen, hops) = (data[0], data[1], data[2], data[3]);

        if hops > MAX_HOPS {
            return Err(Error::MalformedMessage(format!(
                "hop count {hops} exceeds maximum {MAX_HOPS}"
            )));
        }

        if usize::from(hlen) > CHADDR_LEN || (htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET) {
            return Err(Error::MalformedMessage(format!(
                "invalid hardware address length {hlen} for type {htype}"
            )));
        }

        let mut chaddr = [0u8; CHADDR_LEN];
        chaddr.copy_from_slice(&data[CHADDR_OFFSET..CHADDR_OFFSET + CHADDR_LEN]);

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: read_ipv4(data, 12),
            yiaddr: read_ipv4(data, 16),
            siaddr: read_ipv4(data, 20),
            giaddr: read_ipv4(data, 24),
            chaddr,
            options: parse_options(&data[OPTIONS_OFFSET..])?,
        })
    }

    /// Encodes the packet, terminated by an End option and zero-padded to
    /// 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(576);

        packet.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        for address in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            packet.extend_from_slice(&address.octets());
        }
        packet.extend_from_slice(&self.chaddr);
        // sname + file
        packet.resize(MAGIC_COOKIE_OFFSET, 0);
        packet.extend_from_slice(&MAGIC_COOKIE);

        for option in &self.options {
            option.encode_into(&mut packet);
        }
        packet.push(OptionCode::End as u8);

        if packet.len() < MIN_PACKET_SIZE {
            packet.resize(MIN_PACKET_SIZE, 0);
        }
        packet
    }

    fn find_option<'a, T>(&'a self, select: impl Fn(&'a DhcpOption) -> Option<T>) -> Option<T> {
        self.options.iter().find_map(select)
    }

    /// Option 53. The first occurrence wins.
    pub fn message_type(&self) -> Option<MessageType> {
        self.find_option(|option| match option {
            DhcpOption::MessageType(message_type) => Some(*message_type),
            _ => None,
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.find_option(|option| match option {
            DhcpOption::RequestedIpAddress(address) => Some(*address),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.find_option(|option| match option {
            DhcpOption::ServerIdentifier(address) => Some(*address),
            _ => None,
        })
    }

    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.find_option(|option| match option {
            DhcpOption::ClientIdentifier(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    pub fn hostname(&self) -> Option<&str> {
        self.find_option(|option| match option {
            DhcpOption::Hostname(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn requested_lease_time(&self) -> Option<u32> {
        self.find_option(|option| match option {
            DhcpOption::LeaseTime(seconds) => Some(*seconds),
            _ => None,
        })
    }

    /// Client hardware address, `hlen` bytes long.
    pub fn hardware_address(&self) -> &[u8] {
        &self.chaddr[..usize::from(self.hlen).min(CHADDR_LEN)]
    }

    /// Option 61 if present, else hardware type followed by `chaddr`.
    ///
    /// Returns `None` when neither carries any bytes.
    pub fn client_id(&self) -> Option<ClientId> {
        if let Some(id) = self.client_identifier() {
            return Some(ClientId::new(id));
        }
        let hardware = self.hardware_address();
        if hardware.is_empty() || hardware.iter().all(|byte| *byte == 0) {
            return None;
        }
        Some(ClientId::from_hardware(self.htype, hardware))
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    /// Builds a BOOTREPLY for `request` with option 53 first.
    ///
    /// `xid`, `flags`, `giaddr` and the hardware address are echoed from the
    /// request.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut all_options = Vec::with_capacity(options.len() + 1);
        all_options.push(DhcpOption::MessageType(message_type));
        all_options.extend(options);

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            options: all_options,
        }
    }
}

fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>> {
    let mut options = Vec::new();
    let mut index = 0;

    while let Some(&code) = data.get(index) {
        if code == OptionCode::Pad as u8 {
            index += 1;
            continue;
        }
        if code == OptionCode::End as u8 {
            break;
        }

        let Some(&length) = data.get(index + 1) else {
            return Err(Error::MalformedMessage(format!(
                "option {code} is missing its length"
            )));
        };
        let start = index + 2;
        let end = start + usize::from(length);
        let Some(value) = data.get(start..end) else {
            return Err(Error::MalformedMessage(format!(
                "option {code} truncated: {length} bytes declared, {} present",
                data.len() - start
            )));
        };

        options.push(DhcpOption::parse(code, value)?);
        index = end;
    }

    Ok(options)
}
