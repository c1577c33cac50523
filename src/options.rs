//! DHCP options (RFC 2132).
//!
//! Options travel as code/length/value triples after the magic cookie. Only
//! the options the lease engine reads or writes get a typed variant; every
//! other code is kept as [`DhcpOption::Unknown`] so a decoded packet can be
//! re-encoded without loss.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// An option value is at most 255 bytes, so 63 IPv4 addresses.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

const MAX_OPTION_LEN: usize = u8::MAX as usize;

/// Option codes with a typed representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    /// Human-readable error text, sent with a NAK.
    Message = 56,
    RenewalTime = 58,
    RebindingTime = 59,
    ClientIdentifier = 61,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Pad,
            1 => Self::SubnetMask,
            3 => Self::Router,
            6 => Self::DnsServer,
            12 => Self::Hostname,
            15 => Self::DomainName,
            28 => Self::BroadcastAddress,
            50 => Self::RequestedIpAddress,
            51 => Self::LeaseTime,
            53 => Self::MessageType,
            54 => Self::ServerIdentifier,
            55 => Self::ParameterRequestList,
            56 => Self::Message,
            58 => Self::RenewalTime,
            59 => Self::RebindingTime,
            61 => Self::ClientIdentifier,
            255 => Self::End,
            other => return Err(other),
        })
    }
}

/// DHCP message types (option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    /// Returns true for the types a client sends.
    pub fn is_client_message(self) -> bool {
        matches!(
            self,
            Self::Discover | Self::Request | Self::Decline | Self::Release | Self::Inform
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            other => return Err(other),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };
        f.write_str(name)
    }
}

/// A decoded option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// The first router is the default gateway.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Hostname(String),
    DomainName(String),
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    Message(String),
    RenewalTime(u32),
    RebindingTime(u32),
    ClientIdentifier(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

fn malformed(what: &str, data: &[u8]) -> Error {
    Error::MalformedMessage(format!("invalid {what} option length {}", data.len()))
}

fn ipv4(what: &str, data: &[u8]) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data.try_into().map_err(|_| malformed(what, data))?;
    Ok(Ipv4Addr::from(octets))
}

fn ipv4_list(what: &str, data: &[u8]) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(malformed(what, data));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn seconds(what: &str, data: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = data.try_into().map_err(|_| malformed(what, data))?;
    Ok(u32::from_be_bytes(bytes))
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}

impl DhcpOption {
    pub fn code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::Message(_) => OptionCode::Message,
            Self::RenewalTime(_) => OptionCode::RenewalTime,
            Self::RebindingTime(_) => OptionCode::RebindingTime,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Decodes the value of option `code`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] when the value length does not fit
    /// the option, or when option 53 carries an unknown message type.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let option = match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Self::SubnetMask(ipv4("subnet mask", data)?),
            Ok(OptionCode::Router) => Self::Router(ipv4_list("router", data)?),
            Ok(OptionCode::DnsServer) => Self::DnsServer(ipv4_list("DNS server", data)?),
            Ok(OptionCode::Hostname) => Self::Hostname(text(data)),
            Ok(OptionCode::DomainName) => Self::DomainName(text(data)),
            Ok(OptionCode::BroadcastAddress) => {
                Self::BroadcastAddress(ipv4("broadcast address", data)?)
            }
            Ok(OptionCode::RequestedIpAddress) => {
                Self::RequestedIpAddress(ipv4("requested address", data)?)
            }
            Ok(OptionCode::LeaseTime) => Self::LeaseTime(seconds("lease time", data)?),
            Ok(OptionCode::MessageType) => {
                let [value] = data else {
                    return Err(malformed("message type", data));
                };
                let message_type = MessageType::try_from(*value).map_err(|value| {
                    Error::MalformedMessage(format!("unknown message type {value}"))
                })?;
                Self::MessageType(message_type)
            }
            Ok(OptionCode::ServerIdentifier) => {
                Self::ServerIdentifier(ipv4("server identifier", data)?)
            }
            Ok(OptionCode::ParameterRequestList) => Self::ParameterRequestList(data.to_vec()),
            Ok(OptionCode::Message) => Self::Message(text(data)),
            Ok(OptionCode::RenewalTime) => Self::RenewalTime(seconds("renewal time", data)?),
            Ok(OptionCode::RebindingTime) => {
                Self::RebindingTime(seconds("rebinding time", data)?)
            }
            Ok(OptionCode::ClientIdentifier) => {
                if data.is_empty() {
                    return Err(malformed("client identifier", data));
                }
                Self::ClientIdentifier(data.to_vec())
            }
            Ok(OptionCode::Pad | OptionCode::End) => {
                return Err(Error::MalformedMessage(format!(
                    "option code {code} carries no value"
                )));
            }
            Err(code) => Self::Unknown(code, data.to_vec()),
        };
        Ok(option)
    }

    /// Appends the option in wire format to `buffer`.
    ///
    /// Values longer than 255 bytes are truncated.
    pub fn encode_into(&self, buffer: &mut Vec<u8>) {
        let value: Vec<u8> = match self {
            Self::SubnetMask(address)
            | Self::BroadcastAddress(address)
            | Self::RequestedIpAddress(address)
            | Self::ServerIdentifier(address) => address.octets().to_vec(),
            Self::Router(addresses) | Self::DnsServer(addresses) => addresses
                .iter()
                .take(MAX_ADDRESSES_PER_OPTION)
                .flat_map(|address| address.octets())
                .collect(),
            Self::Hostname(name) | Self::DomainName(name) | Self::Message(name) => {
                name.as_bytes().to_vec()
            }
            Self::LeaseTime(value) | Self::RenewalTime(value) | Self::RebindingTime(value) => {
                value.to_be_bytes().to_vec()
            }
            Self::MessageType(message_type) => vec![*message_type as u8],
            Self::ParameterRequestList(bytes)
            | Self::ClientIdentifier(bytes)
            | Self::Unknown(_, bytes) => bytes.clone(),
        };

        let len = value.len().min(MAX_OPTION_LEN);
        buffer.push(self.code());
        buffer.push(len as u8);
        buffer.extend_from_slice(&value[..len]);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        self.encode_into(&mut buffer);
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_values() {
        for value in 1..=8u8 {
            assert_eq!(MessageType::try_from(value).unwrap() as u8, value);
        }
        assert_eq!(MessageType::try_from(0), Err(0));
        assert_eq!(MessageType::try_from(9), Err(9));
        assert!(MessageType::Release.is_client_message());
        assert!(!MessageType::Offer.is_client_message());
        assert_eq!(MessageType::Nak.to_string(), "NAK");
    }

    #[test]
    fn test_reply_options_survive_reencoding() {
        let options = [
            DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)),
            DhcpOption::Router(vec![Ipv4Addr::new(172, 22, 0, 1)]),
            DhcpOption::DnsServer(vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(9, 9, 9, 9)]),
            DhcpOption::LeaseTime(3600),
            DhcpOption::RenewalTime(1800),
            DhcpOption::RebindingTime(3150),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(172, 22, 0, 2)),
            DhcpOption::Message("address in use".to_string()),
            DhcpOption::ClientIdentifier(vec![1, 0x00, 0x14, 0x22, 0x01, 0x23, 0x45]),
        ];

        for option in options {
            let wire = option.encode();
            assert_eq!(wire[0], option.code());
            assert_eq!(wire[1] as usize, wire.len() - 2);
            assert_eq!(DhcpOption::parse(wire[0], &wire[2..]).unwrap(), option);
        }
    }

    #[test]
    fn test_rejects_bad_lengths() {
        assert!(DhcpOption::parse(1, &[255, 255, 255]).is_err());
        assert!(DhcpOption::parse(3, &[]).is_err());
        assert!(DhcpOption::parse(6, &[8, 8, 8, 8, 8]).is_err());
        assert!(DhcpOption::parse(51, &[0, 0, 0]).is_err());
        assert!(DhcpOption::parse(53, &[1, 1]).is_err());
        assert!(DhcpOption::parse(53, &[42]).is_err());
        assert!(DhcpOption::parse(61, &[]).is_err());
        assert!(DhcpOption::parse(255, &[]).is_err());
    }

    #[test]
    fn test_unknown_option_is_preserved() {
        let option = DhcpOption::parse(82, &[1, 2, 3]).unwrap();
        assert_eq!(option, DhcpOption::Unknown(82, vec![1, 2, 3]));
        assert_eq!(option.encode(), vec![82, 3, 1, 2, 3]);
    }

    #[test]
    fn test_hostname_drops_trailing_nul() {
        let option = DhcpOption::parse(12, b"printer\0").unwrap();
        assert_eq!(option, DhcpOption::Hostname("printer".to_string()));
    }

    #[test]
    fn test_long_values_are_truncated() {
        let option = DhcpOption::Message("x".repeat(300));
        let wire = option.encode();
        assert_eq!(wire[1], 255);
        assert_eq!(wire.len(), 257);
    }
}
