use std::net::Ipv4Addr;

use proptest::prelude::*;

use leasehold::{ClientMessage, DhcpOption, DhcpPacket, MessageType, ServerMessage};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const DHCP_FIXED_HEADER_SIZE: usize = 240;

fn valid_header() -> Vec<u8> {
    let mut packet = vec![0u8; DHCP_FIXED_HEADER_SIZE];
    packet[0] = 1;
    packet[1] = 1;
    packet[2] = 6;
    packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
    packet
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(5000))]

    #[test]
    fn parse_never_panics_on_arbitrary_bytes(data: Vec<u8>) {
        let _ = DhcpPacket::parse(&data);
    }

    #[test]
    fn parse_never_panics_on_valid_header_with_random_options(
        options_data in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let mut packet = valid_header();
        packet.extend_from_slice(&options_data);
        if let Ok(parsed) = DhcpPacket::parse(&packet) {
            let _ = ClientMessage::from_packet(&parsed);
        }
    }

    #[test]
    fn parse_never_panics_on_random_option_lengths(
        option_code in 1u8..254,
        option_length in any::<u8>(),
        option_data in prop::collection::vec(any::<u8>(), 0..256)
    ) {
        let mut packet = valid_header();
        packet.push(option_code);
        packet.push(option_length);
        let actual_len = (option_length as usize).min(option_data.len());
        packet.extend_from_slice(&option_data[..actual_len]);
        packet.push(255);
        let _ = DhcpPacket::parse(&packet);
    }

    #[test]
    fn typed_request_from_any_header(
        op in 1u8..=2,
        message_type in 1u8..=8,
        flags in any::<u16>(),
        ciaddr in any::<[u8; 4]>(),
        giaddr in any::<[u8; 4]>(),
        chaddr in any::<[u8; 6]>(),
    ) {
        let mut packet = valid_header();
        packet[0] = op;
        packet[10..12].copy_from_slice(&flags.to_be_bytes());
        packet[12..16].copy_from_slice(&ciaddr);
        packet[24..28].copy_from_slice(&giaddr);
        packet[28..34].copy_from_slice(&chaddr);
        packet.extend_from_slice(&[53, 1, message_type, 255]);

        let parsed = DhcpPacket::parse(&packet).unwrap();
        let client_message = matches!(message_type, 1 | 3 | 4 | 7);
        let accepted = op == 1 && client_message && chaddr != [0; 6];

        match ClientMessage::from_packet(&parsed) {
            Ok(message) => {
                prop_assert!(accepted);
                prop_assert_eq!(message.broadcast, flags & 0x8000 != 0);
                prop_assert_eq!(
                    message.relay_address,
                    Some(Ipv4Addr::from(giaddr)).filter(|address| !address.is_unspecified())
                );
                prop_assert_eq!(
                    message.client_address,
                    Some(Ipv4Addr::from(ciaddr)).filter(|address| !address.is_unspecified())
                );
            }
            Err(error) => {
                prop_assert!(!accepted);
                prop_assert!(error.is_protocol_error());
            }
        }
    }

    #[test]
    fn nak_reply_echoes_request_identity(
        xid in any::<u32>(),
        flags in any::<u16>(),
        giaddr in any::<[u8; 4]>(),
        chaddr in any::<[u8; 6]>(),
        reason in "[a-z ]{1,40}",
    ) {
        prop_assume!(chaddr != [0; 6]);

        let mut packet = valid_header();
        packet[4..8].copy_from_slice(&xid.to_be_bytes());
        packet[10..12].copy_from_slice(&flags.to_be_bytes());
        packet[24..28].copy_from_slice(&giaddr);
        packet[28..34].copy_from_slice(&chaddr);
        packet.extend_from_slice(&[53, 1, 3, 255]);

        let request = DhcpPacket::parse(&packet).unwrap();
        let message = ClientMessage::from_packet(&request).unwrap();
        let server = Ipv4Addr::new(192, 0, 2, 1);
        let reply = ServerMessage::nak(&message, server, reason.clone()).to_packet(&request);
        let wire = DhcpPacket::parse(&reply.encode()).unwrap();

        prop_assert_eq!(wire.op, 2);
        prop_assert_eq!(wire.xid, xid);
        prop_assert_eq!(wire.flags, flags);
        prop_assert_eq!(wire.giaddr, Ipv4Addr::from(giaddr));
        prop_assert_eq!(&wire.chaddr[..6], &chaddr[..]);
        prop_assert_eq!(wire.yiaddr, Ipv4Addr::UNSPECIFIED);
        prop_assert_eq!(wire.message_type(), Some(MessageType::Nak));
        prop_assert_eq!(wire.server_identifier(), Some(server));
        prop_assert!(wire.options.contains(&DhcpOption::Message(reason)));
    }

    #[test]
    fn encoded_packets_are_at_least_300_bytes(
        xid in any::<u32>(),
        hostname in "[a-z0-9-]{0,64}",
    ) {
        let mut packet = valid_header();
        packet[4..8].copy_from_slice(&xid.to_be_bytes());
        packet.push(255);

        let mut parsed = DhcpPacket::parse(&packet).unwrap();
        if !hostname.is_empty() {
            parsed.options.push(DhcpOption::Hostname(hostname));
        }
        prop_assert!(parsed.encode().len() >= 300);
    }

    #[test]
    fn short_packets_always_rejected(
        data in prop::collection::vec(any::<u8>(), 0..240)
    ) {
        let result = DhcpPacket::parse(&data);
        prop_assert!(result.is_err());
    }

    #[test]
    fn bad_magic_cookie_always_rejected(
        cookie in any::<[u8; 4]>()
    ) {
        prop_assume!(cookie != DHCP_MAGIC_COOKIE);

        let mut packet = valid_header();
        packet[236..240].copy_from_slice(&cookie);
        packet.push(255);

        let result = DhcpPacket::parse(&packet);
        prop_assert!(result.is_err());
    }

    #[test]
    fn excessive_hops_always_rejected(
        hops in 17u8..=255
    ) {
        let mut packet = valid_header();
        packet[3] = hops;
        packet.push(255);

        let result = DhcpPacket::parse(&packet);
        prop_assert!(result.is_err());
    }
}
