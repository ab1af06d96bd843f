//! # Message Codec
//!
//! Message layout, in order:
//!
//! | Field | Encoding |
//! |-------|----------|
//! | p2p id | i32 |
//! | message id | i32 |
//! | command | u8 |
//! | type | u8 |
//! | sender | peer address |
//! | recipient | peer address |
//! | on behalf of | 20 bytes |
//! | payload length | i32 |
//! | payload | bytes |
//!
//! Peer address layout: 20-byte id, flags byte, TCP port u16, UDP port u16,
//! 4 or 16 IP bytes, then (only when the relayed flag is set) a relay count
//! u8 followed by that many relay entries (flags byte, TCP port, UDP port,
//! IP bytes).
//!
//! Over TCP each message is preceded by a 4-byte big-endian length; over UDP
//! a datagram carries exactly one message.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;

use dht_types::{PeerAddress, PeerId, PeerSocketAddress, MAX_RELAYS, PEER_ID_BYTES};

use crate::error::WireError;
use crate::message::{Message, MessageType};
use crate::primitives::{WireReader, WireWriter};

/// Largest encoded message accepted on any transport.
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;

/// Largest message that fits one UDP datagram.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Width of the TCP length prefix.
pub const FRAME_HEADER_BYTES: usize = 4;

const FLAG_IPV6: u8 = 0x01;
const FLAG_FIREWALLED_TCP: u8 = 0x02;
const FLAG_FIREWALLED_UDP: u8 = 0x04;
const FLAG_RELAYED: u8 = 0x08;

fn write_socket(writer: &mut WireWriter, socket: &PeerSocketAddress) {
    writer.write_u16(socket.tcp_port);
    writer.write_u16(socket.udp_port);
    match socket.ip {
        IpAddr::V4(ip) => writer.write_bytes(&ip.octets()),
        IpAddr::V6(ip) => writer.write_bytes(&ip.octets()),
    }
}

fn read_socket(reader: &mut WireReader, ipv6: bool) -> Result<PeerSocketAddress, WireError> {
    let tcp_port = reader.read_u16()?;
    let udp_port = reader.read_u16()?;
    let ip = if ipv6 {
        IpAddr::V6(Ipv6Addr::from(reader.read_array::<16>()?))
    } else {
        IpAddr::V4(Ipv4Addr::from(reader.read_array::<4>()?))
    };
    Ok(PeerSocketAddress::new(ip, tcp_port, udp_port))
}

pub fn encode_address(writer: &mut WireWriter, address: &PeerAddress) {
    let mut flags = 0u8;
    if address.socket().is_ipv6() {
        flags |= FLAG_IPV6;
    }
    if address.is_firewalled_tcp() {
        flags |= FLAG_FIREWALLED_TCP;
    }
    if address.is_firewalled_udp() {
        flags |= FLAG_FIREWALLED_UDP;
    }
    if address.is_relayed() {
        flags |= FLAG_RELAYED;
    }

    writer.write_bytes(address.peer_id().as_bytes());
    writer.write_u8(flags);
    write_socket(writer, &address.socket());

    if address.is_relayed() {
        // bounded by MAX_RELAYS, fits a byte
        writer.write_u8(address.relays().len() as u8);
        for relay in address.relays() {
            writer.write_u8(if relay.is_ipv6() { FLAG_IPV6 } else { 0 });
            write_socket(writer, relay);
        }
    }
}

pub fn decode_address(reader: &mut WireReader) -> Result<PeerAddress, WireError> {
    let peer_id = PeerId::new(reader.read_array::<PEER_ID_BYTES>()?);
    let flags = reader.read_u8()?;
    let socket = read_socket(reader, flags & FLAG_IPV6 != 0)?;

    let mut relays = Vec::new();
    if flags & FLAG_RELAYED != 0 {
        let count = reader.read_u8()? as usize;
        if count == 0 || count > MAX_RELAYS {
            return Err(WireError::BadAddress(format!(
                "relay count {count} outside 1..={MAX_RELAYS}"
            )));
        }
        for _ in 0..count {
            let relay_flags = reader.read_u8()?;
            relays.push(read_socket(reader, relay_flags & FLAG_IPV6 != 0)?);
        }
    }

    PeerAddress::from_parts(
        peer_id,
        socket,
        flags & FLAG_FIREWALLED_TCP != 0,
        flags & FLAG_FIREWALLED_UDP != 0,
        relays,
    )
    .map_err(WireError::from)
}

/// Encode one message without framing.
pub fn encode_message(message: &Message) -> Result<Bytes, WireError> {
    let mut writer = WireWriter::with_capacity(128 + message.payload.len());
    writer.write_i32(message.p2p_id);
    writer.write_i32(message.message_id);
    writer.write_u8(message.command);
    writer.write_u8(message.kind.code());
    encode_address(&mut writer, &message.sender);
    encode_address(&mut writer, &message.recipient);
    writer.write_bytes(message.on_behalf_of.as_bytes());

    let payload_len = i32::try_from(message.payload.len()).map_err(|_| WireError::Oversized {
        size: message.payload.len(),
        max: MAX_MESSAGE_BYTES,
    })?;
    writer.write_i32(payload_len);
    writer.write_bytes(&message.payload);

    if writer.len() > MAX_MESSAGE_BYTES {
        return Err(WireError::Oversized {
            size: writer.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(writer.freeze())
}

/// Decode exactly one message; trailing bytes are an error.
pub fn decode_message(bytes: Bytes) -> Result<Message, WireError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(WireError::Oversized {
            size: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }

    let mut reader = WireReader::new(bytes);
    let p2p_id = reader.read_i32()?;
    let message_id = reader.read_i32()?;
    let command = reader.read_u8()?;
    let kind = MessageType::from_code(reader.read_u8()?)?;
    let sender = decode_address(&mut reader)?;
    let recipient = decode_address(&mut reader)?;
    let on_behalf_of = PeerId::new(reader.read_array::<PEER_ID_BYTES>()?);

    let payload_len = reader.read_i32()?;
    let payload_len =
        usize::try_from(payload_len).map_err(|_| WireError::NegativeLength(payload_len))?;
    let payload = reader.read_bytes(payload_len)?;

    if reader.remaining() != 0 {
        return Err(WireError::TrailingBytes(reader.remaining()));
    }

    Ok(Message {
        p2p_id,
        message_id,
        command,
        kind,
        sender,
        recipient,
        on_behalf_of,
        payload,
        observed_remote: None,
    })
}

/// The 4-byte length prefix that precedes a `len`-byte body on stream
/// transports.
pub fn frame_header(len: usize) -> Result<[u8; FRAME_HEADER_BYTES], WireError> {
    if len > MAX_MESSAGE_BYTES {
        return Err(WireError::Oversized {
            size: len,
            max: MAX_MESSAGE_BYTES,
        });
    }
    // MAX_MESSAGE_BYTES fits in an i32
    Ok((len as i32).to_be_bytes())
}

/// Validate a TCP length prefix and return the body length that follows.
pub fn frame_length(header: [u8; FRAME_HEADER_BYTES]) -> Result<usize, WireError> {
    let len = i32::from_be_bytes(header);
    let len = usize::try_from(len).map_err(|_| WireError::NegativeLength(len))?;
    if len > MAX_MESSAGE_BYTES {
        return Err(WireError::Oversized {
            size: len,
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Command;
    use proptest::prelude::*;

    fn address(port: u16) -> PeerAddress {
        PeerAddress::new(
            PeerId::random(),
            PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), port, port + 1),
        )
    }

    fn sample_request() -> Message {
        Message::request(7, Command::Put, MessageType::Request1, address(4001), address(4002))
            .with_message_id(-5)
            .with_payload(Bytes::from_static(b"value"))
    }

    #[test]
    fn test_address_layout() {
        let id = PeerId::new([0xab; 20]);
        let address = PeerAddress::new(
            id,
            PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4001, 4002),
        );
        let mut writer = WireWriter::new();
        encode_address(&mut writer, &address);
        let bytes = writer.freeze();

        assert_eq!(bytes.len(), 20 + 1 + 2 + 2 + 4);
        assert_eq!(&bytes[..20], &[0xab; 20]);
        assert_eq!(bytes[20], 0);
        assert_eq!(&bytes[21..], &[0x0f, 0xa1, 0x0f, 0xa2, 10, 0, 0, 1]);
    }

    #[test]
    fn test_relayed_ipv6_address() {
        let relay = PeerSocketAddress::with_port(IpAddr::V6(Ipv6Addr::LOCALHOST), 5000);
        let address = address(4001)
            .change_firewalled(true, true)
            .with_relays(vec![relay, PeerSocketAddress::default()])
            .unwrap();

        let mut writer = WireWriter::new();
        encode_address(&mut writer, &address);
        let mut reader = WireReader::new(writer.freeze());
        let decoded = decode_address(&mut reader).unwrap();

        assert_eq!(decoded, address);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_message_round_trip_drops_observed_remote() {
        let mut request = sample_request();
        request.observed_remote = Some("127.0.0.1:9".parse().unwrap());

        let decoded = decode_message(encode_message(&request).unwrap()).unwrap();
        assert_eq!(decoded.observed_remote, None);
        assert_eq!(decoded.message_id, -5);
        assert_eq!(decoded.command, Command::Put.code());
        assert_eq!(decoded.sender, request.sender);
        assert_eq!(decoded.recipient, request.recipient);
        assert_eq!(&decoded.payload[..], b"value");
    }

    #[test]
    fn test_truncated_message_is_rejected() {
        let encoded = encode_message(&sample_request()).unwrap();
        let truncated = encoded.slice(..encoded.len() - 1);
        assert!(matches!(
            decode_message(truncated),
            Err(WireError::Underflow { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut writer = WireWriter::new();
        writer.write_bytes(&encode_message(&sample_request()).unwrap());
        writer.write_u8(0);
        assert_eq!(
            decode_message(writer.freeze()).unwrap_err(),
            WireError::TrailingBytes(1)
        );
    }

    #[test]
    fn test_unknown_type_code() {
        let mut encoded = encode_message(&sample_request()).unwrap().to_vec();
        encoded[9] = 200;
        assert_eq!(
            decode_message(Bytes::from(encoded)).unwrap_err(),
            WireError::UnknownMessageType(200)
        );
    }

    #[test]
    fn test_oversized_payload() {
        let request = sample_request().with_payload(vec![0u8; MAX_MESSAGE_BYTES]);
        assert!(matches!(
            encode_message(&request),
            Err(WireError::Oversized { .. })
        ));
    }

    #[test]
    fn test_frame_header() {
        let body = encode_message(&sample_request()).unwrap();
        let header = frame_header(body.len()).unwrap();
        assert_eq!(frame_length(header).unwrap(), body.len());
        assert_eq!(frame_length(frame_header(0).unwrap()).unwrap(), 0);
        assert_eq!(
            frame_header(MAX_MESSAGE_BYTES + 1).unwrap_err(),
            WireError::Oversized {
                size: MAX_MESSAGE_BYTES + 1,
                max: MAX_MESSAGE_BYTES
            }
        );
        assert_eq!(
            frame_length((-1i32).to_be_bytes()).unwrap_err(),
            WireError::NegativeLength(-1)
        );
        assert!(frame_length(((MAX_MESSAGE_BYTES + 1) as i32).to_be_bytes()).is_err());
    }

    proptest! {
        #[test]
        fn prop_arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_message(Bytes::from(data));
        }

        #[test]
        fn prop_truncated_message_is_rejected(cut in 1usize..40) {
            let encoded = encode_message(&sample_request()).unwrap();
            let truncated = encoded.slice(..encoded.len().saturating_sub(cut));
            prop_assert!(decode_message(truncated).is_err());
        }
    }
}
