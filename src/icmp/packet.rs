use crate::icmp::AddressFamily;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMPV6_DEST_UNREACHABLE: u8 = 1;
pub const ICMPV6_TIME_EXCEEDED: u8 = 3;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

const ICMP_HEADER_LEN: usize = 8;
const IPV6_HEADER_LEN: usize = 40;

#[derive(Debug, Clone)]
pub struct IcmpPacket {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl IcmpPacket {
    pub fn new_echo_request(identifier: u16, sequence: u16, payload: Vec<u8>, family: AddressFamily) -> Self {
        let icmp_type = match family {
            AddressFamily::Ipv4 => ICMP_ECHO_REQUEST,
            AddressFamily::Ipv6 => ICMPV6_ECHO_REQUEST,
        };

        let mut packet = Self {
            icmp_type,
            code: 0,
            checksum: 0,
            identifier,
            sequence,
            payload,
        };

        // The kernel fills in the ICMPv6 checksum since it covers a pseudo-header.
        if family == AddressFamily::Ipv4 {
            packet.calculate_checksum();
        }
        packet
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < ICMP_HEADER_LEN {
            return Err(anyhow::anyhow!("ICMP packet too short"));
        }

        let mut cursor = Cursor::new(data);
        let icmp_type = cursor.read_u8()?;
        let code = cursor.read_u8()?;
        let checksum = cursor.read_u16::<BigEndian>()?;
        let identifier = cursor.read_u16::<BigEndian>()?;
        let sequence = cursor.read_u16::<BigEndian>()?;

        let mut payload = Vec::new();
        cursor.read_to_end(&mut payload)?;

        Ok(Self {
            icmp_type,
            code,
            checksum,
            identifier,
            sequence,
            payload,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ICMP_HEADER_LEN + self.payload.len());
        bytes.push(self.icmp_type);
        bytes.push(self.code);
        // Writing into a Vec cannot fail.
        let _ = bytes.write_u16::<BigEndian>(self.checksum);
        let _ = bytes.write_u16::<BigEndian>(self.identifier);
        let _ = bytes.write_u16::<BigEndian>(self.sequence);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn calculate_checksum(&mut self) {
        self.checksum = 0;
        let bytes = self.to_bytes();
        self.checksum = compute_checksum(&bytes);
    }

    #[cfg(test)]
    pub fn verify_checksum(&self) -> bool {
        compute_checksum(&self.to_bytes()) == 0
    }

    fn matches(&self, identifier: Option<u16>, sequence: u16) -> bool {
        identifier.is_none_or(|id| id == self.identifier) && self.sequence == sequence
    }
}

/// Internet checksum (RFC 1071).
fn compute_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// An ICMP message that answers one of our echo requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpMessage {
    EchoReply { bytes: u32, ttl: Option<u8> },
    NetUnreachable,
    HostUnreachable,
    TimeExceeded,
}

/// Decodes a received datagram and returns the message if it belongs to the
/// request identified by `identifier` (when known) and `sequence`.
///
/// Raw IPv4 sockets deliver the IP header in front of the ICMP message;
/// `has_ip_header` says whether to strip it. ICMPv6 sockets never do.
pub fn match_reply(
    data: &[u8],
    family: AddressFamily,
    has_ip_header: bool,
    identifier: Option<u16>,
    sequence: u16,
) -> Option<IcmpMessage> {
    let (icmp, ttl) = match family {
        AddressFamily::Ipv4 if has_ip_header => {
            let ihl = ipv4_header_len(data)?;
            (data.get(ihl..)?, data.get(8).copied())
        }
        _ => (data, None),
    };

    let packet = IcmpPacket::from_bytes(icmp).ok()?;
    let (echo_reply, unreachable, time_exceeded) = match family {
        AddressFamily::Ipv4 => (ICMP_ECHO_REPLY, ICMP_DEST_UNREACHABLE, ICMP_TIME_EXCEEDED),
        AddressFamily::Ipv6 => (ICMPV6_ECHO_REPLY, ICMPV6_DEST_UNREACHABLE, ICMPV6_TIME_EXCEEDED),
    };

    if packet.icmp_type == echo_reply {
        return packet.matches(identifier, sequence).then(|| IcmpMessage::EchoReply {
            bytes: packet.payload.len() as u32,
            ttl,
        });
    }

    if packet.icmp_type != unreachable && packet.icmp_type != time_exceeded {
        return None;
    }

    // Errors quote the offending datagram after the 8-byte ICMP header.
    let quoted = icmp.get(ICMP_HEADER_LEN..)?;
    let quoted_request = match family {
        AddressFamily::Ipv4 => quoted.get(ipv4_header_len(quoted)?..)?,
        AddressFamily::Ipv6 => quoted.get(IPV6_HEADER_LEN..)?,
    };
    let quoted_request = IcmpPacket::from_bytes(quoted_request).ok()?;
    let echo_request = match family {
        AddressFamily::Ipv4 => ICMP_ECHO_REQUEST,
        AddressFamily::Ipv6 => ICMPV6_ECHO_REQUEST,
    };
    if quoted_request.icmp_type != echo_request || !quoted_request.matches(identifier, sequence) {
        return None;
    }

    classify_error(family, packet.icmp_type, packet.code)
}

/// Maps an ICMP error type and code onto the message it stands for, or `None`
/// for errors that do not end an echo attempt.
pub fn classify_error(family: AddressFamily, icmp_type: u8, code: u8) -> Option<IcmpMessage> {
    let (unreachable, time_exceeded) = match family {
        AddressFamily::Ipv4 => (ICMP_DEST_UNREACHABLE, ICMP_TIME_EXCEEDED),
        AddressFamily::Ipv6 => (ICMPV6_DEST_UNREACHABLE, ICMPV6_TIME_EXCEEDED),
    };

    if icmp_type == time_exceeded {
        return Some(IcmpMessage::TimeExceeded);
    }
    if icmp_type != unreachable {
        return None;
    }

    let net = match family {
        // net unreachable, net unknown, net prohibited, net unreachable for TOS
        AddressFamily::Ipv4 => matches!(code, 0 | 6 | 9 | 11),
        // no route to destination
        AddressFamily::Ipv6 => code == 0,
    };
    Some(if net {
        IcmpMessage::NetUnreachable
    } else {
        IcmpMessage::HostUnreachable
    })
}

fn ipv4_header_len(data: &[u8]) -> Option<usize> {
    let first = *data.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(first & 0x0f) * 4;
    (ihl >= 20 && data.len() >= ihl).then_some(ihl)
}
