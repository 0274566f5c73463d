//! STUN attributes and their TLV value encodings (RFC 8489 §14, RFC 8656 §18, RFC 8445 §16).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::message::{IntegrityKey, TransactionId, MAGIC_COOKIE};
use crate::error::StunError;

/// IPv4/IPv6 family bytes of the address attributes.
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Numeric STUN attribute ids understood by this codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunAttributeType {
    MappedAddress,
    Username,
    MessageIntegrity,
    ErrorCode,
    UnknownAttributes,
    ChannelNumber,
    Lifetime,
    XorPeerAddress,
    Data,
    XorRelayedAddress,
    RequestedTransport,
    XorMappedAddress,
    Priority,
    UseCandidate,
    Software,
    TransactionTransmitCounter,
    IceControlled,
    IceControlling,
}

impl StunAttributeType {
    pub const fn id(self) -> u16 {
        match self {
            StunAttributeType::MappedAddress => 0x0001,
            StunAttributeType::Username => 0x0006,
            StunAttributeType::MessageIntegrity => 0x0008,
            StunAttributeType::ErrorCode => 0x0009,
            StunAttributeType::UnknownAttributes => 0x000A,
            StunAttributeType::ChannelNumber => 0x000C,
            StunAttributeType::Lifetime => 0x000D,
            StunAttributeType::XorPeerAddress => 0x0012,
            StunAttributeType::Data => 0x0013,
            StunAttributeType::XorRelayedAddress => 0x0016,
            StunAttributeType::RequestedTransport => 0x0019,
            StunAttributeType::XorMappedAddress => 0x0020,
            StunAttributeType::Priority => 0x0024,
            StunAttributeType::UseCandidate => 0x0025,
            StunAttributeType::Software => 0x8022,
            StunAttributeType::TransactionTransmitCounter => 0x8025,
            StunAttributeType::IceControlled => 0x8029,
            StunAttributeType::IceControlling => 0x802A,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        let typ = match id {
            0x0001 => StunAttributeType::MappedAddress,
            0x0006 => StunAttributeType::Username,
            0x0008 => StunAttributeType::MessageIntegrity,
            0x0009 => StunAttributeType::ErrorCode,
            0x000A => StunAttributeType::UnknownAttributes,
            0x000C => StunAttributeType::ChannelNumber,
            0x000D => StunAttributeType::Lifetime,
            0x0012 => StunAttributeType::XorPeerAddress,
            0x0013 => StunAttributeType::Data,
            0x0016 => StunAttributeType::XorRelayedAddress,
            0x0019 => StunAttributeType::RequestedTransport,
            0x0020 => StunAttributeType::XorMappedAddress,
            0x0024 => StunAttributeType::Priority,
            0x0025 => StunAttributeType::UseCandidate,
            0x8022 => StunAttributeType::Software,
            0x8025 => StunAttributeType::TransactionTransmitCounter,
            0x8029 => StunAttributeType::IceControlled,
            0x802A => StunAttributeType::IceControlling,
            _ => return None,
        };
        Some(typ)
    }

    /// Attributes below 0x8000 must be understood by the receiver.
    pub const fn is_comprehension_required(id: u16) -> bool {
        id < 0x8000
    }
}

/// A decoded STUN attribute.
///
/// `MessageIntegrity` carries the key it was computed with. On encode the key signs the
/// message; on decode it is the key the HMAC was verified against, or `None` when no key
/// was available and the message must be treated as unauthenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    MappedAddress(SocketAddr),
    Username(String),
    MessageIntegrity(Option<IntegrityKey>),
    ErrorCode { code: u16, reason: String },
    UnknownAttributes(Vec<u16>),
    XorMappedAddress(SocketAddr),
    ChannelNumber(u16),
    /// Seconds.
    Lifetime(u32),
    XorPeerAddress(SocketAddr),
    Data(Vec<u8>),
    XorRelayedAddress(SocketAddr),
    /// IANA protocol number, 17 for UDP.
    RequestedTransport(u8),
    Priority(u32),
    UseCandidate,
    Software(String),
    /// `(request attempt, response attempt)`, both 1-based.
    TransactionTransmitCounter { request: u8, response: u8 },
    IceControlling(u64),
    IceControlled(u64),
}

impl StunAttribute {
    pub fn attribute_type(&self) -> StunAttributeType {
        match self {
            StunAttribute::MappedAddress(_) => StunAttributeType::MappedAddress,
            StunAttribute::Username(_) => StunAttributeType::Username,
            StunAttribute::MessageIntegrity(_) => StunAttributeType::MessageIntegrity,
            StunAttribute::ErrorCode { .. } => StunAttributeType::ErrorCode,
            StunAttribute::UnknownAttributes(_) => StunAttributeType::UnknownAttributes,
            StunAttribute::XorMappedAddress(_) => StunAttributeType::XorMappedAddress,
            StunAttribute::ChannelNumber(_) => StunAttributeType::ChannelNumber,
            StunAttribute::Lifetime(_) => StunAttributeType::Lifetime,
            StunAttribute::XorPeerAddress(_) => StunAttributeType::XorPeerAddress,
            StunAttribute::Data(_) => StunAttributeType::Data,
            StunAttribute::XorRelayedAddress(_) => StunAttributeType::XorRelayedAddress,
            StunAttribute::RequestedTransport(_) => StunAttributeType::RequestedTransport,
            StunAttribute::Priority(_) => StunAttributeType::Priority,
            StunAttribute::UseCandidate => StunAttributeType::UseCandidate,
            StunAttribute::Software(_) => StunAttributeType::Software,
            StunAttribute::TransactionTransmitCounter { .. } => {
                StunAttributeType::TransactionTransmitCounter
            }
            StunAttribute::IceControlling(_) => StunAttributeType::IceControlling,
            StunAttribute::IceControlled(_) => StunAttributeType::IceControlled,
        }
    }

    /// Append the attribute value (without type/length header or padding).
    ///
    /// MESSAGE-INTEGRITY depends on the preceding bytes and is written by the message encoder.
    pub(crate) fn encode_value(&self, out: &mut Vec<u8>, transaction_id: &TransactionId) {
        match self {
            StunAttribute::MappedAddress(addr) => encode_address(out, *addr, &[0u8; 16]),
            StunAttribute::XorMappedAddress(addr)
            | StunAttribute::XorPeerAddress(addr)
            | StunAttribute::XorRelayedAddress(addr) => {
                encode_address(out, *addr, &xor_mask(transaction_id))
            }
            StunAttribute::Username(s) | StunAttribute::Software(s) => {
                out.extend_from_slice(s.as_bytes())
            }
            StunAttribute::MessageIntegrity(_) => out.extend_from_slice(&[0u8; 20]),
            StunAttribute::ErrorCode { code, reason } => {
                out.extend_from_slice(&[0, 0, (code / 100) as u8 & 0x07, (code % 100) as u8]);
                out.extend_from_slice(reason.as_bytes());
            }
            StunAttribute::UnknownAttributes(ids) => {
                for id in ids {
                    out.extend_from_slice(&id.to_be_bytes());
                }
            }
            StunAttribute::ChannelNumber(channel) => {
                out.extend_from_slice(&channel.to_be_bytes());
                out.extend_from_slice(&[0, 0]);
            }
            StunAttribute::Lifetime(secs) => out.extend_from_slice(&secs.to_be_bytes()),
            StunAttribute::Data(data) => out.extend_from_slice(data),
            StunAttribute::RequestedTransport(proto) => out.extend_from_slice(&[*proto, 0, 0, 0]),
            StunAttribute::Priority(prio) => out.extend_from_slice(&prio.to_be_bytes()),
            StunAttribute::UseCandidate => {}
            StunAttribute::TransactionTransmitCounter { request, response } => {
                out.extend_from_slice(&[0, 0, *request, *response])
            }
            StunAttribute::IceControlling(tie) | StunAttribute::IceControlled(tie) => {
                out.extend_from_slice(&tie.to_be_bytes())
            }
        }
    }

    /// Decode the value of a known attribute other than MESSAGE-INTEGRITY.
    pub(crate) fn decode_value(
        typ: StunAttributeType,
        value: &[u8],
        transaction_id: &TransactionId,
    ) -> Result<Self, StunError> {
        let attr = match typ {
            StunAttributeType::MappedAddress => {
                StunAttribute::MappedAddress(decode_address(value, &[0u8; 16])?)
            }
            StunAttributeType::XorMappedAddress => {
                StunAttribute::XorMappedAddress(decode_address(value, &xor_mask(transaction_id))?)
            }
            StunAttributeType::XorPeerAddress => {
                StunAttribute::XorPeerAddress(decode_address(value, &xor_mask(transaction_id))?)
            }
            StunAttributeType::XorRelayedAddress => StunAttribute::XorRelayedAddress(
                decode_address(value, &xor_mask(transaction_id))?,
            ),
            StunAttributeType::Username => StunAttribute::Username(
                String::from_utf8(value.to_vec())
                    .map_err(|_| StunError::Malformed("USERNAME is not UTF-8".into()))?,
            ),
            // Informational only, so a sloppy peer string must not fail the whole message.
            StunAttributeType::Software => {
                StunAttribute::Software(String::from_utf8_lossy(value).into_owned())
            }
            StunAttributeType::ErrorCode => {
                if value.len() < 4 {
                    return Err(StunError::Malformed("ERROR-CODE too short".into()));
                }
                let code = (value[2] & 0x07) as u16 * 100 + value[3] as u16;
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                StunAttribute::ErrorCode { code, reason }
            }
            StunAttributeType::UnknownAttributes => {
                if value.len() % 2 != 0 {
                    return Err(StunError::Malformed("UNKNOWN-ATTRIBUTES odd length".into()));
                }
                StunAttribute::UnknownAttributes(
                    value
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            StunAttributeType::ChannelNumber => {
                let v = fixed::<4>(typ, value)?;
                StunAttribute::ChannelNumber(u16::from_be_bytes([v[0], v[1]]))
            }
            StunAttributeType::Lifetime => {
                StunAttribute::Lifetime(u32::from_be_bytes(fixed::<4>(typ, value)?))
            }
            StunAttributeType::Data => StunAttribute::Data(value.to_vec()),
            StunAttributeType::RequestedTransport => {
                StunAttribute::RequestedTransport(fixed::<4>(typ, value)?[0])
            }
            StunAttributeType::Priority => {
                StunAttribute::Priority(u32::from_be_bytes(fixed::<4>(typ, value)?))
            }
            StunAttributeType::UseCandidate => StunAttribute::UseCandidate,
            StunAttributeType::TransactionTransmitCounter => {
                let v = fixed::<4>(typ, value)?;
                StunAttribute::TransactionTransmitCounter {
                    request: v[2],
                    response: v[3],
                }
            }
            StunAttributeType::IceControlling => {
                StunAttribute::IceControlling(u64::from_be_bytes(fixed::<8>(typ, value)?))
            }
            StunAttributeType::IceControlled => {
                StunAttribute::IceControlled(u64::from_be_bytes(fixed::<8>(typ, value)?))
            }
            StunAttributeType::MessageIntegrity => {
                return Err(StunError::Malformed(
                    "MESSAGE-INTEGRITY must be decoded by the message".into(),
                ))
            }
        };
        Ok(attr)
    }
}

fn fixed<const N: usize>(typ: StunAttributeType, value: &[u8]) -> Result<[u8; N], StunError> {
    value
        .try_into()
        .map_err(|_| StunError::Malformed(format!("{:?} must be {} bytes", typ, N)))
}

/// `magic cookie || transaction id`, the obfuscation mask of the XOR address attributes.
fn xor_mask(transaction_id: &TransactionId) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(transaction_id.as_bytes());
    mask
}

fn encode_address(out: &mut Vec<u8>, addr: SocketAddr, mask: &[u8; 16]) {
    let port = addr.port() ^ u16::from_be_bytes([mask[0], mask[1]]);
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.extend_from_slice(&[0, FAMILY_IPV4]);
            out.extend_from_slice(&port.to_be_bytes());
            out.extend(ip.octets().iter().zip(mask).map(|(b, m)| b ^ m));
        }
        IpAddr::V6(ip) => {
            out.extend_from_slice(&[0, FAMILY_IPV6]);
            out.extend_from_slice(&port.to_be_bytes());
            out.extend(ip.octets().iter().zip(mask).map(|(b, m)| b ^ m));
        }
    }
}

fn decode_address(value: &[u8], mask: &[u8; 16]) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::Malformed("address attribute too short".into()));
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ u16::from_be_bytes([mask[0], mask[1]]);
    let ip = match (value[1], value.len()) {
        (FAMILY_IPV4, 8) => {
            let mut octets = [0u8; 4];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = value[4 + i] ^ mask[i];
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (FAMILY_IPV6, 20) => {
            let mut octets = [0u8; 16];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = value[4 + i] ^ mask[i];
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        (family, len) => {
            return Err(StunError::Malformed(format!(
                "address family {} with {} byte value",
                family, len
            )))
        }
    };
    Ok(SocketAddr::new(ip, port))
}
