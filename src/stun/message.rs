//! STUN message header, MESSAGE-INTEGRITY and the full message codec (RFC 8489 §5, §14.5).

use std::fmt;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::attribute::{StunAttribute, StunAttributeType};
use crate::error::StunError;

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie (RFC 8489).
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN header size (type + length + magic + transaction ID).
pub const HEADER_LEN: usize = 20;

/// HMAC-SHA1 output length.
const INTEGRITY_LEN: usize = 20;

/// Injected as the first attribute of every message we encode. The ICE layer inspects
/// the peer's value to detect implementations needing compatibility behaviour.
pub const SOFTWARE: &str = concat!("essential.gg v", env!("CARGO_PKG_VERSION"));

/// STUN/TURN methods supported by this codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunType {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
}

impl StunType {
    const fn method(self) -> u16 {
        match self {
            StunType::Binding => 0x001,
            StunType::Allocate => 0x003,
            StunType::Refresh => 0x004,
            StunType::Send => 0x006,
            StunType::Data => 0x007,
            StunType::CreatePermission => 0x008,
            StunType::ChannelBind => 0x009,
        }
    }

    fn from_method(method: u16) -> Option<Self> {
        let typ = match method {
            0x001 => StunType::Binding,
            0x003 => StunType::Allocate,
            0x004 => StunType::Refresh,
            0x006 => StunType::Send,
            0x007 => StunType::Data,
            0x008 => StunType::CreatePermission,
            0x009 => StunType::ChannelBind,
            _ => return None,
        };
        Some(typ)
    }

    /// Whether `class` is legal for this method.
    pub fn allows(self, class: StunClass) -> bool {
        match self {
            StunType::Binding => true,
            StunType::Send | StunType::Data => class == StunClass::Indication,
            StunType::Allocate
            | StunType::Refresh
            | StunType::CreatePermission
            | StunType::ChannelBind => class != StunClass::Indication,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunClass {
    Request,
    Indication,
    ResponseSuccess,
    ResponseError,
}

impl StunClass {
    const fn bits(self) -> u16 {
        match self {
            StunClass::Request => 0b00,
            StunClass::Indication => 0b01,
            StunClass::ResponseSuccess => 0b10,
            StunClass::ResponseError => 0b11,
        }
    }

    const fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => StunClass::Request,
            0b01 => StunClass::Indication,
            0b10 => StunClass::ResponseSuccess,
            _ => StunClass::ResponseError,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, StunClass::ResponseSuccess | StunClass::ResponseError)
    }
}

// |M11|M10|M9|M8|M7|C1|M6|M5|M4|C0|M3|M2|M1|M0|
fn encode_message_type(typ: StunType, class: StunClass) -> u16 {
    let m = typ.method();
    let c = class.bits();
    (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | ((c & 0b01) << 4) | ((c & 0b10) << 7)
}

fn decode_message_type(raw: u16) -> (u16, StunClass) {
    let method = (raw & 0x000F) | ((raw >> 1) & 0x0070) | ((raw >> 2) & 0x0F80);
    let class = ((raw >> 4) & 0b01) | ((raw >> 7) & 0b10);
    (method, StunClass::from_bits(class))
}

/// 96-bit STUN transaction id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn random() -> Self {
        TransactionId(crate::random_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        TransactionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Key material for MESSAGE-INTEGRITY. Cheap to clone, compared by content.
#[derive(Clone, PartialEq, Eq)]
pub struct IntegrityKey(Arc<[u8]>);

impl IntegrityKey {
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        IntegrityKey(Arc::from(bytes.as_ref()))
    }

    /// Short-term credential key: the password itself (RFC 8489 §9.1.1).
    pub fn short_term(password: &str) -> Self {
        Self::new(password.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntegrityKey({} bytes)", self.0.len())
    }
}

/// Resolves the key a received MESSAGE-INTEGRITY should be verified with.
///
/// Requests are looked up by the local part of USERNAME, responses by transaction id.
pub trait KeyLookup {
    fn lookup(
        &self,
        class: StunClass,
        transaction_id: &TransactionId,
        username: Option<&str>,
    ) -> Option<IntegrityKey>;
}

/// Decode without any credentials; integrity attributes decode with a `None` key.
pub struct NoKeys;

impl KeyLookup for NoKeys {
    fn lookup(&self, _: StunClass, _: &TransactionId, _: Option<&str>) -> Option<IntegrityKey> {
        None
    }
}

impl KeyLookup for IntegrityKey {
    fn lookup(&self, _: StunClass, _: &TransactionId, _: Option<&str>) -> Option<IntegrityKey> {
        Some(self.clone())
    }
}

/// Cheap header check to tell STUN apart from other datagrams sharing the socket.
pub fn looks_like_stun(data: &[u8]) -> bool {
    if data.len() < HEADER_LEN {
        return false;
    }
    // First two bits must be 0, magic cookie must match.
    if data[0] & 0xC0 != 0 {
        return false;
    }
    let len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    magic == MAGIC_COOKIE && len % 4 == 0 && HEADER_LEN + len <= data.len()
}

/// An immutable STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    typ: StunType,
    class: StunClass,
    transaction_id: TransactionId,
    attributes: Vec<StunAttribute>,
}

impl StunMessage {
    pub fn new(
        typ: StunType,
        class: StunClass,
        transaction_id: TransactionId,
        attributes: Vec<StunAttribute>,
    ) -> Result<Self, StunError> {
        if !typ.allows(class) {
            return Err(StunError::IncompatibleClass { typ, class });
        }
        Ok(StunMessage {
            typ,
            class,
            transaction_id,
            attributes,
        })
    }

    /// A request with a fresh random transaction id.
    pub fn request(typ: StunType, attributes: Vec<StunAttribute>) -> Result<Self, StunError> {
        Self::new(typ, StunClass::Request, TransactionId::random(), attributes)
    }

    pub fn typ(&self) -> StunType {
        self.typ
    }

    pub fn class(&self) -> StunClass {
        self.class
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn attributes(&self) -> &[StunAttribute] {
        &self.attributes
    }

    pub fn attribute(&self, typ: StunAttributeType) -> Option<&StunAttribute> {
        self.attributes.iter().find(|a| a.attribute_type() == typ)
    }

    pub fn has(&self, typ: StunAttributeType) -> bool {
        self.attribute(typ).is_some()
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Username(u) => Some(u.as_str()),
            _ => None,
        })
    }

    pub fn software(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Software(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// XOR-MAPPED-ADDRESS, falling back to the plain MAPPED-ADDRESS of RFC 3489 servers.
    pub fn mapped_address(&self) -> Option<std::net::SocketAddr> {
        self.xor_mapped_address().or_else(|| {
            self.attributes.iter().find_map(|a| match a {
                StunAttribute::MappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    pub fn xor_mapped_address(&self) -> Option<std::net::SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn xor_relayed_address(&self) -> Option<std::net::SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// First XOR-PEER-ADDRESS; CreatePermission may carry several.
    pub fn xor_peer_address(&self) -> Option<std::net::SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Data(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn priority(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Priority(p) => Some(*p),
            _ => None,
        })
    }

    pub fn error_code(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::ErrorCode { code, .. } => Some(*code),
            _ => None,
        })
    }

    pub fn transmit_counter(&self) -> Option<(u8, u8)> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::TransactionTransmitCounter { request, response } => {
                Some((*request, *response))
            }
            _ => None,
        })
    }

    /// `None` if the message carries no MESSAGE-INTEGRITY, `Some(None)` if it does but
    /// could not be verified for lack of a key.
    pub fn integrity(&self) -> Option<Option<&IntegrityKey>> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::MessageIntegrity(key) => Some(key.as_ref()),
            _ => None,
        })
    }

    /// True when MESSAGE-INTEGRITY is present and was verified against a known key.
    pub fn is_authenticated(&self) -> bool {
        matches!(self.integrity(), Some(Some(_)))
    }

    /// Copy of this message with TRANSACTION-TRANSMIT-COUNTER set, placed ahead of
    /// MESSAGE-INTEGRITY so it is covered by the HMAC.
    pub fn with_transmit_counter(&self, request: u8, response: u8) -> StunMessage {
        let mut attributes: Vec<StunAttribute> = self
            .attributes
            .iter()
            .filter(|a| a.attribute_type() != StunAttributeType::TransactionTransmitCounter)
            .cloned()
            .collect();
        let at = attributes
            .iter()
            .position(|a| a.attribute_type() == StunAttributeType::MessageIntegrity)
            .unwrap_or(attributes.len());
        attributes.insert(
            at,
            StunAttribute::TransactionTransmitCounter { request, response },
        );
        StunMessage {
            attributes,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StunError> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&encode_message_type(self.typ, self.class).to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes()); // length placeholder
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(self.transaction_id.as_bytes());

        if self.typ != StunType::Send && !self.has(StunAttributeType::Software) {
            append_attribute(
                &mut buf,
                &StunAttribute::Software(SOFTWARE.to_string()),
                &self.transaction_id,
            );
        }

        for attr in &self.attributes {
            match attr {
                StunAttribute::MessageIntegrity(key) => {
                    let key = key.as_ref().ok_or(StunError::MissingIntegrityKey)?;
                    let start = buf.len();
                    append_attribute(&mut buf, attr, &self.transaction_id);
                    // Length as if MESSAGE-INTEGRITY were the last attribute.
                    let len = buf.len() - HEADER_LEN;
                    set_length(&mut buf, len);
                    let mac = hmac_sha1(key.as_bytes(), &buf[..start]);
                    buf[start + 4..start + 4 + INTEGRITY_LEN].copy_from_slice(&mac);
                }
                _ => append_attribute(&mut buf, attr, &self.transaction_id),
            }
        }

        let len = buf.len() - HEADER_LEN;
        set_length(&mut buf, len);
        Ok(buf)
    }

    pub fn decode(data: &[u8], keys: &dyn KeyLookup) -> Result<Self, StunError> {
        if data.len() < HEADER_LEN {
            return Err(StunError::Malformed("shorter than STUN header".into()));
        }
        if data[0] & 0xC0 != 0 {
            return Err(StunError::Malformed("top two bits not zero".into()));
        }
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if len % 4 != 0 {
            return Err(StunError::Malformed("length is not a multiple of 4".into()));
        }
        if HEADER_LEN + len > data.len() {
            return Err(StunError::Malformed("length exceeds datagram".into()));
        }
        if u32::from_be_bytes([data[4], data[5], data[6], data[7]]) != MAGIC_COOKIE {
            return Err(StunError::BadMagicCookie);
        }

        let (method, class) = decode_message_type(u16::from_be_bytes([data[0], data[1]]));
        let typ = StunType::from_method(method)
            .ok_or_else(|| StunError::Malformed(format!("unknown method 0x{:03x}", method)))?;
        if !typ.allows(class) {
            return Err(StunError::IncompatibleClass { typ, class });
        }
        let mut tid = [0u8; 12];
        tid.copy_from_slice(&data[8..20]);
        let transaction_id = TransactionId(tid);

        let end = HEADER_LEN + len;
        let mut pos = HEADER_LEN;
        let mut attributes = Vec::new();
        while pos + 4 <= end {
            let id = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            let value_start = pos + 4;
            let value_end = value_start + attr_len;
            if value_end > end {
                return Err(StunError::Malformed(format!(
                    "attribute 0x{:04x} overruns message",
                    id
                )));
            }
            let value = &data[value_start..value_end];

            match StunAttributeType::from_id(id) {
                Some(StunAttributeType::MessageIntegrity) => {
                    if attr_len != INTEGRITY_LEN {
                        return Err(StunError::Malformed("MESSAGE-INTEGRITY length".into()));
                    }
                    let username = attributes.iter().find_map(|a| match a {
                        StunAttribute::Username(u) => Some(u.as_str()),
                        _ => None,
                    });
                    let key = keys.lookup(class, &transaction_id, username);
                    if let Some(key) = &key {
                        let mut signed = data[..pos].to_vec();
                        set_length(&mut signed, pos - HEADER_LEN + 4 + INTEGRITY_LEN);
                        if !hmac_verify(key.as_bytes(), &signed, value) {
                            return Err(StunError::IntegrityMismatch);
                        }
                    }
                    attributes.push(StunAttribute::MessageIntegrity(key));
                    // Anything after MESSAGE-INTEGRITY (FINGERPRINT) is ignored.
                    break;
                }
                Some(typ) => {
                    attributes.push(StunAttribute::decode_value(typ, value, &transaction_id)?)
                }
                None if StunAttributeType::is_comprehension_required(id) => {
                    return Err(StunError::UnknownRequiredAttribute(id));
                }
                None => {}
            }

            pos = value_start + padded(attr_len);
        }

        Ok(StunMessage {
            typ,
            class,
            transaction_id,
            attributes,
        })
    }
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

fn set_length(buf: &mut [u8], len: usize) {
    buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
}

/// Append a STUN attribute (handles 4-byte padding).
fn append_attribute(buf: &mut Vec<u8>, attr: &StunAttribute, transaction_id: &TransactionId) {
    buf.extend_from_slice(&attr.attribute_type().id().to_be_bytes());
    let len_at = buf.len();
    buf.extend_from_slice(&0u16.to_be_bytes());
    attr.encode_value(buf, transaction_id);
    let value_len = buf.len() - len_at - 2;
    buf[len_at..len_at + 2].copy_from_slice(&(value_len as u16).to_be_bytes());
    buf.resize(len_at + 2 + padded(value_len), 0);
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; INTEGRITY_LEN] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC key length is valid");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn hmac_verify(key: &[u8], data: &[u8], expected: &[u8]) -> bool {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC key length is valid");
    mac.update(data);
    mac.verify_slice(expected).is_ok()
}
