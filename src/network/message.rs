//! Overlay packets and their type-specific bodies.
//!
//! A [`Packet`] is the decoded form of one frame: header fields plus the raw
//! body bytes. The body grammars are character counted text:
//!
//! ```text
//! Register  REQ + ip(15) + port(5)     | RES + ACK
//! Advertise REQ                        | RES + ip(15) + port(5)
//! Join      JOIN
//! Message   <utf-8 text>
//! Reunion   REQ|RES + count(2) + count * (ip(15) + port(5))
//! ```
//!
//! [`Packet::body`] parses the raw bytes into a closed [`PacketBody`]; a body
//! that does not match its grammar is a [`WireError`], never a panic.

use bytes::Bytes;

use crate::address::{Address, CANONICAL_IP_LEN, CANONICAL_PORT_LEN};
use crate::constants::protocol::{MAX_REUNION_ENTRIES, VERSION};
use crate::network::wire::WireError;

const TAG_LEN: usize = 3;
const ENTRY_LEN: usize = CANONICAL_IP_LEN + CANONICAL_PORT_LEN;
const COUNT_LEN: usize = 2;

const TAG_REQ: &str = "REQ";
const TAG_RES: &str = "RES";
const ACK: &str = "ACK";
const JOIN: &str = "JOIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    Register = 1,
    Advertise = 2,
    Join = 3,
    Message = 4,
    Reunion = 5,
}

impl PacketType {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for PacketType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Register),
            2 => Ok(PacketType::Advertise),
            3 => Ok(PacketType::Join),
            4 => Ok(PacketType::Message),
            5 => Ok(PacketType::Reunion),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Direction of a Reunion packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReunionKind {
    /// Leaf to root, path grows one hop per level
    Hello,
    /// Root to leaf, path shrinks one hop per level
    HelloBack,
}

impl ReunionKind {
    fn tag(self) -> &'static str {
        match self {
            ReunionKind::Hello => TAG_REQ,
            ReunionKind::HelloBack => TAG_RES,
        }
    }
}

/// Parsed body of a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    RegisterRequest { requester: Address },
    RegisterResponse,
    AdvertiseRequest,
    AdvertiseResponse { neighbor: Address },
    Join,
    Message(String),
    Reunion { kind: ReunionKind, path: Vec<Address> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    version: u16,
    packet_type: PacketType,
    length: u32,
    source: Address,
    body: Bytes,
}

impl Packet {
    /// Build a packet whose length field matches its body.
    pub fn new(packet_type: PacketType, source: Address, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            version: VERSION,
            packet_type,
            length: body.len() as u32,
            source,
            body,
        }
    }

    /// Rebuild a packet exactly as it was read off the wire, without validation.
    pub fn from_raw(
        version: u16,
        packet_type: PacketType,
        length: u32,
        source: Address,
        body: Bytes,
    ) -> Self {
        Self {
            version,
            packet_type,
            length,
            source,
            body,
        }
    }

    pub fn register_request(source: Address, requester: Address) -> Self {
        let body = format!(
            "{}{}{}",
            TAG_REQ,
            requester.canonical_ip(),
            requester.canonical_port()
        );
        Self::new(PacketType::Register, source, body)
    }

    pub fn register_response(source: Address) -> Self {
        Self::new(PacketType::Register, source, format!("{}{}", TAG_RES, ACK))
    }

    pub fn advertise_request(source: Address) -> Self {
        Self::new(PacketType::Advertise, source, TAG_REQ)
    }

    pub fn advertise_response(source: Address, neighbor: Address) -> Self {
        let body = format!(
            "{}{}{}",
            TAG_RES,
            neighbor.canonical_ip(),
            neighbor.canonical_port()
        );
        Self::new(PacketType::Advertise, source, body)
    }

    pub fn join(source: Address) -> Self {
        Self::new(PacketType::Join, source, JOIN)
    }

    pub fn message(source: Address, text: &str) -> Self {
        Self::new(PacketType::Message, source, text.to_string())
    }

    pub fn reunion(kind: ReunionKind, source: Address, path: &[Address]) -> Result<Self, WireError> {
        if path.is_empty() {
            return Err(WireError::EmptyPath);
        }
        if path.len() > MAX_REUNION_ENTRIES {
            return Err(WireError::TooManyEntries(path.len()));
        }

        let mut body = String::with_capacity(TAG_LEN + COUNT_LEN + path.len() * ENTRY_LEN);
        body.push_str(kind.tag());
        body.push_str(&format!("{:02}", path.len()));
        for hop in path {
            body.push_str(&hop.canonical_ip());
            body.push_str(&hop.canonical_port());
        }
        Ok(Self::new(PacketType::Reunion, source, body))
    }

    pub fn reunion_hello(source: Address, path: &[Address]) -> Result<Self, WireError> {
        Self::reunion(ReunionKind::Hello, source, path)
    }

    pub fn reunion_hello_back(source: Address, path: &[Address]) -> Result<Self, WireError> {
        Self::reunion(ReunionKind::HelloBack, source, path)
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn source(&self) -> Address {
        self.source
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.body
    }

    /// `length == len(body)`
    pub fn has_valid_length(&self) -> bool {
        self.length as usize == self.body.len()
    }

    /// Packets failing this are dropped by the dispatcher, never repaired.
    pub fn is_well_formed(&self) -> bool {
        self.version == VERSION && self.has_valid_length()
    }

    /// Parse the body according to the packet type.
    pub fn body(&self) -> Result<PacketBody, WireError> {
        let text = std::str::from_utf8(&self.body).map_err(|_| WireError::InvalidUtf8)?;

        match self.packet_type {
            PacketType::Register => match split_tag(text)? {
                (TAG_REQ, rest) => Ok(PacketBody::RegisterRequest {
                    requester: parse_single_entry(self.packet_type, rest)?,
                }),
                (TAG_RES, ACK) => Ok(PacketBody::RegisterResponse),
                (TAG_RES, other) => Err(malformed(
                    self.packet_type,
                    format!("expected ACK, got {:?}", other),
                )),
                (tag, _) => Err(WireError::UnknownTag(tag.to_string())),
            },
            PacketType::Advertise => match split_tag(text)? {
                (TAG_REQ, "") => Ok(PacketBody::AdvertiseRequest),
                (TAG_REQ, rest) => Err(malformed(
                    self.packet_type,
                    format!("unexpected trailing data {:?}", rest),
                )),
                (TAG_RES, rest) => Ok(PacketBody::AdvertiseResponse {
                    neighbor: parse_single_entry(self.packet_type, rest)?,
                }),
                (tag, _) => Err(WireError::UnknownTag(tag.to_string())),
            },
            PacketType::Join => {
                if text == JOIN {
                    Ok(PacketBody::Join)
                } else {
                    Err(malformed(self.packet_type, format!("expected JOIN, got {:?}", text)))
                }
            }
            PacketType::Message => Ok(PacketBody::Message(text.to_string())),
            PacketType::Reunion => {
                let kind = match split_tag(text)? {
                    (TAG_REQ, _) => ReunionKind::Hello,
                    (TAG_RES, _) => ReunionKind::HelloBack,
                    (tag, _) => return Err(WireError::UnknownTag(tag.to_string())),
                };
                let path = parse_path(&text[TAG_LEN..])?;
                Ok(PacketBody::Reunion { kind, path })
            }
        }
    }
}

fn malformed(packet_type: PacketType, reason: String) -> WireError {
    WireError::MalformedBody {
        packet_type,
        reason,
    }
}

fn split_tag(text: &str) -> Result<(&str, &str), WireError> {
    if text.len() < TAG_LEN || !text.is_char_boundary(TAG_LEN) {
        return Err(WireError::UnknownTag(text.to_string()));
    }
    Ok(text.split_at(TAG_LEN))
}

fn parse_entry(packet_type: PacketType, entry: &str) -> Result<Address, WireError> {
    if entry.len() != ENTRY_LEN || !entry.is_ascii() {
        return Err(malformed(packet_type, format!("bad address entry {:?}", entry)));
    }
    let (ip, port) = entry.split_at(CANONICAL_IP_LEN);
    Address::from_parts(ip, port).map_err(WireError::InvalidEntry)
}

fn parse_single_entry(packet_type: PacketType, rest: &str) -> Result<Address, WireError> {
    if rest.len() != ENTRY_LEN {
        return Err(malformed(
            packet_type,
            format!("address entry must be {} chars, got {}", ENTRY_LEN, rest.len()),
        ));
    }
    parse_entry(packet_type, rest)
}

fn parse_path(rest: &str) -> Result<Vec<Address>, WireError> {
    if rest.len() < COUNT_LEN || !rest.is_char_boundary(COUNT_LEN) {
        return Err(malformed(PacketType::Reunion, "missing entry count".to_string()));
    }
    let (count, entries) = rest.split_at(COUNT_LEN);
    if !count.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(
            PacketType::Reunion,
            format!("entry count {:?} is not two digits", count),
        ));
    }
    let count: usize = count
        .parse()
        .map_err(|_| malformed(PacketType::Reunion, format!("bad entry count {:?}", count)))?;
    if count == 0 {
        return Err(WireError::EmptyPath);
    }
    if entries.len() != count * ENTRY_LEN {
        return Err(malformed(
            PacketType::Reunion,
            format!(
                "{} entries need {} chars, got {}",
                count,
                count * ENTRY_LEN,
                entries.len()
            ),
        ));
    }

    let mut path = Vec::with_capacity(count);
    for i in 0..count {
        let start = i * ENTRY_LEN;
        let entry = entries
            .get(start..start + ENTRY_LEN)
            .ok_or_else(|| malformed(PacketType::Reunion, "entry is not ASCII".to_string()))?;
        path.push(parse_entry(PacketType::Reunion, entry)?);
    }
    Ok(path)
}
