//! Fixed-header binary wire format for overlay packets.
//!
//! Frame format (network byte order):
//!
//! ```text
//! [version u16][type u16][length u32][ip: 4 x u16, one octet per word][port u32][body]
//! ```
//!
//! Decoding only fails when the header itself cannot be represented (short
//! frame, unknown type, port beyond u16). A body whose size disagrees with
//! the length field still decodes; the dispatcher rejects it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::address::{Address, AddressError};
use crate::constants::protocol::{HEADER_LEN, MAX_REUNION_ENTRIES};
use crate::network::message::{Packet, PacketType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {0} bytes, header needs {len}", len = HEADER_LEN)]
    Truncated(usize),

    #[error("unknown packet type {0}")]
    UnknownPacketType(u16),

    #[error("source port {0} does not fit in 16 bits")]
    InvalidSourcePort(u32),

    #[error("unrecognised body tag {0:?}")]
    UnknownTag(String),

    #[error("malformed {packet_type:?} body: {reason}")]
    MalformedBody {
        packet_type: PacketType,
        reason: String,
    },

    #[error("invalid address entry: {0}")]
    InvalidEntry(AddressError),

    #[error("body is not valid UTF-8")]
    InvalidUtf8,

    #[error("reunion path has {0} entries, at most {max} fit", max = MAX_REUNION_ENTRIES)]
    TooManyEntries(usize),

    #[error("reunion path is empty")]
    EmptyPath,
}

/// Serialize a packet into one frame. Header fields are written as stored,
/// so `decode(encode(p)) == p` for every packet.
pub fn encode(packet: &Packet) -> Bytes {
    let body = packet.raw_body();
    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());

    frame.put_u16(packet.version());
    frame.put_u16(packet.packet_type().as_u16());
    frame.put_u32(packet.length());
    for octet in packet.source().ip() {
        frame.put_u16(octet as u16);
    }
    frame.put_u32(packet.source().port() as u32);
    frame.extend_from_slice(body);

    frame.freeze()
}

/// Parse one frame back into a packet.
pub fn decode(frame: &[u8]) -> Result<Packet, WireError> {
    if frame.len() < HEADER_LEN {
        return Err(WireError::Truncated(frame.len()));
    }

    let mut header = &frame[..HEADER_LEN];
    let version = header.get_u16();
    let packet_type = PacketType::try_from(header.get_u16())?;
    let length = header.get_u32();

    // Octet lives in the low byte of each 16-bit word
    let mut ip = [0u8; 4];
    for octet in ip.iter_mut() {
        *octet = (header.get_u16() & 0x00ff) as u8;
    }

    let port = header.get_u32();
    let port = u16::try_from(port).map_err(|_| WireError::InvalidSourcePort(port))?;

    Ok(Packet::from_raw(
        version,
        packet_type,
        length,
        Address::new(ip, port),
        Bytes::copy_from_slice(&frame[HEADER_LEN..]),
    ))
}
