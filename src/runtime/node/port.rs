//! Deterministic room-name-to-port mapping.

use md5::{Digest, Md5};

/// First port of the room range.
pub const PORT_RANGE_BASE: u16 = 12000;

/// Number of ports the room range spans.
const PORT_RANGE_SPAN: u16 = 1000;

/// Map a canonical room name onto its base UDP port.
///
/// The first 16 bits of the MD5 digest of the name, read big-endian and
/// reduced mod 1000, pick a port in `12000..=12999`. Every node computes the
/// same port for the same room, which is what lets broadcast discovery work
/// without any rendezvous. The digest only spreads rooms across the port
/// range; it carries no security weight.
pub fn room_port(room: &str) -> u16 {
    let digest = Md5::digest(room.as_bytes());
    let prefix = u16::from_be_bytes([digest[0], digest[1]]);
    PORT_RANGE_BASE + prefix % PORT_RANGE_SPAN
}
