//! miio packet layout.
//!
//! Wire format (all multi-byte integers big-endian):
//! ```text
//! [magic:2][length:2][unknown:4][serial:4][stamp:4][checksum:16][body:N]
//! ```
//! The header is always 32 bytes.  Probes, keepalives and hello replies have
//! no body (`length == 32`); requests and replies carry an AES-128-CBC
//! ciphertext whose length is a multiple of 16.

use crate::crypto::cipher::md5_concat;
use crate::crypto::keys::Token;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Magic value at the start of every packet.
pub const MAGIC: u16 = 0x2131;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Default UDP port miio devices listen on.
pub const DEFAULT_DEVICE_PORT: u16 = 54321;

/// The discovery / keepalive probe: magic, `length = 0x0020`, everything else `0xFF`.
pub const PROBE: [u8; HEADER_SIZE] = [
    0x21, 0x31, 0x00, 0x20, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF,
];

/// Returns the 32-byte probe datagram used for both discovery and keepalive.
pub fn build_probe() -> [u8; HEADER_SIZE] {
    PROBE
}

// ── Header types ──────────────────────────────────────────────────────────────

/// The per-packet header fields a sender chooses: everything except magic,
/// length and checksum, which the codec computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFields {
    /// Reserved field; echoed from the device, `0xFFFFFFFF` before first contact.
    pub unknown: u32,
    /// Device identifier learned from the hello reply.
    pub serial: u32,
    /// Device-relative timestamp in seconds.
    pub stamp: u32,
}

/// A decoded 32-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u16,
    /// Total packet length including the header.
    pub length: u16,
    pub unknown: u32,
    pub serial: u32,
    pub stamp: u32,
    pub checksum: [u8; 16],
}

impl PacketHeader {
    /// Builds a header from sender-chosen fields, a total length and a checksum.
    pub fn new(fields: HeaderFields, length: u16, checksum: [u8; 16]) -> Self {
        Self {
            magic: MAGIC,
            length,
            unknown: fields.unknown,
            serial: fields.serial,
            stamp: fields.stamp,
            checksum,
        }
    }

    /// The sender-chosen fields of this header.
    pub fn fields(&self) -> HeaderFields {
        HeaderFields {
            unknown: self.unknown,
            serial: self.serial,
            stamp: self.stamp,
        }
    }

    /// Serializes the header into its 32-byte wire form.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.magic.to_be_bytes());
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.unknown.to_be_bytes());
        buf[8..12].copy_from_slice(&self.serial.to_be_bytes());
        buf[12..16].copy_from_slice(&self.stamp.to_be_bytes());
        buf[16..32].copy_from_slice(&self.checksum);
        buf
    }

    /// Splits the fixed fields out of the first 32 bytes of `bytes`.
    ///
    /// The caller guarantees `bytes.len() >= HEADER_SIZE`.
    pub(crate) fn from_prefix(bytes: &[u8]) -> Self {
        let be16 = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);
        let be32 = |at: usize| {
            u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&bytes[16..32]);

        Self {
            magic: be16(0),
            length: be16(2),
            unknown: be32(4),
            serial: be32(8),
            stamp: be32(12),
            checksum,
        }
    }
}

/// A decoded packet: header plus the still-encrypted body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    /// AES-128-CBC ciphertext; empty for probes and hello replies.
    pub body: Vec<u8>,
}

impl Packet {
    /// `true` for bodiless packets (probe, keepalive, hello reply).
    pub fn is_hello(&self) -> bool {
        self.body.is_empty()
    }

    /// Checks the header checksum against `token`.
    ///
    /// The checksum is `MD5(header[0..16] ‖ token ‖ body)`, i.e. MD5 over the
    /// packet with the token written into the checksum field.
    pub fn verify_checksum(&self, token: &Token) -> bool {
        checksum(&self.header.to_bytes(), token, &self.body) == self.header.checksum
    }
}

/// Computes the packet checksum over the first 16 header bytes, the token
/// standing in for the checksum field, and the body.
pub(crate) fn checksum(header: &[u8; HEADER_SIZE], token: &Token, body: &[u8]) -> [u8; 16] {
    md5_concat(&[&header[..16], token.as_bytes(), body])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_matches_documented_bytes() {
        // Arrange
        let expected = hex_literal("21310020ffffffffffffffffffffffffffffffffffffffffffffffffffffffff");

        // Act
        let probe = build_probe();

        // Assert
        assert_eq!(probe.to_vec(), expected);
    }

    #[test]
    fn test_header_to_bytes_places_fields_big_endian() {
        // Arrange
        let header = PacketHeader::new(
            HeaderFields {
                unknown: 0x0000_0000,
                serial: 0x0123_ABCD,
                stamp: 0x5F00_0000,
            },
            0x0050,
            [0xEE; 16],
        );

        // Act
        let bytes = header.to_bytes();

        // Assert
        assert_eq!(&bytes[0..2], &[0x21, 0x31]);
        assert_eq!(&bytes[2..4], &[0x00, 0x50]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[0x01, 0x23, 0xAB, 0xCD]);
        assert_eq!(&bytes[12..16], &[0x5F, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[16..32], &[0xEE; 16]);
    }

    #[test]
    fn test_from_prefix_inverts_to_bytes() {
        // Arrange
        let header = PacketHeader::new(
            HeaderFields {
                unknown: 7,
                serial: 0xDEAD_BEEF,
                stamp: 42,
            },
            32,
            [0x01; 16],
        );

        // Act
        let parsed = PacketHeader::from_prefix(&header.to_bytes());

        // Assert
        assert_eq!(parsed, header);
        assert_eq!(parsed.fields(), header.fields());
    }

    #[test]
    fn test_probe_parses_as_all_ones_fields() {
        let header = PacketHeader::from_prefix(&PROBE);
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.length, 32);
        assert_eq!(header.unknown, u32::MAX);
        assert_eq!(header.serial, u32::MAX);
        assert_eq!(header.stamp, u32::MAX);
    }

    fn hex_literal(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }
}
