//! Encoding and decoding of miio packets.
//!
//! Outgoing:
//! ```text
//! Request ──to_json──▶ UTF-8 JSON ──AES-128-CBC──▶ body
//! header(magic, len, unknown, serial, stamp, token) ‖ body ──MD5──▶ checksum
//! ```
//! Incoming:
//! ```text
//! bytes ──decode──▶ Packet ──verify_checksum──▶ ──decrypt_body──▶ JSON text
//! ```
//!
//! Decoding and decryption are separate steps: hello replies have no body
//! and are never decrypted.

use serde_json::Value;
use thiserror::Error;

use crate::crypto::cipher::{cbc_decrypt, cbc_encrypt, CipherError, BLOCK_SIZE};
use crate::crypto::keys::DerivedKeys;
use crate::protocol::packet::{checksum, HeaderFields, Packet, PacketHeader, HEADER_SIZE, MAGIC};
use crate::protocol::request::{PayloadCompat, Request};

/// Errors that can occur while encoding or decoding packets.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    /// The datagram is shorter than a packet header.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The datagram does not start with the miio magic.
    #[error("bad magic: 0x{0:04X}")]
    BadMagic(u16),

    /// The header length field disagrees with the datagram size.
    #[error("length mismatch: header says {declared}, datagram is {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    /// The body is not a whole number of cipher blocks.
    #[error("body length {0} is not a multiple of the cipher block size")]
    UnalignedBody(usize),

    /// The encrypted body does not fit the 16-bit length field.
    #[error("encoded packet of {0} bytes exceeds the 65535-byte length field")]
    PacketTooLarge(usize),

    /// The checksum field does not match the packet contents.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The body could not be decrypted.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// The payload is not the expected UTF-8 JSON.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encrypts `plaintext` and frames it with a checksummed header.
///
/// # Errors
///
/// Returns [`ProtocolError::PacketTooLarge`] if the packet would not fit the
/// length field.
pub fn encode_packet(
    plaintext: &[u8],
    keys: &DerivedKeys,
    fields: HeaderFields,
) -> Result<Vec<u8>, ProtocolError> {
    let body = cbc_encrypt(keys.key(), keys.iv(), plaintext);
    let total = body.len() + HEADER_SIZE;
    let length = u16::try_from(total).map_err(|_| ProtocolError::PacketTooLarge(total))?;

    let mut header = PacketHeader::new(fields, length, *keys.token().as_bytes());
    header.checksum = checksum(&header.to_bytes(), keys.token(), &body);

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Serializes `request` and encodes it as an encrypted packet.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the request cannot be serialized or the
/// packet is too large.
///
/// # Examples
///
/// ```rust
/// use miio_core::{decode, decrypt_body, encode_request, HeaderFields, PayloadCompat, Request, Token};
/// use serde_json::json;
///
/// let keys = Token::from_hex("000102030405060708090a0b0c0d0e0f").unwrap().derive_keys();
/// let fields = HeaderFields { unknown: 0, serial: 0x0123_ABCD, stamp: 1_600_000_000 };
/// let req = Request::new(1, "get_prop", json!(["power"]));
///
/// let bytes = encode_request(&req, &keys, fields, PayloadCompat::default()).unwrap();
/// let packet = decode(&bytes).unwrap();
/// assert_eq!(
///     decrypt_body(&packet, &keys).unwrap(),
///     r#"{"id":1,"method":"get_prop","params":["power"]}"#
/// );
/// ```
pub fn encode_request(
    request: &Request,
    keys: &DerivedKeys,
    fields: HeaderFields,
    compat: PayloadCompat,
) -> Result<Vec<u8>, ProtocolError> {
    let json = request.to_json(compat)?;
    encode_packet(json.as_bytes(), keys, fields)
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Splits a datagram into header fields and the encrypted body.
///
/// Does not decrypt and does not verify the checksum.
///
/// # Errors
///
/// Returns [`ProtocolError`] for undersized datagrams, a wrong magic, a
/// length field that disagrees with the datagram, or a partial cipher block.
pub fn decode(raw: &[u8]) -> Result<Packet, ProtocolError> {
    if raw.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: raw.len(),
        });
    }

    let header = PacketHeader::from_prefix(raw);
    if header.magic != MAGIC {
        return Err(ProtocolError::BadMagic(header.magic));
    }
    if header.length as usize != raw.len() {
        return Err(ProtocolError::LengthMismatch {
            declared: header.length as usize,
            actual: raw.len(),
        });
    }

    let body = raw[HEADER_SIZE..].to_vec();
    if body.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::UnalignedBody(body.len()));
    }

    Ok(Packet { header, body })
}

/// Decrypts the body of `packet` into text.
///
/// Block padding is removed, then any trailing NUL terminator bytes the
/// device appends after the JSON are stripped.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] for bodiless packets or
/// non-UTF-8 text, and [`ProtocolError::Cipher`] if decryption fails.
pub fn decrypt_body(packet: &Packet, keys: &DerivedKeys) -> Result<String, ProtocolError> {
    if packet.body.is_empty() {
        return Err(ProtocolError::MalformedPayload("packet has no body".into()));
    }

    let mut plain = cbc_decrypt(keys.key(), keys.iv(), &packet.body)?;
    while plain.last() == Some(&0) {
        plain.pop();
    }

    String::from_utf8(plain).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

/// Decodes, optionally checksum-verifies, decrypts and parses a reply datagram.
///
/// # Errors
///
/// Any [`ProtocolError`] from the individual steps, plus
/// [`ProtocolError::ChecksumMismatch`] when `verify_checksum` is set and the
/// checksum does not match.
pub fn open_reply(
    raw: &[u8],
    keys: &DerivedKeys,
    verify_checksum: bool,
) -> Result<Value, ProtocolError> {
    let packet = decode(raw)?;
    if verify_checksum && !packet.verify_checksum(keys.token()) {
        return Err(ProtocolError::ChecksumMismatch);
    }

    let text = decrypt_body(&packet, keys)?;
    serde_json::from_str(&text).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}
