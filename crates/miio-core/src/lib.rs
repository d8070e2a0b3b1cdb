//! # miio-core
//!
//! Protocol library for the miio UDP device-control protocol spoken by many
//! smart-home appliances.  It contains the binary packet codec, the key
//! derivation from the shared device token, and the session state value that
//! the handshake and request paths share.
//!
//! This crate has no sockets and no async runtime; the `miio-client` crate
//! drives it over UDP.
//!
//! # Architecture overview (for beginners)
//!
//! A miio device listens on UDP port 54321.  A client talks to it in two
//! kinds of datagrams:
//!
//! - **Probes** – a constant 32-byte packet (`21 31 00 20 FF…FF`).  The device
//!   answers with its own 32-byte "hello" header carrying its serial number
//!   and its internal clock.  The same exchange doubles as keepalive.
//!
//! - **Requests / replies** – a 32-byte header followed by an AES-128-CBC
//!   encrypted JSON body such as `{"id":1,"method":"get_prop","params":["power"]}`.
//!   The header carries an MD5 checksum keyed by the device token.
//!
//! The crate is split into:
//!
//! - **`crypto`** – token parsing (including the vendor "wrapped" form), key
//!   and IV derivation, and the AES/MD5 primitives.
//! - **`protocol`** – header layout, the probe, request body building, the
//!   encode/decode/decrypt codec, and the message-id counter.
//! - **`session`** – what the client has learned about the device (serial,
//!   clock offset) and how it stamps outgoing packets.

pub mod crypto;
pub mod protocol;
pub mod session;

pub use crypto::keys::{DerivedKeys, Token, TokenError};
pub use protocol::codec::{
    decode, decrypt_body, encode_packet, encode_request, open_reply, ProtocolError,
};
pub use protocol::packet::{
    build_probe, HeaderFields, Packet, PacketHeader, DEFAULT_DEVICE_PORT, HEADER_SIZE, MAGIC,
};
pub use protocol::request::{PayloadCompat, Request};
pub use protocol::sequence::MessageCounter;
pub use session::{unix_now_secs, SessionState};
