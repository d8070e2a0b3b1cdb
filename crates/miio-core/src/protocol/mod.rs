//! Protocol module: packet layout, request bodies, the codec, and message ids.

pub mod codec;
pub mod packet;
pub mod request;
pub mod sequence;

pub use codec::{decode, decrypt_body, encode_packet, encode_request, open_reply, ProtocolError};
pub use packet::{build_probe, HeaderFields, Packet, PacketHeader, HEADER_SIZE, MAGIC, PROBE};
pub use request::{PayloadCompat, Request};
pub use sequence::MessageCounter;
