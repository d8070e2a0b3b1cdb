//! Cryptographic building blocks of the miio protocol.
//!
//! - **`cipher`** – AES-128-CBC for packet bodies, raw AES-128-ECB for the
//!   wrapped-token transform, and the MD5 digest used for both key
//!   derivation and packet checksums.
//! - **`keys`** – the shared device token and the key/IV derived from it.

pub mod cipher;
pub mod keys;

pub use keys::{DerivedKeys, Token, TokenError};
