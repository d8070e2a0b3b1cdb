//! Device token handling and key derivation.
//!
//! Every miio device has a 16-byte secret called the *token*.  The packet key
//! and IV are both derived from it with MD5:
//!
//! ```text
//! key = MD5(token)
//! iv  = MD5(key ‖ token)
//! ```
//!
//! # Wrapped tokens
//!
//! Some vendor apps export the token in a longer *wrapped* form (48 bytes,
//! 96 hex characters).  The first 32 bytes are the ASCII hex text of the real
//! token encrypted with AES-128-ECB under an all-zero key, padding disabled.
//! [`Token::from_bytes`] detects this form by its length and unwraps it.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::crypto::cipher::{ecb_decrypt, md5, md5_concat};

/// Length of a raw token in bytes.
pub const TOKEN_LEN: usize = 16;

/// Minimum length of a wrapped token: two ECB blocks of hex text.
pub const WRAPPED_TOKEN_MIN_LEN: usize = 32;

const WRAPPING_KEY: [u8; 16] = [0u8; 16];

/// Errors for malformed token configuration.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TokenError {
    /// The configured text is not hexadecimal.
    #[error("token is not valid hex: {0}")]
    InvalidHex(String),

    /// The decoded token has neither the raw nor the wrapped length.
    #[error("token must be 16 bytes or a wrapped form of at least 32 bytes, got {0}")]
    InvalidLength(usize),

    /// A wrapped token did not decrypt to 32 hex characters.
    #[error("wrapped token did not unwrap to a hex token: {0}")]
    BadWrappedToken(String),
}

/// The 16-byte shared secret of a device.
///
/// `Debug` never prints the secret.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    /// Creates a token from raw or wrapped bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidLength`] if `bytes` is neither 16 bytes
    /// long nor long enough to be a wrapped token, and
    /// [`TokenError::BadWrappedToken`] if unwrapping fails.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        match bytes.len() {
            TOKEN_LEN => {
                let mut raw = [0u8; TOKEN_LEN];
                raw.copy_from_slice(bytes);
                Ok(Self(raw))
            }
            n if n >= WRAPPED_TOKEN_MIN_LEN => unwrap_token(bytes).map(Self),
            n => Err(TokenError::InvalidLength(n)),
        }
    }

    /// Parses a token from hex text.  Whitespace anywhere in the text is ignored.
    ///
    /// # Errors
    ///
    /// See [`Token::from_bytes`]; additionally [`TokenError::InvalidHex`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use miio_core::Token;
    ///
    /// let token = Token::from_hex("00010203 04050607 08090a0b 0c0d0e0f").unwrap();
    /// assert_eq!(token.as_bytes()[15], 0x0f);
    /// ```
    pub fn from_hex(text: &str) -> Result<Self, TokenError> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = hex::decode(&compact).map_err(|e| TokenError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// The raw token bytes.
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Derives the packet key and IV for this token.
    pub fn derive_keys(&self) -> DerivedKeys {
        derive(*self)
    }
}

impl FromStr for Token {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

/// Recovers the raw token from the vendor's wrapped form.
fn unwrap_token(wrapped: &[u8]) -> Result<[u8; TOKEN_LEN], TokenError> {
    let decrypted = ecb_decrypt(&WRAPPING_KEY, &wrapped[..WRAPPED_TOKEN_MIN_LEN])
        .map_err(|e| TokenError::BadWrappedToken(e.to_string()))?;

    let text = std::str::from_utf8(&decrypted)
        .map_err(|_| TokenError::BadWrappedToken("decrypted text is not ASCII".into()))?;
    let hex_text = text
        .get(..TOKEN_LEN * 2)
        .ok_or_else(|| TokenError::BadWrappedToken("decrypted text too short".into()))?;

    let bytes = hex::decode(hex_text).map_err(|e| TokenError::BadWrappedToken(e.to_string()))?;
    let mut raw = [0u8; TOKEN_LEN];
    raw.copy_from_slice(&bytes);

    debug!("unwrapped {}-byte wrapped token", wrapped.len());
    Ok(raw)
}

/// Key material derived once per token and reused for every packet.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKeys {
    token: Token,
    key: [u8; 16],
    iv: [u8; 16],
}

impl DerivedKeys {
    /// The token the keys were derived from.  Packet checksums are keyed by it.
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// `MD5(token)`.
    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    /// `MD5(key ‖ token)`.
    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }
}

impl fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKeys").finish_non_exhaustive()
    }
}

/// Derives `key = MD5(token)` and `iv = MD5(key ‖ token)`.
pub fn derive(token: Token) -> DerivedKeys {
    let key = md5(token.as_bytes());
    let iv = md5_concat(&[&key, token.as_bytes()]);
    DerivedKeys { token, key, iv }
}
