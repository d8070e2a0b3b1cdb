//! AES-128 and MD5 primitives used by the miio protocol.
//!
//! Packet bodies are AES-128-CBC with PKCS#7 block padding.  The wrapped token
//! format uses raw AES-128-ECB with padding disabled, so ECB here works on
//! whole 16-byte blocks only.

use aes::cipher::{
    block_padding::Pkcs7, generic_array::GenericArray, BlockDecrypt, BlockDecryptMut,
    BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
};
use aes::Aes128;
use md5::{Digest, Md5};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Errors raised by the cipher helpers.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CipherError {
    /// Input to a block operation was not a whole number of blocks.
    #[error("ciphertext length {0} is not a multiple of 16")]
    NotBlockAligned(usize),

    /// CBC decryption produced invalid PKCS#7 padding (usually a wrong key).
    #[error("invalid block padding after decryption")]
    BadPadding,
}

/// MD5 digest of `data`.
pub fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// MD5 digest over the concatenation of `parts`, without building the
/// concatenated buffer.
pub fn md5_concat(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Encrypts `plaintext` with AES-128-CBC and PKCS#7 padding.
///
/// The output length is always a non-zero multiple of [`BLOCK_SIZE`].
pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypts AES-128-CBC `ciphertext` and removes PKCS#7 padding.
///
/// # Errors
///
/// Returns [`CipherError::NotBlockAligned`] for truncated input and
/// [`CipherError::BadPadding`] when the padding does not verify.
pub fn cbc_decrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CipherError::NotBlockAligned(ciphertext.len()));
    }
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::BadPadding)
}

/// AES-128-ECB encryption of whole blocks, no padding.
///
/// # Errors
///
/// Returns [`CipherError::NotBlockAligned`] if `plaintext` is not a multiple
/// of [`BLOCK_SIZE`].
pub fn ecb_encrypt(key: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    if plaintext.len() % BLOCK_SIZE != 0 {
        return Err(CipherError::NotBlockAligned(plaintext.len()));
    }

    let cipher = Aes128::new(key.into());
    let mut output = plaintext.to_vec();
    for chunk in output.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(output)
}

/// AES-128-ECB decryption of whole blocks, no padding.
///
/// # Errors
///
/// Returns [`CipherError::NotBlockAligned`] if `ciphertext` is not a multiple
/// of [`BLOCK_SIZE`].
pub fn ecb_decrypt(key: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CipherError::NotBlockAligned(ciphertext.len()));
    }

    let cipher = Aes128::new(key.into());
    let mut output = ciphertext.to_vec();
    for chunk in output.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(output)
}
