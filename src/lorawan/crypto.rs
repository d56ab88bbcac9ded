//! AES-128 primitives used by the join procedure
//!
//! - single-block AES for key derivation and Join-Accept encryption
//! - AES-CMAC for MICs (Join-Request, Join-Accept)
//! - RFC 3394 AES key wrap for handing session keys to a network server

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Block};
use aes_kw::KekAes128;
use cmac::{Cmac, Mac};
use subtle::ConstantTimeEq;

use super::keys::AesKey;
use crate::error::CryptoError;

pub const BLOCK_SIZE: usize = 16;

fn cipher(key: &AesKey) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key.as_bytes()))
}

pub fn aes128_encrypt(key: &AesKey, block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut b: Block = GenericArray::clone_from_slice(&block);
    cipher(key).encrypt_block(&mut b);
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&b);
    out
}

pub fn aes128_decrypt(key: &AesKey, block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut b: Block = GenericArray::clone_from_slice(&block);
    cipher(key).decrypt_block(&mut b);
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&b);
    out
}

/// AES-CMAC over the concatenation of `parts`
pub fn cmac(key: &AesKey, parts: &[&[u8]]) -> [u8; BLOCK_SIZE] {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key.as_bytes()));
    for part in parts {
        mac.update(part);
    }
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&tag);
    out
}

/// LoRaWAN MIC: the first four bytes of the CMAC
pub fn mic(key: &AesKey, parts: &[&[u8]]) -> [u8; 4] {
    let full = cmac(key, parts);
    [full[0], full[1], full[2], full[3]]
}

pub fn mic_matches(computed: &[u8; 4], received: &[u8; 4]) -> bool {
    computed.ct_eq(received).into()
}

/// Wrap key material under a key-encryption key (RFC 3394 section 2.2.1).
pub fn key_wrap(kek: &AesKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if plaintext.len() < 16 || plaintext.len() % 8 != 0 {
        return Err(CryptoError::InvalidWrapInput(plaintext.len()));
    }
    KekAes128::from(*kek.as_bytes())
        .wrap_vec(plaintext)
        .map_err(|_| CryptoError::InvalidWrapInput(plaintext.len()))
}

/// Unwrap key material (RFC 3394 section 2.2.2), checking the integrity value.
pub fn key_unwrap(kek: &AesKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < 24 || ciphertext.len() % 8 != 0 {
        return Err(CryptoError::InvalidWrappedLength(ciphertext.len()));
    }
    KekAes128::from(*kek.as_bytes())
        .unwrap_vec(ciphertext)
        .map_err(|e| match e {
            aes_kw::Error::IntegrityCheckFailed => CryptoError::UnwrapIntegrity,
            _ => CryptoError::InvalidWrappedLength(ciphertext.len()),
        })
}
