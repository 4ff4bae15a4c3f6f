//! AES-128 payload ciphers: CBC with PKCS#7 padding, and GCM with a
//! 16-byte nonce taken from the header IV.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::AesGcm;
use zeroize::Zeroizing;

use crate::error::CodecError;

const BLOCK: usize = 16;

type Aes128Gcm16 = AesGcm<Aes128, U16>;

/// Turn a 32-hex-character key string into AES key bytes.
pub fn parse_key(key: &str) -> Result<Zeroizing<Vec<u8>>, CodecError> {
    let bytes = Zeroizing::new(hex::decode(key.trim()).map_err(|_| CodecError::InvalidKey)?);
    if bytes.len() != BLOCK {
        return Err(CodecError::InvalidKey);
    }
    Ok(bytes)
}

pub fn cbc_decrypt(key: &[u8], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK != 0 {
        return Err(CodecError::BlockLength(ciphertext.len()));
    }
    let cipher = Aes128::new_from_slice(key).map_err(|_| CodecError::InvalidKey)?;

    let mut out = Vec::with_capacity(ciphertext.len());
    let mut prev = *iv;
    for chunk in ciphertext.chunks_exact(BLOCK) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        out.extend_from_slice(&block);
        prev.copy_from_slice(chunk);
    }

    let pad = *out.last().unwrap_or(&0) as usize;
    if pad == 0 || pad > BLOCK || out[out.len() - pad..].iter().any(|&b| b as usize != pad) {
        return Err(CodecError::Padding);
    }
    out.truncate(out.len() - pad);
    Ok(out)
}

pub fn cbc_encrypt(key: &[u8], iv: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let cipher = Aes128::new_from_slice(key).map_err(|_| CodecError::InvalidKey)?;

    let pad = BLOCK - plaintext.len() % BLOCK;
    let mut data = plaintext.to_vec();
    data.extend(std::iter::repeat(pad as u8).take(pad));

    let mut prev = *iv;
    for chunk in data.chunks_exact_mut(BLOCK) {
        for (b, p) in chunk.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        prev.copy_from_slice(chunk);
    }
    Ok(data)
}

/// Length of a CBC ciphertext for `plain_len` bytes of plaintext.
pub fn cbc_len(plain_len: usize) -> usize {
    (plain_len / BLOCK + 1) * BLOCK
}

pub fn gcm_decrypt(key: &[u8], iv: &[u8; 16], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let cipher = Aes128Gcm16::new_from_slice(key).map_err(|_| CodecError::InvalidKey)?;
    cipher
        .decrypt(
            GenericArray::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CodecError::Decrypt)
}

pub fn gcm_encrypt(key: &[u8], iv: &[u8; 16], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let cipher = Aes128Gcm16::new_from_slice(key).map_err(|_| CodecError::InvalidKey)?;
    cipher
        .encrypt(
            GenericArray::from_slice(iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CodecError::Decrypt)
}

/// GCM appends a 16-byte tag.
pub fn gcm_len(plain_len: usize) -> usize {
    plain_len + BLOCK
}
