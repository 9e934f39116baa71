//! The eSSP encrypted envelope.
//!
//! Once a session key is negotiated, the DATA section of a frame becomes
//! `STEX | AES-ECB(count | length | payload | padding | CRC)`. The count
//! increments with every encrypted frame in either direction and lets both
//! sides detect replayed or dropped envelopes. Padding is random and sized
//! so the plaintext is a whole number of AES blocks.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;

use super::frame::crc16;
use crate::error::{Error, Result};

const BLOCK: usize = 16;
// count (4) + length (1) + CRC (2)
const OVERHEAD: usize = 7;

/// Builds the 128-bit AES key from the preshared fixed half and the
/// negotiated variable half, both little-endian.
pub fn session_key(fixed: u64, variable: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&fixed.to_le_bytes());
    key[8..].copy_from_slice(&variable.to_le_bytes());
    key
}

/// Encrypts one command payload under the session key.
pub fn encrypt(key: &[u8; 16], count: u32, payload: &[u8]) -> Vec<u8> {
    let padding = (BLOCK - (OVERHEAD + payload.len()) % BLOCK) % BLOCK;
    let total = OVERHEAD + payload.len() + padding;

    let mut plain = Vec::with_capacity(total);
    plain.extend_from_slice(&count.to_le_bytes());
    plain.push(payload.len() as u8);
    plain.extend_from_slice(payload);

    let mut pack = vec![0u8; padding];
    rand::thread_rng().fill_bytes(&mut pack);
    plain.extend_from_slice(&pack);

    let crc = crc16(&plain);
    plain.push(crc as u8);
    plain.push((crc >> 8) as u8);

    let cipher = Aes128::new(GenericArray::from_slice(key));
    for chunk in plain.chunks_exact_mut(BLOCK) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    plain
}

/// Decrypts a response envelope, returning its count and payload.
pub fn decrypt(key: &[u8; 16], data: &[u8]) -> Result<(u32, Vec<u8>)> {
    if data.is_empty() || data.len() % BLOCK != 0 {
        return Err(Error::Frame("encrypted block not a multiple of 16"));
    }

    let mut plain = data.to_vec();
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for chunk in plain.chunks_exact_mut(BLOCK) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }

    let crc_lo = plain[plain.len() - 2];
    let crc_hi = plain[plain.len() - 1];
    if crc16(&plain[..plain.len() - 2]) != u16::from(crc_lo) | u16::from(crc_hi) << 8 {
        return Err(Error::Frame("encrypted envelope crc mismatch"));
    }

    let count = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]);
    let len = plain[4] as usize;
    if 5 + len > plain.len() - 2 {
        return Err(Error::Frame("encrypted envelope length out of range"));
    }

    Ok((count, plain[5..5 + len].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x67, 0x45, 0x23, 0x01, 0x67, 0x45, 0x23, 0x01, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x88,
    ];

    #[test]
    fn key_layout_is_fixed_then_variable() {
        let key = session_key(0x0123_4567_0123_4567, 0x8877_6655_4433_2211);
        assert_eq!(key, KEY);
    }

    #[test]
    fn envelope_round_trip() {
        let payload = [0x33, 0xA0, 0x86, 0x01, 0x00, b'E', b'U', b'R', 0x58];
        let wire = encrypt(&KEY, 7, &payload);
        assert_eq!(wire.len() % 16, 0);

        let (count, plain) = decrypt(&KEY, &wire).unwrap();
        assert_eq!(count, 7);
        assert_eq!(plain, payload);
    }

    #[test]
    fn exact_block_payload_needs_no_padding() {
        // 9 payload bytes + 7 overhead = one block exactly.
        let wire = encrypt(&KEY, 0, &[0u8; 9]);
        assert_eq!(wire.len(), 16);
    }

    #[test]
    fn tampered_envelope_is_rejected() {
        let mut wire = encrypt(&KEY, 1, &[0xF0]);
        wire[3] ^= 0x40;
        assert!(decrypt(&KEY, &wire).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let wire = encrypt(&KEY, 1, &[0xF0]);
        let mut other = KEY;
        other[15] ^= 1;
        assert!(decrypt(&other, &wire).is_err());
    }
}
