//! AES-256-GCM media codec.
//!
//! Wire layout of an encrypted packet: `header || ciphertext || tag || nonce`.
//! The header stays in the clear and is authenticated as associated data;
//! the nonce is random per packet and never derived from the sequence number.

use aes_gcm::{
    Aes256Gcm, KeyInit,
    aead::{Aead, AeadInPlace, Payload, generic_array::GenericArray},
};
use rand::RngCore;
use thiserror::Error;

use crate::gateway::constants::{NONCE_SIZE, SECRET_KEY_SIZE, TAG_SIZE};

pub type SecretKey = [u8; SECRET_KEY_SIZE];
pub type MediaNonce = [u8; NONCE_SIZE];

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("packet failed authentication")]
    Authentication,
    #[error("packet too short for nonce and tag ({0} bytes)")]
    Truncated(usize),
    #[error("no secret key has been negotiated")]
    MissingKey,
    #[error("cipher rejected the payload")]
    Encrypt,
}

#[derive(Clone)]
pub struct MediaCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for MediaCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MediaCipher(aes256-gcm)")
    }
}

impl MediaCipher {
    pub fn new(key: &SecretKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(&GenericArray::clone_from_slice(key)),
        }
    }

    /// Encrypts `plaintext`, returning `ciphertext || tag` and the fresh nonce.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, MediaNonce), CryptoError> {
        let nonce = generate_nonce();
        let ciphertext = self
            .cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;
        Ok((ciphertext, nonce))
    }

    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &MediaNonce,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::Truncated(ciphertext.len()));
        }
        self.cipher
            .decrypt(
                GenericArray::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Authentication)
    }

    /// Seals `packet[header_len..]` in place and appends tag and nonce.
    /// `packet[..header_len]` is authenticated but left readable.
    pub fn seal_packet(&self, packet: &mut Vec<u8>, header_len: usize) -> Result<(), CryptoError> {
        let nonce = generate_nonce();
        let (header, payload) = packet.split_at_mut(header_len);
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), header, payload)
            .map_err(|_| CryptoError::Encrypt)?;

        packet.extend_from_slice(&tag);
        packet.extend_from_slice(&nonce);
        Ok(())
    }

    /// Opens a sealed packet into `out` (cleared first). On failure `out`
    /// holds garbage and must not be used.
    pub fn open_packet(
        &self,
        packet: &[u8],
        header_len: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        if packet.len() < header_len + TAG_SIZE + NONCE_SIZE {
            return Err(CryptoError::Truncated(packet.len()));
        }

        let (header, rest) = packet.split_at(header_len);
        let (body, nonce) = rest.split_at(rest.len() - NONCE_SIZE);
        let (ciphertext, tag) = body.split_at(body.len() - TAG_SIZE);

        out.clear();
        out.extend_from_slice(ciphertext);
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                header,
                out.as_mut_slice(),
                GenericArray::from_slice(tag),
            )
            .map_err(|_| CryptoError::Authentication)
    }
}

pub fn generate_nonce() -> MediaNonce {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: SecretKey = [7u8; SECRET_KEY_SIZE];

    #[test]
    fn round_trip_recovers_plaintext() {
        let cipher = MediaCipher::new(&KEY);
        let (ct, nonce) = cipher.encrypt(b"opus frame", b"hdr").unwrap();
        assert_eq!(ct.len(), b"opus frame".len() + TAG_SIZE);
        assert_eq!(cipher.decrypt(&ct, &nonce, b"hdr").unwrap(), b"opus frame");
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let cipher = MediaCipher::new(&KEY);
        let (_, a) = cipher.encrypt(b"x", &[]).unwrap();
        let (_, b) = cipher.encrypt(b"x", &[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_is_an_authentication_failure() {
        let (ct, nonce) = MediaCipher::new(&KEY).encrypt(b"secret", &[]).unwrap();
        let other = MediaCipher::new(&[8u8; SECRET_KEY_SIZE]);
        assert_eq!(
            other.decrypt(&ct, &nonce, &[]),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn tampered_header_or_body_is_rejected() {
        let cipher = MediaCipher::new(&KEY);
        let mut packet = b"HEADERHEADER".to_vec();
        packet.extend_from_slice(b"payload bytes");
        cipher.seal_packet(&mut packet, 12).unwrap();

        let mut out = Vec::new();
        cipher.open_packet(&packet, 12, &mut out).unwrap();
        assert_eq!(out, b"payload bytes");

        let mut body_flip = packet.clone();
        body_flip[14] ^= 0x01;
        assert_eq!(
            cipher.open_packet(&body_flip, 12, &mut out),
            Err(CryptoError::Authentication)
        );

        let mut header_flip = packet.clone();
        header_flip[0] ^= 0x01;
        assert_eq!(
            cipher.open_packet(&header_flip, 12, &mut out),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn short_packets_are_classified_not_panicking() {
        let cipher = MediaCipher::new(&KEY);
        let mut out = Vec::new();
        assert_eq!(
            cipher.open_packet(&[0u8; 20], 12, &mut out),
            Err(CryptoError::Truncated(20))
        );
        assert_eq!(
            cipher.decrypt(&[0u8; 4], &[0u8; NONCE_SIZE], &[]),
            Err(CryptoError::Truncated(4))
        );
    }
}
