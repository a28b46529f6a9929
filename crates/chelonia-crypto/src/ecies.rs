//! AEAD building blocks.
//!
//! Symmetric layout: `nonce (24) || ciphertext+tag`.
//! X25519 layout: `ephemeral public (32) || nonce (24) || ciphertext+tag`,
//! where the AEAD key is HKDF-SHA256 over the ephemeral-static shared secret.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// `XChaCha20` nonce size.
pub(crate) const NONCE_SIZE: usize = 24;

/// Poly1305 tag size.
const TAG_SIZE: usize = 16;

/// X25519 public key size.
const EPHEMERAL_SIZE: usize = 32;

const HKDF_INFO: &[u8] = b"chelonia-x25519-v1";

pub(crate) fn seal_symmetric(key: &[u8; 32], nonce: [u8; NONCE_SIZE], plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad }) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

pub(crate) fn open_symmetric(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::CiphertextTooShort { len: data.len() });
    }
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

pub(crate) fn seal_to(
    recipient: &[u8; 32],
    ephemeral_seed: [u8; 32],
    nonce: [u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Vec<u8> {
    let ephemeral = StaticSecret::from(ephemeral_seed);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient));
    let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient);

    let sealed = seal_symmetric(&key, nonce, plaintext, aad);
    let mut out = Vec::with_capacity(EPHEMERAL_SIZE + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&sealed);
    out
}

pub(crate) fn open_from(secret: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < EPHEMERAL_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::CiphertextTooShort { len: data.len() });
    }
    let (ephemeral, sealed) = data.split_at(EPHEMERAL_SIZE);
    let Ok(ephemeral) = <[u8; EPHEMERAL_SIZE]>::try_from(ephemeral) else {
        unreachable!("split_at returned exactly EPHEMERAL_SIZE bytes");
    };

    let secret = StaticSecret::from(*secret);
    let own_public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&PublicKey::from(ephemeral));
    let key = derive_key(shared.as_bytes(), &ephemeral, own_public.as_bytes());

    open_symmetric(&key, sealed, aad)
}

fn derive_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, shared);

    let mut info = Vec::with_capacity(HKDF_INFO.len() + 64);
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(ephemeral);
    info.extend_from_slice(recipient);

    let mut okm = Zeroizing::new([0u8; 32]);
    let Ok(()) = hk.expand(&info, &mut okm[..]) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    okm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_rejects_wrong_aad() {
        let key = [3u8; 32];
        let sealed = seal_symmetric(&key, [1; NONCE_SIZE], b"secret", b"aad-1");
        assert_eq!(open_symmetric(&key, &sealed, b"aad-1").unwrap(), b"secret");
        assert_eq!(open_symmetric(&key, &sealed, b"aad-2"), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn x25519_round_trip() {
        let recipient = StaticSecret::from([9u8; 32]);
        let recipient_public = PublicKey::from(&recipient).to_bytes();

        let sealed = seal_to(&recipient_public, [5; 32], [6; NONCE_SIZE], b"hello", b"aad");
        assert_eq!(open_from(&[9u8; 32], &sealed, b"aad").unwrap(), b"hello");
        assert!(open_from(&[8u8; 32], &sealed, b"aad").is_err());
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        assert_eq!(
            open_symmetric(&[0; 32], &[0; 10], b""),
            Err(CryptoError::CiphertextTooShort { len: 10 })
        );
    }
}
