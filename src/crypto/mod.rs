//! The cryptographic channel: group AEAD, pairwise handshake, and
//! per-message key derivation (spec.md §4.3).

mod chain;
mod group;
mod handshake;

pub use chain::{ChainKey, MessageKey, RecvChain, SendChain, SKIP_WINDOW};
pub use group::{derive_group_key, GroupChannel};
pub use handshake::{HandshakeRole, HandshakeStatus, PairwiseSession};

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};

use crate::error::CryptoError;

/// Shared AEAD primitive used by both the group channel and pairwise
/// per-message keys: ChaCha20-Poly1305 with a 12-byte nonce and caller-
/// supplied associated data (spec.md §4.3).
pub(crate) fn aead_encrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    plaintext: &[u8],
) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            chacha20poly1305::aead::Payload { msg: plaintext, aad },
        )
        .expect("chacha20poly1305 encryption does not fail for bounded inputs")
}

pub(crate) fn aead_decrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            chacha20poly1305::aead::Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthFailed)
}
