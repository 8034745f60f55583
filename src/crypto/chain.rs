//! Per-message key derivation and the forward ratchet (spec.md §4.3).
//!
//! Each side of an established pairwise session holds a `ChainKey`. The
//! N-th message on that chain is encrypted with `k_N = HKDF(chain_key,
//! counter=N)`, after which the chain key itself advances via
//! `HKDF(chain_key, "step")`. Receivers tolerate reordering within a
//! window of `SKIP_WINDOW` messages by deriving and caching the keys for
//! counters they haven't seen yet.

use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::HashMap;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// How far ahead of the next expected counter a receiver will ratchet
/// forward to tolerate out-of-order delivery (spec.md §4.3: "skip-ratchet
/// forward up to a small window (32)").
pub const SKIP_WINDOW: u64 = 32;

pub type MessageKey = [u8; 32];

fn hkdf_expand(input_key: &[u8; 32], info: &[u8], out: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(None, input_key);
    hk.expand(info, out)
        .expect("hkdf expand length is always within sha256's output limit");
}

/// A single-direction message-key chain.
#[derive(Clone)]
pub struct ChainKey(pub(crate) Zeroizing<[u8; 32]>);

impl ChainKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Derive the message key for counter `n` without mutating the chain.
    fn message_key_at(&self, n: u64) -> MessageKey {
        let mut out = [0u8; 32];
        hkdf_expand(&self.0, &n.to_be_bytes(), &mut out);
        out
    }

    /// Advance the chain by one step, consuming the current key.
    fn step(&self) -> ChainKey {
        let mut out = [0u8; 32];
        hkdf_expand(&self.0, b"step", &mut out);
        ChainKey::new(out)
    }

    /// Nonce for counter `n`: big-endian 12 bytes (spec.md §4.3).
    pub fn nonce_for(n: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&n.to_be_bytes());
        nonce
    }
}

/// The sending half of a pairwise chain: strictly sequential.
pub struct SendChain {
    chain_key: ChainKey,
    next_counter: u64,
}

impl SendChain {
    pub fn new(chain_key: ChainKey) -> Self {
        Self {
            chain_key,
            next_counter: 0,
        }
    }

    /// Produce the key and counter for the next outgoing message, then
    /// advance the chain.
    pub fn next(&mut self) -> (u64, MessageKey) {
        let counter = self.next_counter;
        let key = self.chain_key.message_key_at(counter);
        self.chain_key = self.chain_key.step();
        self.next_counter += 1;
        (counter, key)
    }
}

/// The receiving half of a pairwise chain: tolerates up to `SKIP_WINDOW`
/// messages of reordering, dropping anything further out (spec.md §4.3,
/// §8 property 7: "a counter gap > window triggers a single drop event").
pub struct RecvChain {
    chain_key: ChainKey,
    next_expected: u64,
    skipped: HashMap<u64, MessageKey>,
}

impl RecvChain {
    pub fn new(chain_key: ChainKey) -> Self {
        Self {
            chain_key,
            next_expected: 0,
            skipped: HashMap::new(),
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Accept an incoming message at `counter`, returning its key if it
    /// falls within the tolerance window.
    pub fn accept(&mut self, counter: u64) -> Result<MessageKey, CryptoError> {
        if let Some(key) = self.skipped.remove(&counter) {
            return Ok(key);
        }
        if counter < self.next_expected {
            return Err(CryptoError::OutsideWindow {
                counter,
                rx: self.next_expected,
            });
        }
        if counter - self.next_expected > SKIP_WINDOW {
            return Err(CryptoError::OutsideWindow {
                counter,
                rx: self.next_expected,
            });
        }

        let mut chain_key = self.chain_key.clone();
        let mut target_key = None;
        for i in self.next_expected..=counter {
            let key = chain_key.message_key_at(i);
            if i == counter {
                target_key = Some(key);
            } else {
                self.skipped.insert(i, key);
            }
            chain_key = chain_key.step();
        }
        self.chain_key = chain_key;
        self.next_expected = counter + 1;

        // Bound memory: drop skipped entries that fell out of the window.
        let floor = self.next_expected.saturating_sub(SKIP_WINDOW);
        self.skipped.retain(|&c, _| c >= floor);

        Ok(target_key.expect("loop always visits `counter`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> ChainKey {
        ChainKey::new([7u8; 32])
    }

    #[test]
    fn in_order_delivery_advances_sequentially() {
        let mut send = SendChain::new(seed());
        let mut recv = RecvChain::new(seed());
        for i in 0..5u64 {
            let (counter, key) = send.next();
            assert_eq!(counter, i);
            let recv_key = recv.accept(counter).unwrap();
            assert_eq!(key, recv_key);
        }
    }

    #[test]
    fn out_of_order_within_window_is_tolerated() {
        let mut send = SendChain::new(seed());
        let mut recv = RecvChain::new(seed());
        let msgs: Vec<_> = (0..5).map(|_| send.next()).collect();
        // Deliver 4, 2, 0, 1, 3 — all within window.
        for idx in [4usize, 2, 0, 1, 3] {
            let (counter, key) = msgs[idx];
            let recv_key = recv.accept(counter).unwrap();
            assert_eq!(key, recv_key);
        }
    }

    #[test]
    fn counter_beyond_window_is_dropped() {
        let mut send = SendChain::new(seed());
        let mut recv = RecvChain::new(seed());
        for _ in 0..(SKIP_WINDOW + 2) {
            send.next();
        }
        let (counter, _) = send.next();
        assert!(matches!(
            recv.accept(counter),
            Err(CryptoError::OutsideWindow { .. })
        ));
    }

    #[test]
    fn replay_of_already_consumed_counter_is_rejected() {
        let mut send = SendChain::new(seed());
        let mut recv = RecvChain::new(seed());
        let (counter, _) = send.next();
        recv.accept(counter).unwrap();
        assert!(matches!(
            recv.accept(counter),
            Err(CryptoError::OutsideWindow { .. })
        ));
    }

    #[test]
    fn nonce_encodes_counter_big_endian() {
        let nonce = ChainKey::nonce_for(0x0102030405060708);
        assert_eq!(&nonce[4..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
    }
}
