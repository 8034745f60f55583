//! The pairwise Noise-NN-style handshake (spec.md §4.3).
//!
//! Ephemeral X25519 public keys travel in cleartext inside
//! `HANDSHAKE_INIT`/`HANDSHAKE_RESP` envelopes — unauthenticated by design,
//! an explicit prototype limitation (spec.md §1 Non-goals: MITM is
//! accepted). Once both sides have exchanged ephemeral keys they derive a
//! shared root key and, from it, two independent per-direction chains.

use std::time::{Duration, Instant};

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::chain::{ChainKey, RecvChain, SendChain};
use crate::identity::NodeId;

const ROOT_INFO: &[u8] = b"bigheads/nn/v1";
const LABEL_A_TO_B: &[u8] = b"a->b";
const LABEL_B_TO_A: &[u8] = b"b->a";

/// Whether we opened the handshake or answered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// The lightweight, key-material-free status published on the message bus
/// (spec.md §4.5 `handshake` topic; see S3 in spec.md §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    None,
    InitSent,
    RespSent,
    Established,
    Failed,
}

enum Inner {
    None,
    InitSent(EphemeralSecret),
    RespSent(EphemeralSecret),
    Established { tx: SendChain, rx: RecvChain },
    Failed,
}

fn derive_root(shared_secret: &x25519_dalek::SharedSecret) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());
    let mut root = [0u8; 32];
    hk.expand(ROOT_INFO, &mut root)
        .expect("32-byte expand always fits sha256's output limit");
    root
}

fn derive_chain(root: &[u8; 32], label: &[u8]) -> ChainKey {
    let hk = Hkdf::<Sha256>::new(None, root);
    let mut out = [0u8; 32];
    hk.expand(label, &mut out)
        .expect("32-byte expand always fits sha256's output limit");
    ChainKey::new(out)
}

/// Per-peer handshake + established-chain state, owned exclusively by the
/// mesh dispatcher (spec.md §5: "Crypto session state per peer is owned by
/// the dispatcher; no other task mutates it").
pub struct PairwiseSession {
    pub peer: NodeId,
    pub role: HandshakeRole,
    inner: Inner,
    /// Handshake retransmit attempts so far (spec.md §4.3: resend once
    /// after 10s, surface `HandshakeFailed` after three failures).
    pub attempts: u32,
    /// When the current `INIT_SENT` flight went out, so the dispatcher's
    /// retry ticker can tell a stalled handshake from a fresh one.
    initiated_at: Option<Instant>,
}

impl PairwiseSession {
    pub fn new(peer: NodeId, role: HandshakeRole) -> Self {
        Self {
            peer,
            role,
            inner: Inner::None,
            attempts: 0,
            initiated_at: None,
        }
    }

    pub fn status(&self) -> HandshakeStatus {
        match self.inner {
            Inner::None => HandshakeStatus::None,
            Inner::InitSent(_) => HandshakeStatus::InitSent,
            Inner::RespSent(_) => HandshakeStatus::RespSent,
            Inner::Established { .. } => HandshakeStatus::Established,
            Inner::Failed => HandshakeStatus::Failed,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.inner, Inner::Established { .. })
    }

    /// Initiator: generate our ephemeral keypair, move to `INIT_SENT`, and
    /// return the public key to embed in the `HANDSHAKE_INIT` envelope.
    ///
    /// Also doubles as the retransmit path: calling this again while
    /// already `INIT_SENT` sends a fresh flight with a new ephemeral key
    /// and bumps `attempts`; calling it from any other state starts a new
    /// attempt count.
    pub fn begin(&mut self) -> [u8; 32] {
        if !matches!(self.inner, Inner::InitSent(_)) {
            self.attempts = 0;
        }
        self.attempts += 1;
        self.initiated_at = Some(Instant::now());

        let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        self.inner = Inner::InitSent(secret);
        public.to_bytes()
    }

    /// Time since the current `INIT_SENT` flight was sent, if we're still
    /// waiting on a `HANDSHAKE_RESP`.
    pub fn init_elapsed(&self) -> Option<Duration> {
        match self.inner {
            Inner::InitSent(_) => self.initiated_at.map(|t| t.elapsed()),
            _ => None,
        }
    }

    /// Responder: on receiving `HANDSHAKE_INIT`, generate our own ephemeral
    /// keypair, compute the shared secret immediately, derive both chains,
    /// and return the public key for `HANDSHAKE_RESP`.
    pub fn respond(&mut self, peer_public: [u8; 32]) -> [u8; 32] {
        let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let our_public = PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&PublicKey::from(peer_public));
        let root = derive_root(&shared);

        // Responder sends on "b->a" and receives on "a->b".
        let tx = SendChain::new(derive_chain(&root, LABEL_B_TO_A));
        let rx = RecvChain::new(derive_chain(&root, LABEL_A_TO_B));
        self.inner = Inner::Established { tx, rx };
        our_public.to_bytes()
    }

    /// Initiator: on receiving `HANDSHAKE_RESP`, complete the exchange.
    pub fn complete(&mut self, peer_public: [u8; 32]) -> bool {
        let secret = match std::mem::replace(&mut self.inner, Inner::Failed) {
            Inner::InitSent(secret) => secret,
            other => {
                self.inner = other;
                return false;
            }
        };
        let shared = secret.diffie_hellman(&PublicKey::from(peer_public));
        let root = derive_root(&shared);

        // Initiator sends on "a->b" and receives on "b->a".
        let tx = SendChain::new(derive_chain(&root, LABEL_A_TO_B));
        let rx = RecvChain::new(derive_chain(&root, LABEL_B_TO_A));
        self.inner = Inner::Established { tx, rx };
        true
    }

    pub fn mark_failed(&mut self) {
        self.inner = Inner::Failed;
    }

    pub fn send_chain_mut(&mut self) -> Option<&mut SendChain> {
        match &mut self.inner {
            Inner::Established { tx, .. } => Some(tx),
            _ => None,
        }
    }

    pub fn recv_chain_mut(&mut self) -> Option<&mut RecvChain> {
        match &mut self.inner {
            Inner::Established { rx, .. } => Some(rx),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{aead_decrypt, aead_encrypt};

    #[test]
    fn handshake_establishes_matching_chains() {
        let peer_a = NodeId::random();
        let peer_b = NodeId::random();
        let mut a = PairwiseSession::new(peer_b, HandshakeRole::Initiator);
        let mut b = PairwiseSession::new(peer_a, HandshakeRole::Responder);

        let a_pub = a.begin();
        assert_eq!(a.status(), HandshakeStatus::InitSent);

        let b_pub = b.respond(a_pub);
        assert_eq!(b.status(), HandshakeStatus::Established);

        assert!(a.complete(b_pub));
        assert_eq!(a.status(), HandshakeStatus::Established);

        let (counter, key) = a.send_chain_mut().unwrap().next();
        let nonce = ChainKey::nonce_for(counter);
        let ct = aead_encrypt(&key, &nonce, b"aad", b"yo");

        let recv_key = b.recv_chain_mut().unwrap().accept(counter).unwrap();
        let pt = aead_decrypt(&recv_key, &nonce, b"aad", &ct).unwrap();
        assert_eq!(pt, b"yo");
    }

    #[test]
    fn complete_without_begin_fails_gracefully() {
        let mut a = PairwiseSession::new(NodeId::random(), HandshakeRole::Initiator);
        assert!(!a.complete([0u8; 32]));
    }

    #[test]
    fn each_direction_has_an_independent_chain() {
        let mut a = PairwiseSession::new(NodeId::random(), HandshakeRole::Initiator);
        let mut b = PairwiseSession::new(NodeId::random(), HandshakeRole::Responder);
        let a_pub = a.begin();
        let b_pub = b.respond(a_pub);
        a.complete(b_pub);

        let (ac, akey) = a.send_chain_mut().unwrap().next();
        let (bc, bkey) = b.send_chain_mut().unwrap().next();
        assert_eq!(ac, 0);
        assert_eq!(bc, 0);
        assert_ne!(akey, bkey);
    }

    #[test]
    fn resending_begin_bumps_attempts_and_keeps_the_count_across_retries() {
        let mut a = PairwiseSession::new(NodeId::random(), HandshakeRole::Initiator);
        a.begin();
        assert_eq!(a.attempts, 1);
        a.begin();
        a.begin();
        assert_eq!(a.attempts, 3);
        assert_eq!(a.status(), HandshakeStatus::InitSent);
    }

    #[test]
    fn starting_over_after_failure_resets_the_attempt_count() {
        let mut a = PairwiseSession::new(NodeId::random(), HandshakeRole::Initiator);
        a.begin();
        a.begin();
        a.mark_failed();
        a.begin();
        assert_eq!(a.attempts, 1);
    }

    #[test]
    fn init_elapsed_is_none_outside_init_sent() {
        let mut a = PairwiseSession::new(NodeId::random(), HandshakeRole::Initiator);
        assert!(a.init_elapsed().is_none());
        a.begin();
        assert!(a.init_elapsed().is_some());
        a.mark_failed();
        assert!(a.init_elapsed().is_none());
    }
}
