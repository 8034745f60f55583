//! Node identity: a stable 16-byte id and a long-term X25519 keypair,
//! generated once at first run and persisted thereafter.

use rand::RngCore;
use zeroize::Zeroizing;

/// A node identifier. Random at first run, persisted forever after.
///
/// `[0u8; 16]` is the reserved `BROADCAST` sentinel (spec.md §3): no real
/// node is ever assigned it, since `NodeId::random` draws from the full
/// 128-bit space and the chance of rolling all-zero is negligible, but the
/// constructor still exists as a named, checkable value rather than a
/// magic literal scattered through the mesh code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    pub const BROADCAST: NodeId = NodeId([0u8; 16]);

    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex prefix for logging/display, e.g. `a1b2c3d4`.
    pub fn fmt_short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_broadcast() {
            return write!(f, "BROADCAST");
        }
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The node's long-term X25519 identity keypair. Generated once at first
/// run, never rotated. Not used to authenticate the Noise-NN-style
/// handshake in crypto.rs (that's an explicit prototype limitation — see
/// spec.md §1 Non-goals) but persisted so a future authenticated handshake
/// has a stable key to build on.
pub struct LongTermKeypair {
    pub secret: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl LongTermKeypair {
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand::thread_rng());
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            secret: Zeroizing::new(secret.to_bytes()),
            public: public.to_bytes(),
        }
    }

    pub fn from_bytes(secret: [u8; 32]) -> Self {
        let public = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(secret));
        Self {
            secret: Zeroizing::new(secret),
            public: public.to_bytes(),
        }
    }
}

/// A node's full identity: its id plus its long-term keypair. Owned by the
/// Runtime and handed to components at construction (spec.md §9: "no
/// process-wide singletons").
pub struct Identity {
    pub node_id: NodeId,
    pub keypair: LongTermKeypair,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            node_id: NodeId::random(),
            keypair: LongTermKeypair::generate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_is_all_zero() {
        assert_eq!(NodeId::BROADCAST.0, [0u8; 16]);
        assert!(NodeId::BROADCAST.is_broadcast());
    }

    #[test]
    fn random_ids_differ() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_ne!(a, b);
        assert!(!a.is_broadcast());
    }

    #[test]
    fn fmt_short_is_four_bytes_hex() {
        let id = NodeId::from_bytes([0xab; 16]);
        assert_eq!(id.fmt_short(), "abababab");
    }

    #[test]
    fn keypair_roundtrips_from_bytes() {
        let kp = LongTermKeypair::generate();
        let restored = LongTermKeypair::from_bytes(*kp.secret);
        assert_eq!(kp.public, restored.public);
    }
}
