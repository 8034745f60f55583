//! The on-wire envelope: the fixed-format encrypted unit transmitted on the
//! mesh (spec.md §3, §6).

use crate::error::CodecError;
use crate::identity::NodeId;
use uuid::Uuid;

/// Protocol magic: identifies a meshcore envelope versus noise on the air.
pub const MAGIC: u16 = 0xB401;
pub const VERSION: u8 = 1;

/// One of the eight envelope kinds named in spec.md §3. The wire byte for
/// each variant is fixed — adding a new kind must append, never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    Text = 1,
    FileChunk = 2,
    HandshakeInit = 3,
    HandshakeResp = 4,
    Reaction = 5,
    Typing = 6,
    Ack = 7,
    Presence = 8,
}

impl EnvelopeKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => EnvelopeKind::Text,
            2 => EnvelopeKind::FileChunk,
            3 => EnvelopeKind::HandshakeInit,
            4 => EnvelopeKind::HandshakeResp,
            5 => EnvelopeKind::Reaction,
            6 => EnvelopeKind::Typing,
            7 => EnvelopeKind::Ack,
            8 => EnvelopeKind::Presence,
            other => return Err(CodecError::UnknownKind(other)),
        })
    }
}

/// Fixed-size portion of the header, in bytes: magic(2) + version(1) +
/// kind(1) + ttl(1) + hop(1) + msg_id(16) + origin(16) + dest(16) + seq(8)
/// + ts(8) + nonce(12) + ct_len(4).
pub const HEADER_LEN: usize = 2 + 1 + 1 + 1 + 1 + 16 + 16 + 16 + 8 + 8 + 12 + 4;

/// The unit of transmission on the mesh. See spec.md §3 for field semantics
/// and invariants.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub msg_id: Uuid,
    pub origin: NodeId,
    pub dest: NodeId,
    pub kind: EnvelopeKind,
    pub ttl: u8,
    pub hop: u8,
    pub ts: u64,
    pub seq: u64,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// `aad` binds `msg_id || origin || dest || kind || seq`, as required by
    /// spec.md §3 so tampering with any of those header fields invalidates
    /// the AEAD tag.
    pub fn aad(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 16 + 16 + 1 + 8);
        out.extend_from_slice(self.msg_id.as_bytes());
        out.extend_from_slice(self.origin.as_bytes());
        out.extend_from_slice(self.dest.as_bytes());
        out.push(self.kind.as_u8());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out
    }

    /// Encode per the wire layout in spec.md §6. All multi-byte integers
    /// are big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.push(VERSION);
        out.push(self.kind.as_u8());
        out.push(self.ttl);
        out.push(self.hop);
        out.extend_from_slice(self.msg_id.as_bytes());
        out.extend_from_slice(self.origin.as_bytes());
        out.extend_from_slice(self.dest.as_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ts.to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decode a frame received from the transport. Malformed input is
    /// always a `CodecError`, never a panic — inbound data is adversarial
    /// by default.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::ShortBuffer {
                need: HEADER_LEN,
                got: buf.len(),
            });
        }
        let mut pos = 0usize;
        let take = |pos: &mut usize, n: usize| -> &[u8] {
            let slice = &buf[*pos..*pos + n];
            *pos += n;
            slice
        };

        let magic = u16::from_be_bytes(take(&mut pos, 2).try_into().unwrap());
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let version = take(&mut pos, 1)[0];
        if version != VERSION {
            return Err(CodecError::BadVersion(version));
        }
        let kind = EnvelopeKind::try_from(take(&mut pos, 1)[0])?;
        let ttl = take(&mut pos, 1)[0];
        let hop = take(&mut pos, 1)[0];
        let msg_id = Uuid::from_bytes(take(&mut pos, 16).try_into().unwrap());
        let origin = NodeId::from_bytes(take(&mut pos, 16).try_into().unwrap());
        let dest = NodeId::from_bytes(take(&mut pos, 16).try_into().unwrap());
        let seq = u64::from_be_bytes(take(&mut pos, 8).try_into().unwrap());
        let ts = u64::from_be_bytes(take(&mut pos, 8).try_into().unwrap());
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(take(&mut pos, 12));
        let ct_len = u32::from_be_bytes(take(&mut pos, 4).try_into().unwrap());

        if buf.len() != HEADER_LEN + ct_len as usize {
            return Err(CodecError::ShortBuffer {
                need: HEADER_LEN + ct_len as usize,
                got: buf.len(),
            });
        }
        let ciphertext = buf[pos..pos + ct_len as usize].to_vec();

        Ok(Envelope {
            msg_id,
            origin,
            dest,
            kind,
            ttl,
            hop,
            ts,
            seq,
            nonce,
            ciphertext,
        })
    }

    /// Validate `ct_len <= packet_size_limit - HEADER_LEN` (spec.md §6).
    pub fn check_size_limit(&self, packet_size_limit: u32) -> Result<(), CodecError> {
        let max_ct = packet_size_limit.saturating_sub(HEADER_LEN as u32);
        if self.ciphertext.len() as u32 > max_ct {
            return Err(CodecError::CiphertextTooLarge(self.ciphertext.len() as u32));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            msg_id: Uuid::from_u128(0x1234),
            origin: NodeId::from_bytes([1u8; 16]),
            dest: NodeId::BROADCAST,
            kind: EnvelopeKind::Text,
            ttl: 6,
            hop: 0,
            ts: 1_700_000_000_000,
            seq: 42,
            nonce: [9u8; 12],
            ciphertext: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn round_trip() {
        let e = sample();
        let bytes = e.encode();
        let decoded = Envelope::decode(&bytes).expect("decode");
        assert_eq!(decoded.msg_id, e.msg_id);
        assert_eq!(decoded.origin, e.origin);
        assert_eq!(decoded.dest, e.dest);
        assert_eq!(decoded.kind, e.kind);
        assert_eq!(decoded.ttl, e.ttl);
        assert_eq!(decoded.hop, e.hop);
        assert_eq!(decoded.ts, e.ts);
        assert_eq!(decoded.seq, e.seq);
        assert_eq!(decoded.nonce, e.nonce);
        assert_eq!(decoded.ciphertext, e.ciphertext);
    }

    #[test]
    fn header_len_matches_fixed_fields() {
        let e = sample();
        let bytes = e.encode();
        assert_eq!(bytes.len(), HEADER_LEN + e.ciphertext.len());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = 0xff;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(CodecError::BadMagic(_))
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = sample().encode();
        bytes[3] = 200;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(CodecError::UnknownKind(200))
        ));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let bytes = sample().encode();
        assert!(matches!(
            Envelope::decode(&bytes[..HEADER_LEN - 1]),
            Err(CodecError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let bytes = sample().encode();
        assert!(matches!(
            Envelope::decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn aad_binds_header_fields() {
        let a = sample();
        let mut b = sample();
        b.seq += 1;
        assert_ne!(a.aad(), b.aad());
    }

    #[test]
    fn size_limit_is_enforced() {
        let e = sample();
        assert!(e.check_size_limit(512).is_ok());
        assert!(e.check_size_limit(HEADER_LEN as u32).is_err());
    }
}
