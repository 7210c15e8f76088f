//! # Identifiers and XOR Distance
//!
//! The overlay addresses everything (nodes, groups, message targets) with a
//! single 512-bit identifier type, [`NodeId`]. Proximity between identifiers
//! is the Kademlia XOR metric: the distance between `a` and `b` is `a ^ b`
//! interpreted as an unsigned 512-bit integer.
//!
//! Two orderings are used throughout the routing layer:
//!
//! - **XOR magnitude**: `distance_cmp` compares raw distances byte-wise from
//!   the most significant end. This is the ordering behind every
//!   "closest to target" query.
//! - **Common leading bits (CLB)**: the number of identical high-order bits
//!   between two identifiers. Bucket placement in the routing table is by
//!   CLB against this node's own identifier.
//!
//! Identifiers travel on the wire as 64 raw bytes. Hex encoding exists for
//! logging only and never appears on a routing hot path.

use std::cmp::Ordering;
use std::fmt;

use ed25519_dalek::VerifyingKey;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier width in bytes (512 bits).
pub const ID_BYTES: usize = 64;

/// Identifier width in bits.
pub const ID_BITS: u16 = (ID_BYTES as u16) * 8;

/// Domain separation prefix when deriving an identifier from a public key.
const ID_DERIVE_DOMAIN: &[u8] = b"trellis-node-id-v1:";

/// Raw XOR distance between two identifiers.
pub type Distance = [u8; ID_BYTES];

/// A 512-bit overlay identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; ID_BYTES]);

    #[inline]
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Derive an identifier from a long-term public key.
    ///
    /// The credential subsystem owns the keys; the overlay only needs a
    /// uniformly distributed 512-bit name for each of them. A keyed XOF
    /// widens the 32-byte key into the identifier space.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ID_DERIVE_DOMAIN);
        hasher.update(key.as_bytes());
        let mut out = [0u8; ID_BYTES];
        hasher.finalize_xof().fill(&mut out);
        Self(out)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of identical high-order bits between `self` and `other`.
    ///
    /// Equal identifiers share all [`ID_BITS`] bits.
    pub fn common_leading_bits(&self, other: &NodeId) -> u16 {
        for (byte_idx, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return (byte_idx as u16) * 8 + diff.leading_zeros() as u16;
            }
        }
        ID_BITS
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_BYTES];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Compare two raw distances as unsigned 512-bit integers.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    a.cmp(b)
}

/// True when `lhs` is strictly closer to `target` than `rhs`.
#[inline]
pub fn closer_to_target(lhs: &NodeId, rhs: &NodeId, target: &NodeId) -> bool {
    distance_cmp(&lhs.xor_distance(target), &rhs.xor_distance(target)) == Ordering::Less
}

/// Truncated hex form for log fields. Never used on the wire.
pub fn debug_id(id: &NodeId) -> String {
    hex::encode(&id.as_bytes()[..4])
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", hex::encode(&self.0[..4]))
    }
}

// [u8; 64] is past serde's derived-array width, so the identifier carries its
// own impls: 64 raw bytes on the wire.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct NodeIdVisitor;

impl<'de> Visitor<'de> for NodeIdVisitor {
    type Value = NodeId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ID_BYTES} raw identifier bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<NodeId, E> {
        if v.len() != ID_BYTES {
            return Err(E::invalid_length(v.len(), &self));
        }
        let mut arr = [0u8; ID_BYTES];
        arr.copy_from_slice(v);
        Ok(NodeId(arr))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<NodeId, A::Error> {
        let mut arr = [0u8; ID_BYTES];
        for (i, slot) in arr.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(NodeId(arr))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(NodeIdVisitor)
    }
}
