//! Bignum boundary representation
//!
//! Arbitrary-precision arithmetic lives in an external fixed-limb library.
//! The core only moves bignums across the foreign-call boundary, so all it
//! needs is the limb layout and conversions to and from native integers.

use crate::heap::{Collector, HeapError, ObjectTag};
use crate::value::Handle;

/// Limb width of the bignum library
pub const LIMB_BITS: u32 = 64;

/// Sign and magnitude, magnitude as little-endian limbs without leading zeros
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bignum {
    negative: bool,
    limbs: Vec<u64>,
}

impl Bignum {
    pub fn from_i128(n: i128) -> Self {
        let mut magnitude = n.unsigned_abs();
        let mut limbs = Vec::new();
        while magnitude != 0 {
            limbs.push(magnitude as u64);
            magnitude >>= LIMB_BITS;
        }
        Bignum {
            negative: n < 0,
            limbs,
        }
    }

    pub fn from_parts(negative: bool, mut limbs: Vec<u64>) -> Self {
        while limbs.last() == Some(&0) {
            limbs.pop();
        }
        let negative = negative && !limbs.is_empty();
        Bignum { negative, limbs }
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn limbs(&self) -> &[u64] {
        &self.limbs
    }

    /// Convert to `i128`, or `None` when the value needs more than 128 bits
    pub fn to_i128(&self) -> Option<i128> {
        if self.limbs.len() > 2 {
            return None;
        }
        let mut magnitude: u128 = 0;
        for (i, limb) in self.limbs.iter().enumerate() {
            magnitude |= (*limb as u128) << (i as u32 * LIMB_BITS);
        }
        if self.negative {
            if magnitude == i128::MIN.unsigned_abs() {
                Some(i128::MIN)
            } else {
                i128::try_from(magnitude).ok().map(|m| -m)
            }
        } else {
            i128::try_from(magnitude).ok()
        }
    }

    /// Store as a heap object: one sign byte then the limbs
    pub fn store(&self, heap: &dyn Collector) -> Result<Handle, HeapError> {
        let mut bytes = Vec::with_capacity(1 + self.limbs.len() * 8);
        bytes.push(self.negative as u8);
        for limb in &self.limbs {
            bytes.extend_from_slice(&limb.to_le_bytes());
        }
        let handle = heap.allocate(bytes.len(), ObjectTag::Bignum)?;
        heap.write(handle, 0, &bytes)?;
        Ok(handle)
    }

    pub fn load(heap: &dyn Collector, handle: Handle) -> Result<Self, HeapError> {
        let tag = heap.tag_of(handle)?;
        if tag != ObjectTag::Bignum {
            return Err(HeapError::WrongTag {
                expected: ObjectTag::Bignum,
                got: tag,
            });
        }
        let bytes = heap.read(handle)?;
        let (sign, body) = bytes
            .split_first()
            .ok_or(HeapError::Malformed(ObjectTag::Bignum))?;
        if body.len() % 8 != 0 {
            return Err(HeapError::Malformed(ObjectTag::Bignum));
        }
        let limbs = body
            .chunks_exact(8)
            .map(|chunk| {
                let mut limb = [0u8; 8];
                limb.copy_from_slice(chunk);
                u64::from_le_bytes(limb)
            })
            .collect();
        Ok(Bignum::from_parts(*sign != 0, limbs))
    }
}
