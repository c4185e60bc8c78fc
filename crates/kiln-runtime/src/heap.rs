//! Collector contract
//!
//! The garbage collector is an external collaborator. The core only needs
//! `allocate(size, tag) -> Handle` plus identity-preserving access to the
//! payload. `ArenaHeap` is an append-only implementation used by embedders
//! that bring no collector of their own, and by the test suite.

use crate::value::Handle;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use thiserror::Error;

/// Kind of a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectTag {
    /// UTF-8 string without terminator
    String,
    /// Sign byte followed by little-endian 64-bit limbs
    Bignum,
    /// Opaque byte vector
    Bytes,
}

impl fmt::Display for ObjectTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectTag::String => "string",
            ObjectTag::Bignum => "bignum",
            ObjectTag::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// Heap access errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HeapError {
    #[error("Invalid object handle {0}")]
    InvalidHandle(Handle),

    #[error("Heap exhausted: requested {requested} bytes with {available} available")]
    Exhausted { requested: usize, available: usize },

    #[error("Write of {len} bytes at offset {offset} exceeds object size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Expected {expected} object, got {got}")]
    WrongTag { expected: ObjectTag, got: ObjectTag },

    #[error("Malformed {0} object")]
    Malformed(ObjectTag),
}

/// Allocate/identity contract of the garbage collector
pub trait Collector: Send + Sync {
    /// Allocate a zero-filled object of `size` bytes
    fn allocate(&self, size: usize, tag: ObjectTag) -> Result<Handle, HeapError>;

    fn tag_of(&self, handle: Handle) -> Result<ObjectTag, HeapError>;

    /// Copy out the payload of an object
    fn read(&self, handle: Handle) -> Result<Vec<u8>, HeapError>;

    /// Overwrite part of an object's payload
    fn write(&self, handle: Handle, offset: usize, bytes: &[u8]) -> Result<(), HeapError>;

    /// Allocate a string object holding `s`
    fn make_string(&self, s: &str) -> Result<Handle, HeapError> {
        let handle = self.allocate(s.len(), ObjectTag::String)?;
        self.write(handle, 0, s.as_bytes())?;
        Ok(handle)
    }

    /// Read a string object
    fn string(&self, handle: Handle) -> Result<String, HeapError> {
        let tag = self.tag_of(handle)?;
        if tag != ObjectTag::String {
            return Err(HeapError::WrongTag {
                expected: ObjectTag::String,
                got: tag,
            });
        }
        String::from_utf8(self.read(handle)?).map_err(|_| HeapError::Malformed(ObjectTag::String))
    }
}

struct HeapObject {
    tag: ObjectTag,
    payload: RwLock<Box<[u8]>>,
}

/// Append-only arena collector
///
/// Handles are arena indices and are never reused, so identity is stable
/// for the life of the heap.
pub struct ArenaHeap {
    objects: boxcar::Vec<HeapObject>,
    allocated: AtomicUsize,
    limit: Option<usize>,
}

impl ArenaHeap {
    pub fn new() -> Self {
        Self {
            objects: boxcar::Vec::new(),
            allocated: AtomicUsize::new(0),
            limit: None,
        }
    }

    /// Create a heap that refuses allocations beyond `limit` payload bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    /// Number of objects ever allocated
    pub fn object_count(&self) -> usize {
        self.objects.count()
    }

    /// Total payload bytes allocated
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn object(&self, handle: Handle) -> Result<&HeapObject, HeapError> {
        usize::try_from(handle.to_raw())
            .ok()
            .and_then(|index| self.objects.get(index))
            .ok_or(HeapError::InvalidHandle(handle))
    }

    fn reserve(&self, size: usize) -> Result<(), HeapError> {
        let Some(limit) = self.limit else {
            self.allocated.fetch_add(size, Ordering::Relaxed);
            return Ok(());
        };
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|used| HeapError::Exhausted {
                requested: size,
                available: limit.saturating_sub(used),
            })
    }
}

impl Default for ArenaHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for ArenaHeap {
    fn allocate(&self, size: usize, tag: ObjectTag) -> Result<Handle, HeapError> {
        self.reserve(size)?;
        let index = self.objects.push(HeapObject {
            tag,
            payload: RwLock::new(vec![0u8; size].into_boxed_slice()),
        });
        Ok(Handle::from_raw(index as u64))
    }

    fn tag_of(&self, handle: Handle) -> Result<ObjectTag, HeapError> {
        Ok(self.object(handle)?.tag)
    }

    fn read(&self, handle: Handle) -> Result<Vec<u8>, HeapError> {
        let object = self.object(handle)?;
        let payload = object.payload.read().unwrap_or_else(|e| e.into_inner());
        Ok(payload.to_vec())
    }

    fn write(&self, handle: Handle, offset: usize, bytes: &[u8]) -> Result<(), HeapError> {
        let object = self.object(handle)?;
        let mut payload = object.payload.write().unwrap_or_else(|e| e.into_inner());
        let size = payload.len();
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= size)
            .ok_or(HeapError::OutOfBounds {
                offset,
                len: bytes.len(),
                size,
            })?;
        payload[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}
