//! Host-staged memory regions.
//!
//! The `*_from_memory` sandbox operations take an address instead of a byte
//! slice. Addresses are handed out by [`MemoryMap::stage`] and only ever
//! resolve to bytes the host registered; the sandbox never dereferences raw
//! host pointers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// First address handed out by a fresh map.
pub const BASE_ADDRESS: u64 = 0x2000_0000;

const ALIGN: u64 = 16;

/// Errors from reading staged memory.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// No region starts at or contains the address.
    #[error("address {0:#x} is not mapped")]
    Unmapped(u64),

    /// The requested range runs past the end of its region.
    #[error("read of {len} bytes at {address:#x} runs past region end {end:#x}")]
    OutOfBounds {
        /// Start of the read.
        address: u64,
        /// Requested length.
        len: u64,
        /// First address past the region.
        end: u64,
    },

    /// The address space is used up.
    #[error("staging address space exhausted")]
    Exhausted,
}

#[derive(Default)]
struct Regions {
    next: u64,
    regions: BTreeMap<u64, Arc<[u8]>>,
}

impl Regions {
    /// The region containing `address`, with its start.
    fn containing(&self, address: u64) -> Option<(u64, &Arc<[u8]>)> {
        let (&start, bytes) = self.regions.range(..=address).next_back()?;
        (address < start + bytes.len() as u64).then_some((start, bytes))
    }
}

/// A registry of byte regions at synthetic addresses.
///
/// Cloning yields another handle to the same regions.
#[derive(Clone, Default)]
pub struct MemoryMap {
    inner: Arc<RwLock<Regions>>,
}

impl MemoryMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a copy of `bytes` and return its address.
    ///
    /// Addresses are non-zero, 16-byte aligned and never reused.
    ///
    /// # Errors
    ///
    /// [`MemoryError::Exhausted`] once addresses no longer fit in an `i64`.
    pub fn stage(&self, bytes: &[u8]) -> Result<i64, MemoryError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let address = if inner.next == 0 { BASE_ADDRESS } else { inner.next };
        let len = bytes.len() as u64;
        let next = address
            .checked_add(len.max(1))
            .and_then(|end| end.checked_next_multiple_of(ALIGN))
            .ok_or(MemoryError::Exhausted)?;
        let signed = i64::try_from(address).map_err(|_| MemoryError::Exhausted)?;
        inner.next = next;
        inner.regions.insert(address, Arc::from(bytes));
        tracing::trace!(address, len, "staged region");
        Ok(signed)
    }

    /// Remove the region starting at `address`. Returns whether one existed.
    pub fn unstage(&self, address: i64) -> bool {
        let Ok(address) = u64::try_from(address) else {
            return false;
        };
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.regions.remove(&address).is_some()
    }

    /// Copy `len` bytes starting at `address`.
    ///
    /// The address may point anywhere inside a region, but the whole range
    /// must lie within that one region.
    ///
    /// # Errors
    ///
    /// [`MemoryError::Unmapped`] or [`MemoryError::OutOfBounds`].
    pub fn read(&self, address: u64, len: u64) -> Result<Vec<u8>, MemoryError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let (start, bytes) = inner
            .containing(address)
            .ok_or(MemoryError::Unmapped(address))?;
        let end = start + bytes.len() as u64;
        if address.checked_add(len).is_none_or(|stop| stop > end) {
            return Err(MemoryError::OutOfBounds { address, len, end });
        }
        let offset = (address - start) as usize;
        Ok(bytes[offset..offset + len as usize].to_vec())
    }

    /// Copy everything from `address` to the end of its region.
    ///
    /// # Errors
    ///
    /// [`MemoryError::Unmapped`] if no region contains `address`.
    pub fn read_from(&self, address: u64) -> Result<Vec<u8>, MemoryError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let (start, bytes) = inner
            .containing(address)
            .ok_or(MemoryError::Unmapped(address))?;
        Ok(bytes[(address - start) as usize..].to_vec())
    }

    /// Number of staged regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .regions
            .len()
    }

    /// Whether no regions are staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMap")
            .field("regions", &self.len())
            .finish_non_exhaustive()
    }
}
