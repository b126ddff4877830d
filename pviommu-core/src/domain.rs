//! Guest-half domain id allocation and the per-domain ownership table.
//!
//! The id space is a single fixed-size bitmap split in half: the lower half
//! is reserved for host-managed (non-guest) domains the dispatcher never
//! touches, the upper half is handed out to guests one vsid-routing session
//! at a time. The two halves must never overlap — that is the one
//! structural invariant this module exists to protect.

#![allow(dead_code)]

use alloc::collections::BTreeMap;
use spin::Mutex;

use pviommu_hal::{DomainType, PhysDomainId, VmHandle};

/// Total addressable domain ids. A power of two keeps the bitmap math cheap;
/// the value itself is not guest-visible.
pub const TOTAL_DOMAINS: usize = 1024;
const WORDS: usize = TOTAL_DOMAINS / 64;

/// First id in the guest-allocatable half. Anything below this is reserved
/// for host/hyp-internal domains this allocator never hands out and never
/// frees.
pub const GUEST_BASE: u32 = (TOTAL_DOMAINS / 2) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainError {
    Busy,
    NotFound,
    OutOfMem,
    InvalidParam,
}

/// A single guest-owned domain: the id a guest knows it by, which VM owns
/// it, what kind of translation regime it is, and the underlying driver's
/// own handle for it.
#[derive(Debug, Clone, Copy)]
pub struct GuestDomain {
    pub domain_id: u32,
    pub owner: VmHandle,
    pub kind: DomainType,
    pub phys: PhysDomainId,
}

struct State {
    bitmap: [u64; WORDS],
    domains: BTreeMap<u32, GuestDomain>,
}

impl State {
    fn reserve_bit(&mut self) -> Option<u32> {
        for word_idx in (GUEST_BASE as usize / 64)..WORDS {
            let word = self.bitmap[word_idx];
            if word != u64::MAX {
                let bit = word.trailing_ones();
                let id = (word_idx as u32) * 64 + bit;
                self.bitmap[word_idx] |= 1 << bit;
                return Some(id);
            }
        }
        None
    }

    fn release_bit(&mut self, id: u32) {
        if id < GUEST_BASE || id as usize >= TOTAL_DOMAINS {
            crate::log!("pviommu-core: domain.rs: refusing to release out-of-range domain id {id}");
            return;
        }
        let word_idx = (id / 64) as usize;
        let bit = id % 64;
        self.bitmap[word_idx] &= !(1 << bit);
    }
}

/// The single lock guarding both the bitmap and the ownership table, so
/// `ALLOC_DOMAIN`/`FREE_DOMAIN` commit id and metadata atomically together.
pub struct DomainIdAllocator {
    inner: Mutex<State>,
}

impl DomainIdAllocator {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(State { bitmap: [0; WORDS], domains: BTreeMap::new() }),
        }
    }

    /// Reserve a guest-half id, call `driver_alloc` with it while still
    /// holding the lock, and either commit the new domain's metadata or roll
    /// the id back — the id is never left reserved across a failed driver
    /// call. `driver_alloc` mapping to `DriverError::OutOfMemory` becomes
    /// `DomainError::OutOfMem`, which the dispatcher turns into a top-up
    /// escape rather than a wire error.
    pub fn alloc<F>(&self, owner: VmHandle, kind: DomainType, driver_alloc: F) -> Result<u32, DomainError>
    where
        F: FnOnce(u32) -> Result<PhysDomainId, pviommu_hal::DriverError>,
    {
        let mut state = self.inner.lock();
        let id = state.reserve_bit().ok_or(DomainError::Busy)?;
        match driver_alloc(id) {
            Ok(phys) => {
                state.domains.insert(id, GuestDomain { domain_id: id, owner, kind, phys });
                Ok(id)
            }
            Err(pviommu_hal::DriverError::OutOfMemory) => {
                state.release_bit(id);
                Err(DomainError::OutOfMem)
            }
            Err(_) => {
                state.release_bit(id);
                Err(DomainError::InvalidParam)
            }
        }
    }

    /// Ask the driver to free `id`'s underlying domain and, only on success,
    /// drop the metadata and release the bit. A driver refusal (mappings or
    /// attached devices still present) leaves everything exactly as it was.
    pub fn free<F>(&self, id: u32, owner: VmHandle, driver_free: F) -> Result<(), DomainError>
    where
        F: FnOnce(PhysDomainId) -> Result<(), pviommu_hal::DriverError>,
    {
        let mut state = self.inner.lock();
        let dom = *state.domains.get(&id).ok_or(DomainError::NotFound)?;
        if dom.owner != owner {
            return Err(DomainError::NotFound);
        }
        match driver_free(dom.phys) {
            Ok(()) => {
                state.domains.remove(&id);
                state.release_bit(id);
                Ok(())
            }
            Err(_) => Err(DomainError::InvalidParam),
        }
    }

    /// Look up a guest domain by id, verifying it belongs to `owner`. Used
    /// by `ATTACH_DEV`/`MAP`/`UNMAP` to resolve a guest-presented domain id
    /// to the driver's own handle without ever trusting the guest to police
    /// which VM a domain belongs to.
    pub fn lookup(&self, id: u32, owner: VmHandle) -> Option<GuestDomain> {
        let state = self.inner.lock();
        state.domains.get(&id).copied().filter(|d| d.owner == owner)
    }
}

impl Default for DomainIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_alloc(_id: u32) -> Result<PhysDomainId, pviommu_hal::DriverError> {
        Ok(PhysDomainId(0))
    }

    #[test]
    fn allocated_ids_stay_in_guest_half() {
        let alloc = DomainIdAllocator::new();
        for _ in 0..8 {
            let id = alloc.alloc(1, DomainType::Dma, ok_alloc).unwrap();
            assert!(id >= GUEST_BASE);
        }
    }

    #[test]
    fn free_rejects_wrong_owner() {
        let alloc = DomainIdAllocator::new();
        let id = alloc.alloc(1, DomainType::Dma, ok_alloc).unwrap();
        let result = alloc.free(id, 2, |_| Ok(()));
        assert_eq!(result, Err(DomainError::NotFound));
    }

    #[test]
    fn free_rolls_back_on_driver_refusal() {
        let alloc = DomainIdAllocator::new();
        let id = alloc.alloc(1, DomainType::Dma, ok_alloc).unwrap();
        let result = alloc.free(id, 1, |_| Err(pviommu_hal::DriverError::Busy));
        assert_eq!(result, Err(DomainError::InvalidParam));
        assert!(alloc.lookup(id, 1).is_some());
    }

    #[test]
    fn alloc_failure_releases_the_id() {
        let alloc = DomainIdAllocator::new();
        let before = alloc.alloc(1, DomainType::Dma, ok_alloc).unwrap();
        alloc.free(before, 1, |_| Ok(())).unwrap();
        let id = alloc
            .alloc(2, DomainType::Dma, |_| Err(pviommu_hal::DriverError::OutOfMemory))
            .unwrap_err();
        assert_eq!(id, DomainError::OutOfMem);
        // the id must have been released, so a fresh alloc can reuse it
        let reused = alloc.alloc(2, DomainType::Dma, ok_alloc).unwrap();
        assert_eq!(reused, before);
    }
}
