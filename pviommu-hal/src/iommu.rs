//! The underlying IOMMU driver contract (Task: pvIOMMU driver capability set).
//!
//! This crate does not implement VT-d/SMMU/RISC-V IOMMU register programming
//! — that hardware driver is a separate, untrusted-adjacent component the
//! pvIOMMU core merely calls into. What lives here is the capability-set
//! interface the core dispatches against, so drivers can register at init
//! without the core ever assuming a single implementation.

#![allow(dead_code)]

use bitflags::bitflags;
use crate::memory::{IovaAddress, PhysicalAddress};

/// Identifies one physical IOMMU instance discovered at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalIommu {
    pub iommu_id: u32,
    /// Bitmap of page sizes the hardware itself supports. The dispatcher
    /// never hands this straight to a guest — see `FEATURE_PGSZ_BITMAP` in
    /// `pviommu_core::abi`.
    pub page_size_bitmap: u64,
}

/// A translation regime (page-table root) in IOMMU parlance, as the driver
/// itself numbers it. The driver's numbering is independent of the
/// pvIOMMU-level domain id space the dispatcher hands out to guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysDomainId(pub u32);

/// Physical stream identifier — per-endpoint tag selecting a translation
/// regime within a `PhysicalIommu`.
pub type PhysSid = u32;

/// Domain translation regime kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainType {
    /// Opaque to the driver: no guarantee of identity mapping, no bypass.
    Unmanaged,
    /// DMA-remapping domain suitable for device passthrough.
    Dma,
}

bitflags! {
    /// Driver-facing protection bits, distinct from the wire-level bitmask
    /// a guest presents in its hypercall registers (see
    /// `pviommu_core::abi::Prot`). The dispatcher translates one into the
    /// other so the wire format and the driver ABI can evolve independently.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverProt: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const CACHE  = 1 << 2;
        const NOEXEC = 1 << 3;
        const MMIO   = 1 << 4;
        const PRIV   = 1 << 5;
    }
}

/// Errors the underlying driver may return. The dispatcher never leaks one
/// of these to a guest verbatim — every variant maps to a wire return code
/// or, for `OutOfMemory`, to the memory-top-up escape instead of a return
/// at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    OutOfMemory,
    InvalidParam,
    NotFound,
    AlreadyAttached,
    NotAttached,
    Busy,
}

/// Capability set implemented by an architecture-specific IOMMU backend.
///
/// Implementations register once at boot and are invoked purely through
/// physical identifiers — every guest-visible id has already been
/// translated away by the time a call reaches here.
pub trait IommuDriver: Send + Sync {
    /// Allocate a new domain of the given type, returning the driver's own
    /// physical domain id.
    fn alloc_domain(&self, iommu: u32, kind: DomainType) -> Result<PhysDomainId, DriverError>;

    /// Free a domain. Drivers must refuse (`InvalidParam`) if mappings or
    /// attached devices remain — the core relies on this to uphold the
    /// "domain must be empty at free time" invariant.
    fn free_domain(&self, iommu: u32, domain: PhysDomainId) -> Result<(), DriverError>;

    fn attach_dev(
        &self,
        iommu: u32,
        domain: PhysDomainId,
        sid: PhysSid,
        pasid: u32,
        pasid_bits: u8,
    ) -> Result<(), DriverError>;

    fn detach_dev(
        &self,
        iommu: u32,
        domain: PhysDomainId,
        sid: PhysSid,
        pasid: u32,
    ) -> Result<(), DriverError>;

    /// Map `count` pages of `pgsize` starting at `iova` to the physical page
    /// at `pa`, returning the number of bytes actually mapped. `Err(OutOfMemory)`
    /// means the driver itself ran out of page-table memory (distinct from a
    /// hard `InvalidParam` failure) — the dispatcher turns that into the
    /// memory-top-up escape rather than a wire error.
    fn map_pages(
        &self,
        domain: PhysDomainId,
        iova: IovaAddress,
        pa: PhysicalAddress,
        pgsize: u64,
        count: u64,
        prot: DriverProt,
    ) -> Result<u64, DriverError>;

    /// Unmap `count` pages of `pgsize` starting at `iova`, returning the
    /// number of bytes actually unmapped. Splitting a large page-table leaf
    /// to unmap a sub-range can itself need fresh page-table memory, so this
    /// can fail with `OutOfMemory` too.
    fn unmap_pages(&self, domain: PhysDomainId, iova: IovaAddress, pgsize: u64, count: u64) -> Result<u64, DriverError>;
}
