//! Address type aliases shared across the pvIOMMU HAL surface.

/// Host physical address.
pub type PhysicalAddress = u64;

/// Guest intermediate physical address (stage-2 output of the *guest's*
/// own stage-1, i.e. what the guest calls "physical").
pub type IpaAddress = u64;

/// Guest I/O virtual address, as presented to the device by the guest.
pub type IovaAddress = u64;

/// The only page granule the pvIOMMU core ever promises a guest: 4 KiB.
///
/// Guest IPA contiguity says nothing about host PA contiguity, so the
/// dispatcher never advertises or accepts a larger granule (see
/// `pviommu_core::abi::FEATURE_PGSZ_BITMAP`).
pub const PAGE_SIZE: u64 = 4096;
