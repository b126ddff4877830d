//! Wire format for the vendor hypercall ABI: function ids, argument layout,
//! return codes and protection bits. Everything here is guest-visible and
//! frozen once a guest ships against it — change it and you break a live
//! kernel driver.

#![allow(dead_code)]

use bitflags::bitflags;

/// ABI version returned by `VERSION`. Bumped only on a breaking wire change.
pub const VERSION: u64 = 0x1000;

/// `GET_FEATURE` selector for the page-size bitmap the dispatcher actually
/// honours — which is *not* the same bitmap the underlying hardware reports
/// (see `pviommu_hal::iommu::PhysicalIommu::page_size_bitmap`). This crate
/// standardises on the `FEATURE_PGSZ_BITMAP` spelling; an earlier revision
/// of this ABI table called it `FEAUTRE_PGSZ_BITMAP` and that spelling must
/// not be emitted anywhere a guest driver might bind to it by name.
pub const FEATURE_PGSZ_BITMAP: u64 = 0x1;

/// Vendor hypercall function ids (HVC64 calling convention, SMC64/HVC64
/// vendor-hyp-service range). `UNMAP` and `ATTACH_DEV` collided at
/// `0xC6000021` in an earlier draft of this table; this build resolves the
/// collision by giving `ATTACH_DEV` the first unused id above `DEV_REQ_DMA`
/// rather than guessing at an upstream value that was never published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HypercallId {
    Map = 0xC600_0020,
    Unmap = 0xC600_0021,
    DetachDev = 0xC600_0022,
    Version = 0xC600_0023,
    GetFeature = 0xC600_0024,
    AllocDomain = 0xC600_0025,
    FreeDomain = 0xC600_0026,
    DevReqDma = 0xC600_0027,
    AttachDev = 0xC600_0028,
}

impl HypercallId {
    pub fn from_raw(id: u32) -> Option<Self> {
        Some(match id {
            0xC600_0020 => Self::Map,
            0xC600_0021 => Self::Unmap,
            0xC600_0022 => Self::DetachDev,
            0xC600_0023 => Self::Version,
            0xC600_0024 => Self::GetFeature,
            0xC600_0025 => Self::AllocDomain,
            0xC600_0026 => Self::FreeDomain,
            0xC600_0027 => Self::DevReqDma,
            0xC600_0028 => Self::AttachDev,
            _ => return None,
        })
    }
}

bitflags! {
    /// Protection bits as a guest presents them in a `MAP` call's argument
    /// register. Translated to `pviommu_hal::iommu::DriverProt` before the
    /// underlying driver ever sees them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const CACHE  = 1 << 2;
        const NOEXEC = 1 << 3;
        const MMIO   = 1 << 4;
        const PRIV   = 1 << 5;
    }
}

/// Wire-level return codes written into `r0`. Every handler outcome except
/// the memory-top-up escape maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum WireStatus {
    Ok = 0,
    NotSupported = -1,
    NotRequired = -2,
    InvalidParam = -3,
}

impl WireStatus {
    pub fn as_r0(self) -> i64 {
        self as i64
    }
}

/// Raw hypercall argument registers, decoded verbatim from the trap.
#[derive(Debug, Clone, Copy, Default)]
pub struct HypercallArgs {
    pub r1: u64,
    pub r2: u64,
    pub r3: u64,
    pub r4: u64,
    pub r5: u64,
    pub r6: u64,
}

/// Result registers a successful (or cleanly failed) call writes back.
#[derive(Debug, Clone, Copy, Default)]
pub struct HypercallResult {
    pub r0: i64,
    pub r1: u64,
    pub r2: u64,
    pub r3: u64,
}

impl HypercallResult {
    pub fn ok() -> Self {
        Self { r0: WireStatus::Ok.as_r0(), r1: 0, r2: 0, r3: 0 }
    }

    pub fn status(status: WireStatus) -> Self {
        Self { r0: status.as_r0(), r1: 0, r2: 0, r3: 0 }
    }
}
