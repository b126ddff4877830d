#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Hardware abstraction layer for the pvIOMMU hypervisor core.
//!
//! This crate carries only the contracts the pvIOMMU core dispatches
//! against: the underlying IOMMU driver capability set, the guest stage-2
//! walker, and the small set of address/handle types both sides share.
//! Everything architecture-specific (VT-d/SMMU/RISC-V IOMMU register
//! programming, the stage-2 page-table implementation itself) lives
//! outside this crate — see `pviommu_core::dispatcher` for how the core
//! treats them as external collaborators.

extern crate alloc;

pub mod iommu;
pub mod memory;
pub mod stage2;
pub mod trap;
pub mod virtualization;

pub use iommu::{DomainType, DriverError, DriverProt, IommuDriver, PhysDomainId, PhysSid, PhysicalIommu};
pub use memory::{IovaAddress, IpaAddress, PhysicalAddress, PAGE_SIZE};
pub use stage2::{Stage2Error, Stage2Leaf, Stage2Walker};
pub use trap::GuestTrapContext;
pub use virtualization::{VcpuHandle, VmHandle};

/// HAL-level initialization errors, surfaced by `pviommu_core::init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    NoDriverRegistered,
    NoStage2WalkerRegistered,
}
