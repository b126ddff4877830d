#![no_std]

//! Root glue crate: re-exports the pvIOMMU dispatcher core and its hardware
//! abstraction layer as a single consumable crate for a hypervisor build.

pub use pviommu_core as core;
pub use pviommu_hal as hal;
