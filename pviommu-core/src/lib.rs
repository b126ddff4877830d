#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Hypervisor-side pvIOMMU core: the trusted mediator between an untrusted
//! host and guest VMs with passthrough devices.
//!
//! A guest never programs IOMMU translation tables directly — every change
//! goes through the nine hypercalls this crate dispatches, each validated
//! against per-VM state the host cannot see or tamper with: [`domain`]'s id
//! allocator, [`route`]'s vSID routing table, and [`registry`]'s device
//! ownership tracker. [`dispatcher::HypercallDispatcher`] ties the three
//! together and owns the memory-top-up escape protocol that lets a handler
//! run out of page-table memory mid-call without ever exposing a partial,
//! observable failure to the guest.
//!
//! The underlying IOMMU hardware driver and the guest's own stage-2 page
//! tables are external collaborators, reached only through the
//! `pviommu_hal::IommuDriver` and `pviommu_hal::Stage2Walker` contracts —
//! this crate never assumes a specific vendor or architecture.

extern crate alloc;

pub mod abi;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod log;
pub mod memcache;
pub mod registry;
pub mod route;

pub use dispatcher::HypercallDispatcher;
pub use error::Error;

/// Construct a fresh dispatcher bound to a single underlying driver
/// instance. Registering VMs' stage-2 walkers and the host's static device
/// table happens afterwards, through the dispatcher's own API.
pub fn init(driver: &dyn pviommu_hal::IommuDriver) -> HypercallDispatcher<'_> {
    log!("pviommu-core: dispatcher initialised (abi version {:#x})", abi::VERSION);
    HypercallDispatcher::new(driver)
}
