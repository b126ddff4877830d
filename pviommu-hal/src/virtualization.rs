//! VM identity types shared between the route table, the device registry
//! and the hypercall dispatcher.
//!
//! The pvIOMMU core does not create or destroy VMs itself — that is the
//! surrounding hypervisor's job — so this module only carries the handle
//! type the rest of the crate keys its per-VM state on.

/// Opaque handle identifying a guest VM, stable for its lifetime.
pub type VmHandle = u32;

/// Opaque handle identifying a vCPU within a VM's address space of vCPU ids.
/// Per-vCPU state (memcache, pending memory-top-up request) is keyed on
/// this, not on a raw core id, so migration of a vCPU across physical
/// cores does not invalidate it.
pub type VcpuHandle = u32;
