//! Per-VM vSID routing: `(viommu_id, vsid) -> (phys_iommu_id, phys_sid)`.
//!
//! A VM's route table is built up one `attach` call at a time while the VM
//! is being constructed, then frozen with `finalise`. After that point every
//! `route` lookup only ever takes a read lock, so steady-state hypercalls
//! never contend with a writer — there is no writer left to contend with.

#![allow(dead_code)]

use alloc::collections::BTreeMap;
use heapless::Vec as HVec;
use spin::RwLock;

use pviommu_hal::VmHandle;

pub const MAX_VIOMMUS: usize = 16;
pub const MAX_SIDS_PER_VIOMMU: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    Full,
    AlreadyFinalised,
    NotFound,
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
struct SidEntry {
    vsid: u32,
    phys_iommu_id: u32,
    phys_sid: u32,
}

struct ViommuEntry {
    viommu_id: u32,
    sids: HVec<SidEntry, MAX_SIDS_PER_VIOMMU>,
}

#[derive(Default)]
struct VmRoutes {
    viommus: HVec<ViommuEntry, MAX_VIOMMUS>,
    finalised: bool,
}

impl VmRoutes {
    fn find_mut(&mut self, viommu_id: u32) -> Option<&mut ViommuEntry> {
        self.viommus.iter_mut().find(|v| v.viommu_id == viommu_id)
    }

    fn find(&self, viommu_id: u32) -> Option<&ViommuEntry> {
        self.viommus.iter().find(|v| v.viommu_id == viommu_id)
    }
}

pub struct RouteTable {
    vms: RwLock<BTreeMap<VmHandle, VmRoutes>>,
}

impl RouteTable {
    pub const fn new() -> Self {
        Self { vms: RwLock::new(BTreeMap::new()) }
    }

    /// Declare that guest `viommu_id` will exist for `vm`, creating an empty
    /// entry for it if this is the first mention. Idempotent: attaching the
    /// same viommu twice is not an error, it just has no further effect.
    /// Must happen before any `add_vsid` targeting that viommu.
    pub fn attach(&self, vm: VmHandle, viommu_id: u32) -> Result<(), RouteError> {
        let mut vms = self.vms.write();
        let routes = vms.entry(vm).or_default();
        if routes.finalised {
            return Err(RouteError::AlreadyFinalised);
        }
        if routes.find(viommu_id).is_some() {
            return Ok(());
        }
        routes
            .viommus
            .push(ViommuEntry { viommu_id, sids: HVec::new() })
            .map_err(|_| RouteError::Full)
    }

    /// Add one `(viommu_id, vsid) -> (phys_iommu_id, phys_sid)` route for a
    /// VM that has not yet been finalised. `viommu_id` must already have
    /// been declared with `attach`.
    pub fn add_vsid(
        &self,
        vm: VmHandle,
        viommu_id: u32,
        phys_iommu_id: u32,
        phys_sid: u32,
        vsid: u32,
    ) -> Result<(), RouteError> {
        let mut vms = self.vms.write();
        let routes = vms.entry(vm).or_default();
        if routes.finalised {
            return Err(RouteError::AlreadyFinalised);
        }
        let viommu = routes.find_mut(viommu_id).ok_or(RouteError::NotFound)?;
        if viommu.sids.iter().any(|s| s.vsid == vsid) {
            return Err(RouteError::Duplicate);
        }
        viommu
            .sids
            .push(SidEntry { vsid, phys_iommu_id, phys_sid })
            .map_err(|_| RouteError::Full)
    }

    /// Freeze a VM's route table. No further `attach`/`add_vsid` calls
    /// succeed for this VM after this point.
    pub fn finalise(&self, vm: VmHandle) {
        let mut vms = self.vms.write();
        if let Some(routes) = vms.get_mut(&vm) {
            routes.finalised = true;
        }
    }

    /// Resolve a guest-presented `(viommu_id, vsid)` to the physical
    /// endpoint it routes to. Only ever takes a read lock.
    pub fn route(&self, vm: VmHandle, viommu_id: u32, vsid: u32) -> Result<(u32, u32), RouteError> {
        let vms = self.vms.read();
        let routes = vms.get(&vm).ok_or(RouteError::NotFound)?;
        let viommu = routes.find(viommu_id).ok_or(RouteError::NotFound)?;
        viommu
            .sids
            .iter()
            .find(|s| s.vsid == vsid)
            .map(|s| (s.phys_iommu_id, s.phys_sid))
            .ok_or(RouteError::NotFound)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_resolves_what_was_attached() {
        let table = RouteTable::new();
        table.attach(1, 0).unwrap();
        table.add_vsid(1, 0, 3, 70, 7).unwrap();
        table.finalise(1);
        assert_eq!(table.route(1, 0, 7), Ok((3, 70)));
    }

    #[test]
    fn route_is_scoped_per_vm() {
        let table = RouteTable::new();
        table.attach(1, 0).unwrap();
        table.add_vsid(1, 0, 3, 70, 7).unwrap();
        table.finalise(1);
        assert_eq!(table.route(2, 0, 7), Err(RouteError::NotFound));
    }

    #[test]
    fn cannot_add_vsid_after_finalise() {
        let table = RouteTable::new();
        table.attach(1, 0).unwrap();
        table.add_vsid(1, 0, 3, 70, 7).unwrap();
        table.finalise(1);
        assert_eq!(table.add_vsid(1, 0, 3, 71, 8), Err(RouteError::AlreadyFinalised));
    }

    #[test]
    fn duplicate_vsid_rejected() {
        let table = RouteTable::new();
        table.attach(1, 0).unwrap();
        table.add_vsid(1, 0, 3, 70, 7).unwrap();
        assert_eq!(table.add_vsid(1, 0, 3, 71, 7), Err(RouteError::Duplicate));
    }

    #[test]
    fn add_vsid_without_attach_is_not_found() {
        let table = RouteTable::new();
        assert_eq!(table.add_vsid(1, 0, 3, 70, 7), Err(RouteError::NotFound));
    }

    #[test]
    fn attach_is_idempotent() {
        let table = RouteTable::new();
        table.attach(1, 0).unwrap();
        table.attach(1, 0).unwrap();
        table.add_vsid(1, 0, 3, 70, 7).unwrap();
        assert_eq!(table.route(1, 0, 7), Ok((3, 70)));
    }
}
