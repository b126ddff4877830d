//! Device ownership tracking and the group-atomic passthrough handoff.
//!
//! A physical device is always owned by exactly one of `Host`, `Hyp`, or a
//! guest VM. Devices that share an IOMMU group move between those states
//! together — a group is the smallest unit of isolation a guest can be
//! handed, so no half-assignment is ever observable.

#![allow(dead_code)]

use alloc::collections::BTreeMap;
use heapless::Vec as HVec;
use spin::Mutex;

use pviommu_hal::{PhysSid, PhysicalAddress, VcpuHandle, VmHandle};

pub const MAX_RESOURCES: usize = 8;
pub const MAX_ENDPOINTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    NotFound,
    Denied,
    Busy,
    InvalidParam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Host,
    Hyp,
    Guest(VmHandle),
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceRange {
    pub base: PhysicalAddress,
    pub size: u64,
}

impl ResourceRange {
    fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.base && pa < self.base + self.size
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IommuEndpoint {
    pub iommu_id: u32,
    pub sid: PhysSid,
}

pub type DeviceId = u32;
pub type ResetHandler = fn(DeviceId);

pub struct Device {
    pub group_id: u32,
    pub resources: HVec<ResourceRange, MAX_RESOURCES>,
    pub iommu_endpoints: HVec<IommuEndpoint, MAX_ENDPOINTS>,
    owner: Owner,
    reset_handler: Option<ResetHandler>,
    /// Attestation token handed back by `DEV_REQ_DMA`, fixed at registration.
    attestation_token: u128,
}

impl Device {
    pub fn new(
        group_id: u32,
        resources: HVec<ResourceRange, MAX_RESOURCES>,
        iommu_endpoints: HVec<IommuEndpoint, MAX_ENDPOINTS>,
        attestation_token: u128,
    ) -> Self {
        Self { group_id, resources, iommu_endpoints, owner: Owner::Host, reset_handler: None, attestation_token }
    }
}

/// A held lock over a single device, returned by `iommu_lock`. Keeping the
/// guard alive for the duration of the caller's driver call is what makes
/// "ownership can't change mid attach/detach" hold.
pub struct DeviceGuard<'a> {
    _devices: spin::MutexGuard<'a, BTreeMap<DeviceId, Device>>,
    pub device_id: DeviceId,
}

pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<DeviceId, Device>>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self { devices: Mutex::new(BTreeMap::new()) }
    }

    /// Boot-time registration of a statically discovered device. Not part of
    /// the guest-facing ABI.
    pub fn register_device(&self, id: DeviceId, device: Device) {
        self.devices.lock().insert(id, device);
    }

    fn find_by_endpoint(devices: &BTreeMap<DeviceId, Device>, iommu_id: u32, sid: PhysSid) -> Option<DeviceId> {
        devices
            .iter()
            .find(|(_, d)| d.iommu_endpoints.iter().any(|e| e.iommu_id == iommu_id && e.sid == sid))
            .map(|(id, _)| *id)
    }

    /// Host claims a device for hypervisor-managed MMIO passthrough setup.
    /// The device must currently be host-owned and unowned by any VM.
    pub fn host_assign_mmio(&self, id: DeviceId) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock();
        let device = devices.get_mut(&id).ok_or(RegistryError::NotFound)?;
        match device.owner {
            Owner::Host => {
                device.owner = Owner::Hyp;
                Ok(())
            }
            _ => Err(RegistryError::Busy),
        }
    }

    /// Hand a device back from hyp-ownership to the host.
    pub fn reclaim_mmio(&self, id: DeviceId) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock();
        let device = devices.get_mut(&id).ok_or(RegistryError::NotFound)?;
        match device.owner {
            Owner::Hyp => {
                device.owner = Owner::Host;
                Ok(())
            }
            _ => Err(RegistryError::Busy),
        }
    }

    /// First guest touch of a device's MMIO region: every device sharing
    /// `group_id` moves from `Hyp` to `Guest(vm)` together, each is reset
    /// through its registered handler, and the resolved physical page is
    /// donated to that vCPU's stage-2. This method performs only the
    /// ownership half; the donation itself happens in the stage-2 walker,
    /// an external collaborator.
    pub fn map_guest_mmio(&self, vm: VmHandle, _vcpu: VcpuHandle, pa: PhysicalAddress) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock();
        let id = devices
            .iter()
            .find(|(_, d)| d.resources.iter().any(|r| r.contains(pa)))
            .map(|(id, _)| *id)
            .ok_or(RegistryError::NotFound)?;
        let group_id = devices.get(&id).unwrap().group_id;

        let group_ids: HVec<DeviceId, 16> = devices
            .iter()
            .filter(|(_, d)| d.group_id == group_id)
            .map(|(id, _)| *id)
            .collect();
        if group_ids.is_full() {
            return Err(RegistryError::InvalidParam);
        }
        if group_ids.iter().any(|gid| !matches!(devices.get(gid).unwrap().owner, Owner::Hyp)) {
            return Err(RegistryError::Busy);
        }
        for gid in &group_ids {
            let dev = devices.get_mut(gid).unwrap();
            dev.owner = Owner::Guest(vm);
            if let Some(reset) = dev.reset_handler {
                reset(*gid);
            }
        }
        Ok(())
    }

    /// Revoke every device a VM owns: reset it, then return it straight to
    /// `Host` ownership. Called on VM teardown; idempotent.
    pub fn teardown(&self, vm: VmHandle) {
        let mut devices = self.devices.lock();
        for (id, device) in devices.iter_mut() {
            if device.owner == Owner::Guest(vm) {
                if let Some(reset) = device.reset_handler {
                    reset(*id);
                }
                device.owner = Owner::Host;
            }
        }
    }

    /// Acquire the registry lock for the device behind `(iommu_id, sid)`,
    /// checking that `vcpu_owner` (or the host, if `None`) is entitled to
    /// operate on it. The guard must be held for the duration of the
    /// matching `ATTACH_DEV`/`DETACH_DEV` driver call.
    pub fn iommu_lock(
        &self,
        iommu_id: u32,
        sid: PhysSid,
        vcpu_owner: Option<VmHandle>,
    ) -> Result<DeviceGuard<'_>, RegistryError> {
        let devices = self.devices.lock();
        let id = Self::find_by_endpoint(&devices, iommu_id, sid).ok_or(RegistryError::NotFound)?;
        let device = devices.get(&id).unwrap();
        let entitled = match vcpu_owner {
            Some(vm) => device.owner == Owner::Guest(vm),
            None => matches!(device.owner, Owner::Host | Owner::Hyp),
        };
        if !entitled {
            return Err(RegistryError::Denied);
        }
        Ok(DeviceGuard { _devices: devices, device_id: id })
    }

    pub fn register_reset(&self, id: DeviceId, handler: ResetHandler) -> Result<(), RegistryError> {
        let mut devices = self.devices.lock();
        let device = devices.get_mut(&id).ok_or(RegistryError::NotFound)?;
        device.reset_handler = Some(handler);
        Ok(())
    }

    /// Implements the `request_mmio` operation: verify that `pa` falls
    /// within one of `vm`'s currently assigned device resources, returning
    /// it as a token the guest can hold on to. Resolving the guest's IPA to
    /// `pa` in the first place is the caller's job (the stage-2 walker), so
    /// a faulting walk surfaces as a top-up escape one level up rather than
    /// as a registry error.
    pub fn request_mmio(&self, vm: VmHandle, pa: PhysicalAddress) -> Result<DeviceId, RegistryError> {
        let devices = self.devices.lock();
        devices
            .iter()
            .find(|(_, d)| d.owner == Owner::Guest(vm) && d.resources.iter().any(|r| r.contains(pa)))
            .map(|(id, _)| *id)
            .ok_or(RegistryError::NotFound)
    }

    /// Resolve the device attached at a physical IOMMU endpoint to its
    /// attestation token, for `DEV_REQ_DMA`. Requires the endpoint's device
    /// to currently be owned by `vm` — a guest cannot query a device it
    /// does not hold.
    pub fn token_for_endpoint(&self, iommu_id: u32, sid: PhysSid, vm: VmHandle) -> Result<u128, RegistryError> {
        let devices = self.devices.lock();
        let id = Self::find_by_endpoint(&devices, iommu_id, sid).ok_or(RegistryError::NotFound)?;
        let device = devices.get(&id).unwrap();
        if device.owner != Owner::Guest(vm) {
            return Err(RegistryError::Denied);
        }
        Ok(device.attestation_token)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
