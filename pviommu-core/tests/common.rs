//! Shared mock driver/walker used across integration tests.

extern crate std;

use std::cell::Cell;

use pviommu_hal::{
    DomainType, DriverError, DriverProt, IommuDriver, PhysDomainId, PhysSid, Stage2Error,
    Stage2Leaf, Stage2Walker,
};

/// An `IommuDriver` that identity-maps every call and never fails, for
/// tests that only care about dispatcher-level bookkeeping.
pub struct FakeDriver {
    next_domain: Cell<u32>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self { next_domain: Cell::new(1) }
    }
}

impl IommuDriver for FakeDriver {
    fn alloc_domain(&self, _iommu: u32, _kind: DomainType) -> Result<PhysDomainId, DriverError> {
        let id = self.next_domain.get();
        self.next_domain.set(id + 1);
        Ok(PhysDomainId(id))
    }

    fn free_domain(&self, _iommu: u32, _domain: PhysDomainId) -> Result<(), DriverError> {
        Ok(())
    }

    fn attach_dev(&self, _iommu: u32, _domain: PhysDomainId, _sid: PhysSid, _pasid: u32, _bits: u8) -> Result<(), DriverError> {
        Ok(())
    }

    fn detach_dev(&self, _iommu: u32, _domain: PhysDomainId, _sid: PhysSid, _pasid: u32) -> Result<(), DriverError> {
        Ok(())
    }

    fn map_pages(&self, _domain: PhysDomainId, _iova: u64, _pa: u64, pgsize: u64, count: u64, _prot: DriverProt) -> Result<u64, DriverError> {
        Ok(pgsize * count)
    }

    fn unmap_pages(&self, _domain: PhysDomainId, _iova: u64, pgsize: u64, count: u64) -> Result<u64, DriverError> {
        Ok(pgsize * count)
    }
}

/// A `Stage2Walker` that treats every IPA as identity-mapped to the same PA.
pub struct IdentityWalker;

impl Stage2Walker for IdentityWalker {
    fn get_leaf(&self, ipa: u64) -> Result<Stage2Leaf, Stage2Error> {
        Ok(Stage2Leaf { pa: ipa, level: 0 })
    }
}

/// A `Stage2Walker` that never has a backing page, for exercising the
/// memory-top-up escape from the `MAP` path.
pub struct UnbackedWalker;

impl Stage2Walker for UnbackedWalker {
    fn get_leaf(&self, _ipa: u64) -> Result<Stage2Leaf, Stage2Error> {
        Err(Stage2Error::NotMapped)
    }
}
