//! The hypercall dispatcher: the one place all nine vendor calls land.
//!
//! Every entry point goes through the same preamble — top up the vCPU's
//! memcache, then check whether a prior call left an unserviced top-up
//! request before doing anything else — and every handler that can run out
//! of page-table memory exits through the same escape rather than returning
//! a wire error for it.

#![allow(dead_code)]

use alloc::collections::BTreeMap;
use spin::Mutex;

use pviommu_hal::{
    DriverProt, GuestTrapContext, IommuDriver, Stage2Error, Stage2Walker, VcpuHandle, VmHandle,
    PAGE_SIZE,
};

use crate::abi::{HypercallArgs, HypercallId, HypercallResult, Prot, WireStatus, FEATURE_PGSZ_BITMAP, VERSION};
use crate::domain::DomainIdAllocator;
use crate::error::Error;
use crate::memcache::{MemCache, MemTopUpRequest};
use crate::registry::{DeviceRegistry, RegistryError};
use crate::route::RouteTable;

/// Pages the host deposits for a vCPU's memcache on every hypercall entry,
/// separate from any top-up triggered by an escape. This build assumes a
/// single default physical IOMMU instance for domain allocation — attaching
/// a domain to a device behind a different instance is rejected with
/// `InvalidParam`, not silently misrouted.
const ENTRY_REFILL_PAGES: usize = 1;
const DEFAULT_IOMMU: u32 = 0;

enum DispatchError {
    Wire(Error),
    TopUp(MemTopUpRequest),
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound => Error::NotFound,
            RegistryError::Denied => Error::Denied,
            RegistryError::Busy => Error::Busy,
            RegistryError::InvalidParam => Error::InvalidParam,
        }
    }
}

pub struct HypercallDispatcher<'d> {
    pub domains: DomainIdAllocator,
    pub routes: RouteTable,
    pub registry: DeviceRegistry,
    pub memcache: MemCache,
    driver: &'d dyn IommuDriver,
    walkers: Mutex<BTreeMap<VmHandle, &'d dyn Stage2Walker>>,
}

impl<'d> HypercallDispatcher<'d> {
    pub fn new(driver: &'d dyn IommuDriver) -> Self {
        Self {
            domains: DomainIdAllocator::new(),
            routes: RouteTable::new(),
            registry: DeviceRegistry::new(),
            memcache: MemCache::new(),
            driver,
            walkers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Associate a VM with the stage-2 walker that resolves its IPAs. Must
    /// be called before any `MAP` or `DEV_REQ_DMA` call for that VM.
    pub fn register_stage2_walker(&self, vm: VmHandle, walker: &'d dyn Stage2Walker) {
        self.walkers.lock().insert(vm, walker);
    }

    pub fn teardown_vm(&self, vm: VmHandle) {
        self.registry.teardown(vm);
        self.walkers.lock().remove(&vm);
    }

    /// Entry point for every trapped hypercall. Writes a result (or
    /// rewinds the PC for a top-up escape) into `ctx` before returning —
    /// never both.
    pub fn dispatch(
        &self,
        vm: VmHandle,
        vcpu: VcpuHandle,
        func_id: u32,
        args: HypercallArgs,
        ctx: &mut dyn GuestTrapContext,
    ) {
        self.memcache.refill(vcpu, ENTRY_REFILL_PAGES);

        if self.memcache.pending(vcpu).is_some() {
            ctx.rewind_pc();
            return;
        }

        let outcome = match HypercallId::from_raw(func_id) {
            Some(id) => self.handle(vm, vcpu, id, args),
            None => Err(DispatchError::Wire(Error::Unsupported)),
        };

        match outcome {
            Ok(result) => ctx.set_return(result.r0, result.r1, result.r2, result.r3),
            Err(DispatchError::Wire(e)) => {
                let result = HypercallResult::status(e.wire_status());
                ctx.set_return(result.r0, result.r1, result.r2, result.r3);
            }
            Err(DispatchError::TopUp(request)) => {
                self.memcache.set_pending(vcpu, request);
                ctx.rewind_pc();
            }
        }
    }

    fn handle(
        &self,
        vm: VmHandle,
        vcpu: VcpuHandle,
        id: HypercallId,
        args: HypercallArgs,
    ) -> Result<HypercallResult, DispatchError> {
        match id {
            HypercallId::Version => Ok(self.version()),
            HypercallId::GetFeature => self.get_feature(args),
            HypercallId::AllocDomain => self.alloc_domain(vm),
            HypercallId::FreeDomain => self.free_domain(vm, args),
            HypercallId::AttachDev => self.attach_dev(vm, args),
            HypercallId::DetachDev => self.detach_dev(vm, args),
            HypercallId::Map => self.map(vm, args),
            HypercallId::Unmap => self.unmap(vm, args),
            HypercallId::DevReqDma => self.dev_req_dma(vm, args),
        }
    }

    fn version(&self) -> HypercallResult {
        HypercallResult { r0: WireStatus::Ok.as_r0(), r1: VERSION, r2: 0, r3: 0 }
    }

    fn get_feature(&self, args: HypercallArgs) -> Result<HypercallResult, DispatchError> {
        // args.r1 is the viommu id; this build's feature set does not vary
        // per viommu, so only the selector in r2 matters.
        if args.r2 == FEATURE_PGSZ_BITMAP {
            Ok(HypercallResult { r0: WireStatus::Ok.as_r0(), r1: PAGE_SIZE, r2: 0, r3: 0 })
        } else {
            Err(DispatchError::Wire(Error::Unsupported))
        }
    }

    fn alloc_domain(&self, vm: VmHandle) -> Result<HypercallResult, DispatchError> {
        let driver = self.driver;
        match self.domains.alloc(vm, pviommu_hal::DomainType::Dma, |_id| {
            driver.alloc_domain(DEFAULT_IOMMU, pviommu_hal::DomainType::Dma)
        }) {
            Ok(domain_id) => Ok(HypercallResult { r0: WireStatus::Ok.as_r0(), r1: domain_id as u64, r2: 0, r3: 0 }),
            Err(crate::domain::DomainError::OutOfMem) => Err(DispatchError::TopUp(MemTopUpRequest::generic())),
            Err(e) => Err(DispatchError::Wire(e.into())),
        }
    }

    fn free_domain(&self, vm: VmHandle, args: HypercallArgs) -> Result<HypercallResult, DispatchError> {
        let domain_id = args.r1 as u32;
        let driver = self.driver;
        match self.domains.free(domain_id, vm, |phys| driver.free_domain(DEFAULT_IOMMU, phys)) {
            Ok(()) => Ok(HypercallResult::ok()),
            Err(e) => Err(DispatchError::Wire(e.into())),
        }
    }

    fn attach_dev(&self, vm: VmHandle, args: HypercallArgs) -> Result<HypercallResult, DispatchError> {
        let viommu_id = args.r1 as u32;
        let vsid = args.r2 as u32;
        let pasid = args.r3 as u32;
        let domain_id = args.r4 as u32;
        let pasid_bits = args.r5 as u8;

        let (phys_iommu, phys_sid) = self
            .routes
            .route(vm, viommu_id, vsid)
            .map_err(|_| DispatchError::Wire(Error::NotFound))?;
        let domain = self.domains.lookup(domain_id, vm).ok_or(DispatchError::Wire(Error::InvalidParam))?;
        let _guard = self
            .registry
            .iommu_lock(phys_iommu, phys_sid, Some(vm))
            .map_err(|e| DispatchError::Wire(e.into()))?;

        match self.driver.attach_dev(phys_iommu, domain.phys, phys_sid, pasid, pasid_bits) {
            Ok(()) => Ok(HypercallResult::ok()),
            Err(pviommu_hal::DriverError::OutOfMemory) => Err(DispatchError::TopUp(MemTopUpRequest::generic())),
            Err(_) => Err(DispatchError::Wire(Error::InvalidParam)),
        }
    }

    fn detach_dev(&self, vm: VmHandle, args: HypercallArgs) -> Result<HypercallResult, DispatchError> {
        let viommu_id = args.r1 as u32;
        let vsid = args.r2 as u32;
        let pasid = args.r3 as u32;
        let domain_id = args.r4 as u32;

        let (phys_iommu, phys_sid) = self
            .routes
            .route(vm, viommu_id, vsid)
            .map_err(|_| DispatchError::Wire(Error::NotFound))?;
        let domain = self.domains.lookup(domain_id, vm).ok_or(DispatchError::Wire(Error::InvalidParam))?;
        let _guard = self
            .registry
            .iommu_lock(phys_iommu, phys_sid, Some(vm))
            .map_err(|e| DispatchError::Wire(e.into()))?;

        match self.driver.detach_dev(phys_iommu, domain.phys, phys_sid, pasid) {
            Ok(()) => Ok(HypercallResult::ok()),
            Err(_) => Err(DispatchError::Wire(Error::InvalidParam)),
        }
    }

    fn map(&self, vm: VmHandle, args: HypercallArgs) -> Result<HypercallResult, DispatchError> {
        let domain_id = args.r1 as u32;
        let iova = args.r2;
        let ipa = args.r3;
        let pgsize = args.r4;
        let pgcount = args.r5;
        let prot_bits = args.r6 as u32;

        if pgsize != PAGE_SIZE {
            return Err(DispatchError::Wire(Error::InvalidParam));
        }
        let domain = self.domains.lookup(domain_id, vm).ok_or(DispatchError::Wire(Error::InvalidParam))?;
        let prot = translate_prot(Prot::from_bits_truncate(prot_bits));
        let walker = self.stage2_walker(vm)?;

        let mut mapped_bytes: u64 = 0;
        for i in 0..pgcount {
            let cur_ipa = ipa + i * PAGE_SIZE;
            let cur_iova = iova + i * PAGE_SIZE;
            let remaining = (pgcount - i) * PAGE_SIZE;

            let leaf = match walker.get_leaf(cur_ipa) {
                Ok(leaf) => leaf,
                Err(Stage2Error::NotMapped) | Err(Stage2Error::Invalid) => {
                    return Err(DispatchError::TopUp(MemTopUpRequest::for_ipa(cur_ipa, remaining)))
                }
            };

            match self.driver.map_pages(domain.phys, cur_iova, leaf.pa, PAGE_SIZE, 1, prot) {
                Ok(_) => mapped_bytes += PAGE_SIZE,
                Err(pviommu_hal::DriverError::OutOfMemory) => {
                    return Err(DispatchError::TopUp(MemTopUpRequest::for_ipa(cur_ipa, remaining)))
                }
                Err(_) => return Err(DispatchError::Wire(Error::InvalidParam)),
            }
        }

        Ok(HypercallResult { r0: WireStatus::Ok.as_r0(), r1: mapped_bytes, r2: 0, r3: 0 })
    }

    fn unmap(&self, vm: VmHandle, args: HypercallArgs) -> Result<HypercallResult, DispatchError> {
        let domain_id = args.r1 as u32;
        let iova = args.r2;
        let pgsize = args.r3;
        let pgcount = args.r4;

        if pgsize != PAGE_SIZE {
            return Err(DispatchError::Wire(Error::InvalidParam));
        }
        let domain = self.domains.lookup(domain_id, vm).ok_or(DispatchError::Wire(Error::InvalidParam))?;

        match self.driver.unmap_pages(domain.phys, iova, PAGE_SIZE, pgcount) {
            Ok(n) if n < pgcount * PAGE_SIZE => Err(DispatchError::Wire(Error::InvalidParam)),
            Ok(n) => Ok(HypercallResult { r0: WireStatus::Ok.as_r0(), r1: n, r2: 0, r3: 0 }),
            Err(pviommu_hal::DriverError::OutOfMemory) => Err(DispatchError::TopUp(MemTopUpRequest::generic())),
            Err(_) => Err(DispatchError::Wire(Error::InvalidParam)),
        }
    }

    fn dev_req_dma(&self, vm: VmHandle, args: HypercallArgs) -> Result<HypercallResult, DispatchError> {
        let viommu_id = args.r1 as u32;
        let vsid = args.r2 as u32;

        let (phys_iommu, phys_sid) = self
            .routes
            .route(vm, viommu_id, vsid)
            .map_err(|_| DispatchError::Wire(Error::NotFound))?;
        let token = self
            .registry
            .token_for_endpoint(phys_iommu, phys_sid, vm)
            .map_err(|e| DispatchError::Wire(e.into()))?;

        Ok(HypercallResult {
            r0: WireStatus::Ok.as_r0(),
            r1: token as u64,
            r2: (token >> 64) as u64,
            r3: 0,
        })
    }

    fn stage2_walker(&self, vm: VmHandle) -> Result<&'d dyn Stage2Walker, DispatchError> {
        self.walkers
            .lock()
            .get(&vm)
            .copied()
            .ok_or(DispatchError::Wire(Error::InvalidParam))
    }
}

fn translate_prot(prot: Prot) -> DriverProt {
    let mut out = DriverProt::empty();
    if prot.contains(Prot::READ) {
        out |= DriverProt::READ;
    }
    if prot.contains(Prot::WRITE) {
        out |= DriverProt::WRITE;
    }
    if prot.contains(Prot::CACHE) {
        out |= DriverProt::CACHE;
    }
    if prot.contains(Prot::NOEXEC) {
        out |= DriverProt::NOEXEC;
    }
    if prot.contains(Prot::MMIO) {
        out |= DriverProt::MMIO;
    }
    if prot.contains(Prot::PRIV) {
        out |= DriverProt::PRIV;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::HypercallId as Hid;
    use pviommu_hal::{DomainType, DriverError, PhysDomainId, PhysSid, Stage2Leaf};

    struct MockDriver;
    impl IommuDriver for MockDriver {
        fn alloc_domain(&self, _iommu: u32, _kind: DomainType) -> Result<PhysDomainId, DriverError> {
            Ok(PhysDomainId(1))
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

    struct MockWalker;
    impl Stage2Walker for MockWalker {
        fn get_leaf(&self, ipa: u64) -> Result<Stage2Leaf, Stage2Error> {
            Ok(Stage2Leaf { pa: ipa, level: 0 })
        }
    }

    struct RecordingCtx {
        returned: Option<(i64, u64, u64, u64)>,
        rewound: bool,
    }
    impl GuestTrapContext for RecordingCtx {
        fn set_return(&mut self, r0: i64, r1: u64, r2: u64, r3: u64) {
            self.returned = Some((r0, r1, r2, r3));
        }
        fn rewind_pc(&mut self) {
            self.rewound = true;
        }
    }

    fn args(r1: u64, r2: u64, r3: u64, r4: u64, r5: u64, r6: u64) -> HypercallArgs {
        HypercallArgs { r1, r2, r3, r4, r5, r6 }
    }

    #[test]
    fn version_round_trip() {
        let driver = MockDriver;
        let dispatcher = HypercallDispatcher::new(&driver);
        let mut ctx = RecordingCtx { returned: None, rewound: false };
        dispatcher.dispatch(1, 0, Hid::Version as u32, args(0, 0, 0, 0, 0, 0), &mut ctx);
        assert_eq!(ctx.returned, Some((0, VERSION, 0, 0)));
        assert!(!ctx.rewound);
    }

    #[test]
    fn alloc_then_free_domain_round_trip() {
        let driver = MockDriver;
        let dispatcher = HypercallDispatcher::new(&driver);
        let mut ctx = RecordingCtx { returned: None, rewound: false };
        dispatcher.dispatch(1, 0, Hid::AllocDomain as u32, args(0, 0, 0, 0, 0, 0), &mut ctx);
        let (status, domain_id, _, _) = ctx.returned.unwrap();
        assert_eq!(status, 0);

        let mut ctx2 = RecordingCtx { returned: None, rewound: false };
        dispatcher.dispatch(1, 0, Hid::FreeDomain as u32, args(domain_id, 0, 0, 0, 0, 0), &mut ctx2);
        assert_eq!(ctx2.returned, Some((0, 0, 0, 0)));
    }

    #[test]
    fn attach_without_route_is_denied() {
        let driver = MockDriver;
        let dispatcher = HypercallDispatcher::new(&driver);
        let mut ctx = RecordingCtx { returned: None, rewound: false };
        dispatcher.dispatch(1, 0, Hid::AllocDomain as u32, args(0, 0, 0, 0, 0, 0), &mut ctx);
        let (_, domain_id, _, _) = ctx.returned.unwrap();

        let mut ctx2 = RecordingCtx { returned: None, rewound: false };
        dispatcher.dispatch(1, 0, Hid::AttachDev as u32, args(0, 0, 0, domain_id, 0, 0), &mut ctx2);
        assert_eq!(ctx2.returned, Some((WireStatus::InvalidParam.as_r0(), 0, 0, 0)));
    }

    #[test]
    fn map_rejects_unsupported_page_size() {
        let driver = MockDriver;
        let dispatcher = HypercallDispatcher::new(&driver);
        let mut ctx = RecordingCtx { returned: None, rewound: false };
        dispatcher.dispatch(1, 0, Hid::AllocDomain as u32, args(0, 0, 0, 0, 0, 0), &mut ctx);
        let (_, domain_id, _, _) = ctx.returned.unwrap();

        let walker = MockWalker;
        dispatcher.register_stage2_walker(1, &walker);

        let mut ctx2 = RecordingCtx { returned: None, rewound: false };
        dispatcher.dispatch(
            1,
            0,
            Hid::Map as u32,
            args(domain_id, 0x1000, 0x2000, 2 * PAGE_SIZE, 1, Prot::READ.bits() as u64),
            &mut ctx2,
        );
        assert_eq!(ctx2.returned, Some((WireStatus::InvalidParam.as_r0(), 0, 0, 0)));
    }

    struct OomOnceDriver {
        failed_once: core::cell::Cell<bool>,
    }
    impl IommuDriver for OomOnceDriver {
        fn alloc_domain(&self, _iommu: u32, _kind: DomainType) -> Result<PhysDomainId, DriverError> {
            Ok(PhysDomainId(1))
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
            if !self.failed_once.get() {
                self.failed_once.set(true);
                Err(DriverError::OutOfMemory)
            } else {
                Ok(pgsize * count)
            }
        }
        fn unmap_pages(&self, _domain: PhysDomainId, _iova: u64, pgsize: u64, count: u64) -> Result<u64, DriverError> {
            Ok(pgsize * count)
        }
    }

    #[test]
    fn map_oom_then_retry_transparently_succeeds() {
        let driver = OomOnceDriver { failed_once: core::cell::Cell::new(false) };
        let dispatcher = HypercallDispatcher::new(&driver);
        let mut ctx = RecordingCtx { returned: None, rewound: false };
        dispatcher.dispatch(1, 0, Hid::AllocDomain as u32, args(0, 0, 0, 0, 0, 0), &mut ctx);
        let (_, domain_id, _, _) = ctx.returned.unwrap();

        let walker = MockWalker;
        dispatcher.register_stage2_walker(1, &walker);

        let map_args = args(domain_id, 0x1000, 0x2000, PAGE_SIZE, 1, Prot::READ.bits() as u64);

        let mut first = RecordingCtx { returned: None, rewound: false };
        dispatcher.dispatch(1, 0, Hid::Map as u32, map_args, &mut first);
        assert!(first.rewound);
        assert!(first.returned.is_none());

        let mut stale = RecordingCtx { returned: None, rewound: false };
        dispatcher.dispatch(1, 0, Hid::Map as u32, map_args, &mut stale);
        assert!(stale.rewound, "a pending request must be re-detected before running any handler");

        dispatcher.memcache.clear_pending(0);

        let mut retry = RecordingCtx { returned: None, rewound: false };
        dispatcher.dispatch(1, 0, Hid::Map as u32, map_args, &mut retry);
        assert_eq!(retry.returned, Some((0, PAGE_SIZE, 0, 0)));
    }
}
