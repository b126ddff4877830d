//! The per-vCPU memcache: a small pool of host-donated pages the underlying
//! IOMMU driver draws on for its own page-table allocations, plus the one
//! outstanding top-up request a vCPU may have pending at a time.
//!
//! Refilling the pool itself — moving pages out of whatever the host
//! deposited — is the hypervisor's memory-donation subsystem's job and is
//! out of scope here; this module only tracks how many pages are currently
//! available and what, if anything, is still owed to a stalled hypercall.

#![allow(dead_code)]

use alloc::collections::BTreeMap;
use spin::Mutex;

use pviommu_hal::{IpaAddress, VcpuHandle};

const MAX_POOL_PAGES: usize = 64;

/// What a stalled hypercall is still waiting on. `ipa`/`size` are only
/// meaningful for a `MAP` escape — `ALLOC_DOMAIN`/`ATTACH_DEV` escapes need
/// generic page-table memory with no guest IPA behind it, and leave both
/// fields zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemTopUpRequest {
    pub ipa: IpaAddress,
    pub size: u64,
}

impl MemTopUpRequest {
    pub fn generic() -> Self {
        Self { ipa: 0, size: 0 }
    }

    pub fn for_ipa(ipa: IpaAddress, size: u64) -> Self {
        Self { ipa, size }
    }
}

#[derive(Default)]
struct VcpuState {
    pool_pages: usize,
    pending: Option<MemTopUpRequest>,
}

pub struct MemCache {
    vcpus: Mutex<BTreeMap<VcpuHandle, VcpuState>>,
}

impl MemCache {
    pub const fn new() -> Self {
        Self { vcpus: Mutex::new(BTreeMap::new()) }
    }

    /// Host deposits `count` fresh pages for this vCPU's pool, capped at
    /// `MAX_POOL_PAGES`. Called at hypercall entry before any handler runs.
    pub fn refill(&self, vcpu: VcpuHandle, count: usize) {
        let mut vcpus = self.vcpus.lock();
        let state = vcpus.entry(vcpu).or_default();
        state.pool_pages = (state.pool_pages + count).min(MAX_POOL_PAGES);
    }

    pub fn pool_pages(&self, vcpu: VcpuHandle) -> usize {
        self.vcpus.lock().entry(vcpu).or_default().pool_pages
    }

    /// Record that this vCPU is now blocked waiting for backing memory.
    /// Overwrites any prior request — only one can be outstanding at once,
    /// since the guest never re-enters until it is serviced.
    pub fn set_pending(&self, vcpu: VcpuHandle, request: MemTopUpRequest) {
        self.vcpus.lock().entry(vcpu).or_default().pending = Some(request);
    }

    /// The request a vCPU is still waiting on, if any. Checked first thing
    /// on every hypercall entry so a stale request is never silently
    /// dropped.
    pub fn pending(&self, vcpu: VcpuHandle) -> Option<MemTopUpRequest> {
        self.vcpus.lock().entry(vcpu).or_default().pending
    }

    pub fn clear_pending(&self, vcpu: VcpuHandle) {
        if let Some(state) = self.vcpus.lock().get_mut(&vcpu) {
            state.pending = None;
        }
    }
}

impl Default for MemCache {
    fn default() -> Self {
        Self::new()
    }
}
