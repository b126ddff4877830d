//! The guest stage-2 (IPA→PA) walker contract.
//!
//! `MAP` never trusts a guest's claim that its IOVA range is backed by
//! contiguous physical memory: every page is resolved through this walker,
//! which is owned by the hypervisor's own page-table / donation subsystem
//! and out of scope here (see the crate-level docs). The pvIOMMU core only
//! needs the read-only leaf lookup below and the ownership check it implies.

#![allow(dead_code)]

use crate::memory::{IpaAddress, PhysicalAddress};

/// Leaf translation result for one stage-2 page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage2Leaf {
    pub pa: PhysicalAddress,
    /// Page-table level the leaf was found at (0 = smallest granule).
    pub level: u8,
}

/// Why a stage-2 lookup failed to produce a usable leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage2Error {
    /// No leaf entry exists yet — the IPA is unbacked. This is the
    /// expected, recoverable case: the dispatcher turns it into a
    /// memory-top-up request rather than an error returned to the guest.
    NotMapped,
    /// A leaf exists but is marked invalid (e.g. mid-donation).
    Invalid,
}

/// Per-VM stage-2 page-table walker, implemented by the hypervisor's memory
/// subsystem. One instance is handed to the dispatcher per VM.
pub trait Stage2Walker: Send + Sync {
    /// Resolve one guest IPA to its backing host physical page. Returning
    /// `Err(Stage2Error::NotMapped)` is the normal trigger for the
    /// memory-top-up escape protocol, not a fault condition by itself.
    fn get_leaf(&self, ipa: IpaAddress) -> Result<Stage2Leaf, Stage2Error>;
}
