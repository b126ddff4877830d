//! The guest-register side-channel the dispatcher needs to finish a trap.
//!
//! Decoding the incoming hypercall (which function, which args) and raising
//! the trap in the first place both happen before the core ever runs — that
//! belongs to the arch-specific exception vector. What the core still owns
//! is writing the call's result back into the guest's return registers, and,
//! for the memory-top-up escape, rewinding the guest program counter so the
//! same instruction re-executes once the host has topped up the memcache.

#![allow(dead_code)]

/// Width in bytes of the trapping instruction (`HVC #imm` / `hvc 0` /
/// `ecall`), architecture-dependent. The dispatcher never hardcodes this —
/// it asks the trap context so the escape protocol works unmodified across
/// targets.
pub trait GuestTrapContext {
    /// Write the call's outcome into the guest's return registers, in the
    /// order the ABI defines: `r0` carries the wire status, `r1..r3` carry
    /// any result payload.
    fn set_return(&mut self, r0: i64, r1: u64, r2: u64, r3: u64);

    /// Rewind the program counter by one hypercall-instruction width so the
    /// guest re-issues the identical call on its next entry. Used only by
    /// the memory-top-up escape — every other exit leaves the PC untouched.
    fn rewind_pc(&mut self);
}
