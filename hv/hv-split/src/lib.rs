//! # The TLB-Split Engine
//!
//! The machinery that makes one guest-virtual page resolve to *two*
//! different physical frames depending on how it is touched: instruction
//! fetches see the pristine code frame, data reads and writes see an
//! independent data frame. An adversary patching the protected image in
//! memory reaches only the data view, while the measurement checksum
//! walks the code view — so the patch is detected and execution is not.
//!
//! ## How a single access resolves
//!
//! Every protected page's EPT PTE normally carries **no** access rights.
//! A guest access raises an EPT violation; the [`SplitEngine`] installs
//! the frame matching the access kind (code for fetches, data otherwise),
//! sets the guest's trap flag, and resumes. The instruction retires, the
//! single-step trap fires, and the engine strips the rights again. At any
//! instant at most one protected page (two during thrash retire) is
//! accessible, and the [`FaultStack`] names it.
//!
//! ## Thrashing
//!
//! An instruction that both *executes on* and *touches data on* the same
//! 4 KiB page would ping-pong forever: fetch-fault, install code,
//! data-fault, install data, fetch-fault again. The engine detects the
//! second fault before any retire (stack depth ≥ 2), reconciles the
//! faulting instruction's bytes between the two frames, installs the data
//! frame with full rights, and lets the instruction retire — the fixed
//! point of the loop.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod engine;
mod record;
mod stack;
mod tracker;

pub use engine::{
    Counters, ExitVmcs, SplitEngine, TlbFlush, TrapOutcome, ViolationOutcome,
};
pub use record::{PageView, TranslationRecord, TranslationTable};
pub use stack::{FAULT_STACK_CAPACITY, FaultStack};
pub use tracker::PageInTracker;
