//! # Extended Page Tables
//!
//! The second-level address translation layer: bit-exact EPT entry
//! layouts, the EPT pointer, and an identity map over the first 4 GiB of
//! guest-physical memory built from 2 MiB leaves, with on-demand demotion
//! of any 2 MiB region into 512 four-KiB entries.
//!
//! Demotion is the enabling trick of the TLB split: a protected page must
//! be switchable between two backing frames at 4 KiB granularity, so the
//! 2 MiB leaf covering it is replaced by an equivalent page table first.
//! Immediately after demotion the aggregate translation is unchanged; only
//! explicit modifications through the returned [`PteSlot`] change what the
//! guest observes.
//!
//! All table frames come from the [`FrameArena`](hv_arena::FrameArena) and
//! are tracked by index, so teardown returns everything to the arena in
//! one sweep.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod entries;
mod identity;
mod slot;

pub use entries::{
    EptMemType, EptPde2M, EptPdeRef, EptPdeUnion, EptPdeView, EptPml4Entry, EptPdpte,
    EptPointer, EptPte, EptViolationQual,
};
pub use identity::{EPT_TABLE_ENTRIES, IdentityMap, NUM_PD_PAGES};
pub use slot::PteSlot;

/// EPT manipulation failures.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum EptError {
    #[error("guest-physical address {0:#x} is beyond the mapped 4 GiB")]
    OutOfRange(u64),
    #[error("page-frame arena exhausted while demoting")]
    ArenaExhausted,
    #[error("no page table tracks the demoted region at {0:#x}")]
    TableNotFound(u64),
}
