//! # Guest Paging Walker (32-bit, non-PAE)
//!
//! Read-only access to a guest's two-level paging structures. Given the
//! guest's CR3 and a linear address, the walker maps in the relevant
//! directory or table page and reports the entry; given a guest-physical
//! address, [`ReverseWalk`] enumerates every linear address whose current
//! translation resolves to it.
//!
//! ## Address walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PDE  |  PTE  | Offset |
//! ```
//!
//! One page directory of 1024 four-byte entries; a PDE either references a
//! page table of 1024 PTEs or, with `PS=1` (and CR4.PSE), maps a 4 MiB
//! page directly.
//!
//! The walker never mutates guest structures and keeps no global state;
//! every mapped view is returned as an RAII guard, so the map/unmap
//! pairing holds on every exit path. All functions are reentrant.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod entries;
mod reverse;
mod walker;

pub use entries::{GuestPde, GuestPte};
pub use reverse::ReverseWalk;
pub use walker::{PdeView, PteView, WalkError, map_pde, map_pte, pte_slot_addr};

/// Entries per guest page directory / page table.
pub const GUEST_TABLE_ENTRIES: usize = 1024;

/// Size in bytes of one guest page-table entry.
pub const GUEST_ENTRY_SIZE: usize = 4;

/// Mask extracting the page-directory base from a guest CR3 value.
#[inline]
#[must_use]
pub const fn directory_base(cr3: u32) -> u64 {
    (cr3 & 0xFFFF_F000) as u64
}
