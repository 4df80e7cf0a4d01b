//! # PE Inspector
//!
//! Parses a Portable Executable image that lives in *guest* memory and
//! computes the relocation-normalised measurement checksum over its
//! executable sections.
//!
//! Two checksum variants exist:
//!
//! - [`checksum_via_guest`] walks the live guest paging structures — it
//!   measures what the guest currently sees.
//! - [`checksum_via_frames`] walks a caller-supplied array of physical
//!   frames — it measures the code view the split engine keeps.
//!
//! Both yield identical values iff the guest's executable bytes are
//! byte-identical to the code view; a patch that reached only the data
//! view shows up as a mismatch between the two.
//!
//! The checksum is an order-insensitive wrapping byte sum. Because a
//! relocated image legitimately differs from its linked-base form, the sum
//! is compensated: every base-relocation site contributes the bytes of the
//! load delta once, so the measurement is invariant under rebase.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod checksum;
mod header;

pub use checksum::{
    RelocInfo, buffer_checksum, checksum_via_frames, checksum_via_guest, reloc_info,
};
pub use header::{PeView, SectionHeader};

/// PE inspection failures. Header validation is the only fatal surface;
/// an unreachable relocation or body page degrades the checksum instead
/// of aborting it.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum PeError {
    #[error("image header does not start with MZ")]
    BadMagic,
    #[error("NT signature missing or outside the header page")]
    BadNtSignature,
    #[error("header structures extend past the mapped header page")]
    HeadersTruncated,
}
