//! A retained handle to one EPT PTE.

use crate::entries::EptPte;
use core::ptr::NonNull;

/// Handle to a single EPT PTE slot that stays valid for the lifetime of
/// the identity map that produced it.
///
/// The CPU walks these tables concurrently with the hypervisor's edits,
/// so all access is volatile through the raw slot pointer. The split
/// engine stores one of these per protected page and flips it between the
/// code and data frames on every fault/trap cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PteSlot {
    ptr: NonNull<u64>,
}

// SAFETY: the slot refers to arena-owned table memory with a documented
// init -> mutate-during-exits -> teardown lifecycle; all access is
// volatile and the exit path is single threaded.
unsafe impl Send for PteSlot {}
unsafe impl Sync for PteSlot {}

impl PteSlot {
    /// Wrap a raw EPT PTE slot.
    ///
    /// # Safety
    /// `ptr` must point at an 8-byte-aligned EPT PTE inside a live table;
    /// the slot must remain valid (not freed back to the arena) for as
    /// long as reads and writes happen through the handle.
    #[must_use]
    pub const unsafe fn new(ptr: NonNull<u64>) -> Self {
        Self { ptr }
    }

    /// Volatile read of the entry.
    #[inline]
    #[must_use]
    pub fn read(self) -> EptPte {
        // SAFETY: validity guaranteed by the constructor contract.
        EptPte::from_bits(unsafe { self.ptr.as_ptr().read_volatile() })
    }

    /// Volatile write of the entry.
    #[inline]
    pub fn write(self, entry: EptPte) {
        // SAFETY: as in `read`.
        unsafe { self.ptr.as_ptr().write_volatile(entry.into_bits()) };
    }

    /// Read-modify-write of the entry.
    #[inline]
    pub fn update(self, f: impl FnOnce(EptPte) -> EptPte) {
        self.write(f(self.read()));
    }

    /// Strip every access right, making the next guest access fault.
    #[inline]
    pub fn revoke_access(self) {
        self.update(|pte| {
            pte.with_present(false)
                .with_write(false)
                .with_execute(false)
        });
    }

    /// Grant full access without changing the mapped frame.
    #[inline]
    pub fn grant_all(self) {
        self.update(|pte| {
            pte.with_present(true)
                .with_write(true)
                .with_execute(true)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hv_addr::PhysAddr;

    #[test]
    fn revoke_and_grant_round_trip() {
        let mut raw = EptPte::identity(PhysAddr::new(0x7000)).into_bits();
        let slot = unsafe { PteSlot::new(NonNull::from(&mut raw).cast()) };

        slot.revoke_access();
        assert!(!slot.read().any_access());
        assert_eq!(slot.read().page_phys().as_u64(), 0x7000);

        slot.grant_all();
        let pte = slot.read();
        assert!(pte.present() && pte.write() && pte.execute());
    }
}
