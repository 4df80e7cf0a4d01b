//! Per-slot MSR write policy.

use hv_registers::msr::Msr;
use log::debug;

/// Number of blockable MSR slots.
const BLOCK_SLOTS: usize = 16;

/// MSRs whose guest writes are swallowed and counted instead of executed.
///
/// Defaults to the registers that would let the guest tamper with VMX
/// operation itself: `IA32_FEATURE_CONTROL` and the VMX capability range.
#[derive(Debug)]
pub struct MsrWriteBlockList {
    slots: [(Msr, u32); BLOCK_SLOTS],
    used: usize,
}

impl MsrWriteBlockList {
    /// The default policy.
    #[must_use]
    pub const fn new() -> Self {
        let mut list = Self {
            slots: [(Msr(0), 0); BLOCK_SLOTS],
            used: 0,
        };
        list = list.with(Msr::IA32_FEATURE_CONTROL);
        list = list.with(Msr::IA32_VMX_BASIC);
        list = list.with(Msr::IA32_VMX_PINBASED_CTLS);
        list = list.with(Msr::IA32_VMX_PROCBASED_CTLS);
        list = list.with(Msr::IA32_VMX_EXIT_CTLS);
        list = list.with(Msr::IA32_VMX_ENTRY_CTLS);
        list = list.with(Msr::IA32_VMX_PROCBASED_CTLS2);
        list = list.with(Msr::IA32_VMX_EPT_VPID_CAP);
        list
    }

    const fn with(mut self, msr: Msr) -> Self {
        if self.used < BLOCK_SLOTS {
            self.slots[self.used] = (msr, 0);
            self.used += 1;
        }
        self
    }

    /// If `msr` is blocked, count the attempt and report `true` (the
    /// write must not reach the hardware).
    pub fn filter_write(&mut self, msr: Msr) -> bool {
        for (slot, count) in &mut self.slots[..self.used] {
            if *slot == msr {
                *count = count.wrapping_add(1);
                debug!("blocked guest WRMSR to {msr:?} (total {count})");
                return true;
            }
        }
        false
    }

    /// Blocked-write count for one slot.
    #[must_use]
    pub fn blocked_count(&self, msr: Msr) -> u32 {
        self.slots[..self.used]
            .iter()
            .find(|(slot, _)| *slot == msr)
            .map_or(0, |(_, count)| *count)
    }

    /// Iterate `(msr, blocked-count)` over all slots.
    pub fn counts(&self) -> impl Iterator<Item = (Msr, u32)> + '_ {
        self.slots[..self.used].iter().copied()
    }
}

impl Default for MsrWriteBlockList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_and_counts_vmx_slots() {
        let mut list = MsrWriteBlockList::new();
        assert!(list.filter_write(Msr::IA32_FEATURE_CONTROL));
        assert!(list.filter_write(Msr::IA32_FEATURE_CONTROL));
        assert_eq!(list.blocked_count(Msr::IA32_FEATURE_CONTROL), 2);
    }

    #[test]
    fn passes_ordinary_msrs() {
        let mut list = MsrWriteBlockList::new();
        assert!(!list.filter_write(Msr::IA32_SYSENTER_EIP));
        assert_eq!(list.blocked_count(Msr::IA32_SYSENTER_EIP), 0);
    }
}
