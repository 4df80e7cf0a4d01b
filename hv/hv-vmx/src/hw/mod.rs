//! Hardware-facing layer: real VMX instructions, the exit stub, and the
//! seam implementations the dispatcher runs against in production.
//!
//! Compiled only for 32-bit x86 with the `asm` feature; every decision
//! made here is delegated to the portable dispatcher, so nothing in this
//! module needs (or gets) host-side tests.

pub mod insn;
pub mod setup;
pub mod shell;

use crate::vmcs::{VmcsField, VmcsOps};
use crate::hypervisor::HostOps;
use crate::VM_VPID;
use core::ptr::NonNull;
use hv_addr::{GuestVirtAddr, PhysAddr, PhysMapper};
use hv_registers::msr::Msr;
use hv_split::TlbFlush;

/// [`VmcsOps`] over the current VMCS via `VMREAD`/`VMWRITE`.
pub struct RealVmcs;

impl VmcsOps for RealVmcs {
    fn read(&self, field: VmcsField) -> u32 {
        // SAFETY: only used in VMX root mode with a current VMCS.
        unsafe { insn::vmread(field) }
    }

    fn write(&mut self, field: VmcsField, value: u32) {
        // SAFETY: as above.
        unsafe { insn::vmwrite(field, value) };
    }
}

/// [`TlbFlush`] via `INVEPT`/`INVVPID`, honouring the probed support for
/// individual-address invalidation.
pub struct RealTlb {
    individual_invvpid: bool,
}

impl RealTlb {
    #[must_use]
    pub const fn new(individual_invvpid: bool) -> Self {
        Self { individual_invvpid }
    }
}

impl TlbFlush for RealTlb {
    fn invept_all(&self) {
        // SAFETY: VMX root mode with EPT enabled.
        unsafe { insn::invept_all_context() };
    }

    fn invvpid_all(&self) {
        // SAFETY: VMX root mode with VPID enabled.
        unsafe { insn::invvpid_all_context() };
    }

    fn invvpid_addr(&self, gva: GuestVirtAddr) {
        if self.individual_invvpid {
            // SAFETY: as above; type 0 support was verified at bring-up.
            unsafe { insn::invvpid_address(VM_VPID, gva.as_u32()) };
        } else {
            self.invvpid_all();
        }
    }
}

/// [`PhysMapper`] over the kernel's physical-memory window: physical
/// frame `p` is visible at `window_base + p`, so mapping is pointer
/// arithmetic, can never fault, and is legal at any IRQL.
pub struct DirectMapper {
    window_base: usize,
}

impl DirectMapper {
    /// # Safety
    /// `window_base` must be the virtual base of a mapping that covers
    /// all physical memory this hypervisor will touch.
    #[must_use]
    pub const unsafe fn new(window_base: usize) -> Self {
        Self { window_base }
    }
}

impl PhysMapper for DirectMapper {
    unsafe fn map_raw(&self, frame: PhysAddr) -> Option<NonNull<u8>> {
        #[allow(clippy::cast_possible_truncation)]
        let addr = self.window_base.wrapping_add(frame.as_u64() as usize);
        NonNull::new(addr as *mut u8)
    }

    unsafe fn unmap_raw(&self, _ptr: NonNull<u8>) {
        // The window is permanent; nothing to release.
    }
}

/// [`HostOps`] executing the real instructions.
pub struct RealHost;

impl HostOps for RealHost {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> [u32; 4] {
        insn::cpuid(leaf, subleaf)
    }

    fn invd(&self) {
        // SAFETY: ring 0; the guest asked for exactly this.
        unsafe { insn::invd() };
    }

    fn rdmsr(&self, msr: Msr) -> u64 {
        // SAFETY: ring 0, executing on the guest's behalf.
        unsafe { msr.load_raw() }
    }

    fn wrmsr(&self, msr: Msr, value: u64) {
        // SAFETY: ring 0; the write policy already filtered the slot.
        unsafe { msr.store_raw(value) };
    }
}
