//! Bring-up and unload.
//!
//! The external collaborator (driver entry, out of scope here) calls
//! [`load`] with the physical-window base, the arena size, and the point
//! the guest should resume at; from that instant the running system *is*
//! the guest. [`unload`] reverses it.

use super::insn;
use super::shell::{self, StubCell, WINDOW_BASE};
use crate::caps::{VmxCapabilities, VmxSetupError};
use crate::hypervisor::{HYPERVISOR, Hypervisor};
use crate::vmcs::{VmcsField, VmcsRegion};
use crate::{VM_VPID, VMCALL_DISABLE};
use core::cell::UnsafeCell;
use core::sync::atomic::Ordering;
use hv_addr::GuestVirtAddr;
use hv_registers::LoadRegisterUnsafe;
use hv_registers::StoreRegisterUnsafe;
use hv_registers::cr3::Cr3;
use hv_registers::cr4::Cr4;
use hv_registers::msr::Msr;
use hv_split::TlbFlush;
use log::{error, info};

/// Where the guest continues after `VMLAUNCH` succeeds (captured by the
/// collaborator before calling [`load`]).
#[derive(Copy, Clone, Debug)]
pub struct GuestResume {
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
}

static VMXON_REGION: StubCell<VmcsRegion> = StubCell(UnsafeCell::new(VmcsRegion::new(0)));
static VMCS_REGION: StubCell<VmcsRegion> = StubCell(UnsafeCell::new(VmcsRegion::new(0)));

/// TLB seam that does nothing — for teardown paths where VMX operation
/// is already (or not yet) off and the invalidation instructions would
/// fault.
struct InertTlb;

impl TlbFlush for InertTlb {
    fn invept_all(&self) {}
    fn invvpid_all(&self) {}
    fn invvpid_addr(&self, _gva: GuestVirtAddr) {}
}

/// Read the VMX capability MSRs.
///
/// # Safety
/// CPL 0 on a processor that has the VMX leaf (`CPUID.1:ECX.VMX`).
#[must_use]
pub unsafe fn probe_capabilities() -> VmxCapabilities {
    // SAFETY: caller guarantees CPL 0 and MSR presence.
    unsafe {
        VmxCapabilities::from_raw(
            Msr::IA32_FEATURE_CONTROL.load_raw(),
            Msr::IA32_VMX_BASIC.load_raw(),
            Msr::IA32_VMX_PROCBASED_CTLS.load_raw(),
            Msr::IA32_VMX_PROCBASED_CTLS2.load_raw(),
            Msr::IA32_VMX_EPT_VPID_CAP.load_raw(),
        )
    }
}

fn region_phys(region: &StubCell<VmcsRegion>, window_base: usize) -> u64 {
    (region.0.get() as usize - window_base) as u64
}

/// Fold a desired control value into the allowed-0/allowed-1 envelope an
/// `IA32_VMX_*_CTLS` MSR reports.
#[allow(clippy::cast_possible_truncation)]
const fn adjust_controls(allowed: u64, desired: u32) -> u32 {
    let allowed0 = allowed as u32;
    let allowed1 = (allowed >> 32) as u32;
    (desired | allowed0) & allowed1
}

/// Bring the hypervisor up and slide the running system under it.
///
/// On success this function *does not return to its caller's frame* in
/// the ordinary sense: `VMLAUNCH` transfers to `resume` in guest mode.
/// Returning `Ok` is never observed; any return is a failure.
///
/// # Safety
/// CPL 0, single logical processor, interrupts managed by the caller,
/// and `window_base` the virtual base of a mapping of all physical
/// memory. The caller must have verified VMX presence via `CPUID`.
///
/// # Errors
/// Capability, allocation, and launch failures, each after restoring the
/// pre-call system state.
pub unsafe fn load(
    window_base: usize,
    num_frames: usize,
    resume: GuestResume,
) -> Result<(), VmxSetupError> {
    // SAFETY: CPL 0 per contract.
    let cr4 = unsafe { Cr4::load_unsafe() };
    if cr4.pae() {
        error!("PAE paging is enabled; the guest walker requires non-PAE");
        return Err(VmxSetupError::PaeEnabled);
    }

    // SAFETY: CPL 0 per contract.
    let caps = unsafe { probe_capabilities() };
    caps.validate()?;

    let hypervisor = Hypervisor::new(caps, num_frames)?;
    let eptp = hypervisor.eptp();
    WINDOW_BASE.store(window_base, Ordering::Relaxed);
    *HYPERVISOR.lock() = Some(hypervisor);

    // Stamp both regions with the processor's revision identifier.
    let revision = caps.basic.revision_id();
    // SAFETY: the regions are only touched here, before the first exit.
    unsafe {
        *VMXON_REGION.0.get() = VmcsRegion::new(revision);
        *VMCS_REGION.0.get() = VmcsRegion::new(revision);
    }

    // Interrupts stay masked from VMXON until VMLAUNCH hands control to
    // the guest (which brings its own EFLAGS).
    let _irq = hv_sync::IrqGuard::new();

    // SAFETY: CPL 0; VMXE must be set before VMXON.
    unsafe {
        Cr4::load_unsafe().with_vmxe(true).store_unsafe();
        insn::vmxon(region_phys(&VMXON_REGION, window_base));
        insn::vmclear(region_phys(&VMCS_REGION, window_base));
        insn::vmptrld(region_phys(&VMCS_REGION, window_base));
        write_vmcs(&caps, eptp, resume);
        (*VMCS_REGION.0.get()).clear_abort_indicator();
        insn::vmlaunch();
    }

    // VMLAUNCH fell through: fetch the error, unwind everything.
    // SAFETY: still in VMX root operation with the VMCS current.
    let error = unsafe { insn::vmread(VmcsField::VmInstructionError) };
    // SAFETY: leaving VMX operation entirely.
    unsafe {
        insn::vmxoff();
        Cr4::load_unsafe().with_vmxe(false).store_unsafe();
    }
    if let Some(hypervisor) = HYPERVISOR.lock().take() {
        hypervisor.release(&InertTlb);
    }
    error!("VMLAUNCH failed with VM-instruction error {error}");
    Err(VmxSetupError::LaunchFailed(error))
}

/// Configure execution controls, guest state (the running system as it
/// stands), and host state (the exit stub).
///
/// # Safety
/// VMX root operation with the working VMCS current.
unsafe fn write_vmcs(caps: &VmxCapabilities, eptp: hv_ept::EptPointer, resume: GuestResume) {
    /// CPU-based control: exit on CR3 loads (bit 15) — the page-in
    /// tracker depends on it.
    const CR3_LOAD_EXITING: u32 = 1 << 15;
    /// CPU-based control: activate secondary controls (bit 31).
    const SECONDARY_CONTROLS: u32 = 1 << 31;
    /// Secondary control: enable EPT (bit 1).
    const ENABLE_EPT: u32 = 1 << 1;
    /// Secondary control: enable VPID (bit 5).
    const ENABLE_VPID: u32 = 1 << 5;
    /// Exception bitmap: #DB (vector 1) — the single-step trap.
    const TRAP_DEBUG: u32 = 1 << 1;

    let w = |field: VmcsField, value: u32| {
        // SAFETY: per function contract.
        unsafe { insn::vmwrite(field, value) };
    };

    // SAFETY: CPL 0; capability MSRs exist (validated).
    let (pin, proc, proc2, exit, entry) = unsafe {
        (
            Msr::IA32_VMX_PINBASED_CTLS.load_raw(),
            Msr::IA32_VMX_PROCBASED_CTLS.load_raw(),
            Msr::IA32_VMX_PROCBASED_CTLS2.load_raw(),
            Msr::IA32_VMX_EXIT_CTLS.load_raw(),
            Msr::IA32_VMX_ENTRY_CTLS.load_raw(),
        )
    };

    w(VmcsField::PinBasedControls, adjust_controls(pin, 0));
    w(
        VmcsField::CpuBasedControls,
        adjust_controls(proc, CR3_LOAD_EXITING | SECONDARY_CONTROLS),
    );
    w(
        VmcsField::SecondaryControls,
        adjust_controls(proc2, ENABLE_EPT | ENABLE_VPID),
    );
    w(VmcsField::ExceptionBitmap, TRAP_DEBUG);
    w(VmcsField::Cr3TargetCount, 0);
    w(VmcsField::VmExitControls, adjust_controls(exit, 0));
    w(VmcsField::VmEntryControls, adjust_controls(entry, 0));

    // Second-level translation and TLB tagging.
    let mut vmcs = super::RealVmcs;
    use crate::vmcs::VmcsOps;
    vmcs.write64(
        VmcsField::EptPointer,
        VmcsField::EptPointerHigh,
        eptp.into_bits(),
    );
    w(VmcsField::Vpid, u32::from(VM_VPID));
    vmcs.write64(
        VmcsField::VmcsLinkPointer,
        VmcsField::VmcsLinkPointerHigh,
        u64::MAX,
    );
    vmcs.write64(
        VmcsField::GuestIa32Debugctl,
        VmcsField::GuestIa32DebugctlHigh,
        0,
    );

    // Guest state: the machine exactly as it runs now.
    // SAFETY: CPL 0 register/selector reads.
    unsafe {
        let (gdt_limit, gdt_base) = insn::sgdt();
        let (idt_limit, idt_base) = insn::sidt();
        w(VmcsField::GuestGdtrLimit, u32::from(gdt_limit));
        w(VmcsField::GuestGdtrBase, gdt_base);
        w(VmcsField::GuestIdtrLimit, u32::from(idt_limit));
        w(VmcsField::GuestIdtrBase, idt_base);
        w(VmcsField::HostGdtrBase, gdt_base);
        w(VmcsField::HostIdtrBase, idt_base);

        let cr0: u32;
        core::arch::asm!("mov {0}, cr0", out(reg) cr0, options(nomem, nostack));
        w(VmcsField::GuestCr0, cr0);
        w(VmcsField::HostCr0, cr0);
        let cr3 = Cr3::load_unsafe().into_bits();
        w(VmcsField::GuestCr3, cr3);
        w(VmcsField::HostCr3, cr3);
        let cr4 = Cr4::load_unsafe().into_bits();
        w(VmcsField::GuestCr4, cr4);
        w(VmcsField::HostCr4, cr4);
        w(VmcsField::Cr0GuestHostMask, 0);
        w(VmcsField::Cr4GuestHostMask, 0);

        w(VmcsField::GuestEsSelector, u32::from(insn::read_es()));
        w(VmcsField::GuestCsSelector, u32::from(insn::read_cs()));
        w(VmcsField::GuestSsSelector, u32::from(insn::read_ss()));
        w(VmcsField::GuestDsSelector, u32::from(insn::read_ds()));
        w(VmcsField::GuestFsSelector, u32::from(insn::read_fs()));
        w(VmcsField::GuestGsSelector, u32::from(insn::read_gs()));
        w(VmcsField::GuestTrSelector, u32::from(insn::str_tr()));
        w(VmcsField::HostEsSelector, u32::from(insn::read_es()) & !7);
        w(VmcsField::HostCsSelector, u32::from(insn::read_cs()) & !7);
        w(VmcsField::HostSsSelector, u32::from(insn::read_ss()) & !7);
        w(VmcsField::HostDsSelector, u32::from(insn::read_ds()) & !7);
        w(VmcsField::HostFsSelector, u32::from(insn::read_fs()) & !7);
        w(VmcsField::HostGsSelector, u32::from(insn::read_gs()) & !7);
        w(VmcsField::HostTrSelector, u32::from(insn::str_tr()) & !7);

        w(VmcsField::GuestInterruptibility, 0);
    }

    // Entry/exit points.
    w(VmcsField::GuestRsp, resume.esp);
    w(VmcsField::GuestRip, resume.eip);
    w(VmcsField::GuestRflags, resume.eflags);
    w(VmcsField::HostRsp, shell::host_stack_top());
    #[allow(clippy::fn_to_numeric_cast_with_truncation, clippy::fn_to_numeric_cast)]
    w(VmcsField::HostRip, shell::vmexit_entry as u32);
}

/// Unload: ask the hypervisor to step aside, then free everything.
///
/// # Safety
/// CPL 0; pairs with a successful [`load`].
pub unsafe fn unload() {
    // From guest context this VMCALL never "returns" through VMRESUME;
    // the exit stub restores our registers and jumps back here with the
    // hypervisor out of the loop.
    // SAFETY: CPL 0 in guest mode under this hypervisor.
    unsafe { insn::vmcall(VMCALL_DISABLE, 0, 0) };

    if let Some(hypervisor) = HYPERVISOR.lock().take() {
        hypervisor.release(&InertTlb);
    }
    info!("hypervisor unloaded");
}
