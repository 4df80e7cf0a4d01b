//! The VM-exit stub: guest register capture, dispatch, resume.

use super::{DirectMapper, RealHost, RealTlb, RealVmcs};
use crate::exit::ExitAction;
use crate::guest_state::GuestState;
use crate::hypervisor::HYPERVISOR;
use crate::vmcs::{VmcsField, VmcsOps};
use core::arch::{asm, naked_asm};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Virtual base of the physical-memory window, published by `setup::load`.
pub(super) static WINDOW_BASE: AtomicUsize = AtomicUsize::new(0);

/// Fixed-address storage the asm stub can reach by symbol.
#[repr(transparent)]
pub(super) struct StubCell<T>(pub UnsafeCell<T>);

// SAFETY: accessed only from the single-threaded exit path.
unsafe impl<T> Sync for StubCell<T> {}

/// The guest GP-register save block written by [`vmexit_entry`].
static GUEST_REGS: StubCell<GuestState> = StubCell(UnsafeCell::new(GuestState {
    eax: 0,
    ecx: 0,
    edx: 0,
    ebx: 0,
    esp: 0,
    ebp: 0,
    esi: 0,
    edi: 0,
}));

/// Scratch slots for leaving VMX operation.
static RESUME_ESP: StubCell<u32> = StubCell(UnsafeCell::new(0));
static RESUME_EIP: StubCell<u32> = StubCell(UnsafeCell::new(0));
static RESUME_EFLAGS: StubCell<u32> = StubCell(UnsafeCell::new(0));

/// Dedicated host stack for VM-exit handling.
#[repr(C, align(16))]
struct HostStack([u8; 0x2000]);

static HOST_STACK: StubCell<HostStack> = StubCell(UnsafeCell::new(HostStack([0; 0x2000])));

/// Top of the host stack, for the VMCS `HOST_RSP` field.
#[allow(clippy::cast_possible_truncation)]
pub(super) fn host_stack_top() -> u32 {
    let base = HOST_STACK.0.get() as usize;
    ((base + 0x2000 - 16) & !0xF) as u32
}

/// The host entry point written into `HOST_RIP`.
///
/// Captures the guest's GP registers into the fixed save block, runs the
/// dispatcher, restores the block, and `VMRESUME`s. Interrupts stay
/// masked for the whole root-mode episode; the guest's own EFLAGS come
/// back with `VMRESUME`.
#[unsafe(naked)]
pub extern "C" fn vmexit_entry() -> ! {
    naked_asm!(
        "cli",
        "mov dword ptr [{regs} + 0], eax",
        "mov dword ptr [{regs} + 4], ecx",
        "mov dword ptr [{regs} + 8], edx",
        "mov dword ptr [{regs} + 12], ebx",
        "mov dword ptr [{regs} + 16], 0", // guest ESP lives in the VMCS
        "mov dword ptr [{regs} + 20], ebp",
        "mov dword ptr [{regs} + 24], esi",
        "mov dword ptr [{regs} + 28], edi",
        "call {handler}",
        "mov eax, dword ptr [{regs} + 0]",
        "mov ecx, dword ptr [{regs} + 4]",
        "mov edx, dword ptr [{regs} + 8]",
        "mov ebx, dword ptr [{regs} + 12]",
        "mov ebp, dword ptr [{regs} + 20]",
        "mov esi, dword ptr [{regs} + 24]",
        "mov edi, dword ptr [{regs} + 28]",
        "vmresume",
        // VMRESUME fell through: the VMCS is broken beyond repair.
        "call {failed}",
        regs = sym GUEST_REGS,
        handler = sym vmexit_handler,
        failed = sym resume_failed,
    )
}

extern "C" fn resume_failed() -> ! {
    hv_debugcon::beacon_loop()
}

/// Rust half of the exit path: dispatch against the global state block.
extern "C" fn vmexit_handler() {
    let mut vmcs = RealVmcs;
    // SAFETY: single-threaded exit path; the stub wrote the block just
    // before calling us.
    let state = unsafe { &mut *GUEST_REGS.0.get() };
    state.esp = vmcs.read(VmcsField::GuestRsp);

    let action = {
        let mut guard = HYPERVISOR.lock();
        guard.as_mut().map_or(ExitAction::FatalBeacon, |hv| {
            let tlb = RealTlb::new(hv.capabilities().individual_invvpid());
            // SAFETY: setup published the window before the first exit.
            let mapper = unsafe { DirectMapper::new(WINDOW_BASE.load(Ordering::Relaxed)) };
            hv.handle_exit(&mut vmcs, state, &mapper, &tlb, &RealHost)
        })
    };

    match action {
        ExitAction::Resume => (),
        // SAFETY: the dispatcher advanced RIP past the VMCALL.
        ExitAction::DisableVmx => unsafe { leave_vmx(&vmcs) },
        ExitAction::FatalHalt => hv_debugcon::fatal_halt(),
        ExitAction::FatalBeacon => hv_debugcon::beacon_loop(),
    }
}

/// Leave the guest running bare: restore its registers, stack, flags,
/// and instruction pointer, and jump — root mode never resumes.
///
/// # Safety
/// Must run on the exit path with the guest state block populated.
unsafe fn leave_vmx(vmcs: &RealVmcs) -> ! {
    // SAFETY: single-threaded exit path.
    unsafe {
        *RESUME_ESP.0.get() = vmcs.read(VmcsField::GuestRsp);
        *RESUME_EIP.0.get() = vmcs.read(VmcsField::GuestRip);
        *RESUME_EFLAGS.0.get() = vmcs.read(VmcsField::GuestRflags);
        asm!(
            "mov esp, dword ptr [{esp}]",
            "push dword ptr [{eflags}]",
            "popfd",
            "mov eax, dword ptr [{regs} + 0]",
            "mov ecx, dword ptr [{regs} + 4]",
            "mov edx, dword ptr [{regs} + 8]",
            "mov ebx, dword ptr [{regs} + 12]",
            "mov ebp, dword ptr [{regs} + 20]",
            "mov esi, dword ptr [{regs} + 24]",
            "mov edi, dword ptr [{regs} + 28]",
            "jmp dword ptr [{eip}]",
            esp = sym RESUME_ESP,
            eflags = sym RESUME_EFLAGS,
            eip = sym RESUME_EIP,
            regs = sym GUEST_REGS,
            options(noreturn)
        )
    }
}
