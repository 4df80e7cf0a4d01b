//! The process-wide hypervisor state block and VM-exit dispatch.

use crate::caps::{VmxCapabilities, VmxSetupError};
use crate::exit::{CrAccessQual, ExitAction, ExitReason};
use crate::guest_state::GuestState;
use crate::msr_policy::MsrWriteBlockList;
use crate::protect::ProtectedImage;
use crate::vmcs::{VmcsField, VmcsOps};
use crate::{VMCALL_DISABLE, VMCALL_END_SPLIT, VMCALL_INIT_SPLIT, VMCALL_MEASURE};
use hv_addr::{GuestVirtAddr, PhysAddr, PhysMapper};
use hv_arena::FrameArena;
use hv_ept::{EptPointer, EptViolationQual, IdentityMap};
use hv_registers::eflags::Eflags;
use hv_registers::msr::Msr;
use hv_split::{SplitEngine, TlbFlush, TranslationTable, TrapOutcome, ViolationOutcome};
use hv_sync::SpinLock;
use log::{debug, error, info, warn};

/// Host-side instruction execution on behalf of the guest.
///
/// Real `CPUID`/`INVD`/`RDMSR`/`WRMSR` in the hardware layer; a recording
/// fake in tests.
pub trait HostOps {
    /// Execute `CPUID` with the given leaf/subleaf; returns
    /// `[eax, ebx, ecx, edx]`.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> [u32; 4];
    /// Execute `INVD`.
    fn invd(&self);
    /// Read an MSR.
    fn rdmsr(&self, msr: Msr) -> u64;
    /// Write an MSR.
    fn wrmsr(&self, msr: Msr, value: u64);
}

/// The one hypervisor instance, populated at load and emptied at unload.
pub static HYPERVISOR: SpinLock<Option<Hypervisor>> = SpinLock::new(None);

/// Everything VMX root mode owns.
#[derive(Debug)]
pub struct Hypervisor {
    pub(crate) arena: FrameArena,
    pub(crate) ept: Option<IdentityMap>,
    pub(crate) engine: SplitEngine,
    caps: VmxCapabilities,
    msr_blocks: MsrWriteBlockList,
    pub(crate) staged_table: Option<TranslationTable>,
    pub(crate) protected: Option<ProtectedImage>,
}

impl Hypervisor {
    /// Validate capabilities and build the identity map from a fresh
    /// arena of `num_frames` frames.
    ///
    /// # Errors
    /// Capability gaps abort the load; allocation failures free whatever
    /// was taken and abort.
    pub fn new(caps: VmxCapabilities, num_frames: usize) -> Result<Self, VmxSetupError> {
        caps.validate()?;
        let mut arena =
            FrameArena::new(num_frames).map_err(|_| VmxSetupError::AllocationFailed)?;
        let ept = IdentityMap::new(&mut arena).map_err(|_| VmxSetupError::AllocationFailed)?;
        Ok(Self {
            arena,
            ept: Some(ept),
            engine: SplitEngine::new(),
            caps,
            msr_blocks: MsrWriteBlockList::new(),
            staged_table: None,
            protected: None,
        })
    }

    /// The EPTP value for the VMCS.
    ///
    /// # Panics
    /// Panics if called after [`Hypervisor::release`].
    #[must_use]
    pub fn eptp(&self) -> EptPointer {
        self.ept.as_ref().expect("identity map released").eptp()
    }

    /// Capability snapshot taken at load.
    #[must_use]
    pub const fn capabilities(&self) -> &VmxCapabilities {
        &self.caps
    }

    /// The split engine (exposed for measurement and inspection).
    #[must_use]
    pub const fn engine(&self) -> &SplitEngine {
        &self.engine
    }

    /// MSR write policy counters.
    #[must_use]
    pub const fn msr_blocks(&self) -> &MsrWriteBlockList {
        &self.msr_blocks
    }

    /// Unload-path teardown: end any active split, restore the identity
    /// map frames to the arena, and drop the state block.
    pub fn release(mut self, tlb: &impl TlbFlush) {
        self.engine.end_split(tlb);
        self.engine.clear_tracker();
        if let Some(protected) = self.protected.take() {
            protected.release(&mut self.arena);
        }
        if let Some(ept) = self.ept.take() {
            ept.release(&mut self.arena);
        }
        for (msr, count) in self.msr_blocks.counts() {
            if count > 0 {
                info!("guest attempted {count} blocked writes to {msr:?}");
            }
        }
    }

    /// Dispatch one VM exit. Returns what the exit stub should do.
    pub fn handle_exit<V, M, T, H>(
        &mut self,
        vmcs: &mut V,
        state: &mut GuestState,
        mapper: &M,
        tlb: &T,
        host: &H,
    ) -> ExitAction
    where
        V: VmcsOps,
        M: PhysMapper,
        T: TlbFlush,
        H: HostOps,
    {
        let reason = ExitReason::from_bits(vmcs.read(VmcsField::ExitReason));
        match reason {
            ExitReason::VmxInstruction => {
                // The guest gets no VMX of its own; swallow the
                // instruction.
                advance_rip(vmcs);
                ExitAction::Resume
            }
            ExitReason::Vmcall => {
                advance_rip(vmcs);
                self.handle_vmcall(vmcs, state, mapper, tlb)
            }
            ExitReason::Invd => {
                advance_rip(vmcs);
                host.invd();
                ExitAction::Resume
            }
            ExitReason::Cpuid => {
                let [eax, ebx, ecx, edx] = host.cpuid(state.eax, state.ecx);
                state.eax = eax;
                state.ebx = ebx;
                state.ecx = ecx;
                state.edx = edx;
                advance_rip(vmcs);
                ExitAction::Resume
            }
            ExitReason::Rdmsr => {
                let value = host.rdmsr(Msr(state.ecx));
                #[allow(clippy::cast_possible_truncation)]
                {
                    state.eax = value as u32;
                    state.edx = (value >> 32) as u32;
                }
                advance_rip(vmcs);
                ExitAction::Resume
            }
            ExitReason::Wrmsr => {
                let msr = Msr(state.ecx);
                if !self.msr_blocks.filter_write(msr) {
                    let value = (u64::from(state.edx) << 32) | u64::from(state.eax);
                    host.wrmsr(msr, value);
                }
                advance_rip(vmcs);
                ExitAction::Resume
            }
            ExitReason::CrAccess => {
                self.handle_cr_access(vmcs, state, mapper, tlb);
                advance_rip(vmcs);
                ExitAction::Resume
            }
            ExitReason::EptViolation => {
                // No RIP advance: the faulting access is replayed with
                // the freshly installed view.
                let mut exit = SplitVmcs(vmcs);
                match self.engine.on_ept_violation(&mut exit, mapper, tlb) {
                    ViolationOutcome::Fatal => {
                        error!("EPT violation that is neither fetch nor data access");
                        ExitAction::FatalHalt
                    }
                    _ => ExitAction::Resume,
                }
            }
            ExitReason::ExceptionOrNmi => {
                // No RIP advance: the trap is consumed, the guest
                // continues at the interrupted point.
                let mut exit = SplitVmcs(vmcs);
                match self.engine.on_trap(&mut exit, tlb) {
                    TrapOutcome::Completed => ExitAction::Resume,
                    TrapOutcome::NotSplitInduced => {
                        error!("debug trap with no pending split page");
                        ExitAction::FatalBeacon
                    }
                }
            }
            ExitReason::EptMisconfiguration => {
                error!("EPT misconfiguration");
                ExitAction::FatalHalt
            }
            ExitReason::TripleFault => {
                error!("guest triple fault");
                ExitAction::FatalBeacon
            }
            ExitReason::ExternalInterrupt | ExitReason::Unknown(_) => {
                error!("unhandled VM-exit reason {reason:?}");
                ExitAction::FatalBeacon
            }
        }
    }

    fn with_ept<R>(&mut self, f: impl FnOnce(&mut Self, &mut IdentityMap) -> R) -> Option<R> {
        let mut ept = self.ept.take()?;
        let result = f(self, &mut ept);
        self.ept = Some(ept);
        Some(result)
    }

    fn handle_cr_access<V, M, T>(&mut self, vmcs: &mut V, state: &mut GuestState, mapper: &M, tlb: &T)
    where
        V: VmcsOps,
        M: PhysMapper,
        T: TlbFlush,
    {
        let qual = CrAccessQual::from_bits(vmcs.read(VmcsField::ExitQualification));
        if qual.cr_number() != 3 {
            debug!("unexpected CR{} access exit", qual.cr_number());
            return;
        }
        match qual.access_type() {
            CrAccessQual::ACCESS_MOV_TO_CR => {
                let value = state.gpr(qual.gpr());
                vmcs.write(VmcsField::GuestCr3, value);
                self.with_ept(|hv, ept| {
                    hv.engine
                        .on_cr3_write(value, mapper, ept, &mut hv.arena, tlb);
                });
            }
            CrAccessQual::ACCESS_MOV_FROM_CR => {
                let value = vmcs.read(VmcsField::GuestCr3);
                state.set_gpr(qual.gpr(), value);
            }
            other => debug!("unhandled CR3 access type {other}"),
        }
    }

    fn handle_vmcall<V, M, T>(
        &mut self,
        _vmcs: &mut V,
        state: &GuestState,
        mapper: &M,
        tlb: &T,
    ) -> ExitAction
    where
        V: VmcsOps,
        M: PhysMapper,
        T: TlbFlush,
    {
        match state.eax {
            VMCALL_DISABLE => {
                info!("guest requested hypervisor disable");
                ExitAction::DisableVmx
            }
            VMCALL_INIT_SPLIT => {
                if state.ebx == 0 {
                    // Fatal precondition violation per the ABI.
                    error!("init-split VMCALL with null table pointer");
                    return ExitAction::FatalBeacon;
                }
                let Some(table) = self.staged_table.take() else {
                    warn!("init-split VMCALL without a staged table");
                    return ExitAction::Resume;
                };
                let result = self.with_ept(|hv, ept| {
                    hv.engine.init_split(table, ept, &mut hv.arena, tlb)
                });
                if let Some(Err(e)) = result {
                    warn!("init-split failed: {e}");
                }
                ExitAction::Resume
            }
            VMCALL_END_SPLIT => {
                self.engine.end_split(tlb);
                ExitAction::Resume
            }
            VMCALL_MEASURE => {
                self.measure(
                    PhysAddr::new(u64::from(state.ebx)),
                    GuestVirtAddr::new(state.ecx),
                    mapper,
                );
                ExitAction::Resume
            }
            other => {
                debug!("unknown VMCALL {other:#x}");
                ExitAction::Resume
            }
        }
    }
}

/// Move the guest past the instruction the core just emulated.
fn advance_rip<V: VmcsOps>(vmcs: &mut V) {
    let rip = vmcs
        .read(VmcsField::GuestRip)
        .wrapping_add(vmcs.read(VmcsField::VmExitInstructionLen));
    vmcs.write(VmcsField::GuestRip, rip);
}

/// Adapter exposing the split engine's VMCS slice over [`VmcsOps`].
struct SplitVmcs<'a, V: VmcsOps>(&'a mut V);

impl<V: VmcsOps> hv_split::ExitVmcs for SplitVmcs<'_, V> {
    fn guest_physical(&self) -> PhysAddr {
        self.0.guest_physical()
    }

    fn exit_qualification(&self) -> EptViolationQual {
        EptViolationQual::from_bits(u64::from(self.0.read(VmcsField::ExitQualification)))
    }

    fn guest_rip(&self) -> u32 {
        self.0.read(VmcsField::GuestRip)
    }

    fn instruction_len(&self) -> u32 {
        self.0.read(VmcsField::VmExitInstructionLen)
    }

    fn set_trap_flag(&mut self, enabled: bool) {
        let flags = Eflags::from_bits(self.0.read(VmcsField::GuestRflags)).with_tf(enabled);
        self.0.write(VmcsField::GuestRflags, flags.into_bits());
    }
}
