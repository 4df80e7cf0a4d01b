//! Exit reasons and dispatch outcomes.

use bitfield_struct::bitfield;

/// Basic VM-exit reasons handled by the dispatcher (Intel SDM Vol. 3,
/// Appendix C). Everything else lands in `Unknown` and halts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExitReason {
    /// Exception or NMI — the split engine's single-step trap arrives
    /// here.
    ExceptionOrNmi,
    ExternalInterrupt,
    TripleFault,
    Cpuid,
    Invd,
    Vmcall,
    /// Any other VMX instruction executed by the guest (`VMCLEAR`,
    /// `VMLAUNCH`, `VMPTRLD`, `VMPTRST`, `VMREAD`, `VMRESUME`, `VMWRITE`,
    /// `VMXOFF`, `VMXON`) — treated as a no-op.
    VmxInstruction,
    CrAccess,
    Rdmsr,
    Wrmsr,
    EptViolation,
    EptMisconfiguration,
    Unknown(u16),
}

impl ExitReason {
    /// Decode the low 16 bits of the `EXIT_REASON` VMCS field.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_bits(raw: u32) -> Self {
        match raw as u16 {
            0 => Self::ExceptionOrNmi,
            1 => Self::ExternalInterrupt,
            2 => Self::TripleFault,
            10 => Self::Cpuid,
            13 => Self::Invd,
            18 => Self::Vmcall,
            19..=27 => Self::VmxInstruction,
            28 => Self::CrAccess,
            31 => Self::Rdmsr,
            32 => Self::Wrmsr,
            48 => Self::EptViolation,
            49 => Self::EptMisconfiguration,
            other => Self::Unknown(other),
        }
    }
}

/// What the dispatcher tells the exit stub to do next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExitAction {
    /// Restore the guest registers and `VMRESUME`.
    Resume,
    /// Leave VMX operation: restore the guest's registers, stack, and
    /// instruction pointer, and continue in root-mode-off. No EPT
    /// teardown happens here; unload performs it.
    DisableVmx,
    /// Unrecoverable state (EPT misconfiguration): mask interrupts and
    /// halt.
    FatalHalt,
    /// Unrecoverable and worth signalling (triple fault, unknown exit,
    /// fatal precondition): beep forever.
    FatalBeacon,
}

/// Exit qualification of a control-register access exit.
#[bitfield(u32, order = Lsb)]
pub struct CrAccessQual {
    /// Bits 0–3 — control register number.
    #[bits(4)]
    pub cr_number: u8,

    /// Bits 4–5 — access type: 0 = MOV to CR, 1 = MOV from CR, 2 = CLTS,
    /// 3 = LMSW.
    #[bits(2)]
    pub access_type: u8,

    /// Bit 6 — LMSW operand type.
    pub lmsw_memory_operand: bool,

    /// Bit 7 — reserved.
    reserved0: bool,

    /// Bits 8–11 — GPR of a MOV CR access.
    #[bits(4)]
    pub gpr: u8,

    /// Bits 12–15 — reserved.
    #[bits(4)]
    reserved1: u8,

    /// Bits 16–31 — LMSW source data.
    pub lmsw_source: u16,
}

impl CrAccessQual {
    /// MOV to CR (a guest write).
    pub const ACCESS_MOV_TO_CR: u8 = 0;
    /// MOV from CR (a guest read).
    pub const ACCESS_MOV_FROM_CR: u8 = 1;
}
