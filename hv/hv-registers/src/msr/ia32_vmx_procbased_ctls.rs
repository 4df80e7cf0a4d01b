use bitfield_struct::bitfield;

/// `IA32_VMX_PROCBASED_CTLS` (0x482).
///
/// The low half reports the allowed-0 settings of the primary
/// processor-based execution controls, the high half the allowed-1
/// settings: a control may be set iff its allowed-1 bit is 1 and must be
/// set iff its allowed-0 bit is 1.
#[bitfield(u64, order = Lsb)]
pub struct Ia32VmxProcbasedCtls {
    /// Bits 0–31 — allowed-0 settings (1 = control is fixed on).
    pub allowed0: u32,

    /// Bits 32–62 — allowed-1 settings below the secondary-controls bit.
    #[bits(31)]
    allowed1_low: u32,

    /// Bit 63 — allowed-1 for "activate secondary controls" (bit 31 of
    /// the control field).
    pub activate_secondary_controls: bool,
}

impl Ia32VmxProcbasedCtls {
    /// Full allowed-1 mask of the control field.
    #[must_use]
    pub const fn allowed1(self) -> u32 {
        let high = if self.activate_secondary_controls() {
            1u32 << 31
        } else {
            0
        };
        self.allowed1_low() | high
    }

    /// Adjust a desired control value into the allowed envelope.
    #[must_use]
    pub const fn apply(self, desired: u32) -> u32 {
        (desired | self.allowed0()) & self.allowed1()
    }
}

/// `IA32_VMX_PROCBASED_CTLS2` (0x48B).
///
/// Allowed-1 report for the secondary execution controls; only present
/// when the primary controls allow activating them.
#[bitfield(u64, order = Lsb)]
pub struct Ia32VmxProcbasedCtls2 {
    /// Bits 0–31 — allowed-0 settings.
    pub allowed0: u32,

    /// Bit 32 — allowed-1 for "virtualize APIC accesses".
    pub virtualize_apic: bool,

    /// Bit 33 — allowed-1 for "enable EPT".
    pub enable_ept: bool,

    /// Bits 34–36 — descriptor-table exiting, RDTSCP, x2APIC mode.
    #[bits(3)]
    reserved0: u8,

    /// Bit 37 — allowed-1 for "enable VPID".
    pub enable_vpid: bool,

    /// Bits 38–63 — remaining secondary controls.
    #[bits(26)]
    reserved1: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secondary_bits() {
        let ctls2 = Ia32VmxProcbasedCtls2::from_bits((1 << 33) | (1 << 37));
        assert!(ctls2.enable_ept());
        assert!(ctls2.enable_vpid());
    }

    #[test]
    fn apply_respects_envelope() {
        // allowed0 = bit 1 fixed on, allowed1 = bits 0..8 permitted.
        let ctls = Ia32VmxProcbasedCtls::from_bits(0x0000_00FF_0000_0002);
        assert_eq!(ctls.apply(0x1_0000), 0x0002);
        assert_eq!(ctls.apply(0x0010), 0x0012);
    }

    #[test]
    fn secondary_controls_bit_is_63() {
        let ctls = Ia32VmxProcbasedCtls::from_bits(1 << 63);
        assert!(ctls.activate_secondary_controls());
        assert_eq!(ctls.allowed1(), 1 << 31);
    }
}
