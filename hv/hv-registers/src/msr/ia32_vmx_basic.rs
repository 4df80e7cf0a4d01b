use bitfield_struct::bitfield;

/// `IA32_VMX_BASIC` (0x480).
///
/// Reports the VMCS revision identifier (which software must write into
/// the first word of the VMXON and VMCS regions) and the region size.
#[bitfield(u64, order = Lsb)]
pub struct Ia32VmxBasic {
    /// Bits 0–30 — VMCS revision identifier.
    #[bits(31)]
    pub revision_id: u32,

    /// Bit 31 — always 0.
    #[bits(default = false)]
    _always0: bool,

    /// Bits 32–44 — bytes to allocate for the VMXON/VMCS regions.
    #[bits(13)]
    pub region_size: u16,

    /// Bits 45–47 — reserved.
    #[bits(3)]
    reserved0: u8,

    /// Bit 48 — physical addresses in VMX structures limited to 32 bits.
    pub addr_width_32: bool,

    /// Bit 49 — dual-monitor treatment of SMI/SMM supported.
    pub dual_monitor: bool,

    /// Bits 50–53 — memory type the processor uses for VMCS access.
    #[bits(4)]
    pub vmcs_memory_type: u8,

    /// Bit 54 — INS/OUTS information reported on VM exits.
    pub ins_outs_report: bool,

    /// Bits 55–63 — reserved / true-controls report.
    #[bits(9)]
    reserved1: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_extraction() {
        let basic = Ia32VmxBasic::from_bits(0x0000_1000_0000_0011);
        assert_eq!(basic.revision_id(), 0x11);
        assert_eq!(basic.region_size(), 0x1000);
    }
}
