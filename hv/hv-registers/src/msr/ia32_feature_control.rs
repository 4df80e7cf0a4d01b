use bitfield_struct::bitfield;

/// `IA32_FEATURE_CONTROL` (0x3A).
///
/// The BIOS programs and locks this register; once the lock bit is set the
/// enable bits cannot change until reset. `VMXON` outside SMX requires
/// both `lock` and `enable_vmxon` to be set, otherwise it raises #GP.
#[bitfield(u64, order = Lsb)]
pub struct Ia32FeatureControl {
    /// Bit 0 — lock bit; the register is immutable once set.
    pub lock: bool,

    /// Bit 1 — enable VMXON inside SMX operation.
    pub enable_vmxon_smx: bool,

    /// Bit 2 — enable VMXON outside SMX operation.
    pub enable_vmxon: bool,

    /// Bits 3–63 — reserved / unrelated features.
    #[bits(61)]
    reserved: u64,
}

impl Ia32FeatureControl {
    /// Whether `VMXON` (outside SMX) is permitted as configured.
    #[must_use]
    pub const fn vmx_usable(self) -> bool {
        self.lock() && self.enable_vmxon()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_requires_lock_and_enable() {
        assert!(Ia32FeatureControl::from_bits(0b101).vmx_usable());
        assert!(!Ia32FeatureControl::from_bits(0b100).vmx_usable());
        assert!(!Ia32FeatureControl::from_bits(0b001).vmx_usable());
    }
}
