//! VMX capability probing and validation.

use hv_registers::msr::{
    Ia32FeatureControl, Ia32VmxBasic, Ia32VmxEptVpidCap, Ia32VmxProcbasedCtls,
    Ia32VmxProcbasedCtls2,
};

/// Bring-up failures. Any of these aborts the load before `VMXON`, so the
/// system is left in its ordinary non-VMX state.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum VmxSetupError {
    #[error("IA32_FEATURE_CONTROL does not permit VMXON (lock/enable bits)")]
    VmxonDisabled,
    #[error("processor lacks secondary execution controls")]
    NoSecondaryControls,
    #[error("processor lacks EPT support")]
    NoEpt,
    #[error("processor lacks VPID support")]
    NoVpid,
    #[error("processor lacks execute-only EPT translations")]
    NoExecuteOnlyEpt,
    #[error("guest runs PAE paging; CR4.PAE must be clear")]
    PaeEnabled,
    #[error("frame arena could not supply the VMX regions")]
    AllocationFailed,
    #[error("VMLAUNCH failed with VM-instruction error {0}")]
    LaunchFailed(u32),
}

/// Snapshot of the capability MSRs consulted during bring-up.
#[derive(Copy, Clone, Debug)]
pub struct VmxCapabilities {
    pub feature_control: Ia32FeatureControl,
    pub basic: Ia32VmxBasic,
    pub proc_ctls: Ia32VmxProcbasedCtls,
    pub proc_ctls2: Ia32VmxProcbasedCtls2,
    pub ept_vpid: Ia32VmxEptVpidCap,
}

impl VmxCapabilities {
    /// Build a snapshot from raw MSR values (probing reads them from the
    /// hardware; tests inject them).
    #[must_use]
    pub const fn from_raw(
        feature_control: u64,
        basic: u64,
        proc_ctls: u64,
        proc_ctls2: u64,
        ept_vpid: u64,
    ) -> Self {
        Self {
            feature_control: Ia32FeatureControl::from_bits(feature_control),
            basic: Ia32VmxBasic::from_bits(basic),
            proc_ctls: Ia32VmxProcbasedCtls::from_bits(proc_ctls),
            proc_ctls2: Ia32VmxProcbasedCtls2::from_bits(proc_ctls2),
            ept_vpid: Ia32VmxEptVpidCap::from_bits(ept_vpid),
        }
    }

    /// Check every capability the split depends on.
    ///
    /// # Errors
    /// The first missing capability, in bring-up order.
    pub const fn validate(&self) -> Result<(), VmxSetupError> {
        if !self.feature_control.vmx_usable() {
            return Err(VmxSetupError::VmxonDisabled);
        }
        if !self.proc_ctls.activate_secondary_controls() {
            return Err(VmxSetupError::NoSecondaryControls);
        }
        if !self.proc_ctls2.enable_ept() {
            return Err(VmxSetupError::NoEpt);
        }
        if !self.proc_ctls2.enable_vpid() {
            return Err(VmxSetupError::NoVpid);
        }
        if !self.ept_vpid.execute_only() {
            return Err(VmxSetupError::NoExecuteOnlyEpt);
        }
        Ok(())
    }

    /// Whether `INVVPID` type 0 (individual address) may be used.
    #[must_use]
    pub const fn individual_invvpid(&self) -> bool {
        self.ept_vpid.invvpid_individual_address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Everything present: FEATURE_CONTROL lock+enable, secondary
    /// controls, EPT, VPID, execute-only, individual INVVPID.
    fn full_caps() -> VmxCapabilities {
        VmxCapabilities::from_raw(
            0b101,
            0x0000_1000_0000_0001,
            1 << 63,
            (1 << 33) | (1 << 37),
            1 | (1 << 40),
        )
    }

    #[test]
    fn full_capabilities_validate() {
        assert_eq!(full_caps().validate(), Ok(()));
        assert!(full_caps().individual_invvpid());
    }

    #[test]
    fn missing_execute_only_aborts_bring_up() {
        let caps = VmxCapabilities::from_raw(0b101, 0, 1 << 63, (1 << 33) | (1 << 37), 1 << 40);
        assert_eq!(caps.validate(), Err(VmxSetupError::NoExecuteOnlyEpt));
    }

    #[test]
    fn each_missing_capability_reports_precisely() {
        let cases: &[(u64, u64, u64, u64, VmxSetupError)] = &[
            (0b100, 1 << 63, (1 << 33) | (1 << 37), 1, VmxSetupError::VmxonDisabled),
            (0b101, 0, (1 << 33) | (1 << 37), 1, VmxSetupError::NoSecondaryControls),
            (0b101, 1 << 63, 1 << 37, 1, VmxSetupError::NoEpt),
            (0b101, 1 << 63, 1 << 33, 1, VmxSetupError::NoVpid),
        ];
        for (fc, ctls, ctls2, cap, expected) in cases {
            let caps = VmxCapabilities::from_raw(*fc, 0, *ctls, *ctls2, *cap);
            assert_eq!(caps.validate(), Err(expected.clone()));
        }
    }
}
