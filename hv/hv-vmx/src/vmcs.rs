//! VMCS field encodings and the access seam.

use hv_addr::PhysAddr;

/// VMCS component encodings used by this hypervisor (Intel SDM Vol. 3,
/// Appendix B). 64-bit components are accessed as low/high pairs, as a
/// 32-bit host must.
#[allow(missing_docs, clippy::doc_markdown)]
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum VmcsField {
    // 16-bit control fields
    Vpid = 0x0000,
    // 16-bit guest/host selector fields
    GuestEsSelector = 0x0800,
    GuestCsSelector = 0x0802,
    GuestSsSelector = 0x0804,
    GuestDsSelector = 0x0806,
    GuestFsSelector = 0x0808,
    GuestGsSelector = 0x080A,
    GuestTrSelector = 0x080E,
    HostEsSelector = 0x0C00,
    HostCsSelector = 0x0C02,
    HostSsSelector = 0x0C04,
    HostDsSelector = 0x0C06,
    HostFsSelector = 0x0C08,
    HostGsSelector = 0x0C0A,
    HostTrSelector = 0x0C0C,
    // 64-bit control fields (low/high)
    EptPointer = 0x201A,
    EptPointerHigh = 0x201B,
    VmcsLinkPointer = 0x2800,
    VmcsLinkPointerHigh = 0x2801,
    GuestIa32Debugctl = 0x2802,
    GuestIa32DebugctlHigh = 0x2803,
    // 64-bit read-only data fields
    GuestPhysicalAddress = 0x2400,
    GuestPhysicalAddressHigh = 0x2401,
    // 32-bit control fields
    PinBasedControls = 0x4000,
    CpuBasedControls = 0x4002,
    ExceptionBitmap = 0x4004,
    Cr3TargetCount = 0x400A,
    VmExitControls = 0x400C,
    VmEntryControls = 0x4012,
    SecondaryControls = 0x401E,
    // 32-bit read-only data fields
    VmInstructionError = 0x4400,
    ExitReason = 0x4402,
    VmExitInstructionLen = 0x440C,
    // 32-bit guest state
    GuestGdtrLimit = 0x4810,
    GuestIdtrLimit = 0x4812,
    GuestInterruptibility = 0x4824,
    // natural-width read-only data fields
    ExitQualification = 0x6400,
    GuestLinearAddress = 0x640A,
    // natural-width control fields
    Cr0GuestHostMask = 0x6000,
    Cr4GuestHostMask = 0x6002,
    // natural-width guest state
    GuestCr0 = 0x6800,
    GuestCr3 = 0x6802,
    GuestCr4 = 0x6804,
    GuestGdtrBase = 0x6816,
    GuestIdtrBase = 0x6818,
    GuestRsp = 0x681C,
    GuestRip = 0x681E,
    GuestRflags = 0x6820,
    // natural-width host state
    HostCr0 = 0x6C00,
    HostCr3 = 0x6C02,
    HostCr4 = 0x6C04,
    HostGdtrBase = 0x6C0C,
    HostIdtrBase = 0x6C0E,
    HostRsp = 0x6C14,
    HostRip = 0x6C16,
}

impl VmcsField {
    /// The raw component encoding.
    #[must_use]
    pub const fn encoding(self) -> u32 {
        self as u32
    }
}

/// Read/write access to the current VMCS.
///
/// The hardware implementation executes `VMREAD`/`VMWRITE`; tests back it
/// with a map. Natural-width fields are 32 bits wide on this host.
pub trait VmcsOps {
    fn read(&self, field: VmcsField) -> u32;
    fn write(&mut self, field: VmcsField, value: u32);

    /// Read a 64-bit component via its low/high pair.
    fn read64(&self, low: VmcsField, high: VmcsField) -> u64 {
        u64::from(self.read(low)) | (u64::from(self.read(high)) << 32)
    }

    /// Write a 64-bit component via its low/high pair.
    fn write64(&mut self, low: VmcsField, high: VmcsField, value: u64) {
        #[allow(clippy::cast_possible_truncation)]
        self.write(low, value as u32);
        #[allow(clippy::cast_possible_truncation)]
        self.write(high, (value >> 32) as u32);
    }

    /// The faulting guest-physical address of an EPT violation exit.
    fn guest_physical(&self) -> PhysAddr {
        PhysAddr::new(self.read64(
            VmcsField::GuestPhysicalAddress,
            VmcsField::GuestPhysicalAddressHigh,
        ))
    }
}

/// The 4 KiB VMXON/VMCS region layout: revision identifier, abort
/// indicator, then implementation-private data.
#[repr(C, align(4096))]
pub struct VmcsRegion {
    revision_id: u32,
    abort_indicator: u32,
    data: [u8; 4096 - 8],
}

impl VmcsRegion {
    /// A zeroed region stamped with the processor's VMCS revision
    /// identifier (from `IA32_VMX_BASIC`).
    #[must_use]
    pub const fn new(revision_id: u32) -> Self {
        Self {
            revision_id,
            abort_indicator: 0,
            data: [0; 4096 - 8],
        }
    }

    /// Clear the VMX-abort indicator (done before `VMLAUNCH`).
    pub const fn clear_abort_indicator(&mut self) {
        self.abort_indicator = 0;
    }

    #[must_use]
    pub const fn revision_id(&self) -> u32 {
        self.revision_id
    }
}
