use bitfield_struct::bitfield;

/// `IA32_VMX_EPT_VPID_CAP` (0x48C).
///
/// Capability report for EPT and VPID. The split engine depends on
/// execute-only EPT translations (bit 0); load aborts without it. The
/// individual-address `INVVPID` type (bit 40) is optional — when absent,
/// the all-context form is used instead.
#[bitfield(u64, order = Lsb)]
pub struct Ia32VmxEptVpidCap {
    /// Bit 0 — execute-only EPT translations supported.
    pub execute_only: bool,

    /// Bits 1–5 — reserved.
    #[bits(5)]
    reserved0: u8,

    /// Bit 6 — page-walk length 4 supported.
    pub walk_length_4: bool,

    /// Bit 7 — reserved.
    reserved1: bool,

    /// Bit 8 — EPT uncacheable memory type supported.
    pub memory_type_uc: bool,

    /// Bits 9–13 — reserved.
    #[bits(5)]
    reserved2: u8,

    /// Bit 14 — EPT write-back memory type supported.
    pub memory_type_wb: bool,

    /// Bit 15 — reserved.
    reserved3: bool,

    /// Bit 16 — 2 MiB EPT pages supported.
    pub page_2m: bool,

    /// Bits 17–19 — reserved.
    #[bits(3)]
    reserved4: u8,

    /// Bit 20 — `INVEPT` supported.
    pub invept: bool,

    /// Bits 21–24 — reserved.
    #[bits(4)]
    reserved5: u8,

    /// Bit 25 — single-context `INVEPT` supported.
    pub invept_single_context: bool,

    /// Bit 26 — all-context `INVEPT` supported.
    pub invept_all_context: bool,

    /// Bits 27–31 — reserved.
    #[bits(5)]
    reserved6: u8,

    /// Bit 32 — `INVVPID` supported.
    pub invvpid: bool,

    /// Bits 33–39 — reserved.
    #[bits(7)]
    reserved7: u8,

    /// Bit 40 — individual-address `INVVPID` (type 0) supported.
    pub invvpid_individual_address: bool,

    /// Bit 41 — single-context `INVVPID` supported.
    pub invvpid_single_context: bool,

    /// Bit 42 — all-context `INVVPID` supported.
    pub invvpid_all_context: bool,

    /// Bits 43–63 — reserved.
    #[bits(21)]
    reserved8: u32,
}
