//! VMX and support instructions, 32-bit encodings with explicit operands.

use crate::vmcs::VmcsField;
use core::arch::asm;

/// 16-byte `INVEPT` descriptor: EPTP plus reserved.
#[repr(C, align(16))]
struct InvEptDescriptor {
    eptp: u64,
    reserved: u64,
}

/// 16-byte `INVVPID` descriptor: VPID, reserved, linear address.
#[repr(C, align(16))]
struct InvVpidDescriptor {
    vpid: u16,
    reserved: [u16; 3],
    linear_address: u64,
}

/// Enter VMX operation with the given VMXON region.
///
/// # Safety
/// CPL 0, CR4.VMXE set, `IA32_FEATURE_CONTROL` locked with VMXON
/// enabled, and `region_phys` a 4 KiB-aligned region stamped with the
/// VMCS revision identifier.
pub unsafe fn vmxon(region_phys: u64) {
    unsafe {
        asm!("vmxon [{0}]", in(reg) &raw const region_phys, options(nostack));
    }
}

/// Leave VMX operation.
///
/// # Safety
/// CPL 0 in VMX root operation.
pub unsafe fn vmxoff() {
    unsafe {
        asm!("vmxoff", options(nomem, nostack));
    }
}

/// Initialise a VMCS region to the clear state.
///
/// # Safety
/// CPL 0 in VMX root operation; `region_phys` as for [`vmxon`].
pub unsafe fn vmclear(region_phys: u64) {
    unsafe {
        asm!("vmclear [{0}]", in(reg) &raw const region_phys, options(nostack));
    }
}

/// Make a VMCS region current.
///
/// # Safety
/// As for [`vmclear`].
pub unsafe fn vmptrld(region_phys: u64) {
    unsafe {
        asm!("vmptrld [{0}]", in(reg) &raw const region_phys, options(nostack));
    }
}

/// Launch the current VMCS. Returns only on failure.
///
/// # Safety
/// The current VMCS must hold complete, consistent guest and host state.
pub unsafe fn vmlaunch() {
    unsafe {
        asm!("vmlaunch", options(nostack));
    }
}

/// Read a VMCS component (natural width = 32 bits on this host).
///
/// # Safety
/// VMX root operation with a current VMCS holding the field.
#[must_use]
pub unsafe fn vmread(field: VmcsField) -> u32 {
    let value: u32;
    unsafe {
        asm!(
            "vmread {0}, {1}",
            out(reg) value,
            in(reg) field.encoding(),
            options(nostack)
        );
    }
    value
}

/// Write a VMCS component.
///
/// # Safety
/// As for [`vmread`], and the field must be writable.
pub unsafe fn vmwrite(field: VmcsField, value: u32) {
    unsafe {
        asm!(
            "vmwrite {0}, {1}",
            in(reg) field.encoding(),
            in(reg) value,
            options(nostack)
        );
    }
}

/// Invalidate all EPT-derived translations (type 2, all context).
///
/// # Safety
/// VMX root operation with EPT support.
pub unsafe fn invept_all_context() {
    let desc = InvEptDescriptor { eptp: 0, reserved: 0 };
    unsafe {
        asm!(
            "invept {0}, [{1}]",
            in(reg) 2u32,
            in(reg) &raw const desc,
            options(nostack)
        );
    }
}

/// Invalidate all VPID-tagged translations (type 2, all contexts).
///
/// # Safety
/// VMX root operation with VPID support.
pub unsafe fn invvpid_all_context() {
    let desc = InvVpidDescriptor {
        vpid: 0,
        reserved: [0; 3],
        linear_address: 0,
    };
    unsafe {
        asm!(
            "invvpid {0}, [{1}]",
            in(reg) 2u32,
            in(reg) &raw const desc,
            options(nostack)
        );
    }
}

/// Invalidate one linear address in one VPID (type 0).
///
/// # Safety
/// VMX root operation; the processor must report individual-address
/// `INVVPID` support.
pub unsafe fn invvpid_address(vpid: u16, linear: u32) {
    let desc = InvVpidDescriptor {
        vpid,
        reserved: [0; 3],
        linear_address: u64::from(linear),
    };
    unsafe {
        asm!(
            "invvpid {0}, [{1}]",
            in(reg) 0u32,
            in(reg) &raw const desc,
            options(nostack)
        );
    }
}

/// Guest-side hypercall with up to three arguments.
///
/// # Safety
/// Only meaningful in guest (non-root) execution under this hypervisor.
pub unsafe fn vmcall(eax: u32, ebx: u32, ecx: u32) {
    unsafe {
        asm!(
            "vmcall",
            in("eax") eax,
            in("ebx") ebx,
            in("ecx") ecx,
            options(nostack)
        );
    }
}

/// `CPUID`, preserving EBX for the register allocator.
#[must_use]
pub fn cpuid(leaf: u32, subleaf: u32) -> [u32; 4] {
    let eax: u32;
    let ebx: u32;
    let ecx: u32;
    let edx: u32;
    // SAFETY: CPUID is unprivileged and side-effect free.
    unsafe {
        asm!(
            "xchg {ebx_tmp}, ebx",
            "cpuid",
            "xchg {ebx_tmp}, ebx",
            ebx_tmp = out(reg) ebx,
            inout("eax") leaf => eax,
            inout("ecx") subleaf => ecx,
            out("edx") edx,
            options(nostack)
        );
    }
    [eax, ebx, ecx, edx]
}

/// `INVD` — invalidate caches without write-back.
///
/// # Safety
/// CPL 0; dirty cache lines are discarded.
pub unsafe fn invd() {
    unsafe {
        asm!("invd", options(nostack));
    }
}

/// Store the GDTR (6 bytes: limit + base).
///
/// # Safety
/// None beyond CPL 0 conventions; writes 6 bytes to the buffer.
#[must_use]
pub unsafe fn sgdt() -> (u16, u32) {
    let mut buf = [0u8; 6];
    unsafe {
        asm!("sgdt [{0}]", in(reg) buf.as_mut_ptr(), options(nostack));
    }
    (
        u16::from_le_bytes([buf[0], buf[1]]),
        u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
    )
}

/// Store the IDTR (6 bytes: limit + base).
///
/// # Safety
/// As for [`sgdt`].
#[must_use]
pub unsafe fn sidt() -> (u16, u32) {
    let mut buf = [0u8; 6];
    unsafe {
        asm!("sidt [{0}]", in(reg) buf.as_mut_ptr(), options(nostack));
    }
    (
        u16::from_le_bytes([buf[0], buf[1]]),
        u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
    )
}

/// Store the task register selector.
///
/// # Safety
/// CPL 0 conventions.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn str_tr() -> u16 {
    let tr: u32;
    unsafe {
        asm!("str {0:e}", out(reg) tr, options(nomem, nostack));
    }
    tr as u16
}

/// Read a segment selector register.
macro_rules! read_selector {
    ($name:ident, $reg:literal) => {
        #[doc = concat!("Read the ", $reg, " selector.")]
        #[must_use]
        #[allow(clippy::cast_possible_truncation)]
        pub fn $name() -> u16 {
            let sel: u32;
            // SAFETY: reading a selector has no side effects.
            unsafe {
                asm!(concat!("mov {0:e}, ", $reg), out(reg) sel, options(nomem, nostack));
            }
            sel as u16
        }
    };
}

read_selector!(read_es, "es");
read_selector!(read_cs, "cs");
read_selector!(read_ss, "ss");
read_selector!(read_ds, "ds");
read_selector!(read_fs, "fs");
read_selector!(read_gs, "gs");
