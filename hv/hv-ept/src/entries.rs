//! Bit-exact EPT structure layouts.
//!
//! Unlike ordinary page tables there is no "present" bit; an entry is
//! usable when any of read/write/execute is granted, and clearing all
//! three makes the next access raise an EPT violation. `present` here
//! names the read-permission bit, matching how the split engine uses it.

use bitfield_struct::bitfield;
use hv_addr::PhysAddr;

/// EPT memory types (Intel SDM Vol. 3, table of EPT memory type encodings).
pub struct EptMemType;

impl EptMemType {
    /// Uncacheable.
    pub const UC: u8 = 0;
    /// Write combining.
    pub const WC: u8 = 1;
    /// Write through.
    pub const WT: u8 = 4;
    /// Write protected.
    pub const WP: u8 = 5;
    /// Write back — what the identity map uses for RAM.
    pub const WB: u8 = 6;
}

/// The EPTP value written to the VMCS `EPT_POINTER` field.
#[bitfield(u64, order = Lsb)]
pub struct EptPointer {
    /// Bits 0–2 — memory type for EPT structure accesses (UC here).
    #[bits(3)]
    pub memory_type: u8,

    /// Bits 3–5 — page-walk length minus one (3 for a 4-level walk).
    #[bits(3)]
    pub walk_length: u8,

    /// Bit 6 — enable accessed/dirty flags.
    pub enable_access_dirty: bool,

    /// Bits 7–11 — reserved.
    #[bits(5)]
    reserved0: u8,

    /// Bits 12–51 — physical frame of the EPT PML4 table.
    #[bits(40)]
    frame: u64,

    /// Bits 52–63 — reserved.
    #[bits(12)]
    reserved1: u16,
}

impl EptPointer {
    /// EPTP for a PML4 at `pml4` with a 4-level walk and UC structure
    /// accesses.
    #[must_use]
    pub const fn for_pml4(pml4: PhysAddr) -> Self {
        Self::new()
            .with_memory_type(EptMemType::UC)
            .with_walk_length(3)
            .with_frame(pml4.as_u64() >> 12)
    }

    /// Physical address of the PML4.
    #[must_use]
    pub const fn pml4_phys(self) -> PhysAddr {
        PhysAddr::new(self.frame() << 12)
    }
}

/// EPT PML4 entry — references one PDPT covering 512 GiB.
#[bitfield(u64, order = Lsb)]
pub struct EptPml4Entry {
    /// Bit 0 — read permission for the 512 GiB region.
    pub present: bool,

    /// Bit 1 — write permission.
    pub write: bool,

    /// Bit 2 — execute permission.
    pub execute: bool,

    /// Bits 3–11 — reserved / ignored.
    #[bits(9)]
    reserved0: u16,

    /// Bits 12–51 — physical frame of the PDPT.
    #[bits(40)]
    frame: u64,

    /// Bits 52–63 — ignored.
    #[bits(12)]
    reserved1: u16,
}

impl EptPml4Entry {
    /// A fully permissive reference to the PDPT at `pdpt`.
    #[must_use]
    pub const fn referencing(pdpt: PhysAddr) -> Self {
        Self::new()
            .with_present(true)
            .with_write(true)
            .with_execute(true)
            .with_frame(pdpt.as_u64() >> 12)
    }

    /// Physical address of the referenced PDPT.
    #[must_use]
    pub const fn pdpt_phys(self) -> PhysAddr {
        PhysAddr::new(self.frame() << 12)
    }
}

/// EPT PDPTE — references one page directory covering 1 GiB.
#[bitfield(u64, order = Lsb)]
pub struct EptPdpte {
    /// Bit 0 — read permission for the 1 GiB region.
    pub present: bool,

    /// Bit 1 — write permission.
    pub write: bool,

    /// Bit 2 — execute permission.
    pub execute: bool,

    /// Bits 3–11 — reserved / ignored.
    #[bits(9)]
    reserved0: u16,

    /// Bits 12–51 — physical frame of the page directory.
    #[bits(40)]
    frame: u64,

    /// Bits 52–63 — ignored.
    #[bits(12)]
    reserved1: u16,
}

impl EptPdpte {
    /// A fully permissive reference to the page directory at `pd`.
    #[must_use]
    pub const fn referencing(pd: PhysAddr) -> Self {
        Self::new()
            .with_present(true)
            .with_write(true)
            .with_execute(true)
            .with_frame(pd.as_u64() >> 12)
    }

    /// Physical address of the referenced page directory.
    #[must_use]
    pub const fn pd_phys(self) -> PhysAddr {
        PhysAddr::new(self.frame() << 12)
    }
}

/// EPT PDE, 2 MiB-leaf form (`size = 1`).
#[bitfield(u64, order = Lsb)]
pub struct EptPde2M {
    /// Bit 0 — read permission.
    pub present: bool,

    /// Bit 1 — write permission.
    pub write: bool,

    /// Bit 2 — execute permission.
    pub execute: bool,

    /// Bits 3–5 — EPT memory type of the mapping.
    #[bits(3)]
    pub memory_type: u8,

    /// Bit 6 — ignore guest PAT.
    pub ignore_pat: bool,

    /// Bit 7 — must be 1 for this form.
    pub size: bool,

    /// Bits 8–20 — ignored / reserved (must be 0 up to bit 20).
    #[bits(13)]
    reserved0: u16,

    /// Bits 21–51 — physical frame of the 2 MiB page.
    #[bits(31)]
    frame_2m: u64,

    /// Bits 52–63 — ignored.
    #[bits(12)]
    reserved1: u16,
}

impl EptPde2M {
    /// An identity 2 MiB leaf: region index `i` maps physical
    /// `i * 2 MiB`, fully permissive, write-back.
    #[must_use]
    pub const fn identity(region: u64) -> Self {
        Self::new()
            .with_present(true)
            .with_write(true)
            .with_execute(true)
            .with_memory_type(EptMemType::WB)
            .with_size(true)
            .with_frame_2m(region)
    }

    /// Physical base of the mapped 2 MiB page.
    #[must_use]
    pub const fn page_phys(self) -> PhysAddr {
        PhysAddr::new(self.frame_2m() << 21)
    }
}

/// EPT PDE, page-table-reference form (`size = 0`).
#[bitfield(u64, order = Lsb)]
pub struct EptPdeRef {
    /// Bit 0 — read permission.
    pub present: bool,

    /// Bit 1 — write permission.
    pub write: bool,

    /// Bit 2 — execute permission.
    pub execute: bool,

    /// Bits 3–6 — reserved for this form (memory type is meaningless).
    #[bits(4)]
    reserved0: u8,

    /// Bit 7 — must be 0 for this form.
    pub size: bool,

    /// Bits 8–11 — ignored.
    #[bits(4)]
    reserved1: u8,

    /// Bits 12–51 — physical frame of the page table.
    #[bits(40)]
    frame: u64,

    /// Bits 52–63 — ignored.
    #[bits(12)]
    reserved2: u16,
}

impl EptPdeRef {
    /// A fully permissive reference to the page table at `table`.
    #[must_use]
    pub const fn referencing(table: PhysAddr) -> Self {
        Self::new()
            .with_present(true)
            .with_write(true)
            .with_execute(true)
            .with_frame(table.as_u64() >> 12)
    }

    /// Physical address of the referenced page table.
    #[must_use]
    pub const fn table_phys(self) -> PhysAddr {
        PhysAddr::new(self.frame() << 12)
    }
}

/// EPT PDE overlay — the same 64-bit slot read as either form, chosen by
/// the `size` bit.
#[derive(Copy, Clone)]
#[repr(C)]
pub union EptPdeUnion {
    bits: u64,
    table: EptPdeRef,
    leaf_2m: EptPde2M,
}

/// Borrowed view into an [`EptPdeUnion`], discriminated by the `size` bit.
pub enum EptPdeView<'a> {
    /// Page-table reference (`size = 0`).
    Table(&'a EptPdeRef),
    /// 2 MiB leaf (`size = 1`).
    Leaf2M(&'a EptPde2M),
}

impl EptPdeUnion {
    const SIZE_BIT: u64 = 1 << 7;

    /// Construct from raw bits (no validation).
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    /// Raw bits of the entry.
    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u64 {
        // SAFETY: all variants are plain 64-bit data.
        unsafe { self.bits }
    }

    /// Typed read-only view chosen by the `size` bit.
    #[inline]
    #[must_use]
    pub const fn view(&self) -> EptPdeView<'_> {
        // SAFETY: both forms are layout-identical 64-bit bitfields.
        unsafe {
            if self.bits & Self::SIZE_BIT != 0 {
                EptPdeView::Leaf2M(&self.leaf_2m)
            } else {
                EptPdeView::Table(&self.table)
            }
        }
    }

    /// Whether the slot is currently a 2 MiB leaf.
    #[inline]
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        // SAFETY: plain data.
        unsafe { self.bits & Self::SIZE_BIT != 0 }
    }
}

/// EPT PTE — maps one 4 KiB frame.
#[bitfield(u64, order = Lsb)]
pub struct EptPte {
    /// Bit 0 — read permission.
    pub present: bool,

    /// Bit 1 — write permission.
    pub write: bool,

    /// Bit 2 — execute permission.
    pub execute: bool,

    /// Bits 3–5 — EPT memory type of the mapping.
    #[bits(3)]
    pub memory_type: u8,

    /// Bit 6 — ignore guest PAT.
    pub ignore_pat: bool,

    /// Bits 7–11 — ignored.
    #[bits(5)]
    reserved0: u8,

    /// Bits 12–51 — physical frame of the mapped page.
    #[bits(40)]
    frame: u64,

    /// Bits 52–63 — ignored.
    #[bits(12)]
    reserved1: u16,
}

impl EptPte {
    /// A fully permissive write-back identity mapping of `page`.
    #[must_use]
    pub const fn identity(page: PhysAddr) -> Self {
        Self::new()
            .with_present(true)
            .with_write(true)
            .with_execute(true)
            .with_memory_type(EptMemType::WB)
            .with_frame(page.as_u64() >> 12)
    }

    /// Physical base of the mapped page.
    #[must_use]
    pub const fn page_phys(self) -> PhysAddr {
        PhysAddr::new(self.frame() << 12)
    }

    /// Replace the mapped frame, keeping permission and type bits.
    #[must_use]
    pub const fn with_page_phys(self, page: PhysAddr) -> Self {
        self.with_frame(page.as_u64() >> 12)
    }

    /// Whether any access right is granted.
    #[must_use]
    pub const fn any_access(self) -> bool {
        self.present() || self.write() || self.execute()
    }
}

/// Exit qualification reported with an EPT-violation VM exit.
#[bitfield(u64, order = Lsb)]
pub struct EptViolationQual {
    /// Bit 0 — the access was a data read.
    pub data_read: bool,

    /// Bit 1 — the access was a data write.
    pub data_write: bool,

    /// Bit 2 — the access was an instruction fetch.
    pub instruction_fetch: bool,

    /// Bit 3 — the translation allowed reads.
    pub was_readable: bool,

    /// Bit 4 — the translation allowed writes.
    pub was_writable: bool,

    /// Bit 5 — the translation allowed execution.
    pub was_executable: bool,

    /// Bit 6 — reserved.
    reserved0: bool,

    /// Bit 7 — the guest-linear-address field is valid.
    pub guest_linear_valid: bool,

    /// Bit 8 — the violation occurred during translation, not access.
    pub during_translation: bool,

    /// Bits 9–63 — reserved / later additions.
    #[bits(55)]
    reserved1: u64,
}

impl EptViolationQual {
    /// Whether the faulting access was a data read or write.
    #[must_use]
    pub const fn is_data_access(self) -> bool {
        self.data_read() || self.data_write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eptp_layout() {
        let eptp = EptPointer::for_pml4(PhysAddr::new(0x00AB_C000));
        // Walk length 3 in bits 3..5, memory type 0, frame in 12..51.
        assert_eq!(eptp.into_bits(), (3 << 3) | 0x00AB_C000);
        assert_eq!(eptp.pml4_phys().as_u64(), 0x00AB_C000);
    }

    #[test]
    fn identity_2m_leaf_layout() {
        let pde = EptPde2M::identity(3);
        assert!(pde.size());
        assert!(pde.present() && pde.write() && pde.execute());
        assert_eq!(pde.memory_type(), EptMemType::WB);
        assert_eq!(pde.page_phys().as_u64(), 3 * 0x0020_0000);
    }

    #[test]
    fn pde_union_discriminates_on_size() {
        let leaf = EptPdeUnion::from_bits(EptPde2M::identity(1).into_bits());
        assert!(leaf.is_leaf());
        assert!(matches!(leaf.view(), EptPdeView::Leaf2M(_)));

        let reference =
            EptPdeUnion::from_bits(EptPdeRef::referencing(PhysAddr::new(0x5000)).into_bits());
        assert!(!reference.is_leaf());
        match reference.view() {
            EptPdeView::Table(entry) => {
                assert_eq!(entry.table_phys().as_u64(), 0x5000);
            }
            EptPdeView::Leaf2M(_) => panic!("size bit misread"),
        }
    }

    #[test]
    fn pte_frame_swap_keeps_permissions() {
        let pte = EptPte::identity(PhysAddr::new(0x1_0000))
            .with_write(false)
            .with_page_phys(PhysAddr::new(0x2_0000));
        assert_eq!(pte.page_phys().as_u64(), 0x2_0000);
        assert!(pte.present());
        assert!(!pte.write());
        assert!(pte.execute());
        assert!(pte.any_access());
    }

    #[test]
    fn violation_qualification_bits() {
        let qual = EptViolationQual::from_bits(0b1000_0010);
        assert!(qual.data_write());
        assert!(qual.is_data_access());
        assert!(!qual.instruction_fetch());
        assert!(qual.guest_linear_valid());
    }
}
