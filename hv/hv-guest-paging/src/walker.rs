//! Forward walks: CR3 + linear address → PDE / PTE views.

use crate::entries::{GuestPde, GuestPte};
use crate::{GUEST_ENTRY_SIZE, directory_base};
use hv_addr::{GuestVirtAddr, MappedPage, PhysAddr, PhysMapper};

/// Walker failures. Mapping failures are the only errors: a *non-present*
/// entry is a valid answer, not an error.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum WalkError {
    #[error("could not map the guest page directory page")]
    DirectoryUnmappable,
    #[error("could not map the guest page table page")]
    TableUnmappable,
}

/// A mapped-in view of the page-directory page, focused on one PDE slot.
#[derive(Debug)]
pub struct PdeView<'m, M: PhysMapper> {
    page: MappedPage<'m, M>,
    slot_offset: usize,
}

impl<M: PhysMapper> PdeView<'_, M> {
    /// Read the entry.
    #[inline]
    #[must_use]
    pub fn get(&self) -> GuestPde {
        GuestPde::from_bits(self.page.u32_at(self.slot_offset))
    }

    /// Guest-physical address of the PDE slot itself.
    #[inline]
    #[must_use]
    pub fn slot_phys(&self, cr3: u32) -> PhysAddr {
        PhysAddr::new(directory_base(cr3) + self.slot_offset as u64)
    }
}

/// A mapped-in view of a page-table page, focused on one PTE slot.
#[derive(Debug)]
pub struct PteView<'m, M: PhysMapper> {
    page: MappedPage<'m, M>,
    table_phys: PhysAddr,
    slot_offset: usize,
}

impl<M: PhysMapper> PteView<'_, M> {
    /// Read the entry.
    #[inline]
    #[must_use]
    pub fn get(&self) -> GuestPte {
        GuestPte::from_bits(self.page.u32_at(self.slot_offset))
    }

    /// Guest-physical address of the PTE slot itself.
    #[inline]
    #[must_use]
    pub fn slot_phys(&self) -> PhysAddr {
        PhysAddr::new(self.table_phys.as_u64() + self.slot_offset as u64)
    }
}

/// Map the page-directory page of `cr3` and focus the PDE slot for `gva`.
///
/// # Errors
/// [`WalkError::DirectoryUnmappable`] if the directory page cannot be
/// mapped.
pub fn map_pde<'m, M: PhysMapper>(
    mapper: &'m M,
    cr3: u32,
    gva: GuestVirtAddr,
) -> Result<PdeView<'m, M>, WalkError> {
    // SAFETY: the directory base is guest memory the caller vouches for;
    // the view is read-only.
    let page = unsafe { mapper.map_page(PhysAddr::new(directory_base(cr3))) }
        .ok_or(WalkError::DirectoryUnmappable)?;
    Ok(PdeView {
        page,
        slot_offset: gva.pde_index() * GUEST_ENTRY_SIZE,
    })
}

/// Walk to the PTE for `gva`.
///
/// Returns `Ok(None)` when the PDE is not present or maps a 4 MiB large
/// page (there is no PTE in that case).
///
/// # Errors
/// Propagates mapping failures from either level.
pub fn map_pte<'m, M: PhysMapper>(
    mapper: &'m M,
    cr3: u32,
    gva: GuestVirtAddr,
) -> Result<Option<PteView<'m, M>>, WalkError> {
    let pde = map_pde(mapper, cr3, gva)?.get();
    if !pde.present() || pde.large_page() {
        return Ok(None);
    }
    let table_phys = pde.table_phys();
    // SAFETY: as in map_pde; the table page address came from a present PDE.
    let page =
        unsafe { mapper.map_page(table_phys) }.ok_or(WalkError::TableUnmappable)?;
    Ok(Some(PteView {
        page,
        table_phys,
        slot_offset: gva.pte_index() * GUEST_ENTRY_SIZE,
    }))
}

/// Guest-physical address of the PTE slot translating `gva`, if the walk
/// reaches one. This is what the split engine records for fault-free
/// re-reads at elevated IRQL.
///
/// # Errors
/// Propagates mapping failures from either level.
pub fn pte_slot_addr<M: PhysMapper>(
    mapper: &M,
    cr3: u32,
    gva: GuestVirtAddr,
) -> Result<Option<PhysAddr>, WalkError> {
    Ok(map_pte(mapper, cr3, gva)?.map(|view| view.slot_phys()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hv_testmem::TestPhys;

    const CR3: u32 = 0x1000;

    /// Install `pde` for `gva` in the test directory.
    fn set_pde(mem: &mut TestPhys, gva: GuestVirtAddr, pde: GuestPde) {
        let slot = PhysAddr::new(directory_base(CR3) + (gva.pde_index() * 4) as u64);
        mem.write_u32(slot, pde.into_bits());
    }

    #[test]
    fn absent_pde_yields_no_pte() {
        let mut mem = TestPhys::new();
        assert_eq!(mem.alloc_frame().as_u64(), 0x1000); // directory
        let gva = GuestVirtAddr::new(0x0040_0000);
        assert!(map_pte(&mem, CR3, gva).unwrap().is_none());
    }

    #[test]
    fn large_pde_yields_no_pte() {
        let mut mem = TestPhys::new();
        mem.alloc_frame(); // directory
        let gva = GuestVirtAddr::new(0x0080_0000);
        set_pde(
            &mut mem,
            gva,
            GuestPde::new().with_present(true).with_large_page(true),
        );
        assert!(map_pte(&mem, CR3, gva).unwrap().is_none());
        assert!(map_pde(&mem, CR3, gva).unwrap().get().large_page());
    }

    #[test]
    fn small_page_walk_reaches_pte() {
        let mut mem = TestPhys::new();
        mem.alloc_frame(); // directory at 0x1000
        let table = mem.alloc_frame(); // page table at 0x2000
        let gva = GuestVirtAddr::new(0x0040_3000);

        set_pde(&mut mem, gva, GuestPde::referencing(table));

        let pte = GuestPte::mapping(PhysAddr::new(0x0005_5000));
        mem.write_u32(
            PhysAddr::new(table.as_u64() + (gva.pte_index() * 4) as u64),
            pte.into_bits(),
        );

        let view = map_pte(&mem, CR3, gva).unwrap().unwrap();
        assert_eq!(view.get().page_phys().as_u64(), 0x0005_5000);
        assert_eq!(
            view.slot_phys().as_u64(),
            table.as_u64() + (gva.pte_index() * 4) as u64
        );
        assert_eq!(
            pte_slot_addr(&mem, CR3, gva).unwrap().unwrap(),
            view.slot_phys()
        );
    }

    #[test]
    fn unmappable_directory_is_an_error() {
        let mem = TestPhys::new();
        let gva = GuestVirtAddr::new(0);
        assert_eq!(
            map_pde(&mem, CR3, gva).unwrap_err(),
            WalkError::DirectoryUnmappable
        );
    }
}
