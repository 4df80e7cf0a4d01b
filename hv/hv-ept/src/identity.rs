//! The EPT identity map and 2 MiB → 4 KiB demotion.

#![allow(clippy::cast_possible_truncation)]

use crate::entries::{
    EptPde2M, EptPdeRef, EptPdeUnion, EptPdeView, EptPdpte, EptPml4Entry, EptPointer, EptPte,
};
use crate::slot::PteSlot;
use crate::EptError;
use alloc::vec::Vec;
use core::ptr::NonNull;
use hv_addr::{EPT_LARGE_PAGE_SIZE, PhysAddr};
use hv_arena::{FrameArena, FrameIndex};
use log::{debug, trace};

/// Entries per EPT table (all levels).
pub const EPT_TABLE_ENTRIES: usize = 512;

/// Page-directory pages in the identity map — one per GiB of mapped
/// guest-physical space.
pub const NUM_PD_PAGES: usize = 4;

/// One arena-backed EPT table: the index for teardown, the pointer and
/// physical address for access.
#[derive(Copy, Clone, Debug)]
struct TableRef {
    index: FrameIndex,
    virt: NonNull<u64>,
    phys: PhysAddr,
}

// SAFETY: see `PteSlot` — arena-owned memory, volatile access, single
// threaded exit path.
unsafe impl Send for TableRef {}

impl TableRef {
    fn alloc(arena: &mut FrameArena) -> Result<Self, EptError> {
        let index = arena.alloc().ok_or(EptError::ArenaExhausted)?;
        Ok(Self {
            index,
            virt: arena.frame_ptr(index).cast(),
            phys: arena.frame_phys(index),
        })
    }

    fn read(self, i: usize) -> u64 {
        debug_assert!(i < EPT_TABLE_ENTRIES);
        // SAFETY: the frame holds 512 u64 slots and stays alive until
        // released to the arena.
        unsafe { self.virt.as_ptr().add(i).read_volatile() }
    }

    fn write(self, i: usize, value: u64) {
        debug_assert!(i < EPT_TABLE_ENTRIES);
        // SAFETY: as in `read`.
        unsafe { self.virt.as_ptr().add(i).write_volatile(value) };
    }

    fn slot(self, i: usize) -> PteSlot {
        debug_assert!(i < EPT_TABLE_ENTRIES);
        // SAFETY: in-bounds slot of a live table frame.
        unsafe { PteSlot::new(NonNull::new_unchecked(self.virt.as_ptr().add(i))) }
    }
}

/// A page table that replaced a 2 MiB leaf, covering `base .. base + 2 MiB`.
#[derive(Debug)]
struct DemotedTable {
    table: TableRef,
    base: PhysAddr,
}

/// Identity map over the first [`NUM_PD_PAGES`] GiB of guest-physical
/// memory: one used PML4 entry, one PDPT page, four PD pages of 2 MiB
/// write-back leaves, plus every page table created by demotion.
#[derive(Debug)]
pub struct IdentityMap {
    pml4: TableRef,
    pdpt: TableRef,
    pds: [TableRef; NUM_PD_PAGES],
    demoted: Vec<DemotedTable>,
}

impl IdentityMap {
    /// Build the identity map from arena frames.
    ///
    /// # Errors
    /// [`EptError::ArenaExhausted`] when the arena cannot supply the six
    /// table frames; everything taken so far is returned to the arena.
    #[allow(clippy::needless_range_loop)]
    pub fn new(arena: &mut FrameArena) -> Result<Self, EptError> {
        let pml4 = TableRef::alloc(arena)?;
        let pdpt = TableRef::alloc(arena).inspect_err(|_| arena.free(pml4.index))?;

        let mut pds = [pml4; NUM_PD_PAGES]; // placeholder, overwritten below
        for i in 0..NUM_PD_PAGES {
            match TableRef::alloc(arena) {
                Ok(table) => pds[i] = table,
                Err(e) => {
                    arena.free(pml4.index);
                    arena.free(pdpt.index);
                    for pd in &pds[..i] {
                        arena.free(pd.index);
                    }
                    return Err(e);
                }
            }
        }

        pml4.write(0, EptPml4Entry::referencing(pdpt.phys).into_bits());

        let mut region = 0u64;
        for (i, pd) in pds.iter().enumerate() {
            pdpt.write(i, EptPdpte::referencing(pd.phys).into_bits());
            for j in 0..EPT_TABLE_ENTRIES {
                pd.write(j, EptPde2M::identity(region).into_bits());
                region += 1;
            }
        }

        debug!(
            "EPT identity map built: {} GiB as 2 MiB pages, PML4 at {}",
            NUM_PD_PAGES, pml4.phys
        );
        Ok(Self {
            pml4,
            pdpt,
            pds,
            demoted: Vec::new(),
        })
    }

    /// The EPTP value describing this map.
    #[must_use]
    pub fn eptp(&self) -> EptPointer {
        EptPointer::for_pml4(self.pml4.phys)
    }

    /// Physical address of the PML4 table.
    #[must_use]
    pub fn pml4_phys(&self) -> PhysAddr {
        self.pml4.phys
    }

    /// Whether `gpa` is already covered by a 4 KiB page table (as opposed
    /// to a 2 MiB leaf).
    ///
    /// # Errors
    /// [`EptError::OutOfRange`] beyond the mapped space.
    pub fn pt_exists(&self, gpa: PhysAddr) -> Result<bool, EptError> {
        let (pd, pde_off, _) = self.locate(gpa)?;
        Ok(!EptPdeUnion::from_bits(pd.read(pde_off)).is_leaf())
    }

    fn locate(&self, gpa: PhysAddr) -> Result<(TableRef, usize, usize), EptError> {
        let addr = gpa.as_u64();
        let pdpte_off = ((addr >> 30) & 0x1FF) as usize;
        if addr >> 39 != 0 || pdpte_off >= NUM_PD_PAGES {
            return Err(EptError::OutOfRange(addr));
        }
        let pde_off = ((addr >> 21) & 0x1FF) as usize;
        let pte_off = ((addr >> 12) & 0x1FF) as usize;
        Ok((self.pds[pdpte_off], pde_off, pte_off))
    }

    /// Return the 4 KiB EPT PTE covering `gpa`, demoting the containing
    /// 2 MiB leaf into a freshly allocated page table if needed.
    ///
    /// Immediately after a demotion the aggregate permissions and mapping
    /// of the 2 MiB region are unchanged.
    ///
    /// # Errors
    /// [`EptError::OutOfRange`] beyond the mapped space,
    /// [`EptError::ArenaExhausted`] when no frame is left for the new
    /// table, [`EptError::TableNotFound`] if bookkeeping lost a demoted
    /// region (a bug, surfaced rather than unwrapped).
    pub fn get_or_demote_pte(
        &mut self,
        arena: &mut FrameArena,
        gpa: PhysAddr,
    ) -> Result<PteSlot, EptError> {
        let (pd, pde_off, pte_off) = self.locate(gpa)?;
        let pde = EptPdeUnion::from_bits(pd.read(pde_off));

        match pde.view() {
            EptPdeView::Leaf2M(leaf) => {
                let covered = leaf.page_phys();
                let table = TableRef::alloc(arena)?;
                for i in 0..EPT_TABLE_ENTRIES {
                    let page = PhysAddr::new(covered.as_u64() + (i as u64) * 4096);
                    table.write(i, EptPte::identity(page).into_bits());
                }
                pd.write(pde_off, EptPdeRef::referencing(table.phys).into_bits());
                trace!("demoted 2 MiB region at {covered} to a page table");
                self.demoted.push(DemotedTable {
                    table,
                    base: covered,
                });
                Ok(table.slot(pte_off))
            }
            EptPdeView::Table(_) => {
                let base = PhysAddr::new(gpa.as_u64() & !(EPT_LARGE_PAGE_SIZE - 1));
                self.demoted
                    .iter()
                    .find(|d| d.base == base)
                    .map(|d| d.table.slot(pte_off))
                    .ok_or(EptError::TableNotFound(base.as_u64()))
            }
        }
    }

    /// Number of page tables created by demotion so far.
    #[must_use]
    pub fn demoted_tables(&self) -> usize {
        self.demoted.len()
    }

    /// Return every frame — PML4, PDPT, PDs, and all demoted page tables —
    /// to the arena. The map must not be used afterwards.
    pub fn release(mut self, arena: &mut FrameArena) {
        arena.free(self.pml4.index);
        arena.free(self.pdpt.index);
        for pd in &self.pds {
            arena.free(pd.index);
        }
        for demoted in self.demoted.drain(..) {
            arena.free(demoted.table.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (FrameArena, IdentityMap) {
        let mut arena = FrameArena::new(16).unwrap();
        let map = IdentityMap::new(&mut arena).unwrap();
        (arena, map)
    }

    #[test]
    fn build_uses_six_frames_and_identity_leaves() {
        let (arena, map) = setup();
        assert_eq!(arena.frames_in_use(), 2 + NUM_PD_PAGES);

        // PDE i of PD 0 covers physical i * 2 MiB.
        let pde = EptPdeUnion::from_bits(map.pds[0].read(7));
        match pde.view() {
            EptPdeView::Leaf2M(leaf) => {
                assert_eq!(leaf.page_phys().as_u64(), 7 * EPT_LARGE_PAGE_SIZE);
                assert!(leaf.present() && leaf.write() && leaf.execute());
            }
            EptPdeView::Table(_) => panic!("expected 2 MiB leaf"),
        }

        // PD 3, PDE 511 covers the last region below 4 GiB.
        let pde = EptPdeUnion::from_bits(map.pds[3].read(511));
        match pde.view() {
            EptPdeView::Leaf2M(leaf) => {
                assert_eq!(leaf.page_phys().as_u64(), 0x1_0000_0000 - EPT_LARGE_PAGE_SIZE);
            }
            EptPdeView::Table(_) => panic!("expected 2 MiB leaf"),
        }

        assert_eq!(map.eptp().pml4_phys(), map.pml4_phys());
    }

    #[test]
    fn demotion_preserves_aggregate_mapping() {
        let (mut arena, mut map) = setup();
        let gpa = PhysAddr::new(0x0030_5000);

        assert!(!map.pt_exists(gpa).unwrap());
        let slot = map.get_or_demote_pte(&mut arena, gpa).unwrap();
        assert!(map.pt_exists(gpa).unwrap());
        assert_eq!(map.demoted_tables(), 1);

        // The returned slot identity-maps the requested page.
        let pte = slot.read();
        assert_eq!(pte.page_phys(), gpa.frame_base());
        assert!(pte.present() && pte.write() && pte.execute());

        // First and last entries of the new table cover the region edges.
        let first = map.get_or_demote_pte(&mut arena, PhysAddr::new(0x0020_0000)).unwrap();
        let last = map.get_or_demote_pte(&mut arena, PhysAddr::new(0x003F_F000)).unwrap();
        assert_eq!(first.read().page_phys().as_u64(), 0x0020_0000);
        assert_eq!(last.read().page_phys().as_u64(), 0x003F_F000);

        // No second table was created for the same region.
        assert_eq!(map.demoted_tables(), 1);
    }

    #[test]
    fn demotions_in_distinct_regions_allocate_distinct_tables() {
        let (mut arena, mut map) = setup();
        map.get_or_demote_pte(&mut arena, PhysAddr::new(0x0000_1000))
            .unwrap();
        map.get_or_demote_pte(&mut arena, PhysAddr::new(0x7FC0_1000))
            .unwrap();
        assert_eq!(map.demoted_tables(), 2);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let (mut arena, mut map) = setup();
        let high = PhysAddr::new(0x1_0000_0000);
        assert!(matches!(
            map.get_or_demote_pte(&mut arena, high),
            Err(EptError::OutOfRange(_))
        ));
        assert!(map.pt_exists(high).is_err());
    }

    #[test]
    fn exhausted_arena_reports_and_cascades() {
        // Too small for even the base tables.
        let mut arena = FrameArena::new(3).unwrap();
        assert_eq!(
            IdentityMap::new(&mut arena).unwrap_err(),
            EptError::ArenaExhausted
        );
        // Cascade-free: everything allocated on the failed path was freed.
        assert_eq!(arena.frames_in_use(), 0);
    }

    #[test]
    fn release_returns_all_frames() {
        let (mut arena, mut map) = setup();
        map.get_or_demote_pte(&mut arena, PhysAddr::new(0x0010_0000))
            .unwrap();
        assert_eq!(arena.frames_in_use(), 7);
        map.release(&mut arena);
        assert_eq!(arena.frames_in_use(), 0);
    }
}
