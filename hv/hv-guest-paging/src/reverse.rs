//! Reverse walk: enumerate the linear addresses mapping a physical page.

use crate::entries::{GuestPde, GuestPte};
use crate::{GUEST_ENTRY_SIZE, GUEST_TABLE_ENTRIES, directory_base};
use crate::walker::WalkError;
use hv_addr::{GuestVirtAddr, MappedPage, PhysAddr, PhysMapper};

/// Cursor over every guest linear address whose current translation maps
/// the target guest-physical address.
///
/// A 4 MiB PDE match yields one address with the 22-bit offset of the
/// target preserved; small-page PDEs are resolved by scanning all 1024
/// PTEs of the referenced table. At most one table page is mapped at a
/// time, and it is unmapped before the cursor advances to the next PDE.
pub struct ReverseWalk<'m, M: PhysMapper> {
    mapper: &'m M,
    directory: MappedPage<'m, M>,
    target: PhysAddr,
    pde_idx: usize,
    pte_idx: usize,
    table: Option<MappedPage<'m, M>>,
}

impl<'m, M: PhysMapper> ReverseWalk<'m, M> {
    /// Start a reverse walk of the paging structures rooted at `cr3`.
    ///
    /// # Errors
    /// [`WalkError::DirectoryUnmappable`] if the directory page cannot be
    /// mapped.
    pub fn new(mapper: &'m M, cr3: u32, target: PhysAddr) -> Result<Self, WalkError> {
        // SAFETY: the directory base is guest memory the caller vouches
        // for; all views are read-only.
        let directory = unsafe { mapper.map_page(PhysAddr::new(directory_base(cr3))) }
            .ok_or(WalkError::DirectoryUnmappable)?;
        Ok(Self {
            mapper,
            directory,
            target,
            pde_idx: 0,
            pte_idx: 0,
            table: None,
        })
    }

    fn pde(&self, idx: usize) -> GuestPde {
        GuestPde::from_bits(self.directory.u32_at(idx * GUEST_ENTRY_SIZE))
    }

    /// Scan the current table for the next PTE mapping the target frame.
    fn scan_table(&mut self) -> Option<GuestVirtAddr> {
        while self.pte_idx < GUEST_TABLE_ENTRIES {
            let idx = self.pte_idx;
            self.pte_idx += 1;
            let bits = self.table.as_ref()?.u32_at(idx * GUEST_ENTRY_SIZE);
            let pte = GuestPte::from_bits(bits);
            if pte.present() && pte.page_phys() == self.target.frame_base() {
                return Some(self.virt_of(self.pde_idx, idx));
            }
        }
        // Table exhausted; unmap it and move to the next PDE.
        self.table = None;
        self.pte_idx = 0;
        self.pde_idx += 1;
        None
    }

    #[allow(clippy::cast_possible_truncation)]
    fn virt_of(&self, pde_idx: usize, pte_idx: usize) -> GuestVirtAddr {
        let va = ((pde_idx as u32) << 22)
            | ((pte_idx as u32) << 12)
            | (self.target.page_offset() as u32);
        GuestVirtAddr::new(va)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn large_virt_of(&self, pde_idx: usize) -> GuestVirtAddr {
        let va = ((pde_idx as u32) << 22) | ((self.target.as_u64() & 0x003F_FFFF) as u32);
        GuestVirtAddr::new(va)
    }
}

impl<M: PhysMapper> Iterator for ReverseWalk<'_, M> {
    type Item = GuestVirtAddr;

    fn next(&mut self) -> Option<GuestVirtAddr> {
        loop {
            if self.table.is_some() {
                if let Some(va) = self.scan_table() {
                    return Some(va);
                }
                continue;
            }

            if self.pde_idx >= GUEST_TABLE_ENTRIES {
                return None;
            }

            let pde = self.pde(self.pde_idx);
            if pde.present() && pde.large_page() {
                let idx = self.pde_idx;
                self.pde_idx += 1;
                if pde.large_page_contains(self.target) {
                    return Some(self.large_virt_of(idx));
                }
            } else if pde.present() {
                // SAFETY: table page address comes from a present PDE of
                // guest memory the caller vouched for at construction.
                match unsafe { self.mapper.map_page(pde.table_phys()) } {
                    Some(page) => {
                        self.table = Some(page);
                        self.pte_idx = 0;
                    }
                    // Unmappable table: skip this PDE rather than abort the
                    // whole enumeration.
                    None => self.pde_idx += 1,
                }
            } else {
                self.pde_idx += 1;
            }
        }
    }
}
