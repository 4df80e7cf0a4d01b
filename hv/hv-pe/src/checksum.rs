//! Relocation-normalised measurement checksums.

#![allow(clippy::cast_possible_truncation)]

use crate::header::PeView;
use hv_addr::{GuestVirtAddr, PAGE_SIZE, PhysAddr, PhysMapper};
use hv_guest_paging::map_pte;
use log::debug;

/// Size of one base-relocation block header (`VirtualAddress` +
/// `SizeOfBlock`).
const RELOC_BLOCK_HEADER: u32 = 8;

/// Relocation facts needed to normalise a checksum.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RelocInfo {
    /// Number of relocation sites (block headers discarded).
    pub count: u32,
    /// `|real load base - linked base|`.
    pub delta: u32,
}

impl RelocInfo {
    /// The compensation term: every relocation site contributed the bytes
    /// of the load delta once, so add `count` copies of each delta byte.
    #[must_use]
    pub const fn compensation(self) -> u32 {
        let d = self.delta;
        let per_site = (d & 0xFF)
            + ((d >> 8) & 0xFF)
            + ((d >> 16) & 0xFF)
            + ((d >> 24) & 0xFF);
        self.count.wrapping_mul(per_site)
    }
}

/// Wrapping byte sum of an arbitrary buffer.
#[must_use]
pub fn buffer_checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)))
}

/// Count relocation sites and compute the load delta.
///
/// The `.reloc` section content is reached through the live guest walk
/// (one page, like the header). Per block, `(SizeOfBlock - 8) / 2` entry
/// slots are counted and one slot per block is discarded as header
/// overhead. A block with `SizeOfBlock == 0` terminates the list.
///
/// An image without a `.reloc` section, and a `.reloc` page that is not
/// resident or cannot be reached, both report zero sites: measurement
/// proceeds with the plain byte sum rather than aborting.
#[must_use]
pub fn reloc_info<M: PhysMapper>(
    mapper: &M,
    cr3: u32,
    pe: &PeView<'_>,
    real_base: GuestVirtAddr,
) -> RelocInfo {
    let linked = pe.linked_base();
    let delta = real_base.as_u32().abs_diff(linked);
    let zero = RelocInfo { count: 0, delta };

    let Some(reloc) = pe.find_section(b".reloc") else {
        return zero;
    };

    let reloc_va = real_base.wrapping_add(reloc.virtual_address);
    let Some(page_phys) = map_pte(mapper, cr3, reloc_va)
        .ok()
        .flatten()
        .filter(|view| view.get().present())
        .map(|view| view.get().page_phys())
    else {
        debug!("relocation page at {reloc_va} not resident, counting zero sites");
        return zero;
    };

    // SAFETY: the frame was just named by a present guest PTE.
    let Some(page) = (unsafe { mapper.map_page(page_phys) }) else {
        debug!("relocation frame {page_phys} unmappable, counting zero sites");
        return zero;
    };
    let bytes = page.bytes();

    let mut count: u32 = 0;
    let mut blocks: u32 = 0;
    let mut offset = reloc_va.page_offset() as usize;
    while offset + 8 <= bytes.len() {
        let size_of_block = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]);
        if size_of_block == 0 {
            break;
        }
        count = count.wrapping_add(size_of_block.saturating_sub(RELOC_BLOCK_HEADER) / 2);
        blocks += 1;
        offset += size_of_block as usize;
    }

    // One slot per block is header overhead, not a relocation site.
    RelocInfo {
        count: count.saturating_sub(blocks),
        delta,
    }
}

/// Sum the bytes of every measured section, fetching each 4 KiB page's
/// frame through `page_for` (argument: the page's RVA).
fn checksum_sections<M, F>(mapper: &M, pe: &PeView<'_>, mut page_for: F) -> u32
where
    M: PhysMapper,
    F: FnMut(u32) -> Option<PhysAddr>,
{
    let mut sum = 0u32;
    for section in pe.measured_sections() {
        let mut remaining = section.virtual_size;
        for k in 0..section.num_pages() {
            let take = remaining.min(PAGE_SIZE as u32) as usize;
            let rva = section.virtual_address + k * PAGE_SIZE as u32;
            if let Some(frame) = page_for(rva) {
                // SAFETY: the frame was named by the page source (guest
                // PTE or the engine's code-view array).
                if let Some(page) = unsafe { mapper.map_page(frame) } {
                    sum = sum.wrapping_add(buffer_checksum(&page.bytes()[..take]));
                } else {
                    debug!("measurement: frame {frame} unmappable, skipping page");
                }
            } else {
                debug!("measurement: rva {rva:#x} not resident, skipping page");
            }
            remaining = remaining.saturating_sub(PAGE_SIZE as u32);
        }
    }
    sum
}

/// Measurement over what the guest currently sees: executable bytes are
/// fetched through the live guest paging structures. Unresident pages
/// are skipped.
#[must_use]
pub fn checksum_via_guest<M: PhysMapper>(
    mapper: &M,
    cr3: u32,
    pe: &PeView<'_>,
    real_base: GuestVirtAddr,
) -> u32 {
    let relocs = reloc_info(mapper, cr3, pe, real_base);
    let sum = checksum_sections(mapper, pe, |rva| {
        let va = real_base.wrapping_add(rva);
        map_pte(mapper, cr3, va)
            .ok()
            .flatten()
            .filter(|view| view.get().present())
            .map(|view| view.get().page_phys())
    });
    sum.wrapping_add(relocs.compensation())
}

/// Measurement over a caller-supplied frame array (the split engine's
/// code view). `frames[i]` backs the page at RVA `i * 4096`; the null
/// address marks a hole.
#[must_use]
pub fn checksum_via_frames<M: PhysMapper>(
    mapper: &M,
    pe: &PeView<'_>,
    frames: &[PhysAddr],
    relocs: RelocInfo,
) -> u32 {
    let sum = checksum_sections(mapper, pe, |rva| {
        frames
            .get((rva / PAGE_SIZE as u32) as usize)
            .copied()
            .filter(|pa| !pa.is_null())
    });
    sum.wrapping_add(relocs.compensation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::test_image;
    use hv_guest_paging::{GuestPde, GuestPte};
    use hv_testmem::TestPhys;

    const EXEC: u32 = 0x2000_0000;
    const CR3: u32 = 0x1000;

    /// Map `gva -> frame` in the test guest's paging structures, creating
    /// the page table on demand at a fixed location per directory slot.
    fn map_guest_page(mem: &mut TestPhys, gva: GuestVirtAddr, frame: PhysAddr) {
        let pde_slot = PhysAddr::new(0x1000 + (gva.pde_index() * 4) as u64);
        let pde = GuestPde::from_bits(mem.read_u32(pde_slot));
        let table = if pde.present() {
            pde.table_phys()
        } else {
            let t = mem.alloc_frame();
            mem.write_u32(pde_slot, GuestPde::referencing(t).into_bits());
            t
        };
        mem.write_u32(
            PhysAddr::new(table.as_u64() + (gva.pte_index() * 4) as u64),
            GuestPte::mapping(frame).into_bits(),
        );
    }

    /// One exec section of `0x1800` bytes at RVA 0x1000 plus a `.reloc`
    /// section with one block of three sites.
    struct Fixture {
        mem: TestPhys,
        header: [u8; 4096],
        real_base: GuestVirtAddr,
        frames: Vec<PhysAddr>,
        body_sum: u32,
    }

    fn fixture(image_base: u32, real_base: u32) -> Fixture {
        let mut mem = TestPhys::new();
        mem.alloc_frame(); // guest page directory at 0x1000

        let header = test_image::build(
            image_base,
            0x4000,
            &[
                (b".text", 0x1800, 0x1000, EXEC),
                (b".reloc", 0x100, 0x3000, 0),
            ],
        );

        let real_base = GuestVirtAddr::new(real_base);

        // Two body pages: 0x1000 bytes of 0x01, 0x800 bytes of 0x02.
        let page_a = mem.alloc_frame();
        let page_b = mem.alloc_frame();
        mem.frame_mut(page_a).fill(0x01);
        mem.frame_mut(page_b).fill(0x02); // only 0x800 counted
        map_guest_page(&mut mem, real_base.wrapping_add(0x1000), page_a);
        map_guest_page(&mut mem, real_base.wrapping_add(0x2000), page_b);

        // Reloc page: one block, SizeOfBlock = 16 → three sites + pad.
        let reloc_page = mem.alloc_frame();
        let mut block = [0u8; 16];
        block[0..4].copy_from_slice(&0x1000u32.to_le_bytes());
        block[4..8].copy_from_slice(&16u32.to_le_bytes());
        block[8..10].copy_from_slice(&0x3001u16.to_le_bytes());
        block[10..12].copy_from_slice(&0x3005u16.to_le_bytes());
        block[12..14].copy_from_slice(&0x3009u16.to_le_bytes());
        mem.write(reloc_page, &block);
        map_guest_page(&mut mem, real_base.wrapping_add(0x3000), reloc_page);

        // Code-view frame array indexed by RVA page.
        let mut frames = vec![PhysAddr::NULL; 4];
        frames[1] = page_a;
        frames[2] = page_b;

        let body_sum = 0x1000 * 0x01 + 0x800 * 0x02;
        Fixture {
            mem,
            header,
            real_base,
            frames,
            body_sum,
        }
    }

    #[test]
    fn reloc_count_discards_block_header() {
        let f = fixture(0x0100_0000, 0x0120_0000);
        let pe = PeView::parse(&f.header).unwrap();
        let info = reloc_info(&f.mem, CR3, &pe, f.real_base);
        assert_eq!(info.count, 3);
        assert_eq!(info.delta, 0x20_0000);
    }

    #[test]
    fn rebase_compensation_preserves_identity() {
        // Linked at 0x01000000, loaded at 0x01200000: delta bytes are
        // (00, 00, 20, 00), so three sites add 3 * 0x20.
        let f = fixture(0x0100_0000, 0x0120_0000);
        let pe = PeView::parse(&f.header).unwrap();
        let live = checksum_via_guest(&f.mem, CR3, &pe, f.real_base);
        assert_eq!(live, f.body_sum + 3 * 0x20);
    }

    #[test]
    fn loaded_at_linked_base_adds_nothing() {
        let f = fixture(0x0100_0000, 0x0100_0000);
        let pe = PeView::parse(&f.header).unwrap();
        let live = checksum_via_guest(&f.mem, CR3, &pe, f.real_base);
        assert_eq!(live, f.body_sum);
    }

    #[test]
    fn live_and_frame_views_agree_until_tampered() {
        let mut f = fixture(0x0100_0000, 0x0120_0000);
        let pe = PeView::parse(&f.header).unwrap();
        let relocs = reloc_info(&f.mem, CR3, &pe, f.real_base);

        let live = checksum_via_guest(&f.mem, CR3, &pe, f.real_base);
        let copy = checksum_via_frames(&f.mem, &pe, &f.frames, relocs);
        assert_eq!(live, copy);

        // Patch one live byte; the views must now disagree by the diff.
        let page = f.frames[1];
        f.mem.frame_mut(page)[0x10] = 0x90;
        let live = checksum_via_guest(&f.mem, CR3, &pe, f.real_base);
        assert_ne!(live, copy);
    }

    #[test]
    fn missing_reloc_section_counts_zero() {
        let mut mem = TestPhys::new();
        mem.alloc_frame();
        let header = test_image::build(0x0100_0000, 0x2000, &[(b".text", 0x100, 0x1000, EXEC)]);
        let pe = PeView::parse(&header).unwrap();
        let info = reloc_info(&mem, CR3, &pe, GuestVirtAddr::new(0x0130_0000));
        assert_eq!(info.count, 0);
        assert_eq!(info.delta, 0x30_0000);
    }

    #[test]
    fn unresident_reloc_section_counts_zero_and_measurement_proceeds() {
        // The header names a .reloc section, but its page is not mapped
        // in the guest: the count degrades to zero and the checksum is
        // the plain body sum.
        let mut mem = TestPhys::new();
        mem.alloc_frame(); // guest page directory at 0x1000
        let header = test_image::build(
            0x0100_0000,
            0x4000,
            &[
                (b".text", 0x1000, 0x1000, EXEC),
                (b".reloc", 0x100, 0x3000, 0),
            ],
        );
        let real_base = GuestVirtAddr::new(0x0120_0000);
        let body = mem.alloc_frame();
        mem.frame_mut(body).fill(0x03);
        map_guest_page(&mut mem, real_base.wrapping_add(0x1000), body);

        let pe = PeView::parse(&header).unwrap();
        let info = reloc_info(&mem, CR3, &pe, real_base);
        assert_eq!(info.count, 0);
        assert_eq!(info.delta, 0x20_0000);
        assert_eq!(checksum_via_guest(&mem, CR3, &pe, real_base), 0x1000 * 0x03);
    }

    #[test]
    fn no_executable_sections_checksums_zero() {
        let mut mem = TestPhys::new();
        mem.alloc_frame();
        let header = test_image::build(0x0100_0000, 0x2000, &[(b".data", 0x100, 0x1000, 0)]);
        let pe = PeView::parse(&header).unwrap();
        let sum = checksum_via_guest(&mem, CR3, &pe, GuestVirtAddr::new(0x0100_0000));
        assert_eq!(sum, 0);
    }

    #[test]
    fn buffer_checksum_wraps() {
        assert_eq!(buffer_checksum(&[1, 2, 3]), 6);
        assert_eq!(buffer_checksum(&[]), 0);
    }
}
