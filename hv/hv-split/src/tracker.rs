//! Page-in tracking for the protected image.

use alloc::vec;
use alloc::vec::Vec;
use hv_addr::{GuestVirtAddr, PAGE_SIZE, PhysAddr};

/// Per-image bookkeeping that lets the CR3-write handler notice pages of
/// the protected image becoming resident after the split began.
///
/// Holds the guest-physical addresses of the image's guest PTE slots
/// (resolved through the direct-map window, so re-reads never fault) and
/// the parallel array of physical frames currently known to back each
/// image page — the latter doubles as the code view for measurement.
#[derive(Debug)]
pub struct PageInTracker {
    /// CR3 of the protected process; only writes of this value trigger
    /// page-in scans.
    pub target_cr3: u32,
    /// Guest-virtual base of the image.
    pub image_base: GuestVirtAddr,
    /// Guest-physical address of each page's PTE slot, where resolved.
    pte_slots: Vec<Option<PhysAddr>>,
    /// Data-view frame for each image page.
    data_frames: Vec<PhysAddr>,
    /// Known guest frame per image page (null while unresolved).
    page_phys: Vec<PhysAddr>,
    /// Whether the page already has a translation record.
    tracked: Vec<bool>,
}

impl PageInTracker {
    /// Start tracking an image of `data_frames.len()` pages.
    #[must_use]
    pub fn new(target_cr3: u32, image_base: GuestVirtAddr, data_frames: Vec<PhysAddr>) -> Self {
        let pages = data_frames.len();
        Self {
            target_cr3,
            image_base,
            pte_slots: vec![None; pages],
            data_frames,
            page_phys: vec![PhysAddr::NULL; pages],
            tracked: vec![false; pages],
        }
    }

    /// Number of image pages.
    #[must_use]
    pub fn num_pages(&self) -> usize {
        self.data_frames.len()
    }

    /// Guest-virtual base of image page `i`.
    ///
    /// # Panics
    /// Panics if `i` is out of range.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn page_gva(&self, i: usize) -> GuestVirtAddr {
        assert!(i < self.num_pages());
        self.image_base.wrapping_add(i as u32 * PAGE_SIZE as u32)
    }

    /// Record the resolved PTE-slot address for page `i`.
    pub fn set_pte_slot(&mut self, i: usize, slot: PhysAddr) {
        self.pte_slots[i] = Some(slot);
    }

    #[must_use]
    pub fn pte_slot(&self, i: usize) -> Option<PhysAddr> {
        self.pte_slots.get(i).copied().flatten()
    }

    /// Mark page `i` as carried by a translation record backed by `frame`.
    pub fn mark_tracked(&mut self, i: usize, frame: PhysAddr) {
        self.tracked[i] = true;
        self.page_phys[i] = frame;
    }

    #[must_use]
    pub fn is_tracked(&self, i: usize) -> bool {
        self.tracked.get(i).copied().unwrap_or(false)
    }

    /// Data-view frame of page `i`.
    #[must_use]
    pub fn data_frame(&self, i: usize) -> PhysAddr {
        self.data_frames[i]
    }

    /// The code-view frame array, indexed by image page — the input to
    /// the frame-walking measurement checksum.
    #[must_use]
    pub fn code_frames(&self) -> &[PhysAddr] {
        &self.page_phys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gva_and_tracking_bookkeeping() {
        let frames = vec![PhysAddr::new(0x5000), PhysAddr::new(0x6000)];
        let mut tracker = PageInTracker::new(0x3000, GuestVirtAddr::new(0x0040_0000), frames);

        assert_eq!(tracker.num_pages(), 2);
        assert_eq!(tracker.page_gva(1).as_u32(), 0x0040_1000);
        assert!(!tracker.is_tracked(0));

        tracker.set_pte_slot(0, PhysAddr::new(0x2004));
        assert_eq!(tracker.pte_slot(0), Some(PhysAddr::new(0x2004)));
        assert_eq!(tracker.pte_slot(1), None);

        tracker.mark_tracked(0, PhysAddr::new(0x9000));
        assert!(tracker.is_tracked(0));
        assert_eq!(tracker.code_frames()[0], PhysAddr::new(0x9000));
        assert!(tracker.code_frames()[1].is_null());
        assert_eq!(tracker.data_frame(1), PhysAddr::new(0x6000));
    }
}
