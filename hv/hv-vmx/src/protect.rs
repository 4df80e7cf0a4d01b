//! Protect lifecycle: start/stop messages from the external collaborator
//! and the measurement VMCALL.
//!
//! The collaborator (a process-lifecycle callback outside this core)
//! delivers "protect this image" with the image's base, size, CR3, and
//! header location, and later "stop protecting". The core builds the data
//! copy and the translation table here; the collaborator then fires the
//! init-split VMCALL from guest context. The core never calls back out.

#![allow(clippy::cast_possible_truncation)]

use crate::hypervisor::Hypervisor;
use alloc::vec::Vec;
use hv_addr::{GuestVirtAddr, PAGE_SIZE, PhysAddr, PhysMapper};
use hv_arena::{FrameArena, FrameIndex};
use hv_pe::PeView;
use hv_split::{PageInTracker, TlbFlush, TranslationRecord, TranslationTable};
use log::{info, warn};

/// What the collaborator knows about the target image.
#[derive(Copy, Clone, Debug)]
pub struct ImageInfo {
    /// Guest-virtual image base (the PE header's address).
    pub base: GuestVirtAddr,
    /// `SizeOfImage` in bytes.
    pub size: u32,
    /// The target process's CR3.
    pub cr3: u32,
    /// Guest-physical address of the PE header page.
    pub header_phys: PhysAddr,
}

/// Protect-start failures.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ProtectError {
    #[error("another image is already protected")]
    AlreadyProtecting,
    #[error("image has no pages")]
    EmptyImage,
    #[error("frame arena cannot hold the image copy")]
    ArenaExhausted,
}

/// Arena bookkeeping for one protected image's data-view copy.
#[derive(Debug)]
pub(crate) struct ProtectedImage {
    pub(crate) info: ImageInfo,
    data_frames: Vec<FrameIndex>,
}

impl ProtectedImage {
    pub(crate) fn release(self, arena: &mut FrameArena) {
        for frame in self.data_frames {
            arena.free(frame);
        }
    }
}

impl Hypervisor {
    /// Handle the collaborator's protect-start message: allocate the
    /// data-view copy, snapshot every resident image page into it, build
    /// the translation table and page-in tracker, and stage the table for
    /// the init-split VMCALL.
    ///
    /// The collaborator guarantees the image's resident frames are locked
    /// against paging (its MDL) for the duration of the protection.
    ///
    /// # Errors
    /// Failures leave no residue: partially allocated copy frames go back
    /// to the arena.
    pub fn on_target_start<M: PhysMapper>(
        &mut self,
        info: ImageInfo,
        mapper: &M,
    ) -> Result<(), ProtectError> {
        if self.protected.is_some() {
            return Err(ProtectError::AlreadyProtecting);
        }
        let num_pages = info.size.div_ceil(PAGE_SIZE as u32) as usize;
        if num_pages == 0 {
            return Err(ProtectError::EmptyImage);
        }

        // The data view: one host-owned frame per image page.
        let mut data_frames = Vec::with_capacity(num_pages);
        for _ in 0..num_pages {
            match self.arena.alloc() {
                Some(frame) => data_frames.push(frame),
                None => {
                    for frame in data_frames {
                        self.arena.free(frame);
                    }
                    return Err(ProtectError::ArenaExhausted);
                }
            }
        }
        let data_phys: Vec<PhysAddr> =
            data_frames.iter().map(|&f| self.arena.frame_phys(f)).collect();

        let mut table = TranslationTable::with_capacity(num_pages);
        let mut tracker = PageInTracker::new(info.cr3, info.base, data_phys.clone());
        let mut resident = 0usize;

        for (i, &data_frame) in data_frames.iter().enumerate() {
            let gva = tracker.page_gva(i);
            let Ok(Some(view)) = hv_guest_paging::map_pte(mapper, info.cr3, gva) else {
                continue;
            };
            let entry = view.get();
            if !entry.present() {
                continue;
            }
            tracker.set_pte_slot(i, view.slot_phys());
            let frame = entry.page_phys();
            drop(view);

            // Snapshot the page into its data-view frame.
            // SAFETY: the frame is named by a present, MDL-locked guest
            // PTE.
            if let Some(page) = unsafe { mapper.map_page(frame) } {
                self.arena
                    .frame_bytes_mut(data_frame)
                    .copy_from_slice(page.bytes());
            }

            table.push(TranslationRecord::new(gva, frame, data_phys[i]));
            tracker.mark_tracked(i, frame);
            resident += 1;
        }

        info!(
            "protecting image at {} ({} pages, {} resident), CR3 {:#010x}",
            info.base, num_pages, resident, info.cr3
        );

        self.engine.set_tracker(tracker);
        self.staged_table = Some(table);
        self.protected = Some(ProtectedImage { info, data_frames });
        Ok(())
    }

    /// Handle the collaborator's protect-stop message: end the split if
    /// still active, drop tracking, and return the copy frames.
    pub fn on_target_stop(&mut self, tlb: &impl TlbFlush) {
        self.engine.end_split(tlb);
        self.engine.clear_tracker();
        self.staged_table = None;
        if let Some(protected) = self.protected.take() {
            info!("protection stopped for image at {}", protected.info.base);
            protected.release(&mut self.arena);
        }
    }

    /// The measurement VMCALL: compute the live-paging checksum and the
    /// code-view checksum and log both. A mismatch means the guest's
    /// executable bytes differ from the retained code view.
    pub fn measure<M: PhysMapper>(
        &self,
        header_phys: PhysAddr,
        image_base: GuestVirtAddr,
        mapper: &M,
    ) {
        let Some(tracker) = self.engine.tracker() else {
            warn!("measure VMCALL with no protected image");
            return;
        };
        let cr3 = tracker.target_cr3;

        // SAFETY: the collaborator passes the pinned header frame.
        let Some(page) = (unsafe { mapper.map_page(header_phys) }) else {
            warn!("measure: cannot map PE header at {header_phys}");
            return;
        };
        let pe = match PeView::parse(page.bytes()) {
            Ok(pe) => pe,
            Err(e) => {
                warn!("measure: invalid PE header: {e}");
                return;
            }
        };

        let relocs = hv_pe::reloc_info(mapper, cr3, &pe, image_base);
        let live = hv_pe::checksum_via_guest(mapper, cr3, &pe, image_base);
        let code_view = hv_pe::checksum_via_frames(mapper, &pe, tracker.code_frames(), relocs);

        if live == code_view {
            info!("measurement: checksum {live:#010x} (live and code view agree)");
        } else {
            warn!(
                "measurement: live {live:#010x} != code view {code_view:#010x}, image modified"
            );
        }
    }
}
