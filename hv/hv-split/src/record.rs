//! Translation records: one per protected 4 KiB guest page.

use alloc::vec::Vec;
use hv_addr::{GuestVirtAddr, PhysAddr};
use hv_ept::PteSlot;

/// Which record field names the frame the guest's own page tables route
/// to (the address EPT violations report).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageView {
    /// `code_phys` is the guest-routable frame.
    Code,
    /// `data_phys` is the guest-routable frame.
    Data,
}

/// Split state of one protected page.
#[derive(Clone, Debug)]
pub struct TranslationRecord {
    /// Guest-virtual base of the page.
    pub gva: GuestVirtAddr,
    /// Frame backing the guest's code view (the original image frame,
    /// locked against paging by the external collaborator).
    pub code_phys: PhysAddr,
    /// Independently allocated frame holding the image copy — the data
    /// view.
    pub data_phys: PhysAddr,
    /// Which field the guest's translation currently routes to.
    pub view: PageView,
    /// Whether data writes are honoured (carried for completeness; the
    /// engine installs the data view writable either way).
    pub writable: bool,
    /// The page's EPT PTE, filled in by `init_split`.
    pub pte: Option<PteSlot>,
}

impl TranslationRecord {
    /// A fresh code-view record binding `gva` to the pair of frames.
    /// Both frames must be real and distinct — the same frame for both
    /// views would make the split a no-op.
    #[must_use]
    pub const fn new(gva: GuestVirtAddr, code_phys: PhysAddr, data_phys: PhysAddr) -> Self {
        debug_assert!(!code_phys.is_null() && !data_phys.is_null());
        debug_assert!(code_phys.as_u64() != data_phys.as_u64());
        Self {
            gva,
            code_phys,
            data_phys,
            view: PageView::Code,
            writable: true,
            pte: None,
        }
    }

    /// The guest-routable frame, selected by [`PageView`].
    #[must_use]
    pub const fn routable_phys(&self) -> PhysAddr {
        match self.view {
            PageView::Code => self.code_phys,
            PageView::Data => self.data_phys,
        }
    }

    /// Whether the (page-aligned) guest-physical address belongs to this
    /// record.
    #[must_use]
    pub fn matches(&self, gpa: PhysAddr) -> bool {
        gpa.frame_base() == self.routable_phys().frame_base()
    }
}

/// The table of [`TranslationRecord`]s for one protected image.
///
/// Capacity is fixed at construction: the CR3-write handler appends at
/// elevated IRQL where growing the allocation is forbidden, so appends
/// beyond the reservation are refused rather than reallocated.
#[derive(Debug)]
pub struct TranslationTable {
    records: Vec<TranslationRecord>,
    capacity: usize,
}

impl TranslationTable {
    /// An empty table that can hold up to `capacity` records without ever
    /// reallocating.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record. Returns `false` (table unchanged) when the fixed
    /// capacity is exhausted.
    pub fn push(&mut self, record: TranslationRecord) -> bool {
        if self.records.len() >= self.capacity {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Index of the record owning the page-aligned `gpa`, honouring each
    /// record's current [`PageView`].
    #[must_use]
    pub fn find_by_gpa(&self, gpa: PhysAddr) -> Option<usize> {
        self.records.iter().position(|r| r.matches(gpa))
    }

    /// Index of the record for a guest-virtual page base.
    #[must_use]
    pub fn find_by_gva(&self, gva: GuestVirtAddr) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.gva == gva.page_base())
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TranslationRecord> {
        self.records.get(index)
    }

    #[must_use]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut TranslationRecord> {
        self.records.get_mut(index)
    }

    pub fn iter(&self) -> core::slice::Iter<'_, TranslationRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> core::slice::IterMut<'_, TranslationRecord> {
        self.records.iter_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remaining append headroom.
    #[must_use]
    pub fn spare(&self) -> usize {
        self.capacity - self.records.len()
    }
}

impl<'a> IntoIterator for &'a TranslationTable {
    type Item = &'a TranslationRecord;
    type IntoIter = core::slice::Iter<'a, TranslationRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
