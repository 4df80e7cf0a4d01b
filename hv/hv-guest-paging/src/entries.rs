//! Guest page-directory and page-table entry layouts.

use bitfield_struct::bitfield;
use hv_addr::PhysAddr;

/// A 32-bit non-PAE page-directory entry.
///
/// With `large_page` clear the entry references a page table; with it set
/// (and CR4.PSE enabled) the entry maps a 4 MiB page whose base lives in
/// bits `[31:22]`.
#[bitfield(u32, order = Lsb)]
pub struct GuestPde {
    /// Bit 0 — present.
    pub present: bool,

    /// Bit 1 — writable.
    pub writable: bool,

    /// Bit 2 — user accessible.
    pub user: bool,

    /// Bit 3 — page-level write-through.
    pub write_through: bool,

    /// Bit 4 — page-level cache disable.
    pub cache_disable: bool,

    /// Bit 5 — accessed.
    pub accessed: bool,

    /// Bit 6 — dirty (4 MiB mappings only; ignored for table references).
    pub dirty: bool,

    /// Bit 7 — PS: 1 = 4 MiB leaf, 0 = page-table reference.
    pub large_page: bool,

    /// Bit 8 — global (4 MiB mappings only).
    pub global: bool,

    /// Bits 9–11 — OS-available.
    #[bits(3)]
    pub os_available: u8,

    /// Bits 12–31 — frame number of the page table, or (top 10 bits) the
    /// 4 MiB page base.
    #[bits(20)]
    frame_31_12: u32,
}

impl GuestPde {
    /// A present, writable entry referencing the page table at `table`
    /// (must be 4 KiB-aligned).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn referencing(table: PhysAddr) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_31_12((table.as_u64() >> 12) as u32)
    }

    /// A present, writable 4 MiB leaf mapping the page at `base`
    /// (must be 4 MiB-aligned).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn large_mapping(base: PhysAddr) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_large_page(true)
            .with_frame_31_12((base.as_u64() >> 12) as u32)
    }

    /// Physical base of the referenced page table (valid when
    /// `large_page` is clear).
    #[inline]
    #[must_use]
    pub const fn table_phys(self) -> PhysAddr {
        PhysAddr::new((self.frame_31_12() as u64) << 12)
    }

    /// Physical base of the mapped 4 MiB page (valid when `large_page`
    /// is set). Bits `[21:12]` of the entry are PAT/reserved and ignored.
    #[inline]
    #[must_use]
    pub const fn large_page_phys(self) -> PhysAddr {
        PhysAddr::new(((self.frame_31_12() as u64) & 0xF_FC00) << 12)
    }

    /// Whether this (large) entry's 4 MiB frame contains `gpa`.
    #[inline]
    #[must_use]
    pub const fn large_page_contains(self, gpa: PhysAddr) -> bool {
        self.large_page_phys().as_u64() >> 22 == gpa.as_u64() >> 22
    }
}

/// A 32-bit non-PAE page-table entry mapping one 4 KiB page.
#[bitfield(u32, order = Lsb)]
pub struct GuestPte {
    /// Bit 0 — present.
    pub present: bool,

    /// Bit 1 — writable.
    pub writable: bool,

    /// Bit 2 — user accessible.
    pub user: bool,

    /// Bit 3 — page-level write-through.
    pub write_through: bool,

    /// Bit 4 — page-level cache disable.
    pub cache_disable: bool,

    /// Bit 5 — accessed.
    pub accessed: bool,

    /// Bit 6 — dirty.
    pub dirty: bool,

    /// Bit 7 — PAT selector bit.
    pub pat: bool,

    /// Bit 8 — global.
    pub global: bool,

    /// Bits 9–11 — OS-available.
    #[bits(3)]
    pub os_available: u8,

    /// Bits 12–31 — frame number of the mapped 4 KiB page.
    #[bits(20)]
    frame: u32,
}

impl GuestPte {
    /// A present, writable entry mapping the 4 KiB page at `page`
    /// (must be 4 KiB-aligned).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn mapping(page: PhysAddr) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame((page.as_u64() >> 12) as u32)
    }

    /// Physical base of the mapped 4 KiB page.
    #[inline]
    #[must_use]
    pub const fn page_phys(self) -> PhysAddr {
        PhysAddr::new((self.frame() as u64) << 12)
    }

    /// Frame number as stored in the entry.
    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> u32 {
        self.frame()
    }
}
