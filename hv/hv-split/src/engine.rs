//! The split engine: EPT-violation and single-step handlers.

use crate::record::{TranslationRecord, TranslationTable};
use crate::stack::FaultStack;
use crate::tracker::PageInTracker;
use hv_addr::{GuestVirtAddr, PAGE_SIZE, PhysAddr, PhysMapper};
use hv_arena::FrameArena;
use hv_ept::{EptError, EptPte, EptViolationQual, IdentityMap};
use log::{debug, info, warn};

/// The VMCS fields the split engine reads and writes on an exit.
///
/// Implemented over real `VMREAD`/`VMWRITE` by the hypervisor core and by
/// a plain struct in tests.
pub trait ExitVmcs {
    /// `GUEST_PHYSICAL_ADDRESS` of the faulting access.
    fn guest_physical(&self) -> PhysAddr;
    /// `EXIT_QUALIFICATION` decoded as an EPT violation.
    fn exit_qualification(&self) -> EptViolationQual;
    /// Guest EIP at the exit.
    fn guest_rip(&self) -> u32;
    /// `VM_EXIT_INSTRUCTION_LEN`.
    fn instruction_len(&self) -> u32;
    /// Set or clear EFLAGS.TF in the guest state.
    fn set_trap_flag(&mut self, enabled: bool);
}

/// TLB maintenance the engine requires.
///
/// Real `INVEPT`/`INVVPID` in the hypervisor core; a recording fake in
/// tests.
pub trait TlbFlush {
    /// Invalidate all EPT-derived translations.
    fn invept_all(&self);
    /// Invalidate all VPID-tagged translations.
    fn invvpid_all(&self);
    /// Invalidate the VPID-tagged translation of one linear address
    /// (falls back to all-context where unsupported).
    fn invvpid_addr(&self, gva: GuestVirtAddr);
}

/// Exit counters, reset by `init_split` and reported at teardown.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    /// Total EPT violations taken for protected pages.
    pub violations: u32,
    /// Violations resolved by installing the code view.
    pub code_exits: u32,
    /// Violations resolved by installing the data view.
    pub data_exits: u32,
    /// Thrash resolutions.
    pub thrashes: u32,
}

impl Counters {
    const ZERO: Self = Self {
        violations: 0,
        code_exits: 0,
        data_exits: 0,
        thrashes: 0,
    };
}

/// What an EPT-violation exit resolved to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ViolationOutcome {
    /// A view was installed; the guest single-steps next.
    Resolved,
    /// The PTE already grants fetch access; nothing to do.
    Spurious,
    /// No record owns the address; the split was torn down as a safety
    /// shutdown and the guest continues on the identity map.
    TableMiss,
    /// The access was neither a fetch nor a data access; the caller must
    /// halt.
    Fatal,
}

/// What a single-step trap exit resolved to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrapOutcome {
    /// The pending page was re-armed.
    Completed,
    /// The trap was not produced by the split engine; the caller decides
    /// (re-inject or halt).
    NotSplitInduced,
}

/// Process-wide split state: the active translation table, the fault
/// stack, counters, and page-in tracking for the protected image.
///
/// Lifecycle: created once at load, mutated only from VM-exit context,
/// torn down at unload. Single logical processor, handlers run to
/// completion, hence no internal locking.
#[derive(Debug)]
pub struct SplitEngine {
    table: Option<TranslationTable>,
    tracker: Option<PageInTracker>,
    stack: FaultStack,
    thrash: bool,
    counters: Counters,
}

impl SplitEngine {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            table: None,
            tracker: None,
            stack: FaultStack::new(),
            thrash: false,
            counters: Counters::ZERO,
        }
    }

    /// Whether a split is currently active.
    #[must_use]
    pub const fn split_active(&self) -> bool {
        self.table.is_some()
    }

    /// The active translation table, if any.
    #[must_use]
    pub const fn active_table(&self) -> Option<&TranslationTable> {
        self.table.as_ref()
    }

    /// Current exit counters.
    #[must_use]
    pub const fn counters(&self) -> Counters {
        self.counters
    }

    /// Pushes dropped by fault-stack overflow since the split began.
    #[must_use]
    pub const fn dropped_pushes(&self) -> u32 {
        self.stack.dropped_pushes()
    }

    /// Install page-in tracking for the protected image.
    pub fn set_tracker(&mut self, tracker: PageInTracker) {
        self.tracker = Some(tracker);
    }

    /// Drop page-in tracking (protection stopped).
    pub fn clear_tracker(&mut self) {
        self.tracker = None;
    }

    /// The current page-in tracker, if any.
    #[must_use]
    pub const fn tracker(&self) -> Option<&PageInTracker> {
        self.tracker.as_ref()
    }

    /// Begin splitting over `table`: demote each record's routable frame
    /// to a 4 KiB EPT PTE, strip its access rights, and flush the EPT and
    /// VPID caches. Counters and the fault stack are reset.
    ///
    /// # Errors
    /// On any EPT failure the already-stripped prefix is restored to full
    /// access and the split is not activated.
    pub fn init_split(
        &mut self,
        mut table: TranslationTable,
        ept: &mut IdentityMap,
        arena: &mut FrameArena,
        tlb: &impl TlbFlush,
    ) -> Result<(), EptError> {
        if self.table.is_some() {
            self.end_split(tlb);
        }

        let mut failure = None;
        for record in table.iter_mut() {
            match ept.get_or_demote_pte(arena, record.routable_phys()) {
                Ok(slot) => {
                    slot.revoke_access();
                    record.pte = Some(slot);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            for record in &table {
                if let Some(slot) = record.pte {
                    slot.grant_all();
                }
            }
            tlb.invept_all();
            tlb.invvpid_all();
            warn!("init_split aborted: {e}");
            return Err(e);
        }

        tlb.invept_all();
        tlb.invvpid_all();
        self.stack.clear();
        self.thrash = false;
        self.counters = Counters::ZERO;
        info!("TLB split initialised over {} pages", table.len());
        self.table = Some(table);
        Ok(())
    }

    /// Tear the split down: restore every record's PTE to its code frame
    /// with full permissions and flush the EPT and VPID caches. Reports
    /// the exit counters. Safe to call when no split is active.
    pub fn end_split(&mut self, tlb: &impl TlbFlush) {
        if let Some(table) = self.table.take() {
            info!(
                "TLB split teardown: {} violations ({} code, {} data, {} thrashes, {} dropped pushes)",
                self.counters.violations,
                self.counters.code_exits,
                self.counters.data_exits,
                self.counters.thrashes,
                self.stack.dropped_pushes()
            );
            for record in &table {
                if let Some(slot) = record.pte {
                    slot.write(EptPte::identity(record.code_phys));
                }
            }
            tlb.invept_all();
            tlb.invvpid_all();
        }
        self.stack.clear();
        self.thrash = false;
    }

    fn record_parts(&self, index: usize) -> Option<(Option<hv_ept::PteSlot>, GuestVirtAddr)> {
        self.table
            .as_ref()
            .and_then(|t| t.get(index))
            .map(|r| (r.pte, r.gva))
    }

    /// Handle an EPT-violation exit for a (presumed) protected page.
    ///
    /// Installs the code or data frame according to the access kind, or
    /// both views' fixed point when thrashing, then arms the single-step
    /// trap. Does **not** advance the guest RIP — the access is replayed.
    pub fn on_ept_violation<M: PhysMapper>(
        &mut self,
        vmcs: &mut impl ExitVmcs,
        mapper: &M,
        tlb: &impl TlbFlush,
    ) -> ViolationOutcome {
        let gpa = vmcs.guest_physical();

        let found = self.table.as_ref().and_then(|t| t.find_by_gpa(gpa));
        let Some(index) = found else {
            warn!("EPT violation at {gpa} matches no record, ending split");
            self.end_split(tlb);
            return ViolationOutcome::TableMiss;
        };

        let Some((Some(slot), _)) = self.record_parts(index) else {
            // A record without an installed PTE cannot be resolved.
            self.end_split(tlb);
            return ViolationOutcome::TableMiss;
        };
        let (code_phys, data_phys) = match self.table.as_ref().and_then(|t| t.get(index)) {
            Some(r) => (r.code_phys, r.data_phys),
            None => return ViolationOutcome::TableMiss,
        };

        // A view armed for fetch can still raise a speculative violation
        // that resolved before we got here.
        let pte = slot.read();
        if pte.present() && pte.execute() {
            return ViolationOutcome::Spurious;
        }

        // The previous page's retire-step completed without its trap being
        // delivered to us; give it back full access before moving on.
        if let Some(top) = self.stack.peek()
            && top != index
            && let Some((Some(top_slot), _)) = self.record_parts(top)
        {
            top_slot.grant_all();
        }

        self.stack.push(index);
        self.counters.violations = self.counters.violations.wrapping_add(1);

        if self.stack.depth() >= 2 {
            // One instruction straddles code and data on this page.
            reconcile_views(
                mapper,
                code_phys,
                data_phys,
                vmcs.guest_rip(),
                vmcs.instruction_len(),
            );
            slot.write(
                pte.with_page_phys(data_phys)
                    .with_present(true)
                    .with_write(true)
                    .with_execute(true),
            );
            self.thrash = true;
            self.counters.thrashes = self.counters.thrashes.wrapping_add(1);
        } else {
            let qual = vmcs.exit_qualification();
            if qual.instruction_fetch() {
                self.counters.code_exits = self.counters.code_exits.wrapping_add(1);
                slot.write(
                    pte.with_page_phys(code_phys)
                        .with_present(false)
                        .with_write(false)
                        .with_execute(true),
                );
            } else if qual.is_data_access() {
                self.counters.data_exits = self.counters.data_exits.wrapping_add(1);
                slot.write(
                    pte.with_page_phys(data_phys)
                        .with_present(true)
                        .with_write(true)
                        .with_execute(false),
                );
            } else {
                return ViolationOutcome::Fatal;
            }
        }

        vmcs.set_trap_flag(true);
        ViolationOutcome::Resolved
    }

    /// Handle the single-step trap that follows a resolved violation:
    /// strip the retired page's access rights and clear the trap flag.
    /// During a thrash retire, both pending pages are re-armed and their
    /// stale TLB entries invalidated.
    pub fn on_trap(&mut self, vmcs: &mut impl ExitVmcs, tlb: &impl TlbFlush) -> TrapOutcome {
        let Some(index) = self.stack.pop() else {
            return TrapOutcome::NotSplitInduced;
        };

        if let Some((Some(slot), _)) = self.record_parts(index) {
            slot.revoke_access();
        }
        vmcs.set_trap_flag(false);

        if self.thrash {
            if let Some((_, gva)) = self.record_parts(index) {
                tlb.invvpid_addr(gva);
            }
            if self.stack.peek() == Some(index) {
                // The thrashing instruction pushed the same page twice.
                self.stack.pop();
            } else if let Some(other) = self.stack.pop()
                && let Some((other_slot, other_gva)) = self.record_parts(other)
            {
                if let Some(other_slot) = other_slot {
                    other_slot.revoke_access();
                }
                tlb.invvpid_addr(other_gva);
            }
            self.thrash = false;
        }

        TrapOutcome::Completed
    }

    /// React to a guest CR3 load: when it is the protected process's
    /// CR3, scan for image pages that became resident since the split
    /// began and extend the table with records for them. Always
    /// invalidates VPID afterwards — with VPID enabled the processor does
    /// not flush on CR3 writes for us.
    pub fn on_cr3_write<M: PhysMapper>(
        &mut self,
        new_cr3: u32,
        mapper: &M,
        ept: &mut IdentityMap,
        arena: &mut FrameArena,
        tlb: &impl TlbFlush,
    ) {
        self.scan_page_ins(new_cr3, mapper, ept, arena);
        tlb.invvpid_all();
    }

    fn scan_page_ins<M: PhysMapper>(
        &mut self,
        new_cr3: u32,
        mapper: &M,
        ept: &mut IdentityMap,
        arena: &mut FrameArena,
    ) {
        let Some(tracker) = self.tracker.as_mut() else {
            return;
        };
        if new_cr3 != tracker.target_cr3 {
            return;
        }
        let Some(table) = self.table.as_mut() else {
            return;
        };

        for i in 0..tracker.num_pages() {
            if tracker.is_tracked(i) {
                continue;
            }
            let gva = tracker.page_gva(i);

            let slot_addr = if let Some(addr) = tracker.pte_slot(i) {
                Some(addr)
            } else if let Ok(Some(addr)) = hv_guest_paging::pte_slot_addr(mapper, new_cr3, gva) {
                tracker.set_pte_slot(i, addr);
                Some(addr)
            } else {
                None
            };
            let Some(slot_addr) = slot_addr else { continue };

            // SAFETY: PTE slots live in guest page-table frames reachable
            // through the direct-map window; the view is transient.
            let Some(page) = (unsafe { mapper.map_page(slot_addr) }) else {
                continue;
            };
            #[allow(clippy::cast_possible_truncation)]
            let entry =
                hv_guest_paging::GuestPte::from_bits(page.u32_at(slot_addr.page_offset() as usize));
            drop(page);

            if !entry.present() || entry.page_phys().is_null() {
                continue;
            }
            let frame = entry.page_phys();

            if table.find_by_gpa(frame).is_some() {
                tracker.mark_tracked(i, frame);
                continue;
            }

            match ept.get_or_demote_pte(arena, frame) {
                Ok(slot) => {
                    slot.revoke_access();
                    let mut record = TranslationRecord::new(gva, frame, tracker.data_frame(i));
                    record.pte = Some(slot);
                    if table.push(record) {
                        tracker.mark_tracked(i, frame);
                        debug!("page-in: now splitting {gva} backed by {frame}");
                    } else {
                        // No room to track the page; give it back to the
                        // identity map rather than leaving it faulting.
                        slot.write(EptPte::identity(frame));
                        warn!("translation table full, page at {gva} left unprotected");
                    }
                }
                Err(e) => warn!("page-in: cannot split {gva}: {e}"),
            }
        }
    }
}

impl Default for SplitEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Ensure the faulting instruction's bytes agree between the two views
/// before letting it retire with both installed. Reconciliation is
/// clamped to the faulting page; an instruction straddling into the next
/// page is handled by that page's own fault cycle.
#[allow(clippy::cast_possible_truncation)]
fn reconcile_views<M: PhysMapper>(
    mapper: &M,
    code: PhysAddr,
    data: PhysAddr,
    rip: u32,
    instruction_len: u32,
) {
    let offset = (rip & 0xFFF) as usize;
    let len = (instruction_len as usize).min(PAGE_SIZE as usize - offset);
    if len == 0 {
        return;
    }
    // SAFETY: both frames belong to the faulting record; the views are
    // transient and this path is single threaded.
    let Some(code_page) = (unsafe { mapper.map_page(code) }) else {
        return;
    };
    let Some(mut data_page) = (unsafe { mapper.map_page(data) }) else {
        return;
    };
    let src = &code_page.bytes()[offset..offset + len];
    let dst = &mut data_page.bytes_mut()[offset..offset + len];
    if src != dst {
        dst.copy_from_slice(src);
    }
}
