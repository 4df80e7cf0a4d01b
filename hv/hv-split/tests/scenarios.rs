//! End-to-end split-engine scenarios over fake memory, VMCS, and TLB.

use core::cell::{Cell, RefCell};
use hv_addr::{GuestVirtAddr, PhysAddr};
use hv_arena::FrameArena;
use hv_ept::{EptViolationQual, IdentityMap};
use hv_split::{
    ExitVmcs, SplitEngine, TlbFlush, TranslationRecord, TranslationTable, TrapOutcome,
    ViolationOutcome, PageInTracker,
};
use hv_testmem::TestPhys;

/// VMCS stand-in: the handful of fields the engine touches.
struct FakeVmcs {
    gpa: PhysAddr,
    qual: EptViolationQual,
    rip: u32,
    instr_len: u32,
    tf: Cell<bool>,
}

impl FakeVmcs {
    fn fetch(gpa: PhysAddr, rip: u32) -> Self {
        Self {
            gpa,
            qual: EptViolationQual::new().with_instruction_fetch(true),
            rip,
            instr_len: 1,
            tf: Cell::new(false),
        }
    }

    fn read(gpa: PhysAddr, rip: u32) -> Self {
        Self {
            gpa,
            qual: EptViolationQual::new().with_data_read(true),
            rip,
            instr_len: 1,
            tf: Cell::new(false),
        }
    }

    fn write(gpa: PhysAddr, rip: u32, instr_len: u32) -> Self {
        Self {
            gpa,
            qual: EptViolationQual::new().with_data_write(true),
            rip,
            instr_len,
            tf: Cell::new(false),
        }
    }
}

impl ExitVmcs for FakeVmcs {
    fn guest_physical(&self) -> PhysAddr {
        self.gpa
    }

    fn exit_qualification(&self) -> EptViolationQual {
        self.qual
    }

    fn guest_rip(&self) -> u32 {
        self.rip
    }

    fn instruction_len(&self) -> u32 {
        self.instr_len
    }

    fn set_trap_flag(&mut self, enabled: bool) {
        self.tf.set(enabled);
    }
}

/// Records every invalidation request.
#[derive(Default)]
struct RecordingTlb {
    invept_all: Cell<u32>,
    invvpid_all: Cell<u32>,
    invvpid_addrs: RefCell<Vec<u32>>,
}

impl TlbFlush for RecordingTlb {
    fn invept_all(&self) {
        self.invept_all.set(self.invept_all.get() + 1);
    }

    fn invvpid_all(&self) {
        self.invvpid_all.set(self.invvpid_all.get() + 1);
    }

    fn invvpid_addr(&self, gva: GuestVirtAddr) {
        self.invvpid_addrs.borrow_mut().push(gva.as_u32());
    }
}

struct Rig {
    mem: TestPhys,
    arena: FrameArena,
    ept: IdentityMap,
    engine: SplitEngine,
    tlb: RecordingTlb,
}

fn rig() -> Rig {
    let mut arena = FrameArena::new(32).unwrap();
    let ept = IdentityMap::new(&mut arena).unwrap();
    Rig {
        mem: TestPhys::new(),
        arena,
        ept,
        engine: SplitEngine::new(),
        tlb: RecordingTlb::default(),
    }
}

/// At most one protected page may be accessible between VM entries; if
/// one is, it must be the pending (stack-top) page.
fn assert_split_invariant(engine: &SplitEngine) {
    let Some(table) = engine.active_table() else {
        return;
    };
    let accessible = table
        .iter()
        .filter(|r| r.pte.is_some_and(|slot| slot.read().any_access()))
        .count();
    assert!(accessible <= 1, "more than one protected page accessible");
}

/// Scenario: a guest page bound to a RET-byte code frame and an FF-byte
/// data frame; reads see data, calls see code, teardown restores code.
#[test]
fn single_page_probe() {
    let mut rig = rig();
    let code = rig.mem.alloc_frame();
    let data = rig.mem.alloc_frame();
    rig.mem.frame_mut(code)[0] = 0xC3;
    rig.mem.frame_mut(data)[0] = 0xFF;

    let gva = GuestVirtAddr::new(0x0040_0000);
    let mut table = TranslationTable::with_capacity(1);
    assert!(table.push(TranslationRecord::new(gva, code, data)));
    rig.engine
        .init_split(table, &mut rig.ept, &mut rig.arena, &rig.tlb)
        .unwrap();

    // After init: nothing accessible, caches flushed, counters zero.
    assert_eq!(rig.tlb.invept_all.get(), 1);
    assert_eq!(rig.engine.counters().violations, 0);
    let table_ref = rig.engine.active_table().unwrap();
    assert!(table_ref.iter().all(|r| !r.pte.unwrap().read().any_access()));

    // Guest reads a byte: the data frame must be installed, readable and
    // writable but not executable.
    let mut vmcs = FakeVmcs::read(code, 0x0041_0000);
    assert_eq!(
        rig.engine.on_ept_violation(&mut vmcs, &rig.mem, &rig.tlb),
        ViolationOutcome::Resolved
    );
    assert!(vmcs.tf.get());
    assert_split_invariant(&rig.engine);
    {
        let r = rig.engine.active_table().unwrap().get(0).unwrap();
        let pte = r.pte.unwrap().read();
        assert_eq!(pte.page_phys(), data);
        assert!(pte.present() && pte.write());
        assert!(!pte.execute());
    }
    assert_eq!(rig.engine.on_trap(&mut vmcs, &rig.tlb), TrapOutcome::Completed);
    assert!(!vmcs.tf.get());
    assert_split_invariant(&rig.engine);

    // Guest calls into the page: the code frame must be installed
    // execute-only.
    let mut vmcs = FakeVmcs::fetch(code, 0x0040_0000);
    assert_eq!(
        rig.engine.on_ept_violation(&mut vmcs, &rig.mem, &rig.tlb),
        ViolationOutcome::Resolved
    );
    {
        let r = rig.engine.active_table().unwrap().get(0).unwrap();
        let pte = r.pte.unwrap().read();
        assert_eq!(pte.page_phys(), code);
        assert!(pte.execute());
        assert!(!pte.present() && !pte.write());
    }
    assert_eq!(rig.engine.on_trap(&mut vmcs, &rig.tlb), TrapOutcome::Completed);

    let counters = rig.engine.counters();
    assert_eq!(counters.code_exits, 1);
    assert_eq!(counters.data_exits, 1);
    assert_eq!(counters.thrashes, 0);
    assert_eq!(counters.violations, 2);

    // Teardown restores the code frame with full permissions.
    rig.engine.end_split(&rig.tlb);
    assert!(!rig.engine.split_active());
    let slot = rig.ept.get_or_demote_pte(&mut rig.arena, code).unwrap();
    let pte = slot.read();
    assert_eq!(pte.page_phys(), code);
    assert!(pte.present() && pte.write() && pte.execute());
}

/// Scenario: one 6-byte instruction at 0x400100 stores to 0x400180 — code
/// and data on the same page. The second fault before any retire detects
/// the thrash, reconciles the instruction bytes, and installs the data
/// frame with full rights; the trap pops both pending entries.
#[test]
fn thrash_resolution() {
    let mut rig = rig();
    let code = rig.mem.alloc_frame();
    let data = rig.mem.alloc_frame();
    // The data view was patched at the instruction's bytes.
    rig.mem.frame_mut(code)[0x100..0x106].copy_from_slice(&[0xC7, 0x05, 0x80, 0x01, 0x40, 0x00]);
    rig.mem.frame_mut(data)[0x100..0x106].fill(0x90);

    let gva = GuestVirtAddr::new(0x0040_0000);
    let mut table = TranslationTable::with_capacity(1);
    assert!(table.push(TranslationRecord::new(gva, code, data)));
    rig.engine
        .init_split(table, &mut rig.ept, &mut rig.arena, &rig.tlb)
        .unwrap();

    let rip = 0x0040_0100;

    // First violation: the fetch.
    let mut fetch = FakeVmcs::fetch(code, rip);
    assert_eq!(
        rig.engine.on_ept_violation(&mut fetch, &rig.mem, &rig.tlb),
        ViolationOutcome::Resolved
    );

    // Second violation before the retire: the store to the same page.
    let mut store = FakeVmcs::write(code, rip, 6);
    assert_eq!(
        rig.engine.on_ept_violation(&mut store, &rig.mem, &rig.tlb),
        ViolationOutcome::Resolved
    );
    assert!(store.tf.get());

    // The faulting instruction is now identical in both views and the
    // data frame is installed with full access for the retire.
    assert_eq!(
        rig.mem.frame(data)[0x100..0x106],
        rig.mem.frame(code)[0x100..0x106]
    );
    {
        let r = rig.engine.active_table().unwrap().get(0).unwrap();
        let pte = r.pte.unwrap().read();
        assert_eq!(pte.page_phys(), data);
        assert!(pte.present() && pte.write() && pte.execute());
    }

    // The retire trap re-arms the page and drains both stack entries.
    assert_eq!(rig.engine.on_trap(&mut store, &rig.tlb), TrapOutcome::Completed);
    assert!(!store.tf.get());
    assert_split_invariant(&rig.engine);
    {
        let r = rig.engine.active_table().unwrap().get(0).unwrap();
        assert!(!r.pte.unwrap().read().any_access());
    }
    assert_eq!(rig.tlb.invvpid_addrs.borrow().as_slice(), &[0x0040_0000]);

    let counters = rig.engine.counters();
    assert!(counters.thrashes >= 1);

    // A subsequent ordinary access works normally again.
    let mut vmcs = FakeVmcs::read(code, rip);
    assert_eq!(
        rig.engine.on_ept_violation(&mut vmcs, &rig.mem, &rig.tlb),
        ViolationOutcome::Resolved
    );
    assert_eq!(rig.engine.on_trap(&mut vmcs, &rig.tlb), TrapOutcome::Completed);
}

/// Scenario: an EPT violation whose address matches no record triggers
/// the safety shutdown, and a fresh `init_split` afterwards proceeds
/// normally.
#[test]
fn graceful_teardown_on_table_miss() {
    let mut rig = rig();
    let code = rig.mem.alloc_frame();
    let data = rig.mem.alloc_frame();
    let gva = GuestVirtAddr::new(0x0040_0000);

    let mut table = TranslationTable::with_capacity(1);
    assert!(table.push(TranslationRecord::new(gva, code, data)));
    rig.engine
        .init_split(table, &mut rig.ept, &mut rig.arena, &rig.tlb)
        .unwrap();

    let stray = rig.mem.alloc_frame();
    let mut vmcs = FakeVmcs::read(stray, 0);
    assert_eq!(
        rig.engine.on_ept_violation(&mut vmcs, &rig.mem, &rig.tlb),
        ViolationOutcome::TableMiss
    );
    assert!(!rig.engine.split_active());

    // The protected page went back to its code frame, fully accessible.
    let slot = rig.ept.get_or_demote_pte(&mut rig.arena, code).unwrap();
    assert!(slot.read().any_access());
    assert_eq!(slot.read().page_phys(), code);

    // Protection can restart with a fresh table.
    let mut table = TranslationTable::with_capacity(1);
    assert!(table.push(TranslationRecord::new(gva, code, data)));
    rig.engine
        .init_split(table, &mut rig.ept, &mut rig.arena, &rig.tlb)
        .unwrap();
    assert!(rig.engine.split_active());
}

/// Scenario: protection begins while only one image page is resident; a
/// CR3 write after the second page faults in appends its record.
#[test]
fn cr3_write_tracks_page_in() {
    let mut rig = rig();
    let target_cr3: u32 = 0x0000_1000;
    rig.mem.alloc_frame(); // guest page directory at 0x1000
    let guest_pt = rig.mem.alloc_frame(); // page table for the image range

    let image_base = GuestVirtAddr::new(0x0040_0000);
    let code0 = rig.mem.alloc_frame();
    let data0 = rig.mem.alloc_frame();
    let data1 = rig.mem.alloc_frame();

    // Guest paging: PDE 1 -> guest_pt; only image page 0 resident.
    rig.mem.write_u32(
        PhysAddr::new(0x1000 + (image_base.pde_index() * 4) as u64),
        hv_guest_paging::GuestPde::referencing(guest_pt).into_bits(),
    );
    rig.mem.write_u32(
        PhysAddr::new(guest_pt.as_u64() + (image_base.pte_index() * 4) as u64),
        hv_guest_paging::GuestPte::mapping(code0).into_bits(),
    );

    let mut table = TranslationTable::with_capacity(2);
    assert!(table.push(TranslationRecord::new(image_base, code0, data0)));
    rig.engine
        .init_split(table, &mut rig.ept, &mut rig.arena, &rig.tlb)
        .unwrap();

    let mut tracker = PageInTracker::new(target_cr3, image_base, vec![data0, data1]);
    tracker.mark_tracked(0, code0);
    rig.engine.set_tracker(tracker);

    // A foreign CR3 load must not scan.
    rig.engine
        .on_cr3_write(0x0002_0000, &rig.mem, &mut rig.ept, &mut rig.arena, &rig.tlb);
    assert_eq!(rig.engine.active_table().unwrap().len(), 1);

    // Page 1 becomes resident, then the target's CR3 is re-loaded.
    let code1 = rig.mem.alloc_frame();
    let page1 = image_base.wrapping_add(0x1000);
    rig.mem.write_u32(
        PhysAddr::new(guest_pt.as_u64() + (page1.pte_index() * 4) as u64),
        hv_guest_paging::GuestPte::mapping(code1).into_bits(),
    );
    let flushes_before = rig.tlb.invvpid_all.get();
    rig.engine
        .on_cr3_write(target_cr3, &rig.mem, &mut rig.ept, &mut rig.arena, &rig.tlb);

    let table = rig.engine.active_table().unwrap();
    assert_eq!(table.len(), 2);
    let appended = table.get(1).unwrap();
    assert_eq!(appended.gva, page1);
    assert_eq!(appended.code_phys, code1);
    assert_eq!(appended.data_phys, data1);
    assert!(!appended.pte.unwrap().read().any_access());
    assert_eq!(rig.engine.tracker().unwrap().code_frames()[1], code1);
    assert!(rig.tlb.invvpid_all.get() > flushes_before);

    // Scanning again appends nothing new.
    rig.engine
        .on_cr3_write(target_cr3, &rig.mem, &mut rig.ept, &mut rig.arena, &rig.tlb);
    assert_eq!(rig.engine.active_table().unwrap().len(), 2);
}

/// A trap that was not produced by the split engine is reported back for
/// re-injection instead of being swallowed.
#[test]
fn foreign_trap_is_not_ours() {
    let mut rig = rig();
    let mut vmcs = FakeVmcs::fetch(PhysAddr::new(0x5000), 0);
    assert_eq!(
        rig.engine.on_trap(&mut vmcs, &rig.tlb),
        TrapOutcome::NotSplitInduced
    );
}

/// Violation-handler re-entry with the same fetch access after the view
/// is installed is spurious and must not disturb the stack.
#[test]
fn spurious_violation_after_install() {
    let mut rig = rig();
    let code = rig.mem.alloc_frame();
    let data = rig.mem.alloc_frame();
    let gva = GuestVirtAddr::new(0x0040_0000);
    let mut table = TranslationTable::with_capacity(1);
    assert!(table.push(TranslationRecord::new(gva, code, data)));
    rig.engine
        .init_split(table, &mut rig.ept, &mut rig.arena, &rig.tlb)
        .unwrap();

    // Install the code view, then force it fully accessible as a thrash
    // retire would.
    let mut vmcs = FakeVmcs::fetch(code, 0);
    assert_eq!(
        rig.engine.on_ept_violation(&mut vmcs, &rig.mem, &rig.tlb),
        ViolationOutcome::Resolved
    );
    rig.engine
        .active_table()
        .unwrap()
        .get(0)
        .unwrap()
        .pte
        .unwrap()
        .grant_all();

    let violations_before = rig.engine.counters().violations;
    let mut again = FakeVmcs::fetch(code, 0);
    assert_eq!(
        rig.engine.on_ept_violation(&mut again, &rig.mem, &rig.tlb),
        ViolationOutcome::Spurious
    );
    assert_eq!(rig.engine.counters().violations, violations_before);
    assert!(!again.tf.get());
}
