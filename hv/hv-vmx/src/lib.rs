//! # Hypervisor Core
//!
//! VMCS plumbing, capability bring-up, and the VM-exit dispatch loop that
//! ties the split engine to the hardware.
//!
//! The core owns the process-wide [`Hypervisor`] state block: the frame
//! arena, the EPT identity map, the split engine, the MSR write policy,
//! and the protect lifecycle for the target image. VMX root mode cannot
//! carry a per-call argument plane, so the block lives behind a global
//! spinlock with the documented lifecycle *init at load → mutate during
//! exits → teardown at unload*.
//!
//! Everything that decides (dispatch, VMCALL handling, capability
//! validation, protect bookkeeping) is written against narrow traits
//! ([`VmcsOps`], [`HostOps`], the split engine's seams) and tests on any
//! host; everything that touches hardware (`VMREAD`, `INVVPID`, the exit
//! stub) lives in the [`hw`] module and compiles only for 32-bit x86 with
//! the `asm` feature.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod caps;
mod exit;
mod guest_state;
mod hypervisor;
mod msr_policy;
mod protect;
mod vmcs;

#[cfg(all(feature = "asm", target_arch = "x86"))]
pub mod hw;

pub use caps::{VmxCapabilities, VmxSetupError};
pub use exit::{CrAccessQual, ExitAction, ExitReason};
pub use guest_state::GuestState;
pub use hypervisor::{HostOps, Hypervisor, HYPERVISOR};
pub use msr_policy::MsrWriteBlockList;
pub use protect::{ImageInfo, ProtectError};
pub use vmcs::{VmcsField, VmcsOps, VmcsRegion};

/// The non-zero VPID tagging all guest TLB entries.
pub const VM_VPID: u16 = 1;

/// VMCALL command: disable the hypervisor and return to bare metal.
pub const VMCALL_DISABLE: u32 = 0x1234_5678;

/// VMCALL command: begin the TLB split over the staged translation table.
pub const VMCALL_INIT_SPLIT: u32 = 0x100F;

/// VMCALL command: end the TLB split and restore the identity map.
pub const VMCALL_END_SPLIT: u32 = 0x200F;

/// VMCALL command: measure the protected image (both checksum variants).
pub const VMCALL_MEASURE: u32 = 0x300F;
