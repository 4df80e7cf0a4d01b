//! # Typed x86 Registers
//!
//! `bitfield-struct` models of the control registers, the flags register,
//! and the model-specific registers this hypervisor reads during bring-up
//! and manipulates at runtime. The raw register moves live behind the
//! `asm` feature so the layouts stay testable on any host.
//!
//! The hypervisor targets 32-bit VMX root operation over a 32-bit non-PAE
//! guest, so `CR3`, `CR4`, and `EFLAGS` are modelled at their 32-bit
//! width. MSRs are architecturally 64-bit everywhere.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "cr4")]
pub mod cr4;

#[cfg(feature = "eflags")]
pub mod eflags;

#[cfg(feature = "msr")]
pub mod msr;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety
    /// requirements; register access is typically privileged (CPL 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety
    /// requirements; register access is typically privileged (CPL 0).
    unsafe fn store_unsafe(self);
}
