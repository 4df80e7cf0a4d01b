//! EFLAGS — the 32-bit flags register.
//!
//! The split engine cares about exactly one bit: `TF`. Setting it in the
//! guest's saved EFLAGS forces a single-step debug trap after the next
//! retired instruction, which is how a freshly installed code/data view is
//! re-armed.

use bitfield_struct::bitfield;

/// Architectural EFLAGS model.
#[bitfield(u32, order = Lsb)]
pub struct Eflags {
    /// Carry Flag.
    pub cf: bool, // 0

    /// Always 1.
    #[bits(default = true)]
    _always1: bool, // 1

    /// Parity Flag.
    pub pf: bool, // 2

    /// Reserved (always 0).
    #[bits(default = false)]
    _rsvd3: bool, // 3

    /// Adjust Flag.
    pub af: bool, // 4

    /// Reserved (always 0).
    #[bits(default = false)]
    _rsvd5: bool, // 5

    /// Zero Flag.
    pub zf: bool, // 6

    /// Sign Flag.
    pub sf: bool, // 7

    /// Trap Flag — single-step after the next instruction.
    pub tf: bool, // 8

    /// Interrupt Enable Flag.
    pub if_interrupt_enable: bool, // 9

    /// Direction Flag.
    pub df: bool, // 10

    /// Overflow Flag.
    pub of: bool, // 11

    /// I/O Privilege Level.
    #[bits(2)]
    pub iopl: u8, // 12-13

    /// Nested Task.
    pub nt: bool, // 14

    /// Reserved.
    #[bits(default = false)]
    _rsvd15: bool, // 15

    /// Resume Flag.
    pub rf: bool, // 16

    /// Virtual-8086 Mode.
    pub vm: bool, // 17

    /// Alignment Check / Access Control.
    pub ac: bool, // 18

    /// Virtual Interrupt Flag.
    pub vif: bool, // 19

    /// Virtual Interrupt Pending.
    pub vip: bool, // 20

    /// Identification Flag.
    pub id: bool, // 21

    /// Reserved high bits.
    #[bits(10)]
    _rsvd: u16, // 22-31
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_flag_is_bit_8() {
        assert_eq!(Eflags::new().with_tf(true).into_bits() & (1 << 8), 1 << 8);
        let cleared = Eflags::from_bits(0xFFFF_FFFF).with_tf(false);
        assert_eq!(cleared.into_bits() & (1 << 8), 0);
    }
}
