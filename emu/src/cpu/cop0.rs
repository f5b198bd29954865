//! # Coprocessor 0 - System Control
//!
//! COP0 is where the R3000A keeps its privilege and exception machinery.
//! Three registers are bitfields with partial write masks; the rest are plain
//! words (and the breakpoint set - BPC/BDA/BPCM/BDAM/DCIC - is storage only,
//! this core never triggers hardware breakpoints).
//!
//! ```text
//! SR    31      28       22     16 15     8 7    6 5  4 3  2 1  0
//! ┌──────┬───────┬────────┬───────┬────────┬──────┬────┬────┬────┐
//! │ CU3..CU0     │  BEV   │  ...  │   Im   │ ...  │IEo │IEp │IEc │
//! │              │        │       │        │      │KUo │KUp │KUc │
//! └──────┴───────┴────────┴───────┴────────┴──────┴────┴────┴────┘
//! ```
//!
//! Bits 0-5 are the **mode stack**: three copies of the (interrupt-enable,
//! kernel/user) pair. Every exception pushes it left by two (landing in
//! kernel mode with interrupts off); `rfe` pops it right by two. The *old*
//! pair at bits 4-5 survives a pop, which is what lets a handler itself be
//! interrupted once and still return.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

/// Value of the read-only PRID register, per the nocash spec.
pub const PRID_VALUE: u32 = 0x0000_0002;

/// Exception codes as stored in `CAUSE.Excode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Excode {
    /// External interrupt.
    Int = 0x00,
    /// Address error on load or fetch.
    AdEL = 0x04,
    /// Address error on store.
    AdES = 0x05,
    /// Bus error on instruction fetch.
    IBE = 0x06,
    /// Bus error on data access.
    DBE = 0x07,
    Syscall = 0x08,
    /// `break` instruction.
    BP = 0x09,
    /// Reserved instruction.
    RI = 0x0A,
    /// Coprocessor unusable.
    CpU = 0x0B,
    /// Arithmetic overflow.
    Ov = 0x0C,
}

/// COP0 register numbers as addressed by `mfc0`/`mtc0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cop0Reg {
    Bpc = 3,
    Bda = 5,
    JumpDest = 6,
    Dcic = 7,
    BadVaddr = 8,
    Bdam = 9,
    Bpcm = 11,
    Sr = 12,
    Cause = 13,
    Epc = 14,
    Prid = 15,
}

impl TryFrom<u32> for Cop0Reg {
    type Error = String;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            3 => Ok(Self::Bpc),
            5 => Ok(Self::Bda),
            6 => Ok(Self::JumpDest),
            7 => Ok(Self::Dcic),
            8 => Ok(Self::BadVaddr),
            9 => Ok(Self::Bdam),
            11 => Ok(Self::Bpcm),
            12 => Ok(Self::Sr),
            13 => Ok(Self::Cause),
            14 => Ok(Self::Epc),
            15 => Ok(Self::Prid),
            _ => Err(format!("Unknown COP0 register {n}")),
        }
    }
}

/// The status register. Wraps the raw word with typed accessors so the
/// bit layout lives in exactly one place.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct Sr(u32);

impl Sr {
    /// Bits a guest `mtc0` can actually change.
    pub const WRITE_MASK: u32 = 0xF04F_FF3F;

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn set_bits(&mut self, bits: u32) {
        self.0 = bits;
    }

    /// Guest-visible write: only the masked bits change.
    pub const fn write_masked(&mut self, value: u32) {
        self.0 = (self.0 & !Self::WRITE_MASK) | (value & Self::WRITE_MASK);
    }

    /// IEc - current interrupt enable.
    #[must_use]
    pub fn interrupts_enabled(self) -> bool {
        self.0.get_bit(0)
    }

    /// KUc - current privilege; set means user mode.
    #[must_use]
    pub fn user_mode(self) -> bool {
        self.0.get_bit(1)
    }

    /// Im - the eight interrupt mask bits.
    #[must_use]
    pub fn interrupt_mask(self) -> u32 {
        self.0.get_bits(8..=15)
    }

    /// BEV - exceptions vector into the BIOS ROM while set.
    #[must_use]
    pub fn boot_exception_vectors(self) -> bool {
        self.0.get_bit(22)
    }

    /// CU0 - COP0 usable from user mode.
    #[must_use]
    pub fn cop0_enabled(self) -> bool {
        self.0.get_bit(28)
    }

    /// CU2 - GTE usable.
    #[must_use]
    pub fn cop2_enabled(self) -> bool {
        self.0.get_bit(30)
    }

    /// The six-bit mode stack (current/previous/old × {IE, KU}).
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        self.0.get_bits(0..=5)
    }

    pub fn set_mode_bits(&mut self, mode_bits: u32) {
        self.0.set_bits(0..=5, mode_bits);
    }

    /// Exception entry: current→previous→old, landing in kernel mode with
    /// interrupts disabled.
    pub fn push_mode(&mut self) {
        self.set_mode_bits(self.mode_bits() << 2);
    }

    /// `rfe`: previous→current, old→previous; the old pair stays put.
    pub fn pop_mode(&mut self) {
        let mode_bits = self.mode_bits();
        self.set_mode_bits((mode_bits & 0b11_0000) | (mode_bits >> 2));
    }
}

/// The cause register, describing the most recent exception.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct Cause(u32);

impl Cause {
    /// Only the two software interrupt-pending bits are guest-writable.
    pub const WRITE_MASK: u32 = 0x0000_0300;

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn set_bits(&mut self, bits: u32) {
        self.0 = bits;
    }

    pub const fn write_masked(&mut self, value: u32) {
        self.0 = (self.0 & !Self::WRITE_MASK) | (value & Self::WRITE_MASK);
    }

    /// Raw Excode field, bits 2-6.
    #[must_use]
    pub fn excode_bits(self) -> u32 {
        self.0.get_bits(2..=6)
    }

    pub fn set_excode(&mut self, excode: Excode) {
        self.0.set_bits(2..=6, excode as u32);
    }

    /// Ip - interrupt pending lines (two software, six hardware).
    #[must_use]
    pub fn interrupt_pending(self) -> u32 {
        self.0.get_bits(8..=15)
    }

    pub fn set_interrupt_pending(&mut self, pending: u32) {
        self.0.set_bits(8..=15, pending);
    }

    /// CE - coprocessor number of the faulting instruction.
    pub fn set_coprocessor(&mut self, cop_n: u8) {
        self.0.set_bits(28..=29, u32::from(cop_n));
    }

    /// BT - the faulting branch was taken.
    pub fn set_branch_taken(&mut self, taken: bool) {
        self.0.set_bit(30, taken);
    }

    /// BD - the fault hit a branch delay slot.
    #[must_use]
    pub fn branch_delay(self) -> bool {
        self.0.get_bit(31)
    }

    pub fn set_branch_delay(&mut self, in_delay_slot: bool) {
        self.0.set_bit(31, in_delay_slot);
    }
}

/// Breakpoint control. Storage only - honored by real debug units, ignored
/// by this core - but games write it, so the write mask still applies.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct Dcic(u32);

impl Dcic {
    pub const WRITE_MASK: u32 = 0xFF80_F03F;

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn set_bits(&mut self, bits: u32) {
        self.0 = bits;
    }

    pub const fn write_masked(&mut self, value: u32) {
        self.0 = (self.0 & !Self::WRITE_MASK) | (value & Self::WRITE_MASK);
    }
}

/// The full COP0 register block.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cop0Registers {
    pub bpc: u32,
    pub bda: u32,
    /// JUMPDEST - address of the branch target when an exception hit a delay
    /// slot. Read-only to the guest.
    pub tar: u32,
    pub bad_vaddr: u32,
    pub bdam: u32,
    pub bpcm: u32,
    pub epc: u32,
    pub prid: u32,
    pub sr: Sr,
    pub cause: Cause,
    pub dcic: Dcic,
}
