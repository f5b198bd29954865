//! # PlayStation CPU - MIPS R3000A
//!
//! The PS1's processor is a 33.8688 MHz MIPS-I core. Unlike later MIPS parts
//! it has no hardware interlocks, so two pieces of pipeline state are visible
//! to software and must be emulated faithfully:
//!
//! ## Branch delay slots
//!
//! The instruction *statically after* a branch executes *before* the branch
//! target:
//!
//! ```text
//!   beq  $1, $0, target     ; branch decided here
//!   ori  $2, $0, 1          ; delay slot - ALWAYS runs, taken or not
//! target:
//!   ...                     ; control arrives afterwards
//! ```
//!
//! The core therefore tracks two program counters: `pc` (the instruction
//! being executed) and `npc` (the next fetch address). A branch only rewrites
//! `npc`, so the already-fetched delay-slot instruction still runs.
//!
//! ## Load delay slots
//!
//! A load's result is not visible to the *immediately following* instruction;
//! that instruction still sees the register's previous value:
//!
//! ```text
//!   lw   $4, 0($0)          ; $4 <- mem, but not yet...
//!   addu $5, $4, $0         ; ...this still reads the OLD $4
//!   addu $6, $4, $0         ; this one reads the loaded value
//! ```
//!
//! Emulated with a one-entry shadow: the load writes the register file
//! immediately but records `(reg, old_value)`, and reads by the next
//! instruction are redirected to the old value.
//!
//! ## Exceptions and interrupts
//!
//! Coprocessor 0 holds the system-control state: the SR mode stack (pushed on
//! every exception, popped by `rfe`), the CAUSE word describing the last
//! exception, and EPC/TAR/BadVaddr. All exceptions vector to
//! `base | 0x80` where BEV in SR selects the base (BIOS ROM vs RAM).
//!
//! ## Module structure
//!
//! - [`core`] - the `Cpu` itself: step loop, pipeline, interpreter body
//! - [`instruction`] - raw-word accessors and the two-level opcode decode
//! - [`registers`] - general register file, pc/npc, hi/lo
//! - [`cop0`] - system-control register block (SR/CAUSE/DCIC bitfields)
//! - [`gte`] - the COP2 seam; register transfer only, arithmetic lives outside

#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_possible_wrap)]
#[allow(clippy::cast_sign_loss)]
pub mod core;
pub mod cop0;
pub mod gte;
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_possible_wrap)]
#[allow(clippy::cast_sign_loss)]
pub mod instruction;
pub mod registers;

use crate::bus::TickCount;

pub use self::core::Cpu;

/// Execution starts here after reset: the BIOS ROM entry point in KSEG1.
pub const RESET_VECTOR: u32 = 0xBFC0_0000;

/// Largest tick budget handed to [`Cpu::execute`] in one go; reset starts the
/// downcount here and the outer scheduler replenishes it each slice.
pub const MAX_SLICE_SIZE: TickCount = 2048;

/// Bytes of data cache carried in the core (mapped as scratchpad by the bus).
pub const DCACHE_SIZE: usize = 1024;
