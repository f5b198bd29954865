//! The COP2 seam.
//!
//! The Geometry Transformation Engine does the console's 3D math, but none of
//! that math lives in this crate: the CPU only needs to move words in and out
//! of the GTE register files and hand over command words. [`Gte`] is that
//! surface; [`GteRegisters`] is the shipped implementation, which stores the
//! register files and treats commands as storage-only (a full GTE slots in by
//! implementing the trait).

use serde::{Deserialize, Serialize};

use crate::savestate::StateWrapper;

/// What the CPU needs from coprocessor 2. `mfc2`/`mtc2` move data registers,
/// `cfc2`/`ctc2` move control registers, and every non-register-transfer COP2
/// opcode is delivered verbatim to [`execute_instruction`](Self::execute_instruction).
pub trait Gte {
    fn reset(&mut self);

    fn read_data_register(&self, index: u32) -> u32;
    fn write_data_register(&mut self, index: u32, value: u32);

    fn read_control_register(&self, index: u32) -> u32;
    fn write_control_register(&mut self, index: u32, value: u32);

    fn execute_instruction(&mut self, instruction_bits: u32);

    fn do_state(&mut self, sw: &mut StateWrapper) -> bool;
}

/// Register files of the GTE: 32 data words and 32 control words.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GteRegisters {
    data: [u32; 32],
    control: [u32; 32],
}

impl Gte for GteRegisters {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn read_data_register(&self, index: u32) -> u32 {
        self.data[(index & 0x1F) as usize]
    }

    fn write_data_register(&mut self, index: u32, value: u32) {
        self.data[(index & 0x1F) as usize] = value;
    }

    fn read_control_register(&self, index: u32) -> u32 {
        self.control[(index & 0x1F) as usize]
    }

    fn write_control_register(&mut self, index: u32, value: u32) {
        self.control[(index & 0x1F) as usize] = value;
    }

    fn execute_instruction(&mut self, instruction_bits: u32) {
        tracing::trace!("GTE command 0x{:02X} ignored", instruction_bits & 0x3F);
    }

    fn do_state(&mut self, sw: &mut StateWrapper) -> bool {
        for value in self.data.iter_mut().chain(self.control.iter_mut()) {
            sw.do_value(value);
        }
        !sw.has_error()
    }
}
