use logger::log;

use crate::bus::{Bus, TickCount};
use crate::cpu::cop0::{Cop0Reg, Cop0Registers, Excode, PRID_VALUE};
use crate::cpu::gte::{Gte, GteRegisters};
use crate::cpu::instruction::{Cop0Op, CopCommonOp, Instruction, InstructionFunct, InstructionOp};
use crate::cpu::registers::{Registers, REG_A0, REG_RA, REG_S0};
use crate::cpu::{DCACHE_SIZE, MAX_SLICE_SIZE, RESET_VECTOR};
use crate::savestate::StateWrapper;

/// Sentinel for "no register pending" in the load-delay shadow; real register
/// indices stop at 31.
const REG_NONE: u8 = 32;

const fn add_overflow(old_value: u32, add_value: u32, new_value: u32) -> bool {
    ((new_value ^ old_value) & (new_value ^ add_value)) & 0x8000_0000 != 0
}

const fn sub_overflow(old_value: u32, sub_value: u32, new_value: u32) -> bool {
    ((new_value ^ old_value) & (old_value ^ sub_value)) & 0x8000_0000 != 0
}

/// The R3000A interpreter.
///
/// Owns the register file, COP0, the GTE register transfer seam and the
/// visible pipeline state; borrows the bus for the duration of each
/// [`execute`](Self::execute) slice. Faults never surface to the caller -
/// they vector the guest through COP0 like the real part.
pub struct Cpu<G: Gte = GteRegisters> {
    pending_ticks: TickCount,
    downcount: TickCount,

    pub regs: Registers,
    pub cop0: Cop0Registers,
    pub cop2: G,

    /// The word being executed and its bookkeeping, consumed by exception
    /// reporting.
    current_instruction: Instruction,
    current_instruction_pc: u32,
    current_in_branch_delay_slot: bool,
    current_was_branch_taken: bool,

    /// The pre-fetched word and its classification.
    next_instruction: Instruction,
    next_is_branch_delay_slot: bool,
    branch_was_taken: bool,

    /// Pending load-delay slot: reads of `load_delay_reg` see the old value.
    load_delay_reg: u8,
    load_delay_old_value: u32,
    /// Slot being prepared by the instruction in flight.
    next_load_delay_reg: u8,
    next_load_delay_old_value: u32,

    cache_control: u32,
    dcache: [u8; DCACHE_SIZE],
}

impl<G: Gte + Default> Default for Cpu<G> {
    fn default() -> Self {
        Self::new(G::default())
    }
}

impl<G: Gte> Cpu<G> {
    pub fn new(cop2: G) -> Self {
        let mut cop0 = Cop0Registers::default();
        // From the nocash spec.
        cop0.prid = PRID_VALUE;

        Self {
            pending_ticks: 0,
            downcount: MAX_SLICE_SIZE,
            regs: Registers::default(),
            cop0,
            cop2,
            current_instruction: Instruction::default(),
            current_instruction_pc: 0,
            current_in_branch_delay_slot: false,
            current_was_branch_taken: false,
            next_instruction: Instruction::default(),
            next_is_branch_delay_slot: false,
            branch_was_taken: false,
            load_delay_reg: REG_NONE,
            load_delay_old_value: 0,
            next_load_delay_reg: REG_NONE,
            next_load_delay_old_value: 0,
            cache_control: 0,
            dcache: [0; DCACHE_SIZE],
        }
    }

    #[must_use]
    pub const fn pending_ticks(&self) -> TickCount {
        self.pending_ticks
    }

    pub fn reset_pending_ticks(&mut self) {
        self.pending_ticks = 0;
    }

    #[must_use]
    pub const fn downcount(&self) -> TickCount {
        self.downcount
    }

    /// Replenishes the slice budget; called by the outer scheduler between
    /// [`execute`](Self::execute) calls.
    pub fn set_downcount(&mut self, downcount: TickCount) {
        self.downcount = downcount;
    }

    pub fn reset<B: Bus>(&mut self, bus: &mut B) {
        self.pending_ticks = 0;
        self.downcount = MAX_SLICE_SIZE;

        self.regs = Registers::default();

        self.cop0.bpc = 0;
        self.cop0.bda = 0;
        self.cop0.tar = 0;
        self.cop0.bad_vaddr = 0;
        self.cop0.bdam = 0;
        self.cop0.bpcm = 0;
        self.cop0.epc = 0;
        self.cop0.sr.set_bits(0);
        self.cop0.cause.set_bits(0);

        self.cop2.reset();

        self.set_pc(bus, RESET_VECTOR);
    }

    /// Redirects execution and refills the pipeline from the new address.
    pub fn set_pc<B: Bus>(&mut self, bus: &mut B, new_pc: u32) {
        self.regs.npc = new_pc;
        self.flush_pipeline(bus);
    }

    pub fn do_state(&mut self, sw: &mut StateWrapper) -> bool {
        sw.do_value(&mut self.pending_ticks);
        sw.do_value(&mut self.downcount);
        for reg in self.regs.raw() {
            sw.do_value(reg);
        }
        sw.do_value(&mut self.regs.pc);
        sw.do_value(&mut self.regs.hi);
        sw.do_value(&mut self.regs.lo);
        sw.do_value(&mut self.regs.npc);
        sw.do_value(&mut self.cop0.bpc);
        sw.do_value(&mut self.cop0.bda);
        sw.do_value(&mut self.cop0.tar);
        sw.do_value(&mut self.cop0.bad_vaddr);
        sw.do_value(&mut self.cop0.bdam);
        sw.do_value(&mut self.cop0.bpcm);
        sw.do_value(&mut self.cop0.epc);
        sw.do_value(&mut self.cop0.prid);
        self.do_register_bits(sw);
        sw.do_value(&mut self.next_instruction.0);
        sw.do_value(&mut self.current_instruction.0);
        sw.do_value(&mut self.current_instruction_pc);
        sw.do_value(&mut self.current_in_branch_delay_slot);
        sw.do_value(&mut self.current_was_branch_taken);
        sw.do_value(&mut self.next_is_branch_delay_slot);
        sw.do_value(&mut self.branch_was_taken);
        sw.do_value(&mut self.load_delay_reg);
        sw.do_value(&mut self.load_delay_old_value);
        sw.do_value(&mut self.next_load_delay_reg);
        sw.do_value(&mut self.next_load_delay_old_value);
        sw.do_value(&mut self.cache_control);
        sw.do_bytes(&mut self.dcache);

        if !self.cop2.do_state(sw) {
            return false;
        }

        !sw.has_error()
    }

    fn do_register_bits(&mut self, sw: &mut StateWrapper) {
        let mut sr_bits = self.cop0.sr.bits();
        let mut cause_bits = self.cop0.cause.bits();
        let mut dcic_bits = self.cop0.dcic.bits();
        sw.do_value(&mut sr_bits);
        sw.do_value(&mut cause_bits);
        sw.do_value(&mut dcic_bits);
        if sw.is_reading() {
            self.cop0.sr.set_bits(sr_bits);
            self.cop0.cause.set_bits(cause_bits);
            self.cop0.dcic.set_bits(dcic_bits);
        }
    }

    /// Runs instructions until the downcount goes negative, then returns to
    /// the scheduler.
    pub fn execute<B: Bus>(&mut self, bus: &mut B) {
        while self.downcount >= 0 {
            self.pending_ticks += 2;
            self.downcount -= 2;

            // now executing the instruction we previously fetched
            self.current_instruction = self.next_instruction;
            self.current_instruction_pc = self.regs.pc;
            self.current_in_branch_delay_slot = self.next_is_branch_delay_slot;
            self.current_was_branch_taken = self.branch_was_taken;
            self.next_is_branch_delay_slot = false;
            self.branch_was_taken = false;

            // fetch the next instruction
            if self.dispatch_interrupts(bus) || !self.fetch_instruction(bus) {
                continue;
            }

            self.execute_instruction(bus);

            // next load delay
            self.load_delay_reg = self.next_load_delay_reg;
            self.load_delay_old_value = self.next_load_delay_old_value;
            self.next_load_delay_reg = REG_NONE;
            self.next_load_delay_old_value = 0;
        }
    }

    /// Asserts interrupt line `bit` in `CAUSE.Ip` (device hook).
    pub fn set_external_interrupt(&mut self, bit: u8) {
        let pending = self.cop0.cause.interrupt_pending();
        self.cop0.cause.set_interrupt_pending(pending | (1 << bit));
    }

    pub fn clear_external_interrupt(&mut self, bit: u8) {
        let pending = self.cop0.cause.interrupt_pending();
        self.cop0.cause.set_interrupt_pending(pending & !(1 << bit));
    }

    fn dispatch_interrupts<B: Bus>(&mut self, bus: &mut B) -> bool {
        // If the instruction we're about to execute is a GTE instruction,
        // hold the interrupt until the next one: dispatching here leaves
        // titles with incorrectly sorted, flickering polygons.
        if self.next_instruction.is_cop2_instruction() {
            return false;
        }

        let pending = (self.cop0.cause.bits() & self.cop0.sr.bits()) & 0x0000_FF00;
        if !self.cop0.sr.interrupts_enabled() || pending == 0 {
            return false;
        }

        self.raise_exception(bus, Excode::Int);
        true
    }

    fn fetch_instruction<B: Bus>(&mut self, bus: &mut B) -> bool {
        let npc = self.regs.npc;
        if npc & 3 != 0 {
            // The EPC must be the fetching address, not the instruction
            // about to execute.
            self.cop0.bad_vaddr = npc;
            self.raise_exception_with(bus, Excode::AdEL, npc, false, false, 0);
            return false;
        }

        match bus.read_word(npc) {
            Some(bits) => self.next_instruction = Instruction(bits),
            None => {
                // Bus errors don't set BadVaddr.
                self.raise_exception_with(bus, Excode::IBE, npc, false, false, 0);
                return false;
            }
        }

        self.regs.pc = npc;
        self.regs.npc = npc.wrapping_add(4);
        true
    }

    fn flush_load_delay(&mut self) {
        self.load_delay_reg = REG_NONE;
        self.load_delay_old_value = 0;
        self.next_load_delay_reg = REG_NONE;
        self.next_load_delay_old_value = 0;
    }

    fn flush_pipeline<B: Bus>(&mut self, bus: &mut B) {
        // loads are flushed
        self.flush_load_delay();

        // not in a branch delay slot
        self.branch_was_taken = false;
        self.next_is_branch_delay_slot = false;

        // prefetch the next instruction
        self.fetch_instruction(bus);
    }

    /// Reads a general register through the load-delay shadow.
    fn read_reg(&self, reg: u8) -> u32 {
        if reg == self.load_delay_reg {
            self.load_delay_old_value
        } else {
            self.regs.register_at(reg)
        }
    }

    /// Writes a register so that the *next* instruction still sees the old
    /// value (load semantics).
    fn write_reg_delayed(&mut self, reg: u8, value: u32) {
        debug_assert!(self.next_load_delay_reg == REG_NONE);
        if reg == 0 {
            return;
        }

        // the old value is returned if the register is read in the next
        // instruction
        self.next_load_delay_reg = reg;
        self.next_load_delay_old_value = self.read_reg(reg);
        self.regs.set_register_at(reg, value);
    }

    /// Marks the following instruction as a branch delay slot, and redirects
    /// fetch when `condition` holds. Every branch funnels through here so the
    /// slot classification can never be forgotten.
    fn branch_if(&mut self, condition: bool, target: u32) {
        self.next_is_branch_delay_slot = true;
        if condition {
            self.regs.npc = target;
            self.branch_was_taken = true;
        }
    }

    fn branch(&mut self, target: u32) {
        self.branch_if(true, target);
    }

    fn exception_vector(&self) -> u32 {
        let base: u32 = if self.cop0.sr.boot_exception_vectors() {
            0xBFC0_0100
        } else {
            0x8000_0000
        };

        // The R3000A manual routes BP to base | 0x40; apparently that isn't
        // what this part does, everything lands on the common vector.
        base | 0x80
    }

    /// Raises an exception attributed to the currently executing instruction.
    fn raise_exception<B: Bus>(&mut self, bus: &mut B, excode: Excode) {
        if excode == Excode::RI {
            log(format!(
                "Invalid instruction 0x{:08X} at 0x{:08X}",
                self.current_instruction.bits(),
                self.current_instruction_pc
            ));
        }

        self.raise_exception_with(
            bus,
            excode,
            self.current_instruction_pc,
            self.current_in_branch_delay_slot,
            self.current_was_branch_taken,
            self.current_instruction.cop_n(),
        );
    }

    fn raise_exception_with<B: Bus>(
        &mut self,
        bus: &mut B,
        excode: Excode,
        epc: u32,
        bd: bool,
        bt: bool,
        ce: u8,
    ) {
        tracing::debug!(
            "Exception {:?} at 0x{:08X} (epc=0x{epc:08X}, BD={bd}, CE={ce})",
            excode,
            self.current_instruction_pc
        );

        self.cop0.epc = epc;
        self.cop0.cause.set_excode(excode);
        self.cop0.cause.set_branch_delay(bd);
        self.cop0.cause.set_branch_taken(bt);
        self.cop0.cause.set_coprocessor(ce);

        if bd {
            // TAR holds the address which was being fetched for this
            // instruction, i.e. the branch target set up before the fault.
            self.cop0.epc = epc.wrapping_sub(4);
            self.cop0.tar = self.regs.pc;
        }

        // current -> previous: kernel mode, interrupts disabled
        self.cop0.sr.push_mode();

        // flush the pipeline - we don't want to execute the previously
        // fetched instruction
        self.regs.npc = self.exception_vector();
        self.flush_pipeline(bus);
    }

    fn do_alignment_check<B: Bus>(
        &mut self,
        bus: &mut B,
        address: u32,
        alignment: u32,
        is_read: bool,
    ) -> bool {
        if address & (alignment - 1) == 0 {
            return true;
        }

        self.cop0.bad_vaddr = address;
        let excode = if is_read { Excode::AdEL } else { Excode::AdES };
        self.raise_exception(bus, excode);
        false
    }

    pub fn read_memory_byte<B: Bus>(&mut self, bus: &mut B, address: u32) -> Option<u8> {
        let value = bus.read_byte(address);
        if value.is_none() {
            self.raise_exception(bus, Excode::DBE);
        }
        value
    }

    pub fn read_memory_half_word<B: Bus>(&mut self, bus: &mut B, address: u32) -> Option<u16> {
        if !self.do_alignment_check(bus, address, 2, true) {
            return None;
        }

        let value = bus.read_half_word(address);
        if value.is_none() {
            self.raise_exception(bus, Excode::DBE);
        }
        value
    }

    pub fn read_memory_word<B: Bus>(&mut self, bus: &mut B, address: u32) -> Option<u32> {
        if !self.do_alignment_check(bus, address, 4, true) {
            return None;
        }

        let value = bus.read_word(address);
        if value.is_none() {
            self.raise_exception(bus, Excode::DBE);
        }
        value
    }

    pub fn write_memory_byte<B: Bus>(&mut self, bus: &mut B, address: u32, value: u8) -> bool {
        let result = bus.write_byte(address, value);
        if !result {
            self.raise_exception(bus, Excode::DBE);
        }
        result
    }

    pub fn write_memory_half_word<B: Bus>(
        &mut self,
        bus: &mut B,
        address: u32,
        value: u16,
    ) -> bool {
        if !self.do_alignment_check(bus, address, 2, false) {
            return false;
        }

        let result = bus.write_half_word(address, value);
        if !result {
            self.raise_exception(bus, Excode::DBE);
        }
        result
    }

    pub fn write_memory_word<B: Bus>(&mut self, bus: &mut B, address: u32, value: u32) -> bool {
        if !self.do_alignment_check(bus, address, 4, false) {
            return false;
        }

        let result = bus.write_word(address, value);
        if !result {
            self.raise_exception(bus, Excode::DBE);
        }
        result
    }

    /// Reads without raising exceptions; debugger-style access.
    pub fn safe_read_memory_byte<B: Bus>(&self, bus: &mut B, address: u32) -> Option<u8> {
        bus.read_byte(address)
    }

    pub fn safe_read_memory_half_word<B: Bus>(&self, bus: &mut B, address: u32) -> Option<u16> {
        bus.read_half_word(address)
    }

    pub fn safe_read_memory_word<B: Bus>(&self, bus: &mut B, address: u32) -> Option<u32> {
        bus.read_word(address)
    }

    pub fn safe_write_memory_byte<B: Bus>(&self, bus: &mut B, address: u32, value: u8) -> bool {
        bus.write_byte(address, value)
    }

    pub fn safe_write_memory_half_word<B: Bus>(
        &self,
        bus: &mut B,
        address: u32,
        value: u16,
    ) -> bool {
        bus.write_half_word(address, value)
    }

    pub fn safe_write_memory_word<B: Bus>(&self, bus: &mut B, address: u32, value: u32) -> bool {
        bus.write_word(address, value)
    }

    pub fn write_cache_control(&mut self, value: u32) {
        tracing::warn!("Cache control <- 0x{value:08X}");
        self.cache_control = value;
    }

    fn in_user_mode(&self) -> bool {
        self.cop0.sr.user_mode()
    }

    #[allow(clippy::too_many_lines)]
    fn execute_instruction<B: Bus>(&mut self, bus: &mut B) {
        let inst = self.current_instruction;

        let Ok(op) = InstructionOp::try_from(inst.op_bits()) else {
            // everything else is reserved/invalid
            self.raise_exception(bus, Excode::RI);
            return;
        };

        match op {
            InstructionOp::Funct => self.execute_funct_instruction(bus),

            InstructionOp::Lui => {
                self.regs.set_register_at(inst.rt(), inst.imm_zext32() << 16);
            }

            InstructionOp::Andi => {
                let new_value = self.read_reg(inst.rs()) & inst.imm_zext32();
                self.regs.set_register_at(inst.rt(), new_value);
            }

            InstructionOp::Ori => {
                let new_value = self.read_reg(inst.rs()) | inst.imm_zext32();
                self.regs.set_register_at(inst.rt(), new_value);
            }

            InstructionOp::Xori => {
                let new_value = self.read_reg(inst.rs()) ^ inst.imm_zext32();
                self.regs.set_register_at(inst.rt(), new_value);
            }

            InstructionOp::Addi => {
                let old_value = self.read_reg(inst.rs());
                let add_value = inst.imm_sext32();
                let new_value = old_value.wrapping_add(add_value);
                if add_overflow(old_value, add_value, new_value) {
                    self.raise_exception(bus, Excode::Ov);
                    return;
                }

                self.regs.set_register_at(inst.rt(), new_value);
            }

            InstructionOp::Addiu => {
                let new_value = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                self.regs.set_register_at(inst.rt(), new_value);
            }

            InstructionOp::Slti => {
                let result = (self.read_reg(inst.rs()) as i32) < (inst.imm_sext32() as i32);
                self.regs.set_register_at(inst.rt(), u32::from(result));
            }

            InstructionOp::Sltiu => {
                let result = self.read_reg(inst.rs()) < inst.imm_sext32();
                self.regs.set_register_at(inst.rt(), u32::from(result));
            }

            InstructionOp::Lb => {
                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let Some(value) = self.read_memory_byte(bus, address) else {
                    return;
                };

                self.write_reg_delayed(inst.rt(), value as i8 as i32 as u32);
            }

            InstructionOp::Lh => {
                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let Some(value) = self.read_memory_half_word(bus, address) else {
                    return;
                };

                self.write_reg_delayed(inst.rt(), value as i16 as i32 as u32);
            }

            InstructionOp::Lw => {
                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let Some(value) = self.read_memory_word(bus, address) else {
                    return;
                };

                self.write_reg_delayed(inst.rt(), value);
            }

            InstructionOp::Lbu => {
                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let Some(value) = self.read_memory_byte(bus, address) else {
                    return;
                };

                self.write_reg_delayed(inst.rt(), u32::from(value));
            }

            InstructionOp::Lhu => {
                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let Some(value) = self.read_memory_half_word(bus, address) else {
                    return;
                };

                self.write_reg_delayed(inst.rt(), u32::from(value));
            }

            InstructionOp::Lwl | InstructionOp::Lwr => {
                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let aligned_address = address & !3;
                let Some(aligned_value) = self.read_memory_word(bus, aligned_address) else {
                    return;
                };

                // note: bypasses the load delay on the merge source
                let existing_value = self.regs.register_at(inst.rt());
                let shift = (address & 3) * 8;
                let new_value = if op == InstructionOp::Lwl {
                    (existing_value & (0x00FF_FFFF >> shift)) | (aligned_value << (24 - shift))
                } else {
                    (existing_value & (0xFFFF_FF00_u32 << (24 - shift))) | (aligned_value >> shift)
                };

                self.write_reg_delayed(inst.rt(), new_value);
            }

            InstructionOp::Sb => {
                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let value = self.read_reg(inst.rt()) as u8;
                self.write_memory_byte(bus, address, value);
            }

            InstructionOp::Sh => {
                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let value = self.read_reg(inst.rt()) as u16;
                self.write_memory_half_word(bus, address, value);
            }

            InstructionOp::Sw => {
                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let value = self.read_reg(inst.rt());
                self.write_memory_word(bus, address, value);
            }

            InstructionOp::Swl | InstructionOp::Swr => {
                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let aligned_address = address & !3;
                let reg_value = self.read_reg(inst.rt());
                let shift = (address & 3) * 8;
                let Some(mem_value) = self.read_memory_word(bus, aligned_address) else {
                    return;
                };

                let new_value = if op == InstructionOp::Swl {
                    (mem_value & (0xFFFF_FF00_u32 << shift)) | (reg_value >> (24 - shift))
                } else {
                    (mem_value & (0x00FF_FFFF >> (24 - shift))) | (reg_value << shift)
                };

                self.write_memory_word(bus, aligned_address, new_value);
            }

            InstructionOp::J => {
                self.branch((self.regs.pc & 0xF000_0000) | (inst.target() << 2));
            }

            InstructionOp::Jal => {
                self.regs.set_register_at(REG_RA, self.regs.npc);
                self.branch((self.regs.pc & 0xF000_0000) | (inst.target() << 2));
            }

            InstructionOp::Beq => {
                // Still flagged as a branch delay slot even when not taken.
                let taken = self.read_reg(inst.rs()) == self.read_reg(inst.rt());
                self.branch_if(taken, self.regs.pc.wrapping_add(inst.imm_sext32() << 2));
            }

            InstructionOp::Bne => {
                let taken = self.read_reg(inst.rs()) != self.read_reg(inst.rt());
                self.branch_if(taken, self.regs.pc.wrapping_add(inst.imm_sext32() << 2));
            }

            InstructionOp::Bgtz => {
                let taken = (self.read_reg(inst.rs()) as i32) > 0;
                self.branch_if(taken, self.regs.pc.wrapping_add(inst.imm_sext32() << 2));
            }

            InstructionOp::Blez => {
                let taken = (self.read_reg(inst.rs()) as i32) <= 0;
                self.branch_if(taken, self.regs.pc.wrapping_add(inst.imm_sext32() << 2));
            }

            InstructionOp::B => {
                let rt = inst.rt();

                // bgez is the inverse of bltz, so test ltz and xor the result
                let bgez = rt & 1 != 0;
                let taken = ((self.read_reg(inst.rs()) as i32) < 0) ^ bgez;

                // the register is linked even when the branch isn't taken
                let link = (rt & 0x1E) == 0x10;
                if link {
                    self.regs.set_register_at(REG_RA, self.regs.npc);
                }

                self.branch_if(taken, self.regs.pc.wrapping_add(inst.imm_sext32() << 2));
            }

            InstructionOp::Cop0 => {
                if self.in_user_mode() && !self.cop0.sr.cop0_enabled() {
                    tracing::warn!("Coprocessor 0 not present in user mode");
                    self.raise_exception(bus, Excode::CpU);
                    return;
                }

                self.execute_cop0_instruction(bus);
            }

            InstructionOp::Cop2 => {
                if self.in_user_mode() && !self.cop0.sr.cop2_enabled() {
                    tracing::warn!("Coprocessor 2 not present in user mode");
                    self.raise_exception(bus, Excode::CpU);
                    return;
                }

                self.execute_cop2_instruction(bus);
            }

            InstructionOp::Lwc2 => {
                if self.in_user_mode() && !self.cop0.sr.cop2_enabled() {
                    tracing::warn!("Coprocessor 2 not present in user mode");
                    self.raise_exception(bus, Excode::CpU);
                    return;
                }

                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let Some(value) = self.read_memory_word(bus, address) else {
                    return;
                };

                self.cop2.write_data_register(u32::from(inst.rt()), value);
            }

            InstructionOp::Swc2 => {
                if self.in_user_mode() && !self.cop0.sr.cop2_enabled() {
                    tracing::warn!("Coprocessor 2 not present in user mode");
                    self.raise_exception(bus, Excode::CpU);
                    return;
                }

                let address = self.read_reg(inst.rs()).wrapping_add(inst.imm_sext32());
                let value = self.cop2.read_data_register(u32::from(inst.rt()));
                self.write_memory_word(bus, address, value);
            }

            // swc0/lwc0/cop1/cop3 are essentially no-ops
            InstructionOp::Cop1
            | InstructionOp::Cop3
            | InstructionOp::Lwc0
            | InstructionOp::Lwc1
            | InstructionOp::Lwc3
            | InstructionOp::Swc0
            | InstructionOp::Swc1
            | InstructionOp::Swc3 => {}
        }
    }

    fn execute_funct_instruction<B: Bus>(&mut self, bus: &mut B) {
        let inst = self.current_instruction;

        let Ok(funct) = InstructionFunct::try_from(inst.funct_bits()) else {
            self.raise_exception(bus, Excode::RI);
            return;
        };

        match funct {
            InstructionFunct::Sll => {
                let new_value = self.read_reg(inst.rt()) << inst.shamt();
                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Srl => {
                let new_value = self.read_reg(inst.rt()) >> inst.shamt();
                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Sra => {
                let new_value = (self.read_reg(inst.rt()) as i32) >> inst.shamt();
                self.regs.set_register_at(inst.rd(), new_value as u32);
            }

            InstructionFunct::Sllv => {
                let shift_amount = self.read_reg(inst.rs()) & 0x1F;
                let new_value = self.read_reg(inst.rt()) << shift_amount;
                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Srlv => {
                let shift_amount = self.read_reg(inst.rs()) & 0x1F;
                let new_value = self.read_reg(inst.rt()) >> shift_amount;
                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Srav => {
                let shift_amount = self.read_reg(inst.rs()) & 0x1F;
                let new_value = (self.read_reg(inst.rt()) as i32) >> shift_amount;
                self.regs.set_register_at(inst.rd(), new_value as u32);
            }

            InstructionFunct::And => {
                let new_value = self.read_reg(inst.rs()) & self.read_reg(inst.rt());
                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Or => {
                let new_value = self.read_reg(inst.rs()) | self.read_reg(inst.rt());
                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Xor => {
                let new_value = self.read_reg(inst.rs()) ^ self.read_reg(inst.rt());
                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Nor => {
                let new_value = !(self.read_reg(inst.rs()) | self.read_reg(inst.rt()));
                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Add => {
                let old_value = self.read_reg(inst.rs());
                let add_value = self.read_reg(inst.rt());
                let new_value = old_value.wrapping_add(add_value);
                if add_overflow(old_value, add_value, new_value) {
                    self.raise_exception(bus, Excode::Ov);
                    return;
                }

                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Addu => {
                let new_value = self.read_reg(inst.rs()).wrapping_add(self.read_reg(inst.rt()));
                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Sub => {
                let old_value = self.read_reg(inst.rs());
                let sub_value = self.read_reg(inst.rt());
                let new_value = old_value.wrapping_sub(sub_value);
                if sub_overflow(old_value, sub_value, new_value) {
                    self.raise_exception(bus, Excode::Ov);
                    return;
                }

                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Subu => {
                let new_value = self.read_reg(inst.rs()).wrapping_sub(self.read_reg(inst.rt()));
                self.regs.set_register_at(inst.rd(), new_value);
            }

            InstructionFunct::Slt => {
                let result = (self.read_reg(inst.rs()) as i32) < (self.read_reg(inst.rt()) as i32);
                self.regs.set_register_at(inst.rd(), u32::from(result));
            }

            InstructionFunct::Sltu => {
                let result = self.read_reg(inst.rs()) < self.read_reg(inst.rt());
                self.regs.set_register_at(inst.rd(), u32::from(result));
            }

            InstructionFunct::Mfhi => {
                self.regs.set_register_at(inst.rd(), self.regs.hi);
            }

            InstructionFunct::Mthi => {
                self.regs.hi = self.read_reg(inst.rs());
            }

            InstructionFunct::Mflo => {
                self.regs.set_register_at(inst.rd(), self.regs.lo);
            }

            InstructionFunct::Mtlo => {
                self.regs.lo = self.read_reg(inst.rs());
            }

            InstructionFunct::Mult => {
                let lhs = self.read_reg(inst.rs()) as i32;
                let rhs = self.read_reg(inst.rt()) as i32;
                let result = (i64::from(lhs) * i64::from(rhs)) as u64;
                self.regs.hi = (result >> 32) as u32;
                self.regs.lo = result as u32;
            }

            InstructionFunct::Multu => {
                let lhs = self.read_reg(inst.rs());
                let rhs = self.read_reg(inst.rt());
                let result = u64::from(lhs) * u64::from(rhs);
                self.regs.hi = (result >> 32) as u32;
                self.regs.lo = result as u32;
            }

            InstructionFunct::Div => {
                let num = self.read_reg(inst.rs()) as i32;
                let denom = self.read_reg(inst.rt()) as i32;

                if denom == 0 {
                    // divide by zero
                    self.regs.lo = if num >= 0 { 0xFFFF_FFFF } else { 1 };
                    self.regs.hi = num as u32;
                } else if num as u32 == 0x8000_0000 && denom == -1 {
                    // unrepresentable
                    self.regs.lo = 0x8000_0000;
                    self.regs.hi = 0;
                } else {
                    self.regs.lo = (num / denom) as u32;
                    self.regs.hi = (num % denom) as u32;
                }
            }

            InstructionFunct::Divu => {
                let num = self.read_reg(inst.rs());
                let denom = self.read_reg(inst.rt());

                if denom == 0 {
                    // divide by zero
                    self.regs.lo = 0xFFFF_FFFF;
                    self.regs.hi = num;
                } else {
                    self.regs.lo = num / denom;
                    self.regs.hi = num % denom;
                }
            }

            InstructionFunct::Jr => {
                let target = self.read_reg(inst.rs());
                self.branch(target);
            }

            InstructionFunct::Jalr => {
                let target = self.read_reg(inst.rs());
                self.regs.set_register_at(inst.rd(), self.regs.npc);
                self.branch(target);
            }

            InstructionFunct::Syscall => {
                tracing::debug!(
                    "Syscall 0x{:X}(0x{:X})",
                    self.regs.register_at(REG_S0),
                    self.regs.register_at(REG_A0)
                );
                self.raise_exception(bus, Excode::Syscall);
            }

            InstructionFunct::Break => {
                self.raise_exception(bus, Excode::BP);
            }
        }
    }

    fn read_cop0_reg(&self, reg: Cop0Reg) -> u32 {
        match reg {
            Cop0Reg::Bpc => self.cop0.bpc,
            Cop0Reg::Bda => self.cop0.bda,
            Cop0Reg::JumpDest => self.cop0.tar,
            Cop0Reg::Dcic => self.cop0.dcic.bits(),
            Cop0Reg::BadVaddr => self.cop0.bad_vaddr,
            Cop0Reg::Bdam => self.cop0.bdam,
            Cop0Reg::Bpcm => self.cop0.bpcm,
            Cop0Reg::Sr => self.cop0.sr.bits(),
            Cop0Reg::Cause => self.cop0.cause.bits(),
            Cop0Reg::Epc => self.cop0.epc,
            Cop0Reg::Prid => self.cop0.prid,
        }
    }

    fn write_cop0_reg(&mut self, reg: Cop0Reg, value: u32) {
        match reg {
            Cop0Reg::Bpc => {
                self.cop0.bpc = value;
                tracing::warn!("COP0 BPC <- {value:08X}");
            }

            Cop0Reg::Bda => {
                self.cop0.bda = value;
                tracing::warn!("COP0 BDA <- {value:08X}");
            }

            Cop0Reg::Bdam => {
                self.cop0.bdam = value;
                tracing::warn!("COP0 BDAM <- {value:08X}");
            }

            Cop0Reg::Bpcm => {
                self.cop0.bpcm = value;
                tracing::warn!("COP0 BPCM <- {value:08X}");
            }

            Cop0Reg::JumpDest => {
                tracing::warn!("Ignoring write to COP0 JUMPDEST");
            }

            Cop0Reg::Dcic => {
                self.cop0.dcic.write_masked(value);
                tracing::warn!("COP0 DCIC <- {value:08X} (now {:08X})", self.cop0.dcic.bits());
            }

            Cop0Reg::Sr => {
                self.cop0.sr.write_masked(value);
                tracing::debug!("COP0 SR <- {value:08X} (now {:08X})", self.cop0.sr.bits());
            }

            Cop0Reg::Cause => {
                self.cop0.cause.write_masked(value);
                tracing::debug!("COP0 CAUSE <- {value:08X} (now {:08X})", self.cop0.cause.bits());
            }

            Cop0Reg::BadVaddr | Cop0Reg::Epc | Cop0Reg::Prid => {
                tracing::debug!("Ignoring write to read-only COP0 reg {reg:?}");
            }
        }
    }

    fn execute_cop0_instruction<B: Bus>(&mut self, bus: &mut B) {
        let inst = self.current_instruction;

        if inst.is_cop_common_instruction() {
            match CopCommonOp::try_from(inst.cop_common_op_bits()) {
                Ok(CopCommonOp::Mfc) => match Cop0Reg::try_from(u32::from(inst.rd())) {
                    Ok(reg) => {
                        let value = self.read_cop0_reg(reg);
                        self.write_reg_delayed(inst.rt(), value);
                    }
                    Err(_) => {
                        tracing::debug!("mfc0 of unknown COP0 reg {}", inst.rd());
                        self.raise_exception(bus, Excode::RI);
                    }
                },

                Ok(CopCommonOp::Mtc) => match Cop0Reg::try_from(u32::from(inst.rd())) {
                    Ok(reg) => {
                        let value = self.read_reg(inst.rt());
                        self.write_cop0_reg(reg, value);
                    }
                    Err(_) => tracing::debug!("mtc0 of unknown COP0 reg {}", inst.rd()),
                },

                Ok(_) | Err(_) => self.raise_exception(bus, Excode::RI),
            }
        } else {
            match Cop0Op::try_from(inst.funct_bits()) {
                // restore the mode stack
                Ok(Cop0Op::Rfe) => self.cop0.sr.pop_mode(),
                Err(_) => self.raise_exception(bus, Excode::RI),
            }
        }
    }

    fn execute_cop2_instruction<B: Bus>(&mut self, bus: &mut B) {
        let inst = self.current_instruction;

        if inst.is_cop_common_instruction() {
            match CopCommonOp::try_from(inst.cop_common_op_bits()) {
                Ok(CopCommonOp::Cfc) => {
                    let value = self.cop2.read_control_register(u32::from(inst.rd()));
                    self.write_reg_delayed(inst.rt(), value);
                }

                Ok(CopCommonOp::Ctc) => {
                    let value = self.read_reg(inst.rt());
                    self.cop2.write_control_register(u32::from(inst.rd()), value);
                }

                Ok(CopCommonOp::Mfc) => {
                    let value = self.cop2.read_data_register(u32::from(inst.rd()));
                    self.write_reg_delayed(inst.rt(), value);
                }

                Ok(CopCommonOp::Mtc) => {
                    let value = self.read_reg(inst.rt());
                    self.cop2.write_data_register(u32::from(inst.rd()), value);
                }

                Ok(CopCommonOp::Bc) | Err(_) => self.raise_exception(bus, Excode::RI),
            }
        } else {
            self.cop2.execute_instruction(inst.bits());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::savestate::{StateWrapper, SAVE_STATE_VERSION};

    /// 64 KiB of RAM mirrored through KUSEG/KSEG0/KSEG1 and 64 KiB of BIOS
    /// at the usual ROM window. Everything else is a bus error.
    struct TestBus {
        ram: Vec<u8>,
        bios: Vec<u8>,
    }

    const BIOS_BASE: u32 = RESET_VECTOR & 0x1FFF_FFFF;

    impl TestBus {
        fn new() -> Self {
            Self {
                ram: vec![0; 0x1_0000],
                bios: vec![0; 0x1_0000],
            }
        }

        fn with_program(words: &[u32]) -> Self {
            let mut bus = Self::new();
            for (i, word) in words.iter().enumerate() {
                let offset = i * 4;
                bus.bios[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
            }
            bus
        }

        fn backing(&mut self, address: u32, len: usize) -> Option<&mut [u8]> {
            let physical = address & 0x1FFF_FFFF;
            if physical >= BIOS_BASE {
                let offset = (physical - BIOS_BASE) as usize;
                self.bios.get_mut(offset..offset + len)
            } else {
                self.ram.get_mut(physical as usize..physical as usize + len)
            }
        }

        fn set_ram_word(&mut self, address: u32, value: u32) {
            self.ram[address as usize..address as usize + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn ram_word(&self, address: u32) -> u32 {
            let mut bytes = [0; 4];
            bytes.copy_from_slice(&self.ram[address as usize..address as usize + 4]);
            u32::from_le_bytes(bytes)
        }
    }

    impl Bus for TestBus {
        fn read_byte(&mut self, address: u32) -> Option<u8> {
            self.backing(address, 1).map(|b| b[0])
        }

        fn read_half_word(&mut self, address: u32) -> Option<u16> {
            self.backing(address, 2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
        }

        fn read_word(&mut self, address: u32) -> Option<u32> {
            self.backing(address, 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        fn write_byte(&mut self, address: u32, value: u8) -> bool {
            self.backing(address, 1)
                .map(|b| b[0] = value)
                .is_some()
        }

        fn write_half_word(&mut self, address: u32, value: u16) -> bool {
            self.backing(address, 2)
                .map(|b| b.copy_from_slice(&value.to_le_bytes()))
                .is_some()
        }

        fn write_word(&mut self, address: u32, value: u32) -> bool {
            self.backing(address, 4)
                .map(|b| b.copy_from_slice(&value.to_le_bytes()))
                .is_some()
        }
    }

    // hand assembler, enough for the programs below
    fn i_type(op: u32, rs: u8, rt: u8, imm: u16) -> u32 {
        (op << 26) | (u32::from(rs) << 21) | (u32::from(rt) << 16) | u32::from(imm)
    }

    fn r_type(rs: u8, rt: u8, rd: u8, funct: u32) -> u32 {
        (u32::from(rs) << 21) | (u32::from(rt) << 16) | (u32::from(rd) << 11) | funct
    }

    fn ori(rt: u8, rs: u8, imm: u16) -> u32 {
        i_type(0x0D, rs, rt, imm)
    }

    fn lui(rt: u8, imm: u16) -> u32 {
        i_type(0x0F, 0, rt, imm)
    }

    fn addi(rt: u8, rs: u8, imm: u16) -> u32 {
        i_type(0x08, rs, rt, imm)
    }

    fn addiu(rt: u8, rs: u8, imm: u16) -> u32 {
        i_type(0x09, rs, rt, imm)
    }

    fn lw(rt: u8, rs: u8, imm: u16) -> u32 {
        i_type(0x23, rs, rt, imm)
    }

    fn sw(rt: u8, rs: u8, imm: u16) -> u32 {
        i_type(0x2B, rs, rt, imm)
    }

    fn lwl(rt: u8, rs: u8, imm: u16) -> u32 {
        i_type(0x22, rs, rt, imm)
    }

    fn lwr(rt: u8, rs: u8, imm: u16) -> u32 {
        i_type(0x26, rs, rt, imm)
    }

    fn swl(rt: u8, rs: u8, imm: u16) -> u32 {
        i_type(0x2A, rs, rt, imm)
    }

    fn swr(rt: u8, rs: u8, imm: u16) -> u32 {
        i_type(0x2E, rs, rt, imm)
    }

    fn beq(rs: u8, rt: u8, offset: u16) -> u32 {
        i_type(0x04, rs, rt, offset)
    }

    fn bltzal(rs: u8, offset: u16) -> u32 {
        i_type(0x01, rs, 0x10, offset)
    }

    fn addu(rd: u8, rs: u8, rt: u8) -> u32 {
        r_type(rs, rt, rd, 0x21)
    }

    fn add(rd: u8, rs: u8, rt: u8) -> u32 {
        r_type(rs, rt, rd, 0x20)
    }

    fn sub(rd: u8, rs: u8, rt: u8) -> u32 {
        r_type(rs, rt, rd, 0x22)
    }

    fn jr(rs: u8) -> u32 {
        r_type(rs, 0, 0, 0x08)
    }

    fn div(rs: u8, rt: u8) -> u32 {
        r_type(rs, rt, 0, 0x1A)
    }

    fn mflo(rd: u8) -> u32 {
        r_type(0, 0, rd, 0x12)
    }

    fn mfhi(rd: u8) -> u32 {
        r_type(0, 0, rd, 0x10)
    }

    fn break_() -> u32 {
        0x0D
    }

    fn syscall() -> u32 {
        0x0C
    }

    fn mtc0(rt: u8, rd: u8) -> u32 {
        (0x10 << 26) | (0b00100 << 21) | (u32::from(rt) << 16) | (u32::from(rd) << 11)
    }

    fn mfc0(rt: u8, rd: u8) -> u32 {
        (0x10 << 26) | (u32::from(rt) << 16) | (u32::from(rd) << 11)
    }

    fn rfe() -> u32 {
        (0x10 << 26) | (1 << 25) | 0x10
    }

    fn nop() -> u32 {
        0
    }

    fn cpu_with_program(words: &[u32]) -> (Cpu, TestBus) {
        let mut bus = TestBus::with_program(words);
        let mut cpu = Cpu::default();
        cpu.reset(&mut bus);
        (cpu, bus)
    }

    /// Executes exactly one instruction.
    fn step(cpu: &mut Cpu, bus: &mut TestBus) {
        cpu.set_downcount(0);
        cpu.execute(bus);
    }

    fn step_n(cpu: &mut Cpu, bus: &mut TestBus, n: usize) {
        for _ in 0..n {
            step(cpu, bus);
        }
    }

    #[test]
    fn reset_prefetches_from_the_reset_vector() {
        let (cpu, _bus) = cpu_with_program(&[ori(1, 0, 1)]);
        assert_eq!(cpu.regs.pc, RESET_VECTOR);
        assert_eq!(cpu.regs.npc, RESET_VECTOR + 4);
        assert_eq!(cpu.cop0.prid, PRID_VALUE);
        assert_eq!(cpu.downcount(), MAX_SLICE_SIZE);
    }

    #[test]
    fn zero_register_stays_zero() {
        let mut program = vec![ori(0, 0, 0xFFFF), addiu(0, 0, 0x1234)];
        // also through the delayed path
        program.push(lw(0, 0, 0x100));
        let (mut cpu, mut bus) = cpu_with_program(&program);
        bus.set_ram_word(0x100, 0x5555_5555);

        step_n(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.regs.register_at(0), 0);
    }

    #[test]
    fn branch_delay_slot_executes_before_the_target() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            beq(1, 0, 2),  // r1 == 0 -> taken, target = +8 from the slot
            ori(2, 0, 1),  // delay slot
            ori(3, 0, 2),  // skipped
            ori(4, 0, 4),  // branch target
        ]);

        step_n(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.regs.register_at(2), 1);
        assert_eq!(cpu.regs.pc, RESET_VECTOR + 0xC);

        step(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.register_at(4), 4);
        assert_eq!(cpu.regs.register_at(3), 0);
    }

    #[test]
    fn untaken_branch_still_runs_the_slot_normally() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            ori(1, 0, 1),
            beq(1, 0, 2), // not taken
            ori(2, 0, 1), // delay slot
            ori(3, 0, 2), // falls through here
        ]);

        step_n(&mut cpu, &mut bus, 4);
        assert_eq!(cpu.regs.register_at(2), 1);
        assert_eq!(cpu.regs.register_at(3), 2);
    }

    #[test]
    fn load_delay_slot_sees_the_old_value() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            ori(4, 0, 0xAA),
            lw(4, 0, 0x100),
            addu(5, 4, 0), // load delay: still the old r4
            addu(6, 4, 0), // one later: the loaded value
        ]);
        bus.set_ram_word(0x100, 0x55);

        step_n(&mut cpu, &mut bus, 4);
        assert_eq!(cpu.regs.register_at(4), 0x55);
        assert_eq!(cpu.regs.register_at(5), 0xAA);
        assert_eq!(cpu.regs.register_at(6), 0x55);
    }

    #[test]
    fn add_overflow_traps_and_preserves_the_destination() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            lui(1, 0x7FFF),
            ori(1, 1, 0xFFFF), // r1 = 0x7FFF_FFFF
            addi(1, 1, 1),     // overflows
        ]);

        step_n(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.cop0.cause.excode_bits(), Excode::Ov as u32);
        assert_eq!(cpu.regs.register_at(1), 0x7FFF_FFFF);
        assert_eq!(cpu.cop0.epc, RESET_VECTOR + 8);
        assert_eq!(cpu.regs.pc, 0x8000_0080);
    }

    #[test]
    fn add_and_sub_register_forms_trap_on_overflow() {
        struct Test {
            program: Vec<u32>,
            expected_r3: u32,
        }

        let cases = vec![
            Test {
                // 0x7FFFFFFF + 1
                program: vec![
                    lui(1, 0x7FFF),
                    ori(1, 1, 0xFFFF),
                    ori(2, 0, 1),
                    add(3, 1, 2),
                ],
                expected_r3: 0,
            },
            Test {
                // 0x80000000 - 1
                program: vec![lui(1, 0x8000), ori(2, 0, 1), nop(), sub(3, 1, 2)],
                expected_r3: 0,
            },
        ];

        for case in cases {
            let (mut cpu, mut bus) = cpu_with_program(&case.program);
            step_n(&mut cpu, &mut bus, case.program.len());
            assert_eq!(cpu.cop0.cause.excode_bits(), Excode::Ov as u32);
            assert_eq!(cpu.regs.register_at(3), case.expected_r3);
        }
    }

    #[test]
    fn divide_by_zero_semantics() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            ori(1, 0, 10),
            div(1, 0), // 10 / 0
            mflo(2),
            mfhi(3),
        ]);

        step_n(&mut cpu, &mut bus, 4);
        assert_eq!(cpu.regs.register_at(2), 0xFFFF_FFFF);
        assert_eq!(cpu.regs.register_at(3), 10);
    }

    #[test]
    fn divide_by_zero_negative_numerator() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            addiu(1, 0, 0xFFFF), // r1 = -1
            div(1, 0),
            mflo(2),
            mfhi(3),
        ]);

        step_n(&mut cpu, &mut bus, 4);
        assert_eq!(cpu.regs.register_at(2), 1);
        assert_eq!(cpu.regs.register_at(3), 0xFFFF_FFFF);
    }

    #[test]
    fn divide_unrepresentable() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            lui(1, 0x8000),      // r1 = i32::MIN
            addiu(2, 0, 0xFFFF), // r2 = -1
            div(1, 2),
            mflo(3),
            mfhi(4),
        ]);

        step_n(&mut cpu, &mut bus, 5);
        assert_eq!(cpu.regs.register_at(3), 0x8000_0000);
        assert_eq!(cpu.regs.register_at(4), 0);
    }

    #[test]
    fn lwl_lwr_reconstruct_an_unaligned_word() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            lwr(1, 0, 0x101),
            lwl(1, 0, 0x104), // 0x101 | 3
            addu(2, 1, 0),
        ]);
        bus.set_ram_word(0x100, 0x3322_1100);
        bus.set_ram_word(0x104, 0x7766_5544);

        // the unaligned word at 0x101 is 0x44332211
        step_n(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.regs.register_at(1), 0x4433_2211);
        // the lwl consumed the lwr result directly, bypassing the load delay
        assert_eq!(cpu.regs.register_at(2), 0x4433_2211);
    }

    #[test]
    fn swl_swr_store_an_unaligned_word() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            lui(1, 0x4433),
            ori(1, 1, 0x2211),
            swr(1, 0, 0x101),
            swl(1, 0, 0x104),
        ]);

        step_n(&mut cpu, &mut bus, 4);
        assert_eq!(bus.ram[0x100], 0x00);
        assert_eq!(bus.ram[0x101], 0x11);
        assert_eq!(bus.ram[0x102], 0x22);
        assert_eq!(bus.ram[0x103], 0x33);
        assert_eq!(bus.ram[0x104], 0x44);
    }

    #[test]
    fn linking_branch_writes_ra_even_when_untaken() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            ori(1, 0, 5),
            bltzal(1, 4), // r1 >= 0: not taken, but still links
            nop(),
        ]);

        step_n(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.regs.register_at(REG_RA), RESET_VECTOR + 0xC);
        // untaken: fall through
        assert_eq!(cpu.regs.npc, RESET_VECTOR + 0xC);
    }

    #[test]
    fn exception_in_delay_slot_reports_the_branch() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            beq(0, 0, 4),
            break_(), // fault in the delay slot
        ]);

        step_n(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.cop0.cause.excode_bits(), Excode::BP as u32);
        assert!(cpu.cop0.cause.branch_delay());
        // EPC backs up to the branch; TAR holds the target that was pending
        assert_eq!(cpu.cop0.epc, RESET_VECTOR);
        assert_eq!(cpu.cop0.tar, RESET_VECTOR + 4 + (4 << 2));
    }

    #[test]
    fn exception_outside_delay_slot_reports_the_instruction() {
        let (mut cpu, mut bus) = cpu_with_program(&[nop(), syscall()]);

        step_n(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.cop0.cause.excode_bits(), Excode::Syscall as u32);
        assert!(!cpu.cop0.cause.branch_delay());
        assert_eq!(cpu.cop0.epc, RESET_VECTOR + 4);
        // the load-delay shadow is empty after the pipeline flush
        assert_eq!(cpu.load_delay_reg, REG_NONE);
        assert_eq!(cpu.next_load_delay_reg, REG_NONE);
    }

    #[test]
    fn exception_pushes_the_mode_stack() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            ori(1, 0, 0b0001), // IEc
            mtc0(1, 12),
            break_(),
        ]);

        step_n(&mut cpu, &mut bus, 3);
        // pushed: IEc moved to IEp, interrupts now off, kernel mode
        assert_eq!(cpu.cop0.sr.mode_bits(), 0b0100);
        assert!(!cpu.cop0.sr.interrupts_enabled());
    }

    #[test]
    fn rfe_restores_the_previous_mode_pair() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            ori(1, 0, 0b1100), // IEp | KUp
            mtc0(1, 12),
            rfe(),
        ]);

        step_n(&mut cpu, &mut bus, 3);
        assert!(cpu.cop0.sr.interrupts_enabled());
        assert!(cpu.cop0.sr.user_mode());
    }

    #[test]
    fn bp_uses_the_common_vector_not_0x40() {
        let (mut cpu, mut bus) = cpu_with_program(&[break_()]);
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.pc, 0x8000_0080);
    }

    #[test]
    fn bev_selects_the_rom_vector() {
        let (mut cpu, mut bus) = cpu_with_program(&[break_()]);
        let bits = cpu.cop0.sr.bits() | (1 << 22);
        cpu.cop0.sr.set_bits(bits);

        step(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.pc, 0xBFC0_0180);
    }

    #[test]
    fn misaligned_fetch_raises_adel_with_bad_vaddr() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            ori(1, 0, 0x0103),
            jr(1),
            nop(), // delay slot
        ]);

        step_n(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.cop0.cause.excode_bits(), Excode::AdEL as u32);
        assert_eq!(cpu.cop0.bad_vaddr, 0x103);
        assert_eq!(cpu.cop0.epc, 0x103);
    }

    #[test]
    fn data_bus_error_raises_dbe_and_skips_the_write_back() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            ori(2, 0, 0xAA),
            lui(1, 0x1F00), // 0x1F000000: unmapped
            lw(2, 1, 0),
        ]);

        step_n(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.cop0.cause.excode_bits(), Excode::DBE as u32);
        // BadVaddr untouched by bus errors
        assert_eq!(cpu.cop0.bad_vaddr, 0);
        assert_eq!(cpu.regs.register_at(2), 0xAA);
    }

    #[test]
    fn misaligned_load_raises_adel() {
        let (mut cpu, mut bus) = cpu_with_program(&[ori(1, 0, 0x102), lw(2, 1, 1)]);

        step_n(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.cop0.cause.excode_bits(), Excode::AdEL as u32);
        assert_eq!(cpu.cop0.bad_vaddr, 0x103);
    }

    #[test]
    fn misaligned_store_raises_ades() {
        let (mut cpu, mut bus) = cpu_with_program(&[ori(1, 0, 0x102), sw(2, 1, 1)]);

        step_n(&mut cpu, &mut bus, 2);
        assert_eq!(cpu.cop0.cause.excode_bits(), Excode::AdES as u32);
    }

    #[test]
    fn interrupt_dispatches_before_the_next_instruction() {
        let (mut cpu, mut bus) = cpu_with_program(&[nop(), ori(5, 0, 1)]);
        // IEc plus mask for line 2
        cpu.cop0.sr.set_bits(1 | (1 << 10));

        step(&mut cpu, &mut bus);
        cpu.set_external_interrupt(2);
        step(&mut cpu, &mut bus);

        assert_eq!(cpu.cop0.cause.excode_bits(), Excode::Int as u32);
        // the pending instruction never ran
        assert_eq!(cpu.regs.register_at(5), 0);
        assert_eq!(cpu.cop0.epc, RESET_VECTOR + 4);
        assert_eq!(cpu.regs.pc, 0x8000_0080);
    }

    #[test]
    fn masked_interrupt_stays_pending() {
        let (mut cpu, mut bus) = cpu_with_program(&[nop(), ori(5, 0, 1)]);
        cpu.cop0.sr.set_bits(1); // IEc but no mask bits

        cpu.set_external_interrupt(2);
        step_n(&mut cpu, &mut bus, 2);

        assert_eq!(cpu.regs.register_at(5), 1);
        assert_eq!(cpu.cop0.cause.interrupt_pending(), 1 << 2);
    }

    #[test]
    fn interrupt_deferred_across_gte_instruction() {
        let gte_command = (0x12 << 26) | (1 << 25) | 0x06;
        let (mut cpu, mut bus) = cpu_with_program(&[nop(), gte_command, ori(5, 0, 1)]);
        // kernel mode, CU2 on, IEc, line 2 unmasked
        cpu.cop0.sr.set_bits(1 | (1 << 10) | (1 << 30));

        step(&mut cpu, &mut bus);
        cpu.set_external_interrupt(2);

        // the GTE op runs with the interrupt held off
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.cop0.cause.excode_bits(), 0);
        assert_eq!(cpu.cop0.epc, 0);

        // dispatched on the following instruction instead
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.cop0.cause.excode_bits(), Excode::Int as u32);
        assert_eq!(cpu.regs.register_at(5), 0);
    }

    #[test]
    fn clear_external_interrupt_deasserts_the_line() {
        let (mut cpu, _bus) = cpu_with_program(&[nop()]);
        cpu.set_external_interrupt(3);
        cpu.set_external_interrupt(5);
        cpu.clear_external_interrupt(3);
        assert_eq!(cpu.cop0.cause.interrupt_pending(), 1 << 5);
    }

    #[test]
    fn cop0_unusable_from_user_mode() {
        let (mut cpu, mut bus) = cpu_with_program(&[mfc0(1, 12)]);
        cpu.cop0.sr.set_bits(0b10); // KUc: user mode, CU0 clear

        step(&mut cpu, &mut bus);
        assert_eq!(cpu.cop0.cause.excode_bits(), Excode::CpU as u32);
        assert_eq!(cpu.cop0.cause.bits() >> 28 & 0b11, 0);
    }

    #[test]
    fn cop2_unusable_from_user_mode_reports_ce() {
        let gte_command = (0x12 << 26) | (1 << 25) | 0x06;
        let (mut cpu, mut bus) = cpu_with_program(&[gte_command]);
        cpu.cop0.sr.set_bits(0b10);

        step(&mut cpu, &mut bus);
        assert_eq!(cpu.cop0.cause.excode_bits(), Excode::CpU as u32);
        assert_eq!(cpu.cop0.cause.bits() >> 28 & 0b11, 2);
    }

    #[test]
    fn mfc0_honors_the_load_delay() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            ori(1, 0, 0x77),
            mfc0(1, 15), // PRID -> r1, delayed
            addu(2, 1, 0),
        ]);

        step_n(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.regs.register_at(1), PRID_VALUE);
        assert_eq!(cpu.regs.register_at(2), 0x77);
    }

    #[test]
    fn sr_write_is_masked() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            lui(1, 0xFFFF),
            ori(1, 1, 0xFFFF),
            mtc0(1, 12),
        ]);

        step_n(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.cop0.sr.bits(), 0xF04F_FF3F);
    }

    #[test]
    fn reserved_instructions_raise_ri() {
        for word in [0x14_u32 << 26, (0x3F << 26) | 0x1234, 0x01 | (1 << 6)] {
            let (mut cpu, mut bus) = cpu_with_program(&[word]);
            step(&mut cpu, &mut bus);
            assert_eq!(cpu.cop0.cause.excode_bits(), Excode::RI as u32);
        }
    }

    #[test]
    fn cop1_and_cop3_are_silent_no_ops() {
        for op in [0x11_u32, 0x13, 0x31, 0x33, 0x39, 0x3B] {
            let (mut cpu, mut bus) = cpu_with_program(&[op << 26, ori(1, 0, 7)]);
            step_n(&mut cpu, &mut bus, 2);
            assert_eq!(cpu.cop0.cause.excode_bits(), 0);
            assert_eq!(cpu.regs.register_at(1), 7);
        }
    }

    #[test]
    fn gte_register_transfer_through_the_cpu() {
        let mtc2 = (0x12 << 26) | (0b00100 << 21) | (1 << 16) | (9 << 11);
        let mfc2 = (0x12 << 26) | (2 << 16) | (9 << 11);
        let swc2 = i_type(0x3A, 0, 9, 0x200);
        let lwc2 = i_type(0x32, 0, 10, 0x200);

        let (mut cpu, mut bus) = cpu_with_program(&[
            ori(1, 0, 0x1234),
            mtc2,
            mfc2,
            swc2,
            lwc2,
        ]);

        step_n(&mut cpu, &mut bus, 5);
        assert_eq!(cpu.regs.register_at(2), 0x1234);
        assert_eq!(bus.ram_word(0x200), 0x1234);
        assert_eq!(cpu.cop2.read_data_register(10), 0x1234);
    }

    #[test]
    fn downcount_paces_the_slice() {
        let (mut cpu, mut bus) = cpu_with_program(&[nop(); 16]);
        cpu.reset_pending_ticks();
        cpu.set_downcount(10);
        cpu.execute(&mut bus);

        // two ticks per step: entered with 10, 8, 6, 4, 2, 0
        assert_eq!(cpu.pending_ticks(), 12);
        assert!(cpu.downcount() < 0);
    }

    #[test]
    fn save_state_round_trips_the_pipeline() {
        let (mut cpu, mut bus) = cpu_with_program(&[
            ori(1, 0, 0xAB),
            lw(2, 0, 0x100),
            addu(3, 2, 0),
            ori(4, 0, 0xCD),
        ]);
        bus.set_ram_word(0x100, 0x99);

        // stop mid load-delay so the shadow state is live
        step_n(&mut cpu, &mut bus, 2);

        let mut sw = StateWrapper::for_writing(SAVE_STATE_VERSION);
        assert!(cpu.do_state(&mut sw));

        let mut restored: Cpu = Cpu::default();
        let mut sw = StateWrapper::for_reading(sw.into_data());
        assert!(restored.do_state(&mut sw));

        // both continue identically
        step_n(&mut cpu, &mut bus, 2);
        step_n(&mut restored, &mut bus, 2);
        for reg in 0..32 {
            assert_eq!(cpu.regs.register_at(reg), restored.regs.register_at(reg));
        }
        assert_eq!(restored.regs.register_at(3), 0);
        assert_eq!(restored.regs.register_at(2), 0x99);
        assert_eq!(cpu.regs.pc, restored.regs.pc);
    }

    #[test]
    fn write_cache_control_is_storage_only() {
        let (mut cpu, _bus) = cpu_with_program(&[nop()]);
        cpu.write_cache_control(0x0001_E988);
        assert_eq!(cpu.cache_control, 0x0001_E988);
    }

    #[test]
    fn safe_accessors_do_not_raise() {
        let (mut cpu, mut bus) = cpu_with_program(&[nop()]);
        assert_eq!(cpu.safe_read_memory_word(&mut bus, 0x1F00_0000), None);
        assert!(!cpu.safe_write_memory_byte(&mut bus, 0x1F00_0000, 1));
        assert_eq!(cpu.cop0.cause.excode_bits(), 0);

        assert!(cpu.safe_write_memory_word(&mut bus, 0x180, 0xFEED_F00D));
        assert_eq!(cpu.safe_read_memory_word(&mut bus, 0x180), Some(0xFEED_F00D));
        assert_eq!(cpu.safe_read_memory_half_word(&mut bus, 0x182), Some(0xFEED));
        assert_eq!(cpu.safe_read_memory_byte(&mut bus, 0x183), Some(0xFE));
    }
}
