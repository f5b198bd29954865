//! Raw instruction words and the two-level opcode decode.
//!
//! MIPS-I packs everything into one 32-bit word: a 6-bit primary opcode, and
//! for the register-register class (primary opcode 0) a 6-bit `funct` field
//! selecting the actual operation. [`Instruction`] wraps the raw word with
//! field accessors; [`InstructionOp`] and [`InstructionFunct`] are the two
//! decode levels. Conversion failure means a reserved encoding, which the
//! core turns into an RI exception.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

/// One fetched instruction word. Default is `0`, which decodes as
/// `sll $0, $0, 0` - the canonical nop - so a freshly built pipeline is
/// harmless.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction(pub u32);

impl Instruction {
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Primary opcode, bits 26-31.
    #[must_use]
    pub fn op_bits(self) -> u32 {
        self.0.get_bits(26..=31)
    }

    /// Source register, bits 21-25.
    #[must_use]
    pub fn rs(self) -> u8 {
        self.0.get_bits(21..=25) as u8
    }

    /// Target register, bits 16-20.
    #[must_use]
    pub fn rt(self) -> u8 {
        self.0.get_bits(16..=20) as u8
    }

    /// Destination register, bits 11-15.
    #[must_use]
    pub fn rd(self) -> u8 {
        self.0.get_bits(11..=15) as u8
    }

    /// Shift amount, bits 6-10.
    #[must_use]
    pub fn shamt(self) -> u32 {
        self.0.get_bits(6..=10)
    }

    /// Function field, bits 0-5 (register-register class and COP sub-ops).
    #[must_use]
    pub fn funct_bits(self) -> u32 {
        self.0.get_bits(0..=5)
    }

    /// 16-bit immediate, zero-extended.
    #[must_use]
    pub const fn imm_zext32(self) -> u32 {
        self.0 & 0xFFFF
    }

    /// 16-bit immediate, sign-extended.
    #[must_use]
    pub const fn imm_sext32(self) -> u32 {
        self.0 as u16 as i16 as i32 as u32
    }

    /// 26-bit jump target, bits 0-25.
    #[must_use]
    pub const fn target(self) -> u32 {
        self.0 & 0x03FF_FFFF
    }

    /// Coprocessor number of a COP opcode, bits 26-27. Reported as `CE` when
    /// an exception interrupts a coprocessor instruction.
    #[must_use]
    pub fn cop_n(self) -> u8 {
        self.0.get_bits(26..=27) as u8
    }

    /// Register-transfer forms of COP opcodes have bit 25 clear; the
    /// coprocessor-function forms (e.g. `rfe`, GTE commands) have it set.
    #[must_use]
    pub fn is_cop_common_instruction(self) -> bool {
        !self.0.get_bit(25)
    }

    /// Common-op selector of a COP opcode, bits 21-25.
    #[must_use]
    pub fn cop_common_op_bits(self) -> u32 {
        self.0.get_bits(21..=25)
    }

    /// True for primary opcode 0x12 (COP2) only; `lwc2`/`swc2` do not count.
    /// Interrupt dispatch checks this to hold interrupts off GTE ops.
    #[must_use]
    pub fn is_cop2_instruction(self) -> bool {
        self.op_bits() == InstructionOp::Cop2 as u32
    }
}

/// Primary opcodes (bits 26-31). Encodings absent here are reserved and
/// raise RI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionOp {
    /// Register-register class; the operation is in the `funct` field.
    Funct = 0x00,
    /// The REGIMM branch group (`bltz`/`bgez`/`bltzal`/`bgezal`), told apart
    /// by bits of the `rt` field.
    B = 0x01,
    J = 0x02,
    Jal = 0x03,
    Beq = 0x04,
    Bne = 0x05,
    Blez = 0x06,
    Bgtz = 0x07,
    Addi = 0x08,
    Addiu = 0x09,
    Slti = 0x0A,
    Sltiu = 0x0B,
    Andi = 0x0C,
    Ori = 0x0D,
    Xori = 0x0E,
    Lui = 0x0F,
    Cop0 = 0x10,
    Cop1 = 0x11,
    Cop2 = 0x12,
    Cop3 = 0x13,
    Lb = 0x20,
    Lh = 0x21,
    Lwl = 0x22,
    Lw = 0x23,
    Lbu = 0x24,
    Lhu = 0x25,
    Lwr = 0x26,
    Sb = 0x28,
    Sh = 0x29,
    Swl = 0x2A,
    Sw = 0x2B,
    Swr = 0x2E,
    Lwc0 = 0x30,
    Lwc1 = 0x31,
    Lwc2 = 0x32,
    Lwc3 = 0x33,
    Swc0 = 0x38,
    Swc1 = 0x39,
    Swc2 = 0x3A,
    Swc3 = 0x3B,
}

impl TryFrom<u32> for InstructionOp {
    type Error = String;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            0x00 => Ok(Self::Funct),
            0x01 => Ok(Self::B),
            0x02 => Ok(Self::J),
            0x03 => Ok(Self::Jal),
            0x04 => Ok(Self::Beq),
            0x05 => Ok(Self::Bne),
            0x06 => Ok(Self::Blez),
            0x07 => Ok(Self::Bgtz),
            0x08 => Ok(Self::Addi),
            0x09 => Ok(Self::Addiu),
            0x0A => Ok(Self::Slti),
            0x0B => Ok(Self::Sltiu),
            0x0C => Ok(Self::Andi),
            0x0D => Ok(Self::Ori),
            0x0E => Ok(Self::Xori),
            0x0F => Ok(Self::Lui),
            0x10 => Ok(Self::Cop0),
            0x11 => Ok(Self::Cop1),
            0x12 => Ok(Self::Cop2),
            0x13 => Ok(Self::Cop3),
            0x20 => Ok(Self::Lb),
            0x21 => Ok(Self::Lh),
            0x22 => Ok(Self::Lwl),
            0x23 => Ok(Self::Lw),
            0x24 => Ok(Self::Lbu),
            0x25 => Ok(Self::Lhu),
            0x26 => Ok(Self::Lwr),
            0x28 => Ok(Self::Sb),
            0x29 => Ok(Self::Sh),
            0x2A => Ok(Self::Swl),
            0x2B => Ok(Self::Sw),
            0x2E => Ok(Self::Swr),
            0x30 => Ok(Self::Lwc0),
            0x31 => Ok(Self::Lwc1),
            0x32 => Ok(Self::Lwc2),
            0x33 => Ok(Self::Lwc3),
            0x38 => Ok(Self::Swc0),
            0x39 => Ok(Self::Swc1),
            0x3A => Ok(Self::Swc2),
            0x3B => Ok(Self::Swc3),
            _ => Err(format!("Reserved primary opcode 0x{n:02X}")),
        }
    }
}

/// Function field of the register-register class (primary opcode 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionFunct {
    Sll = 0x00,
    Srl = 0x02,
    Sra = 0x03,
    Sllv = 0x04,
    Srlv = 0x06,
    Srav = 0x07,
    Jr = 0x08,
    Jalr = 0x09,
    Syscall = 0x0C,
    Break = 0x0D,
    Mfhi = 0x10,
    Mthi = 0x11,
    Mflo = 0x12,
    Mtlo = 0x13,
    Mult = 0x18,
    Multu = 0x19,
    Div = 0x1A,
    Divu = 0x1B,
    Add = 0x20,
    Addu = 0x21,
    Sub = 0x22,
    Subu = 0x23,
    And = 0x24,
    Or = 0x25,
    Xor = 0x26,
    Nor = 0x27,
    Slt = 0x2A,
    Sltu = 0x2B,
}

impl TryFrom<u32> for InstructionFunct {
    type Error = String;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            0x00 => Ok(Self::Sll),
            0x02 => Ok(Self::Srl),
            0x03 => Ok(Self::Sra),
            0x04 => Ok(Self::Sllv),
            0x06 => Ok(Self::Srlv),
            0x07 => Ok(Self::Srav),
            0x08 => Ok(Self::Jr),
            0x09 => Ok(Self::Jalr),
            0x0C => Ok(Self::Syscall),
            0x0D => Ok(Self::Break),
            0x10 => Ok(Self::Mfhi),
            0x11 => Ok(Self::Mthi),
            0x12 => Ok(Self::Mflo),
            0x13 => Ok(Self::Mtlo),
            0x18 => Ok(Self::Mult),
            0x19 => Ok(Self::Multu),
            0x1A => Ok(Self::Div),
            0x1B => Ok(Self::Divu),
            0x20 => Ok(Self::Add),
            0x21 => Ok(Self::Addu),
            0x22 => Ok(Self::Sub),
            0x23 => Ok(Self::Subu),
            0x24 => Ok(Self::And),
            0x25 => Ok(Self::Or),
            0x26 => Ok(Self::Xor),
            0x27 => Ok(Self::Nor),
            0x2A => Ok(Self::Slt),
            0x2B => Ok(Self::Sltu),
            _ => Err(format!("Reserved funct 0x{n:02X}")),
        }
    }
}

/// Register-transfer sub-ops shared by every coprocessor (bits 21-25 when
/// bit 25 is clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopCommonOp {
    Mfc = 0b0000,
    Cfc = 0b0010,
    Mtc = 0b0100,
    Ctc = 0b0110,
    Bc = 0b1000,
}

impl TryFrom<u32> for CopCommonOp {
    type Error = String;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            0b0000 => Ok(Self::Mfc),
            0b0010 => Ok(Self::Cfc),
            0b0100 => Ok(Self::Mtc),
            0b0110 => Ok(Self::Ctc),
            0b1000 => Ok(Self::Bc),
            _ => Err(format!("Reserved coprocessor sub-op 0b{n:05b}")),
        }
    }
}

/// COP0 function forms (bit 25 set); only `rfe` exists on this part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cop0Op {
    Rfe = 0x10,
}

impl TryFrom<u32> for Cop0Op {
    type Error = String;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        match n {
            0x10 => Ok(Self::Rfe),
            _ => Err(format!("Reserved COP0 funct 0x{n:02X}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_extraction() {
        // ori $7, $3, 0xBEEF
        let inst = Instruction((0x0D << 26) | (3 << 21) | (7 << 16) | 0xBEEF);
        assert_eq!(inst.op_bits(), 0x0D);
        assert_eq!(inst.rs(), 3);
        assert_eq!(inst.rt(), 7);
        assert_eq!(inst.imm_zext32(), 0xBEEF);
        assert_eq!(inst.imm_sext32(), 0xFFFF_BEEF);
    }

    #[test]
    fn funct_fields() {
        // add $5, $3, $4 => funct class
        let inst = Instruction((3 << 21) | (4 << 16) | (5 << 11) | 0x20);
        assert_eq!(
            InstructionOp::try_from(inst.op_bits()),
            Ok(InstructionOp::Funct)
        );
        assert_eq!(
            InstructionFunct::try_from(inst.funct_bits()),
            Ok(InstructionFunct::Add)
        );
        assert_eq!(inst.rd(), 5);
    }

    #[test]
    fn default_is_nop() {
        let inst = Instruction::default();
        assert_eq!(
            InstructionOp::try_from(inst.op_bits()),
            Ok(InstructionOp::Funct)
        );
        assert_eq!(
            InstructionFunct::try_from(inst.funct_bits()),
            Ok(InstructionFunct::Sll)
        );
        assert_eq!(inst.rd(), 0);
    }

    #[test]
    fn reserved_encodings_fail_decode() {
        assert!(InstructionOp::try_from(0x14).is_err());
        assert!(InstructionOp::try_from(0x3F).is_err());
        assert!(InstructionFunct::try_from(0x01).is_err());
        assert!(InstructionFunct::try_from(0x3F).is_err());
    }

    #[test]
    fn cop2_detection_is_primary_opcode_only() {
        let cop2 = Instruction(0x12 << 26);
        let lwc2 = Instruction(0x32 << 26);
        let swc2 = Instruction(0x3A << 26);
        assert!(cop2.is_cop2_instruction());
        assert!(!lwc2.is_cop2_instruction());
        assert!(!swc2.is_cop2_instruction());
    }

    #[test]
    fn cop_common_split() {
        // mtc0 $1, $12 => op 0x10, sub-op 0b00100, rt=1, rd=12
        let mtc0 = Instruction((0x10 << 26) | (0b00100 << 21) | (1 << 16) | (12 << 11));
        assert!(mtc0.is_cop_common_instruction());
        assert_eq!(
            CopCommonOp::try_from(mtc0.cop_common_op_bits()),
            Ok(CopCommonOp::Mtc)
        );
        assert_eq!(mtc0.cop_n(), 0);

        // rfe => op 0x10, bit 25 set, funct 0x10
        let rfe = Instruction((0x10 << 26) | (1 << 25) | 0x10);
        assert!(!rfe.is_cop_common_instruction());
        assert_eq!(Cop0Op::try_from(rfe.funct_bits()), Ok(Cop0Op::Rfe));

        // GTE command carries coprocessor number 2
        let gte = Instruction((0x12 << 26) | (1 << 25) | 0x06);
        assert_eq!(gte.cop_n(), 2);
    }
}
