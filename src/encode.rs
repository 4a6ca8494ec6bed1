//! Instruction word construction
//!
//! Functions in this file pack already-validated fields into 32-bit
//! RISC-V instruction words. Range checking of immediates is the
//! caller's job (see `Instr::encode`).

use crate::utils::{extract_field, interpret_i32_as_unsigned};

pub use super::opcodes::*;

/// Make an I-type instruction. Only produces a valid I-type
/// instruction if the arguments are in range.
pub fn itype(imm: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (imm & 0xfff) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

/// Make an U- or J-type instruction (if you are making
/// a J-type instruction, make sure to construct the
/// immediate field correctly using jtype_imm_field)
pub fn ujtype(imm: u32, rd: u32, opcode: u32) -> u32 {
    (imm & 0xf_ffff) << 12 | rd << 7 | opcode
}

/// Make an R- or S-type instruction. These instructions
/// have the same number of fields of the same size. The meaning
/// of a and b is:
///
/// R-type: a = funct7, b = rd
/// S-type: a = imm[11:5], b = imm[4:0]
pub fn rstype(a: u32, rs2: u32, rs1: u32, funct3: u32, b: u32, opcode: u32) -> u32 {
    a << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | b << 7 | opcode
}

/// Returns (a, b) suitable for use with rstype for
/// the store instructions (stype)
pub fn stype_imm_fields(imm: i32) -> (u32, u32) {
    let imm = interpret_i32_as_unsigned(imm);
    (extract_field(imm, 11, 5), extract_field(imm, 4, 0))
}

/// The RV64 shift-by-immediate instructions use I-type,
/// with the lower 6 bits holding the shift amount (shamt)
/// and the upper 6 bits distinguishing between arithmetical
/// and logical right shift
pub fn shifts_imm_field(shamt: u32, upper: u32) -> u32 {
    let shamt = extract_field(shamt, 5, 0);
    (upper << 6) | shamt
}

/// Upper six bits of the srai immediate field
pub const SHIFT_UPPER_ARITHMETIC: u32 = 0b010000;

/// Takes an immediate and shuffles it into the
/// format required for the 20-bit field of the
/// U-type instruction (making it J-type)
pub fn jtype_imm_field(imm: i32) -> u32 {
    let imm = interpret_i32_as_unsigned(imm);
    let imm20 = extract_field(imm, 20, 20);
    let imm19_12 = extract_field(imm, 19, 12);
    let imm11 = extract_field(imm, 11, 11);
    let imm10_1 = extract_field(imm, 10, 1);
    (imm20 << 19) | (imm10_1 << 9) | (imm11 << 8) | imm19_12
}

/// Returns (a, b) suitable for use with rstype for
/// the conditional branch instructions (btype)
pub fn btype_imm_fields(imm: i32) -> (u32, u32) {
    let imm = interpret_i32_as_unsigned(imm);
    let imm12 = extract_field(imm, 12, 12);
    let imm11 = extract_field(imm, 11, 11);
    let imm10_5 = extract_field(imm, 10, 5);
    let imm4_1 = extract_field(imm, 4, 1);
    let a = (imm12 << 6) | imm10_5;
    let b = (imm4_1 << 1) | imm11;
    (a, b)
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_itype() {
        // addi x1, x0, 1
        assert_eq!(itype(1, 0, FUNCT3_ADDI, 1, OP_IMM), 0x0010_0093);
        // addi x1, x0, -1
        let imm = interpret_i32_as_unsigned(-1);
        assert_eq!(itype(imm, 0, FUNCT3_ADDI, 1, OP_IMM), 0xfff0_0093);
    }

    #[test]
    fn check_jal() {
        assert_eq!(ujtype(jtype_imm_field(0), 0, OP_JAL), 0x0000_006f);
        assert_eq!(ujtype(jtype_imm_field(8), 1, OP_JAL), 0x0080_00ef);
        // jal x0, -4
        assert_eq!(ujtype(jtype_imm_field(-4), 0, OP_JAL), 0xffdf_f06f);
    }

    #[test]
    fn check_branch() {
        let (a, b) = btype_imm_fields(8);
        assert_eq!(rstype(a, 0, 0, FUNCT3_BEQ, b, OP_BRANCH), 0x0000_0463);
        // bne x5, x6, -8
        let (a, b) = btype_imm_fields(-8);
        assert_eq!(rstype(a, 6, 5, FUNCT3_BNE, b, OP_BRANCH), 0xfe62_9ce3);
    }

    #[test]
    fn check_rv64_shifts() {
        // slli x1, x1, 32
        let imm = shifts_imm_field(32, 0);
        assert_eq!(itype(imm, 1, FUNCT3_SLLI, 1, OP_IMM), 0x0200_9093);
        // srai x1, x1, 63
        let imm = shifts_imm_field(63, SHIFT_UPPER_ARITHMETIC);
        assert_eq!(itype(imm, 1, FUNCT3_SRAI, 1, OP_IMM), 0x43f0_d093);
    }

    #[test]
    fn check_store() {
        // sd x5, 16(x6)
        let (a, b) = stype_imm_fields(16);
        assert_eq!(rstype(a, 5, 6, FUNCT3_D, b, OP_STORE), 0x0053_3823);
    }
}
