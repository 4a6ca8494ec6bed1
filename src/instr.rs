//! Instructions emitted by the handler generator
//!
//! The generator only needs a small slice of RV64GCV: integer
//! arithmetic, branches, loads/stores, Zicsr, the trap-return and
//! fence instructions, one F/D move and the vector configuration
//! and slide instructions used to set up vector state. Every value of
//! `Instr` can be encoded to its 32-bit word (after range checking)
//! and printed as assembly.

use std::fmt;

use thiserror::Error;

use crate::csr::csr_name;
use crate::encode::*;
use crate::utils::{fits_signed, interpret_i32_as_unsigned};

/// Every emitted instruction is four bytes (no compressed instructions)
pub const INSTR_LENGTH: u64 = 4;

/// Integer register index (x0-x31)
pub type Reg = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmOp {
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
    Slli,
    Srli,
    Srai,
    Addiw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOp {
    Add,
    Sub,
    Sll,
    Srl,
    Sra,
    Xor,
    Or,
    And,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrOp {
    Rw,
    Rs,
    Rc,
}

/// Branch and jump offsets are in bytes, relative to the
/// address of the instruction itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    /// imm20 is the upper 20 bits that will be loaded (it is not
    /// shifted again)
    Lui { rd: Reg, imm20: u32 },
    Auipc { rd: Reg, imm20: u32 },
    Jal { rd: Reg, offset: i32 },
    Jalr { rd: Reg, rs1: Reg, offset: i32 },
    Branch { cond: BranchCond, rs1: Reg, rs2: Reg, offset: i32 },
    Load { width: Width, rd: Reg, rs1: Reg, offset: i32 },
    Store { width: Width, rs1: Reg, rs2: Reg, offset: i32 },
    OpImm { op: ImmOp, rd: Reg, rs1: Reg, imm: i32 },
    Op { op: RegOp, rd: Reg, rs1: Reg, rs2: Reg },
    Csr { op: CsrOp, rd: Reg, rs1: Reg, csr: u16 },
    Mret,
    Sret,
    SfenceVma { rs1: Reg, rs2: Reg },
    FmvDX { fd: Reg, rs1: Reg },
    Vsetvli { rd: Reg, rs1: Reg, vtypei: u32 },
    Vsetvl { rd: Reg, rs1: Reg, rs2: Reg },
    Vslide1downVx { vd: Reg, vs2: Reg, rs1: Reg },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("register index {0} exceeds 31")]
    InvalidRegister(u32),
    #[error("immediate {imm} out of range for {mnemonic}")]
    ImmediateOutOfRange { mnemonic: &'static str, imm: i64 },
    #[error("offset {0} is not a multiple of two")]
    MisalignedOffset(i32),
    #[error("CSR address 0x{0:x} exceeds 12 bits")]
    InvalidCsr(u16),
}

fn check_regs(regs: &[Reg]) -> Result<(), EncodeError> {
    match regs.iter().find(|&&r| r > 31) {
        Some(&r) => Err(EncodeError::InvalidRegister(r)),
        None => Ok(()),
    }
}

fn check_imm(mnemonic: &'static str, imm: i32, bits: u32) -> Result<u32, EncodeError> {
    if fits_signed(imm.into(), bits) {
        Ok(interpret_i32_as_unsigned(imm))
    } else {
        Err(EncodeError::ImmediateOutOfRange {
            mnemonic,
            imm: imm.into(),
        })
    }
}

fn check_pc_offset(mnemonic: &'static str, offset: i32, bits: u32) -> Result<i32, EncodeError> {
    if offset % 2 != 0 {
        return Err(EncodeError::MisalignedOffset(offset));
    }
    check_imm(mnemonic, offset, bits)?;
    Ok(offset)
}

fn check_upper(mnemonic: &'static str, imm20: u32) -> Result<u32, EncodeError> {
    if imm20 > 0xf_ffff {
        Err(EncodeError::ImmediateOutOfRange {
            mnemonic,
            imm: imm20.into(),
        })
    } else {
        Ok(imm20)
    }
}

fn width_funct3(width: Width) -> u32 {
    match width {
        Width::Byte => FUNCT3_B,
        Width::Half => FUNCT3_H,
        Width::Word => FUNCT3_W,
        Width::Double => FUNCT3_D,
    }
}

fn branch_funct3(cond: BranchCond) -> u32 {
    match cond {
        BranchCond::Eq => FUNCT3_BEQ,
        BranchCond::Ne => FUNCT3_BNE,
        BranchCond::Lt => FUNCT3_BLT,
        BranchCond::Ge => FUNCT3_BGE,
        BranchCond::Ltu => FUNCT3_BLTU,
        BranchCond::Geu => FUNCT3_BGEU,
    }
}

impl ImmOp {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Addi => "addi",
            Self::Slti => "slti",
            Self::Sltiu => "sltiu",
            Self::Xori => "xori",
            Self::Ori => "ori",
            Self::Andi => "andi",
            Self::Slli => "slli",
            Self::Srli => "srli",
            Self::Srai => "srai",
            Self::Addiw => "addiw",
        }
    }

    fn is_shift(&self) -> bool {
        matches!(self, Self::Slli | Self::Srli | Self::Srai)
    }
}

impl RegOp {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Sll => "sll",
            Self::Srl => "srl",
            Self::Sra => "sra",
            Self::Xor => "xor",
            Self::Or => "or",
            Self::And => "and",
        }
    }
}

impl Instr {
    /// Encode the instruction as a 32-bit word, checking that
    /// every field is in range.
    pub fn encode(&self) -> Result<u32, EncodeError> {
        match *self {
            Self::Lui { rd, imm20 } => {
                check_regs(&[rd])?;
                Ok(ujtype(check_upper("lui", imm20)?, rd, OP_LUI))
            }
            Self::Auipc { rd, imm20 } => {
                check_regs(&[rd])?;
                Ok(ujtype(check_upper("auipc", imm20)?, rd, OP_AUIPC))
            }
            Self::Jal { rd, offset } => {
                check_regs(&[rd])?;
                let offset = check_pc_offset("jal", offset, 21)?;
                Ok(ujtype(jtype_imm_field(offset), rd, OP_JAL))
            }
            Self::Jalr { rd, rs1, offset } => {
                check_regs(&[rd, rs1])?;
                let imm = check_imm("jalr", offset, 12)?;
                Ok(itype(imm, rs1, 0b000, rd, OP_JALR))
            }
            Self::Branch {
                cond,
                rs1,
                rs2,
                offset,
            } => {
                check_regs(&[rs1, rs2])?;
                let offset = check_pc_offset("branch", offset, 13)?;
                let (a, b) = btype_imm_fields(offset);
                Ok(rstype(a, rs2, rs1, branch_funct3(cond), b, OP_BRANCH))
            }
            Self::Load {
                width,
                rd,
                rs1,
                offset,
            } => {
                check_regs(&[rd, rs1])?;
                let imm = check_imm("load", offset, 12)?;
                Ok(itype(imm, rs1, width_funct3(width), rd, OP_LOAD))
            }
            Self::Store {
                width,
                rs1,
                rs2,
                offset,
            } => {
                check_regs(&[rs1, rs2])?;
                check_imm("store", offset, 12)?;
                let (a, b) = stype_imm_fields(offset);
                Ok(rstype(a, rs2, rs1, width_funct3(width), b, OP_STORE))
            }
            Self::OpImm { op, rd, rs1, imm } => {
                check_regs(&[rd, rs1])?;
                if op.is_shift() {
                    if !(0..64).contains(&imm) {
                        return Err(EncodeError::ImmediateOutOfRange {
                            mnemonic: op.mnemonic(),
                            imm: imm.into(),
                        });
                    }
                    let shamt = interpret_i32_as_unsigned(imm);
                    let (upper, funct3) = match op {
                        ImmOp::Slli => (0, FUNCT3_SLLI),
                        ImmOp::Srli => (0, FUNCT3_SRLI),
                        _ => (SHIFT_UPPER_ARITHMETIC, FUNCT3_SRAI),
                    };
                    return Ok(itype(shifts_imm_field(shamt, upper), rs1, funct3, rd, OP_IMM));
                }
                let imm = check_imm(op.mnemonic(), imm, 12)?;
                let (funct3, opcode) = match op {
                    ImmOp::Addi => (FUNCT3_ADDI, OP_IMM),
                    ImmOp::Slti => (FUNCT3_SLTI, OP_IMM),
                    ImmOp::Sltiu => (FUNCT3_SLTIU, OP_IMM),
                    ImmOp::Xori => (FUNCT3_XORI, OP_IMM),
                    ImmOp::Ori => (FUNCT3_ORI, OP_IMM),
                    ImmOp::Andi => (FUNCT3_ANDI, OP_IMM),
                    _ => (FUNCT3_ADDI, OP_IMM_32),
                };
                Ok(itype(imm, rs1, funct3, rd, opcode))
            }
            Self::Op { op, rd, rs1, rs2 } => {
                check_regs(&[rd, rs1, rs2])?;
                let (funct7, funct3) = match op {
                    RegOp::Add => (0, FUNCT3_ADD),
                    RegOp::Sub => (FUNCT7_SUB, FUNCT3_SUB),
                    RegOp::Sll => (0, FUNCT3_SLL),
                    RegOp::Srl => (0, FUNCT3_SRL),
                    RegOp::Sra => (FUNCT7_SRA, FUNCT3_SRL),
                    RegOp::Xor => (0, FUNCT3_XOR),
                    RegOp::Or => (0, FUNCT3_OR),
                    RegOp::And => (0, FUNCT3_AND),
                };
                Ok(rstype(funct7, rs2, rs1, funct3, rd, OP))
            }
            Self::Csr { op, rd, rs1, csr } => {
                check_regs(&[rd, rs1])?;
                if csr > 0xfff {
                    return Err(EncodeError::InvalidCsr(csr));
                }
                let funct3 = match op {
                    CsrOp::Rw => FUNCT3_CSRRW,
                    CsrOp::Rs => FUNCT3_CSRRS,
                    CsrOp::Rc => FUNCT3_CSRRC,
                };
                Ok(itype(csr.into(), rs1, funct3, rd, OP_SYSTEM))
            }
            Self::Mret => Ok(MRET),
            Self::Sret => Ok(SRET),
            Self::SfenceVma { rs1, rs2 } => {
                check_regs(&[rs1, rs2])?;
                Ok(rstype(FUNCT7_SFENCE_VMA, rs2, rs1, 0, 0, OP_SYSTEM))
            }
            Self::FmvDX { fd, rs1 } => {
                check_regs(&[fd, rs1])?;
                Ok(rstype(FUNCT7_FMV_D_X, 0, rs1, 0, fd, OP_FP))
            }
            Self::Vsetvli { rd, rs1, vtypei } => {
                check_regs(&[rd, rs1])?;
                if vtypei > 0x7ff {
                    return Err(EncodeError::ImmediateOutOfRange {
                        mnemonic: "vsetvli",
                        imm: vtypei.into(),
                    });
                }
                Ok(itype(vtypei, rs1, FUNCT3_OPCFG, rd, OP_V))
            }
            Self::Vsetvl { rd, rs1, rs2 } => {
                check_regs(&[rd, rs1, rs2])?;
                Ok(rstype(FUNCT7_VSETVL, rs2, rs1, FUNCT3_OPCFG, rd, OP_V))
            }
            Self::Vslide1downVx { vd, vs2, rs1 } => {
                check_regs(&[vd, vs2, rs1])?;
                Ok(rstype(FUNCT7_VSLIDE1DOWN, vs2, rs1, FUNCT3_OPMVX, vd, OP_V))
            }
        }
    }

    /// Byte offset of a jal or conditional branch, None for every
    /// other instruction
    pub fn pc_relative_offset(&self) -> Option<i32> {
        match *self {
            Self::Jal { offset, .. } | Self::Branch { offset, .. } => Some(offset),
            _ => None,
        }
    }
}

fn csr_display(csr: u16) -> String {
    match csr_name(csr) {
        Some(name) => name.to_string(),
        None => format!("0x{csr:x}"),
    }
}

fn width_suffix(width: Width) -> &'static str {
    match width {
        Width::Byte => "b",
        Width::Half => "h",
        Width::Word => "w",
        Width::Double => "d",
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Lui { rd, imm20 } => write!(f, "lui x{rd}, 0x{imm20:x}"),
            Self::Auipc { rd, imm20 } => write!(f, "auipc x{rd}, 0x{imm20:x}"),
            Self::Jal { rd, offset } => write!(f, "jal x{rd}, {offset}"),
            Self::Jalr { rd, rs1, offset } => write!(f, "jalr x{rd}, {offset}(x{rs1})"),
            Self::Branch {
                cond,
                rs1,
                rs2,
                offset,
            } => {
                let mnemonic = match cond {
                    BranchCond::Eq => "beq",
                    BranchCond::Ne => "bne",
                    BranchCond::Lt => "blt",
                    BranchCond::Ge => "bge",
                    BranchCond::Ltu => "bltu",
                    BranchCond::Geu => "bgeu",
                };
                write!(f, "{mnemonic} x{rs1}, x{rs2}, {offset}")
            }
            Self::Load {
                width,
                rd,
                rs1,
                offset,
            } => write!(f, "l{} x{rd}, {offset}(x{rs1})", width_suffix(width)),
            Self::Store {
                width,
                rs1,
                rs2,
                offset,
            } => write!(f, "s{} x{rs2}, {offset}(x{rs1})", width_suffix(width)),
            Self::OpImm { op, rd, rs1, imm } => {
                write!(f, "{} x{rd}, x{rs1}, {imm}", op.mnemonic())
            }
            Self::Op { op, rd, rs1, rs2 } => {
                write!(f, "{} x{rd}, x{rs1}, x{rs2}", op.mnemonic())
            }
            Self::Csr { op, rd, rs1, csr } => {
                let mnemonic = match op {
                    CsrOp::Rw => "csrrw",
                    CsrOp::Rs => "csrrs",
                    CsrOp::Rc => "csrrc",
                };
                write!(f, "{mnemonic} x{rd}, {}, x{rs1}", csr_display(csr))
            }
            Self::Mret => write!(f, "mret"),
            Self::Sret => write!(f, "sret"),
            Self::SfenceVma { rs1, rs2 } => write!(f, "sfence.vma x{rs1}, x{rs2}"),
            Self::FmvDX { fd, rs1 } => write!(f, "fmv.d.x f{fd}, x{rs1}"),
            Self::Vsetvli { rd, rs1, vtypei } => {
                write!(f, "vsetvli x{rd}, x{rs1}, 0x{vtypei:x}")
            }
            Self::Vsetvl { rd, rs1, rs2 } => write!(f, "vsetvl x{rd}, x{rs1}, x{rs2}"),
            Self::Vslide1downVx { vd, vs2, rs1 } => {
                write!(f, "vslide1down.vx v{vd}, v{vs2}, x{rs1}")
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_known_encodings() {
        let cases = [
            (
                Instr::OpImm {
                    op: ImmOp::Addi,
                    rd: 1,
                    rs1: 0,
                    imm: 1,
                },
                0x0010_0093,
            ),
            (Instr::Jal { rd: 1, offset: 8 }, 0x0080_00ef),
            (
                Instr::Jalr {
                    rd: 0,
                    rs1: 1,
                    offset: 0,
                },
                0x0000_8067,
            ),
            (Instr::Lui { rd: 5, imm20: 0x12345 }, 0x1234_52b7),
            (Instr::Auipc { rd: 5, imm20: 0 }, 0x0000_0297),
            (
                Instr::Load {
                    width: Width::Double,
                    rd: 5,
                    rs1: 6,
                    offset: 8,
                },
                0x0083_3283,
            ),
            // csrrs x5, mcause, x0 (csrr x5, mcause)
            (
                Instr::Csr {
                    op: CsrOp::Rs,
                    rd: 5,
                    rs1: 0,
                    csr: 0x342,
                },
                0x3420_22f3,
            ),
            (Instr::Mret, 0x3020_0073),
            (Instr::Sret, 0x1020_0073),
            (Instr::SfenceVma { rs1: 0, rs2: 0 }, 0x1200_0073),
            (
                Instr::Op {
                    op: RegOp::Sub,
                    rd: 1,
                    rs1: 2,
                    rs2: 3,
                },
                0x4031_00b3,
            ),
        ];
        for (instr, word) in cases {
            assert_eq!(instr.encode(), Ok(word), "{instr}");
        }
    }

    #[test]
    fn check_immediate_range() {
        let too_big = Instr::OpImm {
            op: ImmOp::Addi,
            rd: 1,
            rs1: 1,
            imm: 2048,
        };
        assert!(matches!(
            too_big.encode(),
            Err(EncodeError::ImmediateOutOfRange { .. })
        ));
        let bad_shift = Instr::OpImm {
            op: ImmOp::Slli,
            rd: 1,
            rs1: 1,
            imm: 64,
        };
        assert!(bad_shift.encode().is_err());
        let odd_branch = Instr::Branch {
            cond: BranchCond::Eq,
            rs1: 0,
            rs2: 0,
            offset: 3,
        };
        assert_eq!(odd_branch.encode(), Err(EncodeError::MisalignedOffset(3)));
        let far_branch = Instr::Branch {
            cond: BranchCond::Eq,
            rs1: 0,
            rs2: 0,
            offset: 4096,
        };
        assert!(far_branch.encode().is_err());
    }

    #[test]
    fn check_invalid_register() {
        let instr = Instr::Jal { rd: 32, offset: 0 };
        assert_eq!(instr.encode(), Err(EncodeError::InvalidRegister(32)));
    }

    #[test]
    fn check_display() {
        let instr = Instr::Csr {
            op: CsrOp::Rw,
            rd: 0,
            rs1: 7,
            csr: 0x305,
        };
        assert_eq!(instr.to_string(), "csrrw x0, mtvec, x7");
        let instr = Instr::Store {
            width: Width::Double,
            rs1: 6,
            rs2: 5,
            offset: 16,
        };
        assert_eq!(instr.to_string(), "sd x5, 16(x6)");
    }
}
