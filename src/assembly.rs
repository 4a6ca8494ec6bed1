//! Architecture-neutral code generation helper
//!
//! `AssemblyHelper` wraps a `Sequence` and offers a small vocabulary
//! (move immediate, arithmetic, system register access, loads and
//! stores, branches) used by every handler generator. Branch offsets
//! are given in instructions, relative to the branch itself.
//!
//! Branches to code that has not been emitted yet are usually made
//! with a precomputed offset. Recording such a branch against a label
//! and placing the label once the target is reached turns any mistake
//! in that arithmetic into a generation-time error.

pub mod labels;
pub mod riscv;

use log::debug;

use crate::csr::csr_address;
use crate::error::GenError;
use crate::instr::{BranchCond, CsrOp, ImmOp, Instr, Reg, RegOp, Width, INSTR_LENGTH};
use crate::sequence::Sequence;
use labels::LabelTable;

/// Branch offsets are counted in whole instructions
pub const BRANCH_SHIFT: u32 = 2;
/// Width of a jal offset in instructions (21-bit byte offset)
pub const JAL_OFFSET_WIDTH: u32 = 19;
/// Width of a conditional branch offset in instructions (13-bit byte offset)
pub const BRANCH_OFFSET_WIDTH: u32 = 11;

pub struct AssemblyHelper<'a, S: Sequence + ?Sized> {
    seq: &'a mut S,
    labels: LabelTable,
    next_label: usize,
}

/// Byte offset of a branch at `from` jumping `offset` instructions
fn instrs_to_bytes(from: u64, offset: i64) -> Result<i32, GenError> {
    let bytes = offset.wrapping_shl(BRANCH_SHIFT);
    i32::try_from(bytes).map_err(|_| GenError::InvalidBranchOffset {
        from,
        to: from.wrapping_add_signed(bytes),
        width: 32,
        offset,
    })
}

impl<'a, S: Sequence + ?Sized> AssemblyHelper<'a, S> {
    pub fn new(seq: &'a mut S) -> Self {
        Self {
            seq,
            labels: LabelTable::new(BRANCH_SHIFT),
            next_label: 0,
        }
    }

    pub fn seq(&mut self) -> &mut S {
        &mut *self.seq
    }

    pub fn pc(&self) -> u64 {
        self.seq.pc()
    }

    /// Number of instructions emitted since `start`
    pub fn instructions_since(&self, start: u64) -> usize {
        ((self.seq.pc() - start) / INSTR_LENGTH) as usize
    }

    pub fn gen_instruction(&mut self, instr: Instr) -> Result<(), GenError> {
        self.seq.gen_instruction(instr)?;
        Ok(())
    }

    // === Labels ===

    /// Reset the label table for a new routine
    pub fn clear_labels(&mut self, tag: &str) {
        debug!("labels cleared for {tag}");
        self.labels.clear(tag);
    }

    /// A label name that has not been handed out before
    pub fn unique_label(&mut self, prefix: &str) -> String {
        self.next_label += 1;
        format!("{prefix}_{}", self.next_label)
    }

    pub fn add_label(&mut self, label: &str) -> Result<(), GenError> {
        let pc = self.seq.pc();
        self.labels.place(label, pc)?;
        Ok(())
    }

    /// Error if a branch recorded against a label has not landed yet
    pub fn check_labels_resolved(&self) -> Result<(), GenError> {
        self.labels.check_resolved()?;
        Ok(())
    }

    pub fn gen_relative_branch_to_label(&mut self, offset: i64, label: &str) -> Result<(), GenError> {
        let pc = self.seq.pc();
        self.labels.record_branch(label, pc, offset);
        self.gen_relative_branch(offset)
    }

    pub fn gen_relative_branch_with_link_to_label(
        &mut self,
        link: Reg,
        offset: i64,
        label: &str,
    ) -> Result<(), GenError> {
        let pc = self.seq.pc();
        self.labels.record_branch(label, pc, offset);
        self.gen_relative_branch_with_link(link, offset)
    }

    pub fn gen_conditional_branch_to_label(
        &mut self,
        rs1: Reg,
        rs2: Reg,
        offset: i64,
        cond: BranchCond,
        label: &str,
    ) -> Result<(), GenError> {
        let pc = self.seq.pc();
        self.labels.record_branch(label, pc, offset);
        self.gen_conditional_branch(rs1, rs2, offset, cond)
    }

    // === Immediates and arithmetic ===

    /// Load a 64-bit immediate (see `riscv::li_sequence`)
    pub fn gen_move_immediate(&mut self, rd: Reg, value: u64) -> Result<(), GenError> {
        for instr in riscv::li_sequence(rd, value) {
            self.gen_instruction(instr)?;
        }
        Ok(())
    }

    pub fn gen_move_register(&mut self, rd: Reg, rs: Reg) -> Result<(), GenError> {
        self.gen_op_immediate(ImmOp::Addi, rd, rs, 0)
    }

    fn gen_op_immediate(&mut self, op: ImmOp, rd: Reg, rs1: Reg, imm: i32) -> Result<(), GenError> {
        self.gen_instruction(Instr::OpImm { op, rd, rs1, imm })
    }

    pub fn gen_add_immediate(&mut self, rd: Reg, rs1: Reg, imm: i32) -> Result<(), GenError> {
        self.gen_op_immediate(ImmOp::Addi, rd, rs1, imm)
    }

    pub fn gen_and_immediate(&mut self, rd: Reg, rs1: Reg, imm: i32) -> Result<(), GenError> {
        self.gen_op_immediate(ImmOp::Andi, rd, rs1, imm)
    }

    pub fn gen_or_immediate(&mut self, rd: Reg, rs1: Reg, imm: i32) -> Result<(), GenError> {
        self.gen_op_immediate(ImmOp::Ori, rd, rs1, imm)
    }

    pub fn gen_xor_immediate(&mut self, rd: Reg, rs1: Reg, imm: i32) -> Result<(), GenError> {
        self.gen_op_immediate(ImmOp::Xori, rd, rs1, imm)
    }

    pub fn gen_set_less_than_unsigned_immediate(
        &mut self,
        rd: Reg,
        rs1: Reg,
        imm: i32,
    ) -> Result<(), GenError> {
        self.gen_op_immediate(ImmOp::Sltiu, rd, rs1, imm)
    }

    pub fn gen_shift_left_immediate(&mut self, rd: Reg, rs1: Reg, shamt: u32) -> Result<(), GenError> {
        self.gen_op_immediate(ImmOp::Slli, rd, rs1, shamt as i32)
    }

    pub fn gen_shift_right_immediate(&mut self, rd: Reg, rs1: Reg, shamt: u32) -> Result<(), GenError> {
        self.gen_op_immediate(ImmOp::Srli, rd, rs1, shamt as i32)
    }

    fn gen_op_register(&mut self, op: RegOp, rd: Reg, rs1: Reg, rs2: Reg) -> Result<(), GenError> {
        self.gen_instruction(Instr::Op { op, rd, rs1, rs2 })
    }

    pub fn gen_add_register(&mut self, rd: Reg, rs1: Reg, rs2: Reg) -> Result<(), GenError> {
        self.gen_op_register(RegOp::Add, rd, rs1, rs2)
    }

    pub fn gen_sub_register(&mut self, rd: Reg, rs1: Reg, rs2: Reg) -> Result<(), GenError> {
        self.gen_op_register(RegOp::Sub, rd, rs1, rs2)
    }

    pub fn gen_and_register(&mut self, rd: Reg, rs1: Reg, rs2: Reg) -> Result<(), GenError> {
        self.gen_op_register(RegOp::And, rd, rs1, rs2)
    }

    pub fn gen_or_register(&mut self, rd: Reg, rs1: Reg, rs2: Reg) -> Result<(), GenError> {
        self.gen_op_register(RegOp::Or, rd, rs1, rs2)
    }

    pub fn gen_xor_register(&mut self, rd: Reg, rs1: Reg, rs2: Reg) -> Result<(), GenError> {
        self.gen_op_register(RegOp::Xor, rd, rs1, rs2)
    }

    pub fn gen_shift_left_register(&mut self, rd: Reg, rs1: Reg, rs2: Reg) -> Result<(), GenError> {
        self.gen_op_register(RegOp::Sll, rd, rs1, rs2)
    }

    // === System registers ===

    fn csr(name: &str) -> Result<u16, GenError> {
        csr_address(name).ok_or_else(|| GenError::UnknownRegister(name.to_string()))
    }

    fn gen_csr(&mut self, op: CsrOp, rd: Reg, name: &str, rs1: Reg) -> Result<(), GenError> {
        let csr = Self::csr(name)?;
        self.gen_instruction(Instr::Csr { op, rd, rs1, csr })
    }

    pub fn gen_read_system_register(&mut self, rd: Reg, name: &str) -> Result<(), GenError> {
        self.gen_csr(CsrOp::Rs, rd, name, 0)
    }

    pub fn gen_write_system_register(&mut self, name: &str, rs: Reg) -> Result<(), GenError> {
        self.gen_csr(CsrOp::Rw, 0, name, rs)
    }

    /// Write rs to the register and return its old value in rd
    pub fn gen_swap_system_register(&mut self, rd: Reg, name: &str, rs: Reg) -> Result<(), GenError> {
        self.gen_csr(CsrOp::Rw, rd, name, rs)
    }

    pub fn gen_set_system_register_bits(&mut self, name: &str, rs: Reg) -> Result<(), GenError> {
        self.gen_csr(CsrOp::Rs, 0, name, rs)
    }

    pub fn gen_clear_system_register_bits(&mut self, name: &str, rs: Reg) -> Result<(), GenError> {
        self.gen_csr(CsrOp::Rc, 0, name, rs)
    }

    // === Memory ===

    pub fn gen_load(&mut self, rd: Reg, base: Reg, offset: i32) -> Result<(), GenError> {
        self.gen_instruction(Instr::Load {
            width: Width::Double,
            rd,
            rs1: base,
            offset,
        })
    }

    pub fn gen_store(&mut self, rs: Reg, base: Reg, offset: i32) -> Result<(), GenError> {
        self.gen_instruction(Instr::Store {
            width: Width::Double,
            rs1: base,
            rs2: rs,
            offset,
        })
    }

    // === Branches ===

    pub fn gen_relative_branch(&mut self, offset: i64) -> Result<(), GenError> {
        self.gen_relative_branch_with_link(0, offset)
    }

    pub fn gen_relative_branch_with_link(&mut self, link: Reg, offset: i64) -> Result<(), GenError> {
        let offset = instrs_to_bytes(self.seq.pc(), offset)?;
        self.gen_instruction(Instr::Jal { rd: link, offset })
    }

    pub fn gen_conditional_branch(
        &mut self,
        rs1: Reg,
        rs2: Reg,
        offset: i64,
        cond: BranchCond,
    ) -> Result<(), GenError> {
        let offset = instrs_to_bytes(self.seq.pc(), offset)?;
        self.gen_instruction(Instr::Branch {
            cond,
            rs1,
            rs2,
            offset,
        })
    }

    /// Offset in instructions from the current PC to `target`. Fails
    /// if it cannot be encoded in `width` bits.
    pub fn get_branch_offset(&self, target: u64, width: u32) -> Result<i64, GenError> {
        let from = self.seq.pc();
        let result = self.seq.branch_offset(from, target, width, BRANCH_SHIFT);
        if result.valid {
            Ok(result.offset)
        } else {
            Err(GenError::InvalidBranchOffset {
                from,
                to: target,
                width,
                offset: result.offset,
            })
        }
    }

    pub fn gen_relative_branch_to_address(&mut self, target: u64) -> Result<(), GenError> {
        let offset = self.get_branch_offset(target, JAL_OFFSET_WIDTH)?;
        self.gen_relative_branch(offset)
    }

    pub fn gen_relative_branch_with_link_to_address(
        &mut self,
        link: Reg,
        target: u64,
    ) -> Result<(), GenError> {
        let offset = self.get_branch_offset(target, JAL_OFFSET_WIDTH)?;
        self.gen_relative_branch_with_link(link, offset)
    }

    /// Jump to the address held in rs (no link)
    pub fn gen_absolute_branch(&mut self, rs: Reg) -> Result<(), GenError> {
        self.gen_instruction(Instr::Jalr {
            rd: 0,
            rs1: rs,
            offset: 0,
        })
    }

    /// Load `target` into scratch and jump to it. Reaches any address,
    /// so it is used wherever the target may be in another memory bank.
    pub fn gen_absolute_branch_to_address(&mut self, scratch: Reg, target: u64) -> Result<(), GenError> {
        self.gen_move_immediate(scratch, target)?;
        self.gen_absolute_branch(scratch)
    }

    /// Return from a subroutine called with `link`
    pub fn gen_return(&mut self, link: Reg) -> Result<(), GenError> {
        self.gen_absolute_branch(link)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::assembly::labels::LabelError;
    use crate::model::SimSequence;

    #[test]
    fn check_label_invariant_holds_for_correct_offsets() {
        let mut seq = SimSequence::new(0);
        seq.set_pc(0x1000);
        let mut asm = AssemblyHelper::new(&mut seq);
        asm.clear_labels("test");
        asm.gen_conditional_branch_to_label(5, 0, 3, BranchCond::Eq, "done")
            .unwrap();
        asm.gen_relative_branch_to_label(2, "done").unwrap();
        asm.gen_add_immediate(5, 5, 1).unwrap();
        asm.add_label("done").unwrap();
        asm.check_labels_resolved().unwrap();
    }

    #[test]
    fn check_label_mismatch_is_fatal() {
        let mut seq = SimSequence::new(0);
        seq.set_pc(0x1000);
        let mut asm = AssemblyHelper::new(&mut seq);
        asm.clear_labels("test");
        asm.gen_relative_branch_to_label(3, "done").unwrap();
        asm.gen_add_immediate(5, 5, 1).unwrap();
        let err = asm.add_label("done").unwrap_err();
        assert_eq!(
            err,
            GenError::Label(LabelError::Mismatch {
                tag: "test".to_string(),
                label: "done".to_string(),
                branch_pc: 0x1000,
                offset: 3,
                expected: 0x1008,
                actual: 0x100c,
            })
        );
    }

    #[test]
    fn check_unreferenced_label_is_fatal() {
        let mut seq = SimSequence::new(0);
        let mut asm = AssemblyHelper::new(&mut seq);
        asm.clear_labels("test");
        assert!(matches!(
            asm.add_label("orphan"),
            Err(GenError::Label(LabelError::Unreferenced { .. }))
        ));
    }

    #[test]
    fn check_branch_to_address() {
        let mut seq = SimSequence::new(0);
        seq.set_pc(0x2000);
        let mut asm = AssemblyHelper::new(&mut seq);
        asm.gen_relative_branch_to_address(0x1000).unwrap();
        assert_eq!(
            seq.instruction_at(0x2000),
            Some(&Instr::Jal {
                rd: 0,
                offset: -0x1000
            })
        );
    }

    #[test]
    fn check_unreachable_branch_target() {
        let mut seq = SimSequence::new(0);
        seq.set_pc(0x8000_0000);
        let asm = AssemblyHelper::new(&mut seq);
        let err = asm.get_branch_offset(0x1000, BRANCH_OFFSET_WIDTH).unwrap_err();
        assert!(matches!(
            err,
            GenError::InvalidBranchOffset {
                from: 0x8000_0000,
                to: 0x1000,
                ..
            }
        ));
    }

    #[test]
    fn check_oversized_branch_reports_addresses() {
        let mut seq = SimSequence::new(0);
        seq.set_pc(0x8000_0000);
        let mut asm = AssemblyHelper::new(&mut seq);
        let offset = 1 << 40;
        assert_eq!(
            asm.gen_relative_branch(offset),
            Err(GenError::InvalidBranchOffset {
                from: 0x8000_0000,
                to: 0x8000_0000 + (1 << 42),
                width: 32,
                offset,
            })
        );
        assert_eq!(
            asm.gen_conditional_branch(5, 6, -offset, BranchCond::Eq).unwrap_err(),
            GenError::InvalidBranchOffset {
                from: 0x8000_0000,
                to: 0x8000_0000u64.wrapping_sub(1 << 42),
                width: 32,
                offset: -offset,
            }
        );
        assert_eq!(seq.instruction_count(), 0);
    }

    #[test]
    fn check_csr_access() {
        let mut seq = SimSequence::new(0);
        let mut asm = AssemblyHelper::new(&mut seq);
        asm.gen_read_system_register(5, "mcause").unwrap();
        asm.gen_write_system_register("mtvec", 6).unwrap();
        assert_eq!(
            asm.gen_read_system_register(5, "nonexistent"),
            Err(GenError::UnknownRegister("nonexistent".to_string()))
        );
        assert_eq!(
            seq.instruction_at(0),
            Some(&Instr::Csr {
                op: CsrOp::Rs,
                rd: 5,
                rs1: 0,
                csr: 0x342
            })
        );
    }
}
