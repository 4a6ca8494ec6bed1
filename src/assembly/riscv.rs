//! RISC-V specific code generation
//!
//! Immediate materialisation (`li`) and privilege-level conditional
//! code. Handler bodies are shared between privilege levels, so any
//! access to a level's trap CSRs goes through a branch tree that
//! compares the runtime privilege-level register against each
//! candidate level in turn.

use crate::assembly::AssemblyHelper;
use crate::error::GenError;
use crate::instr::{BranchCond, ImmOp, Instr, Reg};
use crate::privilege::PrivilegeLevel;
use crate::sequence::Sequence;
use crate::utils::{interpret_i64_as_unsigned, interpret_u64_as_signed, sign_extend};

fn li_recursive(rd: Reg, value: i64, out: &mut Vec<Instr>) {
    if value >= i32::MIN.into() && value <= i32::MAX.into() {
        // lui + addiw; the addiw wraps at 32 bits and sign extends
        let hi20 = ((value.wrapping_add(0x800) >> 12) & 0xf_ffff) as u32;
        let lo12 = sign_extend(interpret_i64_as_unsigned(value) & 0xfff, 12) as i32;
        if hi20 != 0 {
            out.push(Instr::Lui { rd, imm20: hi20 });
        }
        if lo12 != 0 || hi20 == 0 {
            let (op, rs1) = if hi20 != 0 {
                (ImmOp::Addiw, rd)
            } else {
                (ImmOp::Addi, 0)
            };
            out.push(Instr::OpImm {
                op,
                rd,
                rs1,
                imm: lo12,
            });
        }
        return;
    }

    // Materialise the upper bits, shift them into place, then add
    // the low 12 bits
    let lo12 = sign_extend(interpret_i64_as_unsigned(value) & 0xfff, 12);
    let hi52 = interpret_i64_as_unsigned(value).wrapping_add(0x800) >> 12;
    let shift = 12 + hi52.trailing_zeros();
    let hi52 = sign_extend(hi52 >> (shift - 12), 64 - shift);
    li_recursive(rd, hi52, out);
    out.push(Instr::OpImm {
        op: ImmOp::Slli,
        rd,
        rs1: rd,
        imm: shift as i32,
    });
    if lo12 != 0 {
        out.push(Instr::OpImm {
            op: ImmOp::Addi,
            rd,
            rs1: rd,
            imm: lo12 as i32,
        });
    }
}

/// Instructions loading the 64-bit `value` into rd (lui/addiw/slli/addi)
pub fn li_sequence(rd: Reg, value: u64) -> Vec<Instr> {
    let mut out = Vec::new();
    li_recursive(rd, interpret_u64_as_signed(value), &mut out);
    out
}

/// Number of instructions `gen_move_immediate` emits for value
pub fn move_immediate_len(value: u64) -> usize {
    li_sequence(0, value).len()
}

/// Instructions emitted by `gen_privilege_level_instructions` for
/// `levels` candidate levels and arms of `count_per_level`
pub fn privilege_tree_len(levels: usize, count_per_level: usize) -> usize {
    match levels {
        0 => 0,
        1 => count_per_level,
        n => (n - 1) * (count_per_level + 3) + count_per_level,
    }
}

impl<S: Sequence + ?Sized> AssemblyHelper<'_, S> {
    /// Emit one arm of code per privilege level, selected at run time
    /// by the value of `priv_reg`
    ///
    /// For every level but the last, the tree compares `priv_reg` with
    /// the level (using `scratch`), skips the arm if they differ, and
    /// jumps to the end of the tree after the arm. The last level is
    /// the fall-through case and is not compared. `arm` is called once
    /// per level, in order, and must emit exactly `count_per_level`
    /// instructions: the skip offsets are computed from that count.
    pub fn gen_privilege_level_instructions<F>(
        &mut self,
        levels: &[PrivilegeLevel],
        count_per_level: usize,
        priv_reg: Reg,
        scratch: Reg,
        mut arm: F,
    ) -> Result<(), GenError>
    where
        F: FnMut(&mut Self, PrivilegeLevel) -> Result<(), GenError>,
    {
        let end_label = self.unique_label("priv_end");
        let k = count_per_level as i64;
        for (n, &level) in levels.iter().enumerate() {
            let last = n + 1 == levels.len();
            let next_label = self.unique_label("priv_next");
            if !last {
                self.gen_add_immediate(scratch, 0, level.value() as i32)?;
                self.gen_conditional_branch_to_label(
                    priv_reg,
                    scratch,
                    k + 2,
                    BranchCond::Ne,
                    &next_label,
                )?;
            }

            let start = self.pc();
            arm(self, level)?;
            let actual = self.instructions_since(start);
            if actual != count_per_level {
                return Err(GenError::ArmLengthMismatch {
                    level,
                    expected: count_per_level,
                    actual,
                });
            }

            if !last {
                let remaining = levels.len() - n - 1;
                let to_end = privilege_tree_len(remaining, count_per_level) as i64 + 1;
                self.gen_relative_branch_to_label(to_end, &end_label)?;
                self.add_label(&next_label)?;
            }
        }
        if levels.len() > 1 {
            self.add_label(&end_label)?;
        }
        Ok(())
    }

    /// Advance the exception return address of the running handler's
    /// privilege level by one instruction (skip the faulting instruction)
    pub fn gen_increment_exception_return_address(
        &mut self,
        scratch: Reg,
        priv_reg: Reg,
        levels: &[PrivilegeLevel],
    ) -> Result<(), GenError> {
        self.gen_privilege_level_instructions(levels, 3, priv_reg, scratch, |asm, level| {
            let csrs = level.trap_csrs().ok_or(GenError::NoTrapSupport(level))?;
            asm.gen_read_system_register(scratch, csrs.epc)?;
            asm.gen_add_immediate(scratch, scratch, 4)?;
            asm.gen_write_system_register(csrs.epc, scratch)
        })
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::model::SimSequence;

    /// Evaluate an li sequence the way a hart would
    fn run_li(instrs: &[Instr]) -> u64 {
        let mut x: u64 = 0;
        for instr in instrs {
            x = match *instr {
                Instr::Lui { imm20, .. } => {
                    interpret_i64_as_unsigned(sign_extend(u64::from(imm20) << 12, 32))
                }
                Instr::OpImm { op, rs1, imm, .. } => {
                    let src = if rs1 == 0 { 0 } else { x };
                    let imm = interpret_i64_as_unsigned(imm.into());
                    match op {
                        ImmOp::Addi => src.wrapping_add(imm),
                        ImmOp::Addiw => interpret_i64_as_unsigned(sign_extend(
                            src.wrapping_add(imm) & 0xffff_ffff,
                            32,
                        )),
                        ImmOp::Slli => src << imm,
                        _ => panic!("unexpected {instr}"),
                    }
                }
                _ => panic!("unexpected {instr}"),
            };
        }
        x
    }

    #[test]
    fn check_li_values() {
        let values = [
            0,
            1,
            2047,
            0xfff,
            0x800,
            0x1234_5678,
            0x7fff_ffff,
            0x8000_0000,
            0xffff_ffff,
            0xffff_ffff_ffff_ffff,
            0xffff_ffff_8000_0000,
            0x8000_0000_0000_0000,
            0x1_0000_0000,
            0x8000_1000,
            0x1234_5678_9abc_def0,
            0xdead_beef_cafe_f00d,
        ];
        for value in values {
            let seq = li_sequence(5, value);
            assert!(seq.len() <= 8, "{value:x} took {} instructions", seq.len());
            assert_eq!(run_li(&seq), value, "li 0x{value:x}");
            for instr in &seq {
                assert!(instr.encode().is_ok(), "{instr}");
            }
        }
    }

    #[test]
    fn check_li_short_forms() {
        assert_eq!(move_immediate_len(0), 1);
        assert_eq!(move_immediate_len(42), 1);
        assert_eq!(move_immediate_len(0x1000), 1);
        assert_eq!(move_immediate_len(0x1234_5678), 2);
    }

    #[test]
    fn check_privilege_tree_layout() {
        let mut seq = SimSequence::new(0);
        seq.set_pc(0x1000);
        let levels = [PrivilegeLevel::Machine, PrivilegeLevel::Supervisor];
        let mut asm = AssemblyHelper::new(&mut seq);
        asm.gen_increment_exception_return_address(7, 8, &levels)
            .unwrap();
        let len = privilege_tree_len(2, 3);
        assert_eq!(len, 9);
        assert_eq!(seq.pc(), 0x1000 + 4 * len as u64);
        // Compare against M, skip to the S arm if different
        assert_eq!(
            seq.instruction_at(0x1004),
            Some(&Instr::Branch {
                cond: BranchCond::Ne,
                rs1: 8,
                rs2: 7,
                offset: 20
            })
        );
        // Jump from the end of the M arm past the S arm
        assert_eq!(
            seq.instruction_at(0x1014),
            Some(&Instr::Jal { rd: 0, offset: 16 })
        );
    }

    #[test]
    fn check_single_level_tree_has_no_compare() {
        let mut seq = SimSequence::new(0);
        let mut asm = AssemblyHelper::new(&mut seq);
        asm.gen_increment_exception_return_address(7, 8, &[PrivilegeLevel::Machine])
            .unwrap();
        assert_eq!(seq.instruction_count(), 3);
    }

    #[test]
    fn check_arm_length_is_enforced() {
        let mut seq = SimSequence::new(0);
        let mut asm = AssemblyHelper::new(&mut seq);
        let levels = [PrivilegeLevel::Machine, PrivilegeLevel::Supervisor];
        let err = asm
            .gen_privilege_level_instructions(&levels, 2, 8, 7, |asm, level| {
                asm.gen_add_immediate(5, 0, 1)?;
                if level == PrivilegeLevel::Machine {
                    asm.gen_add_immediate(5, 5, 1)?;
                }
                Ok(())
            })
            .unwrap_err();
        assert_eq!(
            err,
            GenError::ArmLengthMismatch {
                level: PrivilegeLevel::Supervisor,
                expected: 2,
                actual: 1
            }
        );
    }
}
