//! Page fault handling
//!
//! The fixup subroutine walks the page table rooted at satp for the
//! faulting address. An invalid entry on the way down is made valid;
//! a leaf gets its access bits (R, W, X, A, D) set, and a superpage
//! leaf also has its low PPN fields cleared so it is aligned. The
//! entry is written back and the TLB flushed. A non-leaf entry at
//! level 0 is malformed and reported as unfixable.
//!
//! The walk uses physical addresses, so the page tables must be
//! identity mapped at the handler's privilege level.

use std::collections::BTreeMap;

use crate::assembly::AssemblyHelper;
use crate::error::GenError;
use crate::handlers::{
    gen_fixup_or_skip, gen_read_trap_value, instr_index, read_trap_value_len, HandlerContext,
    Routine,
};
use crate::instr::{BranchCond, Instr};
use crate::sequence::Sequence;

const PAGE_SHIFT: u32 = 12;
const VPN_BITS: u32 = 9;
const PTE_PPN_SHIFT: u32 = 10;
const PTE_SIZE_SHIFT: u32 = 3;

const PTE_V: i32 = 0x1;
const PTE_RWX: i32 = 0xe;
/// R, W, X, A and D
const PTE_ACCESS: i32 = 0xce;
const PTE_FLAGS: i32 = 0x3ff;

/// Bits of satp above the PPN (MODE and ASID)
const SATP_NON_PPN_BITS: u32 = 20;

/// Instruction index (from the routine start) of each part of the walk
struct Layout {
    level_start: BTreeMap<u32, i64>,
    fail: i64,
    invalid: i64,
    leaf: BTreeMap<u32, i64>,
    writeback: i64,
}

impl Layout {
    fn new(ctx: &HandlerContext) -> Self {
        let top = ctx.paging_mode.levels() - 1;
        let mut pos = read_trap_value_len(ctx) as i64 + 4;
        let mut level_start = BTreeMap::new();
        for level in (0..=top).rev() {
            level_start.insert(level, pos);
            pos += if level > 0 { 11 } else { 10 };
        }
        let fail = pos;
        pos += 2;
        let invalid = pos;
        pos += 2;
        let mut leaf = BTreeMap::new();
        for level in (1..=top).rev() {
            leaf.insert(level, pos);
            pos += 6;
        }
        // The level 0 leaf falls through to the writeback
        leaf.insert(0, pos);
        pos += 1;
        Self {
            level_start,
            fail,
            invalid,
            leaf,
            writeback: pos,
        }
    }

    fn leaf(&self, level: u32) -> i64 {
        self.leaf.get(&level).copied().unwrap_or(self.fail)
    }
}

pub fn gen_page_fault<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
    clear_page_fault: Option<u64>,
) -> Result<(), GenError> {
    gen_fixup_or_skip(
        asm,
        ctx,
        Routine::PageFault,
        Routine::ClearPageFault,
        clear_page_fault,
    )
}

/// Returns 0 in the status register if the faulting entry was
/// repaired, 1 otherwise
pub fn gen_clear_page_fault<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
) -> Result<(), GenError> {
    asm.clear_labels(Routine::ClearPageFault.name());
    let s = ctx.scratch;
    let [vaddr, idx, table, pte] = s.temps;
    let layout = Layout::new(ctx);
    let start = asm.pc();

    let fail = asm.unique_label("pt_fail");
    let invalid = asm.unique_label("pt_invalid");
    let writeback = asm.unique_label("pt_writeback");
    let leaf_labels: BTreeMap<u32, String> = layout
        .leaf
        .keys()
        .map(|&level| (level, asm.unique_label("pt_leaf")))
        .collect();

    gen_read_trap_value(asm, ctx, vaddr, idx)?;
    asm.gen_read_system_register(table, "satp")?;
    asm.gen_shift_left_immediate(table, table, SATP_NON_PPN_BITS)?;
    asm.gen_shift_right_immediate(table, table, SATP_NON_PPN_BITS)?;
    asm.gen_shift_left_immediate(table, table, PAGE_SHIFT)?;

    for (&level, &level_start) in layout.level_start.iter().rev() {
        debug_assert_eq!(instr_index(asm, start), level_start);
        asm.gen_shift_right_immediate(idx, vaddr, PAGE_SHIFT + VPN_BITS * level)?;
        asm.gen_and_immediate(idx, idx, 0x1ff)?;
        asm.gen_shift_left_immediate(idx, idx, PTE_SIZE_SHIFT)?;
        asm.gen_add_register(table, table, idx)?;
        asm.gen_load(pte, table, 0)?;
        asm.gen_and_immediate(idx, pte, PTE_V)?;
        let offset = layout.invalid - instr_index(asm, start);
        asm.gen_conditional_branch_to_label(idx, 0, offset, BranchCond::Eq, &invalid)?;
        asm.gen_and_immediate(idx, pte, PTE_RWX)?;
        let offset = layout.leaf(level) - instr_index(asm, start);
        let leaf_label = leaf_labels.get(&level).unwrap_or(&fail);
        asm.gen_conditional_branch_to_label(idx, 0, offset, BranchCond::Ne, leaf_label)?;
        if level > 0 {
            // Descend to the next table
            asm.gen_shift_right_immediate(table, pte, PTE_PPN_SHIFT)?;
            asm.gen_shift_left_immediate(table, table, PAGE_SHIFT)?;
        } else {
            let offset = layout.fail - instr_index(asm, start);
            asm.gen_relative_branch_to_label(offset, &fail)?;
        }
    }

    asm.add_label(&fail)?;
    asm.gen_add_immediate(s.ret(), 0, 1)?;
    asm.gen_return(s.link)?;

    asm.add_label(&invalid)?;
    asm.gen_or_immediate(pte, pte, PTE_V)?;
    let offset = layout.writeback - instr_index(asm, start);
    asm.gen_relative_branch_to_label(offset, &writeback)?;

    for (&level, label) in leaf_labels.iter().rev() {
        asm.add_label(label)?;
        asm.gen_or_immediate(pte, pte, PTE_ACCESS)?;
        if level > 0 {
            // Clear PPN[level-1:0] of a superpage leaf
            let shift = PTE_PPN_SHIFT + VPN_BITS * level;
            asm.gen_shift_right_immediate(idx, pte, shift)?;
            asm.gen_shift_left_immediate(idx, idx, shift)?;
            asm.gen_and_immediate(pte, pte, PTE_FLAGS)?;
            asm.gen_or_register(pte, pte, idx)?;
            let offset = layout.writeback - instr_index(asm, start);
            asm.gen_relative_branch_to_label(offset, &writeback)?;
        }
    }

    asm.add_label(&writeback)?;
    asm.gen_store(pte, table, 0)?;
    asm.gen_instruction(Instr::SfenceVma { rs1: 0, rs2: 0 })?;
    asm.gen_add_immediate(s.ret(), 0, 0)?;
    asm.gen_return(s.link)?;
    asm.check_labels_resolved()
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::handlers::tests::context;
    use crate::handlers::{HandlerMode, PagingMode};
    use crate::instr::{ImmOp, Width};
    use crate::model::SimSequence;

    fn generate(paging_mode: PagingMode) -> (SimSequence, Layout) {
        let mut ctx = context(HandlerMode::Fast);
        ctx.paging_mode = paging_mode;
        let layout = Layout::new(&ctx);
        let mut seq = SimSequence::new(0);
        let mut asm = AssemblyHelper::new(&mut seq);
        gen_clear_page_fault(&mut asm, &ctx).unwrap();
        (seq, layout)
    }

    #[test]
    fn check_sv39_walk_length() {
        let (seq, layout) = generate(PagingMode::Sv39);
        assert_eq!(seq.instruction_count() as i64, layout.writeback + 4);
        // xtval read for two levels, then the satp decode
        assert_eq!(layout.level_start[&2], 5 + 4);
    }

    #[test]
    fn check_sv48_walk_starts_at_level_3() {
        let (seq, layout) = generate(PagingMode::Sv48);
        let first = 4 * layout.level_start[&3] as u64;
        assert_eq!(
            seq.instruction_at(first),
            Some(&Instr::OpImm {
                op: ImmOp::Srli,
                rd: 24,
                rs1: 23,
                imm: 39
            })
        );
    }

    #[test]
    fn check_superpage_fixup_clears_low_ppn() {
        let (seq, layout) = generate(PagingMode::Sv39);
        let leaf1 = 4 * layout.leaf[&1] as u64;
        assert_eq!(
            seq.instruction_at(leaf1 + 4),
            Some(&Instr::OpImm {
                op: ImmOp::Srli,
                rd: 24,
                rs1: 26,
                imm: 19
            })
        );
        let writeback = 4 * layout.writeback as u64;
        assert_eq!(
            seq.instruction_at(writeback),
            Some(&Instr::Store {
                width: Width::Double,
                rs1: 25,
                rs2: 26,
                offset: 0
            })
        );
    }
}
