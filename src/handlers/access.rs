//! Access fault handling
//!
//! The fixup subroutine scans the 16 PMP entries for an unlocked,
//! enabled region containing the faulting address and grants R, W
//! and X on it. Only machine mode can touch the PMP CSRs, so this
//! handler is only assigned at that level.

use crate::assembly::AssemblyHelper;
use crate::csr::{pmpaddr_name, pmpcfg_location};
use crate::error::GenError;
use crate::handlers::{
    gen_fixup_or_skip, gen_read_trap_value, instr_index, HandlerContext, Routine,
};
use crate::instr::BranchCond;
use crate::sequence::Sequence;

pub const PMP_ENTRIES: u32 = 16;

// Layout of one entry's check, in instructions from its start
const BLOCK_LEN: i64 = 37;
const NAPOT: i64 = 12;
const NA4: i64 = 22;
const TOR: i64 = 26;
const RANGE: i64 = 30;

const PMP_L: i32 = 0x80;
const PMP_RWX: i32 = 0x7;

pub fn gen_access_fault<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
    pmp_fixup: Option<u64>,
) -> Result<(), GenError> {
    gen_fixup_or_skip(asm, ctx, Routine::AccessFault, Routine::PmpFixup, pmp_fixup)
}

/// Returns 0 in the status register if a PMP entry was opened up
/// for the faulting address, 1 otherwise
pub fn gen_pmp_fixup<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
) -> Result<(), GenError> {
    asm.clear_labels(Routine::PmpFixup.name());
    let s = ctx.scratch;
    let [addr, cfg, t, u] = s.temps;

    gen_read_trap_value(asm, ctx, addr, cfg)?;
    for entry in 0..PMP_ENTRIES {
        let start = asm.pc();
        let next = asm.unique_label("pmp_next");
        let na4 = asm.unique_label("pmp_na4");
        let tor = asm.unique_label("pmp_tor");
        let range = asm.unique_label("pmp_range");
        let (cfg_csr, shift) = pmpcfg_location(entry);
        let pmpaddr = pmpaddr_name(entry);

        asm.gen_read_system_register(cfg, cfg_csr)?;
        asm.gen_shift_right_immediate(cfg, cfg, shift)?;
        asm.gen_and_immediate(cfg, cfg, 0xff)?;
        // Locked entries cannot be changed
        asm.gen_and_immediate(t, cfg, PMP_L)?;
        let offset = BLOCK_LEN - instr_index(asm, start);
        asm.gen_conditional_branch_to_label(t, 0, offset, BranchCond::Ne, &next)?;
        // Address matching mode (A field): OFF, TOR, NA4, NAPOT
        asm.gen_shift_right_immediate(t, cfg, 3)?;
        asm.gen_and_immediate(t, t, 3)?;
        let offset = BLOCK_LEN - instr_index(asm, start);
        asm.gen_conditional_branch_to_label(t, 0, offset, BranchCond::Eq, &next)?;
        asm.gen_add_immediate(u, 0, 1)?;
        let offset = TOR - instr_index(asm, start);
        asm.gen_conditional_branch_to_label(t, u, offset, BranchCond::Eq, &tor)?;
        asm.gen_add_immediate(u, 0, 2)?;
        let offset = NA4 - instr_index(asm, start);
        asm.gen_conditional_branch_to_label(t, u, offset, BranchCond::Eq, &na4)?;

        // NAPOT: trailing ones of pmpaddr encode the size
        debug_assert_eq!(instr_index(asm, start), NAPOT);
        asm.gen_read_system_register(t, &pmpaddr)?;
        asm.gen_add_immediate(u, t, 1)?;
        asm.gen_xor_register(u, u, t)?;
        asm.gen_xor_immediate(cfg, u, -1)?;
        asm.gen_and_register(cfg, cfg, t)?;
        asm.gen_shift_left_immediate(cfg, cfg, 2)?;
        asm.gen_add_immediate(u, u, 1)?;
        asm.gen_shift_left_immediate(u, u, 2)?;
        asm.gen_add_register(u, cfg, u)?;
        let offset = RANGE - instr_index(asm, start);
        asm.gen_relative_branch_to_label(offset, &range)?;

        asm.add_label(&na4)?;
        asm.gen_read_system_register(t, &pmpaddr)?;
        asm.gen_shift_left_immediate(cfg, t, 2)?;
        asm.gen_add_immediate(u, cfg, 4)?;
        let offset = RANGE - instr_index(asm, start);
        asm.gen_relative_branch_to_label(offset, &range)?;

        // TOR: the region starts at the previous entry's address
        asm.add_label(&tor)?;
        if entry == 0 {
            asm.gen_add_immediate(t, 0, 0)?;
        } else {
            asm.gen_read_system_register(t, &pmpaddr_name(entry - 1))?;
        }
        asm.gen_shift_left_immediate(cfg, t, 2)?;
        asm.gen_read_system_register(t, &pmpaddr)?;
        asm.gen_shift_left_immediate(u, t, 2)?;

        // Region is [cfg, u)
        asm.add_label(&range)?;
        let offset = BLOCK_LEN - instr_index(asm, start);
        asm.gen_conditional_branch_to_label(addr, cfg, offset, BranchCond::Ltu, &next)?;
        let offset = BLOCK_LEN - instr_index(asm, start);
        asm.gen_conditional_branch_to_label(addr, u, offset, BranchCond::Geu, &next)?;

        asm.gen_add_immediate(u, 0, PMP_RWX)?;
        asm.gen_shift_left_immediate(u, u, shift)?;
        asm.gen_set_system_register_bits(cfg_csr, u)?;
        asm.gen_add_immediate(s.ret(), 0, 0)?;
        asm.gen_return(s.link)?;

        asm.add_label(&next)?;
    }

    asm.gen_add_immediate(s.ret(), 0, 1)?;
    asm.gen_return(s.link)?;
    asm.check_labels_resolved()
}
