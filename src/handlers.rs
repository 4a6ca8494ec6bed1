//! Handler classes, routines and the code shared by every handler
//!
//! A handler class (the thing a dispatch-tree leaf names) is made of
//! one or more routines: its main routine, reached from a jump table,
//! and any prerequisite subroutines the main routine calls. Routines
//! are generated once per memory bank and shared by every exception
//! code and privilege level that maps to them.
//!
//! Generated handler code uses seven scratch registers. The
//! privilege-level register holds the level the handler runs at (set
//! by the dispatcher), so shared bodies can pick the right trap CSRs
//! at run time. Subroutines are called with the link register and
//! return a status in `temps[1]`: zero if the fault was fixed, non-zero
//! otherwise.

pub mod access;
pub mod asynchronous;
pub mod page_fault;
pub mod skip;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::assembly::riscv::privilege_tree_len;
use crate::assembly::AssemblyHelper;
use crate::error::GenError;
use crate::instr::{BranchCond, Reg};
use crate::privilege::{PrivilegeLevel, TrapCsrs};
use crate::sequence::Sequence;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HandlerMode {
    /// Scratch registers are clobbered freely and reserved from the
    /// random generator once generation finishes
    #[default]
    Fast,
    /// Scratch registers are saved to a per-level save area on entry
    /// and restored on exit
    Comprehensive,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PagingMode {
    #[default]
    Sv39,
    Sv48,
}

impl PagingMode {
    /// Number of page table levels walked
    pub fn levels(&self) -> u32 {
        match self {
            Self::Sv39 => 3,
            Self::Sv48 => 4,
        }
    }
}

/// Handler named by a leaf of the dispatch tree
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HandlerClass {
    /// Advance the exception return address and return
    SkipInstruction,
    /// Grant access through the matching PMP entry, else skip
    AccessFault,
    /// Repair the faulting page table entry, else skip
    PageFault,
}

impl HandlerClass {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SkipInstruction => "SkipInstruction",
            Self::AccessFault => "AccessFault",
            Self::PageFault => "PageFault",
        }
    }

    pub fn main_routine(&self) -> Routine {
        match self {
            Self::SkipInstruction => Routine::SkipInstruction,
            Self::AccessFault => Routine::AccessFault,
            Self::PageFault => Routine::PageFault,
        }
    }

    /// Subroutines the main routine calls; generated first
    pub fn prerequisites(&self) -> &'static [Routine] {
        match self {
            Self::SkipInstruction => &[],
            Self::AccessFault => &[Routine::PmpFixup],
            Self::PageFault => &[Routine::ClearPageFault],
        }
    }
}

impl fmt::Display for HandlerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Routine {
    SkipInstruction,
    AccessFault,
    PmpFixup,
    PageFault,
    ClearPageFault,
}

impl Routine {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SkipInstruction => "SkipInstruction",
            Self::AccessFault => "AccessFault",
            Self::PmpFixup => "PmpFixup",
            Self::PageFault => "PageFault",
            Self::ClearPageFault => "ClearPageFault",
        }
    }
}

/// Master handler for every interrupt taken to one privilege level
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AsyncHandlerClass {
    /// Clear the pending bit of the interrupt and return
    #[default]
    ClearPending,
    /// Return without touching the interrupt
    Ignore,
}

/// Registers used by generated handler code
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScratchRegisters {
    pub priv_level: Reg,
    pub cause: Reg,
    pub link: Reg,
    pub temps: [Reg; 4],
}

impl ScratchRegisters {
    pub const COUNT: usize = 7;

    /// Assign registers in order: priv_level, cause, link, temps
    pub fn from_slice(regs: &[Reg]) -> Option<Self> {
        match *regs {
            [priv_level, cause, link, t0, t1, t2, t3] => Some(Self {
                priv_level,
                cause,
                link,
                temps: [t0, t1, t2, t3],
            }),
            _ => None,
        }
    }

    pub fn all(&self) -> [Reg; 7] {
        let [t0, t1, t2, t3] = self.temps;
        [self.priv_level, self.cause, self.link, t0, t1, t2, t3]
    }

    /// Status returned by subroutines
    pub fn ret(&self) -> Reg {
        self.temps[1]
    }
}

/// Everything a routine generator needs to know about the handler set
/// it is generating for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    pub scratch: ScratchRegisters,
    pub mode: HandlerMode,
    /// Levels with handler sets, highest first. Shared code selects
    /// between these at run time.
    pub levels: Vec<PrivilegeLevel>,
    pub paging_mode: PagingMode,
}

/// Bytes reserved per level for saved scratch registers
pub const SAVE_AREA_SIZE: u64 = 64;

// Save area layout
const SAVE_PRIV: i32 = 0;
const SAVE_CAUSE: i32 = 8;
const SAVE_LINK: i32 = 16;
const SAVE_T1: i32 = 24;
const SAVE_T2: i32 = 32;
const SAVE_T3: i32 = 40;
const SAVE_T0: i32 = 48;

pub(crate) fn trap_csrs(level: PrivilegeLevel) -> Result<&'static TrapCsrs, GenError> {
    level.trap_csrs().ok_or(GenError::NoTrapSupport(level))
}

/// Save every scratch register to the save area addressed by the
/// level's xscratch, leaving xscratch unchanged. Emits nothing in
/// Fast mode.
pub fn gen_save_scratch_registers<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
    level: PrivilegeLevel,
) -> Result<(), GenError> {
    if ctx.mode == HandlerMode::Fast {
        return Ok(());
    }
    let csrs = trap_csrs(level)?;
    let s = ctx.scratch;
    let [t0, t1, t2, t3] = s.temps;
    asm.gen_swap_system_register(t0, csrs.scratch, t0)?;
    asm.gen_store(s.priv_level, t0, SAVE_PRIV)?;
    asm.gen_store(s.cause, t0, SAVE_CAUSE)?;
    asm.gen_store(s.link, t0, SAVE_LINK)?;
    asm.gen_store(t1, t0, SAVE_T1)?;
    asm.gen_store(t2, t0, SAVE_T2)?;
    asm.gen_store(t3, t0, SAVE_T3)?;
    // t1 = original t0, xscratch = save area again
    asm.gen_swap_system_register(t1, csrs.scratch, t0)?;
    asm.gen_store(t1, t0, SAVE_T0)
}

pub fn exit_len(mode: HandlerMode) -> usize {
    match mode {
        HandlerMode::Fast => 1,
        HandlerMode::Comprehensive => 9,
    }
}

/// Return from a trap taken to `level`, restoring the scratch
/// registers first in Comprehensive mode
pub fn gen_exit<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
    level: PrivilegeLevel,
) -> Result<(), GenError> {
    let csrs = trap_csrs(level)?;
    if ctx.mode == HandlerMode::Comprehensive {
        let s = ctx.scratch;
        let [t0, t1, t2, t3] = s.temps;
        asm.gen_read_system_register(t0, csrs.scratch)?;
        asm.gen_load(s.link, t0, SAVE_LINK)?;
        asm.gen_load(s.cause, t0, SAVE_CAUSE)?;
        asm.gen_load(t1, t0, SAVE_T1)?;
        asm.gen_load(t2, t0, SAVE_T2)?;
        asm.gen_load(t3, t0, SAVE_T3)?;
        asm.gen_load(s.priv_level, t0, SAVE_PRIV)?;
        asm.gen_load(t0, t0, SAVE_T0)?;
    }
    asm.gen_instruction(csrs.ret)
}

/// Trap return for shared handler code, selecting the level from the
/// privilege-level register
pub fn gen_handler_return<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
) -> Result<(), GenError> {
    let s = ctx.scratch;
    asm.gen_privilege_level_instructions(
        &ctx.levels,
        exit_len(ctx.mode),
        s.priv_level,
        s.temps[3],
        |asm, level| gen_exit(asm, ctx, level),
    )
}

pub fn handler_return_len(ctx: &HandlerContext) -> usize {
    privilege_tree_len(ctx.levels.len(), exit_len(ctx.mode))
}

/// Read the running level's xtval into rd
pub fn gen_read_trap_value<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
    rd: Reg,
    scratch: Reg,
) -> Result<(), GenError> {
    asm.gen_privilege_level_instructions(
        &ctx.levels,
        1,
        ctx.scratch.priv_level,
        scratch,
        |asm, level| asm.gen_read_system_register(rd, trap_csrs(level)?.tval),
    )
}

pub fn read_trap_value_len(ctx: &HandlerContext) -> usize {
    privilege_tree_len(ctx.levels.len(), 1)
}

/// Position of the PC in instructions from `start`
pub(crate) fn instr_index<S: Sequence + ?Sized>(asm: &AssemblyHelper<S>, start: u64) -> i64 {
    asm.instructions_since(start) as i64
}

/// Main routine of a handler with a fixup subroutine: call the fixup,
/// and skip the faulting instruction if it could not repair the fault
pub(crate) fn gen_fixup_or_skip<S: Sequence + ?Sized>(
    asm: &mut AssemblyHelper<S>,
    ctx: &HandlerContext,
    routine: Routine,
    fixup: Routine,
    fixup_entry: Option<u64>,
) -> Result<(), GenError> {
    let entry = fixup_entry.ok_or(GenError::MissingRoutine {
        routine: routine.name(),
        prerequisite: fixup.name(),
    })?;
    asm.clear_labels(routine.name());
    let s = ctx.scratch;
    asm.gen_relative_branch_with_link_to_address(s.link, entry)?;
    let skip_len = privilege_tree_len(ctx.levels.len(), 3) as i64;
    asm.gen_conditional_branch_to_label(s.ret(), 0, skip_len + 1, BranchCond::Eq, "fixed")?;
    asm.gen_increment_exception_return_address(s.temps[0], s.priv_level, &ctx.levels)?;
    asm.add_label("fixed")?;
    gen_handler_return(asm, ctx)?;
    asm.check_labels_resolved()
}

#[cfg(test)]
pub(crate) mod tests {

    use super::*;
    use crate::instr::Instr;
    use crate::model::SimSequence;

    pub(crate) fn context(mode: HandlerMode) -> HandlerContext {
        HandlerContext {
            scratch: ScratchRegisters::from_slice(&[20, 21, 22, 23, 24, 25, 26]).unwrap(),
            mode,
            levels: vec![PrivilegeLevel::Machine, PrivilegeLevel::Supervisor],
            paging_mode: PagingMode::Sv39,
        }
    }

    #[test]
    fn check_scratch_registers_from_slice() {
        let s = ScratchRegisters::from_slice(&[3, 4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(s.priv_level, 3);
        assert_eq!(s.ret(), 7);
        assert_eq!(s.all(), [3, 4, 5, 6, 7, 8, 9]);
        assert!(ScratchRegisters::from_slice(&[3, 4]).is_none());
    }

    #[test]
    fn check_save_and_exit_lengths() {
        for mode in [HandlerMode::Fast, HandlerMode::Comprehensive] {
            let ctx = context(mode);
            let mut seq = SimSequence::new(0);
            let mut asm = AssemblyHelper::new(&mut seq);
            gen_exit(&mut asm, &ctx, PrivilegeLevel::Supervisor).unwrap();
            assert_eq!(asm.instructions_since(0), exit_len(mode));
            let start = asm.pc();
            gen_handler_return(&mut asm, &ctx).unwrap();
            assert_eq!(asm.instructions_since(start), handler_return_len(&ctx));
            let start = asm.pc();
            gen_save_scratch_registers(&mut asm, &ctx, PrivilegeLevel::Machine).unwrap();
            let expected = if mode == HandlerMode::Fast { 0 } else { 9 };
            assert_eq!(asm.instructions_since(start), expected);
        }
    }

    #[test]
    fn check_fast_exit_is_trap_return() {
        let ctx = context(HandlerMode::Fast);
        let mut seq = SimSequence::new(0);
        let mut asm = AssemblyHelper::new(&mut seq);
        gen_exit(&mut asm, &ctx, PrivilegeLevel::Machine).unwrap();
        assert_eq!(seq.instruction_at(0), Some(&Instr::Mret));
    }

    #[test]
    fn check_comprehensive_restore_reads_save_area_last() {
        let ctx = context(HandlerMode::Comprehensive);
        let mut seq = SimSequence::new(0);
        let mut asm = AssemblyHelper::new(&mut seq);
        gen_exit(&mut asm, &ctx, PrivilegeLevel::Supervisor).unwrap();
        // t0 (the base of the save area) is restored last, just before sret
        assert_eq!(
            seq.instruction_at(28),
            Some(&Instr::Load {
                width: crate::instr::Width::Double,
                rd: 23,
                rs1: 23,
                offset: 48
            })
        );
        assert_eq!(seq.instruction_at(32), Some(&Instr::Sret));
    }

    #[test]
    fn check_user_level_has_no_trap_csrs() {
        let ctx = context(HandlerMode::Fast);
        let mut seq = SimSequence::new(0);
        let mut asm = AssemblyHelper::new(&mut seq);
        assert_eq!(
            gen_exit(&mut asm, &ctx, PrivilegeLevel::User),
            Err(GenError::NoTrapSupport(PrivilegeLevel::User))
        );
    }
}
