//! RISC-V handler architecture
//!
//! Traps use vectored mode: the vector table holds 16 four-byte
//! slots, synchronous exceptions enter at slot 0 and interrupt n at
//! slot n. Every slot holds a single `jal`, so a table reaches at
//! most 1 MiB; anything further away goes through a stub that loads
//! the absolute address.

use std::collections::BTreeMap;

use crate::arch::{Dispatcher, HandlerArchitecture};
use crate::assembly::AssemblyHelper;
use crate::csr::{field_mask, TVEC_MODE_VECTORED};
use crate::dispatch::{DispatchTrie, HandlerAssignment, SubCodeClass};
use crate::error::GenError;
use crate::handlers::asynchronous::{gen_asynchronous_body, gen_asynchronous_entry};
use crate::handlers::{access, page_fault, skip};
use crate::handlers::{
    gen_save_scratch_registers, instr_index, trap_csrs, AsyncHandlerClass, HandlerClass,
    HandlerContext, HandlerMode, Routine, ScratchRegisters, SAVE_AREA_SIZE,
};
use crate::instr::{BranchCond, Instr, INSTR_LENGTH};
use crate::privilege::{ExceptionCause, MemoryBank, PrivilegeLevel, MAX_EXCEPTION_CODE};
use crate::sequence::{Sequence, SequenceError};
use crate::transition::StateElement;
use crate::utils::{lowest_set_bit, mask};

const VECTOR_SLOTS: u64 = 16;

/// Registers handlers must not use: zero, ra and sp
pub const RESERVED_GPRS: [u32; 3] = [0, 1, 2];

/// t0-t2 and t3-t6, saved and restored by Comprehensive handlers
const COMPREHENSIVE_SCRATCH: [u32; 7] = [5, 6, 7, 28, 29, 30, 31];

/// Dispatches through a table of `jal` instructions
#[derive(Debug, Default, Clone, Copy)]
pub struct TableDispatcher;

impl TableDispatcher {
    /// Load the key of this dispatch level into the cause register
    fn gen_load_key<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        level: PrivilegeLevel,
        sub_code_class: Option<SubCodeClass>,
    ) -> Result<(), GenError> {
        let s = ctx.scratch;
        let csrs = trap_csrs(level)?;
        match sub_code_class {
            None => {
                gen_save_scratch_registers(asm, ctx, level)?;
                asm.gen_add_immediate(s.priv_level, 0, level.value() as i32)?;
                asm.gen_read_system_register(s.cause, csrs.cause)
            }
            Some(SubCodeClass::PreviousPrivilege) => {
                let field = field_mask(csrs.status, &[csrs.previous_privilege])
                    .ok_or_else(|| GenError::UnknownRegister(csrs.status.to_string()))?;
                let shift = lowest_set_bit(field)
                    .ok_or_else(|| GenError::UnknownRegister(csrs.status.to_string()))?;
                asm.gen_read_system_register(s.cause, csrs.status)?;
                asm.gen_shift_right_immediate(s.cause, s.cause, shift)?;
                asm.gen_and_immediate(s.cause, s.cause, (field >> shift) as i32)
            }
            Some(SubCodeClass::TrapValueField { shift, width }) => {
                asm.gen_read_system_register(s.cause, csrs.tval)?;
                asm.gen_shift_right_immediate(s.cause, s.cause, shift)?;
                asm.gen_and_immediate(s.cause, s.cause, mask(width) as i32)
            }
        }
    }

    /// Turn the key in the cause register into a table index. Keys
    /// with no entry select entry 0.
    fn gen_key_to_index<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        keys: &[u32],
    ) -> Result<(), GenError> {
        let s = ctx.scratch;
        let [t0, t1, ..] = s.temps;
        let first = keys.first().copied().unwrap_or(0);
        let contiguous = keys.iter().zip(first..).all(|(&key, expected)| key == expected);

        if contiguous {
            if first != 0 {
                asm.gen_add_immediate(s.cause, s.cause, -(first as i32))?;
            }
            let skip = asm.unique_label("in_range");
            asm.gen_set_less_than_unsigned_immediate(t0, s.cause, keys.len() as i32)?;
            asm.gen_conditional_branch_to_label(t0, 0, 2, BranchCond::Ne, &skip)?;
            asm.gen_add_immediate(s.cause, 0, 0)?;
            asm.add_label(&skip)?;
            return Ok(());
        }

        // Compare chain: t1 = index of the matching key, else 0
        let done = asm.unique_label("key_found");
        let start = asm.pc();
        let chain_len = 1 + 4 * (keys.len() as i64 - 1);
        asm.gen_add_immediate(t1, 0, 0)?;
        for (index, &key) in keys.iter().enumerate().skip(1) {
            let next = asm.unique_label("key_next");
            asm.gen_add_immediate(t0, 0, key as i32)?;
            asm.gen_conditional_branch_to_label(s.cause, t0, 3, BranchCond::Ne, &next)?;
            asm.gen_add_immediate(t1, 0, index as i32)?;
            let offset = chain_len - instr_index(asm, start);
            asm.gen_relative_branch_to_label(offset, &done)?;
            asm.add_label(&next)?;
        }
        asm.add_label(&done)?;
        asm.gen_move_register(s.cause, t1)
    }
}

impl Dispatcher for TableDispatcher {
    fn jump_table_entry_size(&self) -> u64 {
        INSTR_LENGTH
    }

    fn gen_pre_dispatch<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        level: PrivilegeLevel,
        sub_code_class: Option<SubCodeClass>,
        keys: &[u32],
    ) -> Result<(), GenError> {
        asm.clear_labels("Dispatch");
        let s = ctx.scratch;
        let t0 = s.temps[0];
        self.gen_load_key(asm, ctx, level, sub_code_class)?;
        self.gen_key_to_index(asm, ctx, keys)?;
        asm.gen_shift_left_immediate(s.cause, s.cause, 2)?;
        asm.gen_instruction(Instr::Auipc { rd: t0, imm20: 0 })?;
        asm.gen_add_register(t0, t0, s.cause)?;
        // The table starts right after this jalr
        asm.gen_instruction(Instr::Jalr {
            rd: 0,
            rs1: t0,
            offset: 12,
        })?;
        asm.check_labels_resolved()
    }

    fn gen_jump_table_entry<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        target: u64,
    ) -> Result<(), GenError> {
        asm.gen_relative_branch_to_address(target)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RiscvArchitecture {
    dispatcher: TableDispatcher,
}

impl RiscvArchitecture {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HandlerArchitecture for RiscvArchitecture {
    type Dispatcher = TableDispatcher;

    fn dispatcher(&self) -> &TableDispatcher {
        &self.dispatcher
    }

    fn vector_table_size(&self) -> u64 {
        VECTOR_SLOTS * INSTR_LENGTH
    }

    /// Aligned to the table size
    fn vector_base_alignment(&self) -> u64 {
        VECTOR_SLOTS * INSTR_LENGTH
    }

    fn vector_offsets(&self) -> Vec<u64> {
        (0..VECTOR_SLOTS).map(|slot| slot * INSTR_LENGTH).collect()
    }

    fn is_synchronous_vector(&self, offset: u64) -> bool {
        offset == 0
    }

    fn save_area_size(&self, mode: HandlerMode) -> u64 {
        match mode {
            HandlerMode::Fast => 0,
            HandlerMode::Comprehensive => SAVE_AREA_SIZE,
        }
    }

    fn default_synchronous_assignments(
        &self,
        mode: HandlerMode,
        level: PrivilegeLevel,
        bank: MemoryBank,
    ) -> Result<DispatchTrie, GenError> {
        let mut trie = DispatchTrie::new();
        for code in 0..=MAX_EXCEPTION_CODE {
            let cause = ExceptionCause::from_code(code);
            let class = match (mode, cause) {
                (HandlerMode::Comprehensive, Some(c))
                    if c.is_access_fault() && level == PrivilegeLevel::Machine =>
                {
                    HandlerClass::AccessFault
                }
                (HandlerMode::Comprehensive, Some(c)) if c.is_page_fault() => {
                    HandlerClass::PageFault
                }
                _ => HandlerClass::SkipInstruction,
            };
            trie.assign(code, HandlerAssignment::new(class, bank))?;
        }
        Ok(trie)
    }

    /// Fast handlers get registers from the random generator, which
    /// are reserved once generation finishes. Comprehensive handlers
    /// save what they use, so they use the fixed temporaries.
    fn setup_scratch_registers<S: Sequence + ?Sized>(
        &self,
        seq: &mut S,
        mode: HandlerMode,
    ) -> Result<ScratchRegisters, GenError> {
        let regs = match mode {
            HandlerMode::Fast => seq.random_gprs(ScratchRegisters::COUNT, &RESERVED_GPRS)?,
            HandlerMode::Comprehensive => COMPREHENSIVE_SCRATCH.to_vec(),
        };
        ScratchRegisters::from_slice(&regs).ok_or_else(|| {
            GenError::Sequence(SequenceError::NotEnoughRegisters {
                requested: ScratchRegisters::COUNT,
                available: regs.len(),
            })
        })
    }

    fn generate_routine<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        routine: Routine,
        generated: &BTreeMap<Routine, u64>,
    ) -> Result<(), GenError> {
        let entry = |r: Routine| generated.get(&r).copied();
        match routine {
            Routine::SkipInstruction => skip::gen_skip_instruction(asm, ctx),
            Routine::AccessFault => access::gen_access_fault(asm, ctx, entry(Routine::PmpFixup)),
            Routine::PmpFixup => access::gen_pmp_fixup(asm, ctx),
            Routine::PageFault => {
                page_fault::gen_page_fault(asm, ctx, entry(Routine::ClearPageFault))
            }
            Routine::ClearPageFault => page_fault::gen_clear_page_fault(asm, ctx),
        }
    }

    fn generate_asynchronous_handler<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        class: AsyncHandlerClass,
        level: PrivilegeLevel,
    ) -> Result<(), GenError> {
        gen_asynchronous_body(asm, ctx, class, level)
    }

    fn gen_asynchronous_entry<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        level: PrivilegeLevel,
        target: u64,
    ) -> Result<(), GenError> {
        gen_asynchronous_entry(asm, ctx, level, target)
    }

    fn gen_vector_slot<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        target: u64,
    ) -> Result<(), GenError> {
        asm.gen_relative_branch_to_address(target)
    }

    fn gen_far_jump<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        target: u64,
    ) -> Result<(), GenError> {
        asm.gen_absolute_branch_to_address(ctx.scratch.temps[0], target)
    }

    fn boot_state_elements(
        &self,
        level: PrivilegeLevel,
        vector_base: u64,
        save_area: Option<u64>,
    ) -> Result<Vec<StateElement>, GenError> {
        let csrs = trap_csrs(level)?;
        let mut elements = vec![StateElement::system_register(
            csrs.tvec,
            vector_base | TVEC_MODE_VECTORED,
            0,
        )];
        if let Some(save_area) = save_area {
            elements.push(StateElement::system_register(csrs.scratch, save_area, 0));
        }
        Ok(elements)
    }

    fn delegation_state_element(&self, delegated: u64) -> StateElement {
        StateElement::system_register("medeleg", delegated, 0)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dispatch::DispatchNode;
    use crate::handlers::tests::context;
    use crate::instr::ImmOp;
    use crate::model::SimSequence;

    fn pre_dispatch(
        mode: HandlerMode,
        sub_code_class: Option<SubCodeClass>,
        keys: &[u32],
    ) -> SimSequence {
        let ctx = context(mode);
        let mut seq = SimSequence::new(0);
        let mut asm = AssemblyHelper::new(&mut seq);
        TableDispatcher
            .gen_pre_dispatch(&mut asm, &ctx, PrivilegeLevel::Machine, sub_code_class, keys)
            .unwrap();
        seq
    }

    #[test]
    fn check_contiguous_keys_from_zero() {
        let seq = pre_dispatch(HandlerMode::Fast, None, &[0, 1, 2, 3]);
        // addi, csrr, sltiu, bne, addi, slli, auipc, add, jalr
        assert_eq!(seq.instruction_count(), 9);
        assert_eq!(
            seq.instruction_at(32),
            Some(&Instr::Jalr {
                rd: 0,
                rs1: 23,
                offset: 12
            })
        );
    }

    #[test]
    fn check_contiguous_keys_with_offset() {
        let seq = pre_dispatch(HandlerMode::Fast, None, &[12, 13]);
        assert_eq!(seq.instruction_count(), 10);
        assert_eq!(
            seq.instruction_at(8),
            Some(&Instr::OpImm {
                op: ImmOp::Addi,
                rd: 21,
                rs1: 21,
                imm: -12
            })
        );
    }

    #[test]
    fn check_sparse_keys_use_compare_chain() {
        let seq = pre_dispatch(HandlerMode::Fast, None, &[1, 3, 7]);
        // addi, csrr, chain (1 + 2 * 4), mv, slli, auipc, add, jalr
        assert_eq!(seq.instruction_count(), 2 + 9 + 1 + 4);
    }

    #[test]
    fn check_comprehensive_saves_before_dispatch() {
        let fast = pre_dispatch(HandlerMode::Fast, None, &[0, 1]);
        let comprehensive = pre_dispatch(HandlerMode::Comprehensive, None, &[0, 1]);
        assert_eq!(
            comprehensive.instruction_count(),
            fast.instruction_count() + 9
        );
    }

    #[test]
    fn check_previous_privilege_key() {
        let seq = pre_dispatch(
            HandlerMode::Fast,
            Some(SubCodeClass::PreviousPrivilege),
            &[0, 1, 3],
        );
        // mstatus.MPP is bits 12:11
        assert_eq!(
            seq.instruction_at(4),
            Some(&Instr::OpImm {
                op: ImmOp::Srli,
                rd: 21,
                rs1: 21,
                imm: 11
            })
        );
        assert_eq!(
            seq.instruction_at(8),
            Some(&Instr::OpImm {
                op: ImmOp::Andi,
                rd: 21,
                rs1: 21,
                imm: 3
            })
        );
    }

    #[test]
    fn check_default_assignments() {
        let arch = RiscvArchitecture::new();
        let fast = arch
            .default_synchronous_assignments(
                HandlerMode::Fast,
                PrivilegeLevel::Machine,
                MemoryBank::Default,
            )
            .unwrap();
        assert_eq!(fast.root().len(), 16);
        assert!(fast.root().values().all(|node| matches!(
            node,
            DispatchNode::Leaf(a) if a.handler_class == HandlerClass::SkipInstruction
        )));

        let leaf = |trie: &DispatchTrie, code| match trie.get(code) {
            Some(DispatchNode::Leaf(a)) => a.handler_class,
            other => panic!("unexpected {other:?}"),
        };
        let m = arch
            .default_synchronous_assignments(
                HandlerMode::Comprehensive,
                PrivilegeLevel::Machine,
                MemoryBank::Default,
            )
            .unwrap();
        assert_eq!(leaf(&m, 5), HandlerClass::AccessFault);
        assert_eq!(leaf(&m, 13), HandlerClass::PageFault);
        assert_eq!(leaf(&m, 2), HandlerClass::SkipInstruction);
        let s = arch
            .default_synchronous_assignments(
                HandlerMode::Comprehensive,
                PrivilegeLevel::Supervisor,
                MemoryBank::Secure,
            )
            .unwrap();
        assert_eq!(leaf(&s, 5), HandlerClass::SkipInstruction);
        assert_eq!(leaf(&s, 15), HandlerClass::PageFault);
        assert!(s.root().values().all(|node| matches!(
            node,
            DispatchNode::Leaf(a) if a.memory_bank == MemoryBank::Secure
        )));
    }

    #[test]
    fn check_scratch_register_choice() {
        let arch = RiscvArchitecture::new();
        let mut seq = SimSequence::new(3);
        let fixed = arch
            .setup_scratch_registers(&mut seq, HandlerMode::Comprehensive)
            .unwrap();
        assert_eq!(fixed.all(), COMPREHENSIVE_SCRATCH);
        let random = arch
            .setup_scratch_registers(&mut seq, HandlerMode::Fast)
            .unwrap();
        assert!(random.all().iter().all(|r| !RESERVED_GPRS.contains(r)));
    }

    #[test]
    fn check_boot_state_elements() {
        let arch = RiscvArchitecture::new();
        let elements = arch
            .boot_state_elements(PrivilegeLevel::Supervisor, 0x8000_1040, Some(0x8000_2000))
            .unwrap();
        assert_eq!(
            elements,
            vec![
                StateElement::system_register("stvec", 0x8000_1041, 0),
                StateElement::system_register("sscratch", 0x8000_2000, 0),
            ]
        );
        let elements = arch
            .boot_state_elements(PrivilegeLevel::Machine, 0x8000_1000, None)
            .unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(
            arch.boot_state_elements(PrivilegeLevel::User, 0, None),
            Err(GenError::NoTrapSupport(PrivilegeLevel::User))
        );
    }
}
