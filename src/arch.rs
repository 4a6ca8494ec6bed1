//! Architecture hooks used by the handler sets
//!
//! The handler sets own the generation algorithm (which code goes
//! where, jump table reservation and backfill, memoization, bank
//! crossing). Everything that depends on the instruction set goes
//! through these traits.

pub mod riscv;

use std::collections::BTreeMap;

use crate::assembly::AssemblyHelper;
use crate::dispatch::{DispatchTrie, SubCodeClass};
use crate::error::GenError;
use crate::handlers::{AsyncHandlerClass, HandlerContext, HandlerMode, Routine, ScratchRegisters};
use crate::privilege::{MemoryBank, PrivilegeLevel};
use crate::sequence::Sequence;
use crate::transition::StateElement;

/// Emits the code that selects a jump table entry at run time
pub trait Dispatcher {
    /// Bytes per jump table entry
    fn jump_table_entry_size(&self) -> u64;

    /// Emit the code that computes the dispatch key and jumps into the
    /// table that immediately follows it. `sub_code_class` is None at
    /// the top level (dispatch on the exception code). `keys` are the
    /// table's keys in ascending order; entry i belongs to keys[i].
    fn gen_pre_dispatch<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        level: PrivilegeLevel,
        sub_code_class: Option<SubCodeClass>,
        keys: &[u32],
    ) -> Result<(), GenError>;

    /// Emit one jump table entry; exactly `jump_table_entry_size` bytes
    fn gen_jump_table_entry<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        target: u64,
    ) -> Result<(), GenError>;
}

pub trait HandlerArchitecture {
    type Dispatcher: Dispatcher;

    fn dispatcher(&self) -> &Self::Dispatcher;

    /// Bytes occupied by one vector table
    fn vector_table_size(&self) -> u64;

    fn vector_base_alignment(&self) -> u64;

    /// Offsets of the vector slots from the table base
    fn vector_offsets(&self) -> Vec<u64>;

    fn is_synchronous_vector(&self, offset: u64) -> bool;

    /// Bytes of save area a level needs in the given mode
    fn save_area_size(&self, mode: HandlerMode) -> u64;

    /// Assignments used unless overridden, with every handler in `bank`
    fn default_synchronous_assignments(
        &self,
        mode: HandlerMode,
        level: PrivilegeLevel,
        bank: MemoryBank,
    ) -> Result<DispatchTrie, GenError>;

    fn setup_scratch_registers<S: Sequence + ?Sized>(
        &self,
        seq: &mut S,
        mode: HandlerMode,
    ) -> Result<ScratchRegisters, GenError>;

    /// Generate one routine at the current PC. `generated` holds the
    /// entry addresses of routines of the same handler class and bank
    /// generated so far.
    fn generate_routine<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        routine: Routine,
        generated: &BTreeMap<Routine, u64>,
    ) -> Result<(), GenError>;

    fn generate_asynchronous_handler<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        class: AsyncHandlerClass,
        level: PrivilegeLevel,
    ) -> Result<(), GenError>;

    /// Code reached from the interrupt vector slots that transfers
    /// control to the asynchronous handler at `target`
    fn gen_asynchronous_entry<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        level: PrivilegeLevel,
        target: u64,
    ) -> Result<(), GenError>;

    /// Emit one vector slot branching to `target`
    fn gen_vector_slot<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        target: u64,
    ) -> Result<(), GenError>;

    /// Code that reaches `target`, which may be in another memory bank
    fn gen_far_jump<S: Sequence + ?Sized>(
        &self,
        asm: &mut AssemblyHelper<S>,
        ctx: &HandlerContext,
        target: u64,
    ) -> Result<(), GenError>;

    /// State elements that install a level's vector table and, in
    /// Comprehensive mode, its save area
    fn boot_state_elements(
        &self,
        level: PrivilegeLevel,
        vector_base: u64,
        save_area: Option<u64>,
    ) -> Result<Vec<StateElement>, GenError>;

    /// State element delegating the exception codes set in `delegated`
    fn delegation_state_element(&self, delegated: u64) -> StateElement;
}
