//! Handlers for one privilege level
//!
//! Assignments are registered first. `generate` then freezes them
//! and, for one security state, emits (at the current PC) the
//! prerequisite subroutines, the synchronous dispatch tree with its
//! handler bodies, the level's asynchronous handler and the entry
//! stub the interrupt vectors branch to.
//!
//! A dispatch level is emitted in two passes. The pre-dispatch code
//! is emitted and space for the jump table reserved; the handler
//! bodies (and nested levels) follow; then the PC is moved back to
//! fill the table in, since only now are the targets known.

use std::collections::BTreeMap;

use log::debug;

use crate::arch::{Dispatcher, HandlerArchitecture};
use crate::assembly::AssemblyHelper;
use crate::dispatch::{DispatchNode, DispatchTrie, HandlerAssignment, SubCodeClass};
use crate::error::GenError;
use crate::handlers::{AsyncHandlerClass, HandlerContext, Routine};
use crate::privilege::{MemoryBank, PrivilegeLevel, SecurityState};
use crate::registry::HandlerRegistry;
use crate::sequence::{PcGuard, Sequence};

/// Everything a generation step needs besides the handler set itself
pub struct GenEnv<'a, A, S: Sequence + ?Sized> {
    pub arch: &'a A,
    pub seq: &'a mut S,
    pub registry: &'a mut HandlerRegistry,
    pub ctx: &'a HandlerContext,
}

/// Entry points produced for one (level, security state)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HandlerEntries {
    /// Start of the top dispatch level
    pub synchronous: u64,
    /// Stub reached from the interrupt vectors
    pub asynchronous: u64,
}

#[derive(Debug, Clone)]
pub struct PrivilegeLevelHandlerSet {
    level: PrivilegeLevel,
    assignments: BTreeMap<SecurityState, DispatchTrie>,
    async_class: Option<AsyncHandlerClass>,
    async_handler: Option<u64>,
    /// None until generation starts
    code_cursors: Option<BTreeMap<MemoryBank, u64>>,
}

impl PrivilegeLevelHandlerSet {
    pub fn new(level: PrivilegeLevel) -> Self {
        Self {
            level,
            assignments: BTreeMap::new(),
            async_class: None,
            async_handler: None,
            code_cursors: None,
        }
    }

    pub fn level(&self) -> PrivilegeLevel {
        self.level
    }

    pub fn assign_synchronous_handlers(
        &mut self,
        state: SecurityState,
        trie: DispatchTrie,
    ) -> Result<(), GenError> {
        if self.code_cursors.is_some() {
            return Err(GenError::HandlerSetFrozen(self.level));
        }
        self.assignments.insert(state, trie);
        Ok(())
    }

    pub fn synchronous_assignments(&self, state: SecurityState) -> Option<&DispatchTrie> {
        self.assignments.get(&state)
    }

    /// Set the master interrupt handler class. Only the first call has
    /// an effect; returns whether this call did.
    pub fn assign_asynchronous_exception_handler(&mut self, class: AsyncHandlerClass) -> bool {
        if self.async_class.is_some() {
            return false;
        }
        self.async_class = Some(class);
        true
    }

    pub fn asynchronous_handler_class(&self) -> AsyncHandlerClass {
        self.async_class.unwrap_or_default()
    }

    /// Next free address of every bank, as seen by this handler set
    pub fn code_cursors(&self) -> Result<&BTreeMap<MemoryBank, u64>, GenError> {
        self.code_cursors
            .as_ref()
            .ok_or(GenError::HandlerSetNotInitialized(self.level))
    }

    /// Generate every handler of this level for one security state at
    /// the current PC. `code_cursors` gives the next free address of
    /// each bank; banks other than the state's default bank are
    /// advanced as code is placed in them (see `code_cursors`).
    pub fn generate<A, S>(
        &mut self,
        env: &mut GenEnv<'_, A, S>,
        state: SecurityState,
        code_cursors: BTreeMap<MemoryBank, u64>,
    ) -> Result<HandlerEntries, GenError>
    where
        A: HandlerArchitecture,
        S: Sequence + ?Sized,
    {
        debug!(
            "generating {} handlers for {state} at 0x{:x}",
            self.level,
            env.seq.pc()
        );
        self.code_cursors = Some(code_cursors);
        if !self.assignments.contains_key(&state) {
            let trie = env.arch.default_synchronous_assignments(
                env.ctx.mode,
                self.level,
                state.default_memory_bank(),
            )?;
            self.assignments.insert(state, trie);
        }
        self.generate_handler_subroutines(env, state)?;
        let synchronous = self.generate_synchronous_handlers(env, state)?;
        self.generate_asynchronous_handler(env, state)?;
        let asynchronous = self.gen_jump_to_asynchronous_handler(env, state)?;
        Ok(HandlerEntries {
            synchronous,
            asynchronous,
        })
    }

    fn trie(&self, state: SecurityState) -> Result<DispatchTrie, GenError> {
        self.code_cursors()?;
        Ok(self.assignments.get(&state).cloned().unwrap_or_default())
    }

    /// Generate the subroutines needed by every handler class assigned
    /// for this state, ahead of the dispatch tree
    pub fn generate_handler_subroutines<A, S>(
        &mut self,
        env: &mut GenEnv<'_, A, S>,
        state: SecurityState,
    ) -> Result<(), GenError>
    where
        A: HandlerArchitecture,
        S: Sequence + ?Sized,
    {
        let trie = self.trie(state)?;
        for node in trie.root().values() {
            for assignment in node.leaves() {
                let class = assignment.handler_class;
                for &routine in class.prerequisites() {
                    self.generate_routine(env, state, *assignment, routine)?;
                }
            }
        }
        Ok(())
    }

    /// Emit the dispatch tree at the current PC; returns its entry
    pub fn generate_synchronous_handlers<A, S>(
        &mut self,
        env: &mut GenEnv<'_, A, S>,
        state: SecurityState,
    ) -> Result<u64, GenError>
    where
        A: HandlerArchitecture,
        S: Sequence + ?Sized,
    {
        let trie = self.trie(state)?;
        let name = format!("{}_{state}_Dispatch", self.level);
        self.generate_dispatch_level(env, state, None, trie.root(), &name)
    }

    fn generate_dispatch_level<A, S>(
        &mut self,
        env: &mut GenEnv<'_, A, S>,
        state: SecurityState,
        sub_code_class: Option<SubCodeClass>,
        children: &BTreeMap<u32, DispatchNode>,
        name: &str,
    ) -> Result<u64, GenError>
    where
        A: HandlerArchitecture,
        S: Sequence + ?Sized,
    {
        // Every level needs at least one table entry
        if children.is_empty() {
            return Err(GenError::EmptyDispatchLevel(name.to_string()));
        }
        let (arch, ctx) = (env.arch, env.ctx);
        let dispatcher = arch.dispatcher();
        let keys: Vec<u32> = children.keys().copied().collect();
        let entry = env.seq.pc();
        {
            let mut asm = AssemblyHelper::new(&mut *env.seq);
            dispatcher.gen_pre_dispatch(&mut asm, ctx, self.level, sub_code_class, &keys)?;
        }

        let table_start = env.seq.pc();
        let table_size = keys.len() as u64 * dispatcher.jump_table_entry_size();
        env.seq.set_pc(table_start + table_size);
        env.registry.record_boundary(
            state.default_memory_bank(),
            name,
            entry,
            table_start + table_size,
        );

        let mut targets = Vec::with_capacity(keys.len());
        for (&key, node) in children {
            let target = match node {
                DispatchNode::Internal {
                    sub_code_class,
                    children,
                } => {
                    let name = format!("{name}_{key}");
                    let sub_code_class = Some(*sub_code_class);
                    self.generate_dispatch_level(env, state, sub_code_class, children, &name)?
                }
                DispatchNode::Leaf(assignment) => self.generate_leaf(env, state, *assignment)?,
            };
            targets.push(target);
        }

        // Backfill the table; the guard puts the PC back after the bodies
        let mut guard = PcGuard::relocate(&mut *env.seq, table_start);
        let mut asm = AssemblyHelper::new(&mut *guard);
        for target in targets {
            dispatcher.gen_jump_table_entry(&mut asm, target)?;
        }
        let actual = asm.pc() - table_start;
        if actual != table_size {
            return Err(GenError::JumpTableSize {
                start: table_start,
                expected: table_size,
                actual,
            });
        }
        Ok(entry)
    }

    /// Entry of the leaf's main routine, reachable with a relative
    /// branch from the current PC
    fn generate_leaf<A, S>(
        &mut self,
        env: &mut GenEnv<'_, A, S>,
        state: SecurityState,
        assignment: HandlerAssignment,
    ) -> Result<u64, GenError>
    where
        A: HandlerArchitecture,
        S: Sequence + ?Sized,
    {
        let class = assignment.handler_class;
        let entry = self.generate_routine(env, state, assignment, class.main_routine())?;
        let default_bank = state.default_memory_bank();
        if assignment.memory_bank == default_bank {
            return Ok(entry);
        }

        // Other banks are only reachable through an absolute jump
        let (arch, ctx) = (env.arch, env.ctx);
        let seq = &mut *env.seq;
        env.registry
            .get_or_generate_trampoline(default_bank, assignment.memory_bank, class, || {
                let start = seq.pc();
                let mut asm = AssemblyHelper::new(&mut *seq);
                arch.gen_far_jump(&mut asm, ctx, entry)?;
                Ok((start, asm.pc()))
            })
    }

    /// Entry of a routine of the assignment's handler class, generated
    /// in the assignment's bank if it has not been already
    fn generate_routine<A, S>(
        &mut self,
        env: &mut GenEnv<'_, A, S>,
        state: SecurityState,
        assignment: HandlerAssignment,
        routine: Routine,
    ) -> Result<u64, GenError>
    where
        A: HandlerArchitecture,
        S: Sequence + ?Sized,
    {
        let HandlerAssignment {
            handler_class: class,
            memory_bank: bank,
        } = assignment;
        let generated = env
            .registry
            .routines(bank, class)
            .cloned()
            .unwrap_or_default();
        let (arch, ctx) = (env.arch, env.ctx);
        let seq = &mut *env.seq;
        let registry = &mut *env.registry;

        if bank == state.default_memory_bank() {
            return registry.get_or_generate(bank, class, routine, || {
                let start = seq.pc();
                let mut asm = AssemblyHelper::new(&mut *seq);
                arch.generate_routine(&mut asm, ctx, routine, &generated)?;
                Ok((start, asm.pc()))
            });
        }

        // Emit at the other bank's cursor and advance only that cursor
        let cursors = self
            .code_cursors
            .as_mut()
            .ok_or(GenError::HandlerSetNotInitialized(self.level))?;
        let cursor = *cursors.get(&bank).ok_or(GenError::NoCodeCursor(bank))?;
        let mut end = cursor;
        let entry = registry.get_or_generate(bank, class, routine, || {
            let mut guard = PcGuard::relocate(&mut *seq, cursor);
            let mut asm = AssemblyHelper::new(&mut *guard);
            arch.generate_routine(&mut asm, ctx, routine, &generated)?;
            end = asm.pc();
            Ok((cursor, end))
        })?;
        cursors.insert(bank, end);
        Ok(entry)
    }

    /// Generate the level's asynchronous handler at the current PC,
    /// once; later calls return the existing entry
    pub fn generate_asynchronous_handler<A, S>(
        &mut self,
        env: &mut GenEnv<'_, A, S>,
        state: SecurityState,
    ) -> Result<u64, GenError>
    where
        A: HandlerArchitecture,
        S: Sequence + ?Sized,
    {
        if let Some(entry) = self.async_handler {
            return Ok(entry);
        }
        let class = self.asynchronous_handler_class();
        let start = env.seq.pc();
        let mut asm = AssemblyHelper::new(&mut *env.seq);
        env.arch
            .generate_asynchronous_handler(&mut asm, env.ctx, class, self.level)?;
        let end = asm.pc();
        env.registry.record_boundary(
            state.default_memory_bank(),
            &format!("{}_AsynchronousHandler", self.level),
            start,
            end,
        );
        self.async_handler = Some(start);
        Ok(start)
    }

    /// Emit, at the current PC, the stub that jumps to the
    /// asynchronous handler; returns the stub's address
    pub fn gen_jump_to_asynchronous_handler<A, S>(
        &mut self,
        env: &mut GenEnv<'_, A, S>,
        state: SecurityState,
    ) -> Result<u64, GenError>
    where
        A: HandlerArchitecture,
        S: Sequence + ?Sized,
    {
        let target = self.async_handler.ok_or(GenError::MissingRoutine {
            routine: "AsynchronousEntry",
            prerequisite: "AsynchronousHandler",
        })?;
        let start = env.seq.pc();
        let mut asm = AssemblyHelper::new(&mut *env.seq);
        env.arch
            .gen_asynchronous_entry(&mut asm, env.ctx, self.level, target)?;
        let end = asm.pc();
        env.registry.record_boundary(
            state.default_memory_bank(),
            &format!("{}_{state}_AsynchronousEntry", self.level),
            start,
            end,
        );
        Ok(start)
    }
}
