//! Handlers for every privilege level of one thread
//!
//! Levels are generated from the most privileged down, each for every
//! security state it supports. For each (level, state) the vector
//! table is placed at the next aligned address of the state's memory
//! bank, the level's handler code follows it, and (in Comprehensive
//! mode) the save area follows the code. All levels share one set of
//! scratch registers and one routine registry, so handler bodies are
//! generated once per memory bank.
//!
//! Once every level is generated, Fast-mode scratch registers are
//! reserved and the handler boundaries of each bank are reported to
//! the runtime backend.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::arch::HandlerArchitecture;
use crate::assembly::AssemblyHelper;
use crate::config::GeneratorConfig;
use crate::dispatch::DispatchTrie;
use crate::error::GenError;
use crate::handler_set::{GenEnv, HandlerEntries, PrivilegeLevelHandlerSet};
use crate::handlers::{AsyncHandlerClass, HandlerContext, HandlerMode, PagingMode, ScratchRegisters};
use crate::privilege::{MemoryBank, PrivilegeLevel, SecurityState};
use crate::registry::HandlerRegistry;
use crate::sequence::{ExceptionRequest, PcGuard, RegisterAccess, Sequence};
use crate::transition::StateElement;
use crate::utils::align_up;

/// Save areas hold doublewords
const SAVE_AREA_ALIGNMENT: u64 = 8;

/// Value of the `Function` key of a bounds report
pub const BOUNDS_REPORT_FUNCTION: &str = "RecordExceptionSpecificAddressBounds";

pub struct ThreadHandlerSet<A: HandlerArchitecture> {
    arch: A,
    mode: HandlerMode,
    paging_mode: PagingMode,
    handler_sets: BTreeMap<PrivilegeLevel, PrivilegeLevelHandlerSet>,
    security_states: BTreeMap<PrivilegeLevel, Vec<SecurityState>>,
    /// Next free address of each memory bank
    code_cursors: BTreeMap<MemoryBank, u64>,
    vector_bases: BTreeMap<(PrivilegeLevel, SecurityState), u64>,
    save_areas: BTreeMap<(PrivilegeLevel, SecurityState), u64>,
    entries: BTreeMap<(PrivilegeLevel, SecurityState), HandlerEntries>,
    /// Exception codes delegated to S level, as a medeleg bit set
    delegated: u64,
    registry: HandlerRegistry,
    scratch: Option<ScratchRegisters>,
}

impl<A: HandlerArchitecture> ThreadHandlerSet<A> {
    /// Handler sets for `levels` in the NonSecure state, with code
    /// placed from the given bank bases
    pub fn new(
        arch: A,
        mode: HandlerMode,
        paging_mode: PagingMode,
        levels: &[PrivilegeLevel],
        bank_bases: impl IntoIterator<Item = (MemoryBank, u64)>,
    ) -> Result<Self, GenError> {
        let mut handler_sets = BTreeMap::new();
        let mut security_states = BTreeMap::new();
        for &level in levels {
            if level.trap_csrs().is_none() {
                return Err(GenError::NoTrapSupport(level));
            }
            handler_sets.insert(level, PrivilegeLevelHandlerSet::new(level));
            security_states.insert(level, vec![SecurityState::NonSecure]);
        }
        Ok(Self {
            arch,
            mode,
            paging_mode,
            handler_sets,
            security_states,
            code_cursors: bank_bases.into_iter().collect(),
            vector_bases: BTreeMap::new(),
            save_areas: BTreeMap::new(),
            entries: BTreeMap::new(),
            delegated: 0,
            registry: HandlerRegistry::new(),
            scratch: None,
        })
    }

    /// Handler sets as configured, with assignment overrides applied
    /// on top of the architecture defaults
    pub fn from_config(arch: A, config: &GeneratorConfig) -> Result<Self, GenError> {
        let mut set = Self::new(
            arch,
            config.handler_mode,
            config.paging_mode,
            &config.privilege_levels,
            config.bank_bases(),
        )?;
        set.delegated = config.medeleg();
        for &level in &config.privilege_levels {
            let states = config.security_states(level);
            for &state in &states {
                let overrides: Vec<_> = config
                    .assignments
                    .iter()
                    .filter(|a| a.applies_to(level, state))
                    .collect();
                if overrides.is_empty() {
                    continue;
                }
                let mut trie = set.arch.default_synchronous_assignments(
                    set.mode,
                    level,
                    state.default_memory_bank(),
                )?;
                for assignment in overrides {
                    assignment.apply(&mut trie, state)?;
                }
                set.assign_synchronous_handlers(level, state, trie)?;
            }
            set.security_states.insert(level, states);
            set.assign_asynchronous_exception_handler(level, config.asynchronous_handler)?;
        }
        Ok(set)
    }

    fn handler_set_mut(
        &mut self,
        level: PrivilegeLevel,
    ) -> Result<&mut PrivilegeLevelHandlerSet, GenError> {
        self.handler_sets
            .get_mut(&level)
            .ok_or(GenError::HandlerSetNotInitialized(level))
    }

    /// Replace the synchronous assignments of one (level, state),
    /// adding the state to the level if it is new
    pub fn assign_synchronous_handlers(
        &mut self,
        level: PrivilegeLevel,
        state: SecurityState,
        trie: DispatchTrie,
    ) -> Result<(), GenError> {
        self.handler_set_mut(level)?
            .assign_synchronous_handlers(state, trie)?;
        let states = self.security_states.entry(level).or_default();
        if !states.contains(&state) {
            states.push(state);
        }
        Ok(())
    }

    /// See `PrivilegeLevelHandlerSet::assign_asynchronous_exception_handler`
    pub fn assign_asynchronous_exception_handler(
        &mut self,
        level: PrivilegeLevel,
        class: AsyncHandlerClass,
    ) -> Result<bool, GenError> {
        Ok(self
            .handler_set_mut(level)?
            .assign_asynchronous_exception_handler(class))
    }

    pub fn set_delegated_exceptions(&mut self, delegated: u64) {
        self.delegated = delegated;
    }

    pub fn mode(&self) -> HandlerMode {
        self.mode
    }

    /// Configured levels, most privileged first
    pub fn levels(&self) -> Vec<PrivilegeLevel> {
        self.handler_sets.keys().rev().copied().collect()
    }

    pub fn security_states(&self, level: PrivilegeLevel) -> &[SecurityState] {
        self.security_states
            .get(&level)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn handler_set(&self, level: PrivilegeLevel) -> Option<&PrivilegeLevelHandlerSet> {
        self.handler_sets.get(&level)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn scratch_registers(&self) -> Option<ScratchRegisters> {
        self.scratch
    }

    pub fn code_cursor(&self, bank: MemoryBank) -> Option<u64> {
        self.code_cursors.get(&bank).copied()
    }

    pub fn vector_base(&self, level: PrivilegeLevel, state: SecurityState) -> Option<u64> {
        self.vector_bases.get(&(level, state)).copied()
    }

    pub fn save_area(&self, level: PrivilegeLevel, state: SecurityState) -> Option<u64> {
        self.save_areas.get(&(level, state)).copied()
    }

    pub fn entries(&self, level: PrivilegeLevel, state: SecurityState) -> Option<HandlerEntries> {
        self.entries.get(&(level, state)).copied()
    }

    /// Generate every handler. The sequence's PC, privilege level and
    /// security state are left as they were, whether or not
    /// generation succeeds.
    pub fn generate<S: Sequence + ?Sized>(&mut self, seq: &mut S) -> Result<(), GenError> {
        let level = seq.privilege_level();
        let state = seq.security_state();
        let result = self.generate_levels(seq);
        seq.set_privilege_level(level);
        seq.set_security_state(state);
        result?;

        if let (HandlerMode::Fast, Some(scratch)) = (self.mode, self.scratch) {
            for reg in scratch.all() {
                seq.reserve_register(reg, RegisterAccess::ReadWrite)?;
            }
        }
        self.report_bounds(seq)?;
        info!(
            "generated handlers for levels {:?}, banks end at {:x?}",
            self.levels(),
            self.code_cursors
        );
        Ok(())
    }

    fn generate_levels<S: Sequence + ?Sized>(&mut self, seq: &mut S) -> Result<(), GenError> {
        let mut guard = PcGuard::new(seq);
        let seq = &mut *guard;
        let scratch = self.arch.setup_scratch_registers(seq, self.mode)?;
        debug!("scratch registers {:?}", scratch.all());
        self.scratch = Some(scratch);
        let ctx = HandlerContext {
            scratch,
            mode: self.mode,
            levels: self.levels(),
            paging_mode: self.paging_mode,
        };
        for level in self.levels() {
            for state in self.security_states(level).to_vec() {
                seq.set_privilege_level(level);
                seq.set_security_state(state);
                self.generate_level(seq, &ctx, level, state)?;
            }
        }
        Ok(())
    }

    fn generate_level<S: Sequence + ?Sized>(
        &mut self,
        seq: &mut S,
        ctx: &HandlerContext,
        level: PrivilegeLevel,
        state: SecurityState,
    ) -> Result<(), GenError> {
        let bank = state.default_memory_bank();
        let cursor = self.code_cursor(bank).ok_or(GenError::NoCodeCursor(bank))?;
        let vector_base = align_up(cursor, self.arch.vector_base_alignment());
        let table_end = vector_base + self.arch.vector_table_size();
        debug!("{level} {state} vector table at 0x{vector_base:x}");
        seq.set_pc(table_end);

        let handler_set = self
            .handler_sets
            .get_mut(&level)
            .ok_or(GenError::HandlerSetNotInitialized(level))?;
        let mut env = GenEnv {
            arch: &self.arch,
            seq: &mut *seq,
            registry: &mut self.registry,
            ctx,
        };
        let entries = handler_set.generate(&mut env, state, self.code_cursors.clone())?;
        for (&other, &next) in handler_set.code_cursors()? {
            if other != bank {
                self.code_cursors.insert(other, next);
            }
        }

        {
            let mut guard = PcGuard::relocate(&mut *seq, vector_base);
            let mut asm = AssemblyHelper::new(&mut *guard);
            for offset in self.arch.vector_offsets() {
                let target = if self.arch.is_synchronous_vector(offset) {
                    entries.synchronous
                } else {
                    entries.asynchronous
                };
                asm.seq().set_pc(vector_base + offset);
                self.arch.gen_vector_slot(&mut asm, target)?;
            }
        }
        self.registry.record_boundary(
            bank,
            &format!("{level}_{state}_VectorTable"),
            vector_base,
            table_end,
        );

        let mut next = seq.pc();
        let save_area_size = self.arch.save_area_size(self.mode);
        if save_area_size > 0 {
            let save_area = align_up(next, SAVE_AREA_ALIGNMENT);
            self.save_areas.insert((level, state), save_area);
            next = save_area + save_area_size;
        }
        self.code_cursors.insert(bank, next);
        self.vector_bases.insert((level, state), vector_base);
        self.entries.insert((level, state), entries);
        Ok(())
    }

    /// One handler-info request per memory bank with generated code
    fn report_bounds<S: Sequence + ?Sized>(&self, seq: &mut S) -> Result<(), GenError> {
        for bank in self.registry.banks() {
            let info = BTreeMap::from([
                (format!("{bank}_bounds"), self.registry.bounds_report(bank)),
                ("Function".to_string(), BOUNDS_REPORT_FUNCTION.to_string()),
            ]);
            seq.exception_request(ExceptionRequest::UpdateHandlerInfo(info))?;
        }
        Ok(())
    }

    /// State elements that install the NonSecure handlers of every
    /// level and the exception delegation at boot
    pub fn boot_state_elements(&self) -> Result<Vec<StateElement>, GenError> {
        let mut elements = Vec::new();
        for level in self.levels() {
            let key = (level, SecurityState::NonSecure);
            let vector_base = self
                .vector_bases
                .get(&key)
                .copied()
                .ok_or(GenError::HandlerSetNotInitialized(level))?;
            let save_area = self.save_areas.get(&key).copied();
            elements.extend(
                self.arch
                    .boot_state_elements(level, vector_base, save_area)?,
            );
        }
        if self.delegated != 0 {
            elements.push(self.arch.delegation_state_element(self.delegated));
        }
        Ok(elements)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::arch::riscv::RiscvArchitecture;
    use crate::handlers::HandlerClass;
    use crate::instr::Instr;
    use crate::model::SimSequence;
    use crate::transition::StateElementData;

    fn generated(config: &GeneratorConfig) -> (ThreadHandlerSet<RiscvArchitecture>, SimSequence) {
        let mut set = ThreadHandlerSet::from_config(RiscvArchitecture::new(), config).unwrap();
        let mut seq = SimSequence::new(config.seed);
        seq.set_pc(config.boot_address);
        set.generate(&mut seq).unwrap();
        (set, seq)
    }

    #[test]
    fn check_levels_generated_in_order() {
        let (set, seq) = generated(&GeneratorConfig::default());
        let m = set
            .vector_base(PrivilegeLevel::Machine, SecurityState::NonSecure)
            .unwrap();
        let s = set
            .vector_base(PrivilegeLevel::Supervisor, SecurityState::NonSecure)
            .unwrap();
        assert_eq!(m, 0x8000_1000);
        assert!(s > m);
        assert_eq!(s % 64, 0);
        // Slot 0 enters the dispatcher right after the table
        assert_eq!(
            seq.instruction_at(m),
            Some(&Instr::Jal { rd: 0, offset: 64 })
        );
        // Every interrupt slot reaches the same entry stub
        let entries = set
            .entries(PrivilegeLevel::Machine, SecurityState::NonSecure)
            .unwrap();
        for slot in 1..16 {
            let addr = m + slot * 4;
            let offset = (entries.asynchronous - addr) as i32;
            assert_eq!(seq.instruction_at(addr), Some(&Instr::Jal { rd: 0, offset }));
        }
    }

    #[test]
    fn check_sequence_state_restored() {
        let config = GeneratorConfig::default();
        let mut set = ThreadHandlerSet::from_config(RiscvArchitecture::new(), &config).unwrap();
        let mut seq = SimSequence::new(0);
        seq.set_pc(0x4000);
        seq.set_privilege_level(PrivilegeLevel::Supervisor);
        set.generate(&mut seq).unwrap();
        assert_eq!(seq.pc(), 0x4000);
        assert_eq!(seq.privilege_level(), PrivilegeLevel::Supervisor);
        assert_eq!(seq.security_state(), SecurityState::NonSecure);
    }

    #[test]
    fn check_fast_scratch_reserved_after_generation() {
        let (set, seq) = generated(&GeneratorConfig::default());
        let scratch = set.scratch_registers().unwrap();
        for reg in scratch.all() {
            assert_eq!(
                seq.reserved_registers().get(&reg),
                Some(&RegisterAccess::ReadWrite)
            );
        }

        let config = GeneratorConfig {
            handler_mode: HandlerMode::Comprehensive,
            ..GeneratorConfig::default()
        };
        let (_, seq) = generated(&config);
        assert!(seq.reserved_registers().is_empty());
    }

    #[test]
    fn check_skip_handler_shared_by_levels() {
        let (set, _) = generated(&GeneratorConfig::default());
        let skips = set
            .registry()
            .boundaries(MemoryBank::Default)
            .iter()
            .filter(|b| b.name == "SkipInstruction")
            .count();
        assert_eq!(skips, 1);
    }

    #[test]
    fn check_bounds_reported_per_bank() {
        let config = GeneratorConfig {
            secure_levels: vec![PrivilegeLevel::Machine],
            ..GeneratorConfig::default()
        };
        let (set, seq) = generated(&config);
        let secure = set
            .vector_base(PrivilegeLevel::Machine, SecurityState::Secure)
            .unwrap();
        assert_eq!(secure, config.secure_bank_base);
        assert_eq!(seq.requests().len(), 2);
        let ExceptionRequest::UpdateHandlerInfo(info) = &seq.requests()[1];
        assert_eq!(info["Function"], BOUNDS_REPORT_FUNCTION);
        assert_eq!(
            info["Secure_bounds"],
            set.registry().bounds_report(MemoryBank::Secure)
        );
        assert!(info["Secure_bounds"].contains("M_Secure_VectorTable:0x90000000:0x90000040"));
    }

    #[test]
    fn check_boot_state() {
        let config = GeneratorConfig {
            handler_mode: HandlerMode::Comprehensive,
            delegated_exceptions: vec![12, 13, 15],
            ..GeneratorConfig::default()
        };
        let (set, _) = generated(&config);
        let elements = set.boot_state_elements().unwrap();
        let names: Vec<&str> = elements
            .iter()
            .filter_map(|e| match &e.data {
                StateElementData::SystemRegister { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["mtvec", "mscratch", "stvec", "sscratch", "medeleg"]);
        let save_area = set
            .save_area(PrivilegeLevel::Machine, SecurityState::NonSecure)
            .unwrap();
        assert_eq!(save_area % 8, 0);
        assert_eq!(
            elements[1],
            StateElement::system_register("mscratch", save_area, 0)
        );
        assert_eq!(
            elements[4],
            StateElement::system_register("medeleg", 0xb000, 0)
        );
    }

    #[test]
    fn check_override_moves_handler_to_secure_bank() {
        let config = GeneratorConfig::from_toml_str(
            r#"
            [[assignments]]
            level = "M"
            code = 2
            handler = "SkipInstruction"
            bank = "Secure"
            "#,
        )
        .unwrap();
        let (set, _) = generated(&config);
        let entry = set
            .registry()
            .routine_entry(
                MemoryBank::Secure,
                HandlerClass::SkipInstruction,
                crate::handlers::Routine::SkipInstruction,
            )
            .unwrap();
        assert_eq!(entry, config.secure_bank_base);
        assert!(set.code_cursor(MemoryBank::Secure).unwrap() > entry);
    }

    #[test]
    fn check_level_without_trap_support() {
        assert_eq!(
            ThreadHandlerSet::new(
                RiscvArchitecture::new(),
                HandlerMode::Fast,
                PagingMode::Sv39,
                &[PrivilegeLevel::User],
                [(MemoryBank::Default, 0)],
            )
            .err(),
            Some(GenError::NoTrapSupport(PrivilegeLevel::User))
        );
    }
}
