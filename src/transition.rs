//! State transitions
//!
//! A `State` is a list of facts about the machine (register values,
//! memory contents, privilege level, PC) to establish by generated
//! code. `StateTransition` orders the elements, splits them into runs
//! of the same kind and hands each run to the handler registered for
//! that kind.

pub mod helper_gprs;
pub mod riscv;

use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;

use crate::assembly::AssemblyHelper;
use crate::error::GenError;
use crate::instr::Reg;
use crate::privilege::PrivilegeLevel;
use crate::sequence::Sequence;
use helper_gprs::HelperGprSet;

/// Kinds of state element. The declaration order is the order used
/// by `StateTransitionOrderMode::ByStateElementType`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ElementKind {
    Memory,
    VmContext,
    SystemRegister,
    VectorRegister,
    FloatingPointRegister,
    Gpr,
    PrivilegeLevel,
    Pc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateElementData {
    /// 8 bytes at an 8-byte aligned address
    Memory { address: u64, value: u64 },
    SystemRegister { name: String, value: u64 },
    /// One value per 64-bit element, element 0 first
    VectorRegister { index: Reg, values: Vec<u64> },
    Gpr { index: Reg, value: u64 },
    /// One field of a virtual memory control register
    VmContext {
        register: String,
        field: String,
        value: u64,
    },
    PrivilegeLevel(PrivilegeLevel),
    Pc(u64),
    /// Raw 64-bit pattern of an F/D register
    FloatingPointRegister { index: Reg, value: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateElement {
    pub data: StateElementData,
    /// Lower values are processed first in `ByPriority` order
    pub priority: u32,
}

impl StateElement {
    pub fn new(data: StateElementData, priority: u32) -> Self {
        Self { data, priority }
    }

    pub fn kind(&self) -> ElementKind {
        match self.data {
            StateElementData::Memory { .. } => ElementKind::Memory,
            StateElementData::SystemRegister { .. } => ElementKind::SystemRegister,
            StateElementData::VectorRegister { .. } => ElementKind::VectorRegister,
            StateElementData::Gpr { .. } => ElementKind::Gpr,
            StateElementData::VmContext { .. } => ElementKind::VmContext,
            StateElementData::PrivilegeLevel(_) => ElementKind::PrivilegeLevel,
            StateElementData::Pc(_) => ElementKind::Pc,
            StateElementData::FloatingPointRegister { .. } => ElementKind::FloatingPointRegister,
        }
    }

    pub fn system_register(name: &str, value: u64, priority: u32) -> Self {
        Self::new(
            StateElementData::SystemRegister {
                name: name.to_string(),
                value,
            },
            priority,
        )
    }
}

/// Desired machine state, built up element by element
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    elements: Vec<StateElement>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elements(&self) -> &[StateElement] {
        &self.elements
    }

    pub fn add(&mut self, element: StateElement) -> &mut Self {
        self.elements.push(element);
        self
    }

    pub fn add_memory(&mut self, address: u64, value: u64, priority: u32) -> &mut Self {
        self.add(StateElement::new(
            StateElementData::Memory { address, value },
            priority,
        ))
    }

    pub fn add_system_register(&mut self, name: &str, value: u64, priority: u32) -> &mut Self {
        self.add(StateElement::system_register(name, value, priority))
    }

    pub fn add_vector_register(&mut self, index: Reg, values: Vec<u64>, priority: u32) -> &mut Self {
        self.add(StateElement::new(
            StateElementData::VectorRegister { index, values },
            priority,
        ))
    }

    pub fn add_gpr(&mut self, index: Reg, value: u64, priority: u32) -> &mut Self {
        self.add(StateElement::new(
            StateElementData::Gpr { index, value },
            priority,
        ))
    }

    pub fn add_vm_context(
        &mut self,
        register: &str,
        field: &str,
        value: u64,
        priority: u32,
    ) -> &mut Self {
        self.add(StateElement::new(
            StateElementData::VmContext {
                register: register.to_string(),
                field: field.to_string(),
                value,
            },
            priority,
        ))
    }

    pub fn add_privilege_level(&mut self, level: PrivilegeLevel, priority: u32) -> &mut Self {
        self.add(StateElement::new(
            StateElementData::PrivilegeLevel(level),
            priority,
        ))
    }

    pub fn add_pc(&mut self, pc: u64, priority: u32) -> &mut Self {
        self.add(StateElement::new(StateElementData::Pc(pc), priority))
    }

    pub fn add_floating_point_register(
        &mut self,
        index: Reg,
        value: u64,
        priority: u32,
    ) -> &mut Self {
        self.add(StateElement::new(
            StateElementData::FloatingPointRegister { index, value },
            priority,
        ))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StateTransitionType {
    /// Initial state at test start; helper registers cannot be borrowed
    Boot,
    Explicit,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum StateTransitionOrderMode {
    AsSpecified,
    #[default]
    ByStateElementType,
    ByPriority,
}

/// Emits the code establishing state elements of one kind
pub trait StateTransitionHandler<S: Sequence + ?Sized> {
    fn element_kind(&self) -> ElementKind;

    /// Emit the instructions for one element. Returns false, emitting
    /// nothing, if the element is not of this handler's kind.
    fn process_state_element(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        element: &StateElement,
    ) -> Result<bool, GenError>;

    /// Emit the instructions for a run of elements of this handler's
    /// kind. Handlers override this to share set-up between elements.
    fn process_state_elements(
        &mut self,
        asm: &mut AssemblyHelper<S>,
        helpers: &mut HelperGprSet,
        elements: &[StateElement],
    ) -> Result<(), GenError> {
        check_batch(self.element_kind(), elements)?;
        for element in elements {
            self.process_state_element(asm, helpers, element)?;
        }
        Ok(())
    }
}

/// Error unless every element is of the expected kind
pub fn check_batch(expected: ElementKind, elements: &[StateElement]) -> Result<(), GenError> {
    match elements.iter().find(|e| e.kind() != expected) {
        Some(element) => Err(GenError::BatchKindMismatch {
            expected,
            actual: element.kind(),
        }),
        None => Ok(()),
    }
}

/// Orders state elements and dispatches them to the handler
/// registered for their kind
pub struct StateTransition<S: Sequence + ?Sized> {
    handlers: BTreeMap<ElementKind, Box<dyn StateTransitionHandler<S>>>,
    order_mode: StateTransitionOrderMode,
}

impl<S: Sequence + ?Sized> Default for StateTransition<S> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
            order_mode: StateTransitionOrderMode::default(),
        }
    }
}

impl<S: Sequence + ?Sized> StateTransition<S> {
    /// A manager with no handlers registered
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager with a handler for every RISC-V element kind
    pub fn new_riscv() -> Self {
        let mut transition = Self::new();
        for handler in riscv::default_handlers() {
            transition.register_handler(handler);
        }
        transition
    }

    /// Register a handler, replacing any handler of the same kind
    pub fn register_handler(&mut self, handler: Box<dyn StateTransitionHandler<S>>) {
        self.handlers.insert(handler.element_kind(), handler);
    }

    pub fn set_order_mode(&mut self, order_mode: StateTransitionOrderMode) {
        self.order_mode = order_mode;
    }

    fn ordered(&self, state: &State) -> Vec<StateElement> {
        let mut elements = state.elements().to_vec();
        match self.order_mode {
            StateTransitionOrderMode::AsSpecified => {}
            // Both sorts are stable
            StateTransitionOrderMode::ByStateElementType => elements.sort_by_key(|e| e.kind()),
            StateTransitionOrderMode::ByPriority => elements.sort_by_key(|e| e.priority),
        }
        elements
    }

    /// Emit code at the current PC that takes the machine to `state`
    pub fn transition_to_state(
        &mut self,
        seq: &mut S,
        state: &State,
        transition_type: StateTransitionType,
    ) -> Result<(), GenError> {
        debug!(
            "transition ({transition_type:?}) to {} state elements at 0x{:x}",
            state.elements().len(),
            seq.pc()
        );
        let mut helpers = HelperGprSet::new(transition_type);
        let mut asm = AssemblyHelper::new(seq);
        let ordered = self.ordered(state);
        for (kind, batch) in &ordered.into_iter().group_by(|e| e.kind()) {
            let batch: Vec<StateElement> = batch.collect();
            let handler = self
                .handlers
                .get_mut(&kind)
                .ok_or(GenError::NoStateTransitionHandler(kind))?;
            handler.process_state_elements(&mut asm, &mut helpers, &batch)?;
        }
        Ok(())
    }
}
