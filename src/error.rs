use thiserror::Error;

use crate::assembly::labels::LabelError;
use crate::instr::EncodeError;
use crate::privilege::{MemoryBank, PrivilegeLevel};
use crate::sequence::SequenceError;
use crate::transition::helper_gprs::HelperGprError;
use crate::transition::ElementKind;

/// Fatal handler-generation errors. None of these are recovered
/// from: a wrong handler would silently corrupt the generated test.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenError {
    #[error("sequence error: {0}")]
    Sequence(SequenceError),
    #[error("label error: {0}")]
    Label(LabelError),
    #[error("helper register error: {0}")]
    HelperGpr(HelperGprError),
    #[error(
        "no valid branch offset from 0x{from:x} to 0x{to:x} in {width} bits (offset {offset})"
    )]
    InvalidBranchOffset {
        from: u64,
        to: u64,
        width: u32,
        offset: i64,
    },
    #[error("privilege level {level} arm emitted {actual} instructions, expected {expected}")]
    ArmLengthMismatch {
        level: PrivilegeLevel,
        expected: usize,
        actual: usize,
    },
    #[error("routine {routine} requires routine {prerequisite}, which has not been generated")]
    MissingRoutine {
        routine: &'static str,
        prerequisite: &'static str,
    },
    #[error("privilege level {0} has no trap handling support")]
    NoTrapSupport(PrivilegeLevel),
    #[error("handler set for privilege level {0} has not been initialised")]
    HandlerSetNotInitialized(PrivilegeLevel),
    #[error("handler assignments for privilege level {0} are frozen once generation starts")]
    HandlerSetFrozen(PrivilegeLevel),
    #[error("no code cursor for memory bank {0}")]
    NoCodeCursor(MemoryBank),
    #[error("jump table at 0x{start:x} filled {actual} bytes, reserved {expected}")]
    JumpTableSize {
        start: u64,
        expected: u64,
        actual: u64,
    },
    #[error("dispatch level {0} has no handler assignments")]
    EmptyDispatchLevel(String),
    #[error("dispatch key {0} cannot be compared with a 12-bit immediate")]
    DispatchKeyRange(u32),
    #[error("trap value field of width {0} cannot be extracted with a 12-bit mask")]
    InvalidSubCodeField(u32),
    #[error("conflicting handler assignment for code {0}")]
    ConflictingAssignment(u32),
    #[error("no state transition handler registered for {0:?} elements")]
    NoStateTransitionHandler(ElementKind),
    #[error("handler for {expected:?} elements given a batch of {actual:?} elements")]
    BatchKindMismatch {
        expected: ElementKind,
        actual: ElementKind,
    },
    #[error("cannot switch privilege level from {from} up to {to} with a trap return")]
    UnsupportedPrivilegeSwitch {
        from: PrivilegeLevel,
        to: PrivilegeLevel,
    },
    #[error("memory state element at 0x{0:x} is not 8-byte aligned")]
    MisalignedMemoryElement(u64),
    #[error("vector register v{index} needs {expected} element values, got {actual}")]
    VectorElementCount {
        index: u32,
        expected: usize,
        actual: usize,
    },
    #[error("unknown register {0}")]
    UnknownRegister(String),
    #[error("no arbitrary register available for an absolute jump to 0x{0:x}")]
    NoJumpRegister(u64),
}

impl From<SequenceError> for GenError {
    fn from(e: SequenceError) -> Self {
        Self::Sequence(e)
    }
}

impl From<LabelError> for GenError {
    fn from(e: LabelError) -> Self {
        Self::Label(e)
    }
}

impl From<HelperGprError> for GenError {
    fn from(e: HelperGprError) -> Self {
        Self::HelperGpr(e)
    }
}

impl From<EncodeError> for GenError {
    fn from(e: EncodeError) -> Self {
        Self::Sequence(SequenceError::Encode(e))
    }
}
