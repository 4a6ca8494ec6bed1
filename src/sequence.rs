//! The instruction-generation capability consumed by the handler
//! generator
//!
//! Handler generation does not own the machine model or the output
//! image. It talks to a `Sequence`, which emits instructions at a
//! mutable PC cursor, models privilege and security state, answers
//! register queries and hands out scratch registers. `SimSequence`
//! (in `model`) is an in-memory implementation.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use thiserror::Error;

use crate::csr;
use crate::instr::{EncodeError, Instr, Reg};
use crate::privilege::{PrivilegeLevel, SecurityState};
use crate::utils::fits_signed;

/// Result of a PC-relative offset computation. The offset is in
/// units of `1 << shift` bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BranchOffset {
    pub offset: i64,
    pub valid: bool,
    pub num_halfwords: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterAccess {
    Read,
    Write,
    ReadWrite,
}

/// Requests sent to the runtime backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionRequest {
    UpdateHandlerInfo(BTreeMap<String, String>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("an instruction was already generated at 0x{0:x}")]
    Overwrite(u64),
    #[error("PC 0x{0:x} is not aligned to an instruction boundary")]
    MisalignedPc(u64),
    #[error("{0}")]
    Encode(EncodeError),
    #[error("unknown register {0}")]
    UnknownRegister(String),
    #[error("unknown field(s) {fields:?} of register {register}")]
    UnknownField {
        register: String,
        fields: Vec<String>,
    },
    #[error("GPR index {0} exceeds 31")]
    InvalidGpr(Reg),
    #[error("requested {requested} registers, only {available} available")]
    NotEnoughRegisters { requested: usize, available: usize },
}

impl From<EncodeError> for SequenceError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

pub trait Sequence {
    /// Emit one instruction at the current PC and advance the PC
    fn gen_instruction(&mut self, instr: Instr) -> Result<(), SequenceError>;

    fn pc(&self) -> u64;

    fn set_pc(&mut self, pc: u64);

    fn privilege_level(&self) -> PrivilegeLevel;

    fn set_privilege_level(&mut self, level: PrivilegeLevel);

    fn security_state(&self) -> SecurityState;

    fn set_security_state(&mut self, state: SecurityState);

    /// Offset from `from` to `to` in units of `1 << shift` bytes, and
    /// whether it fits a signed immediate field of `width` bits.
    fn branch_offset(&self, from: u64, to: u64, width: u32, shift: u32) -> BranchOffset {
        let diff = to.wrapping_sub(from) as i64;
        let offset = diff >> shift;
        let aligned = diff & ((1 << shift) - 1) == 0;
        BranchOffset {
            offset,
            valid: aligned && fits_signed(offset, width),
            num_halfwords: diff.unsigned_abs() / 2,
        }
    }

    /// Current modelled value of a GPR (x0-x31) or a CSR, by name
    fn read_register(&self, name: &str) -> Result<u64, SequenceError>;

    fn set_register_value(&mut self, name: &str, value: u64) -> Result<(), SequenceError>;

    fn register_field_mask(&self, name: &str, fields: &[&str]) -> Result<u64, SequenceError> {
        csr::field_mask(name, fields).ok_or_else(|| SequenceError::UnknownField {
            register: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        })
    }

    fn gpr_value(&self, index: Reg) -> Result<u64, SequenceError>;

    /// `count` GPRs the test does not care about, or None if fewer
    /// than `count` are available
    fn arbitrary_gprs(&mut self, count: usize, exclude: &[Reg]) -> Option<Vec<Reg>>;

    fn all_arbitrary_gprs(&self, exclude: &[Reg]) -> Vec<Reg>;

    /// `count` randomly chosen unreserved GPRs (arbitrary or not)
    fn random_gprs(&mut self, count: usize, exclude: &[Reg]) -> Result<Vec<Reg>, SequenceError>;

    /// Remove a GPR from the pool available to random generation
    fn reserve_register(&mut self, index: Reg, access: RegisterAccess)
        -> Result<(), SequenceError>;

    fn exception_request(&mut self, request: ExceptionRequest) -> Result<(), SequenceError>;
}

/// Saves the PC of a sequence and restores it when dropped
///
/// Generation code that emits somewhere other than the current PC
/// (a reserved jump table, another memory bank, a vector table) does
/// so through a guard, so the PC is put back on every exit path,
/// including early returns on error.
pub struct PcGuard<'a, S: Sequence + ?Sized> {
    seq: &'a mut S,
    saved_pc: u64,
}

impl<'a, S: Sequence + ?Sized> PcGuard<'a, S> {
    pub fn new(seq: &'a mut S) -> Self {
        let saved_pc = seq.pc();
        Self { seq, saved_pc }
    }

    /// Save the PC, then move it to `pc`
    pub fn relocate(seq: &'a mut S, pc: u64) -> Self {
        let guard = Self::new(seq);
        guard.seq.set_pc(pc);
        guard
    }

    pub fn saved_pc(&self) -> u64 {
        self.saved_pc
    }
}

impl<S: Sequence + ?Sized> Deref for PcGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &*self.seq
    }
}

impl<S: Sequence + ?Sized> DerefMut for PcGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut *self.seq
    }
}

impl<S: Sequence + ?Sized> Drop for PcGuard<'_, S> {
    fn drop(&mut self) {
        self.seq.set_pc(self.saved_pc);
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::instr::ImmOp;
    use crate::model::SimSequence;

    fn nop() -> Instr {
        Instr::OpImm {
            op: ImmOp::Addi,
            rd: 0,
            rs1: 0,
            imm: 0,
        }
    }

    #[test]
    fn check_branch_offset() {
        let seq = SimSequence::new(0);
        let offset = seq.branch_offset(0x1000, 0x1010, 19, 2);
        assert_eq!(offset.offset, 4);
        assert!(offset.valid);
        assert_eq!(offset.num_halfwords, 8);

        let offset = seq.branch_offset(0x1010, 0x1000, 11, 2);
        assert_eq!(offset.offset, -4);
        assert!(offset.valid);

        // Not a whole number of instructions
        let offset = seq.branch_offset(0x1000, 0x1002, 19, 2);
        assert!(!offset.valid);

        // Out of range for a conditional branch
        let offset = seq.branch_offset(0x1000, 0x1000 + 4 * 1024, 11, 2);
        assert!(!offset.valid);
    }

    #[test]
    fn check_pc_guard_restores_pc() {
        let mut seq = SimSequence::new(0);
        seq.set_pc(0x8000);
        {
            let mut guard = PcGuard::relocate(&mut seq, 0x9000);
            assert_eq!(guard.saved_pc(), 0x8000);
            guard.gen_instruction(nop()).unwrap();
            assert_eq!(guard.pc(), 0x9004);
        }
        assert_eq!(seq.pc(), 0x8000);
    }

    #[test]
    fn check_pc_guard_restores_pc_on_error() {
        let mut seq = SimSequence::new(0);
        seq.set_pc(0x8000);
        seq.gen_instruction(nop()).unwrap();
        let result = (|| -> Result<(), SequenceError> {
            let mut guard = PcGuard::relocate(&mut seq, 0x8000);
            // Overwrites the instruction already at 0x8000
            guard.gen_instruction(nop())?;
            Ok(())
        })();
        assert_eq!(result, Err(SequenceError::Overwrite(0x8000)));
        assert_eq!(seq.pc(), 0x8004);
    }
}
