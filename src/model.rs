//! In-memory reference implementation of `Sequence`
//!
//! `SimSequence` stores every generated instruction in an image keyed
//! by address, models GPR and CSR values, keeps the arbitrary and
//! reserved register ledgers and records the requests sent to the
//! runtime backend. Generating two instructions at the same address is
//! an error, so a missing PC restore in the generator shows up as a
//! hard failure rather than a silently overwritten handler.

pub mod registers;

use std::collections::{BTreeMap, BTreeSet};

use log::trace;

use crate::csr::csr_address;
use crate::instr::{Instr, Reg, INSTR_LENGTH};
use crate::privilege::{PrivilegeLevel, SecurityState};
use crate::sequence::{ExceptionRequest, RegisterAccess, Sequence, SequenceError};
use registers::{parse_gpr_name, Registers};

/// Vector register length used by the model (VLEN = 128)
const DEFAULT_VLENB: u64 = 16;

/// Deterministic xorshift64 generator for register choice
#[derive(Debug, Clone)]
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        // Zero is a fixed point of xorshift
        Self(seed ^ 0x9e37_79b9_7f4a_7c15)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Pick `count` values from candidates without replacement
    fn choose(&mut self, mut candidates: Vec<Reg>, count: usize) -> Vec<Reg> {
        let mut chosen = Vec::with_capacity(count);
        while chosen.len() < count && !candidates.is_empty() {
            let index = (self.next() % candidates.len() as u64) as usize;
            chosen.push(candidates.swap_remove(index));
        }
        chosen
    }
}

#[derive(Debug, Clone)]
pub struct SimSequence {
    pc: u64,
    image: BTreeMap<u64, Instr>,
    gprs: Registers,
    csrs: BTreeMap<String, u64>,
    privilege_level: PrivilegeLevel,
    security_state: SecurityState,
    arbitrary: BTreeSet<Reg>,
    reserved: BTreeMap<Reg, RegisterAccess>,
    rng: XorShift,
    requests: Vec<ExceptionRequest>,
}

impl SimSequence {
    /// A model at PC 0 in machine mode, with x3-x31 arbitrary
    pub fn new(seed: u64) -> Self {
        let mut csrs = BTreeMap::new();
        csrs.insert("vlenb".to_string(), DEFAULT_VLENB);
        Self {
            pc: 0,
            image: BTreeMap::new(),
            gprs: Registers::default(),
            csrs,
            privilege_level: PrivilegeLevel::Machine,
            security_state: SecurityState::NonSecure,
            arbitrary: (3..32).collect(),
            reserved: BTreeMap::new(),
            rng: XorShift::new(seed),
            requests: Vec::new(),
        }
    }

    /// Replace the set of registers the test does not care about
    pub fn set_arbitrary_gprs(&mut self, arbitrary: impl IntoIterator<Item = Reg>) {
        self.arbitrary = arbitrary.into_iter().collect();
    }

    pub fn image(&self) -> &BTreeMap<u64, Instr> {
        &self.image
    }

    pub fn instruction_at(&self, addr: u64) -> Option<&Instr> {
        self.image.get(&addr)
    }

    pub fn instruction_count(&self) -> usize {
        self.image.len()
    }

    /// Instructions in [start, end)
    pub fn instructions_between(&self, start: u64, end: u64) -> Vec<(u64, Instr)> {
        self.image
            .range(start..end)
            .map(|(&addr, &instr)| (addr, instr))
            .collect()
    }

    pub fn reserved_registers(&self) -> &BTreeMap<Reg, RegisterAccess> {
        &self.reserved
    }

    pub fn requests(&self) -> &[ExceptionRequest] {
        &self.requests
    }

    fn unreserved_gprs(&self, exclude: &[Reg]) -> Vec<Reg> {
        (0..32)
            .filter(|r| !exclude.contains(r) && !self.reserved.contains_key(r))
            .collect()
    }
}

impl Sequence for SimSequence {
    fn gen_instruction(&mut self, instr: Instr) -> Result<(), SequenceError> {
        if self.pc % INSTR_LENGTH != 0 {
            return Err(SequenceError::MisalignedPc(self.pc));
        }
        if self.image.contains_key(&self.pc) {
            return Err(SequenceError::Overwrite(self.pc));
        }
        instr.encode()?;
        trace!("0x{:x}: {instr}", self.pc);
        self.image.insert(self.pc, instr);
        self.pc += INSTR_LENGTH;
        Ok(())
    }

    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn privilege_level(&self) -> PrivilegeLevel {
        self.privilege_level
    }

    fn set_privilege_level(&mut self, level: PrivilegeLevel) {
        self.privilege_level = level;
    }

    fn security_state(&self) -> SecurityState {
        self.security_state
    }

    fn set_security_state(&mut self, state: SecurityState) {
        self.security_state = state;
    }

    fn read_register(&self, name: &str) -> Result<u64, SequenceError> {
        if let Some(index) = parse_gpr_name(name) {
            return self.gpr_value(index);
        }
        if csr_address(name).is_none() {
            return Err(SequenceError::UnknownRegister(name.to_string()));
        }
        Ok(self.csrs.get(name).copied().unwrap_or(0))
    }

    fn set_register_value(&mut self, name: &str, value: u64) -> Result<(), SequenceError> {
        if let Some(index) = parse_gpr_name(name) {
            return self
                .gprs
                .write(index, value)
                .map_err(|_| SequenceError::InvalidGpr(index));
        }
        if csr_address(name).is_none() {
            return Err(SequenceError::UnknownRegister(name.to_string()));
        }
        self.csrs.insert(name.to_string(), value);
        Ok(())
    }

    fn gpr_value(&self, index: Reg) -> Result<u64, SequenceError> {
        self.gprs
            .read(index)
            .map_err(|_| SequenceError::InvalidGpr(index))
    }

    fn arbitrary_gprs(&mut self, count: usize, exclude: &[Reg]) -> Option<Vec<Reg>> {
        let candidates = self.all_arbitrary_gprs(exclude);
        if candidates.len() < count {
            return None;
        }
        Some(self.rng.choose(candidates, count))
    }

    fn all_arbitrary_gprs(&self, exclude: &[Reg]) -> Vec<Reg> {
        self.arbitrary
            .iter()
            .copied()
            .filter(|r| !exclude.contains(r) && !self.reserved.contains_key(r))
            .collect()
    }

    fn random_gprs(&mut self, count: usize, exclude: &[Reg]) -> Result<Vec<Reg>, SequenceError> {
        let candidates = self.unreserved_gprs(exclude);
        if candidates.len() < count {
            return Err(SequenceError::NotEnoughRegisters {
                requested: count,
                available: candidates.len(),
            });
        }
        Ok(self.rng.choose(candidates, count))
    }

    fn reserve_register(
        &mut self,
        index: Reg,
        access: RegisterAccess,
    ) -> Result<(), SequenceError> {
        if index > 31 {
            return Err(SequenceError::InvalidGpr(index));
        }
        self.reserved.insert(index, access);
        Ok(())
    }

    fn exception_request(&mut self, request: ExceptionRequest) -> Result<(), SequenceError> {
        self.requests.push(request);
        Ok(())
    }
}
