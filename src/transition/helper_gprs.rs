//! Scratch GPRs for state transition code
//!
//! Helpers come from the arbitrary registers (whose values the test
//! does not care about) where possible. When there are not enough,
//! the rest are borrowed from registers whose values matter, and the
//! borrowed values are restored on release.

use log::warn;
use thiserror::Error;

use super::StateTransitionType;
use crate::assembly::AssemblyHelper;
use crate::error::GenError;
use crate::instr::Reg;
use crate::sequence::Sequence;

/// Never handed out: zero, return address and stack pointer
const EXCLUDED_GPRS: [Reg; 3] = [0, 1, 2];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HelperGprError {
    #[error("helper registers acquired twice without a release")]
    DoubleAcquire,
    #[error("boot transition needs {requested} helper registers, {available} arbitrary available")]
    Exhausted { requested: usize, available: usize },
    #[error("helper registers released without being acquired")]
    NotAcquired,
}

#[derive(Debug, Clone)]
pub struct HelperGprSet {
    transition_type: StateTransitionType,
    arbitrary: Vec<Reg>,
    /// Borrowed registers with the values to restore
    borrowed: Vec<(Reg, u64)>,
    /// Registers given a value by this transition
    protected: Vec<Reg>,
    acquired: bool,
}

impl HelperGprSet {
    pub fn new(transition_type: StateTransitionType) -> Self {
        Self {
            transition_type,
            arbitrary: Vec::new(),
            borrowed: Vec::new(),
            protected: Vec::new(),
            acquired: false,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn arbitrary(&self) -> &[Reg] {
        &self.arbitrary
    }

    pub fn borrowed(&self) -> impl Iterator<Item = Reg> + '_ {
        self.borrowed.iter().map(|&(reg, _)| reg)
    }

    /// Keep a register out of later acquisitions, once the
    /// transition has set it
    pub fn protect(&mut self, reg: Reg) {
        if !self.protected.contains(&reg) {
            self.protected.push(reg);
        }
    }

    pub fn excluded(&self) -> Vec<Reg> {
        EXCLUDED_GPRS
            .iter()
            .chain(&self.protected)
            .copied()
            .collect()
    }

    /// Acquire `count` helper registers, arbitrary ones first. With
    /// `validate` set, a boot transition that would have to borrow
    /// fails instead.
    pub fn acquire_helper_gprs<S: Sequence + ?Sized>(
        &mut self,
        seq: &mut S,
        count: usize,
        validate: bool,
    ) -> Result<Vec<Reg>, GenError> {
        if self.acquired {
            return Err(HelperGprError::DoubleAcquire.into());
        }
        let exclude = self.excluded();
        let arbitrary = match seq.arbitrary_gprs(count, &exclude) {
            Some(regs) => regs,
            None => {
                let available = seq.all_arbitrary_gprs(&exclude);
                if validate && self.transition_type == StateTransitionType::Boot {
                    return Err(HelperGprError::Exhausted {
                        requested: count,
                        available: available.len(),
                    }
                    .into());
                }
                let mut exclude = exclude;
                exclude.extend(&available);
                let borrowed = seq.random_gprs(count - available.len(), &exclude)?;
                warn!("borrowing helper registers {borrowed:?}, their values are restored on release");
                for reg in borrowed {
                    let value = seq.gpr_value(reg)?;
                    self.borrowed.push((reg, value));
                }
                available
            }
        };
        self.arbitrary = arbitrary;
        self.acquired = true;
        Ok(self
            .arbitrary
            .iter()
            .copied()
            .chain(self.borrowed())
            .collect())
    }

    /// Release the helpers, emitting code that restores each borrowed
    /// register's original value
    pub fn release_helper_gprs<S: Sequence + ?Sized>(
        &mut self,
        asm: &mut AssemblyHelper<S>,
    ) -> Result<(), GenError> {
        if !self.acquired {
            return Err(HelperGprError::NotAcquired.into());
        }
        for (reg, value) in self.borrowed.drain(..) {
            asm.gen_move_immediate(reg, value)?;
        }
        self.arbitrary.clear();
        self.acquired = false;
        Ok(())
    }
}
