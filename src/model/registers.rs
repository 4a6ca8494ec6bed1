use thiserror::Error;

use crate::instr::Reg;

/// Modelled values of the 64-bit integer registers
#[derive(Debug, Default, Clone)]
pub struct Registers {
    registers: [u64; 32],
}

#[derive(Error, PartialEq, Eq, Debug)]
pub enum RegisterError {
    #[error("register index {0} exceeds 31")]
    InvalidRegister(Reg),
}

impl Registers {
    pub fn write(&mut self, which: Reg, value: u64) -> Result<(), RegisterError> {
        if which > 31 {
            Err(RegisterError::InvalidRegister(which))
        } else {
            if which != 0 {
                self.registers[which as usize] = value;
            }
            Ok(())
        }
    }

    pub fn read(&self, which: Reg) -> Result<u64, RegisterError> {
        if which > 31 {
            Err(RegisterError::InvalidRegister(which))
        } else {
            Ok(self.registers[which as usize])
        }
    }
}

/// Parse a GPR name of the form xN (0 <= N <= 31)
pub fn parse_gpr_name(name: &str) -> Option<Reg> {
    let index = name.strip_prefix('x')?.parse::<Reg>().ok()?;
    (index <= 31).then_some(index)
}
