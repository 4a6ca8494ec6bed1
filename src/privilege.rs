//! Privilege levels, security states, memory banks and trap causes
//!
//! References to the privileged spec refer to version 20211203.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::instr::Instr;

/// Architectural privilege level. The discriminant is the encoding
/// used in mstatus.MPP and in the generated privilege-level register.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrivilegeLevel {
    #[serde(rename = "U")]
    User = 0,
    #[serde(rename = "S")]
    Supervisor = 1,
    #[serde(rename = "M")]
    Machine = 3,
}

/// The CSRs and return instruction used by a trap handler running
/// at one privilege level
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TrapCsrs {
    pub status: &'static str,
    pub tvec: &'static str,
    pub scratch: &'static str,
    pub epc: &'static str,
    pub cause: &'static str,
    pub tval: &'static str,
    pub ip: &'static str,
    /// Name of the status field holding the previous privilege level
    pub previous_privilege: &'static str,
    pub ret: Instr,
}

const MACHINE_TRAP_CSRS: TrapCsrs = TrapCsrs {
    status: "mstatus",
    tvec: "mtvec",
    scratch: "mscratch",
    epc: "mepc",
    cause: "mcause",
    tval: "mtval",
    ip: "mip",
    previous_privilege: "MPP",
    ret: Instr::Mret,
};

const SUPERVISOR_TRAP_CSRS: TrapCsrs = TrapCsrs {
    status: "sstatus",
    tvec: "stvec",
    scratch: "sscratch",
    epc: "sepc",
    cause: "scause",
    tval: "stval",
    ip: "sip",
    previous_privilege: "SPP",
    ret: Instr::Sret,
};

impl PrivilegeLevel {
    pub fn value(&self) -> u32 {
        *self as u32
    }

    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::User),
            1 => Some(Self::Supervisor),
            3 => Some(Self::Machine),
            _ => None,
        }
    }

    /// Trap-handling CSRs of this level. User mode has no trap
    /// handling (the N extension is not supported).
    pub fn trap_csrs(&self) -> Option<&'static TrapCsrs> {
        match self {
            Self::Machine => Some(&MACHINE_TRAP_CSRS),
            Self::Supervisor => Some(&SUPERVISOR_TRAP_CSRS),
            Self::User => None,
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            Self::User => "U",
            Self::Supervisor => "S",
            Self::Machine => "M",
        }
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// Security state, orthogonal to privilege level
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SecurityState {
    NonSecure,
    Secure,
}

impl SecurityState {
    /// Memory bank holding the handlers of this security state
    /// unless an assignment says otherwise
    pub fn default_memory_bank(&self) -> MemoryBank {
        match self {
            Self::NonSecure => MemoryBank::Default,
            Self::Secure => MemoryBank::Secure,
        }
    }
}

impl fmt::Display for SecurityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonSecure => write!(f, "NonSecure"),
            Self::Secure => write!(f, "Secure"),
        }
    }
}

/// Region of the address space with its own code cursor
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum MemoryBank {
    #[default]
    Default,
    Secure,
}

impl MemoryBank {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::Secure => "Secure",
        }
    }
}

impl fmt::Display for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Synchronous exceptions (privileged spec, table 3.6)
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExceptionCause {
    InstructionAddressMisaligned,
    InstructionAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned,
    LoadAccessFault,
    StoreAddressMisaligned,
    StoreAccessFault,
    UmodeEcall,
    SmodeEcall,
    MmodeEcall,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
}

impl ExceptionCause {
    pub const ALL: [Self; 14] = [
        Self::InstructionAddressMisaligned,
        Self::InstructionAccessFault,
        Self::IllegalInstruction,
        Self::Breakpoint,
        Self::LoadAddressMisaligned,
        Self::LoadAccessFault,
        Self::StoreAddressMisaligned,
        Self::StoreAccessFault,
        Self::UmodeEcall,
        Self::SmodeEcall,
        Self::MmodeEcall,
        Self::InstructionPageFault,
        Self::LoadPageFault,
        Self::StorePageFault,
    ];

    /// The value of the xcause CSR for this exception
    pub fn code(&self) -> u32 {
        match self {
            Self::InstructionAddressMisaligned => 0,
            Self::InstructionAccessFault => 1,
            Self::IllegalInstruction => 2,
            Self::Breakpoint => 3,
            Self::LoadAddressMisaligned => 4,
            Self::LoadAccessFault => 5,
            Self::StoreAddressMisaligned => 6,
            Self::StoreAccessFault => 7,
            Self::UmodeEcall => 8,
            Self::SmodeEcall => 9,
            Self::MmodeEcall => 11,
            Self::InstructionPageFault => 12,
            Self::LoadPageFault => 13,
            Self::StorePageFault => 15,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|cause| cause.code() == code)
    }

    pub fn is_access_fault(&self) -> bool {
        matches!(
            self,
            Self::InstructionAccessFault | Self::LoadAccessFault | Self::StoreAccessFault
        )
    }

    pub fn is_page_fault(&self) -> bool {
        matches!(
            self,
            Self::InstructionPageFault | Self::LoadPageFault | Self::StorePageFault
        )
    }
}

/// Largest standard synchronous exception code; codes up to this
/// value (including the reserved ones) get a dispatch entry
pub const MAX_EXCEPTION_CODE: u32 = 15;

/// Standard interrupts. The exception code for an interrupt is the
/// bit position in xie and xip used to enable the interrupt and
/// report it as pending.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InterruptCause {
    SupervisorSoftware,
    MachineSoftware,
    SupervisorTimer,
    MachineTimer,
    SupervisorExternal,
    MachineExternal,
}

impl InterruptCause {
    pub fn code(&self) -> u32 {
        match self {
            Self::SupervisorSoftware => 1,
            Self::MachineSoftware => 3,
            Self::SupervisorTimer => 5,
            Self::MachineTimer => 7,
            Self::SupervisorExternal => 9,
            Self::MachineExternal => 11,
        }
    }
}
