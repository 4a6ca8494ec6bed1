#![forbid(unsafe_code)]

//! Generation of exception handlers for RISC-V test programs
//!
//! `ThreadHandlerSet` generates, into a `Sequence`, the trap vector
//! tables, dispatch code and handler routines for every configured
//! privilege level and security state, and reports the address range
//! of each generated block. `StateTransition` emits the code that
//! installs them (and any other machine state) at boot.

pub mod arch;
pub mod assembly;
pub mod config;
pub mod csr;
pub mod dispatch;
pub mod encode;
pub mod error;
pub mod handler_set;
pub mod handlers;
pub mod instr;
pub mod model;
pub mod opcodes;
pub mod privilege;
pub mod registry;
pub mod sequence;
pub mod thread_handler_set;
pub mod trace_file;
pub mod transition;

pub mod utils;
