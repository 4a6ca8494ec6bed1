//! Generator configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or
//! no file) gives Fast-mode handlers for M and S levels.
//!
//! ```toml
//! handler_mode = "Comprehensive"
//! privilege_levels = ["M", "S"]
//! secure_levels = ["M"]
//! paging_mode = "Sv48"
//! delegated_exceptions = [12, 13, 15]
//!
//! [[assignments]]
//! level = "M"
//! code = 2
//! sub_code_class = "PreviousPrivilege"
//! sub_code = 1
//! handler = "SkipInstruction"
//! bank = "Secure"
//! ```

use std::fs;
use std::io;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::{DispatchTrie, HandlerAssignment, SubCodeClass};
use crate::error::GenError;
use crate::handlers::{AsyncHandlerClass, HandlerClass, HandlerMode, PagingMode};
use crate::privilege::{MemoryBank, PrivilegeLevel, SecurityState, MAX_EXCEPTION_CODE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("cannot parse config: {0}")]
    Parse(toml::de::Error),
    #[error("no privilege levels configured")]
    NoLevels,
    #[error("privilege level {0} has no trap handling support")]
    NoTrapSupport(PrivilegeLevel),
    #[error("secure level {0} is not one of the configured privilege levels")]
    SecureLevelNotGenerated(PrivilegeLevel),
    #[error("assignment for code {code} at level {level}, which is not configured")]
    OverrideLevel { level: PrivilegeLevel, code: u32 },
    #[error("assignment for code {0} needs both sub_code_class and sub_code")]
    IncompleteSubCode(u32),
    #[error("access fault handling runs at M level only, not {0}")]
    AccessFaultLevel(PrivilegeLevel),
    #[error("exception code {0} cannot be delegated")]
    InvalidDelegation(u32),
    #[error("exceptions are delegated but S level is not configured")]
    DelegationWithoutSupervisor,
    #[error("both memory banks start at 0x{0:x}")]
    BankOverlap(u64),
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e)
    }
}

/// One handler assignment replacing a default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentOverride {
    pub level: PrivilegeLevel,
    /// Every security state of the level if unset
    #[serde(default)]
    pub security_state: Option<SecurityState>,
    pub code: u32,
    #[serde(default)]
    pub sub_code_class: Option<SubCodeClass>,
    #[serde(default)]
    pub sub_code: Option<u32>,
    pub handler: HandlerClass,
    /// The security state's own bank if unset
    #[serde(default)]
    pub bank: Option<MemoryBank>,
}

impl AssignmentOverride {
    pub fn applies_to(&self, level: PrivilegeLevel, state: SecurityState) -> bool {
        self.level == level && self.security_state.map_or(true, |s| s == state)
    }

    /// Apply the override to the assignments of one security state
    pub fn apply(&self, trie: &mut DispatchTrie, state: SecurityState) -> Result<(), GenError> {
        let bank = self.bank.unwrap_or_else(|| state.default_memory_bank());
        let assignment = HandlerAssignment::new(self.handler, bank);
        match (self.sub_code_class, self.sub_code) {
            (Some(class), Some(sub_code)) => trie.assign_sub(self.code, class, sub_code, assignment),
            _ => trie.assign(self.code, assignment),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub handler_mode: HandlerMode,
    /// Levels that get a handler set
    pub privilege_levels: Vec<PrivilegeLevel>,
    /// Levels that also get handlers for the Secure state
    pub secure_levels: Vec<PrivilegeLevel>,
    pub default_bank_base: u64,
    pub secure_bank_base: u64,
    /// Where the boot code establishing the handler state is placed
    pub boot_address: u64,
    pub paging_mode: PagingMode,
    pub seed: u64,
    pub asynchronous_handler: AsyncHandlerClass,
    /// Exception codes handled at S level instead of M
    pub delegated_exceptions: Vec<u32>,
    pub assignments: Vec<AssignmentOverride>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            handler_mode: HandlerMode::default(),
            privilege_levels: vec![PrivilegeLevel::Machine, PrivilegeLevel::Supervisor],
            secure_levels: Vec::new(),
            default_bank_base: 0x8000_1000,
            secure_bank_base: 0x9000_0000,
            boot_address: 0x8000_0000,
            paging_mode: PagingMode::default(),
            seed: 0,
            asynchronous_handler: AsyncHandlerClass::default(),
            delegated_exceptions: Vec::new(),
            assignments: Vec::new(),
        }
    }
}

impl GeneratorConfig {
    /// Parse and validate a configuration
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.privilege_levels.is_empty() {
            return Err(ConfigError::NoLevels);
        }
        if let Some(&level) = self
            .privilege_levels
            .iter()
            .find(|level| level.trap_csrs().is_none())
        {
            return Err(ConfigError::NoTrapSupport(level));
        }
        if let Some(&level) = self
            .secure_levels
            .iter()
            .find(|level| !self.privilege_levels.contains(level))
        {
            return Err(ConfigError::SecureLevelNotGenerated(level));
        }
        for assignment in &self.assignments {
            if !self.privilege_levels.contains(&assignment.level) {
                return Err(ConfigError::OverrideLevel {
                    level: assignment.level,
                    code: assignment.code,
                });
            }
            if assignment.sub_code_class.is_some() != assignment.sub_code.is_some() {
                return Err(ConfigError::IncompleteSubCode(assignment.code));
            }
            if assignment.handler == HandlerClass::AccessFault
                && assignment.level != PrivilegeLevel::Machine
            {
                return Err(ConfigError::AccessFaultLevel(assignment.level));
            }
        }
        if let Some(&code) = self
            .delegated_exceptions
            .iter()
            .find(|&&code| code > MAX_EXCEPTION_CODE)
        {
            return Err(ConfigError::InvalidDelegation(code));
        }
        if !self.delegated_exceptions.is_empty()
            && !self.privilege_levels.contains(&PrivilegeLevel::Supervisor)
        {
            return Err(ConfigError::DelegationWithoutSupervisor);
        }
        if self.default_bank_base == self.secure_bank_base {
            return Err(ConfigError::BankOverlap(self.default_bank_base));
        }
        Ok(())
    }

    /// Initial code cursor of each memory bank
    pub fn bank_bases(&self) -> [(MemoryBank, u64); 2] {
        [
            (MemoryBank::Default, self.default_bank_base),
            (MemoryBank::Secure, self.secure_bank_base),
        ]
    }

    /// Security states handled at a level
    pub fn security_states(&self, level: PrivilegeLevel) -> Vec<SecurityState> {
        let mut states = vec![SecurityState::NonSecure];
        if self.secure_levels.contains(&level) {
            states.push(SecurityState::Secure);
        }
        states
    }

    /// medeleg value delegating the configured exception codes
    pub fn medeleg(&self) -> u64 {
        self.delegated_exceptions
            .iter()
            .fold(0, |acc, code| acc | (1 << code))
    }
}
