//! Generated routine cache and handler boundary records
//!
//! A routine is generated at most once per (memory bank, handler
//! class). Every later reference reuses its entry address, so many
//! exception codes (and privilege levels) mapping to the same handler
//! share one copy of the code.

use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;

use crate::error::GenError;
use crate::handlers::{HandlerClass, Routine};
use crate::privilege::MemoryBank;

/// Address range [start, end) of one generated block of handler code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerBoundary {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

impl HandlerBoundary {
    /// `name:start:end` as reported to the runtime backend
    pub fn encode(&self) -> String {
        format!("{}:0x{:x}:0x{:x}", self.name, self.start, self.end)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    routines: BTreeMap<(MemoryBank, HandlerClass), BTreeMap<Routine, u64>>,
    /// Stubs in one bank jumping to a handler class in another
    trampolines: BTreeMap<(MemoryBank, MemoryBank, HandlerClass), u64>,
    boundaries: BTreeMap<MemoryBank, Vec<HandlerBoundary>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_generated_routine(
        &self,
        bank: MemoryBank,
        class: HandlerClass,
        routine: Routine,
    ) -> bool {
        self.routine_entry(bank, class, routine).is_some()
    }

    pub fn routine_entry(
        &self,
        bank: MemoryBank,
        class: HandlerClass,
        routine: Routine,
    ) -> Option<u64> {
        self.routines
            .get(&(bank, class))
            .and_then(|routines| routines.get(&routine))
            .copied()
    }

    /// Routines generated for a handler class in a bank, by routine
    pub fn routines(
        &self,
        bank: MemoryBank,
        class: HandlerClass,
    ) -> Option<&BTreeMap<Routine, u64>> {
        self.routines.get(&(bank, class))
    }

    /// Entry address of the routine, generating it with `generate`
    /// (which returns the start and end of the emitted code) if this
    /// is the first reference
    pub fn get_or_generate<F>(
        &mut self,
        bank: MemoryBank,
        class: HandlerClass,
        routine: Routine,
        generate: F,
    ) -> Result<u64, GenError>
    where
        F: FnOnce() -> Result<(u64, u64), GenError>,
    {
        if let Some(entry) = self.routine_entry(bank, class, routine) {
            debug!("reusing {} in bank {bank} at 0x{entry:x}", routine.name());
            return Ok(entry);
        }
        let (start, end) = generate()?;
        debug!(
            "generated {} in bank {bank} at 0x{start:x}-0x{end:x}",
            routine.name()
        );
        self.routines
            .entry((bank, class))
            .or_default()
            .insert(routine, start);
        self.record_boundary(bank, routine.name(), start, end);
        Ok(start)
    }

    /// Entry of the stub in bank `from` that reaches the handler class
    /// in bank `to`, generating it on first use
    pub fn get_or_generate_trampoline<F>(
        &mut self,
        from: MemoryBank,
        to: MemoryBank,
        class: HandlerClass,
        generate: F,
    ) -> Result<u64, GenError>
    where
        F: FnOnce() -> Result<(u64, u64), GenError>,
    {
        if let Some(&entry) = self.trampolines.get(&(from, to, class)) {
            return Ok(entry);
        }
        let (start, end) = generate()?;
        self.trampolines.insert((from, to, class), start);
        self.record_boundary(from, &format!("{class}_{to}"), start, end);
        Ok(start)
    }

    pub fn record_boundary(&mut self, bank: MemoryBank, name: &str, start: u64, end: u64) {
        self.boundaries.entry(bank).or_default().push(HandlerBoundary {
            name: name.to_string(),
            start,
            end,
        });
    }

    pub fn boundaries(&self, bank: MemoryBank) -> &[HandlerBoundary] {
        self.boundaries.get(&bank).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn banks(&self) -> impl Iterator<Item = MemoryBank> + '_ {
        self.boundaries.keys().copied()
    }

    /// Boundaries of a bank as a `;`-separated list of
    /// `name:start:end`, in the order they were recorded
    pub fn bounds_report(&self, bank: MemoryBank) -> String {
        self.boundaries(bank).iter().map(HandlerBoundary::encode).join(";")
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_routine_generated_once() {
        let mut registry = HandlerRegistry::new();
        let bank = MemoryBank::Default;
        let class = HandlerClass::SkipInstruction;
        let routine = Routine::SkipInstruction;
        let mut calls = 0;
        let entry = registry
            .get_or_generate(bank, class, routine, || {
                calls += 1;
                Ok((0x100, 0x120))
            })
            .unwrap();
        assert_eq!(entry, 0x100);
        let entry = registry
            .get_or_generate(bank, class, routine, || {
                calls += 1;
                Ok((0x200, 0x220))
            })
            .unwrap();
        assert_eq!(entry, 0x100);
        assert_eq!(calls, 1);
        assert!(registry.has_generated_routine(bank, class, routine));
        assert!(!registry.has_generated_routine(MemoryBank::Secure, class, routine));
    }

    #[test]
    fn check_failed_generation_is_not_cached() {
        let mut registry = HandlerRegistry::new();
        let result = registry.get_or_generate(
            MemoryBank::Default,
            HandlerClass::AccessFault,
            Routine::AccessFault,
            || {
                Err(GenError::MissingRoutine {
                    routine: "AccessFault",
                    prerequisite: "PmpFixup",
                })
            },
        );
        assert!(result.is_err());
        assert_eq!(
            registry.routine_entry(
                MemoryBank::Default,
                HandlerClass::AccessFault,
                Routine::AccessFault
            ),
            None
        );
        assert!(registry.boundaries(MemoryBank::Default).is_empty());
    }

    #[test]
    fn check_trampoline_generated_once() {
        let mut registry = HandlerRegistry::new();
        let first = registry
            .get_or_generate_trampoline(
                MemoryBank::Default,
                MemoryBank::Secure,
                HandlerClass::PageFault,
                || Ok((0x2000, 0x2010)),
            )
            .unwrap();
        let second = registry
            .get_or_generate_trampoline(
                MemoryBank::Default,
                MemoryBank::Secure,
                HandlerClass::PageFault,
                || Ok((0x3000, 0x3010)),
            )
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(
            registry.bounds_report(MemoryBank::Default),
            "PageFault_Secure:0x2000:0x2010"
        );
    }

    #[test]
    fn check_bounds_report_format() {
        let mut registry = HandlerRegistry::new();
        registry.record_boundary(MemoryBank::Default, "A", 0x1000, 0x1010);
        registry.record_boundary(MemoryBank::Default, "B", 0x1010, 0x1040);
        registry.record_boundary(MemoryBank::Secure, "C", 0x9000, 0x9004);
        assert_eq!(
            registry.bounds_report(MemoryBank::Default),
            "A:0x1000:0x1010;B:0x1010:0x1040"
        );
        assert_eq!(registry.bounds_report(MemoryBank::Secure), "C:0x9000:0x9004");
        let banks: Vec<_> = registry.banks().collect();
        assert_eq!(banks, vec![MemoryBank::Default, MemoryBank::Secure]);
    }
}
