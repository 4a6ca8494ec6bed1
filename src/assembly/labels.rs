use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error(
        "[{tag}] branch at 0x{branch_pc:x} with offset {offset} lands on 0x{actual:x}, \
         label {label} is at 0x{expected:x}"
    )]
    Mismatch {
        tag: String,
        label: String,
        branch_pc: u64,
        offset: i64,
        expected: u64,
        actual: u64,
    },
    #[error("[{tag}] label {label} is not the target of any branch")]
    Unreferenced { tag: String, label: String },
    #[error("[{tag}] branch(es) to label {label} were never resolved")]
    Unresolved { tag: String, label: String },
}

/// Branches recorded against labels that have not been placed yet
///
/// A branch records its own address and its offset (in units of
/// `1 << shift` bytes). Placing the label checks every recorded branch
/// lands exactly on it.
#[derive(Debug, Default)]
pub struct LabelTable {
    tag: String,
    shift: u32,
    pending: BTreeMap<String, Vec<(u64, i64)>>,
}

impl LabelTable {
    pub fn new(shift: u32) -> Self {
        Self {
            shift,
            ..Default::default()
        }
    }

    /// Forget all recorded branches; subsequent errors carry `tag`
    pub fn clear(&mut self, tag: &str) {
        self.tag = tag.to_string();
        self.pending.clear();
    }

    pub fn record_branch(&mut self, label: &str, branch_pc: u64, offset: i64) {
        self.pending
            .entry(label.to_string())
            .or_default()
            .push((branch_pc, offset));
    }

    /// Place `label` at `pc`, verifying every branch recorded
    /// against it
    pub fn place(&mut self, label: &str, pc: u64) -> Result<(), LabelError> {
        let branches = self
            .pending
            .remove(label)
            .ok_or_else(|| LabelError::Unreferenced {
                tag: self.tag.clone(),
                label: label.to_string(),
            })?;
        for (branch_pc, offset) in branches {
            let actual = branch_pc.wrapping_add_signed(offset << self.shift);
            if actual != pc {
                return Err(LabelError::Mismatch {
                    tag: self.tag.clone(),
                    label: label.to_string(),
                    branch_pc,
                    offset,
                    expected: pc,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Error if any branch was recorded against a label that was
    /// never placed
    pub fn check_resolved(&self) -> Result<(), LabelError> {
        match self.pending.keys().next() {
            Some(label) => Err(LabelError::Unresolved {
                tag: self.tag.clone(),
                label: label.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_branches_land_on_label() {
        let mut labels = LabelTable::new(2);
        labels.clear("test");
        labels.record_branch("end", 0x100, 3);
        labels.record_branch("end", 0x104, 2);
        assert_eq!(labels.place("end", 0x10c), Ok(()));
        assert_eq!(labels.check_resolved(), Ok(()));
    }

    #[test]
    fn check_mismatch_reports_addresses() {
        let mut labels = LabelTable::new(2);
        labels.clear("test");
        labels.record_branch("end", 0x100, 2);
        let err = labels.place("end", 0x10c).unwrap_err();
        assert_eq!(
            err,
            LabelError::Mismatch {
                tag: "test".to_string(),
                label: "end".to_string(),
                branch_pc: 0x100,
                offset: 2,
                expected: 0x10c,
                actual: 0x108,
            }
        );
    }

    #[test]
    fn check_unreferenced_label() {
        let mut labels = LabelTable::new(2);
        labels.clear("test");
        assert!(matches!(
            labels.place("nowhere", 0x100),
            Err(LabelError::Unreferenced { .. })
        ));
    }

    #[test]
    fn check_unresolved_and_clear() {
        let mut labels = LabelTable::new(2);
        labels.record_branch("later", 0x100, 1);
        assert!(labels.check_resolved().is_err());
        labels.clear("next");
        assert_eq!(labels.check_resolved(), Ok(()));
    }
}
