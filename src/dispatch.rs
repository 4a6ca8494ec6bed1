//! Synchronous handler assignment trie
//!
//! The top level of the trie is keyed by exception code. An entry is
//! either a leaf naming the handler class (and the memory bank it
//! lives in) or an internal node that dispatches again on a finer
//! sub-code. Children are kept in a `BTreeMap`, so every traversal
//! (and so every generated jump table) is in ascending key order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::GenError;
use crate::handlers::HandlerClass;
use crate::privilege::MemoryBank;

/// Largest key a dispatcher can compare against a 12-bit signed
/// immediate
pub const MAX_DISPATCH_KEY: u32 = 2047;

/// Largest bit field a dispatcher can extract with a single andi
pub const MAX_SUB_CODE_WIDTH: u32 = 11;

/// What a nested dispatch level switches on
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubCodeClass {
    /// Privilege level the trap was taken from (xstatus.xPP)
    PreviousPrivilege,
    /// A bit field of xtval
    TrapValueField { shift: u32, width: u32 },
}

impl SubCodeClass {
    fn validate(&self) -> Result<(), GenError> {
        match *self {
            Self::PreviousPrivilege => Ok(()),
            Self::TrapValueField { shift, width } => {
                if width == 0 || width > MAX_SUB_CODE_WIDTH || shift + width > 64 {
                    Err(GenError::InvalidSubCodeField(width))
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerAssignment {
    pub handler_class: HandlerClass,
    pub memory_bank: MemoryBank,
}

impl HandlerAssignment {
    pub fn new(handler_class: HandlerClass, memory_bank: MemoryBank) -> Self {
        Self {
            handler_class,
            memory_bank,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchNode {
    Leaf(HandlerAssignment),
    Internal {
        sub_code_class: SubCodeClass,
        children: BTreeMap<u32, DispatchNode>,
    },
}

impl DispatchNode {
    /// Number of dispatch levels (jump tables) in this subtree
    pub fn dispatch_levels(&self) -> usize {
        match self {
            Self::Leaf(_) => 0,
            Self::Internal { children, .. } => {
                1 + children.values().map(|c| c.dispatch_levels()).sum::<usize>()
            }
        }
    }

    /// Every leaf in this subtree, in traversal order
    pub fn leaves(&self) -> Vec<&HandlerAssignment> {
        match self {
            Self::Leaf(assignment) => vec![assignment],
            Self::Internal { children, .. } => {
                children.values().flat_map(|c| c.leaves()).collect()
            }
        }
    }
}

fn check_key(key: u32) -> Result<(), GenError> {
    if key > MAX_DISPATCH_KEY {
        Err(GenError::DispatchKeyRange(key))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchTrie {
    root: BTreeMap<u32, DispatchNode>,
}

impl DispatchTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &BTreeMap<u32, DispatchNode> {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn get(&self, code: u32) -> Option<&DispatchNode> {
        self.root.get(&code)
    }

    /// Map an exception code to a handler, replacing any previous
    /// assignment (including a nested one)
    pub fn assign(&mut self, code: u32, assignment: HandlerAssignment) -> Result<(), GenError> {
        check_key(code)?;
        self.root.insert(code, DispatchNode::Leaf(assignment));
        Ok(())
    }

    /// Map one sub-code of an exception code to a handler. A leaf at
    /// `code` is turned into a nested level; a nested level switching
    /// on a different sub-code class is a conflict.
    pub fn assign_sub(
        &mut self,
        code: u32,
        sub_code_class: SubCodeClass,
        sub_code: u32,
        assignment: HandlerAssignment,
    ) -> Result<(), GenError> {
        check_key(code)?;
        check_key(sub_code)?;
        sub_code_class.validate()?;
        if let SubCodeClass::TrapValueField { width, .. } = sub_code_class {
            if u64::from(sub_code) >> width != 0 {
                return Err(GenError::DispatchKeyRange(sub_code));
            }
        }
        let node = self.root.entry(code).or_insert_with(|| DispatchNode::Internal {
            sub_code_class,
            children: BTreeMap::new(),
        });
        if let DispatchNode::Leaf(_) = node {
            *node = DispatchNode::Internal {
                sub_code_class,
                children: BTreeMap::new(),
            };
        }
        match node {
            DispatchNode::Internal {
                sub_code_class: existing,
                children,
            } if *existing == sub_code_class => {
                children.insert(sub_code, DispatchNode::Leaf(assignment));
                Ok(())
            }
            _ => Err(GenError::ConflictingAssignment(code)),
        }
    }

    /// Replace the whole subtree at `code`
    pub fn replace(&mut self, code: u32, node: DispatchNode) -> Result<(), GenError> {
        check_key(code)?;
        self.root.insert(code, node);
        Ok(())
    }

    /// Number of jump tables generating this trie produces
    pub fn dispatch_levels(&self) -> usize {
        if self.root.is_empty() {
            return 0;
        }
        1 + self.root.values().map(|c| c.dispatch_levels()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn skip() -> HandlerAssignment {
        HandlerAssignment::new(HandlerClass::SkipInstruction, MemoryBank::Default)
    }

    fn page_fault() -> HandlerAssignment {
        HandlerAssignment::new(HandlerClass::PageFault, MemoryBank::Default)
    }

    #[test]
    fn check_traversal_is_sorted() {
        let mut trie = DispatchTrie::new();
        for code in [7, 1, 3] {
            trie.assign(code, skip()).unwrap();
        }
        let keys: Vec<_> = trie.root().keys().copied().collect();
        assert_eq!(keys, vec![1, 3, 7]);
        assert_eq!(trie.dispatch_levels(), 1);
    }

    #[test]
    fn check_sub_assignment_nests_leaf() {
        let mut trie = DispatchTrie::new();
        trie.assign(13, skip()).unwrap();
        trie.assign_sub(13, SubCodeClass::PreviousPrivilege, 0, page_fault())
            .unwrap();
        trie.assign_sub(13, SubCodeClass::PreviousPrivilege, 1, skip())
            .unwrap();
        assert_eq!(trie.dispatch_levels(), 2);
        match trie.get(13) {
            Some(DispatchNode::Internal { children, .. }) => assert_eq!(children.len(), 2),
            other => panic!("expected nested node, got {other:?}"),
        }
    }

    #[test]
    fn check_conflicting_sub_code_class() {
        let mut trie = DispatchTrie::new();
        trie.assign_sub(13, SubCodeClass::PreviousPrivilege, 0, skip())
            .unwrap();
        let field = SubCodeClass::TrapValueField { shift: 0, width: 2 };
        assert_eq!(
            trie.assign_sub(13, field, 1, skip()),
            Err(GenError::ConflictingAssignment(13))
        );
    }

    #[test]
    fn check_key_and_field_limits() {
        let mut trie = DispatchTrie::new();
        assert_eq!(trie.assign(2048, skip()), Err(GenError::DispatchKeyRange(2048)));
        let wide = SubCodeClass::TrapValueField { shift: 0, width: 12 };
        assert_eq!(
            trie.assign_sub(1, wide, 0, skip()),
            Err(GenError::InvalidSubCodeField(12))
        );
        let narrow = SubCodeClass::TrapValueField { shift: 4, width: 2 };
        assert_eq!(
            trie.assign_sub(1, narrow, 4, skip()),
            Err(GenError::DispatchKeyRange(4))
        );
    }

    #[test]
    fn check_leaves_in_order() {
        let mut trie = DispatchTrie::new();
        trie.assign(1, skip()).unwrap();
        trie.assign_sub(5, SubCodeClass::PreviousPrivilege, 3, page_fault())
            .unwrap();
        let leaves: Vec<_> = trie
            .root()
            .values()
            .flat_map(|n| n.leaves())
            .map(|a| a.handler_class)
            .collect();
        assert_eq!(
            leaves,
            vec![HandlerClass::SkipInstruction, HandlerClass::PageFault]
        );
    }
}
