//! Ownership trees rooted at a queried object and branching toward its owners.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ObjectRef;

/// An object and its direct owners, in declaration order.
///
/// Objects that could not be found server-side are leaves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerTree {
    pub reference: ObjectRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owners: Vec<OwnerTree>,
}

impl OwnerTree {
    pub fn leaf(reference: ObjectRef) -> Self { Self { reference, owners: Vec::new() } }

    /// True if this object or any transitive owner has `uid`.
    pub fn contains_uid(&self, uid: &str) -> bool {
        self.reference.uid == uid || self.owners.iter().any(|o| o.contains_uid(uid))
    }

    /// Subtree rooted at `uid`, depth-first.
    pub fn find(&self, uid: &str) -> Option<&OwnerTree> {
        if self.reference.uid == uid {
            return Some(self);
        }
        self.owners.iter().find_map(|o| o.find(uid))
    }

    /// Number of levels; a leaf has depth 1.
    pub fn depth(&self) -> usize { 1 + self.owners.iter().map(OwnerTree::depth).max().unwrap_or(0) }

    /// `kind:name` per line, owners indented two spaces below their dependent.
    pub fn render(&self) -> String { self.lines().join("\n") }

    fn lines(&self) -> Vec<String> {
        let mut out = vec![format!("{}:{}", self.reference.kind, self.reference.name)];
        for owner in &self.owners {
            out.extend(owner.lines().into_iter().map(|l| format!("  {}", l)));
        }
        out
    }
}

impl fmt::Display for OwnerTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.render()) }
}
