//! Class definitions used for catch-clause type tests.
//!
//! Catch clauses name their exception type; the name is resolved against the
//! [`ClassTable`] at match time, so a clause naming a class that was never
//! defined simply never matches.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Index of a class in its [`ClassTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(u32);

impl ClassId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A single class definition. The name lives in the table key.
#[derive(Debug, Clone)]
pub struct ClassDef {
    parent: Option<ClassId>,
}

impl ClassDef {
    #[must_use]
    pub fn parent(&self) -> Option<ClassId> {
        self.parent
    }
}

/// Name-indexed registry of defined classes with single inheritance.
///
/// Insertion order is preserved so `ClassId`s are stable and dense.
#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    classes: IndexMap<String, ClassDef>,
}

impl ClassTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a class, returning its id.
    ///
    /// Redefining an existing name replaces its parent and keeps the original id.
    ///
    /// # Panics
    /// Panics if more than `u32::MAX` classes are defined.
    pub fn define(&mut self, name: impl Into<String>, parent: Option<ClassId>) -> ClassId {
        let (index, _) = self.classes.insert_full(name.into(), ClassDef { parent });
        ClassId(u32::try_from(index).expect("class table exceeds u32"))
    }

    /// Resolves a class by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.classes
            .get_index_of(name)
            .map(|index| ClassId(u32::try_from(index).expect("class table exceeds u32")))
    }

    #[must_use]
    pub fn get(&self, id: ClassId) -> Option<&ClassDef> {
        self.classes.get_index(id.index()).map(|(_, def)| def)
    }

    #[must_use]
    pub fn name(&self, id: ClassId) -> Option<&str> {
        self.classes.get_index(id.index()).map(|(name, _)| name.as_str())
    }

    /// Returns true if `class` is `ancestor` or inherits from it.
    #[must_use]
    pub fn is_subclass_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        // Bounded by the table size so a malformed parent cycle can't spin forever.
        for _ in 0..=self.classes.len() {
            match current {
                Some(id) if id == ancestor => return true,
                Some(id) => current = self.get(id).and_then(ClassDef::parent),
                None => return false,
            }
        }
        false
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
