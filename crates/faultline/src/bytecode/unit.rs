//! Compiled units, their functions, and each function's exception-handler table.
//!
//! All offsets are byte offsets into the owning unit's bytecode, so a program
//! counter is just an [`Offset`] plus the unit it belongs to.

use smallvec::SmallVec;

use super::op::Opcode;

/// Byte offset into a unit's bytecode.
pub type Offset = u32;

/// Index of a unit inside a [`Repo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(u32);

impl UnitId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifies a function: the unit that defines it and its position in that unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId {
    unit: UnitId,
    slot: u32,
}

impl FuncId {
    #[inline]
    #[must_use]
    pub fn unit(self) -> UnitId {
        self.unit
    }
}

/// Index into a unit's table of named entities (class names used by catch clauses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamedEntityId(u32);

impl NamedEntityId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("named entity table exceeds u32"))
    }
}

/// One `(exception type, handler)` pair of a catch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchClause {
    pub class_name: NamedEntityId,
    pub handler: Offset,
}

/// What a protected region does when a fault reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EhHandler {
    /// A fault (finally) funclet that always runs and then re-raises.
    Fault { handler: Offset },
    /// Typed catch clauses, tried in declared order.
    Catch { clauses: SmallVec<[CatchClause; 2]> },
}

/// A protected region `[base, past)` of one function.
///
/// `parent` indexes the entry of the lexically enclosing region in the same
/// table. Parents always precede their children, so the innermost region
/// covering an offset is the last covering entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EhEntry {
    pub base: Offset,
    pub past: Offset,
    pub parent: Option<u32>,
    pub handler: EhHandler,
}

impl EhEntry {
    #[inline]
    #[must_use]
    pub fn covers(&self, offset: Offset) -> bool {
        self.base <= offset && offset < self.past
    }
}

/// Metadata for one function.
#[derive(Debug, Clone)]
pub struct Func {
    pub(crate) name: String,
    pub(crate) base: Offset,
    pub(crate) past: Offset,
    pub(crate) num_locals: u32,
    pub(crate) num_iterators: u32,
    pub(crate) is_generator: bool,
    pub(crate) is_builtin: bool,
    pub(crate) ehtab: Vec<EhEntry>,
}

impl Func {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset of the function's first instruction.
    #[must_use]
    pub fn base(&self) -> Offset {
        self.base
    }

    #[must_use]
    pub fn past(&self) -> Offset {
        self.past
    }

    #[must_use]
    pub fn num_locals(&self) -> u32 {
        self.num_locals
    }

    /// Stack slots a live frame reserves above its activation record.
    #[must_use]
    pub fn num_slots_in_frame(&self) -> u32 {
        self.num_locals + self.num_iterators
    }

    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.is_generator
    }

    #[must_use]
    pub fn is_builtin(&self) -> bool {
        self.is_builtin
    }

    #[must_use]
    pub fn ehtab(&self) -> &[EhEntry] {
        &self.ehtab
    }

    /// Finds the innermost protected region covering `offset`.
    #[must_use]
    pub fn find_eh(&self, offset: Offset) -> Option<usize> {
        self.ehtab.iter().rposition(|eh| eh.covers(offset))
    }
}

/// A compiled unit: bytecode, named entities, and the functions defined in it.
#[derive(Debug, Clone)]
pub struct Unit {
    pub(crate) path: String,
    pub(crate) bytecode: Vec<u8>,
    pub(crate) named_entities: Vec<String>,
    pub(crate) funcs: Vec<Func>,
}

impl Unit {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    /// Decodes the opcode at `offset`, if it is in range and valid.
    #[must_use]
    pub fn op_at(&self, offset: Offset) -> Option<Opcode> {
        self.bytecode
            .get(offset as usize)
            .and_then(|&byte| Opcode::from_repr(byte))
    }

    #[must_use]
    pub fn named_entity(&self, id: NamedEntityId) -> Option<&str> {
        self.named_entities.get(id.0 as usize).map(String::as_str)
    }

    #[must_use]
    pub fn funcs(&self) -> &[Func] {
        &self.funcs
    }
}

/// Every unit loaded into the VM.
#[derive(Debug, Clone, Default)]
pub struct Repo {
    units: Vec<Unit>,
}

impl Repo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a unit, returning its id.
    ///
    /// # Panics
    /// Panics if more than `u32::MAX` units are loaded.
    pub fn add_unit(&mut self, unit: Unit) -> UnitId {
        let id = UnitId(u32::try_from(self.units.len()).expect("repo exceeds u32 units"));
        self.units.push(unit);
        id
    }

    /// Looks up a function by name within a unit.
    #[must_use]
    pub fn func_id(&self, unit: UnitId, name: &str) -> Option<FuncId> {
        let position = self.units.get(unit.index())?.funcs.iter().position(|f| f.name == name)?;
        Some(FuncId {
            unit,
            slot: u32::try_from(position).ok()?,
        })
    }

    /// Looks up a function by name across all units, in load order.
    #[must_use]
    pub fn lookup_func(&self, name: &str) -> Option<FuncId> {
        (0..self.units.len()).find_map(|index| self.func_id(UnitId(u32::try_from(index).ok()?), name))
    }

    /// # Panics
    /// Panics if the unit id did not come from this repo.
    #[must_use]
    pub fn unit(&self, id: UnitId) -> &Unit {
        &self.units[id.index()]
    }

    /// # Panics
    /// Panics if the function id did not come from this repo.
    #[must_use]
    pub fn func(&self, id: FuncId) -> &Func {
        &self.units[id.unit.index()].funcs[id.slot as usize]
    }
}
