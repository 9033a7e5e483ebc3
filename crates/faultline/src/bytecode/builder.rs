//! Builder for assembling units.
//!
//! `UnitBuilder` emits opcodes and operands, patches forward jumps, and records
//! the protected regions of each function as they are opened and closed. Region
//! nesting follows the order of `begin_try`/`end_try` calls, which gives every
//! entry its parent index and keeps parents ahead of their children.
//!
//! Malformed input does not panic mid-emission: the first problem is remembered
//! and reported by [`UnitBuilder::build`].

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::{
    op::Opcode,
    unit::{CatchClause, EhEntry, EhHandler, Func, NamedEntityId, Offset, Unit},
};
use crate::error::BuildError;

/// Declaration of a function's shape, given to [`UnitBuilder::begin_func`].
#[derive(Debug, Clone)]
pub struct FuncDecl {
    name: String,
    num_locals: u32,
    num_iterators: u32,
    generator: bool,
    builtin: bool,
}

impl FuncDecl {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_locals: 0,
            num_iterators: 0,
            generator: false,
            builtin: false,
        }
    }

    /// Sets the number of local variable slots.
    #[must_use]
    pub fn locals(mut self, count: u32) -> Self {
        self.num_locals = count;
        self
    }

    /// Sets the number of iterator slots reserved after the locals.
    #[must_use]
    pub fn iterators(mut self, count: u32) -> Self {
        self.num_iterators = count;
        self
    }

    /// Marks the function as a generator body; its locals live outside the stack.
    #[must_use]
    pub fn generator(mut self) -> Self {
        self.generator = true;
        self
    }

    /// Marks the function as a builtin implemented natively.
    #[must_use]
    pub fn builtin(mut self) -> Self {
        self.builtin = true;
        self
    }
}

/// Handle to a try region opened with [`UnitBuilder::begin_try`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLabel(usize);

/// Handle to a forward jump awaiting [`UnitBuilder::patch_jump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpLabel(usize);

#[derive(Debug)]
struct RegionInProgress {
    base: Offset,
    past: Option<Offset>,
    parent: Option<u32>,
    handler: Option<EhHandler>,
}

#[derive(Debug)]
struct FuncInProgress {
    decl: FuncDecl,
    base: Offset,
    regions: Vec<RegionInProgress>,
    /// Indices of regions that are open, innermost last.
    open: Vec<usize>,
}

/// Builder for a single unit.
///
/// # Usage
///
/// ```
/// use faultline::{FuncDecl, Opcode, UnitBuilder};
///
/// let mut builder = UnitBuilder::new("example.php");
/// builder.begin_func(FuncDecl::new("f").locals(1));
/// let region = builder.begin_try();
/// builder.emit(Opcode::Null);
/// builder.emit(Opcode::Throw);
/// builder.end_try(region);
/// let handler = builder.current_offset();
/// builder.emit(Opcode::Catch);
/// builder.emit(Opcode::RetC);
/// builder.catch_handler(region, "Exception", handler);
/// builder.end_func();
/// let unit = builder.build().unwrap();
/// assert_eq!(unit.funcs()[0].ehtab().len(), 1);
/// ```
#[derive(Debug)]
pub struct UnitBuilder {
    path: String,
    bytecode: Vec<u8>,
    named_entities: IndexSet<String>,
    funcs: Vec<Func>,
    current: Option<FuncInProgress>,
    /// First error encountered; reported by `build`.
    error: Option<BuildError>,
}

impl UnitBuilder {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bytecode: Vec::new(),
            named_entities: IndexSet::new(),
            funcs: Vec::new(),
            current: None,
            error: None,
        }
    }

    /// Returns the offset the next instruction will be emitted at.
    #[must_use]
    pub fn current_offset(&self) -> Offset {
        Offset::try_from(self.bytecode.len()).unwrap_or(Offset::MAX)
    }

    /// Starts a new function at the current offset.
    pub fn begin_func(&mut self, decl: FuncDecl) {
        if let Some(open) = &self.current {
            let name = open.decl.name.clone();
            self.fail(BuildError::UnbalancedFunction { name });
            return;
        }
        self.current = Some(FuncInProgress {
            decl,
            base: self.current_offset(),
            regions: Vec::new(),
            open: Vec::new(),
        });
    }

    /// Ends the current function, finalizing its exception-handler table.
    pub fn end_func(&mut self) {
        let past = self.current_offset();
        let Some(func) = self.current.take() else {
            self.fail(BuildError::UnbalancedFunction { name: String::new() });
            return;
        };
        if let Some(&open) = func.open.last() {
            self.fail(BuildError::UnclosedRegion {
                base: func.regions[open].base,
            });
            return;
        }

        let mut ehtab = Vec::with_capacity(func.regions.len());
        for region in func.regions {
            let past = region.past.unwrap_or(past);
            let Some(handler) = region.handler else {
                self.fail(BuildError::MissingHandler {
                    base: region.base,
                    past,
                });
                return;
            };
            ehtab.push(EhEntry {
                base: region.base,
                past,
                parent: region.parent,
                handler,
            });
        }

        self.funcs.push(Func {
            name: func.decl.name,
            base: func.base,
            past,
            num_locals: func.decl.num_locals,
            num_iterators: func.decl.num_iterators,
            is_generator: func.decl.generator,
            is_builtin: func.decl.builtin,
            ehtab,
        });
    }

    /// Emits a no-operand instruction.
    pub fn emit(&mut self, op: Opcode) {
        debug_assert_eq!(op.operand_len(), 0, "{op} takes an operand");
        self.bytecode.push(op as u8);
    }

    /// Emits an instruction with a u8 operand.
    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.bytecode.push(op as u8);
        self.bytecode.push(operand);
    }

    /// Emits an instruction with a u16 operand (little-endian).
    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
    }

    /// Emits an instruction with an i32 operand (little-endian).
    pub fn emit_i32(&mut self, op: Opcode, operand: i32) {
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
    }

    /// Emits a forward jump, returning a label to patch once the target is known.
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&0i16.to_le_bytes());
        label
    }

    /// Patches a forward jump to land on the current offset.
    ///
    /// The offset is relative to the end of the jump instruction (opcode + i16).
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.bytecode.len();
        let relative = i64::try_from(target).unwrap_or(i64::MAX) - i64::try_from(label.0).unwrap_or(0) - 3;
        let Ok(relative) = i16::try_from(relative) else {
            let offset = Offset::try_from(label.0).unwrap_or(Offset::MAX);
            self.fail(BuildError::OperandOutOfRange { offset });
            return;
        };
        let bytes = relative.to_le_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
    }

    /// Opens a protected region at the current offset, nested in the innermost open one.
    #[must_use]
    pub fn begin_try(&mut self) -> RegionLabel {
        let base = self.current_offset();
        let Some(func) = self.current.as_mut() else {
            self.fail(BuildError::RegionOutsideFunction { offset: base });
            return RegionLabel(usize::MAX);
        };
        let parent = func.open.last().map(|&index| u32::try_from(index).unwrap_or(u32::MAX));
        let index = func.regions.len();
        func.regions.push(RegionInProgress {
            base,
            past: None,
            parent,
            handler: None,
        });
        func.open.push(index);
        RegionLabel(index)
    }

    /// Closes a protected region at the current offset.
    ///
    /// Regions close innermost-first; `label` must be the most recently opened
    /// region that is still open.
    pub fn end_try(&mut self, label: RegionLabel) {
        let past = self.current_offset();
        let Some(func) = self.current.as_mut() else {
            self.fail(BuildError::RegionOutsideFunction { offset: past });
            return;
        };
        if func.open.last() != Some(&label.0) {
            let base = func.regions.get(label.0).map_or(past, |region| region.base);
            self.fail(BuildError::UnbalancedRegion { base });
            return;
        }
        func.open.pop();
        func.regions[label.0].past = Some(past);
    }

    /// Attaches a fault (finally) handler to a region.
    pub fn fault_handler(&mut self, label: RegionLabel, handler: Offset) {
        let Some(region) = self.region_mut(label) else {
            return;
        };
        match region.handler {
            None => region.handler = Some(EhHandler::Fault { handler }),
            Some(_) => {
                let base = region.base;
                self.fail(BuildError::MixedHandlers { base });
            }
        }
    }

    /// Appends a catch clause to a region; clauses are tried in the order added.
    pub fn catch_handler(&mut self, label: RegionLabel, class_name: &str, handler: Offset) {
        let (index, _) = self.named_entities.insert_full(class_name.to_owned());
        let clause = CatchClause {
            class_name: NamedEntityId::new(index),
            handler,
        };
        let Some(region) = self.region_mut(label) else {
            return;
        };
        match &mut region.handler {
            None => {
                let mut clauses = SmallVec::new();
                clauses.push(clause);
                region.handler = Some(EhHandler::Catch { clauses });
            }
            Some(EhHandler::Catch { clauses }) => clauses.push(clause),
            Some(EhHandler::Fault { .. }) => {
                let base = region.base;
                self.fail(BuildError::MixedHandlers { base });
            }
        }
    }

    /// Finishes the unit, validating functions and handler offsets.
    pub fn build(mut self) -> Result<Unit, BuildError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if let Some(func) = self.current.take() {
            return Err(BuildError::UnbalancedFunction { name: func.decl.name });
        }
        let unit_len = self.current_offset();
        for func in &self.funcs {
            for eh in &func.ehtab {
                let handlers: SmallVec<[Offset; 2]> = match &eh.handler {
                    EhHandler::Fault { handler } => SmallVec::from_slice(&[*handler]),
                    EhHandler::Catch { clauses } => clauses.iter().map(|clause| clause.handler).collect(),
                };
                if let Some(&handler) = handlers.iter().find(|&&handler| handler >= unit_len) {
                    return Err(BuildError::HandlerOutOfRange { handler, unit_len });
                }
            }
        }
        Ok(Unit {
            path: self.path,
            bytecode: self.bytecode,
            named_entities: self.named_entities.into_iter().collect(),
            funcs: self.funcs,
        })
    }

    fn region_mut(&mut self, label: RegionLabel) -> Option<&mut RegionInProgress> {
        let exists = self
            .current
            .as_ref()
            .is_some_and(|func| label.0 < func.regions.len());
        if !exists {
            let offset = self.current_offset();
            self.fail(BuildError::RegionOutsideFunction { offset });
            return None;
        }
        self.current
            .as_mut()
            .and_then(|func| func.regions.get_mut(label.0))
    }

    fn fail(&mut self, error: BuildError) {
        self.error.get_or_insert(error);
    }
}
