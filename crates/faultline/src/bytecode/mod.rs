//! Bytecode units: opcodes, functions with their exception-handler tables, and
//! the builder that assembles them.

mod builder;
mod op;
mod unit;

pub use builder::{FuncDecl, JumpLabel, RegionLabel, UnitBuilder};
pub use op::Opcode;
pub use unit::{CatchClause, EhEntry, EhHandler, Func, FuncId, NamedEntityId, Offset, Repo, Unit, UnitId};
