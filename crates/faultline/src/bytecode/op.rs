//! Opcode definitions.
//!
//! Only the opcodes whose identity matters to unwinding carry meaning here:
//! the return opcodes (a frame faulting on one is already returning), the call
//! protocol opcodes that create pending activation records, and the handler
//! entry/exit opcodes. The rest exist so units look like real code.

use strum::{Display, FromRepr, IntoStaticStr};

/// A single bytecode instruction, encoded as one byte followed by its operand.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, IntoStaticStr)]
pub enum Opcode {
    Nop,
    /// Pushes null.
    Null,
    /// Pushes an i32 immediate as an integer.
    Int,
    /// Pops and releases the top of stack.
    PopC,
    /// Pushes a copy of local `u16`.
    CGetL,
    /// Stores top of stack into local `u16`.
    SetL,
    /// Pushes a pending activation record for function `u16`.
    FPushFunc,
    /// Allocates an object and pushes a pending constructor record for function `u16`.
    FPushCtor,
    /// Calls the topmost pending record with `u8` arguments.
    FCall,
    /// Returns a cell.
    RetC,
    /// Returns a variant.
    RetV,
    /// Throws the object on top of stack.
    Throw,
    /// Ends a fault handler, continuing to propagate the current fault.
    Unwind,
    /// Starts a catch handler, pushing the caught object.
    Catch,
    /// Relative jump by an i16 offset.
    Jmp,
    /// Runs the native implementation of a builtin.
    NativeImpl,
}

impl Opcode {
    /// Number of operand bytes following the opcode byte.
    #[must_use]
    pub fn operand_len(self) -> usize {
        match self {
            Self::Int => 4,
            Self::CGetL | Self::SetL | Self::FPushFunc | Self::FPushCtor | Self::Jmp => 2,
            Self::FCall => 1,
            Self::Nop
            | Self::Null
            | Self::PopC
            | Self::RetC
            | Self::RetV
            | Self::Throw
            | Self::Unwind
            | Self::Catch
            | Self::NativeImpl => 0,
        }
    }

    /// Returns true for the opcodes that return from the current frame.
    #[must_use]
    pub fn is_return(self) -> bool {
        matches!(self, Self::RetC | Self::RetV)
    }
}
