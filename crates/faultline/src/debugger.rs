//! Debugger notification hook.

use std::{cell::RefCell, rc::Rc};

use crate::bytecode::{FuncId, Offset};

/// Receives a notification each time the unwinder is about to transfer control
/// to a handler. Fire-and-forget: the unwinder never consults the hook.
pub trait DebuggerHook: std::fmt::Debug {
    fn exception_handler_entered(&mut self, func: FuncId, handler: Offset);
}

/// Hook that remembers every handler entry, in order.
///
/// Clones share the same log, so a test can keep one handle and attach another.
#[derive(Debug, Clone, Default)]
pub struct RecordingDebugger {
    entries: Rc<RefCell<Vec<(FuncId, Offset)>>>,
}

impl RecordingDebugger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<(FuncId, Offset)> {
        self.entries.borrow().clone()
    }
}

impl DebuggerHook for RecordingDebugger {
    fn exception_handler_entered(&mut self, func: FuncId, handler: Offset) {
        self.entries.borrow_mut().push((func, handler));
    }
}
