//! The evaluation stack.
//!
//! One growable vector of [`Slot`]s, growing upward. A live frame that keeps its
//! locals on the stack occupies a contiguous block:
//!
//! ```text
//! | Frame(id) | local 0 .. local n | iterator slots | temporaries ... |
//!   record     locals_base                          temps_base
//! ```
//!
//! Pending activation records (calls whose arguments are still being
//! evaluated) sit among the temporaries of the calling frame until `call`
//! turns them into a `Frame` record.

use crate::{bytecode::FuncId, frame::FrameId, heap::ObjectId, value::Value};

/// An activation record that has been pushed but not yet entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreLiveCall {
    pub func: FuncId,
    /// The object being constructed or the bound receiver. Owned by the record.
    pub this: Option<ObjectId>,
    /// True when the record was pushed to run a constructor.
    pub from_ctor: bool,
}

/// One stack slot.
#[derive(Debug, PartialEq, Eq)]
pub enum Slot {
    Value(Value),
    PreLive(PreLiveCall),
    /// The activation record of a live frame.
    Frame(FrameId),
}

#[derive(Debug, Default)]
pub struct Stack {
    slots: Vec<Slot>,
}

impl Stack {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Number of occupied slots; also the index the next push lands at.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push_value(&mut self, value: Value) {
        self.slots.push(Slot::Value(value));
    }

    pub fn push_null(&mut self) {
        self.push_value(Value::Null);
    }

    pub fn push_pre_live(&mut self, call: PreLiveCall) {
        self.slots.push(Slot::PreLive(call));
    }

    /// Pops the topmost slot, transferring ownership to the caller.
    pub fn pop(&mut self) -> Option<Slot> {
        self.slots.pop()
    }

    #[must_use]
    pub fn top(&self) -> Option<&Slot> {
        self.slots.last()
    }

    #[must_use]
    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Returns the value at `index`, or `None` if the slot is not a value.
    #[must_use]
    pub fn value(&self, index: usize) -> Option<&Value> {
        match self.slots.get(index)? {
            Slot::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Moves the value out of `index`, leaving `Uninit` behind.
    ///
    /// Non-value slots are left alone and yield `Uninit`.
    pub fn take_value(&mut self, index: usize) -> Value {
        match self.slots.get_mut(index) {
            Some(Slot::Value(value)) => std::mem::replace(value, Value::Uninit),
            _ => Value::Uninit,
        }
    }

    /// Stores `value` at `index`, returning the previous value for the caller to release.
    ///
    /// # Panics
    /// Panics if `index` does not hold a value slot.
    pub fn replace_value(&mut self, index: usize, value: Value) -> Value {
        match self.slots.get_mut(index) {
            Some(Slot::Value(slot)) => std::mem::replace(slot, value),
            other => panic!("Stack::replace_value: slot {index} is {other:?}, not a value"),
        }
    }

    /// Discards the top `count` slots without releasing anything.
    ///
    /// Callers must already have released (or neutralized) the values being dropped.
    pub fn ndiscard(&mut self, count: usize) {
        debug_assert!(count <= self.slots.len(), "Stack::ndiscard: underflow");
        debug_assert!(
            self.slots[self.slots.len().saturating_sub(count)..]
                .iter()
                .all(|slot| matches!(slot, Slot::Value(Value::Uninit | Value::Null | Value::Bool(_) | Value::Int(_)))),
            "Stack::ndiscard: discarding slots that still own references"
        );
        self.slots.truncate(self.slots.len().saturating_sub(count));
    }

    /// Discards the activation record on top of the stack.
    pub fn discard_ar(&mut self) {
        let slot = self.slots.pop();
        debug_assert!(
            matches!(slot, Some(Slot::Frame(_))),
            "Stack::discard_ar: top slot is {slot:?}, not an activation record"
        );
    }

    /// Replaces the pending record at `index` with the activation record of `frame`.
    pub(crate) fn make_live(&mut self, index: usize, frame: FrameId) {
        debug_assert!(
            matches!(self.slots.get(index), Some(Slot::PreLive(_))),
            "Stack::make_live: slot {index} is not a pending record"
        );
        self.slots[index] = Slot::Frame(frame);
    }
}
