//! Construction-time configuration for a [`VmContext`](crate::VmContext).

use serde::{Deserialize, Serialize};

/// Initial evaluation-stack capacity, in slots.
pub const DEFAULT_STACK_CAPACITY: usize = 1024;

/// Initial frame-arena capacity.
pub const DEFAULT_FRAME_CAPACITY: usize = 64;

/// Initial heap capacity, in objects.
pub const DEFAULT_HEAP_CAPACITY: usize = 256;

/// Initial capacity of the in-flight fault record. Nested faults beyond a
/// handful are rare.
pub const DEFAULT_FAULT_CAPACITY: usize = 4;

/// Initial capacities for the storage a VM context owns.
///
/// All of these are hints: every structure grows on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub stack_capacity: usize,
    pub frame_capacity: usize,
    pub heap_capacity: usize,
    pub fault_capacity: usize,
}

impl VmConfig {
    /// Creates a configuration with the default capacities.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial evaluation-stack capacity.
    #[must_use]
    pub fn stack_capacity(mut self, slots: usize) -> Self {
        self.stack_capacity = slots;
        self
    }

    /// Sets the initial frame-arena capacity.
    #[must_use]
    pub fn frame_capacity(mut self, frames: usize) -> Self {
        self.frame_capacity = frames;
        self
    }

    /// Sets the initial heap capacity.
    #[must_use]
    pub fn heap_capacity(mut self, objects: usize) -> Self {
        self.heap_capacity = objects;
        self
    }

    /// Sets the initial capacity of the in-flight fault record.
    #[must_use]
    pub fn fault_capacity(mut self, faults: usize) -> Self {
        self.fault_capacity = faults;
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_capacity: DEFAULT_STACK_CAPACITY,
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            heap_capacity: DEFAULT_HEAP_CAPACITY,
            fault_capacity: DEFAULT_FAULT_CAPACITY,
        }
    }
}
