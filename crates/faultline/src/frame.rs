//! Activation records and the arena that owns them.
//!
//! Frames refer to their caller by [`FrameId`] rather than by address; `None`
//! marks the first frame of a VM nesting level. Ids of torn-down frames are
//! recycled through a free list, same as heap slots.

use crate::{
    bytecode::{Func, FuncId, Offset},
    heap::ObjectId,
};

/// Handle to a frame in the [`Frames`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u32);

impl FrameId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("frame arena exceeds u32"))
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a generator's local storage inside the VM context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeneratorId(pub(crate) u32);

/// Where a frame keeps its activation record and locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStorage {
    /// Activation record at stack index `record`, locals directly above it.
    Stack { record: usize },
    /// Locals live in generator storage; only temporaries use the stack,
    /// starting at `temps_base`.
    Generator { temps_base: usize, generator: GeneratorId },
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub(crate) func: FuncId,
    pub(crate) caller: Option<FrameId>,
    /// Offset of the call site, relative to the caller's function base.
    pub(crate) return_offset: Offset,
    /// Owned reference to the receiver or the object under construction.
    pub(crate) this: Option<ObjectId>,
    pub(crate) from_ctor: bool,
    pub(crate) storage: FrameStorage,
}

impl Frame {
    #[must_use]
    pub fn func(&self) -> FuncId {
        self.func
    }

    /// The calling frame, or `None` for the first frame of a nesting level.
    #[must_use]
    pub fn caller(&self) -> Option<FrameId> {
        self.caller
    }

    #[must_use]
    pub fn this(&self) -> Option<ObjectId> {
        self.this
    }

    #[must_use]
    pub fn is_from_ctor(&self) -> bool {
        self.from_ctor
    }

    #[must_use]
    pub fn storage(&self) -> FrameStorage {
        self.storage
    }

    #[must_use]
    pub fn generator(&self) -> Option<GeneratorId> {
        match self.storage {
            FrameStorage::Generator { generator, .. } => Some(generator),
            FrameStorage::Stack { .. } => None,
        }
    }

    /// Stack index of local 0, for frames whose locals are on the stack.
    #[must_use]
    pub fn locals_base(&self) -> Option<usize> {
        match self.storage {
            FrameStorage::Stack { record } => Some(record + 1),
            FrameStorage::Generator { .. } => None,
        }
    }

    /// Stack index of the frame's first temporary: everything at or above it
    /// belongs to expression evaluation in this frame.
    #[must_use]
    pub fn temps_base(&self, func: &Func) -> usize {
        match self.storage {
            FrameStorage::Stack { record } => record + 1 + func.num_slots_in_frame() as usize,
            FrameStorage::Generator { temps_base, .. } => temps_base,
        }
    }
}

/// Arena of live frames.
#[derive(Debug, Default)]
pub struct Frames {
    entries: Vec<Option<Frame>>,
    free_list: Vec<FrameId>,
}

impl Frames {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_list: Vec::new(),
        }
    }

    pub fn insert(&mut self, frame: Frame) -> FrameId {
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(frame);
            id
        } else {
            let id = FrameId::new(self.entries.len());
            self.entries.push(Some(frame));
            id
        }
    }

    /// Removes a frame, making its id available for reuse.
    pub fn remove(&mut self, id: FrameId) -> Option<Frame> {
        let frame = self.entries.get_mut(id.index())?.take()?;
        self.free_list.push(id);
        Some(frame)
    }

    #[must_use]
    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.entries.get(id.index())?.as_ref()
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.entries.get_mut(id.index())?.as_mut()
    }

    /// Number of live frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() - self.free_list.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
