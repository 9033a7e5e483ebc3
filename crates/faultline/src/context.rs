//! The VM context: everything the unwinder reads and mutates.
//!
//! [`VmContext`] owns the loaded code, the object heap, the evaluation stack,
//! the frame arena, the current frame pointer and program counter, and the
//! in-flight fault record. Besides the unwinder itself (see `unwind.rs`) it
//! exposes the small set of operations an interpreter performs around calls,
//! returns and handler entry, so an embedder can drive it directly.

use std::mem;

use crate::{
    bytecode::{FuncId, Offset, Repo},
    class::{ClassId, ClassTable},
    config::VmConfig,
    debugger::DebuggerHook,
    error::{HostException, Release},
    fault::{Fault, FaultStack},
    frame::{Frame, FrameId, FrameStorage, Frames, GeneratorId},
    heap::{Finalizer, Heap, NoopFinalizer, ObjectId, ReleaseWithHeap},
    stack::{PreLiveCall, Slot, Stack},
    tracer::{NoopTracer, UnwindTracer},
    unwind::swallow,
    value::Value,
};

/// A resume point: a frame and a program counter within its unit.
///
/// `fp` is `None` outside of any frame, i.e. in the embedder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub fp: Option<FrameId>,
    pub pc: Offset,
}

/// Execution state for one VM.
///
/// Generic over the heap's [`Finalizer`] and the [`UnwindTracer`], both of
/// which compile away with their no-op defaults.
#[derive(Debug)]
pub struct VmContext<F: Finalizer = NoopFinalizer, Tr: UnwindTracer = NoopTracer> {
    pub(crate) repo: Repo,
    pub(crate) classes: ClassTable,
    pub(crate) heap: Heap<F>,
    pub(crate) stack: Stack,
    pub(crate) frames: Frames,
    /// Local storage of generator bodies, indexed by `GeneratorId`.
    pub(crate) generators: Vec<Vec<Value>>,
    pub(crate) fp: Option<FrameId>,
    pub(crate) pc: Offset,
    pub(crate) faults: FaultStack,
    /// A host exception raised by native code that has not been handled yet.
    /// While set, catch handlers are never selected.
    pub(crate) pending_exception: Option<HostException>,
    /// Saved positions of the enclosing nesting levels, innermost last.
    pub(crate) nesting: Vec<Position>,
    pub(crate) debugger: Option<Box<dyn DebuggerHook>>,
    pub(crate) tracer: Tr,
}

impl<F: Finalizer, Tr: UnwindTracer> VmContext<F, Tr> {
    #[must_use]
    pub fn new(repo: Repo, classes: ClassTable, config: &VmConfig, finalizer: F, tracer: Tr) -> Self {
        Self {
            repo,
            classes,
            heap: Heap::new(config.heap_capacity, finalizer),
            stack: Stack::new(config.stack_capacity),
            frames: Frames::new(config.frame_capacity),
            generators: Vec::new(),
            fp: None,
            pc: 0,
            faults: FaultStack::new(config.fault_capacity),
            pending_exception: None,
            nesting: Vec::new(),
            debugger: None,
            tracer,
        }
    }

    #[must_use]
    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    #[must_use]
    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    #[must_use]
    pub fn heap(&self) -> &Heap<F> {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap<F> {
        &mut self.heap
    }

    #[must_use]
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// The current frame, or `None` when control is in the embedder.
    #[must_use]
    pub fn fp(&self) -> Option<FrameId> {
        self.fp
    }

    #[must_use]
    pub fn pc(&self) -> Offset {
        self.pc
    }

    /// Moves the program counter, as the interpreter does while executing.
    pub fn set_pc(&mut self, pc: Offset) {
        self.pc = pc;
    }

    #[must_use]
    pub fn position(&self) -> Position {
        Position { fp: self.fp, pc: self.pc }
    }

    #[must_use]
    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id)
    }

    /// Number of live frames across all nesting levels.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn current_func(&self) -> Option<FuncId> {
        self.frames.get(self.fp?).map(Frame::func)
    }

    #[must_use]
    pub fn faults(&self) -> &FaultStack {
        &self.faults
    }

    /// Replaces the in-flight record, e.g. with one restored from a snapshot.
    pub fn restore_faults(&mut self, faults: FaultStack) -> FaultStack {
        mem::replace(&mut self.faults, faults)
    }

    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut Tr {
        &mut self.tracer
    }

    #[must_use]
    pub fn generator_locals(&self, id: GeneratorId) -> &[Value] {
        self.generators.get(id.0 as usize).map(Vec::as_slice).unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Nesting levels
    // ------------------------------------------------------------------

    /// Starts a new VM nesting level, as a re-entry from native code would.
    ///
    /// The first frame called afterwards has no caller; tearing it down ends
    /// the level and returns to the position saved here.
    pub fn enter_nesting(&mut self) {
        self.nesting.push(self.position());
        self.fp = None;
    }

    /// Leaves the innermost nesting level, restoring the saved position.
    pub fn exit_nesting(&mut self) -> Option<Position> {
        let saved = self.nesting.pop()?;
        self.fp = saved.fp;
        self.pc = saved.pc;
        Some(saved)
    }

    #[must_use]
    pub fn nesting_depth(&self) -> usize {
        self.nesting.len()
    }

    /// The position control returns to when `frame` is popped.
    ///
    /// For the first frame of a nesting level that is the position saved by
    /// [`enter_nesting`](Self::enter_nesting).
    pub(crate) fn prev_vm_state(&self, frame: &Frame) -> Position {
        match frame.caller {
            Some(caller) => {
                let base = self
                    .frames
                    .get(caller)
                    .map_or(0, |caller| self.repo.func(caller.func).base());
                Position {
                    fp: Some(caller),
                    pc: base + frame.return_offset,
                }
            }
            None => self.nesting.last().copied().unwrap_or_default(),
        }
    }

    // ------------------------------------------------------------------
    // Calls and returns
    // ------------------------------------------------------------------

    pub fn push_value(&mut self, value: Value) {
        self.stack.push_value(value);
    }

    /// Pushes a pending activation record for `func`. `this`, if any, is owned by the record.
    pub fn push_pre_live(&mut self, func: FuncId, this: Option<ObjectId>) {
        self.stack.push_pre_live(PreLiveCall {
            func,
            this,
            from_ctor: false,
        });
    }

    /// Allocates an instance of `class` and pushes a pending constructor record for it.
    ///
    /// The record owns the new object's only reference.
    pub fn push_ctor(&mut self, func: FuncId, class: ClassId) -> ObjectId {
        let this = self.heap.allocate(class);
        self.stack.push_pre_live(PreLiveCall {
            func,
            this: Some(this),
            from_ctor: true,
        });
        this
    }

    /// Enters the topmost pending record, whose `nargs` arguments sit above it.
    ///
    /// Arguments become the first locals; the remaining locals start out unset.
    /// The call site is the current program counter.
    ///
    /// # Panics
    /// Panics if the slot below the arguments is not a pending record, if the
    /// callee is a generator, or if it has fewer locals than `nargs`.
    pub fn call(&mut self, nargs: u32) -> FrameId {
        let nargs = nargs as usize;
        let record = self
            .stack
            .len()
            .checked_sub(nargs + 1)
            .expect("VmContext::call: stack is shallower than the argument count");
        let call = match self.stack.slot(record) {
            Some(Slot::PreLive(call)) => *call,
            other => panic!("VmContext::call: expected a pending record at {record}, found {other:?}"),
        };
        let func = self.repo.func(call.func);
        assert!(!func.is_generator(), "VmContext::call: use enter_generator for generator bodies");
        assert!(
            nargs <= func.num_locals() as usize,
            "VmContext::call: {} takes at most {} arguments",
            func.name(),
            func.num_locals()
        );
        let num_slots = func.num_slots_in_frame() as usize;
        let entry = func.base();

        let frame = Frame {
            func: call.func,
            caller: self.fp,
            return_offset: self.call_site_offset(),
            this: call.this,
            from_ctor: call.from_ctor,
            storage: FrameStorage::Stack { record },
        };
        let id = self.frames.insert(frame);
        self.stack.make_live(record, id);
        for _ in nargs..num_slots {
            self.stack.push_value(Value::Uninit);
        }
        self.fp = Some(id);
        self.pc = entry;
        id
    }

    /// Enters a generator body whose locals live in generator storage.
    ///
    /// # Panics
    /// Panics if `func` is not a generator or `args` exceeds its locals.
    pub fn enter_generator(&mut self, func: FuncId, args: Vec<Value>) -> FrameId {
        let meta = self.repo.func(func);
        assert!(meta.is_generator(), "VmContext::enter_generator: {} is not a generator", meta.name());
        assert!(args.len() <= meta.num_locals() as usize, "VmContext::enter_generator: too many arguments");
        let num_slots = meta.num_slots_in_frame() as usize;
        let entry = meta.base();

        let mut locals = args;
        locals.resize_with(num_slots, || Value::Uninit);
        let generator = GeneratorId(u32::try_from(self.generators.len()).expect("generator storage exceeds u32"));
        self.generators.push(locals);

        let frame = Frame {
            func,
            caller: self.fp,
            return_offset: self.call_site_offset(),
            this: None,
            from_ctor: false,
            storage: FrameStorage::Generator {
                temps_base: self.stack.len(),
                generator,
            },
        };
        let id = self.frames.insert(frame);
        self.fp = Some(id);
        self.pc = entry;
        id
    }

    fn call_site_offset(&self) -> Offset {
        match self.fp.and_then(|fp| self.frames.get(fp)) {
            Some(caller) => self.pc.saturating_sub(self.repo.func(caller.func).base()),
            None => 0,
        }
    }

    /// Reads local `index` of the current frame.
    #[must_use]
    pub fn local(&self, index: u32) -> Option<&Value> {
        let frame = self.frames.get(self.fp?)?;
        match frame.storage {
            FrameStorage::Stack { .. } => self.stack.value(frame.locals_base()? + index as usize),
            FrameStorage::Generator { generator, .. } => self.generators.get(generator.0 as usize)?.get(index as usize),
        }
    }

    /// Stores into local `index` of the current frame, releasing the old value.
    ///
    /// # Panics
    /// Panics if there is no current frame or `index` is out of range.
    pub fn set_local(&mut self, index: u32, value: Value) -> Release {
        let frame = self
            .fp
            .and_then(|fp| self.frames.get(fp))
            .expect("VmContext::set_local: no current frame");
        assert!(
            index < self.repo.func(frame.func).num_slots_in_frame(),
            "VmContext::set_local: local {index} out of range"
        );
        let old = match frame.storage {
            FrameStorage::Stack { record } => self.stack.replace_value(record + 1 + index as usize, value),
            FrameStorage::Generator { generator, .. } => {
                mem::replace(&mut self.generators[generator.0 as usize][index as usize], value)
            }
        };
        old.release_with_heap(&mut self.heap)
    }

    /// Releases the current frame's locals and `this`, as a return opcode does
    /// before leaving the frame.
    ///
    /// Every reference is released even if some destructors fail; the first
    /// failure is returned. Generator locals are left to the generator.
    pub fn release_locals_for_return(&mut self) -> Release {
        let Some(frame) = self.fp.and_then(|fp| self.frames.get_mut(fp)) else {
            return Ok(());
        };
        let this = frame.this.take();
        let locals = match frame.locals_base() {
            Some(base) => {
                let count = self.repo.func(frame.func).num_slots_in_frame() as usize;
                (base..base + count).map(|index| self.stack.take_value(index)).collect()
            }
            None => Vec::new(),
        };

        let mut first_error = Ok(());
        for value in locals.into_iter().rev() {
            let result = value.release_with_heap(&mut self.heap);
            if first_error.is_ok() {
                first_error = result;
            }
        }
        let result = this.release_with_heap(&mut self.heap);
        if first_error.is_ok() {
            first_error = result;
        }
        first_error
    }

    // ------------------------------------------------------------------
    // Host exceptions and tooling
    // ------------------------------------------------------------------

    /// Records a host exception raised outside the unwinder. Catch handlers are
    /// skipped until it is cleared.
    pub fn set_pending_exception(&mut self, exception: HostException) {
        self.pending_exception = Some(exception);
    }

    pub fn clear_pending_exception(&mut self) -> Option<HostException> {
        self.pending_exception.take()
    }

    #[must_use]
    pub fn pending_exception(&self) -> Option<&HostException> {
        self.pending_exception.as_ref()
    }

    pub fn attach_debugger(&mut self, hook: Box<dyn DebuggerHook>) {
        self.debugger = Some(hook);
    }

    pub fn detach_debugger(&mut self) -> Option<Box<dyn DebuggerHook>> {
        self.debugger.take()
    }

    // ------------------------------------------------------------------
    // Consuming faults
    // ------------------------------------------------------------------

    /// What a catch handler's entry does: takes the innermost fault off the
    /// record and pushes the caught object, transferring the record's reference
    /// to the stack.
    ///
    /// Returns `None`, leaving the record alone, if the innermost fault is not a
    /// user exception.
    pub fn catch_fault(&mut self) -> Option<ObjectId> {
        let object = self.faults.last()?.user_exception()?;
        self.faults.pop();
        self.stack.push_value(Value::Ref(object));
        Some(object)
    }

    /// Removes the innermost fault once the embedder has reported it, dropping
    /// the record's reference to a user exception.
    ///
    /// A failing destructor is reported to the tracer and otherwise ignored.
    pub fn discharge_fault(&mut self) -> Option<Fault> {
        let fault = self.faults.pop()?;
        if let Some(object) = fault.user_exception() {
            swallow(&mut self.tracer, self.heap.dec_ref(object));
        }
        Some(fault)
    }
}
