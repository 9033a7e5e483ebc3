//! Fault unwinding.
//!
//! [`VmContext::exception_handler`] is where every exception that escapes
//! interpreted execution comes back into VM control. It classifies the
//! exception, records a [`Fault`] for it when needed, and runs the unwind loop:
//!
//! 1. On the first visit to a frame for a fault, discard the frame's
//!    temporaries, pending activation records included.
//! 2. Find the innermost protected region covering the faulting offset and
//!    search it and its parents for a handler. Entries already consulted for
//!    this fault in this frame (`handled_count`) are skipped, which is what lets
//!    a fault handler re-raise without being selected again.
//! 3. Without a handler, tear the frame down and continue in the caller, unless
//!    the frame was the first of its nesting level.
//!
//! Every reference released here goes through [`swallow`]: a destructor that
//! fails during unwinding never interrupts teardown and never becomes a fault.

use strum::Display;

use crate::{
    bytecode::{EhHandler, FuncId, Offset, Opcode},
    context::VmContext,
    error::{HostException, Raised, Release},
    fault::Fault,
    frame::FrameId,
    heap::{Finalizer, ObjectId, ReleaseWithHeap},
    stack::Slot,
    tracer::UnwindTracer,
    value::Value,
};

/// What the embedding engine should do once the unwinder returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum UnwindAction {
    /// Continue interpreting at the context's `fp`/`pc`.
    ResumeVM,
    /// No handler in this nesting level took the fault; it stays on the
    /// in-flight record for the embedder to report.
    Propagate,
}

/// Discards a release failure, reporting it to the tracer.
#[inline]
pub(crate) fn swallow<Tr: UnwindTracer>(tracer: &mut Tr, result: Release) {
    if let Err(error) = result {
        tracer.on_release_failure(&error);
    }
}

impl<F: Finalizer, Tr: UnwindTracer> VmContext<F, Tr> {
    /// Entry point for an exception crossing back into VM control.
    ///
    /// Never panics on its own account and never fails: inconsistent state is
    /// turned into a host fault of kind `InvariantViolation` and unwound like
    /// any other.
    pub fn exception_handler(&mut self, raised: Raised) -> UnwindAction {
        match raised {
            Raised::PrepareUnwind => self.continue_unwind(),
            Raised::Object(object) => {
                if !self.heap.is_live(object) {
                    return self.raise_host(HostException::invariant("thrown object is not live"));
                }
                self.heap.inc_ref(object);
                self.push_fault(Fault::user(object));
                self.enter_unwinder()
            }
            Raised::SwitchMode => UnwindAction::ResumeVM,
            Raised::SwitchModeBuiltin => match self.unwind_builtin_frame() {
                Ok(()) => {
                    self.stack.push_null();
                    UnwindAction::ResumeVM
                }
                Err(exception) => self.raise_host(exception),
            },
            other => {
                let exception = other.into_host_exception().unwrap_or_else(HostException::unknown);
                self.raise_host(exception)
            }
        }
    }

    /// A fault handler finished: keep propagating the innermost fault from the
    /// offset it was raised at.
    fn continue_unwind(&mut self) -> UnwindAction {
        let Some(mut fault) = self.faults.last().cloned() else {
            return self.raise_host(HostException::invariant("continue-unwind with no fault in flight"));
        };
        let Some(offset) = fault.saved_raise_offset.take() else {
            return self.raise_host(HostException::invariant("continue-unwind with no saved raise offset"));
        };
        self.tracer.on_offset_restored(offset);
        self.unwind(offset, fault)
    }

    fn raise_host(&mut self, exception: HostException) -> UnwindAction {
        self.push_fault(Fault::host(exception));
        self.enter_unwinder()
    }

    /// Appends a fault to the in-flight record. The caller has already taken
    /// the reference the record owns for a user exception.
    fn push_fault(&mut self, fault: Fault) {
        self.faults.push(fault);
        if let Some(fault) = self.faults.last() {
            self.tracer.on_fault_pushed(fault, self.faults.len());
        }
    }

    /// Unwinds the innermost fault from the current program counter.
    fn enter_unwinder(&mut self) -> UnwindAction {
        let Some(fault) = self.faults.last().cloned() else {
            return UnwindAction::Propagate;
        };
        self.unwind(self.pc, fault)
    }

    /// Runs the unwind loop for `fault`, a private copy of the innermost
    /// in-flight fault, starting at `fault_offset` in the current frame.
    ///
    /// The copy is written back to the record only on resume; handlers may
    /// push further faults while this one is being processed.
    pub(crate) fn unwind(&mut self, fault_offset: Offset, fault: Fault) -> UnwindAction {
        self.tracer.on_unwind_enter(fault_offset, &fault);
        let action = self.unwind_frames(fault_offset, fault);
        self.tracer.on_unwind_leave(action);
        action
    }

    fn unwind_frames(&mut self, mut fault_offset: Offset, mut fault: Fault) -> UnwindAction {
        loop {
            let Some(fp) = self.fp else {
                return UnwindAction::Propagate;
            };
            let Some(frame) = self.frames.get(fp) else {
                return UnwindAction::Propagate;
            };
            let func_id = frame.func;
            let last_frame_for_nesting = frame.caller.is_none();
            self.tracer
                .on_frame(self.repo.func(func_id).name(), fault_offset, fault.handled_count);

            // A nonzero count means a handler in this frame already ran for this
            // fault; its temporaries were discarded on the first visit.
            if fault.handled_count == 0 {
                self.discard_stack_temps(fp);
            }

            if let Some(eh) = self.repo.func(func_id).find_eh(fault_offset)
                && let Some(handler) = self.check_handlers(func_id, eh, &mut fault, fault_offset)
            {
                self.pc = handler;
                self.faults.replace_last(fault);
                return UnwindAction::ResumeVM;
            }

            fault.handled_count = 0;
            fault_offset = self.tear_down_frame(fp);
            if last_frame_for_nesting {
                self.tracer.on_nesting_exhausted();
                return UnwindAction::Propagate;
            }
        }
    }

    /// Searches entry `eh` of `func_id` and its parents for a handler.
    ///
    /// Returns the handler offset to resume at, or `None` to propagate.
    fn check_handlers(&mut self, func_id: FuncId, mut eh: usize, fault: &mut Fault, fault_offset: Offset) -> Option<Offset> {
        let Self {
            repo,
            classes,
            heap,
            pending_exception,
            debugger,
            tracer,
            ..
        } = self;
        let func = repo.func(func_id);
        let unit = repo.unit(func_id.unit());

        let mut nesting = 0;
        loop {
            debug_assert!(nesting <= fault.handled_count);
            let entry = &func.ehtab()[eh];
            tracer.on_handler_check(eh, nesting, fault.handled_count);

            if nesting == fault.handled_count {
                fault.handled_count += 1;
                match &entry.handler {
                    EhHandler::Fault { handler } => {
                        // The raise offset, not the funclet's pc: a re-raise resumes the search here.
                        fault.saved_raise_offset = Some(fault_offset);
                        tracer.on_fault_handler(func_id, *handler, fault_offset);
                        if let Some(hook) = debugger.as_mut() {
                            hook.exception_handler_entered(func_id, *handler);
                        }
                        return Some(*handler);
                    }
                    // Catch clauses never run while a host exception is
                    // active, whether it is the fault itself or pending.
                    EhHandler::Catch { clauses } => {
                        if let Some(object) = fault.user_exception()
                            && pending_exception.is_none()
                        {
                            for clause in clauses {
                                let Some(name) = unit.named_entity(clause.class_name) else {
                                    continue;
                                };
                                let matched = classes
                                    .lookup(name)
                                    .is_some_and(|class| heap.instance_of(object, class, classes));
                                tracer.on_catch_candidate(name, matched);
                                if matched {
                                    tracer.on_catch_entered(func_id, clause.handler);
                                    if let Some(hook) = debugger.as_mut() {
                                        hook.exception_handler_entered(func_id, clause.handler);
                                    }
                                    return Some(clause.handler);
                                }
                            }
                        }
                    }
                }
            }

            eh = entry.parent? as usize;
            nesting += 1;
        }
    }

    /// Pops everything above `fp`'s temporaries boundary.
    fn discard_stack_temps(&mut self, fp: FrameId) {
        let Some(frame) = self.frames.get(fp) else {
            return;
        };
        let boundary = frame.temps_base(self.repo.func(frame.func));
        let count = self.pop_to(boundary);
        if count > 0 {
            self.tracer.on_temps_discarded(count);
        }
    }

    /// Pops and releases slots until the stack is `boundary` slots deep.
    ///
    /// Pending constructor records mark their object no-destruct first: an
    /// object whose constructor never ran must not be finalized.
    fn pop_to(&mut self, boundary: usize) -> usize {
        let mut count = 0;
        while self.stack.len() > boundary {
            let Some(slot) = self.stack.pop() else {
                break;
            };
            count += 1;
            match slot {
                Slot::Value(value) => swallow(&mut self.tracer, value.release_with_heap(&mut self.heap)),
                Slot::PreLive(call) => {
                    if call.from_ctor
                        && let Some(this) = call.this
                    {
                        self.heap.set_no_destruct(this);
                    }
                    swallow(&mut self.tracer, call.this.release_with_heap(&mut self.heap));
                }
                Slot::Frame(id) => {
                    debug_assert!(self.frames.get(id).is_none(), "live activation record above frame boundary");
                }
            }
        }
        count
    }

    /// Tears down frame `fp`, moving `fp`/`pc` to the caller's call site.
    ///
    /// Returns the offset unwinding continues from in the caller.
    fn tear_down_frame(&mut self, fp: FrameId) -> Offset {
        let Some(frame) = self.frames.remove(fp) else {
            return self.pc;
        };
        let func = self.repo.func(frame.func);
        let returning = self
            .repo
            .unit(frame.func.unit())
            .op_at(self.pc)
            .is_some_and(Opcode::is_return);
        let generator = func.is_generator();
        let num_slots = func.num_slots_in_frame() as usize;
        let temps_base = frame.temps_base(func);

        if frame.from_ctor
            && let Some(this) = frame.this
        {
            self.heap.set_no_destruct(this);
        }

        // Generator locals live in generator storage and are left alone.
        if !generator && let Some(locals_base) = frame.locals_base() {
            // Anything a handler left behind on a later visit.
            self.pop_to(temps_base);
            // A returning frame may have released some or all of its locals
            // already; those slots hold `Uninit` and release nothing.
            self.free_locals_unwind(locals_base, num_slots, frame.this);
            self.stack.ndiscard(num_slots);
            self.stack.discard_ar();
        }

        let prev = self.prev_vm_state(&frame);
        self.tracer.on_frame_torn_down(self.repo.func(frame.func).name(), returning);
        self.fp = prev.fp;
        self.pc = prev.pc;
        prev.pc
    }

    /// Releases a frame's locals and `this`, swallowing destructor failures.
    ///
    /// Every slot is set to `Uninit` before the first release, so nothing a
    /// destructor observes can reach a dead local.
    fn free_locals_unwind(&mut self, locals_base: usize, count: usize, this: Option<ObjectId>) {
        let locals: Vec<Value> = (locals_base..locals_base + count)
            .map(|index| self.stack.take_value(index))
            .collect();
        for value in locals.into_iter().rev() {
            swallow(&mut self.tracer, value.release_with_heap(&mut self.heap));
        }
        swallow(&mut self.tracer, this.release_with_heap(&mut self.heap));
    }

    /// Tears down the current frame when it belongs to a builtin switching
    /// execution mode. Builtins have no protected regions and are never
    /// generators, so this is teardown without any handler search.
    fn unwind_builtin_frame(&mut self) -> Result<(), HostException> {
        let fp = self
            .fp
            .ok_or_else(|| HostException::invariant("builtin mode switch outside any frame"))?;
        let frame = self
            .frames
            .get(fp)
            .ok_or_else(|| HostException::invariant("builtin mode switch on a dead frame"))?;
        let func = self.repo.func(frame.func);
        let (Some(locals_base), true) = (frame.locals_base(), func.is_builtin()) else {
            return Err(HostException::invariant("builtin mode switch from a non-builtin frame"));
        };
        let num_slots = func.num_slots_in_frame() as usize;
        let temps_base = frame.temps_base(func);
        let Some(frame) = self.frames.remove(fp) else {
            return Err(HostException::invariant("builtin mode switch on a dead frame"));
        };

        self.pop_to(temps_base);
        self.free_locals_unwind(locals_base, num_slots, frame.this);
        self.stack.ndiscard(num_slots);
        self.stack.discard_ar();

        let prev = self.prev_vm_state(&frame);
        self.tracer.on_frame_torn_down(self.repo.func(frame.func).name(), false);
        self.fp = prev.fp;
        self.pc = prev.pc;
        Ok(())
    }
}
