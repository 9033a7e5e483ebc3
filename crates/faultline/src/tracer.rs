//! Unwinder tracing infrastructure.
//!
//! The unwinder reports what it does through the [`UnwindTracer`] trait. The VM
//! context carries the tracer as a type parameter, so with [`NoopTracer`] every
//! hook is monomorphized away and unwinding pays nothing for observability.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (production default) |
//! | [`StderrTracer`] | Human-readable unwind log to stderr |
//! | [`RecordingTracer`] | Full event recording for post-mortem or assertions |
//! | [`HandlerCoverageTracer`] | Which handlers were ever entered |
//!
//! # Usage
//!
//! ```ignore
//! // Production (zero overhead):
//! let ctx = VmContext::new(repo, classes, &config, NoopFinalizer, NoopTracer);
//!
//! // Debugging:
//! let ctx = VmContext::new(repo, classes, &config, NoopFinalizer, StderrTracer::with_limit(200));
//! ```

use ahash::AHashSet;

use crate::{
    bytecode::{FuncId, Offset},
    error::ReleaseError,
    fault::Fault,
    unwind::UnwindAction,
};

/// Event emitted during unwinding, as captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A new fault was appended to the in-flight record.
    FaultPushed { description: String, depth: usize },
    /// The unwind loop started at `offset`.
    UnwindEnter { offset: Offset },
    /// The unwind loop visited a frame.
    Frame {
        func_name: String,
        offset: Offset,
        handled_count: u32,
    },
    /// Temporaries above a frame boundary were discarded.
    TempsDiscarded { count: usize },
    /// A handler-table entry was examined.
    HandlerCheck { entry: usize, nesting: u32, handled_count: u32 },
    /// A fault (finally) handler was selected.
    FaultHandlerEntered { handler: Offset, raise_offset: Offset },
    /// A catch clause was tested.
    CatchCandidate { class_name: String, matched: bool },
    /// A catch handler was selected.
    CatchEntered { handler: Offset },
    /// A frame was torn down.
    FrameTornDown { func_name: String, returning: bool },
    /// A release failure during cleanup was discarded.
    ReleaseFailure { message: String, fatal: bool },
    /// The first frame of a nesting level was torn down.
    NestingExhausted,
    /// A continue-unwind signal restored the saved raise offset.
    OffsetRestored { offset: Offset },
    /// The unwind loop finished.
    UnwindLeave { action: UnwindAction },
}

/// Trait for unwinder tracing.
///
/// All methods have default no-op implementations; implementations override
/// only the hooks they care about.
pub trait UnwindTracer: std::fmt::Debug {
    /// Called after a fault is appended to the in-flight record.
    ///
    /// # Arguments
    /// * `fault` - The fault just pushed
    /// * `depth` - Number of in-flight faults after the push
    #[inline(always)]
    fn on_fault_pushed(&mut self, _fault: &Fault, _depth: usize) {}

    /// Called when the unwind loop starts.
    #[inline(always)]
    fn on_unwind_enter(&mut self, _offset: Offset, _fault: &Fault) {}

    /// Called at the top of each unwind-loop iteration.
    ///
    /// # Arguments
    /// * `func_name` - Name of the function owning the current frame
    /// * `offset` - The faulting offset within that frame
    /// * `handled_count` - Entries of this frame already consulted
    #[inline(always)]
    fn on_frame(&mut self, _func_name: &str, _offset: Offset, _handled_count: u32) {}

    /// Called after temporaries are discarded; only when at least one was.
    #[inline(always)]
    fn on_temps_discarded(&mut self, _count: usize) {}

    /// Called for every handler-table entry the search visits.
    ///
    /// # Arguments
    /// * `entry` - Index into the function's handler table
    /// * `nesting` - How many parent links the search has followed
    /// * `handled_count` - The fault's count at the time of the check
    #[inline(always)]
    fn on_handler_check(&mut self, _entry: usize, _nesting: u32, _handled_count: u32) {}

    /// Called when a fault (finally) handler is selected.
    #[inline(always)]
    fn on_fault_handler(&mut self, _func: FuncId, _handler: Offset, _raise_offset: Offset) {}

    /// Called for each catch clause tested against a user exception.
    #[inline(always)]
    fn on_catch_candidate(&mut self, _class_name: &str, _matched: bool) {}

    /// Called when a catch handler is selected.
    #[inline(always)]
    fn on_catch_entered(&mut self, _func: FuncId, _handler: Offset) {}

    /// Called after a frame is torn down.
    #[inline(always)]
    fn on_frame_torn_down(&mut self, _func_name: &str, _returning: bool) {}

    /// Called for every release failure that cleanup discards.
    #[inline(always)]
    fn on_release_failure(&mut self, _error: &ReleaseError) {}

    /// Called when the first frame of a nesting level has been torn down.
    #[inline(always)]
    fn on_nesting_exhausted(&mut self) {}

    /// Called when a continue-unwind signal picks up the saved raise offset.
    #[inline(always)]
    fn on_offset_restored(&mut self, _offset: Offset) {}

    /// Called when the unwind loop returns.
    #[inline(always)]
    fn on_unwind_leave(&mut self, _action: UnwindAction) {}
}

// ============================================================================
// NoopTracer: zero-cost production default
// ============================================================================

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl UnwindTracer for NoopTracer {}

// ============================================================================
// StderrTracer: human-readable unwind log
// ============================================================================

/// Tracer that prints a human-readable unwind log to stderr.
///
/// Output format:
/// ```text
/// >>> UNWIND from 12  [user exception] #0 handled=0
///   [frame] g                offset=12   handled=0
///   ... discarded 2 temporaries
///   --- torn down g
///   [frame] f                offset=30   handled=0
///   ??? catch Exception      matched=true
///   +++ catch handler at 41
/// <<< ResumeVM
/// ```
#[derive(Debug)]
pub struct StderrTracer {
    /// Maximum number of lines before output stops. None = unlimited.
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            limit: None,
            count: 0,
            stopped: false,
        }
    }

    /// Creates a stderr tracer that stops after `limit` lines.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            count: 0,
            stopped: false,
        }
    }

    fn line(&mut self, line: std::fmt::Arguments<'_>) {
        if self.stopped {
            return;
        }
        eprintln!("{line}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} lines) ---");
            self.stopped = true;
        }
    }
}

impl Default for StderrTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl UnwindTracer for StderrTracer {
    fn on_fault_pushed(&mut self, fault: &Fault, depth: usize) {
        self.line(format_args!("!!! FAULT {fault}  depth={depth}"));
    }

    fn on_unwind_enter(&mut self, offset: Offset, fault: &Fault) {
        self.line(format_args!(">>> UNWIND from {offset}  {fault}"));
    }

    fn on_frame(&mut self, func_name: &str, offset: Offset, handled_count: u32) {
        self.line(format_args!(
            "  [frame] {func_name:<16} offset={offset:<4} handled={handled_count}"
        ));
    }

    fn on_temps_discarded(&mut self, count: usize) {
        self.line(format_args!("  ... discarded {count} temporaries"));
    }

    fn on_fault_handler(&mut self, _func: FuncId, handler: Offset, raise_offset: Offset) {
        self.line(format_args!("  +++ fault handler at {handler} (raised at {raise_offset})"));
    }

    fn on_catch_candidate(&mut self, class_name: &str, matched: bool) {
        self.line(format_args!("  ??? catch {class_name:<16} matched={matched}"));
    }

    fn on_catch_entered(&mut self, _func: FuncId, handler: Offset) {
        self.line(format_args!("  +++ catch handler at {handler}"));
    }

    fn on_frame_torn_down(&mut self, func_name: &str, returning: bool) {
        if returning {
            self.line(format_args!("  --- torn down {func_name} (returning)"));
        } else {
            self.line(format_args!("  --- torn down {func_name}"));
        }
    }

    fn on_release_failure(&mut self, error: &ReleaseError) {
        self.line(format_args!("  ~~~ swallowed: {error}"));
    }

    fn on_nesting_exhausted(&mut self) {
        self.line(format_args!("  === nesting level exhausted"));
    }

    fn on_offset_restored(&mut self, offset: Offset) {
        self.line(format_args!(">>> CONTINUE from {offset}"));
    }

    fn on_unwind_leave(&mut self, action: UnwindAction) {
        self.line(format_args!("<<< {action}"));
    }
}

// ============================================================================
// RecordingTracer: full event recording
// ============================================================================

/// Tracer that records every event into a `Vec<TraceEvent>`.
///
/// The most expensive tracer (allocates per event); meant for tests and
/// post-mortem inspection of short unwinds.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recording tracer that stops recording after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    /// Forgets everything recorded so far.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn record(&mut self, event: TraceEvent) {
        if self.limit.is_some_and(|limit| self.events.len() >= limit) {
            return;
        }
        self.events.push(event);
    }
}

impl UnwindTracer for RecordingTracer {
    fn on_fault_pushed(&mut self, fault: &Fault, depth: usize) {
        self.record(TraceEvent::FaultPushed {
            description: fault.to_string(),
            depth,
        });
    }

    fn on_unwind_enter(&mut self, offset: Offset, _fault: &Fault) {
        self.record(TraceEvent::UnwindEnter { offset });
    }

    fn on_frame(&mut self, func_name: &str, offset: Offset, handled_count: u32) {
        self.record(TraceEvent::Frame {
            func_name: func_name.to_owned(),
            offset,
            handled_count,
        });
    }

    fn on_temps_discarded(&mut self, count: usize) {
        self.record(TraceEvent::TempsDiscarded { count });
    }

    fn on_handler_check(&mut self, entry: usize, nesting: u32, handled_count: u32) {
        self.record(TraceEvent::HandlerCheck {
            entry,
            nesting,
            handled_count,
        });
    }

    fn on_fault_handler(&mut self, _func: FuncId, handler: Offset, raise_offset: Offset) {
        self.record(TraceEvent::FaultHandlerEntered { handler, raise_offset });
    }

    fn on_catch_candidate(&mut self, class_name: &str, matched: bool) {
        self.record(TraceEvent::CatchCandidate {
            class_name: class_name.to_owned(),
            matched,
        });
    }

    fn on_catch_entered(&mut self, _func: FuncId, handler: Offset) {
        self.record(TraceEvent::CatchEntered { handler });
    }

    fn on_frame_torn_down(&mut self, func_name: &str, returning: bool) {
        self.record(TraceEvent::FrameTornDown {
            func_name: func_name.to_owned(),
            returning,
        });
    }

    fn on_release_failure(&mut self, error: &ReleaseError) {
        self.record(TraceEvent::ReleaseFailure {
            message: error.to_string(),
            fatal: error.is_fatal(),
        });
    }

    fn on_nesting_exhausted(&mut self) {
        self.record(TraceEvent::NestingExhausted);
    }

    fn on_offset_restored(&mut self, offset: Offset) {
        self.record(TraceEvent::OffsetRestored { offset });
    }

    fn on_unwind_leave(&mut self, action: UnwindAction) {
        self.record(TraceEvent::UnwindLeave { action });
    }
}

// ============================================================================
// HandlerCoverageTracer: which handlers ran
// ============================================================================

/// Tracer that records every handler the unwinder transferred control to.
///
/// Useful for checking that a test suite actually exercises each fault and
/// catch handler of a unit.
#[derive(Debug, Default)]
pub struct HandlerCoverageTracer {
    entered: AHashSet<(FuncId, Offset)>,
}

impl HandlerCoverageTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn was_entered(&self, func: FuncId, handler: Offset) -> bool {
        self.entered.contains(&(func, handler))
    }

    /// Number of distinct handlers entered.
    #[must_use]
    pub fn coverage_count(&self) -> usize {
        self.entered.len()
    }
}

impl UnwindTracer for HandlerCoverageTracer {
    #[inline]
    fn on_fault_handler(&mut self, func: FuncId, handler: Offset, _raise_offset: Offset) {
        self.entered.insert((func, handler));
    }

    #[inline]
    fn on_catch_entered(&mut self, func: FuncId, handler: Offset) {
        self.entered.insert((func, handler));
    }
}
