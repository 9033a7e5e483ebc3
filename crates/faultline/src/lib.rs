#![doc = include_str!("../../../README.md")]
// first: every other module releases through the heap
mod heap;

mod bytecode;
mod class;
mod config;
mod context;
mod debugger;
mod error;
mod fault;
mod frame;
mod stack;
pub mod tracer;
mod unwind;
mod value;

pub use crate::{
    bytecode::{
        CatchClause, EhEntry, EhHandler, Func, FuncDecl, FuncId, JumpLabel, NamedEntityId, Offset, Opcode,
        RegionLabel, Repo, Unit, UnitBuilder, UnitId,
    },
    class::{ClassDef, ClassId, ClassTable},
    config::{DEFAULT_FAULT_CAPACITY, DEFAULT_FRAME_CAPACITY, DEFAULT_HEAP_CAPACITY, DEFAULT_STACK_CAPACITY, VmConfig},
    context::{Position, VmContext},
    debugger::{DebuggerHook, RecordingDebugger},
    error::{BuildError, HostException, HostExceptionKind, Raised, Release, ReleaseError},
    fault::{Fault, FaultException, FaultKind, FaultStack},
    frame::{Frame, FrameId, FrameStorage, GeneratorId},
    heap::{Finalizer, Heap, NoopFinalizer, ObjectId, RecordingFinalizer, ReleaseWithHeap},
    stack::{PreLiveCall, Slot, Stack},
    tracer::{HandlerCoverageTracer, NoopTracer, RecordingTracer, StderrTracer, TraceEvent, UnwindTracer},
    unwind::UnwindAction,
    value::Value,
};
