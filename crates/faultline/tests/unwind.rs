//! Tests for the unwind loop: handler search, frame teardown, and how the two
//! interact across nested regions and frames.

use faultline::{
    ClassId, ClassTable, FaultKind, FuncDecl, FuncId, HostException, Opcode, Raised, RecordingFinalizer,
    RecordingTracer, Repo, TraceEvent, UnitBuilder, UnwindAction, Value, VmConfig, VmContext,
};
use pretty_assertions::assert_eq;

type Vm = VmContext<RecordingFinalizer, RecordingTracer>;

/// Loads a single unit into a fresh VM with the given classes and finalizer.
fn load(builder: UnitBuilder, classes: ClassTable, finalizer: RecordingFinalizer) -> Vm {
    let mut repo = Repo::new();
    repo.add_unit(builder.build().expect("unit should build"));
    VmContext::new(repo, classes, &VmConfig::new(), finalizer, RecordingTracer::new())
}

fn func(vm: &Vm, name: &str) -> FuncId {
    vm.repo()
        .lookup_func(name)
        .unwrap_or_else(|| panic!("no function {name}"))
}

fn exception_classes() -> (ClassTable, ClassId, ClassId) {
    let mut classes = ClassTable::new();
    let base = classes.define("Exception", None);
    let derived = classes.define("LogicException", Some(base));
    (classes, base, derived)
}

/// Enters a fresh nesting level and calls `name` with no arguments.
fn enter(vm: &mut Vm, name: &str) {
    let f = func(vm, name);
    vm.enter_nesting();
    vm.push_pre_live(f, None);
    vm.call(0);
}

// === Scenario A: catch in the faulting frame ===

#[test]
fn catch_in_faulting_frame_resumes_at_handler() {
    let (classes, base, _) = exception_classes();
    let mut b = UnitBuilder::new("a.php");
    b.begin_func(FuncDecl::new("f").locals(1));
    let region = b.begin_try();
    b.emit(Opcode::Null);
    let throw_at = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_try(region);
    let handler = b.current_offset();
    b.emit(Opcode::Catch);
    b.emit(Opcode::RetC);
    b.catch_handler(region, "Exception", handler);
    b.end_func();
    let mut vm = load(b, classes, RecordingFinalizer::new());

    enter(&mut vm, "f");
    let fp = vm.fp();
    vm.push_value(Value::Null);
    let thrown = vm.heap_mut().allocate(base);
    vm.set_pc(throw_at);

    assert_eq!(vm.exception_handler(Raised::Object(thrown)), UnwindAction::ResumeVM);
    assert_eq!(vm.pc(), handler);
    assert_eq!(vm.fp(), fp);
    assert_eq!(vm.frame_count(), 1);
    // Temporaries above the frame are gone, the frame's own slots are not.
    assert_eq!(vm.stack().len(), 2);

    let fault = vm.faults().last().unwrap();
    assert_eq!(fault.kind(), FaultKind::UserException);
    assert_eq!(fault.handled_count(), 1);
    assert_eq!(fault.saved_raise_offset(), None);
    assert_eq!(vm.heap().refcount(thrown), 2);

    assert_eq!(vm.catch_fault(), Some(thrown));
    assert!(vm.faults().is_empty());
    assert_eq!(vm.stack().top(), Some(&faultline::Slot::Value(Value::Ref(thrown))));
    assert_eq!(vm.heap().refcount(thrown), 2);
}

// === Scenario B: nothing handles it ===

#[test]
fn unhandled_fault_tears_down_every_frame_of_the_nesting_level() {
    let (mut classes, _, _) = exception_classes();
    let thing = classes.define("Thing", None);
    let x = classes.define("X", None);
    let mut b = UnitBuilder::new("b.php");
    b.begin_func(FuncDecl::new("f").locals(1));
    b.emit_u16(Opcode::FPushFunc, 1);
    let f_call = b.current_offset();
    b.emit_u8(Opcode::FCall, 0);
    b.emit(Opcode::RetC);
    b.end_func();
    b.begin_func(FuncDecl::new("g").locals(1));
    b.emit(Opcode::Null);
    let g_throw = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_func();
    let mut vm = load(b, classes, RecordingFinalizer::new());

    vm.set_pc(77);
    enter(&mut vm, "f");
    let in_f = vm.heap_mut().allocate(thing);
    vm.set_local(0, Value::Ref(in_f)).unwrap();
    vm.set_pc(f_call);
    let g = func(&vm, "g");
    vm.push_pre_live(g, None);
    vm.call(0);
    let in_g = vm.heap_mut().allocate(thing);
    vm.set_local(0, Value::Ref(in_g)).unwrap();
    let temp = vm.heap_mut().allocate(thing);
    vm.push_value(Value::Ref(temp));
    let thrown = vm.heap_mut().allocate(x);
    vm.set_pc(g_throw);

    assert_eq!(vm.exception_handler(Raised::Object(thrown)), UnwindAction::Propagate);
    assert_eq!(vm.frame_count(), 0);
    assert_eq!(vm.fp(), None);
    assert_eq!(vm.pc(), 77);
    assert!(vm.stack().is_empty());
    assert_eq!(vm.heap().finalizer().finalized(), &[temp, in_g, in_f]);
    assert_eq!(vm.faults().len(), 1);
    assert_eq!(vm.heap().refcount(thrown), 2);

    assert_eq!(
        vm.tracer().events(),
        &[
            TraceEvent::FaultPushed {
                description: format!("[user exception] {thrown} handled=0"),
                depth: 1,
            },
            TraceEvent::UnwindEnter { offset: g_throw },
            TraceEvent::Frame {
                func_name: "g".to_owned(),
                offset: g_throw,
                handled_count: 0,
            },
            TraceEvent::TempsDiscarded { count: 1 },
            TraceEvent::FrameTornDown {
                func_name: "g".to_owned(),
                returning: false,
            },
            TraceEvent::Frame {
                func_name: "f".to_owned(),
                offset: f_call,
                handled_count: 0,
            },
            TraceEvent::FrameTornDown {
                func_name: "f".to_owned(),
                returning: false,
            },
            TraceEvent::NestingExhausted,
            TraceEvent::UnwindLeave {
                action: UnwindAction::Propagate,
            },
        ]
    );

    let fault = vm.discharge_fault().unwrap();
    assert_eq!(fault.user_exception(), Some(thrown));
    assert_eq!(vm.heap().refcount(thrown), 1);
}

#[test]
fn caller_catch_takes_fault_from_callee() {
    let (classes, base, _) = exception_classes();
    let mut b = UnitBuilder::new("b.php");
    b.begin_func(FuncDecl::new("f"));
    let region = b.begin_try();
    b.emit_u16(Opcode::FPushFunc, 1);
    let f_call = b.current_offset();
    b.emit_u8(Opcode::FCall, 0);
    b.end_try(region);
    b.emit(Opcode::RetC);
    let handler = b.current_offset();
    b.emit(Opcode::Catch);
    b.emit(Opcode::RetC);
    b.catch_handler(region, "Exception", handler);
    b.end_func();
    b.begin_func(FuncDecl::new("g").locals(2));
    let g_throw = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_func();
    let mut vm = load(b, classes, RecordingFinalizer::new());

    enter(&mut vm, "f");
    let f_frame = vm.fp();
    vm.set_pc(f_call);
    let g = func(&vm, "g");
    vm.push_pre_live(g, None);
    vm.call(0);
    vm.set_pc(g_throw);
    let thrown = vm.heap_mut().allocate(base);

    assert_eq!(vm.exception_handler(Raised::Object(thrown)), UnwindAction::ResumeVM);
    assert_eq!(vm.fp(), f_frame);
    assert_eq!(vm.pc(), handler);
    assert_eq!(vm.frame_count(), 1);
    assert_eq!(vm.stack().len(), 1);
}

// === Scenario C: a fault handler re-raises ===

/// `f` has `try { try { throw } finally { unwind } } catch (Exception) {}`.
fn nested_finally_in_catch() -> (Vm, ClassId, u32, u32, u32) {
    let (classes, base, _) = exception_classes();
    let mut b = UnitBuilder::new("c.php");
    b.begin_func(FuncDecl::new("f").locals(1));
    let outer = b.begin_try();
    let inner = b.begin_try();
    b.emit(Opcode::Null);
    let throw_at = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_try(inner);
    let skip = b.emit_jump(Opcode::Jmp);
    let fault_handler = b.current_offset();
    b.emit(Opcode::Unwind);
    b.end_try(outer);
    b.patch_jump(skip);
    b.emit(Opcode::RetC);
    let catch_handler = b.current_offset();
    b.emit(Opcode::Catch);
    b.emit(Opcode::RetC);
    b.fault_handler(inner, fault_handler);
    b.catch_handler(outer, "Exception", catch_handler);
    b.end_func();
    let vm = load(b, classes, RecordingFinalizer::new());
    (vm, base, throw_at, fault_handler, catch_handler)
}

#[test]
fn rethrow_from_fault_handler_searches_the_parent_entry() {
    let (mut vm, base, throw_at, fault_handler, catch_handler) = nested_finally_in_catch();
    enter(&mut vm, "f");
    let thrown = vm.heap_mut().allocate(base);
    vm.set_pc(throw_at);

    assert_eq!(vm.exception_handler(Raised::Object(thrown)), UnwindAction::ResumeVM);
    assert_eq!(vm.pc(), fault_handler);
    let fault = vm.faults().last().unwrap();
    assert_eq!(fault.handled_count(), 1);
    assert_eq!(fault.saved_raise_offset(), Some(throw_at));

    // The funclet ran to its Unwind instruction.
    vm.tracer_mut().clear();
    assert_eq!(vm.exception_handler(Raised::PrepareUnwind), UnwindAction::ResumeVM);
    assert_eq!(vm.pc(), catch_handler);
    let fault = vm.faults().last().unwrap();
    assert_eq!(fault.handled_count(), 2);
    assert_eq!(fault.saved_raise_offset(), None);
    assert_eq!(vm.faults().len(), 1);

    assert_eq!(
        vm.tracer().events(),
        &[
            TraceEvent::OffsetRestored { offset: throw_at },
            TraceEvent::UnwindEnter { offset: throw_at },
            TraceEvent::Frame {
                func_name: "f".to_owned(),
                offset: throw_at,
                handled_count: 1,
            },
            TraceEvent::HandlerCheck {
                entry: 1,
                nesting: 0,
                handled_count: 1,
            },
            TraceEvent::HandlerCheck {
                entry: 0,
                nesting: 1,
                handled_count: 1,
            },
            TraceEvent::CatchCandidate {
                class_name: "Exception".to_owned(),
                matched: true,
            },
            TraceEvent::CatchEntered { handler: catch_handler },
            TraceEvent::UnwindLeave {
                action: UnwindAction::ResumeVM,
            },
        ]
    );
}

#[test]
fn fault_handler_is_not_selected_twice() {
    let mut b = UnitBuilder::new("c.php");
    b.begin_func(FuncDecl::new("f"));
    let region = b.begin_try();
    let throw_at = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_try(region);
    let handler = b.current_offset();
    b.emit(Opcode::Unwind);
    b.fault_handler(region, handler);
    b.end_func();
    let mut vm = load(b, ClassTable::new(), RecordingFinalizer::new());

    enter(&mut vm, "f");
    vm.set_pc(throw_at);
    let host = Raised::Host(HostException::fatal("out of memory"));
    assert_eq!(vm.exception_handler(host), UnwindAction::ResumeVM);
    assert_eq!(vm.pc(), handler);

    assert_eq!(vm.exception_handler(Raised::PrepareUnwind), UnwindAction::Propagate);
    let entered = vm
        .tracer()
        .events()
        .iter()
        .filter(|event| matches!(event, TraceEvent::FaultHandlerEntered { .. }))
        .count();
    assert_eq!(entered, 1);
    assert_eq!(vm.frame_count(), 0);
}

#[test]
fn nested_fault_handlers_run_innermost_first() {
    let mut b = UnitBuilder::new("c.php");
    b.begin_func(FuncDecl::new("f"));
    let outer = b.begin_try();
    let inner = b.begin_try();
    let throw_at = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_try(inner);
    let inner_handler = b.current_offset();
    b.emit(Opcode::Unwind);
    b.end_try(outer);
    let outer_handler = b.current_offset();
    b.emit(Opcode::Unwind);
    b.fault_handler(inner, inner_handler);
    b.fault_handler(outer, outer_handler);
    b.end_func();
    let mut vm = load(b, ClassTable::new(), RecordingFinalizer::new());

    enter(&mut vm, "f");
    vm.set_pc(throw_at);
    let raised = Raised::Host(HostException::unknown());
    assert_eq!(vm.exception_handler(raised), UnwindAction::ResumeVM);
    assert_eq!(vm.pc(), inner_handler);

    // The outer funclet must also see the original raise offset, not the
    // offset of the inner funclet's Unwind.
    assert_eq!(vm.exception_handler(Raised::PrepareUnwind), UnwindAction::ResumeVM);
    assert_eq!(vm.pc(), outer_handler);
    assert_eq!(vm.faults().last().unwrap().saved_raise_offset(), Some(throw_at));

    assert_eq!(vm.exception_handler(Raised::PrepareUnwind), UnwindAction::Propagate);
    assert_eq!(vm.frame_count(), 0);
}

// === Scenario D: constructor failure ===

#[test]
fn object_under_construction_is_not_finalized() {
    let (mut classes, base, _) = exception_classes();
    let widget = classes.define("Widget", None);
    let mut b = UnitBuilder::new("d.php");
    b.begin_func(FuncDecl::new("main"));
    b.emit_u16(Opcode::FPushCtor, 1);
    let call_site = b.current_offset();
    b.emit_u8(Opcode::FCall, 0);
    b.emit(Opcode::RetC);
    b.end_func();
    b.begin_func(FuncDecl::new("Widget::__construct").locals(1));
    let throw_at = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_func();
    let mut vm = load(b, classes, RecordingFinalizer::new());

    enter(&mut vm, "main");
    vm.set_pc(call_site);
    let ctor = func(&vm, "Widget::__construct");
    let this = vm.push_ctor(ctor, widget);
    let frame = vm.call(0);
    assert!(vm.frame(frame).unwrap().is_from_ctor());
    vm.set_pc(throw_at);
    let thrown = vm.heap_mut().allocate(base);

    assert_eq!(vm.exception_handler(Raised::Object(thrown)), UnwindAction::Propagate);
    assert!(!vm.heap().is_live(this));
    assert!(!vm.heap().finalizer().was_finalized(this));
}

#[test]
fn pending_constructor_record_is_not_finalized() {
    let (mut classes, base, _) = exception_classes();
    let widget = classes.define("Widget", None);
    let plain = classes.define("Plain", None);
    let mut b = UnitBuilder::new("d.php");
    b.begin_func(FuncDecl::new("main"));
    b.emit_u16(Opcode::FPushCtor, 1);
    b.emit_u16(Opcode::FPushFunc, 2);
    let throw_at = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_func();
    b.begin_func(FuncDecl::new("Widget::__construct"));
    b.emit(Opcode::RetC);
    b.end_func();
    b.begin_func(FuncDecl::new("helper"));
    b.emit(Opcode::RetC);
    b.end_func();
    let mut vm = load(b, classes, RecordingFinalizer::new());

    enter(&mut vm, "main");
    let ctor = func(&vm, "Widget::__construct");
    let helper = func(&vm, "helper");
    let under_construction = vm.push_ctor(ctor, widget);
    let receiver = vm.heap_mut().allocate(plain);
    vm.push_pre_live(helper, Some(receiver));
    vm.set_pc(throw_at);
    let thrown = vm.heap_mut().allocate(base);

    assert_eq!(vm.exception_handler(Raised::Object(thrown)), UnwindAction::Propagate);
    assert!(!vm.heap().is_live(under_construction));
    assert!(!vm.heap().is_live(receiver));
    assert_eq!(vm.heap().finalizer().finalized(), &[receiver]);
}

// === Teardown ===

#[test]
fn returning_frame_locals_are_released_once() {
    let (mut classes, _, _) = exception_classes();
    let thing = classes.define("Thing", None);
    let mut b = UnitBuilder::new("t.php");
    b.begin_func(FuncDecl::new("f").locals(2));
    b.emit_u16(Opcode::CGetL, 0);
    let ret_at = b.current_offset();
    b.emit(Opcode::RetC);
    b.end_func();
    let mut vm = load(b, classes, RecordingFinalizer::new());

    enter(&mut vm, "f");
    let shared = vm.heap_mut().allocate(thing);
    vm.heap_mut().inc_ref(shared);
    vm.set_local(0, Value::Ref(shared)).unwrap();
    let owned = vm.heap_mut().allocate(thing);
    vm.set_local(1, Value::Ref(owned)).unwrap();

    vm.release_locals_for_return().unwrap();
    assert_eq!(vm.heap().refcount(shared), 1);
    assert!(!vm.heap().is_live(owned));

    // The exit hook of the returning function fails.
    vm.set_pc(ret_at);
    let raised = Raised::Host(HostException::fatal("exit hook failed"));
    assert_eq!(vm.exception_handler(raised), UnwindAction::Propagate);
    assert_eq!(vm.heap().refcount(shared), 1);
    assert_eq!(vm.heap().finalizer().finalized(), &[owned]);
    assert!(vm.stack().is_empty());
    assert!(vm.tracer().events().contains(&TraceEvent::FrameTornDown {
        func_name: "f".to_owned(),
        returning: true,
    }));
}

#[test]
fn fault_at_return_before_locals_are_released_frees_them() {
    let (mut classes, _, _) = exception_classes();
    let thing = classes.define("Thing", None);
    let mut b = UnitBuilder::new("t.php");
    b.begin_func(FuncDecl::new("f").locals(2));
    b.emit_u16(Opcode::CGetL, 0);
    let ret_at = b.current_offset();
    b.emit(Opcode::RetC);
    b.end_func();
    let mut vm = load(b, classes, RecordingFinalizer::new());

    enter(&mut vm, "f");
    let first = vm.heap_mut().allocate(thing);
    vm.set_local(0, Value::Ref(first)).unwrap();
    let second = vm.heap_mut().allocate(thing);
    vm.set_local(1, Value::Ref(second)).unwrap();

    // Raised at the return opcode, before the return path touched any local.
    vm.set_pc(ret_at);
    let raised = Raised::Host(HostException::fatal("request aborted"));
    assert_eq!(vm.exception_handler(raised), UnwindAction::Propagate);
    assert!(!vm.heap().is_live(first));
    assert!(!vm.heap().is_live(second));
    assert_eq!(vm.heap().finalizer().finalized(), &[second, first]);
    assert!(vm.stack().is_empty());
    assert_eq!(vm.frame_count(), 0);
}

#[test]
fn throwing_destructors_do_not_stop_teardown() {
    let (mut classes, base, _) = exception_classes();
    let noisy = classes.define("Noisy", None);
    let mut b = UnitBuilder::new("t.php");
    b.begin_func(FuncDecl::new("f").locals(3));
    let throw_at = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_func();
    let mut vm = load(b, classes, RecordingFinalizer::new().throwing_for(noisy));

    enter(&mut vm, "f");
    let first = vm.heap_mut().allocate(noisy);
    let second = vm.heap_mut().allocate(noisy);
    vm.set_local(0, Value::Ref(first)).unwrap();
    vm.set_local(2, Value::Ref(second)).unwrap();
    vm.set_pc(throw_at);
    let thrown = vm.heap_mut().allocate(base);

    assert_eq!(vm.exception_handler(Raised::Object(thrown)), UnwindAction::Propagate);
    assert!(!vm.heap().is_live(first));
    assert!(!vm.heap().is_live(second));
    assert_eq!(vm.heap().finalizer().finalized(), &[second, first]);
    assert_eq!(vm.faults().len(), 1);
    let failures = vm
        .tracer()
        .events()
        .iter()
        .filter(|event| matches!(event, TraceEvent::ReleaseFailure { fatal: false, .. }))
        .count();
    assert_eq!(failures, 2);
}

#[test]
fn fatal_destructor_stops_further_finalizers() {
    let (mut classes, base, _) = exception_classes();
    let doom = classes.define("Doom", None);
    let plain = classes.define("Plain", None);
    let mut b = UnitBuilder::new("t.php");
    b.begin_func(FuncDecl::new("f").locals(2));
    let throw_at = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_func();
    let mut vm = load(b, classes, RecordingFinalizer::new().fatal_for(doom));

    enter(&mut vm, "f");
    let survivor = vm.heap_mut().allocate(plain);
    let doomed = vm.heap_mut().allocate(doom);
    vm.set_local(0, Value::Ref(survivor)).unwrap();
    vm.set_local(1, Value::Ref(doomed)).unwrap();
    vm.set_pc(throw_at);
    let thrown = vm.heap_mut().allocate(base);

    assert_eq!(vm.exception_handler(Raised::Object(thrown)), UnwindAction::Propagate);
    assert!(vm.heap().is_fatal_mode());
    assert!(!vm.heap().is_live(survivor));
    assert_eq!(vm.heap().finalizer().finalized(), &[doomed]);
    let fatal = vm
        .tracer()
        .events()
        .iter()
        .filter(|event| matches!(event, TraceEvent::ReleaseFailure { fatal: true, .. }))
        .count();
    assert_eq!(fatal, 2);
}

#[test]
fn generator_locals_survive_teardown() {
    let (mut classes, base, _) = exception_classes();
    let thing = classes.define("Thing", None);
    let mut b = UnitBuilder::new("g.php");
    b.begin_func(FuncDecl::new("main"));
    let resume_at = b.current_offset();
    b.emit(Opcode::Nop);
    b.emit(Opcode::RetC);
    b.end_func();
    b.begin_func(FuncDecl::new("gen").locals(2).generator());
    b.emit(Opcode::Null);
    let throw_at = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_func();
    let mut vm = load(b, classes, RecordingFinalizer::new());

    enter(&mut vm, "main");
    vm.set_pc(resume_at);
    let gen_func = func(&vm, "gen");
    let kept = vm.heap_mut().allocate(thing);
    let frame = vm.enter_generator(gen_func, vec![Value::Ref(kept)]);
    let generator = vm.frame(frame).unwrap().generator().unwrap();
    vm.push_value(Value::Null);
    vm.set_pc(throw_at);
    let thrown = vm.heap_mut().allocate(base);

    assert_eq!(vm.exception_handler(Raised::Object(thrown)), UnwindAction::Propagate);
    assert_eq!(vm.frame_count(), 0);
    assert!(vm.heap().is_live(kept));
    assert_eq!(vm.generator_locals(generator), &[Value::Ref(kept), Value::Uninit]);
    assert!(vm.stack().is_empty());
}

// === Nesting levels ===

#[test]
fn propagation_stops_at_the_nesting_boundary() {
    let (classes, base, _) = exception_classes();
    let mut b = UnitBuilder::new("n.php");
    b.begin_func(FuncDecl::new("outer").locals(1));
    let native_call = b.current_offset();
    b.emit(Opcode::NativeImpl);
    b.emit(Opcode::RetC);
    b.end_func();
    b.begin_func(FuncDecl::new("callback"));
    let throw_at = b.current_offset();
    b.emit(Opcode::Throw);
    b.end_func();
    let mut vm = load(b, classes, RecordingFinalizer::new());

    enter(&mut vm, "outer");
    let outer_frame = vm.fp();
    vm.set_pc(native_call);

    // Native code re-enters the VM to run a callback.
    vm.enter_nesting();
    let callback = func(&vm, "callback");
    vm.push_pre_live(callback, None);
    vm.call(0);
    vm.set_pc(throw_at);
    let thrown = vm.heap_mut().allocate(base);

    assert_eq!(vm.exception_handler(Raised::Object(thrown)), UnwindAction::Propagate);
    assert_eq!(vm.fp(), outer_frame);
    assert_eq!(vm.pc(), native_call);
    assert_eq!(vm.frame_count(), 1);
    assert_eq!(vm.stack().len(), 2);
    assert_eq!(vm.nesting_depth(), 2);
}
