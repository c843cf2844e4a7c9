//! End-to-end scenarios: dialScript source through the full pipeline
//! (lex -> parse -> compile -> serialize -> load -> execute) with observable
//! platform output checked at the end.

use dialscript::{
    AppletRunner, BytecodeModule, CollectPlatform, ExecOutcome, TickStatus, Value, VmState, compile_source,
};
use pretty_assertions::assert_eq;

fn compile(source: &str) -> BytecodeModule {
    match compile_source(source) {
        Ok(module) => module,
        Err(errors) => panic!("compile failed: {errors:?}"),
    }
}

/// Compiles, round-trips through the wire format, and runs to completion.
fn run(source: &str) -> (VmState, CollectPlatform) {
    let bytes = compile(source).serialize();
    let module = BytecodeModule::deserialize(&bytes).expect("serialized module loads");
    let mut vm = VmState::new(module);
    let mut platform = CollectPlatform::new();
    loop {
        match vm.execute(10_000, &mut platform) {
            ExecOutcome::Ok => {}
            ExecOutcome::Finished => break,
            other => panic!("unexpected outcome {other:?} (error: {:?})", vm.error()),
        }
    }
    (vm, platform)
}

#[test]
fn test_arithmetic_and_print() {
    let (vm, platform) = run("var x: 40; assign x x + 2; print(x);");
    assert_eq!(platform.console, vec!["42"]);
    assert_eq!(vm.stack_len(), 0);
}

#[test]
fn test_template_concatenation() {
    let (_, platform) = run("var n: 3; print(`n=${n}`);");
    assert_eq!(platform.console, vec!["n=3"]);
}

#[test]
fn test_function_call_and_return() {
    let (vm, platform) = run("function add(a: int, b: int): int { return a + b; } print(add(2, 5));");
    assert_eq!(platform.console, vec!["7"]);
    assert_eq!(vm.stack_len(), 0);
}

#[test]
fn test_exception_unwinding() {
    let (vm, platform) = run("try { var a: 1 / 0; print(\"no\"); } catch (e) { print(\"caught\"); }");
    assert_eq!(platform.console, vec!["caught"]);
    assert_eq!(vm.error(), None);
}

#[test]
fn test_class_method_dispatch() {
    let (_, platform) = run(
        "class C { v: int; constructor(x: int) { assign this.v x; } get(): int { return this.v; } } \
         print(C(9).get());",
    );
    assert_eq!(platform.console, vec!["9"]);
}

#[test]
fn test_interval_callback_increments_global() {
    let module = compile(
        "var count: 0; \
         function tick() { assign count count + 1; } \
         os.timer.setInterval(tick, 10);",
    );
    let mut runner = AppletRunner::from_module(module);
    let mut platform = CollectPlatform::new();

    assert_eq!(runner.run(1000, &mut platform), TickStatus::Finished);

    // Three host-driven fire events...
    for _ in 0..3 {
        platform.advance(10);
        assert_eq!(runner.fire_due_timers(&mut platform).expect("fire"), 1);
    }
    // ...then a final execute slice.
    let _ = runner.vm_mut().execute(1000, &mut platform);

    assert_eq!(runner.vm().global("count"), Some(Value::I32(3)));
}

// ===== Boundary behaviors =====

#[test]
fn test_for_loop_never_enters_body() {
    let (_, platform) = run("for (var i: 0; i < 0; assign i i + 1) { print(\"body\"); } print(\"after\");");
    assert_eq!(platform.console, vec!["after"]);
}

#[test]
fn test_uncaught_division_by_zero_errors() {
    let module = compile("var a: 1 / 0;");
    let mut vm = VmState::new(module);
    let mut platform = CollectPlatform::new();
    assert_eq!(
        vm.execute(1000, &mut platform),
        ExecOutcome::Error("Division by zero".to_owned())
    );
}

#[test]
fn test_array_bounds_behavior() {
    let (vm, platform) = run(
        "var a: [10, 20]; \
         print(a[7]); \
         assign a[7] 99; \
         print(a[0]); print(a[1]);",
    );
    assert_eq!(platform.console, vec!["null", "10", "20"]);
    assert_eq!(vm.error(), None);
}

#[test]
fn test_empty_template_is_empty_string() {
    let (_, platform) = run("var s: ``; print(`<${s}>`);");
    assert_eq!(platform.console, vec!["<>"]);
}

#[test]
fn test_nested_control_flow() {
    let (_, platform) = run(
        "var total: 0; \
         for (var i: 1; i <= 4; assign i i + 1) { \
             if (i % 2 = 0) { assign total total + i; } else { assign total total - 1; } \
         } \
         print(total);",
    );
    // i=1: -1, i=2: +2, i=3: -1, i=4: +4 -> 4
    assert_eq!(platform.console, vec!["4"]);
}

#[test]
fn test_ternary_and_logic() {
    let (_, platform) = run(
        "var a: 5; \
         print(a > 3 ? \"big\" : \"small\"); \
         print(a > 3 and a < 10 ? 1 : 0); \
         print(not (a = 5) or false ? \"odd\" : \"even\");",
    );
    assert_eq!(platform.console, vec!["big", "1", "even"]);
}

#[test]
fn test_float_arithmetic() {
    let (_, platform) = run("var x: 1.5; var y: x * 2; print(y); print(7 / 2); print(7.0 / 2);");
    assert_eq!(platform.console, vec!["3.0", "3", "3.5"]);
}

#[test]
fn test_hex_literals() {
    let (_, platform) = run("print(0x10); print(0xFF + 1);");
    assert_eq!(platform.console, vec!["16", "256"]);
}

#[test]
fn test_string_escapes_round_trip() {
    let (_, platform) = run("print('tab\\tend');");
    assert_eq!(platform.console, vec!["tab\tend"]);
}

#[test]
fn test_object_fields_default_null() {
    let (_, platform) = run("class P { x: int; } var p: P(); print(p.x);");
    assert_eq!(platform.console, vec!["null"]);
}

#[test]
fn test_recursive_function() {
    let (_, platform) = run(
        "function fib(n: int): int { \
             if (n < 2) { return n; } \
             return fib(n - 1) + fib(n - 2); \
         } \
         print(fib(10));",
    );
    assert_eq!(platform.console, vec!["55"]);
}

#[test]
fn test_template_preserves_inner_whitespace() {
    let (_, platform) = run("var a: 1; var b: 2; print(`a = ${a}, b = ${b}`);");
    assert_eq!(platform.console, vec!["a = 1, b = 2"]);
}

#[test]
fn test_while_with_budget_slicing() {
    let module = compile("var n: 0; while (n < 500) { assign n n + 1; } print(n);");
    let mut runner = AppletRunner::from_module(module);
    let mut platform = CollectPlatform::new();

    let mut ticks = 0;
    loop {
        match runner.tick(100, &mut platform) {
            TickStatus::Running => ticks += 1,
            TickStatus::Finished => break,
            other => panic!("unexpected status {other:?}"),
        }
        assert!(ticks < 1_000, "never finished");
    }
    assert!(ticks > 1, "budget did not slice execution");
    assert_eq!(platform.console, vec!["500"]);
}

#[test]
fn test_capability_surface_mix() {
    let (_, platform) = run(
        "os.display.clear(0); \
         os.display.drawText(10, 20, `w=${os.display.getWidth()}`, 0xFFFF, 1); \
         os.console.log(os.display.getHeight()); \
         print(os.encoder.getDelta());",
    );
    assert_eq!(platform.console, vec!["240", "0"]);
}

#[test]
fn test_parse_errors_abort_compile() {
    let errors = compile_source("var : 1;").unwrap_err();
    assert!(!errors.is_empty());
    assert!(errors[0].starts_with("Line 1:"));
}
