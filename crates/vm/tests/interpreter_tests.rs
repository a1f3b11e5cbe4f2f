//! End-to-end interpreter tests over hand-assembled programs.
//!
//! These play the role of the compiler front-end: build chunks through the
//! public surface, hand the script function to the VM, and check what
//! comes back.

use brio_vm::chunk::Chunk;
use brio_vm::gc::{GcFunction, GcPtr};
use brio_vm::{GcConfig, OpCode, RuntimeError, Value, Vm, VmConfig};

fn emit_constant(chunk: &mut Chunk, value: Value, line: u32) {
    let index = chunk.add_constant(value);
    chunk.write_op(OpCode::Constant, line);
    chunk.write(index, line);
}

fn emit_closure(chunk: &mut Chunk, function: GcPtr<GcFunction>, upvalues: &[(bool, u8)], line: u32) {
    let index = chunk.add_constant(Value::Function(function));
    chunk.write_op(OpCode::Closure, line);
    chunk.write(index, line);
    for &(is_local, slot) in upvalues {
        chunk.write(is_local as u8, line);
        chunk.write(slot, line);
    }
}

fn script(vm: &mut Vm, build: impl FnOnce(&mut Vm, &mut Chunk)) -> GcPtr<GcFunction> {
    let mut chunk = Chunk::new();
    build(vm, &mut chunk);
    vm.heap.alloc_function(0, 0, chunk, None)
}

fn function(
    vm: &mut Vm,
    name: &str,
    arity: usize,
    upvalue_count: usize,
    build: impl FnOnce(&mut Vm, &mut Chunk),
) -> GcPtr<GcFunction> {
    let mut chunk = Chunk::new();
    build(vm, &mut chunk);
    let name = vm.intern_string(name);
    vm.heap.alloc_function(arity, upvalue_count, chunk, Some(name))
}

fn number(value: Value) -> f64 {
    match value {
        Value::Number(n) => n,
        other => panic!("expected a number, got {:?}", other),
    }
}

#[test]
fn recursive_fibonacci() {
    // fib(n) = if n < 2 then n else fib(n - 1) + fib(n - 2), recursing
    // through slot 0 (the callee itself).
    let mut vm = Vm::new();
    let fib = function(&mut vm, "fib", 1, 0, |_, chunk| {
        chunk.write_op(OpCode::GetLocal, 1); //  0: n
        chunk.write(1, 1);
        emit_constant(chunk, Value::Number(2.0), 1); //  2
        chunk.write_op(OpCode::Less, 1); //  4
        chunk.write_op(OpCode::JumpIfFalse, 1); //  5: else -> 12
        chunk.write_u16(4, 1);
        chunk.write_op(OpCode::Pop, 2); //  8
        chunk.write_op(OpCode::GetLocal, 2); //  9: return n
        chunk.write(1, 2);
        chunk.write_op(OpCode::Return, 2); // 11
        chunk.write_op(OpCode::Pop, 3); // 12
        chunk.write_op(OpCode::GetLocal, 3); // 13: fib
        chunk.write(0, 3);
        chunk.write_op(OpCode::GetLocal, 3); // 15: n
        chunk.write(1, 3);
        emit_constant(chunk, Value::Number(1.0), 3); // 17
        chunk.write_op(OpCode::Subtract, 3); // 19
        chunk.write_op(OpCode::Call, 3); // 20: fib(n - 1)
        chunk.write(1, 3);
        chunk.write_op(OpCode::GetLocal, 3); // 22: fib
        chunk.write(0, 3);
        chunk.write_op(OpCode::GetLocal, 3); // 24: n
        chunk.write(1, 3);
        emit_constant(chunk, Value::Number(2.0), 3); // 26
        chunk.write_op(OpCode::Subtract, 3); // 28
        chunk.write_op(OpCode::Call, 3); // 29: fib(n - 2)
        chunk.write(1, 3);
        chunk.write_op(OpCode::Add, 3); // 31
        chunk.write_op(OpCode::Return, 3); // 32
    });

    let program = script(&mut vm, |_, chunk| {
        emit_closure(chunk, fib, &[], 1);
        emit_constant(chunk, Value::Number(10.0), 1);
        chunk.write_op(OpCode::Call, 1);
        chunk.write(1, 1);
        chunk.write_op(OpCode::Return, 1);
    });

    assert_eq!(number(vm.interpret(program).unwrap()), 55.0);
}

#[test]
fn counters_are_independent() {
    // Two counters from the same factory bump separate closed-over cells.
    let mut vm = Vm::new();
    let inc = function(&mut vm, "inc", 0, 1, |_, chunk| {
        chunk.write_op(OpCode::GetUpvalue, 1);
        chunk.write(0, 1);
        emit_constant(chunk, Value::Number(1.0), 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::SetUpvalue, 1);
        chunk.write(0, 1);
        chunk.write_op(OpCode::Return, 1);
    });
    let counter = function(&mut vm, "counter", 0, 0, |_, chunk| {
        emit_constant(chunk, Value::Number(0.0), 1); // n (frame slot 1)
        emit_closure(chunk, inc, &[(true, 1)], 1); // frame slot 2
        chunk.write_op(OpCode::GetLocal, 1);
        chunk.write(2, 1);
        chunk.write_op(OpCode::Return, 1);
    });

    let program = script(&mut vm, |_, chunk| {
        emit_closure(chunk, counter, &[], 1);
        chunk.write_op(OpCode::Call, 1); // a (slot 1)
        chunk.write(0, 1);
        emit_closure(chunk, counter, &[], 2);
        chunk.write_op(OpCode::Call, 2); // b (slot 2)
        chunk.write(0, 2);
        chunk.write_op(OpCode::GetLocal, 3); // a() -> 1
        chunk.write(1, 3);
        chunk.write_op(OpCode::Call, 3);
        chunk.write(0, 3);
        chunk.write_op(OpCode::Pop, 3);
        chunk.write_op(OpCode::GetLocal, 3); // a() -> 2
        chunk.write(1, 3);
        chunk.write_op(OpCode::Call, 3);
        chunk.write(0, 3);
        chunk.write_op(OpCode::Pop, 3);
        chunk.write_op(OpCode::GetLocal, 4); // b() -> 1
        chunk.write(2, 4);
        chunk.write_op(OpCode::Call, 4);
        chunk.write(0, 4);
        chunk.write_op(OpCode::GetLocal, 5); // a() -> 3
        chunk.write(1, 5);
        chunk.write_op(OpCode::Call, 5);
        chunk.write(0, 5);
        chunk.write_op(OpCode::DefineTuple, 5); // (b's 1, a's 3)
        chunk.write_op(OpCode::Return, 5);
    });

    let result = vm.interpret(program).unwrap();
    let tuple = match result {
        Value::Tuple(ptr) => vm.heap.tuple(ptr).clone(),
        other => panic!("expected a tuple, got {:?}", other),
    };
    assert_eq!(tuple.first, Value::Number(1.0));
    assert_eq!(tuple.second, Value::Number(3.0));
}

#[test]
fn accumulator_sum_via_tail_calls() {
    // sum(n, acc) = if n == 0 then acc else sum(n - 1, acc + n), a
    // million deep under a frame limit of 8.
    let config = VmConfig {
        max_frames: 8,
        ..Default::default()
    };
    let mut vm = Vm::with_config(config);
    let sum = function(&mut vm, "sum", 2, 0, |_, chunk| {
        chunk.write_op(OpCode::GetLocal, 1); //  0: n
        chunk.write(1, 1);
        emit_constant(chunk, Value::Number(0.0), 1); //  2
        chunk.write_op(OpCode::Equal, 1); //  4
        chunk.write_op(OpCode::JumpIfFalse, 1); //  5: else -> 12
        chunk.write_u16(4, 1);
        chunk.write_op(OpCode::Pop, 2); //  8
        chunk.write_op(OpCode::GetLocal, 2); //  9: return acc
        chunk.write(2, 2);
        chunk.write_op(OpCode::Return, 2); // 11
        chunk.write_op(OpCode::Pop, 3); // 12
        chunk.write_op(OpCode::GetLocal, 3); // 13: sum
        chunk.write(0, 3);
        chunk.write_op(OpCode::GetLocal, 3); // 15: n
        chunk.write(1, 3);
        emit_constant(chunk, Value::Number(1.0), 3); // 17
        chunk.write_op(OpCode::Subtract, 3); // 19: n - 1
        chunk.write_op(OpCode::GetLocal, 3); // 20: acc
        chunk.write(2, 3);
        chunk.write_op(OpCode::GetLocal, 3); // 22: n
        chunk.write(1, 3);
        chunk.write_op(OpCode::Add, 3); // 24: acc + n
        chunk.write_op(OpCode::TailCall, 3); // 25
        chunk.write(2, 3);
        chunk.write_op(OpCode::Return, 3); // 27
    });

    let program = script(&mut vm, |_, chunk| {
        emit_closure(chunk, sum, &[], 1);
        emit_constant(chunk, Value::Number(1_000_000.0), 1);
        emit_constant(chunk, Value::Number(0.0), 1);
        chunk.write_op(OpCode::Call, 1);
        chunk.write(2, 1);
        chunk.write_op(OpCode::Return, 1);
    });

    assert_eq!(number(vm.interpret(program).unwrap()), 500_000_500_000.0);
}

#[test]
fn collection_under_stress_preserves_program_results() {
    // Every-instruction collection while the program concatenates strings,
    // builds tuples and publishes them through a global.
    let config = VmConfig {
        gc: GcConfig {
            stress: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut vm = Vm::with_config(config);
    let empty = Value::String(vm.intern_string(""));
    let ab = Value::String(vm.intern_string("ab"));
    let last = Value::String(vm.intern_string("last"));

    let program = script(&mut vm, |_, chunk| {
        let last_index = chunk.add_constant(last);
        emit_constant(chunk, empty, 1); //  0: s (slot 1)
        emit_constant(chunk, Value::Number(0.0), 1); //  2: i (slot 2)
        chunk.write_op(OpCode::GetLocal, 2); //  4: loop start
        chunk.write(2, 2);
        emit_constant(chunk, Value::Number(5.0), 2); //  6
        chunk.write_op(OpCode::Less, 2); //  8
        chunk.write_op(OpCode::JumpIfFalse, 2); //  9: exit -> 39
        chunk.write_u16(27, 2);
        chunk.write_op(OpCode::Pop, 3); // 12
        chunk.write_op(OpCode::GetLocal, 3); // 13: s
        chunk.write(1, 3);
        emit_constant(chunk, ab, 3); // 15
        chunk.write_op(OpCode::Add, 3); // 17
        chunk.write_op(OpCode::SetLocal, 3); // 18: s = s + "ab"
        chunk.write(1, 3);
        chunk.write_op(OpCode::Pop, 3); // 20
        chunk.write_op(OpCode::GetLocal, 4); // 21: s
        chunk.write(1, 4);
        chunk.write_op(OpCode::GetLocal, 4); // 23: i
        chunk.write(2, 4);
        chunk.write_op(OpCode::DefineTuple, 4); // 25
        chunk.write_op(OpCode::DefineGlobal, 4); // 26: last = (s, i)
        chunk.write(last_index, 4);
        chunk.write_op(OpCode::GetLocal, 5); // 28: i
        chunk.write(2, 5);
        emit_constant(chunk, Value::Number(1.0), 5); // 30
        chunk.write_op(OpCode::Add, 5); // 32
        chunk.write_op(OpCode::SetLocal, 5); // 33: i = i + 1
        chunk.write(2, 5);
        chunk.write_op(OpCode::Pop, 5); // 35
        chunk.write_op(OpCode::Loop, 5); // 36: back to 4
        chunk.write_u16(35, 5);
        chunk.write_op(OpCode::Pop, 6); // 39
        chunk.write_op(OpCode::GetLocal, 6); // 40: s
        chunk.write(1, 6);
        chunk.write_op(OpCode::Return, 6); // 42
    });

    let result = vm.interpret(program).unwrap();
    match result {
        Value::String(ptr) => assert_eq!(vm.heap.string(ptr).data, "ababababab"),
        other => panic!("expected a string, got {:?}", other),
    }

    let last_tuple = match vm.get_global("last") {
        Some(Value::Tuple(ptr)) => vm.heap.tuple(ptr).clone(),
        other => panic!("expected a tuple global, got {:?}", other),
    };
    match last_tuple.first {
        Value::String(ptr) => assert_eq!(vm.heap.string(ptr).data, "ababababab"),
        other => panic!("expected a string, got {:?}", other),
    }
    assert_eq!(last_tuple.second, Value::Number(4.0));
    assert!(vm.heap.stats().collections > 0);
}

#[test]
fn runtime_error_reports_and_recovers() {
    let mut vm = Vm::new();
    let missing = Value::String(vm.intern_string("missing"));
    let failing = script(&mut vm, |_, chunk| {
        let name_index = chunk.add_constant(missing);
        chunk.write_op(OpCode::GetGlobal, 2);
        chunk.write(name_index, 2);
        chunk.write_op(OpCode::Return, 2);
    });

    let error = vm.interpret(failing).unwrap_err();
    let text = error.to_string();
    assert!(text.contains("Undefined variable 'missing'."));
    assert!(text.contains("[line 2] in script"));
    assert!(matches!(error, RuntimeError::WithStackTrace { .. }));

    // The VM is reusable after the reset.
    let ok = script(&mut vm, |_, chunk| {
        emit_constant(chunk, Value::Number(1.0), 1);
        chunk.write_op(OpCode::Return, 1);
    });
    assert_eq!(number(vm.interpret(ok).unwrap()), 1.0);
    assert!(vm.stack().is_empty());
    assert_eq!(vm.frame_depth(), 0);
}
