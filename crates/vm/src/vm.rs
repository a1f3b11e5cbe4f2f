//! The Brio execution context.
//!
//! `Vm` owns the value stack, frame stack, globals, string-intern set and
//! the garbage-collected heap, and drives the fetch-decode-execute loop.
//! There is no global state: independent `Vm` values are fully isolated,
//! one per thread if concurrent programs are needed.
//!
//! Frames and open upvalues address the value stack by *index*, never by
//! pointer, so the stack `Vec` may reallocate freely as it grows.

use std::fmt::Write as _;
use std::time::Instant;

use smallvec::SmallVec;
use tracing::trace;

use crate::chunk::OpCode;
use crate::gc::{
    GcClosure, GcConfig, GcFunction, GcPtr, GcString, GcUpvalue, Heap, RawGcPtr, UpvalueList,
};
use crate::inspect;
use crate::table::Table;
use crate::value::{format_number, RuntimeError, Value};

/// A host function callable from scripts.
///
/// Receives the argument window and the VM (for heap access); validating
/// the arguments is the native's own responsibility.
pub type NativeFn = fn(&[Value], &mut Vm) -> Result<Value, RuntimeError>;

/// One active function invocation.
///
/// A frame is a non-owning window onto the value stack: `base` indexes the
/// callee's own stack slot (slot 0, enabling recursive self-reference),
/// arguments and locals follow. `function` caches the closure's function
/// handle to keep the dispatch loop off the double indirection.
#[derive(Clone, Copy, Debug)]
pub struct CallFrame {
    pub closure: GcPtr<GcClosure>,
    pub function: GcPtr<GcFunction>,
    pub ip: usize,
    pub base: usize,
}

/// Tunables for one VM instance.
#[derive(Clone, Debug)]
pub struct VmConfig {
    pub gc: GcConfig,
    /// Emit a TRACE-level line per executed instruction.
    pub trace_execution: bool,
    /// Frame-stack depth limit. The frame stack grows dynamically, but an
    /// artificial ceiling keeps runaway recursion from exhausting memory.
    pub max_frames: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            gc: GcConfig::default(),
            trace_execution: false,
            max_frames: 4096,
        }
    }
}

/// The virtual machine state.
pub struct Vm {
    /// Garbage-collected heap for runtime objects.
    pub heap: Heap,
    /// Value stack. Frames and upvalues reference it by index.
    stack: Vec<Value>,
    /// Call stack.
    frames: Vec<CallFrame>,
    /// Global variables (name -> value). A GC root set.
    globals: Table,
    /// String-intern set. Weak: never keeps a string alive by itself.
    strings: Table,
    /// Open upvalues, ordered by descending stack slot.
    open_upvalues: SmallVec<[GcPtr<GcUpvalue>; 8]>,
    config: VmConfig,
    /// Construction time, the `clock` native's epoch.
    started: Instant,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut vm = Self {
            heap: Heap::with_config(config.gc.clone()),
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            strings: Table::new(),
            open_upvalues: SmallVec::new(),
            config,
            started: Instant::now(),
        };
        vm.define_native("clock", clock_native);
        vm.define_native("print", print_native);
        vm.define_native("first", first_native);
        vm.define_native("second", second_native);
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The current value stack, innermost last.
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    // ============================================================
    // Strings and globals
    // ============================================================

    /// Get the unique string object for `data`, allocating it on first use.
    ///
    /// Every string that scripts can observe goes through here, so equal
    /// content always yields the identical handle.
    pub fn intern_string(&mut self, data: &str) -> GcPtr<GcString> {
        let hash = seahash::hash(data.as_bytes());
        if let Some(existing) = self.strings.find_string(&self.heap, data, hash) {
            return existing;
        }
        let created = self.heap.alloc_string(data.to_string());
        self.strings.set(&self.heap, created, Value::Nil);
        created
    }

    /// Register a host function under a global name.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_ptr = self.intern_string(name);
        let native = self.heap.alloc_native(name.to_string(), function);
        self.globals.set(&self.heap, name_ptr, Value::Native(native));
    }

    /// Bind a global directly. Embedding/test convenience.
    pub fn define_global(&mut self, name: &str, value: Value) {
        let name_ptr = self.intern_string(name);
        self.globals.set(&self.heap, name_ptr, value);
    }

    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let name_ptr = self.intern_string(name);
        self.globals.get(&self.heap, name_ptr)
    }

    // ============================================================
    // Stack primitives
    // ============================================================

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ============================================================
    // Interpretation
    // ============================================================

    /// Execute a compiled script function to completion.
    ///
    /// The function is the compiler's output for a whole program: arity 0,
    /// no name. On a runtime error the message and a frame trace are
    /// written to stderr, execution state is reset so the VM can be
    /// reused, and the returned error carries the same trace.
    pub fn interpret(&mut self, script: GcPtr<GcFunction>) -> Result<Value, RuntimeError> {
        let closure = self.heap.alloc_closure(script, UpvalueList::new());
        self.push(Value::Closure(closure));

        let result = self.call(closure, 0).and_then(|()| self.run());
        result.map_err(|error| {
            let stack_trace = self.stack_trace();
            eprintln!("{}", error);
            eprint!("{}", stack_trace);
            self.reset();
            error.with_stack_trace(stack_trace)
        })
    }

    /// The fetch-decode-execute loop.
    ///
    /// Dispatch is an exhaustive match over the opcode; a handler table
    /// would be an equivalent, faster alternative but the semantics here
    /// are the contract. The top of the loop is the GC safepoint: every
    /// live value is rooted (stack, frames, globals, open upvalues), so
    /// collecting between instructions can never free a live object.
    fn run(&mut self) -> Result<Value, RuntimeError> {
        macro_rules! binary_op {
            ($wrap:expr, $op:tt) => {{
                let (a, b) = match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => (a, b),
                    _ => return Err(RuntimeError::NumberOperands),
                };
                self.pop();
                self.pop();
                self.push($wrap(a $op b));
            }};
        }

        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            if self.config.trace_execution {
                self.trace_state();
            }

            let byte = self.read_byte();
            let op = OpCode::from_byte(byte)
                .ok_or(RuntimeError::InvalidBytecode("unknown opcode"))?;

            match op {
                OpCode::Constant => {
                    let value = self.read_constant()?;
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().base;
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                }

                OpCode::GetGlobal => {
                    let name = self.read_string_constant()?;
                    match self.globals.get(&self.heap, name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(RuntimeError::UndefinedVariable(
                                self.heap.string(name).data.clone(),
                            ))
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant()?;
                    let value = self.peek(0);
                    self.globals.set(&self.heap, name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant()?;
                    let value = self.peek(0);
                    if self.globals.set(&self.heap, name, value) {
                        // Assignment must not create the variable.
                        self.globals.delete(&self.heap, name);
                        return Err(RuntimeError::UndefinedVariable(
                            self.heap.string(name).data.clone(),
                        ));
                    }
                }

                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(slot);
                    let value = match *self.heap.upvalue(upvalue) {
                        GcUpvalue::Open(stack_slot) => self.stack[stack_slot],
                        GcUpvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(slot);
                    let value = self.peek(0);
                    match *self.heap.upvalue(upvalue) {
                        GcUpvalue::Open(stack_slot) => self.stack[stack_slot] = value,
                        GcUpvalue::Closed(_) => {
                            *self.heap.upvalue_mut(upvalue) = GcUpvalue::Closed(value)
                        }
                    }
                }

                OpCode::DefineTuple => {
                    let second = self.pop();
                    let first = self.pop();
                    let tuple = self.heap.alloc_tuple(first, second);
                    self.push(Value::Tuple(tuple));
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }
                OpCode::Greater => binary_op!(Value::Bool, >),
                OpCode::GreaterEqual => binary_op!(Value::Bool, >=),
                OpCode::Less => binary_op!(Value::Bool, <),
                OpCode::LessEqual => binary_op!(Value::Bool, <=),

                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    match (a, b) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a + b));
                        }
                        (Value::String(a), Value::String(b)) => {
                            let mut data = self.heap.string(a).data.clone();
                            data.push_str(&self.heap.string(b).data);
                            self.push_concatenated(&data);
                        }
                        (Value::String(a), Value::Number(b)) => {
                            let mut data = self.heap.string(a).data.clone();
                            data.push_str(&format_number(b));
                            self.push_concatenated(&data);
                        }
                        (Value::Number(a), Value::String(b)) => {
                            let mut data = format_number(a);
                            data.push_str(&self.heap.string(b).data);
                            self.push_concatenated(&data);
                        }
                        _ => return Err(RuntimeError::AddOperands),
                    }
                }
                OpCode::Subtract => binary_op!(Value::Number, -),
                OpCode::Multiply => binary_op!(Value::Number, *),
                OpCode::Divide => binary_op!(Value::Number, /),
                OpCode::Modulo => binary_op!(Value::Number, %),

                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(RuntimeError::NumberOperand),
                },

                OpCode::Print => {
                    let value = self.peek(0);
                    println!("{}", self.heap.display_value(&value));
                }

                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.current_frame_mut().ip += offset;
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_short() as usize;
                    if !self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += offset;
                    }
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.current_frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    self.call_value(self.peek(arg_count), arg_count, false)?;
                }
                OpCode::TailCall => {
                    let arg_count = self.read_byte() as usize;
                    self.call_value(self.peek(arg_count), arg_count, true)?;
                }

                OpCode::Closure => {
                    let function = match self.read_constant()? {
                        Value::Function(ptr) => ptr,
                        _ => {
                            return Err(RuntimeError::InvalidBytecode(
                                "CLOSURE operand must be a function constant",
                            ))
                        }
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let mut upvalues = UpvalueList::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.current_frame().base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let enclosing = self.current_frame().closure;
                            upvalues.push(self.heap.closure(enclosing).upvalues[index]);
                        }
                    }
                    let closure = self.heap.alloc_closure(function, upvalues);
                    self.push(Value::Closure(closure));
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let base = self.current_frame().base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // Discard the script closure; execution is done.
                        self.pop();
                        return Ok(result);
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }
            }
        }
    }

    // ============================================================
    // Decoding helpers
    // ============================================================

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Result<Value, RuntimeError> {
        let index = self.read_byte() as usize;
        let frame = self.current_frame();
        self.heap
            .function(frame.function)
            .chunk
            .constants
            .get(index)
            .copied()
            .ok_or(RuntimeError::InvalidBytecode("constant index out of range"))
    }

    fn read_string_constant(&mut self) -> Result<GcPtr<GcString>, RuntimeError> {
        match self.read_constant()? {
            Value::String(ptr) => Ok(ptr),
            _ => Err(RuntimeError::InvalidBytecode("expected a string constant")),
        }
    }

    fn frame_upvalue(&self, slot: usize) -> GcPtr<GcUpvalue> {
        let closure = self.current_frame().closure;
        self.heap.closure(closure).upvalues[slot]
    }

    /// Intern the concatenation result and replace both operands with it.
    fn push_concatenated(&mut self, data: &str) {
        let result = self.intern_string(data);
        self.pop();
        self.pop();
        self.push(Value::String(result));
    }

    // ============================================================
    // Calls
    // ============================================================

    /// Dispatch a call on any callee kind.
    fn call_value(
        &mut self,
        callee: Value,
        arg_count: usize,
        is_tail: bool,
    ) -> Result<(), RuntimeError> {
        match callee {
            Value::Closure(closure) => {
                if is_tail {
                    self.tail_call(closure, arg_count)
                } else {
                    self.call(closure, arg_count)
                }
            }
            Value::Native(native) => {
                let function = self.heap.native(native).function;
                let first_arg = self.stack.len() - arg_count;
                let args: SmallVec<[Value; 8]> = SmallVec::from_slice(&self.stack[first_arg..]);
                // The originals stay on the stack (rooted) until the native
                // returns; then callee and arguments give way to the result.
                let result = function(&args, self)?;
                self.stack.truncate(first_arg - 1);
                self.push(result);
                Ok(())
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    /// Push a frame for `closure`. Slot 0 of the new window is the callee.
    fn call(&mut self, closure: GcPtr<GcClosure>, arg_count: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(RuntimeError::ArityMismatch {
                expected: arity,
                got: arg_count,
            });
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(RuntimeError::StackOverflow);
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    /// Reuse the current frame for a call in tail position.
    ///
    /// The callee and its arguments are copied down over the current
    /// window and the frame is re-pointed at the new closure; a chain of
    /// tail calls therefore runs in constant frame-stack depth. Upvalues
    /// into the dying window are closed first, before its slots are
    /// overwritten.
    fn tail_call(
        &mut self,
        closure: GcPtr<GcClosure>,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(RuntimeError::ArityMismatch {
                expected: arity,
                got: arg_count,
            });
        }

        let base = self.current_frame().base;
        self.close_upvalues(base);

        let first = self.stack.len() - arg_count - 1;
        for i in 0..=arg_count {
            self.stack[base + i] = self.stack[first + i];
        }
        self.stack.truncate(base + arg_count + 1);

        let frame = self.current_frame_mut();
        frame.closure = closure;
        frame.function = function;
        frame.ip = 0;
        Ok(())
    }

    // ============================================================
    // Upvalues
    // ============================================================

    /// Find or create the open upvalue for a stack slot.
    ///
    /// The open list is ordered by descending slot, so the scan can stop
    /// at the first entry at or below the target; sharing the cell is what
    /// lets sibling closures observe each other's mutations.
    fn capture_upvalue(&mut self, slot: usize) -> GcPtr<GcUpvalue> {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            match self.heap.upvalue(upvalue).stack_slot() {
                Some(existing) if existing > slot => continue,
                Some(existing) if existing == slot => return upvalue,
                _ => {
                    insert_at = i;
                    break;
                }
            }
        }
        let created = self.heap.alloc_upvalue(slot);
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue at or above `boundary`.
    ///
    /// Required before the stack below is truncated or overwritten: the
    /// cell copies the current slot value and owns it from then on.
    fn close_upvalues(&mut self, boundary: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match *self.heap.upvalue(upvalue) {
                GcUpvalue::Open(slot) if slot >= boundary => slot,
                _ => break,
            };
            let value = self.stack[slot];
            *self.heap.upvalue_mut(upvalue) = GcUpvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // ============================================================
    // Garbage collection
    // ============================================================

    /// Run a full collection cycle.
    ///
    /// Roots: every stack slot, every live frame's closure, every open
    /// upvalue, and the globals table (keys and values). The intern table
    /// is deliberately not a root; unmarked entries are purged between
    /// mark and sweep so interned-only strings can die.
    pub fn collect_garbage(&mut self) {
        let mut roots: Vec<RawGcPtr> =
            Vec::with_capacity(self.stack.len() + self.frames.len() + self.open_upvalues.len());
        for value in &self.stack {
            if let Some(ptr) = value.as_gc_ptr() {
                roots.push(ptr);
            }
        }
        for frame in &self.frames {
            roots.push(frame.closure.as_raw());
        }
        for &upvalue in &self.open_upvalues {
            roots.push(upvalue.as_raw());
        }
        self.globals.push_roots(&mut roots);

        self.heap.mark(&roots);
        self.strings.remove_unmarked(&self.heap);
        self.heap.sweep();
    }

    // ============================================================
    // Diagnostics
    // ============================================================

    /// Format the active frames, innermost first.
    fn stack_trace(&self) -> String {
        let mut out = String::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let line = function.chunk.line(frame.ip.saturating_sub(1));
            match self.heap.function_name(function) {
                Some(name) => {
                    let _ = writeln!(out, "[line {}] in {}()", line, name);
                }
                None => {
                    let _ = writeln!(out, "[line {}] in script", line);
                }
            }
        }
        out
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn trace_state(&self) {
        let frame = self.current_frame();
        let function = self.heap.function(frame.function);
        let mut slots = String::new();
        for value in &self.stack {
            let _ = write!(slots, "[ {} ]", self.heap.display_value(value));
        }
        let (instruction, _) = inspect::disassemble_instruction(&self.heap, &function.chunk, frame.ip);
        trace!("{:>32} {}", slots, instruction);
    }
}

// ============================================================
// Stock natives
// ============================================================

fn clock_native(args: &[Value], vm: &mut Vm) -> Result<Value, RuntimeError> {
    if !args.is_empty() {
        return Err(RuntimeError::ArityMismatch {
            expected: 0,
            got: args.len(),
        });
    }
    Ok(Value::Number(vm.started.elapsed().as_secs_f64()))
}

fn print_native(args: &[Value], vm: &mut Vm) -> Result<Value, RuntimeError> {
    match args {
        [value] => {
            println!("{}", vm.heap.display_value(value));
            Ok(*value)
        }
        _ => Err(RuntimeError::ArityMismatch {
            expected: 1,
            got: args.len(),
        }),
    }
}

fn first_native(args: &[Value], vm: &mut Vm) -> Result<Value, RuntimeError> {
    match args {
        [Value::Tuple(ptr)] => Ok(vm.heap.tuple(*ptr).first),
        [other] => Err(RuntimeError::TypeError {
            expected: "tuple",
            found: other.type_name(),
        }),
        _ => Err(RuntimeError::ArityMismatch {
            expected: 1,
            got: args.len(),
        }),
    }
}

fn second_native(args: &[Value], vm: &mut Vm) -> Result<Value, RuntimeError> {
    match args {
        [Value::Tuple(ptr)] => Ok(vm.heap.tuple(*ptr).second),
        [other] => Err(RuntimeError::TypeError {
            expected: "tuple",
            found: other.type_name(),
        }),
        _ => Err(RuntimeError::ArityMismatch {
            expected: 1,
            got: args.len(),
        }),
    }
}
