//! Stack virtual machine.
//!
//! [`VmState`] owns the module image, the value heap and all execution state
//! (operand stack, call frames, exception handlers, globals). The host drives
//! it with [`VmState::execute`], which interprets at most `budget`
//! instructions and returns an [`ExecOutcome`] at every suspension point:
//! budget exhaustion, a sleep request, completion, a fatal error or heap
//! exhaustion. Nothing inside `execute` blocks the host thread.
//!
//! Runtime errors other than heap exhaustion are catchable: when a `TRY`
//! handler is active the error is converted into a string-valued throw and
//! unwound; otherwise the VM halts with the message (annotated with the
//! source line when the module carries debug info).
//!
//! On `OutOfMemory` from a script-level allocation the faulting instruction
//! is rewound, so the host can run [`VmState::collect_garbage`] and call
//! `execute` again to retry. Allocation never triggers collection on its own.

mod arith;
mod native;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    bytecode::{BytecodeModule, Opcode},
    heap::ValuePool,
    platform::Platform,
    tracer::{NoopTracer, VmTracer},
    value::Value,
};

use self::arith::{CmpOp, OpError};

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Budget exhausted; the VM is still running.
    Ok,
    /// The program requested a sleep; do not step again until
    /// [`VmState::sleeping_until`] has elapsed.
    Yield,
    /// `HALT` reached or the top-level frame returned.
    Finished,
    /// Fatal runtime error; the VM has halted.
    Error(String),
    /// A heap allocation failed. The faulting instruction was rewound; the
    /// host may collect garbage and resume.
    OutOfMemory,
}

/// Internal per-instruction control flow.
enum Control {
    Continue,
    Finished,
    Yield,
    Fatal,
    OutOfMemory,
}

/// One function activation record.
#[derive(Debug)]
struct CallFrame {
    return_pc: usize,
    /// Operand-stack length at entry; the stack is truncated back to this on
    /// return.
    stack_base: usize,
    /// Locals addressed by 8-bit slot; parameter `k` occupies slot `k`
    /// (methods put `this` in slot 0 and shift parameters up by one).
    locals: AHashMap<u8, Value>,
    function_name: String,
}

/// Exception handler record pushed by `TRY`.
#[derive(Debug, Clone, Copy)]
struct ExceptionHandler {
    catch_pc: usize,
    /// Stack length to restore before entering the handler.
    stack_size: usize,
}

/// Capability groups hung off the `os` root object, with the class names the
/// native dispatcher keys on.
const OS_GROUPS: [(&str, &str); 13] = [
    ("console", "Console"),
    ("display", "Display"),
    ("encoder", "Encoder"),
    ("touch", "Touch"),
    ("system", "System"),
    ("file", "File"),
    ("dir", "Dir"),
    ("gpio", "Gpio"),
    ("i2c", "I2c"),
    ("buzzer", "Buzzer"),
    ("timer", "Timer"),
    ("callbacks", "Callbacks"),
    ("memory", "Memory"),
];

/// Fetches an operand, bailing out with a fatal error on truncated code.
macro_rules! fetch {
    ($self:expr, $op_pc:expr, $method:ident) => {
        match $self.$method() {
            Some(value) => value,
            None => return $self.fatal("Truncated instruction".to_owned(), $op_pc),
        }
    };
}

/// Pops the operand stack or raises the catchable "Stack underflow" error.
macro_rules! pop {
    ($self:expr, $op_pc:expr) => {
        match $self.stack.pop() {
            Some(value) => value,
            None => return $self.runtime_error("Stack underflow".to_owned(), $op_pc),
        }
    };
}

/// VM execution state, generic over the tracing hook.
#[derive(Debug)]
pub struct VmState<Tr: VmTracer = NoopTracer> {
    module: BytecodeModule,
    pool: ValuePool,
    stack: Vec<Value>,
    call_stack: Vec<CallFrame>,
    /// Global values, parallel to the module's global name table.
    globals: Vec<Value>,
    handlers: Vec<ExceptionHandler>,
    pc: usize,
    running: bool,
    error: Option<String>,
    /// Millisecond deadline set by `system.sleep`.
    sleeping_until: Option<u32>,
    /// The platform-owned `os` root, preserved across `reset`.
    os_root: Option<(u16, Value)>,
    tracer: Tr,
}

impl VmState<NoopTracer> {
    /// Creates a VM for `module` with a heap sized from its metadata.
    #[must_use]
    pub fn new(module: BytecodeModule) -> Self {
        Self::with_tracer(module, NoopTracer)
    }
}

impl<Tr: VmTracer> VmState<Tr> {
    #[must_use]
    pub fn with_tracer(module: BytecodeModule, tracer: Tr) -> Self {
        let pool = ValuePool::new(module.metadata.heap_size as usize);
        let globals = vec![Value::Null; module.globals_len()];
        let pc = module.main_entry_point as usize;

        let mut vm = Self {
            module,
            pool,
            stack: Vec::new(),
            call_stack: Vec::new(),
            globals,
            handlers: Vec::new(),
            pc,
            running: true,
            error: None,
            sleeping_until: None,
            os_root: None,
            tracer,
        };
        vm.install_os_root();
        vm
    }

    /// Builds the `os` capability tree when the program references `os`: one
    /// object per group, hung off an `OS` root stored in the global slot.
    fn install_os_root(&mut self) {
        let Some(index) = self.module.global_index("os") else {
            return;
        };
        let Some(root) = self.pool.allocate_object("OS") else {
            return; // heap too small for the capability tree; leave os null
        };
        let Value::Object(root_id) = root else { unreachable!() };

        for (field, class) in OS_GROUPS {
            let Some(group) = self.pool.allocate_object(class) else {
                return;
            };
            self.pool.object_mut(root_id).fields.insert(field.to_owned(), group);
        }

        self.globals[usize::from(index)] = root;
        self.os_root = Some((index, root));
    }

    // ===== Inspection =====

    #[must_use]
    pub fn module(&self) -> &BytecodeModule {
        &self.module
    }

    #[must_use]
    pub fn pool(&self) -> &ValuePool {
        &self.pool
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[must_use]
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    #[must_use]
    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    #[must_use]
    pub fn sleeping_until(&self) -> Option<u32> {
        self.sleeping_until
    }

    /// Reads a global by name.
    #[must_use]
    pub fn global(&self, name: &str) -> Option<Value> {
        let index = self.module.global_index(name)?;
        self.globals.get(usize::from(index)).copied()
    }

    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    // ===== Lifecycle =====

    /// Re-initializes execution state. Globals are re-nulled except the
    /// platform-owned `os` root.
    pub fn reset(&mut self) {
        self.pc = self.module.main_entry_point as usize;
        self.running = true;
        self.stack.clear();
        self.call_stack.clear();
        self.handlers.clear();
        self.error = None;
        self.sleeping_until = None;

        for global in &mut self.globals {
            *global = Value::Null;
        }
        if let Some((index, root)) = self.os_root {
            self.globals[usize::from(index)] = root;
        }
    }

    /// Mark-and-sweep over the full root set: operand stack, every frame's
    /// locals, globals, and callback values retained by the platform.
    /// Exception-handler snapshots are stack prefixes and thus already
    /// covered by the stack roots.
    pub fn collect_garbage(&mut self, platform: &dyn Platform) {
        let mut roots: Vec<Value> = Vec::with_capacity(self.stack.len() + self.globals.len());
        roots.extend(self.stack.iter().copied());
        for frame in &self.call_stack {
            roots.extend(frame.locals.values().copied());
        }
        roots.extend(self.globals.iter().copied());
        roots.extend(platform.callback_roots());
        self.pool.collect(roots);
    }

    // ===== Execution =====

    /// Interprets at most `budget` instructions.
    pub fn execute(&mut self, budget: u32, platform: &mut dyn Platform) -> ExecOutcome {
        if let Some(msg) = &self.error {
            return ExecOutcome::Error(msg.clone());
        }
        if !self.running {
            return ExecOutcome::Finished;
        }

        if let Some(until) = self.sleeping_until {
            if platform.system_time() < until {
                return ExecOutcome::Yield;
            }
            self.sleeping_until = None;
        }

        let mut executed: u32 = 0;
        while self.running && executed < budget && self.pc < self.module.code().len() {
            match self.step(platform) {
                Control::Continue => {}
                Control::Finished => return ExecOutcome::Finished,
                Control::Yield => return ExecOutcome::Yield,
                Control::Fatal => {
                    return ExecOutcome::Error(self.error.clone().unwrap_or_default());
                }
                Control::OutOfMemory => return ExecOutcome::OutOfMemory,
            }
            executed += 1;
        }

        if self.pc >= self.module.code().len() {
            self.running = false;
            return ExecOutcome::Finished;
        }

        ExecOutcome::Ok
    }

    /// Invokes a function-reference value while the host is outside
    /// `execute`: synthesizes a call frame, runs the interpreter until that
    /// frame returns, and restores the outer state. Callback execution shares
    /// the heap, globals and error channel with normal execution and is
    /// atomic with respect to it. A sleep requested inside a callback only
    /// records the deadline; stepping continues until the callback returns.
    pub fn invoke_function(
        &mut self,
        callback: Value,
        args: &[Value],
        platform: &mut dyn Platform,
    ) -> Result<Value, String> {
        let Value::Function(id) = callback else {
            return Err("callback is not a function reference".to_owned());
        };
        let func = self.pool.function(id);
        let Some(info) = self.module.function_info(func.function_index) else {
            return Err(format!("Invalid function index: {}", func.function_index));
        };
        if info.entry_pc == 0 && func.function_index != 0 {
            let name = self.module.function_name(func.function_index).unwrap_or("");
            return Err(format!("Function not defined: {name}"));
        }

        let saved_pc = self.pc;
        let saved_running = self.running;
        self.running = true;

        let base_depth = self.call_stack.len();
        let stack_base = self.stack.len();

        let mut locals = AHashMap::new();
        for (slot, value) in args.iter().enumerate() {
            let Ok(slot) = u8::try_from(slot) else {
                self.running = saved_running;
                return Err("too many callback arguments".to_owned());
            };
            locals.insert(slot, *value);
        }

        let function_name = self
            .module
            .function_name(func.function_index)
            .unwrap_or("")
            .to_owned();
        self.tracer.on_call(&function_name, base_depth + 1);
        self.call_stack.push(CallFrame {
            return_pc: saved_pc,
            stack_base,
            locals,
            function_name,
        });
        self.pc = info.entry_pc as usize;

        while self.running && self.call_stack.len() > base_depth && self.pc < self.module.code().len() {
            match self.step(platform) {
                Control::Continue | Control::Yield => {}
                Control::Finished => break,
                Control::Fatal => {
                    return Err(self.error.clone().unwrap_or_default());
                }
                Control::OutOfMemory => {
                    self.running = false;
                    self.error = Some("Out of memory".to_owned());
                    return Err("Out of memory".to_owned());
                }
            }
        }

        // The callback halted the applet (HALT) iff running went false.
        if self.running {
            self.running = saved_running;
        }

        let result = if self.stack.len() > stack_base {
            self.stack.pop().expect("return value present")
        } else {
            Value::Null
        };
        self.stack.truncate(stack_base);
        self.pc = saved_pc;
        Ok(result)
    }

    // ===== Instruction dispatch =====

    fn step(&mut self, platform: &mut dyn Platform) -> Control {
        let op_pc = self.pc;
        let byte = self.module.code()[self.pc];
        self.pc += 1;

        let Some(op) = Opcode::from_byte(byte) else {
            return self.fatal(format!("Unknown opcode: {byte}"), op_pc);
        };
        self.tracer.on_instruction(op_pc, op);

        match op {
            Opcode::Nop => Control::Continue,

            Opcode::Pop => {
                let _ = pop!(self, op_pc);
                Control::Continue
            }

            Opcode::Dup => {
                if let Some(&top) = self.stack.last() {
                    self.stack.push(top);
                }
                Control::Continue
            }

            Opcode::Swap => {
                let len = self.stack.len();
                if len >= 2 {
                    self.stack.swap(len - 1, len - 2);
                }
                Control::Continue
            }

            Opcode::PushNull => {
                self.stack.push(Value::Null);
                Control::Continue
            }
            Opcode::PushTrue => {
                self.stack.push(Value::Bool(true));
                Control::Continue
            }
            Opcode::PushFalse => {
                self.stack.push(Value::Bool(false));
                Control::Continue
            }

            Opcode::PushI8 => {
                let value = fetch!(self, op_pc, fetch_u8) as i8;
                self.stack.push(Value::I32(i32::from(value)));
                Control::Continue
            }
            Opcode::PushI16 => {
                let value = fetch!(self, op_pc, fetch_u16) as i16;
                self.stack.push(Value::I32(i32::from(value)));
                Control::Continue
            }
            Opcode::PushI32 => {
                let value = fetch!(self, op_pc, fetch_i32);
                self.stack.push(Value::I32(value));
                Control::Continue
            }
            Opcode::PushF32 => {
                let value = fetch!(self, op_pc, fetch_f32);
                self.stack.push(Value::F32(value));
                Control::Continue
            }

            Opcode::PushStr => {
                let index = fetch!(self, op_pc, fetch_u16);
                let Some(constant) = self.module.constant(index) else {
                    return self.runtime_error("Invalid constant index".to_owned(), op_pc);
                };
                match self.pool.allocate_string(constant) {
                    Some(value) => {
                        self.stack.push(value);
                        Control::Continue
                    }
                    None => self.retry_oom(op_pc),
                }
            }

            Opcode::LoadLocal => {
                let slot = fetch!(self, op_pc, fetch_u8);
                let Some(frame) = self.call_stack.last() else {
                    return self.runtime_error("No active call frame".to_owned(), op_pc);
                };
                let value = frame.locals.get(&slot).copied().unwrap_or(Value::Null);
                self.stack.push(value);
                Control::Continue
            }

            Opcode::StoreLocal => {
                let slot = fetch!(self, op_pc, fetch_u8);
                let value = pop!(self, op_pc);
                let Some(frame) = self.call_stack.last_mut() else {
                    return self.runtime_error("No active call frame".to_owned(), op_pc);
                };
                frame.locals.insert(slot, value);
                Control::Continue
            }

            Opcode::LoadGlobal => {
                let index = usize::from(fetch!(self, op_pc, fetch_u16));
                let Some(&value) = self.globals.get(index) else {
                    return self.runtime_error("Invalid global index".to_owned(), op_pc);
                };
                self.stack.push(value);
                Control::Continue
            }

            Opcode::StoreGlobal => {
                let index = usize::from(fetch!(self, op_pc, fetch_u16));
                let value = pop!(self, op_pc);
                let Some(slot) = self.globals.get_mut(index) else {
                    return self.runtime_error("Invalid global index".to_owned(), op_pc);
                };
                *slot = value;
                Control::Continue
            }

            Opcode::Add => self.binary_op(op_pc, arith::add),
            Opcode::Sub => self.binary_op(op_pc, |_, a, b| arith::subtract(a, b)),
            Opcode::Mul => self.binary_op(op_pc, |_, a, b| arith::multiply(a, b)),
            Opcode::Div => self.binary_op(op_pc, |_, a, b| arith::divide(a, b)),
            Opcode::Mod => self.binary_op(op_pc, |_, a, b| arith::modulo(a, b)),
            Opcode::StrConcat => self.binary_op(op_pc, arith::str_concat),

            Opcode::Neg => {
                let value = pop!(self, op_pc);
                match arith::negate(value) {
                    Ok(result) => {
                        self.stack.push(result);
                        Control::Continue
                    }
                    Err(OpError::Runtime(msg)) => self.runtime_error(msg, op_pc),
                    Err(OpError::OutOfMemory) => self.retry_oom(op_pc),
                }
            }

            Opcode::Eq | Opcode::Ne => {
                let b = pop!(self, op_pc);
                let a = pop!(self, op_pc);
                let equal = a.equals(&b, &self.pool);
                self.stack.push(Value::Bool(if op == Opcode::Eq { equal } else { !equal }));
                Control::Continue
            }

            Opcode::Lt => self.binary_op(op_pc, |_, a, b| arith::compare(CmpOp::Lt, a, b)),
            Opcode::Le => self.binary_op(op_pc, |_, a, b| arith::compare(CmpOp::Le, a, b)),
            Opcode::Gt => self.binary_op(op_pc, |_, a, b| arith::compare(CmpOp::Gt, a, b)),
            Opcode::Ge => self.binary_op(op_pc, |_, a, b| arith::compare(CmpOp::Ge, a, b)),

            Opcode::Not => {
                let value = pop!(self, op_pc);
                let truthy = value.is_truthy(&self.pool);
                self.stack.push(Value::Bool(!truthy));
                Control::Continue
            }

            Opcode::And => {
                let b = pop!(self, op_pc);
                let a = pop!(self, op_pc);
                let result = a.is_truthy(&self.pool) && b.is_truthy(&self.pool);
                self.stack.push(Value::Bool(result));
                Control::Continue
            }

            Opcode::Or => {
                let b = pop!(self, op_pc);
                let a = pop!(self, op_pc);
                let result = a.is_truthy(&self.pool) || b.is_truthy(&self.pool);
                self.stack.push(Value::Bool(result));
                Control::Continue
            }

            Opcode::Jump => {
                let offset = fetch!(self, op_pc, fetch_i32);
                self.jump_relative(offset, op_pc)
            }

            Opcode::JumpIf => {
                let offset = fetch!(self, op_pc, fetch_i32);
                let condition = pop!(self, op_pc);
                if condition.is_truthy(&self.pool) {
                    return self.jump_relative(offset, op_pc);
                }
                Control::Continue
            }

            Opcode::JumpIfNot => {
                let offset = fetch!(self, op_pc, fetch_i32);
                let condition = pop!(self, op_pc);
                if !condition.is_truthy(&self.pool) {
                    return self.jump_relative(offset, op_pc);
                }
                Control::Continue
            }

            Opcode::Call => {
                let index = fetch!(self, op_pc, fetch_u16);
                let argc = usize::from(fetch!(self, op_pc, fetch_u8));
                self.call_function(index, argc, None, op_pc)
            }

            Opcode::CallNative => {
                let index = fetch!(self, op_pc, fetch_u16);
                let argc = usize::from(fetch!(self, op_pc, fetch_u8));
                let Some(name) = self.module.function_name(index).map(str::to_owned) else {
                    return self.runtime_error("Invalid native function index".to_owned(), op_pc);
                };
                self.native_call(&name, argc, platform, op_pc)
            }

            Opcode::Return => {
                let value = pop!(self, op_pc);

                let Some(frame) = self.call_stack.pop() else {
                    // Top-level return finishes execution.
                    self.stack.push(value);
                    self.running = false;
                    return Control::Finished;
                };

                self.stack.truncate(frame.stack_base);
                self.pc = frame.return_pc;
                self.stack.push(value);
                self.tracer.on_return(self.call_stack.len());
                Control::Continue
            }

            Opcode::LoadFunction => {
                let index = fetch!(self, op_pc, fetch_u16);
                let Some(info) = self.module.function_info(index) else {
                    return self.runtime_error(format!("Invalid function index: {index}"), op_pc);
                };
                match self.pool.allocate_function(index, info.param_count) {
                    Some(value) => {
                        self.stack.push(value);
                        Control::Continue
                    }
                    None => self.retry_oom(op_pc),
                }
            }

            Opcode::CallIndirect => {
                let argc = usize::from(fetch!(self, op_pc, fetch_u8));
                if self.stack.len() < argc + 1 {
                    return self.runtime_error("Stack underflow".to_owned(), op_pc);
                }
                let func_pos = self.stack.len() - argc - 1;
                let Value::Function(id) = self.stack[func_pos] else {
                    return self.runtime_error("CALL_INDIRECT on non-function value".to_owned(), op_pc);
                };
                let func = self.pool.function(id);

                // Drop the reference from under the arguments, then reuse the
                // direct-call path on what remains.
                self.stack.remove(func_pos);
                self.call_function(func.function_index, argc, None, op_pc)
            }

            Opcode::CallMethod => {
                let argc = usize::from(fetch!(self, op_pc, fetch_u8));
                let name_index = fetch!(self, op_pc, fetch_u16);
                let Some(name) = self.module.constant(name_index).map(str::to_owned) else {
                    return self.runtime_error("Invalid constant index".to_owned(), op_pc);
                };

                let receiver = pop!(self, op_pc);

                // A user-class method resolves through the receiver's class;
                // anything else falls through to capability dispatch.
                if let Value::Object(id) = receiver {
                    let class = self.pool.object(id).class_name.clone();
                    let qualified = format!("{class}::{name}");
                    if let Some(index) = self.module.function_index(&qualified) {
                        let entry = self.module.function_info(index).map_or(0, |i| i.entry_pc);
                        if entry != 0 || index == 0 {
                            return self.call_function(index, argc, Some(receiver), op_pc);
                        }
                    }
                }

                self.native_dispatch(receiver, &name, argc, platform, op_pc)
            }

            Opcode::GetField => {
                let index = fetch!(self, op_pc, fetch_u16);
                let object = pop!(self, op_pc);
                let Value::Object(id) = object else {
                    return self.runtime_error("GET_FIELD on non-object".to_owned(), op_pc);
                };
                let Some(field) = self.module.constant(index) else {
                    return self.runtime_error("Invalid field name index".to_owned(), op_pc);
                };
                let value = self.pool.object(id).fields.get(field).copied().unwrap_or(Value::Null);
                self.stack.push(value);
                Control::Continue
            }

            Opcode::SetField => {
                let index = fetch!(self, op_pc, fetch_u16);
                let value = pop!(self, op_pc);
                let object = pop!(self, op_pc);
                let Value::Object(id) = object else {
                    return self.runtime_error("SET_FIELD on non-object".to_owned(), op_pc);
                };
                let Some(field) = self.module.constant(index).map(str::to_owned) else {
                    return self.runtime_error("Invalid field name index".to_owned(), op_pc);
                };
                self.pool.object_mut(id).fields.insert(field, value);
                Control::Continue
            }

            Opcode::GetIndex => {
                let index = pop!(self, op_pc);
                let array = pop!(self, op_pc);
                let Value::Array(id) = array else {
                    return self.runtime_error("GET_INDEX on non-array".to_owned(), op_pc);
                };
                let Value::I32(index) = index else {
                    return self.runtime_error("Array index must be integer".to_owned(), op_pc);
                };
                let elements = &self.pool.array(id).elements;
                let value = usize::try_from(index)
                    .ok()
                    .and_then(|i| elements.get(i).copied())
                    .unwrap_or(Value::Null);
                self.stack.push(value);
                Control::Continue
            }

            Opcode::SetIndex => {
                let value = pop!(self, op_pc);
                let index = pop!(self, op_pc);
                let array = pop!(self, op_pc);
                let Value::Array(id) = array else {
                    return self.runtime_error("SET_INDEX on non-array".to_owned(), op_pc);
                };
                let Value::I32(index) = index else {
                    return self.runtime_error("Array index must be integer".to_owned(), op_pc);
                };
                // Out-of-range writes are silently ignored.
                if let Ok(index) = usize::try_from(index) {
                    let elements = &mut self.pool.array_mut(id).elements;
                    if index < elements.len() {
                        elements[index] = value;
                    }
                }
                Control::Continue
            }

            Opcode::NewObject => {
                let index = fetch!(self, op_pc, fetch_u16);
                let class_name = self.module.constant(index).unwrap_or("Object").to_owned();
                match self.pool.allocate_object(&class_name) {
                    Some(value) => {
                        self.stack.push(value);
                        Control::Continue
                    }
                    None => self.retry_oom(op_pc),
                }
            }

            Opcode::NewArray => {
                // Allocate before popping anything so heap exhaustion can
                // rewind and retry with the operands intact.
                let Some(&size_value) = self.stack.last() else {
                    return self.runtime_error("Stack underflow".to_owned(), op_pc);
                };
                let Value::I32(size) = size_value else {
                    return self.runtime_error("Array size must be integer".to_owned(), op_pc);
                };
                let size = usize::try_from(size).unwrap_or(0);
                if self.stack.len() < size + 1 {
                    return self.runtime_error("Stack underflow".to_owned(), op_pc);
                }

                let Some(array) = self.pool.allocate_array(size) else {
                    return self.retry_oom(op_pc);
                };
                let Value::Array(id) = array else { unreachable!() };

                self.stack.pop(); // size
                for slot in (0..size).rev() {
                    let element = self.stack.pop().expect("element count checked");
                    self.pool.array_mut(id).elements[slot] = element;
                }
                self.stack.push(array);
                Control::Continue
            }

            Opcode::Try => {
                let offset = fetch!(self, op_pc, fetch_i32);
                let base = i64::try_from(self.pc).expect("pc exceeds i64");
                let catch_pc = base + i64::from(offset);
                let Ok(catch_pc) = usize::try_from(catch_pc) else {
                    return self.fatal("Invalid catch handler offset".to_owned(), op_pc);
                };
                self.handlers.push(ExceptionHandler {
                    catch_pc,
                    stack_size: self.stack.len(),
                });
                Control::Continue
            }

            Opcode::EndTry => {
                self.handlers.pop();
                Control::Continue
            }

            Opcode::Throw => {
                let value = pop!(self, op_pc);
                self.tracer.on_throw();
                if self.handlers.is_empty() {
                    let rendered = value.to_display(&self.pool);
                    return self.fatal(format!("Unhandled exception: {rendered}"), op_pc);
                }
                self.unwind(value);
                Control::Continue
            }

            Opcode::Print => {
                let value = pop!(self, op_pc);
                let rendered = value.to_display(&self.pool);
                platform.program_output(&rendered);
                Control::Continue
            }

            Opcode::Halt => {
                self.running = false;
                Control::Finished
            }
        }
    }

    // ===== Helpers =====

    fn fetch_u8(&mut self) -> Option<u8> {
        let byte = *self.module.code().get(self.pc)?;
        self.pc += 1;
        Some(byte)
    }

    fn fetch_u16(&mut self) -> Option<u16> {
        let bytes = self.module.code().get(self.pc..self.pc + 2)?;
        let value = u16::from_le_bytes([bytes[0], bytes[1]]);
        self.pc += 2;
        Some(value)
    }

    fn fetch_i32(&mut self) -> Option<i32> {
        let bytes = self.module.code().get(self.pc..self.pc + 4)?;
        let value = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.pc += 4;
        Some(value)
    }

    fn fetch_f32(&mut self) -> Option<f32> {
        let bytes = self.module.code().get(self.pc..self.pc + 4)?;
        let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.pc += 4;
        Some(value)
    }

    /// Applies a binary operator to the top two stack values. Operands stay
    /// on the stack until the operation succeeds, so an out-of-memory result
    /// can rewind and retry after a collection.
    fn binary_op(
        &mut self,
        op_pc: usize,
        f: impl FnOnce(&mut ValuePool, Value, Value) -> arith::OpResult,
    ) -> Control {
        let len = self.stack.len();
        if len < 2 {
            return self.runtime_error("Stack underflow".to_owned(), op_pc);
        }
        let a = self.stack[len - 2];
        let b = self.stack[len - 1];

        match f(&mut self.pool, a, b) {
            Ok(result) => {
                self.stack.truncate(len - 2);
                self.stack.push(result);
                Control::Continue
            }
            Err(OpError::Runtime(msg)) => self.runtime_error(msg, op_pc),
            Err(OpError::OutOfMemory) => self.retry_oom(op_pc),
        }
    }

    fn jump_relative(&mut self, offset: i32, op_pc: usize) -> Control {
        let base = i64::try_from(self.pc).expect("pc exceeds i64");
        let target = base + i64::from(offset);
        let code_len = i64::try_from(self.module.code().len()).expect("code length exceeds i64");
        if target < 0 || target > code_len {
            return self.fatal("Invalid jump target".to_owned(), op_pc);
        }
        self.pc = usize::try_from(target).expect("target bounds checked");
        Control::Continue
    }

    /// Pushes a frame for function-table slot `index`. `receiver` becomes
    /// local 0 for method calls, shifting the arguments up by one slot.
    fn call_function(&mut self, index: u16, argc: usize, receiver: Option<Value>, op_pc: usize) -> Control {
        let Some(info) = self.module.function_info(index) else {
            return self.runtime_error(format!("Invalid function index: {index}"), op_pc);
        };
        let name = self.module.function_name(index).unwrap_or("").to_owned();
        if info.entry_pc == 0 && index != 0 {
            return self.runtime_error(format!("Function not defined: {name}"), op_pc);
        }
        if self.stack.len() < argc {
            return self.runtime_error("Stack underflow".to_owned(), op_pc);
        }

        let stack_base = self.stack.len() - argc;
        let mut locals = AHashMap::new();
        let first_arg_slot = match receiver {
            Some(this) => {
                locals.insert(0, this);
                1usize
            }
            None => 0,
        };
        for offset in 0..argc {
            let Ok(slot) = u8::try_from(first_arg_slot + offset) else {
                return self.runtime_error("Too many call arguments".to_owned(), op_pc);
            };
            locals.insert(slot, self.stack[stack_base + offset]);
        }
        self.stack.truncate(stack_base);

        self.tracer.on_call(&name, self.call_stack.len() + 1);
        self.call_stack.push(CallFrame {
            return_pc: self.pc,
            stack_base,
            locals,
            function_name: name,
        });
        self.pc = info.entry_pc as usize;
        Control::Continue
    }

    /// `CALL_NATIVE` entry: receiver on top of the arguments.
    fn native_call(&mut self, name: &str, argc: usize, platform: &mut dyn Platform, op_pc: usize) -> Control {
        let receiver = pop!(self, op_pc);
        self.native_dispatch(receiver, name, argc, platform, op_pc)
    }

    /// Shared capability-dispatch tail for `CALL_NATIVE` and method calls
    /// that resolve to no user class function.
    fn native_dispatch(
        &mut self,
        receiver: Value,
        name: &str,
        argc: usize,
        platform: &mut dyn Platform,
        op_pc: usize,
    ) -> Control {
        if self.stack.len() < argc {
            return self.runtime_error("Stack underflow".to_owned(), op_pc);
        }
        // Capability calls are short; stage the arguments inline.
        let args: SmallVec<[Value; 8]> = self.stack.drain(self.stack.len() - argc..).collect();

        let class = match receiver {
            Value::Object(id) => self.pool.object(id).class_name.clone(),
            _ => String::new(),
        };
        self.tracer.on_native_call(&class, name);

        // Sleep is interpreter state, not a platform call: record the
        // deadline, yield at this boundary.
        if name == "sleep" {
            let ms = match args.first() {
                Some(Value::I32(ms)) => u32::try_from(*ms).unwrap_or(0),
                _ => 0,
            };
            self.sleeping_until = Some(platform.system_time().wrapping_add(ms));
            self.stack.push(Value::Null);
            return Control::Yield;
        }

        match native::dispatch(&mut self.pool, platform, &class, name, &args) {
            Ok(result) => {
                self.stack.push(result);
                Control::Continue
            }
            Err(OpError::Runtime(msg)) => self.runtime_error(msg, op_pc),
            Err(OpError::OutOfMemory) => {
                // The arguments are already consumed; this is not retryable.
                self.error = Some("Out of memory".to_owned());
                self.running = false;
                Control::OutOfMemory
            }
        }
    }

    /// Converts a runtime error into a string-valued throw when a handler is
    /// active; otherwise halts fatally with the message.
    fn runtime_error(&mut self, message: String, op_pc: usize) -> Control {
        if self.handlers.is_empty() {
            return self.fatal(message, op_pc);
        }
        self.tracer.on_throw();
        match self.pool.allocate_string(&message) {
            Some(value) => {
                self.unwind(value);
                Control::Continue
            }
            None => {
                self.error = Some("Out of memory".to_owned());
                self.running = false;
                Control::OutOfMemory
            }
        }
    }

    /// Transfers control to the innermost handler with `value` on the stack.
    fn unwind(&mut self, value: Value) {
        let handler = self.handlers.pop().expect("caller checked handlers");
        self.stack.truncate(handler.stack_size);
        self.stack.push(value);
        self.pc = handler.catch_pc;
    }

    fn fatal(&mut self, message: String, op_pc: usize) -> Control {
        let line = self.module.source_line(op_pc);
        let message = if self.module.has_debug_info() && line > 0 {
            format!("{message} (line {line})")
        } else {
            message
        };
        self.error = Some(message);
        self.running = false;
        Control::Fatal
    }

    /// Rewinds to the faulting instruction and reports `OutOfMemory`; the
    /// operands are still in place, so the host can collect and retry.
    fn retry_oom(&mut self, op_pc: usize) -> Control {
        self.pc = op_pc;
        Control::OutOfMemory
    }
}
