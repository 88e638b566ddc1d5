//! Stack-based bytecode virtual machine.
//!
//! `run` is a flat fetch-decode-execute loop over the current frame's
//! [`Chunk`]. There is no interpreter-level recursion for nested calls:
//! calling a function pushes a [`CallFrame`] and the loop keeps going,
//! reading instructions out of whichever frame is now on top.

use crate::chunk::{OpCode, ACCESS_SET};
use crate::compiler::Compiler;
use crate::error::{BacktraceFrame, Error, InterpretResult, RuntimeError};
use crate::object::{Heap, NativeFn, Obj, ObjRef, Upvalue};
use crate::operators;
use crate::table::Table;
use crate::value::Value;

const STACK_MAX: usize = 16 * 1024;
const FRAMES_MAX: usize = 64;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slot_base: usize,
}

/// The virtual machine. Every entry point takes `&mut Vm` explicitly —
/// there is no global interpreter state, so multiple VMs can coexist in one
/// process.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
}

impl Vm {
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern_string("init");
        Self {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(8),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
        }
    }

    /// Compile and run one source text to completion. Globals and natives
    /// registered before this call remain visible; the operand stack is
    /// empty again when this returns, whether it succeeded or not. The
    /// returned `Value` is whatever the top-level script returned (`Null`
    /// unless a bare `return;` executed early).
    pub fn interpret(&mut self, source: &str) -> InterpretResult<Value> {
        let function = match Compiler::compile(&mut self.heap, source) {
            Ok(function) => function,
            Err(diagnostics) => return Err(Error::Compile(diagnostics)),
        };
        let function_ref = self.heap.alloc_function(function);
        let closure_ref = self.heap.alloc_closure(function_ref, Vec::new());
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.stack.push(Value::Obj(closure_ref));
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slot_base: 0 });

        let result = self.run();
        let result = result.map_err(|error| {
            let backtrace = self.build_backtrace();
            Error::Runtime { error, backtrace }
        });
        if result.is_err() {
            self.stack.clear();
            self.frames.clear();
            self.open_upvalues.clear();
        }
        result
    }

    /// Capture the active call frames as a backtrace, innermost first, while
    /// they are still on the stack.
    fn build_backtrace(&self) -> Vec<BacktraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let function_ref = match self.heap.get(frame.closure) {
                    Obj::Closure(c) => c.function,
                    _ => unreachable!("call frame does not hold a closure"),
                };
                let (name, line) = match self.heap.get(function_ref) {
                    Obj::Function(f) => {
                        let name = match f.name {
                            Some(n) => self.heap.string_contents(n).to_owned(),
                            None => "script".to_owned(),
                        };
                        (name, f.chunk.line_at(frame.ip.saturating_sub(1)))
                    }
                    _ => unreachable!("closure does not point at a function"),
                };
                BacktraceFrame { name, line }
            })
            .collect()
    }

    /// Register a native function under `name` in the global namespace.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_ref = self.heap.intern_string(name);
        let native_ref = self.heap.alloc_native(name_ref, function);
        let hash = self.heap.string_hash(name_ref);
        self.globals.set(name_ref, hash, Value::Obj(native_ref));
    }

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::Host("stack underflow".to_owned()))
    }

    pub fn peek(&self, distance: usize) -> Result<Value, RuntimeError> {
        let len = self.stack.len();
        if distance >= len {
            return Err(RuntimeError::Host("stack underflow".to_owned()));
        }
        Ok(self.stack[len - 1 - distance])
    }

    /// Intern a string for a native to return as a [`Value`].
    pub fn copy_string(&mut self, s: &str) -> Value {
        Value::Obj(self.heap.intern_string(s))
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    // --- bytecode fetch -----------------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let frame_idx = self.frames.len() - 1;
        let ip = self.frames[frame_idx].ip;
        let byte = self.current_chunk_code(frame_idx)[ip];
        self.frames[frame_idx].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        (u16::from(hi) << 8) | u16::from(lo)
    }

    fn current_chunk_code(&self, frame_idx: usize) -> &[u8] {
        let closure = self.frames[frame_idx].closure;
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("call frame does not hold a closure"),
        };
        match self.heap.get(function) {
            Obj::Function(f) => &f.chunk.code,
            _ => unreachable!("closure does not point at a function"),
        }
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_u16();
        let frame_idx = self.frames.len() - 1;
        let closure = self.frames[frame_idx].closure;
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("call frame does not hold a closure"),
        };
        match self.heap.get(function) {
            Obj::Function(f) => f.chunk.constants[idx as usize],
            _ => unreachable!("closure does not point at a function"),
        }
    }

    fn read_string_constant(&mut self) -> ObjRef {
        self.read_constant().as_obj().expect("string constant operand must be an object")
    }

    fn current_line(&self) -> u32 {
        let frame_idx = self.frames.len() - 1;
        let closure = self.frames[frame_idx].closure;
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        match self.heap.get(function) {
            Obj::Function(f) => f.chunk.line_at(self.frames[frame_idx].ip.saturating_sub(1)),
            _ => unreachable!(),
        }
    }

    // --- execution ------------------------------------------------------------

    fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }

            let op = OpCode::from_u8(self.read_byte());
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v)?;
                }
                OpCode::Bool => {
                    let name = self.read_string_constant();
                    let value = match self.heap.string_contents(name) {
                        "NULL" => Value::Null,
                        "TRUE" => Value::Boolean(true),
                        "FALS" => Value::Boolean(false),
                        _ => return Err(RuntimeError::UnknownBoolConstant),
                    };
                    self.push(value)?;
                }
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::Local => {
                    let slot = self.read_byte() as usize;
                    let is_set = self.read_byte() == ACCESS_SET;
                    let base = self.frames.last().expect("frame stack is never empty during run").slot_base;
                    if is_set {
                        let value = self.peek(0)?;
                        self.stack[base + slot] = value;
                    } else {
                        self.push(self.stack[base + slot])?;
                    }
                }
                OpCode::Global => {
                    let name = self.read_string_constant();
                    let is_set = self.read_byte() == ACCESS_SET;
                    let hash = self.heap.string_hash(name);
                    if is_set {
                        let value = self.peek(0)?;
                        if self.globals.set(name, hash, value) {
                            self.globals.delete(name, hash);
                            return Err(self.undefined_variable(name));
                        }
                    } else {
                        match self.globals.get(name, hash) {
                            Some(value) => self.push(value)?,
                            None => return Err(self.undefined_variable(name)),
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.string_hash(name);
                    let value = self.pop()?;
                    self.globals.set(name, hash, value);
                }
                OpCode::Upvalue => {
                    let slot = self.read_byte() as usize;
                    let is_set = self.read_byte() == ACCESS_SET;
                    if is_set {
                        let value = self.peek(0)?;
                        self.write_upvalue(slot, value);
                    } else {
                        let value = self.read_upvalue(slot);
                        self.push(value)?;
                    }
                }
                OpCode::GetProperty => self.get_property()?,
                OpCode::SetProperty => self.set_property()?,
                OpCode::GetSuper => {
                    let name = self.read_string_constant();
                    let superclass_value = self.pop()?;
                    let superclass = superclass_value.as_obj().expect("superclass operand must be an object");
                    self.bind_method(superclass, name)?;
                }
                OpCode::Compare => {
                    let op = self.read_string_constant();
                    match self.heap.string_contents(op) {
                        "!" => {
                            let v = self.pop()?;
                            self.push(Value::Boolean(!v.is_truthy()))?;
                        }
                        "=" => {
                            let b = self.pop()?;
                            let a = self.pop()?;
                            self.push(Value::Boolean(operators::values_equal(a, b)))?;
                        }
                        ">" => {
                            let b = self.pop()?;
                            let a = self.pop()?;
                            self.push(operators::greater(a, b)?)?;
                        }
                        "<" => {
                            let b = self.pop()?;
                            let a = self.pop()?;
                            self.push(operators::less(a, b)?)?;
                        }
                        other => return Err(RuntimeError::Host(format!("unknown comparison operator {other:?}"))),
                    }
                }
                OpCode::Binary => {
                    let op = self.read_string_constant();
                    match self.heap.string_contents(op) {
                        "+" => {
                            let b = self.pop()?;
                            let a = self.pop()?;
                            let result = operators::add(&mut self.heap, a, b)?;
                            self.push(result)?;
                        }
                        "-" => {
                            let b = self.pop()?;
                            let a = self.pop()?;
                            self.push(operators::subtract(a, b)?)?;
                        }
                        "*" => {
                            let b = self.pop()?;
                            let a = self.pop()?;
                            self.push(operators::multiply(a, b)?)?;
                        }
                        "/" => {
                            let b = self.pop()?;
                            let a = self.pop()?;
                            self.push(operators::divide(a, b)?)?;
                        }
                        other => return Err(RuntimeError::Host(format!("unknown binary operator {other:?}"))),
                    }
                }
                OpCode::Unary => {
                    let v = self.pop()?;
                    self.push(operators::negate(v)?)?;
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as i16;
                    let idx = self.frames.len() - 1;
                    self.frames[idx].ip = (self.frames[idx].ip as i64 + i64::from(offset)) as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if !self.peek(0)?.is_truthy() {
                        let idx = self.frames.len() - 1;
                        self.frames[idx].ip += offset as usize;
                    }
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count)?;
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte() as usize;
                    let superclass_value = self.pop()?;
                    let superclass = superclass_value.as_obj().expect("superclass operand must be an object");
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let value = self.read_constant();
                    let function_ref = value.as_obj().expect("closure operand must name a function");
                    let upvalue_count = match self.heap.get(function_ref) {
                        Obj::Function(f) => f.upvalue_count,
                        _ => unreachable!(),
                    };
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte();
                        if is_local {
                            let base = self.frames.last().expect("frame stack is never empty during run").slot_base;
                            upvalues.push(self.capture_upvalue(base + index as usize));
                        } else {
                            let enclosing_closure = self.frames.last().expect("frame stack is never empty during run").closure;
                            let uv = match self.heap.get(enclosing_closure) {
                                Obj::Closure(c) => c.upvalues[index as usize],
                                _ => unreachable!(),
                            };
                            upvalues.push(uv);
                        }
                    }
                    let closure_ref = self.heap.alloc_closure(function_ref, upvalues);
                    self.push(Value::Obj(closure_ref))?;
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop()?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self.frames.pop().expect("returned from an empty frame stack");
                    self.close_upvalues(frame.slot_base);
                    if self.frames.is_empty() {
                        self.stack.truncate(frame.slot_base);
                        return Ok(result);
                    }
                    self.stack.truncate(frame.slot_base);
                    self.push(result)?;
                }
                OpCode::Class => {
                    let name = self.read_string_constant();
                    let class_ref = self.heap.alloc_class(name);
                    self.push(Value::Obj(class_ref))?;
                }
                OpCode::Inherit => self.inherit()?,
                OpCode::Method => {
                    let name = self.read_string_constant();
                    self.define_method(name)?;
                }
            }
        }
    }

    // --- property and method dispatch -----------------------------------------

    fn get_property(&mut self) -> Result<(), RuntimeError> {
        let receiver = self.peek(0)?;
        let Some(instance_ref) = receiver.as_obj() else {
            return Err(RuntimeError::NotAnInstance);
        };
        let name = self.read_string_constant();
        let field = match self.heap.get(instance_ref) {
            Obj::Instance(i) => {
                let hash = self.heap.string_hash(name);
                i.fields.get(name, hash)
            }
            _ => return Err(RuntimeError::NotAnInstance),
        };
        if let Some(value) = field {
            self.pop()?;
            self.push(value)?;
            return Ok(());
        }
        self.bind_method(instance_ref, name)
    }

    fn set_property(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        let receiver = self.pop()?;
        let Some(instance_ref) = receiver.as_obj() else {
            return Err(RuntimeError::NotAnInstance);
        };
        let name = self.read_string_constant();
        let hash = self.heap.string_hash(name);
        match self.heap.get_mut(instance_ref) {
            Obj::Instance(i) => {
                i.fields.set(name, hash, value);
            }
            _ => return Err(RuntimeError::NotAnInstance),
        }
        self.push(value)
    }

    fn bind_method(&mut self, class_or_instance_class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let hash = self.heap.string_hash(name);
        let method = match self.heap.get(class_or_instance_class) {
            Obj::Class(c) => c.methods.get(name, hash),
            Obj::Instance(i) => match self.heap.get(i.class) {
                Obj::Class(c) => c.methods.get(name, hash),
                _ => None,
            },
            _ => None,
        };
        let Some(method_value) = method else {
            return Err(self.undefined_property(name));
        };
        let method_ref = method_value.as_obj().expect("method table entries are always closures");
        let receiver = self.pop()?;
        let bound_ref = self.heap.alloc_bound_method(receiver, method_ref);
        self.push(Value::Obj(bound_ref))
    }

    fn define_method(&mut self, name: ObjRef) -> Result<(), RuntimeError> {
        let method = self.pop()?;
        let class_value = self.peek(0)?;
        let class_ref = class_value.as_obj().expect("method target must be a class");
        let hash = self.heap.string_hash(name);
        match self.heap.get_mut(class_ref) {
            Obj::Class(c) => {
                c.methods.set(name, hash, method);
                Ok(())
            }
            _ => Err(RuntimeError::Host("method defined on a non-class".to_owned())),
        }
    }

    fn inherit(&mut self) -> Result<(), RuntimeError> {
        let superclass_value = self.peek(1)?;
        let Some(superclass_ref) = superclass_value.as_obj() else {
            return Err(RuntimeError::SuperclassNotClass);
        };
        if !matches!(self.heap.get(superclass_ref), Obj::Class(_)) {
            return Err(RuntimeError::SuperclassNotClass);
        }
        let inherited: Vec<(ObjRef, u64, Value)> = match self.heap.get(superclass_ref) {
            Obj::Class(c) => c.methods.iter().map(|(k, v)| (k, self.heap.string_hash(k), v)).collect(),
            _ => unreachable!(),
        };
        let subclass_value = self.pop()?;
        let subclass_ref = subclass_value.as_obj().expect("subclass operand must be a class");
        match self.heap.get_mut(subclass_ref) {
            Obj::Class(c) => {
                for (key, hash, value) in inherited {
                    c.methods.set(key, hash, value);
                }
                Ok(())
            }
            _ => Err(RuntimeError::Host("inherit target is not a class".to_owned())),
        }
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count)?;
        let Some(instance_ref) = receiver.as_obj() else {
            return Err(RuntimeError::NotAnInstance);
        };
        let (field, class_ref) = match self.heap.get(instance_ref) {
            Obj::Instance(i) => {
                let hash = self.heap.string_hash(name);
                (i.fields.get(name, hash), i.class)
            }
            _ => return Err(RuntimeError::NotAnInstance),
        };
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }
        self.invoke_from_class(class_ref, name, arg_count)
    }

    fn invoke_from_class(&mut self, class_ref: ObjRef, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let hash = self.heap.string_hash(name);
        let method = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(name, hash),
            _ => None,
        };
        let Some(method_value) = method else {
            return Err(self.undefined_property(name));
        };
        self.call_value(method_value, arg_count)
    }

    // --- calling --------------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let Some(obj_ref) = callee.as_obj() else {
            return Err(RuntimeError::NotCallable);
        };
        match self.heap.get(obj_ref) {
            Obj::Closure(_) => self.call_closure(obj_ref, arg_count),
            Obj::Native(native) => {
                let function = native.function;
                let start = self.stack.len() - arg_count;
                let args: Vec<Value> = self.stack[start..].to_vec();
                let result = function(self, &args)?;
                self.stack.truncate(start - 1);
                self.push(result)
            }
            Obj::Class(_) => {
                let instance_ref = self.heap.alloc_instance(obj_ref);
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = Value::Obj(instance_ref);
                let hash = self.heap.string_hash(self.init_string);
                let initializer = match self.heap.get(obj_ref) {
                    Obj::Class(c) => c.methods.get(self.init_string, hash),
                    _ => unreachable!(),
                };
                match initializer {
                    Some(init_value) => {
                        let init_ref = init_value.as_obj().expect("initializer must be a closure");
                        self.call_closure(init_ref, arg_count)
                    }
                    None if arg_count != 0 => Err(RuntimeError::ArityMismatch { expected: 0, got: arg_count }),
                    None => Ok(()),
                }
            }
            Obj::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method_ref = bound.method;
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_closure(method_ref, arg_count)
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let function_ref = match self.heap.get(closure_ref) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("call_closure called on a non-closure"),
        };
        let arity = match self.heap.get(function_ref) {
            Obj::Function(f) => f.arity as usize,
            _ => unreachable!(),
        };
        if arg_count != arity {
            return Err(RuntimeError::ArityMismatch { expected: arity, got: arg_count });
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(RuntimeError::StackOverflow);
        }
        let slot_base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slot_base });
        Ok(())
    }

    // --- upvalues ---------------------------------------------------------------

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        if let Some(existing) = self.open_upvalues.iter().find(|r| match self.heap.get(**r) {
            Obj::Upvalue(Upvalue::Open(idx)) => *idx == stack_index,
            _ => false,
        }) {
            return *existing;
        }
        let upvalue_ref = self.heap.alloc_open_upvalue(stack_index);
        self.open_upvalues.push(upvalue_ref);
        self.open_upvalues.sort_by_key(|r| match self.heap.get(*r) {
            Obj::Upvalue(Upvalue::Open(idx)) => std::cmp::Reverse(*idx),
            _ => std::cmp::Reverse(0),
        });
        upvalue_ref
    }

    fn close_upvalues(&mut self, from_index: usize) {
        let mut remaining = Vec::with_capacity(self.open_upvalues.len());
        for r in self.open_upvalues.drain(..) {
            let stack_index = match self.heap.get(r) {
                Obj::Upvalue(Upvalue::Open(idx)) => *idx,
                _ => {
                    remaining.push(r);
                    continue;
                }
            };
            if stack_index >= from_index {
                let value = self.stack[stack_index];
                if let Obj::Upvalue(u) = self.heap.get_mut(r) {
                    *u = Upvalue::Closed(value);
                }
            } else {
                remaining.push(r);
            }
        }
        self.open_upvalues = remaining;
    }

    fn read_upvalue(&mut self, slot: usize) -> Value {
        let closure = self.frames.last().expect("frame stack is never empty during run").closure;
        let upvalue_ref = match self.heap.get(closure) {
            Obj::Closure(c) => c.upvalues[slot],
            _ => unreachable!(),
        };
        match self.heap.get(upvalue_ref) {
            Obj::Upvalue(Upvalue::Open(idx)) => self.stack[*idx],
            Obj::Upvalue(Upvalue::Closed(v)) => *v,
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, slot: usize, value: Value) {
        let closure = self.frames.last().expect("frame stack is never empty during run").closure;
        let upvalue_ref = match self.heap.get(closure) {
            Obj::Closure(c) => c.upvalues[slot],
            _ => unreachable!(),
        };
        match self.heap.get_mut(upvalue_ref) {
            Obj::Upvalue(Upvalue::Open(idx)) => {
                let idx = *idx;
                self.stack[idx] = value;
            }
            Obj::Upvalue(u) => *u = Upvalue::Closed(value),
            _ => unreachable!(),
        }
    }

    // --- garbage collection -------------------------------------------------------

    fn mark_roots(&self) -> Vec<ObjRef> {
        let mut roots = Vec::new();
        for value in &self.stack {
            if let Some(r) = value.as_obj() {
                roots.push(r);
            }
        }
        for (key, value) in self.globals.iter() {
            roots.push(key);
            if let Some(r) = value.as_obj() {
                roots.push(r);
            }
        }
        for frame in &self.frames {
            roots.push(frame.closure);
        }
        roots.extend(self.open_upvalues.iter().copied());
        roots.push(self.init_string);
        roots
    }

    pub fn collect_garbage(&mut self) {
        let mut worklist = self.mark_roots();
        while let Some(r) = worklist.pop() {
            if self.heap.mark(r) {
                worklist.extend(self.heap.children_of(r));
            }
        }
        self.heap.sweep();
        self.heap.grow_next_gc();
    }

    // --- formatting and errors -----------------------------------------------------

    /// Render a value the way a `print` native should: the same textual form
    /// clox uses, so a host stdlib's print native can defer to this instead
    /// of re-implementing formatting.
    #[must_use]
    pub fn stringify(&self, value: Value) -> String {
        match value {
            Value::Null => "nil".to_owned(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Obj(r) => match self.heap.get(r) {
                Obj::String(s) => s.chars.clone(),
                Obj::Function(f) => match f.name {
                    Some(n) => format!("<fn {}>", self.heap.string_contents(n)),
                    None => "<script>".to_owned(),
                },
                Obj::Native(_) => "<native fn>".to_owned(),
                Obj::Closure(c) => match self.heap.get(c.function) {
                    Obj::Function(f) => match f.name {
                        Some(n) => format!("<fn {}>", self.heap.string_contents(n)),
                        None => "<script>".to_owned(),
                    },
                    _ => "<fn>".to_owned(),
                },
                Obj::Upvalue(_) => "<upvalue>".to_owned(),
                Obj::Class(c) => self.heap.string_contents(c.name).to_owned(),
                Obj::Instance(i) => match self.heap.get(i.class) {
                    Obj::Class(c) => format!("{} instance", self.heap.string_contents(c.name)),
                    _ => "instance".to_owned(),
                },
                Obj::BoundMethod(b) => match self.heap.get(b.method) {
                    Obj::Closure(c) => match self.heap.get(c.function) {
                        Obj::Function(f) => match f.name {
                            Some(n) => format!("<fn {}>", self.heap.string_contents(n)),
                            None => "<script>".to_owned(),
                        },
                        _ => "<fn>".to_owned(),
                    },
                    _ => "<bound method>".to_owned(),
                },
            },
        }
    }

    fn undefined_variable(&self, name: ObjRef) -> RuntimeError {
        let _ = self.current_line();
        RuntimeError::UndefinedVariable(self.heap.string_contents(name).to_owned())
    }

    fn undefined_property(&self, name: ObjRef) -> RuntimeError {
        RuntimeError::UndefinedProperty(self.heap.string_contents(name).to_owned())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    thread_local! {
        static RECORDED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    /// A `print`-like native used only by these tests: stringifies its one
    /// argument into a thread-local buffer the test can inspect afterward.
    /// `print` itself is stdlib surface, not part of this crate.
    fn record(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
        let rendered = vm.stringify(args[0]);
        RECORDED.with(|r| r.borrow_mut().push(rendered));
        Ok(Value::Null)
    }

    fn vm_with_record() -> Vm {
        RECORDED.with(|r| r.borrow_mut().clear());
        let mut vm = Vm::new();
        vm.define_native("record", record);
        vm
    }

    fn recorded() -> Vec<String> {
        RECORDED.with(|r| r.borrow().clone())
    }

    #[test]
    fn runs_arithmetic() {
        let mut vm = vm_with_record();
        assert!(vm.interpret("record(1 + 2 * 3);").is_ok());
        assert_eq!(recorded(), vec!["7"]);
    }

    #[test]
    fn global_variables_persist_across_interpret_calls() {
        let mut vm = vm_with_record();
        vm.interpret("var x = 41;").unwrap();
        assert!(vm.interpret("record(x + 1);").is_ok());
        assert_eq!(recorded(), vec!["42"]);
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("missing;").unwrap_err();
        assert!(matches!(err, Error::Runtime { error: RuntimeError::UndefinedVariable(_), .. }));
    }

    #[test]
    fn closures_capture_enclosing_locals() {
        let mut vm = vm_with_record();
        let source = r#"
            fun makeCounter() {
              var count = 0;
              fun counter() {
                count = count + 1;
                return count;
              }
              return counter;
            }
            var c = makeCounter();
            record(c());
            record(c());
        "#;
        assert!(vm.interpret(source).is_ok());
        assert_eq!(recorded(), vec!["1", "2"]);
    }

    #[test]
    fn classes_support_init_and_inheritance() {
        let mut vm = vm_with_record();
        let source = r#"
            class Animal {
              init(name) {
                this.name = name;
              }
              speak() {
                return this.name;
              }
            }
            class Dog < Animal {
              speak() {
                return super.speak() + " woofs";
              }
            }
            var d = Dog("Rex");
            record(d.speak());
        "#;
        assert!(vm.interpret(source).is_ok());
        assert_eq!(recorded(), vec!["Rex woofs"]);
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("var x = 1; x();").unwrap_err();
        assert!(matches!(err, Error::Runtime { error: RuntimeError::NotCallable, .. }));
    }

    #[test]
    fn native_functions_can_be_registered_and_called() {
        fn double(_vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
            Ok(Value::Number(args[0].as_number().unwrap_or(0.0) * 2.0))
        }
        let mut vm = vm_with_record();
        vm.define_native("double", double);
        assert!(vm.interpret("record(double(21));").is_ok());
        assert_eq!(recorded(), vec!["42"]);
    }

    #[test]
    fn runtime_error_carries_a_backtrace() {
        let mut vm = Vm::new();
        let source = r#"
            fun inner() {
              return 1 / nil;
            }
            inner();
        "#;
        let err = vm.interpret(source).unwrap_err();
        let Error::Runtime { backtrace, .. } = err else {
            panic!("expected a runtime error");
        };
        assert_eq!(backtrace.len(), 2);
        assert_eq!(backtrace[0].name, "inner");
        assert_eq!(backtrace[1].name, "script");
    }

    #[test]
    fn bool_constants_and_falsey_negation() {
        let mut vm = vm_with_record();
        assert!(vm.interpret("record(!nil); record(!false); record(true);").is_ok());
        assert_eq!(recorded(), vec!["true", "true", "true"]);
    }
}
