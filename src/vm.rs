//! The stack-based bytecode interpreter. `Vm` owns the heap, the value and
//! call-frame stacks, and the globals table; `run` is the single dispatch
//! loop that walks a chunk's bytes one instruction at a time.

use crate::chunk::OpCode;
use crate::compiler;
use crate::error::{InterpretResult, Phase, Report, Reporter, RuntimeError};
use crate::gc::Heap;
use crate::natives;
use crate::object::{self, NativeFn, Obj, ObjData, ObjKind, UpvalueState};
use crate::table::Table;
use crate::value::Value;
use std::convert::TryFrom;

/// Maximum call-frame depth. A program at exactly this depth is fine; one
/// frame deeper is a `StackOverflow` runtime error.
const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: *mut Obj,
    ip: usize,
    base: usize,
}

unsafe fn closure_function(closure: *mut Obj) -> *mut Obj {
    (*closure).data_closure().function
}

unsafe fn function_chunk<'a>(function: *mut Obj) -> &'a crate::chunk::Chunk {
    &(*function).data_function().chunk
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table<Value>,
    heap: Heap,
    open_upvalues: Vec<*mut Obj>,
    init_string: *mut Obj,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Vm {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            heap,
            open_upvalues: Vec::new(),
            init_string,
        };
        vm.define_native("clock", natives::clock);
        vm.define_native("hasattr", natives::hasattr);
        vm
    }

    fn define_native(&mut self, name: &'static str, function: NativeFn) {
        let name_obj = self.heap.intern(name);
        let native_obj = self.heap.alloc_native(name, 0, function);
        self.globals.set(name_obj, Value::Object(native_obj));
    }

    /// Compiles and runs one program. `is_repl` controls whether a bare
    /// top-level expression statement prints its value instead of being
    /// discarded, matching the REPL's implicit-echo convention.
    pub fn interpret(
        &mut self,
        source: &str,
        is_repl: bool,
        reporter: &mut dyn Reporter,
    ) -> InterpretResult {
        let function = match compiler::compile(source, &mut self.heap, is_repl) {
            Ok(function) => function,
            Err(errors) => {
                for error in errors {
                    reporter.report(Report::new(Phase::Compile, error.to_string()));
                }
                return InterpretResult::CompileError;
            }
        };
        let closure = self.heap.alloc_closure(function, Vec::new());
        self.stack.push(Value::Object(closure));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: 0,
        });
        self.run(reporter)
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = unsafe { function_chunk(closure_function(frame.closure)).byte(frame.ip) };
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_byte() as u16;
        let hi = self.read_byte() as u16;
        lo | (hi << 8)
    }

    fn read_u24(&mut self) -> u32 {
        let a = self.read_byte() as u32;
        let b = self.read_byte() as u32;
        let c = self.read_byte() as u32;
        a | (b << 8) | (c << 16)
    }

    fn constant_at(&self, index: u32) -> Value {
        let frame = self.frames.last().unwrap();
        *unsafe { function_chunk(closure_function(frame.closure)).constant(index as usize) }
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as u32;
        self.constant_at(index)
    }

    fn read_constant_long(&mut self) -> Value {
        let index = self.read_u24();
        self.constant_at(index)
    }

    fn read_string(&mut self) -> *mut Obj {
        match self.read_constant() {
            Value::Object(obj) => obj,
            _ => panic!("constant is not a string"),
        }
    }

    fn read_string_long(&mut self) -> *mut Obj {
        match self.read_constant_long() {
            Value::Object(obj) => obj,
            _ => panic!("constant is not a string"),
        }
    }

    fn run(&mut self, reporter: &mut dyn Reporter) -> InterpretResult {
        loop {
            #[cfg(feature = "debug-execution")]
            self.trace();

            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(()) => panic!("corrupt bytecode: invalid opcode byte {byte}"),
            };
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::ConstantLong => {
                    let value = self.read_constant_long();
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
                    let base = self.frames.last().unwrap().base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    if let Some(result) = self.op_get_global(reporter, name) {
                        return result;
                    }
                }
                OpCode::GetGlobalLong => {
                    let name = self.read_string_long();
                    if let Some(result) = self.op_get_global(reporter, name) {
                        return result;
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    self.op_define_global(name);
                }
                OpCode::DefineGlobalLong => {
                    let name = self.read_string_long();
                    self.op_define_global(name);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    if let Some(result) = self.op_set_global(reporter, name) {
                        return result;
                    }
                }
                OpCode::SetGlobalLong => {
                    let name = self.read_string_long();
                    if let Some(result) = self.op_set_global(reporter, name) {
                        return result;
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue = unsafe { (*closure).data_closure().upvalues[slot] };
                    self.push(self.read_upvalue(upvalue));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue = unsafe { (*closure).data_closure().upvalues[slot] };
                    let value = self.peek(0);
                    self.write_upvalue(upvalue, value);
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    if let Some(result) = self.op_get_property(reporter, name) {
                        return result;
                    }
                }
                OpCode::GetPropertyLong => {
                    let name = self.read_string_long();
                    if let Some(result) = self.op_get_property(reporter, name) {
                        return result;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    if let Some(result) = self.op_set_property(reporter, name) {
                        return result;
                    }
                }
                OpCode::SetPropertyLong => {
                    let name = self.read_string_long();
                    if let Some(result) = self.op_set_property(reporter, name) {
                        return result;
                    }
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    if let Some(result) = self.op_get_super(reporter, name) {
                        return result;
                    }
                }
                OpCode::GetSuperLong => {
                    let name = self.read_string_long();
                    if let Some(result) = self.op_get_super(reporter, name) {
                        return result;
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    if let Some(result) = self.binary_number(reporter, |a, b| Value::Bool(a > b)) {
                        return result;
                    }
                }
                OpCode::Less => {
                    if let Some(result) = self.binary_number(reporter, |a, b| Value::Bool(a < b)) {
                        return result;
                    }
                }
                OpCode::Add => {
                    if let Some(result) = self.add(reporter) {
                        return result;
                    }
                }
                OpCode::Subtract => {
                    if let Some(result) =
                        self.binary_number(reporter, |a, b| Value::Number(a - b))
                    {
                        return result;
                    }
                }
                OpCode::Multiply => {
                    if let Some(result) =
                        self.binary_number(reporter, |a, b| Value::Number(a * b))
                    {
                        return result;
                    }
                }
                OpCode::Divide => {
                    if let Some(result) =
                        self.binary_number(reporter, |a, b| Value::Number(a / b))
                    {
                        return result;
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return self.runtime_error(reporter, RuntimeError::NotANumber),
                },
                OpCode::Print => {
                    let value = self.pop();
                    println!("{value}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    if let Err(err) = self.call_value(callee, arg_count) {
                        return self.runtime_error(reporter, err);
                    }
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    if let Err(err) = self.invoke(name, arg_count) {
                        return self.runtime_error(reporter, err);
                    }
                }
                OpCode::InvokeLong => {
                    let name = self.read_string_long();
                    let arg_count = self.read_byte();
                    if let Err(err) = self.invoke(name, arg_count) {
                        return self.runtime_error(reporter, err);
                    }
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte();
                    if let Some(result) = self.op_super_invoke(reporter, name, arg_count) {
                        return result;
                    }
                }
                OpCode::SuperInvokeLong => {
                    let name = self.read_string_long();
                    let arg_count = self.read_byte();
                    if let Some(result) = self.op_super_invoke(reporter, name, arg_count) {
                        return result;
                    }
                }
                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Object(obj) => obj,
                        _ => panic!("constant is not a function"),
                    };
                    self.op_closure(function);
                }
                OpCode::ClosureLong => {
                    let function = match self.read_constant_long() {
                        Value::Object(obj) => obj,
                        _ => panic!("constant is not a function"),
                    };
                    self.op_closure(function);
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frames.last().unwrap().base;
                    self.close_upvalues(base);
                    self.stack.truncate(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        return InterpretResult::Ok;
                    }
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    self.op_class(name);
                }
                OpCode::ClassLong => {
                    let name = self.read_string_long();
                    self.op_class(name);
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let super_obj = match superclass.as_object() {
                        Some(obj) if object::type_name(obj) == "class" => obj,
                        _ => return self.runtime_error(reporter, RuntimeError::InvalidSuperclass),
                    };
                    let subclass = self.peek(0).as_object().unwrap();
                    let inherited: Vec<(*mut Obj, Value)> = unsafe {
                        (*super_obj)
                            .data_class()
                            .methods
                            .iter()
                            .map(|(k, v)| (k, *v))
                            .collect()
                    };
                    for (key, value) in inherited {
                        unsafe { (*subclass).data_class_mut().methods.set(key, value) };
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    if let Some(result) = self.op_method(reporter, name) {
                        return result;
                    }
                }
                OpCode::MethodLong => {
                    let name = self.read_string_long();
                    if let Some(result) = self.op_method(reporter, name) {
                        return result;
                    }
                }
            }
        }
    }

    fn op_get_global(
        &mut self,
        reporter: &mut dyn Reporter,
        name: *mut Obj,
    ) -> Option<InterpretResult> {
        match self.globals.get(name) {
            Some(&value) => {
                self.push(value);
                None
            }
            None => {
                let name = object::str_contents(name).to_string();
                Some(self.runtime_error(reporter, RuntimeError::UndefinedGlobal { name }))
            }
        }
    }

    fn op_define_global(&mut self, name: *mut Obj) {
        let value = self.peek(0);
        self.globals.set(name, value);
        self.pop();
    }

    fn op_set_global(
        &mut self,
        reporter: &mut dyn Reporter,
        name: *mut Obj,
    ) -> Option<InterpretResult> {
        if self.globals.get(name).is_none() {
            let name = object::str_contents(name).to_string();
            return Some(self.runtime_error(reporter, RuntimeError::UndefinedGlobal { name }));
        }
        self.globals.set(name, self.peek(0));
        None
    }

    fn op_get_property(
        &mut self,
        reporter: &mut dyn Reporter,
        name: *mut Obj,
    ) -> Option<InterpretResult> {
        let receiver = self.peek(0);
        let instance = match receiver.as_object() {
            Some(obj) if object::type_name(obj) == "instance" => obj,
            _ => return Some(self.runtime_error(reporter, RuntimeError::NotAnInstance)),
        };
        let field = unsafe { (*instance).data_instance().fields.get(name).copied() };
        if let Some(value) = field {
            self.pop();
            self.push(value);
            None
        } else if let Err(err) = self.bind_method(instance, name) {
            Some(self.runtime_error(reporter, err))
        } else {
            None
        }
    }

    fn op_set_property(
        &mut self,
        reporter: &mut dyn Reporter,
        name: *mut Obj,
    ) -> Option<InterpretResult> {
        let value = self.peek(0);
        let instance = match self.peek(1).as_object() {
            Some(obj) if object::type_name(obj) == "instance" => obj,
            _ => return Some(self.runtime_error(reporter, RuntimeError::NotAnInstance)),
        };
        unsafe { (*instance).data_instance_mut().fields.set(name, value) };
        self.pop();
        self.pop();
        self.push(value);
        None
    }

    fn op_get_super(
        &mut self,
        reporter: &mut dyn Reporter,
        name: *mut Obj,
    ) -> Option<InterpretResult> {
        let superclass = self.pop().as_object().unwrap();
        let this = self.pop();
        let method = unsafe { (*superclass).data_class().methods.get(name).copied() };
        match method {
            Some(Value::Object(closure)) => {
                let bound = self.heap.alloc_bound_method(this, closure);
                self.check_gc();
                self.push(Value::Object(bound));
                None
            }
            _ => {
                let name = object::str_contents(name).to_string();
                Some(self.runtime_error(reporter, RuntimeError::UndefinedProperty { name }))
            }
        }
    }

    fn op_super_invoke(
        &mut self,
        reporter: &mut dyn Reporter,
        name: *mut Obj,
        arg_count: u8,
    ) -> Option<InterpretResult> {
        let superclass = self.pop().as_object().unwrap();
        let method = unsafe { (*superclass).data_class().methods.get(name).copied() };
        let result = match method {
            Some(Value::Object(closure)) => self.call_closure(closure, arg_count),
            _ => {
                let name = object::str_contents(name).to_string();
                Err(RuntimeError::UndefinedProperty { name })
            }
        };
        result.err().map(|err| self.runtime_error(reporter, err))
    }

    fn op_closure(&mut self, function: *mut Obj) {
        let upvalue_count = unsafe { (*function).data_function().upvalue_count };
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            if is_local {
                let base = self.frames.last().unwrap().base;
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                let closure = self.frames.last().unwrap().closure;
                upvalues.push(unsafe { (*closure).data_closure().upvalues[index] });
            }
        }
        let closure = self.heap.alloc_closure(function, upvalues);
        self.check_gc();
        self.push(Value::Object(closure));
    }

    fn op_class(&mut self, name: *mut Obj) {
        let class = self.heap.alloc_class(name);
        self.check_gc();
        self.push(Value::Object(class));
    }

    fn op_method(&mut self, reporter: &mut dyn Reporter, name: *mut Obj) -> Option<InterpretResult> {
        let method = self.peek(0);
        let class = self.peek(1).as_object().unwrap();
        if unsafe { (*class).data_class().methods.get(name).is_some() } {
            let name = object::str_contents(name).to_string();
            return Some(self.runtime_error(reporter, RuntimeError::DuplicateMethod { name }));
        }
        unsafe { (*class).data_class_mut().methods.set(name, method) };
        self.pop();
        None
    }

    fn binary_number(
        &mut self,
        reporter: &mut dyn Reporter,
        op: fn(f64, f64) -> Value,
    ) -> Option<InterpretResult> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b));
                None
            }
            _ => Some(self.runtime_error(reporter, RuntimeError::NotANumber)),
        }
    }

    fn add(&mut self, reporter: &mut dyn Reporter) -> Option<InterpretResult> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                None
            }
            (Value::Object(a), Value::Object(b))
                if object::type_name(a) == "string" && object::type_name(b) == "string" =>
            {
                let concatenated = format!(
                    "{}{}",
                    object::str_contents(a),
                    object::str_contents(b)
                );
                let interned = self.heap.intern(&concatenated);
                self.pop();
                self.pop();
                self.push(Value::Object(interned));
                self.check_gc();
                None
            }
            _ => Some(self.runtime_error(reporter, RuntimeError::BadAddOperands)),
        }
    }

    fn read_upvalue(&self, upvalue: *mut Obj) -> Value {
        match unsafe { &(*upvalue).data } {
            ObjData::Upvalue(up) => match up.state {
                UpvalueState::Open(slot) => self.stack[slot],
                UpvalueState::Closed(value) => value,
            },
            _ => panic!("not an upvalue object"),
        }
    }

    fn write_upvalue(&mut self, upvalue: *mut Obj, value: Value) {
        match unsafe { &mut (*upvalue).data } {
            ObjData::Upvalue(up) => match up.state {
                UpvalueState::Open(slot) => self.stack[slot] = value,
                UpvalueState::Closed(_) => up.state = UpvalueState::Closed(value),
            },
            _ => panic!("not an upvalue object"),
        }
    }

    /// Open upvalues are kept sorted by descending stack slot so closing a
    /// range (on scope exit or return) only ever has to look at the front.
    fn capture_upvalue(&mut self, slot: usize) -> *mut Obj {
        if let Some(&existing) = self
            .open_upvalues
            .iter()
            .find(|&&u| Self::upvalue_slot(u) == Some(slot))
        {
            return existing;
        }
        let upvalue = self.heap.alloc_open_upvalue(slot);
        let position = self
            .open_upvalues
            .iter()
            .position(|&u| Self::upvalue_slot(u).is_some_and(|s| s < slot))
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(position, upvalue);
        upvalue
    }

    fn upvalue_slot(upvalue: *mut Obj) -> Option<usize> {
        match unsafe { &(*upvalue).data } {
            ObjData::Upvalue(up) => match up.state {
                UpvalueState::Open(slot) => Some(slot),
                UpvalueState::Closed(_) => None,
            },
            _ => None,
        }
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        loop {
            let Some(&first) = self.open_upvalues.first() else {
                break;
            };
            let slot = match Self::upvalue_slot(first) {
                Some(slot) => slot,
                None => break,
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            if let ObjData::Upvalue(up) = unsafe { &mut (*first).data } {
                up.state = UpvalueState::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    fn bind_method(&mut self, instance: *mut Obj, name: *mut Obj) -> Result<(), RuntimeError> {
        let class = unsafe { (*instance).data_instance().class };
        let method = unsafe { (*class).data_class().methods.get(name).copied() };
        match method {
            Some(Value::Object(closure)) => {
                let receiver = self.pop();
                let bound = self.heap.alloc_bound_method(receiver, closure);
                self.check_gc();
                self.push(Value::Object(bound));
                Ok(())
            }
            _ => Err(RuntimeError::UndefinedProperty {
                name: object::str_contents(name).to_string(),
            }),
        }
    }

    fn invoke(&mut self, name: *mut Obj, arg_count: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count as usize);
        let instance = match receiver.as_object() {
            Some(obj) if object::type_name(obj) == "instance" => obj,
            _ => return Err(RuntimeError::NotAnInstance),
        };
        // A field shadows a method of the same name, same as a plain get+call.
        let field = unsafe { (*instance).data_instance().fields.get(name).copied() };
        if let Some(value) = field {
            let base = self.stack.len() - arg_count as usize - 1;
            self.stack[base] = value;
            return self.call_value(value, arg_count);
        }
        let class = unsafe { (*instance).data_instance().class };
        let method = unsafe { (*class).data_class().methods.get(name).copied() };
        match method {
            Some(Value::Object(closure)) => self.call_closure(closure, arg_count),
            _ => Err(RuntimeError::UndefinedProperty {
                name: object::str_contents(name).to_string(),
            }),
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        let obj = match callee.as_object() {
            Some(obj) => obj,
            None => return Err(RuntimeError::NotCallable),
        };
        match unsafe { (*obj).kind } {
            ObjKind::Closure => self.call_closure(obj, arg_count),
            ObjKind::Native => self.call_native(obj, arg_count),
            ObjKind::Class => self.call_class(obj, arg_count),
            ObjKind::BoundMethod => self.call_bound_method(obj, arg_count),
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn call_closure(&mut self, closure: *mut Obj, arg_count: u8) -> Result<(), RuntimeError> {
        let function = unsafe { (*closure).data_closure().function };
        let arity = unsafe { (*function).data_function().arity };
        if arg_count != arity {
            return Err(RuntimeError::ArityMismatch {
                expected: arity,
                got: arg_count,
            });
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(RuntimeError::StackOverflow);
        }
        let base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base,
        });
        Ok(())
    }

    fn call_native(&mut self, native: *mut Obj, arg_count: u8) -> Result<(), RuntimeError> {
        let function = match unsafe { &(*native).data } {
            ObjData::Native(n) => n.function,
            _ => unreachable!(),
        };
        let start = self.stack.len() - arg_count as usize;
        let args: Vec<Value> = self.stack[start..].to_vec();
        match function(&args) {
            Ok(result) => {
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(RuntimeError::Native(message)),
        }
    }

    fn call_class(&mut self, class: *mut Obj, arg_count: u8) -> Result<(), RuntimeError> {
        let instance = self.heap.alloc_instance(class);
        self.check_gc();
        let base = self.stack.len() - arg_count as usize - 1;
        self.stack[base] = Value::Object(instance);
        let init = unsafe { (*class).data_class().methods.get(self.init_string).copied() };
        match init {
            Some(Value::Object(closure)) => self.call_closure(closure, arg_count),
            Some(_) => unreachable!("method table entry is not a closure"),
            None if arg_count == 0 => Ok(()),
            None => Err(RuntimeError::ArityMismatch {
                expected: 0,
                got: arg_count,
            }),
        }
    }

    fn call_bound_method(&mut self, bound: *mut Obj, arg_count: u8) -> Result<(), RuntimeError> {
        let (receiver, method) = match unsafe { &(*bound).data } {
            ObjData::BoundMethod(b) => (b.receiver, b.method),
            _ => unreachable!(),
        };
        let base = self.stack.len() - arg_count as usize - 1;
        self.stack[base] = receiver;
        self.call_closure(method, arg_count)
    }

    fn check_gc(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        log::trace!(
            "gc start: {} bytes allocated",
            self.heap.bytes_allocated()
        );
        self.mark_roots();
        self.heap.trace_references();
        self.heap.sweep_strings();
        self.heap.sweep();
        self.heap.adjust_next_gc();
        log::trace!("gc end: {} bytes allocated", self.heap.bytes_allocated());
    }

    fn mark_roots(&mut self) {
        let stack_values = self.stack.clone();
        for value in &stack_values {
            self.heap.mark_value(value);
        }
        let frame_closures: Vec<*mut Obj> = self.frames.iter().map(|f| f.closure).collect();
        for closure in frame_closures {
            self.heap.mark_object(closure);
        }
        let open_upvalues = self.open_upvalues.clone();
        for upvalue in open_upvalues {
            self.heap.mark_object(upvalue);
        }
        let globals: Vec<(*mut Obj, Value)> =
            self.globals.iter().map(|(k, v)| (k, *v)).collect();
        for (key, value) in globals {
            self.heap.mark_object(key);
            self.heap.mark_value(&value);
        }
        self.heap.mark_object(self.init_string);
    }

    #[cfg(feature = "debug-execution")]
    fn trace(&self) {
        let stack: String = self.stack.iter().map(|v| format!("[ {v} ]")).collect();
        log::debug!("{stack}");
    }

    fn runtime_error(&mut self, reporter: &mut dyn Reporter, err: RuntimeError) -> InterpretResult {
        let mut message = err.to_string();
        for frame in self.frames.iter().rev() {
            let function = unsafe { closure_function(frame.closure) };
            let chunk = unsafe { function_chunk(function) };
            let line = chunk.get_line(frame.ip.saturating_sub(1));
            let name = match unsafe { (*function).data_function().name } {
                Some(name) => format!("{}()", object::str_contents(name)),
                None => "script".to_string(),
            };
            message.push_str(&format!("\n[line {line}] in {name}"));
        }
        reporter.report(Report::new(Phase::Runtime, message));
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        InterpretResult::RuntimeError
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingReporter {
        messages: Vec<String>,
    }

    impl Reporter for RecordingReporter {
        fn report(&mut self, report: Report) {
            self.messages.push(report.message);
        }
    }

    #[test]
    fn natives_are_registered_at_startup() {
        let vm = Vm::new();
        assert!(vm
            .globals
            .iter()
            .any(|(k, _)| object::str_contents(k) == "clock"));
        assert!(vm
            .globals
            .iter()
            .any(|(k, _)| object::str_contents(k) == "hasattr"));
    }

    #[test]
    fn syntax_error_reports_compile_error_without_running() {
        let mut vm = Vm::new();
        let mut reporter = RecordingReporter { messages: Vec::new() };
        let result = vm.interpret("1 +;", false, &mut reporter);
        assert!(matches!(result, InterpretResult::CompileError));
        assert!(!reporter.messages.is_empty());
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let mut vm = Vm::new();
        let mut reporter = RecordingReporter { messages: Vec::new() };
        let result = vm.interpret("print nope;", false, &mut reporter);
        assert!(matches!(result, InterpretResult::RuntimeError));
        assert!(reporter.messages[0].contains("Undefined variable"));
    }

    #[test]
    fn arithmetic_executes_without_error() {
        let mut vm = Vm::new();
        let mut reporter = RecordingReporter { messages: Vec::new() };
        let result = vm.interpret("print 1 + 2 * 3;", false, &mut reporter);
        assert!(matches!(result, InterpretResult::Ok));
        assert!(reporter.messages.is_empty());
    }
}
