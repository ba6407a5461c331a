//! Call frames, the dispatch loop, and call/invoke/bind machinery.

use std::io::Write;

use crate::diagnostics::{Error, RuntimeError, RuntimeErrorKind};
use crate::values::{
    NativeFn, Obj, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance,
    ObjKind, ObjNative, ObjString, ObjUpvalue, Value, fnv1a_hash,
};
use crate::vm::chunk::OpCode;
use crate::vm::gc::{DEFAULT_GC_HEAP_GROW_FACTOR, Heap};
use crate::vm::stack::Stack;
use crate::vm::table::Table;

/// Runtime-tunable limits and behaviour, standing in for the source's
/// hard-coded constants (64 frames, 64·256 stack slots, grow factor 2).
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Force a collection on every allocation. Required to pass the
    /// GC-soundness property in §8: output must be identical with and
    /// without this on.
    pub stress_gc: bool,
    pub gc_heap_grow_factor: f64,
    pub max_call_frames: usize,
    pub max_stack_size: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            stress_gc: cfg!(feature = "stress_gc"),
            gc_heap_grow_factor: DEFAULT_GC_HEAP_GROW_FACTOR,
            max_call_frames: 64,
            max_stack_size: 64 * 256,
        }
    }
}

pub type InterpretResult = Result<(), Error>;

pub(crate) struct CallFrame {
    pub closure: *mut ObjClosure,
    pub ip: usize,
    /// Index into the VM stack where this frame's slot 0 lives (the
    /// callee itself occupies that slot).
    pub slots_base: usize,
}

pub struct Vm {
    pub(crate) stack: Stack<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) heap: Heap,
    pub(crate) globals: Table,
    pub(crate) global_constants: Table,
    pub(crate) open_upvalues: *mut ObjUpvalue,
    pub(crate) init_string: *mut ObjString,
    pub(crate) compiling_functions: Vec<*mut ObjFunction>,
    pub(crate) options: VmOptions,
    stdout: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Vm {
        let mut vm = Vm {
            stack: Stack::new(options.max_stack_size),
            frames: Vec::with_capacity(options.max_call_frames),
            heap: Heap::new(),
            globals: Table::new(),
            global_constants: Table::new(),
            open_upvalues: std::ptr::null_mut(),
            init_string: std::ptr::null_mut(),
            compiling_functions: Vec::new(),
            options,
            stdout: Box::new(std::io::stdout()),
        };
        vm.init_string = vm
            .intern_owned_string("init".to_string())
            .expect("an empty stack always has room to root one string");
        crate::vm::natives::define_natives(&mut vm);
        vm
    }

    /// Redirect `print` output. Meant for tests that need to assert
    /// on what a program printed.
    pub fn set_stdout(&mut self, writer: Box<dyn Write>) {
        self.stdout = writer;
    }

    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = crate::compiler::compile(self, source).map_err(Error::Compile)?;

        // Root the bare function before allocating its closure.
        self.stack
            .push(Value::obj(function as *mut Obj))
            .expect("stack is empty at the start of a fresh interpret() call");
        let closure = self.alloc_object(ObjClosure::new(function));
        self.stack.pop();
        self.stack
            .push(Value::obj(closure as *mut Obj))
            .expect("stack is empty at the start of a fresh interpret() call");

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots_base: self.stack.len() - 1,
        });

        self.run().map_err(Error::Runtime)
    }

    /// Register a native function, e.g. `clock`/`assert`.
    ///
    /// Both the interned name and the freshly allocated native object
    /// are rooted on the stack before the globals table (which may
    /// itself allocate, growing its backing storage) sees either.
    pub fn define_native(&mut self, name: &str, arity: u8, f: NativeFn) {
        let name_ptr = self
            .intern_owned_string(name.to_string())
            .expect("native registration runs with a near-empty stack");
        self.stack
            .push(Value::obj(name_ptr as *mut Obj))
            .expect("native registration runs with a near-empty stack");
        let native_ptr = self.alloc_object(ObjNative {
            obj: crate::values::Obj::new(ObjKind::Native),
            name: name_ptr,
            arity,
            function: f,
        });
        self.stack
            .push(Value::obj(native_ptr as *mut Obj))
            .expect("native registration runs with a near-empty stack");
        self.globals.set(name_ptr, Value::obj(native_ptr as *mut Obj));
        self.stack.pop();
        self.stack.pop();
    }

    /// Allocate (or reuse, if already interned) a string and hand
    /// back a [`Value`] — the entry point native functions use to
    /// build string results.
    pub fn new_string(&mut self, s: &str) -> Value {
        Value::obj(
            self.intern_owned_string(s.to_string())
                .expect("caller has room on the stack for one rooted string") as *mut Obj,
        )
    }

    /// Allocate a fresh array and hand back a [`Value`].
    pub fn new_array(&mut self, items: Vec<Value>) -> Value {
        let ptr = self.alloc_object(ObjArray {
            obj: crate::values::Obj::new(ObjKind::Array),
            items,
        });
        Value::obj(ptr as *mut Obj)
    }

    /// Intern `s`, rooting the freshly allocated string on the value
    /// stack for the duration of the intern-table insert. Fails with
    /// [`RuntimeErrorKind::StackOverflow`] if the stack has no room
    /// left for that rooting push — callers reached from the
    /// execution loop must propagate this; callers that only run
    /// before the stack holds any user values may `expect` it.
    pub(crate) fn intern_owned_string(&mut self, s: String) -> Result<*mut ObjString, RuntimeErrorKind> {
        let hash = fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.heap.strings.find_string(&s, hash) {
            return Ok(existing);
        }
        let ptr = self.alloc_object(ObjString::new(s.into_boxed_str(), hash));
        self.stack
            .push(Value::obj(ptr as *mut Obj))
            .map_err(|_| RuntimeErrorKind::StackOverflow)?;
        self.heap.strings.set(ptr, Value::nil());
        self.stack.pop();
        Ok(ptr)
    }

    pub(crate) fn alloc_function(&mut self) -> *mut ObjFunction {
        self.alloc_object(ObjFunction::new())
    }

    pub(crate) fn push_compiling_function(&mut self, f: *mut ObjFunction) {
        self.compiling_functions.push(f);
    }

    pub(crate) fn pop_compiling_function(&mut self) {
        self.compiling_functions.pop();
    }

    pub(crate) fn stack_push(&mut self, v: Value) {
        self.stack
            .push(v)
            .expect("compiler constant rooting runs with an empty stack");
    }

    pub(crate) fn stack_pop(&mut self) -> Value {
        self.stack.pop()
    }

    /// Push during execution, turning a full stack into the same
    /// `StackOverflow` a call-frame-count overflow reports, instead of
    /// aborting the process.
    fn try_push(&mut self, v: Value) -> Result<(), RuntimeErrorKind> {
        self.stack.push(v).map_err(|_| RuntimeErrorKind::StackOverflow)
    }

    pub(crate) fn global_constants_mut(&mut self) -> &mut Table {
        &mut self.global_constants
    }

    fn reset_stack(&mut self) {
        self.stack.truncate(0);
        self.frames.clear();
        self.open_upvalues = std::ptr::null_mut();
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.current_frame_mut();
        let function = unsafe { &*(*frame.closure).function };
        let byte = function.chunk.read_u8(frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        let frame = self.frames.last().unwrap();
        let function = unsafe { &*(*frame.closure).function };
        function.chunk.constants[idx]
    }

    fn read_string(&mut self) -> *mut ObjString {
        self.read_constant().as_string()
    }

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().unwrap();
        let function = unsafe { &*(*frame.closure).function };
        let ip = frame.ip.saturating_sub(1);
        function.chunk.lines.get(ip).copied().unwrap_or(0)
    }

    /// `[line N] in <name>()` / `…in script`, innermost frame first.
    fn build_trace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let function = unsafe { &*(*frame.closure).function };
                let line = function
                    .chunk
                    .lines
                    .get(frame.ip.saturating_sub(1))
                    .copied()
                    .unwrap_or(0);
                match function.name {
                    Some(_) => format!("[line {line}] in {}()", function.name_str()),
                    None => format!("[line {line}] in script"),
                }
            })
            .collect()
    }

    fn runtime_error(&mut self, kind: RuntimeErrorKind) -> RuntimeError {
        let line = self.current_line();
        let trace = self.build_trace();
        self.reset_stack();
        RuntimeError { kind, line, trace }
    }

    fn capture_upvalue(&mut self, local: *mut Value) -> *mut ObjUpvalue {
        let mut prev: *mut ObjUpvalue = std::ptr::null_mut();
        let mut upvalue = self.open_upvalues;
        while !upvalue.is_null() && (unsafe { (*upvalue).location }) as usize > local as usize {
            prev = upvalue;
            upvalue = unsafe { (*upvalue).next };
        }
        if !upvalue.is_null() && unsafe { (*upvalue).location } == local {
            return upvalue;
        }
        let created = self.alloc_object(ObjUpvalue::new(local));
        unsafe {
            (*created).next = upvalue;
        }
        if prev.is_null() {
            self.open_upvalues = created;
        } else {
            unsafe {
                (*prev).next = created;
            }
        }
        created
    }

    /// Close every open upvalue whose `location >= last`.
    fn close_upvalues(&mut self, last: *mut Value) {
        while !self.open_upvalues.is_null()
            && (unsafe { (*self.open_upvalues).location }) as usize >= last as usize
        {
            let upvalue = self.open_upvalues;
            unsafe {
                (*upvalue).close();
                self.open_upvalues = (*upvalue).next;
            }
        }
    }

    /// Concatenate the top two stack values (both strings) in place.
    /// The operands stay on the stack (hence still rooted) until the
    /// new string has been fully built and interned.
    fn concatenate(&mut self) -> Result<(), RuntimeErrorKind> {
        let b = *self.stack.peek(0);
        let a = *self.stack.peek(1);
        let (a_str, b_str) = unsafe { ((*a.as_string()).as_str(), (*b.as_string()).as_str()) };
        let mut combined = String::with_capacity(a_str.len() + b_str.len());
        combined.push_str(a_str);
        combined.push_str(b_str);
        let result = self.intern_owned_string(combined)?;
        self.stack.pop();
        self.stack.pop();
        self.try_push(Value::obj(result as *mut Obj))
    }

    fn numeric_binop(
        &mut self,
        op: impl Fn(f64, f64) -> f64,
    ) -> Result<(), RuntimeErrorKind> {
        let b = *self.stack.peek(0);
        let a = *self.stack.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(RuntimeErrorKind::OperandsMustBeNumbers);
        }
        self.stack.pop();
        self.stack.pop();
        self.try_push(Value::number(op(a.as_number(), b.as_number())))
    }

    fn numeric_compare(
        &mut self,
        cmp: impl Fn(f64, f64) -> bool,
    ) -> Result<(), RuntimeErrorKind> {
        let b = *self.stack.peek(0);
        let a = *self.stack.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(RuntimeErrorKind::OperandsMustBeNumbers);
        }
        self.stack.pop();
        self.stack.pop();
        self.try_push(Value::bool(cmp(a.as_number(), b.as_number())))
    }

    fn call(&mut self, closure: *mut ObjClosure, argc: u8) -> Result<(), RuntimeErrorKind> {
        let function = unsafe { (*closure).function };
        let arity = unsafe { (*function).arity };
        if argc != arity {
            return Err(RuntimeErrorKind::ArityMismatch {
                expected: arity,
                got: argc,
            });
        }
        if self.frames.len() >= self.options.max_call_frames {
            return Err(RuntimeErrorKind::StackOverflow);
        }
        let slots_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots_base,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeErrorKind> {
        if !callee.is_obj() {
            return Err(RuntimeErrorKind::NotCallable);
        }
        match unsafe { (*callee.as_obj()).kind } {
            ObjKind::Closure => self.call(callee.as_obj() as *mut ObjClosure, argc),
            ObjKind::Class => {
                let class = callee.as_obj() as *mut ObjClass;
                let base = self.stack.len() - 1 - argc as usize;
                let instance_ptr = self.alloc_object(ObjInstance::new(class));
                self.stack.set(base, Value::obj(instance_ptr as *mut Obj));
                let init = unsafe { (*class).methods.get(self.init_string) };
                match init {
                    Some(init_val) => self.call(init_val.as_obj() as *mut ObjClosure, argc),
                    None if argc == 0 => Ok(()),
                    None => Err(RuntimeErrorKind::ArityMismatch {
                        expected: 0,
                        got: argc,
                    }),
                }
            }
            ObjKind::BoundMethod => {
                let bound = callee.as_obj() as *mut ObjBoundMethod;
                let base = self.stack.len() - 1 - argc as usize;
                self.stack.set(base, unsafe { (*bound).receiver });
                self.call(unsafe { (*bound).method }, argc)
            }
            ObjKind::Native => {
                let native = callee.as_obj() as *mut ObjNative;
                let arity = unsafe { (*native).arity };
                if arity != argc {
                    return Err(RuntimeErrorKind::ArityMismatch {
                        expected: arity,
                        got: argc,
                    });
                }
                let base = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack.as_slice()[base..].to_vec();
                let result = unsafe { ((*native).function)(self, &args) };
                self.stack.truncate(base - 1);
                match result {
                    Ok(v) => self.try_push(v),
                    Err(msg) => Err(RuntimeErrorKind::Native(msg)),
                }
            }
            _ => Err(RuntimeErrorKind::NotCallable),
        }
    }

    /// Fused `GET_PROPERTY ; CALL argc` that skips allocating a bound
    /// method in the common `instance.method()` path. Arrays and
    /// strings have no `ObjClass`/method table of their own, so calls
    /// on them are dispatched straight to the built-in per-type method
    /// tables in `natives` instead.
    fn invoke(&mut self, name: *mut ObjString, argc: u8) -> Result<(), RuntimeErrorKind> {
        let receiver = *self.stack.peek(argc as usize);
        match receiver.obj_kind() {
            Some(ObjKind::Instance) => {
                let instance = receiver.as_obj() as *mut ObjInstance;
                if let Some(value) = unsafe { (*instance).fields.get(name) } {
                    let idx = self.stack.len() - 1 - argc as usize;
                    self.stack.set(idx, value);
                    return self.call_value(value, argc);
                }
                let class = unsafe { (*instance).class };
                self.invoke_from_class(class, name, argc)
            }
            Some(ObjKind::Array) => self.invoke_builtin_method(receiver, name, argc, crate::vm::natives::array_method),
            Some(ObjKind::String) => self.invoke_builtin_method(receiver, name, argc, crate::vm::natives::string_method),
            _ => Err(RuntimeErrorKind::NotAnInstance),
        }
    }

    fn invoke_builtin_method(
        &mut self,
        receiver: Value,
        name: *mut ObjString,
        argc: u8,
        dispatch: fn(&mut Vm, Value, &str, &[Value]) -> Option<crate::values::NativeResult>,
    ) -> Result<(), RuntimeErrorKind> {
        let method_name = unsafe { (*name).as_str() };
        let base = self.stack.len() - argc as usize;
        let args: Vec<Value> = self.stack.as_slice()[base..].to_vec();
        let result = dispatch(self, receiver, method_name, &args)
            .ok_or_else(|| RuntimeErrorKind::UndefinedProperty(method_name.to_string()))?;
        self.stack.truncate(base - 1);
        match result {
            Ok(v) => self.try_push(v),
            Err(msg) => Err(RuntimeErrorKind::Native(msg)),
        }
    }

    fn invoke_from_class(
        &mut self,
        class: *mut ObjClass,
        name: *mut ObjString,
        argc: u8,
    ) -> Result<(), RuntimeErrorKind> {
        let method = unsafe { (*class).methods.get(name) }
            .ok_or_else(|| RuntimeErrorKind::UndefinedProperty(unsafe { (*name).as_str().to_string() }))?;
        self.call(method.as_obj() as *mut ObjClosure, argc)
    }

    fn bind_method(
        &mut self,
        class: *mut ObjClass,
        name: *mut ObjString,
    ) -> Result<(), RuntimeErrorKind> {
        let method = unsafe { (*class).methods.get(name) }
            .ok_or_else(|| RuntimeErrorKind::UndefinedProperty(unsafe { (*name).as_str().to_string() }))?;
        let receiver = *self.stack.peek(0);
        let bound_ptr = self.alloc_object(ObjBoundMethod::new(receiver, method.as_obj() as *mut ObjClosure));
        self.stack.pop();
        self.try_push(Value::obj(bound_ptr as *mut Obj))
    }

    /// Push from inside the dispatch loop, reporting a full stack as a
    /// `RuntimeError` ready for `?` to propagate out of `run`.
    fn push_or_err(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.stack.push(v).is_err() {
            return Err(self.runtime_error(RuntimeErrorKind::StackOverflow));
        }
        Ok(())
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let op = OpCode::from_u8(self.read_byte());
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push_or_err(v)?;
                }
                OpCode::Nil => self.push_or_err(Value::nil())?,
                OpCode::True => self.push_or_err(Value::bool(true))?,
                OpCode::False => self.push_or_err(Value::bool(false))?,
                OpCode::Pop => {
                    self.stack.pop();
                }
                OpCode::Dup => {
                    let v = *self.stack.peek(0);
                    self.push_or_err(v)?;
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame_mut().slots_base;
                    let v = *self.stack.get(base + slot);
                    self.push_or_err(v)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame_mut().slots_base;
                    let v = *self.stack.peek(0);
                    self.stack.set(base + slot, v);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(v) => self.push_or_err(v)?,
                        None => {
                            let n = unsafe { (*name).as_str().to_string() };
                            return Err(self.runtime_error(RuntimeErrorKind::UndefinedGlobal(n)));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let v = *self.stack.peek(0);
                    self.globals.set(name, v);
                    self.stack.pop();
                }
                OpCode::DefineGlobalConst => {
                    let name = self.read_string();
                    let v = *self.stack.peek(0);
                    self.globals.set(name, v);
                    self.global_constants.set(name, Value::nil());
                    self.stack.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let v = *self.stack.peek(0);
                    if self.globals.set(name, v) {
                        // set() reports this as a brand new key: there was
                        // nothing to assign to.
                        self.globals.delete(name);
                        let n = unsafe { (*name).as_str().to_string() };
                        return Err(self.runtime_error(RuntimeErrorKind::UndefinedGlobal(n)));
                    }
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let closure = self.current_frame_mut().closure;
                    let upvalue = unsafe { (*closure).upvalues[idx] };
                    let v = unsafe { *(*upvalue).location };
                    self.push_or_err(v)?;
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let closure = self.current_frame_mut().closure;
                    let upvalue = unsafe { (*closure).upvalues[idx] };
                    let v = *self.stack.peek(0);
                    unsafe {
                        *(*upvalue).location = v;
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = *self.stack.peek(0);
                    if !receiver.is_obj_kind(ObjKind::Instance) {
                        return Err(self.runtime_error(RuntimeErrorKind::NotAnInstance));
                    }
                    let instance = receiver.as_obj() as *mut ObjInstance;
                    if let Some(value) = unsafe { (*instance).fields.get(name) } {
                        self.stack.pop();
                        self.push_or_err(value)?;
                    } else {
                        let class = unsafe { (*instance).class };
                        if let Err(e) = self.bind_method(class, name) {
                            return Err(self.runtime_error(e));
                        }
                    }
                }
                OpCode::GetPropertyNoPop => {
                    // Used to read a property for a compound-assignment
                    // target (`obj.field += 1`): the receiver must still be
                    // on the stack underneath the read value for the
                    // following SET_PROPERTY.
                    let name = self.read_string();
                    let receiver = *self.stack.peek(0);
                    if !receiver.is_obj_kind(ObjKind::Instance) {
                        return Err(self.runtime_error(RuntimeErrorKind::NotAnInstance));
                    }
                    let instance = receiver.as_obj() as *mut ObjInstance;
                    if let Some(value) = unsafe { (*instance).fields.get(name) } {
                        self.push_or_err(value)?;
                    } else {
                        let class = unsafe { (*instance).class };
                        if let Err(e) = self.bind_method(class, name) {
                            return Err(self.runtime_error(e));
                        }
                        // bind_method replaced the receiver with the bound
                        // method; push the receiver back underneath it so
                        // the stack stays balanced for the caller's SET_PROPERTY.
                        let bound = self.stack.pop();
                        self.push_or_err(receiver)?;
                        self.push_or_err(bound)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let receiver = *self.stack.peek(1);
                    if !receiver.is_obj_kind(ObjKind::Instance) {
                        return Err(self.runtime_error(RuntimeErrorKind::NotAnInstance));
                    }
                    let instance = receiver.as_obj() as *mut ObjInstance;
                    let value = *self.stack.peek(0);
                    unsafe {
                        (*instance).fields.set(name, value);
                    }
                    self.stack.pop();
                    self.stack.pop();
                    self.push_or_err(value)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass_val = self.stack.pop();
                    let class = superclass_val.as_obj() as *mut ObjClass;
                    if let Err(e) = self.bind_method(class, name) {
                        return Err(self.runtime_error(e));
                    }
                }
                OpCode::Equal => {
                    let b = self.stack.pop();
                    let a = self.stack.pop();
                    self.push_or_err(Value::bool(Value::values_equal(a, b)))?;
                }
                OpCode::Greater => {
                    if let Err(e) = self.numeric_compare(|a, b| a > b) {
                        return Err(self.runtime_error(e));
                    }
                }
                OpCode::Less => {
                    if let Err(e) = self.numeric_compare(|a, b| a < b) {
                        return Err(self.runtime_error(e));
                    }
                }
                OpCode::Add => {
                    let b = *self.stack.peek(0);
                    let a = *self.stack.peek(1);
                    if a.is_obj_kind(ObjKind::String) && b.is_obj_kind(ObjKind::String) {
                        if let Err(e) = self.concatenate() {
                            return Err(self.runtime_error(e));
                        }
                    } else if a.is_number() && b.is_number() {
                        self.stack.pop();
                        self.stack.pop();
                        self.push_or_err(Value::number(a.as_number() + b.as_number()))?;
                    } else {
                        return Err(self.runtime_error(RuntimeErrorKind::AddOperandMismatch));
                    }
                }
                OpCode::Subtract => {
                    if let Err(e) = self.numeric_binop(|a, b| a - b) {
                        return Err(self.runtime_error(e));
                    }
                }
                OpCode::Multiply => {
                    if let Err(e) = self.numeric_binop(|a, b| a * b) {
                        return Err(self.runtime_error(e));
                    }
                }
                OpCode::Divide => {
                    if let Err(e) = self.numeric_binop(|a, b| a / b) {
                        return Err(self.runtime_error(e));
                    }
                }
                OpCode::Not => {
                    let v = self.stack.pop();
                    self.push_or_err(Value::bool(v.is_falsey()))?;
                }
                OpCode::Negate => {
                    let v = *self.stack.peek(0);
                    if !v.is_number() {
                        return Err(self.runtime_error(RuntimeErrorKind::OperandMustBeNumber));
                    }
                    self.stack.pop();
                    self.push_or_err(Value::number(-v.as_number()))?;
                }
                OpCode::Print => {
                    let v = self.stack.pop();
                    let _ = writeln!(self.stdout, "{v}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.stack.peek(0).is_falsey() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = *self.stack.peek(argc as usize);
                    if let Err(e) = self.call_value(callee, argc) {
                        return Err(self.runtime_error(e));
                    }
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    if let Err(e) = self.invoke(name, argc) {
                        return Err(self.runtime_error(e));
                    }
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let superclass_val = self.stack.pop();
                    let class = superclass_val.as_obj() as *mut ObjClass;
                    if let Err(e) = self.invoke_from_class(class, name, argc) {
                        return Err(self.runtime_error(e));
                    }
                }
                OpCode::Closure => {
                    let function_val = self.read_constant();
                    let function = function_val.as_obj() as *mut ObjFunction;
                    let upvalue_count = unsafe { (*function).upvalue_count } as usize;
                    let mut closure = ObjClosure::new(function);
                    for slot in closure.upvalues.iter_mut().take(upvalue_count) {
                        let is_local = self.read_byte();
                        let index = self.read_byte() as usize;
                        *slot = if is_local != 0 {
                            let base = self.current_frame_mut().slots_base;
                            let ptr = self.stack.slot_ptr(base + index);
                            self.capture_upvalue(ptr)
                        } else {
                            let enclosing = self.current_frame_mut().closure;
                            unsafe { (*enclosing).upvalues[index] }
                        };
                    }
                    let ptr = self.alloc_object(closure);
                    self.push_or_err(Value::obj(ptr as *mut Obj))?;
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    let ptr = self.stack.slot_ptr(top);
                    self.close_upvalues(ptr);
                    self.stack.pop();
                }
                OpCode::Return => {
                    let result = self.stack.pop();
                    let frame = self.frames.pop().expect("return with no active frame");
                    let base_ptr = self.stack.slot_ptr(frame.slots_base);
                    self.close_upvalues(base_ptr);
                    self.stack.truncate(frame.slots_base);
                    self.push_or_err(result)?;

                    if self.frames.is_empty() {
                        self.stack.pop();
                        return Ok(());
                    }
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let ptr = self.alloc_object(ObjClass::new(name));
                    self.push_or_err(Value::obj(ptr as *mut Obj))?;
                }
                OpCode::Inherit => {
                    let superclass_val = *self.stack.peek(1);
                    if !superclass_val.is_obj_kind(ObjKind::Class) {
                        return Err(self.runtime_error(RuntimeErrorKind::SuperclassMustBeClass));
                    }
                    let superclass = superclass_val.as_obj() as *mut ObjClass;
                    let subclass_val = *self.stack.peek(0);
                    let subclass = subclass_val.as_obj() as *mut ObjClass;
                    unsafe {
                        (*subclass).methods.add_all_from(&(*superclass).methods);
                    }
                    self.stack.pop(); // subclass; superclass stays bound as `super`
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method_val = *self.stack.peek(0);
                    let class_val = *self.stack.peek(1);
                    let class = class_val.as_obj() as *mut ObjClass;
                    unsafe {
                        (*class).methods.set(name, method_val);
                    }
                    self.stack.pop();
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.free_all_objects();
    }
}
