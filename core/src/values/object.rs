//! Heap object model.
//!
//! Every heap allocation starts with the common header [`Obj`]
//! (`kind`, `is_marked`, `next`), so the GC can walk the all-objects
//! list and trace/free any object without knowing its concrete type
//! up front. Concrete object structs are `#[repr(C)]` with `obj: Obj`
//! as their first field, so a `*mut ObjString` (etc.) and the `*mut
//! Obj` it was allocated behind are the same address and may be cast
//! between each other.
//!
//! Objects are owned by the VM's heap (see [`crate::vm::gc`]) via
//! `Box::into_raw`; nothing outside the heap ever calls `Box::from_raw`
//! except `free_object` during sweep.

use crate::vm::{Chunk, Table};
use crate::values::Value;
use std::fmt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Array,
    Function,
    Native,
    Upvalue,
    Closure,
    Class,
    Instance,
    BoundMethod,
}

/// Common header every heap object carries.
#[repr(C)]
pub struct Obj {
    pub kind: ObjKind,
    pub is_marked: bool,
    pub next: *mut Obj,
}

impl Obj {
    pub fn new(kind: ObjKind) -> Obj {
        Obj {
            kind,
            is_marked: false,
            next: std::ptr::null_mut(),
        }
    }
}

/// An immutable, interned, FNV-1a hashed byte string.
#[repr(C)]
pub struct ObjString {
    pub obj: Obj,
    pub hash: u32,
    chars: Box<str>,
}

impl ObjString {
    pub fn new(chars: Box<str>, hash: u32) -> ObjString {
        ObjString {
            obj: Obj::new(ObjKind::String),
            hash,
            chars,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.chars
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

/// FNV-1a, the exact constants the source VM uses for string hashing.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A mutable, ordered sequence of values with amortised-O(1) append.
#[repr(C)]
pub struct ObjArray {
    pub obj: Obj,
    pub items: Vec<Value>,
}

impl ObjArray {
    pub fn new() -> ObjArray {
        ObjArray {
            obj: Obj::new(ObjKind::Array),
            items: Vec::new(),
        }
    }
}

impl Default for ObjArray {
    fn default() -> Self {
        ObjArray::new()
    }
}

/// A compiled function: immutable once `end_compiler` returns.
#[repr(C)]
pub struct ObjFunction {
    pub obj: Obj,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub name: Option<*mut ObjString>,
}

impl ObjFunction {
    pub fn new() -> ObjFunction {
        ObjFunction {
            obj: Obj::new(ObjKind::Function),
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: None,
        }
    }

    pub fn name_str(&self) -> &str {
        match self.name {
            Some(s) => unsafe { (*s).as_str() },
            None => "script",
        }
    }
}

impl Default for ObjFunction {
    fn default() -> Self {
        ObjFunction::new()
    }
}

/// The host-function calling convention: `(vm, args) -> Result<Value, String>`.
/// See `NativeResult`'s doc comment for why this is an explicit
/// channel rather than a sentinel value.
pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> NativeResult;

pub type NativeResult = Result<Value, String>;

#[repr(C)]
pub struct ObjNative {
    pub obj: Obj,
    pub name: *mut ObjString,
    pub arity: u8,
    pub function: NativeFn,
}

/// A captured variable slot. While open, `location` points into the
/// VM's value stack; once closed, it points at `closed` instead.
#[repr(C)]
pub struct ObjUpvalue {
    pub obj: Obj,
    pub location: *mut Value,
    pub closed: Value,
    /// Next entry in the VM's open-upvalue list, sorted by
    /// descending `location`. Unused (left null) once closed.
    pub next: *mut ObjUpvalue,
}

impl ObjUpvalue {
    pub fn new(location: *mut Value) -> ObjUpvalue {
        ObjUpvalue {
            obj: Obj::new(ObjKind::Upvalue),
            location,
            closed: Value::nil(),
            next: std::ptr::null_mut(),
        }
    }

    /// Copy the live value into `closed` and redirect `location` there.
    pub fn close(&mut self) {
        self.closed = unsafe { *self.location };
        self.location = &mut self.closed as *mut Value;
    }
}

/// Function plus the upvalues captured by the enclosing frame at the
/// moment the `CLOSURE` instruction ran.
#[repr(C)]
pub struct ObjClosure {
    pub obj: Obj,
    pub function: *mut ObjFunction,
    pub upvalues: Vec<*mut ObjUpvalue>,
}

impl ObjClosure {
    pub fn new(function: *mut ObjFunction) -> ObjClosure {
        let upvalue_count = unsafe { (*function).upvalue_count } as usize;
        ObjClosure {
            obj: Obj::new(ObjKind::Closure),
            function,
            upvalues: vec![std::ptr::null_mut(); upvalue_count],
        }
    }
}

#[repr(C)]
pub struct ObjClass {
    pub obj: Obj,
    pub name: *mut ObjString,
    pub methods: Table,
}

impl ObjClass {
    pub fn new(name: *mut ObjString) -> ObjClass {
        ObjClass {
            obj: Obj::new(ObjKind::Class),
            name,
            methods: Table::new(),
        }
    }
}

#[repr(C)]
pub struct ObjInstance {
    pub obj: Obj,
    pub class: *mut ObjClass,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: *mut ObjClass) -> ObjInstance {
        ObjInstance {
            obj: Obj::new(ObjKind::Instance),
            class,
            fields: Table::new(),
        }
    }
}

#[repr(C)]
pub struct ObjBoundMethod {
    pub obj: Obj,
    pub receiver: Value,
    pub method: *mut ObjClosure,
}

impl ObjBoundMethod {
    pub fn new(receiver: Value, method: *mut ObjClosure) -> ObjBoundMethod {
        ObjBoundMethod {
            obj: Obj::new(ObjKind::BoundMethod),
            receiver,
            method,
        }
    }
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: `self` is always reached through a `*mut Obj` that was
        // allocated as one of the concrete object types below.
        unsafe {
            match self.kind {
                ObjKind::String => write!(f, "{}", (self as *const Obj as *const ObjString).as_ref().unwrap().as_str()),
                ObjKind::Array => {
                    let arr = &*(self as *const Obj as *const ObjArray);
                    write!(f, "[")?;
                    for (i, v) in arr.items.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{v:?}")?;
                    }
                    write!(f, "]")
                }
                ObjKind::Function => {
                    let func = &*(self as *const Obj as *const ObjFunction);
                    write!(f, "<fn {}>", func.name_str())
                }
                ObjKind::Native => write!(f, "<native fn>"),
                ObjKind::Upvalue => write!(f, "upvalue"),
                ObjKind::Closure => {
                    let cl = &*(self as *const Obj as *const ObjClosure);
                    write!(f, "<fn {}>", (*cl.function).name_str())
                }
                ObjKind::Class => {
                    let cls = &*(self as *const Obj as *const ObjClass);
                    write!(f, "{}", (*cls.name).as_str())
                }
                ObjKind::Instance => {
                    let inst = &*(self as *const Obj as *const ObjInstance);
                    write!(f, "{} instance", (*(*inst.class).name).as_str())
                }
                ObjKind::BoundMethod => {
                    let bound = &*(self as *const Obj as *const ObjBoundMethod);
                    write!(f, "<fn {}>", (*(*bound.method).function).name_str())
                }
            }
        }
    }
}
