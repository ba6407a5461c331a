//! Tri-colour incremental-marking mark–sweep garbage collector.
//!
//! A cycle is triggered whenever `bytes_allocated` crosses `next_gc`
//! (or, under [`VmOptions::stress_gc`], on every allocation). Roots
//! are the live stack, every frame's closure, the open-upvalue list,
//! the globals table, the in-progress compiler chain, and the cached
//! `init` string. The intern table is deliberately *not* a root: it
//! is weakly pruned between tracing and sweeping so strings reachable
//! only from it don't become immortal.

use crate::values::{
    Obj, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjKind,
    ObjNative, ObjString, ObjUpvalue, Value,
};
use crate::vm::{Table, Vm};

/// `next_gc = bytes_allocated * GC_HEAP_GROW_FACTOR` after each cycle,
/// matching the source collector's constant; exposed as a
/// configurable default via [`VmOptions::gc_heap_grow_factor`].
pub const DEFAULT_GC_HEAP_GROW_FACTOR: f64 = 2.0;

pub struct Heap {
    pub(crate) objects: *mut Obj,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub strings: Table,
    gray_stack: Vec<*mut Obj>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: std::ptr::null_mut(),
            bytes_allocated: 0,
            next_gc: 1024 * 1024,
            strings: Table::new(),
            gray_stack: Vec::new(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Vm {
    /// Allocate `value` on the heap, linking it into the all-objects
    /// list. Runs a GC cycle first if the new allocation crosses the
    /// threshold (or `stress_gc` is on) — any not-yet-rooted value
    /// from a previous allocation must already be on the stack by
    /// this point, or it is collected out from under its owner.
    pub(crate) fn alloc_object<T>(&mut self, value: T) -> *mut T {
        let size = std::mem::size_of::<T>();
        self.heap.bytes_allocated += size;
        if self.options.stress_gc || self.heap.bytes_allocated > self.heap.next_gc {
            self.collect_garbage();
        }

        let ptr = Box::into_raw(Box::new(value));
        let obj_ptr = ptr as *mut Obj;
        unsafe {
            (*obj_ptr).next = self.heap.objects;
        }
        self.heap.objects = obj_ptr;
        ptr
    }

    pub fn bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated
    }

    pub fn collect_garbage(&mut self) {
        let _span = tracing::debug_span!("gc_cycle").entered();
        let before = self.heap.bytes_allocated;

        self.mark_roots();
        self.trace_references();
        self.heap.strings.remove_white();
        self.sweep();

        self.heap.next_gc =
            (self.heap.bytes_allocated as f64 * self.options.gc_heap_grow_factor) as usize;

        tracing::debug!(
            freed = before.saturating_sub(self.heap.bytes_allocated),
            before,
            after = self.heap.bytes_allocated,
            next_gc = self.heap.next_gc,
            "gc cycle complete"
        );
    }

    fn mark_roots(&mut self) {
        for slot in self.stack.as_slice() {
            self.mark_value(*slot);
        }

        for frame in &self.frames {
            self.mark_object(frame.closure as *mut Obj);
        }

        let mut upvalue = self.open_upvalues;
        while !upvalue.is_null() {
            self.mark_object(upvalue as *mut Obj);
            upvalue = unsafe { (*upvalue).next };
        }

        let global_pairs: Vec<_> = self.globals.iter().collect();
        for (key, value) in global_pairs {
            self.mark_object(key as *mut Obj);
            self.mark_value(value);
        }
        let const_keys: Vec<_> = self.global_constants.iter().map(|(k, _)| k).collect();
        for key in const_keys {
            self.mark_object(key as *mut Obj);
        }

        let compiling: Vec<_> = self.compiling_functions.clone();
        for function in compiling {
            self.mark_object(function as *mut Obj);
        }

        if !self.init_string.is_null() {
            self.mark_object(self.init_string as *mut Obj);
        }
    }

    pub(crate) fn mark_value(&mut self, value: Value) {
        if value.is_obj() {
            self.mark_object(value.as_obj());
        }
    }

    pub(crate) fn mark_object(&mut self, object: *mut Obj) {
        if object.is_null() {
            return;
        }
        let is_marked = unsafe { (*object).is_marked };
        if is_marked {
            return;
        }
        unsafe {
            (*object).is_marked = true;
        }
        self.heap.gray_stack.push(object);
    }

    fn trace_references(&mut self) {
        while let Some(object) = self.heap.gray_stack.pop() {
            self.blacken_object(object);
        }
    }

    fn blacken_object(&mut self, object: *mut Obj) {
        let kind = unsafe { (*object).kind };
        match kind {
            ObjKind::String | ObjKind::Native => {}
            ObjKind::Array => {
                let arr = unsafe { &*(object as *const ObjArray) };
                let items = arr.items.clone();
                for item in items {
                    self.mark_value(item);
                }
            }
            ObjKind::Function => {
                let func = unsafe { &*(object as *const ObjFunction) };
                if let Some(name) = func.name {
                    self.mark_object(name as *mut Obj);
                }
                let constants = func.chunk.constants.clone();
                for constant in constants {
                    self.mark_value(constant);
                }
            }
            ObjKind::Upvalue => {
                let closed = unsafe { (*(object as *const ObjUpvalue)).closed };
                self.mark_value(closed);
            }
            ObjKind::Closure => {
                let closure = unsafe { &*(object as *const ObjClosure) };
                self.mark_object(closure.function as *mut Obj);
                let upvalues = closure.upvalues.clone();
                for upvalue in upvalues {
                    self.mark_object(upvalue as *mut Obj);
                }
            }
            ObjKind::Class => {
                let class = unsafe { &*(object as *const ObjClass) };
                self.mark_object(class.name as *mut Obj);
                let methods: Vec<_> = class.methods.iter().collect();
                for (key, value) in methods {
                    self.mark_object(key as *mut Obj);
                    self.mark_value(value);
                }
            }
            ObjKind::Instance => {
                let instance = unsafe { &*(object as *const ObjInstance) };
                self.mark_object(instance.class as *mut Obj);
                let fields: Vec<_> = instance.fields.iter().collect();
                for (key, value) in fields {
                    self.mark_object(key as *mut Obj);
                    self.mark_value(value);
                }
            }
            ObjKind::BoundMethod => {
                let bound = unsafe { &*(object as *const ObjBoundMethod) };
                self.mark_value(bound.receiver);
                self.mark_object(bound.method as *mut Obj);
            }
        }
    }

    fn sweep(&mut self) {
        let mut previous: *mut Obj = std::ptr::null_mut();
        let mut current = self.heap.objects;

        while !current.is_null() {
            let is_marked = unsafe { (*current).is_marked };
            let next = unsafe { (*current).next };

            if is_marked {
                unsafe {
                    (*current).is_marked = false;
                }
                previous = current;
                current = next;
            } else {
                if previous.is_null() {
                    self.heap.objects = next;
                } else {
                    unsafe {
                        (*previous).next = next;
                    }
                }
                self.free_object(current);
                current = next;
            }
        }
    }

    /// Free one heap object. The `kind` tag tells us which concrete
    /// type to reconstitute the `Box` as; getting this wrong would
    /// deallocate the wrong layout.
    pub(crate) fn free_object(&mut self, object: *mut Obj) {
        let kind = unsafe { (*object).kind };
        macro_rules! drop_as {
            ($ty:ty) => {{
                self.heap.bytes_allocated -= std::mem::size_of::<$ty>();
                drop(unsafe { Box::from_raw(object as *mut $ty) });
            }};
        }
        match kind {
            ObjKind::String => drop_as!(ObjString),
            ObjKind::Array => drop_as!(ObjArray),
            ObjKind::Function => drop_as!(ObjFunction),
            ObjKind::Native => drop_as!(ObjNative),
            ObjKind::Upvalue => drop_as!(ObjUpvalue),
            ObjKind::Closure => drop_as!(ObjClosure),
            ObjKind::Class => drop_as!(ObjClass),
            ObjKind::Instance => drop_as!(ObjInstance),
            ObjKind::BoundMethod => drop_as!(ObjBoundMethod),
        }
    }

    /// Free every remaining heap object, ignoring marks. Called once
    /// from `Drop for Vm`.
    pub(crate) fn free_all_objects(&mut self) {
        let mut current = self.heap.objects;
        while !current.is_null() {
            let next = unsafe { (*current).next };
            self.free_object(current);
            current = next;
        }
        self.heap.objects = std::ptr::null_mut();
    }
}
