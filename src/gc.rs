//! Tracing mark-sweep heap. Allocation links every object into an intrusive
//! singly-linked list (`Obj::next`); collection walks from a set of roots
//! supplied by the caller, darkens everything reachable, then frees
//! whatever is still white.
//!
//! Root marking lives outside this module, in `Vm::mark_roots` (`vm.rs`),
//! since it needs simultaneous access to the stack, call frames, globals
//! table and open upvalues that the `Vm` owns alongside the heap.
//! Collection only runs during execution; the compiler never triggers it,
//! so there is no separate root-marking pass for in-progress compilation
//! state.

use crate::object::{
    hash_str, ObjBoundMethod, ObjClass, ObjClosure, ObjData, ObjFunction, ObjInstance, ObjKind,
    ObjNative, ObjString, ObjUpvalue, UpvalueState,
};
use crate::object::{NativeFn, Obj};
use crate::table::Table;
use crate::value::Value;
use std::cell::Cell;
use std::ptr;

const GC_HEAP_GROW_FACTOR: usize = 2;
const INITIAL_GC_THRESHOLD: usize = 1 << 20;

pub struct Heap {
    objects: *mut Obj,
    strings: Table<()>,
    gray_stack: Vec<*mut Obj>,
    bytes_allocated: usize,
    next_gc: usize,
    pub log_stats: bool,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: ptr::null_mut(),
            strings: Table::new(),
            gray_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            log_stats: false,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        cfg!(feature = "stress-gc") || self.bytes_allocated > self.next_gc
    }

    fn push(&mut self, kind: ObjKind, data: ObjData, size: usize) -> *mut Obj {
        let obj = Box::into_raw(Box::new(Obj {
            kind,
            marked: Cell::new(false),
            next: Cell::new(self.objects),
            data,
        }));
        self.objects = obj;
        self.bytes_allocated += size;
        obj
    }

    pub fn intern(&mut self, chars: &str) -> *mut Obj {
        let hash = hash_str(chars);
        if let Some(existing) = self.strings.find_interned(chars, hash) {
            return existing;
        }
        let obj = self.push(
            ObjKind::String,
            ObjData::String(ObjString {
                chars: chars.to_owned(),
                hash,
            }),
            std::mem::size_of::<ObjString>() + chars.len(),
        );
        self.strings.set(obj, ());
        obj
    }

    pub fn alloc_function(&mut self, function: ObjFunction) -> *mut Obj {
        self.push(
            ObjKind::Function,
            ObjData::Function(function),
            std::mem::size_of::<ObjFunction>(),
        )
    }

    pub fn alloc_closure(&mut self, function: *mut Obj, upvalues: Vec<*mut Obj>) -> *mut Obj {
        self.push(
            ObjKind::Closure,
            ObjData::Closure(ObjClosure { function, upvalues }),
            std::mem::size_of::<ObjClosure>(),
        )
    }

    pub fn alloc_open_upvalue(&mut self, stack_slot: usize) -> *mut Obj {
        self.push(
            ObjKind::Upvalue,
            ObjData::Upvalue(ObjUpvalue {
                state: UpvalueState::Open(stack_slot),
            }),
            std::mem::size_of::<ObjUpvalue>(),
        )
    }

    pub fn alloc_native(&mut self, name: &'static str, arity: u8, function: NativeFn) -> *mut Obj {
        self.push(
            ObjKind::Native,
            ObjData::Native(ObjNative { name, arity, function }),
            std::mem::size_of::<ObjNative>(),
        )
    }

    pub fn alloc_class(&mut self, name: *mut Obj) -> *mut Obj {
        self.push(
            ObjKind::Class,
            ObjData::Class(ObjClass { name, methods: Table::new() }),
            std::mem::size_of::<ObjClass>(),
        )
    }

    pub fn alloc_instance(&mut self, class: *mut Obj) -> *mut Obj {
        self.push(
            ObjKind::Instance,
            ObjData::Instance(ObjInstance { class, fields: Table::new() }),
            std::mem::size_of::<ObjInstance>(),
        )
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: *mut Obj) -> *mut Obj {
        self.push(
            ObjKind::BoundMethod,
            ObjData::BoundMethod(ObjBoundMethod { receiver, method }),
            std::mem::size_of::<ObjBoundMethod>(),
        )
    }

    pub fn mark_value(&mut self, value: &Value) {
        if let Value::Object(obj) = value {
            self.mark_object(*obj);
        }
    }

    pub fn mark_object(&mut self, obj: *mut Obj) {
        if obj.is_null() {
            return;
        }
        let marked = unsafe { &(*obj).marked };
        if marked.get() {
            return;
        }
        marked.set(true);
        self.gray_stack.push(obj);
    }

    fn blacken(&mut self, obj: *mut Obj) {
        match unsafe { &(*obj).data } {
            ObjData::String(_) | ObjData::Native(_) => {}
            ObjData::Upvalue(up) => {
                if let UpvalueState::Closed(v) = &up.state {
                    self.mark_value(v);
                }
            }
            ObjData::Function(func) => {
                if let Some(name) = func.name {
                    self.mark_object(name);
                }
                self.mark_chunk_constants(&func.chunk);
            }
            ObjData::Closure(closure) => {
                self.mark_object(closure.function);
                for up in closure.upvalues.clone() {
                    self.mark_object(up);
                }
            }
            ObjData::Class(class) => {
                self.mark_object(class.name);
                self.mark_table(&class.methods);
            }
            ObjData::Instance(instance) => {
                self.mark_object(instance.class);
                self.mark_table(&instance.fields);
            }
            ObjData::BoundMethod(bound) => {
                self.mark_value(&bound.receiver);
                self.mark_object(bound.method);
            }
        }
    }

    fn mark_chunk_constants(&mut self, chunk: &crate::chunk::Chunk) {
        for value in chunk.constants_slice() {
            self.mark_value(value);
        }
    }

    fn mark_table(&mut self, table: &Table<Value>) {
        let entries: Vec<(*mut Obj, Value)> = table.iter().map(|(k, v)| (k, *v)).collect();
        for (key, value) in entries {
            self.mark_object(key);
            self.mark_value(&value);
        }
    }

    pub fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            self.blacken(obj);
        }
    }

    pub fn sweep_strings(&mut self) {
        self.strings.retain_marked();
    }

    pub fn sweep(&mut self) {
        let mut prev: *mut Obj = ptr::null_mut();
        let mut current = self.objects;
        while !current.is_null() {
            let marked = unsafe { &(*current).marked };
            let next = unsafe { (*current).next.get() };
            if marked.get() {
                marked.set(false);
                prev = current;
            } else {
                if prev.is_null() {
                    self.objects = next;
                } else {
                    unsafe { (*prev).next.set(next) };
                }
                self.bytes_allocated -= Self::approx_size(current);
                drop(unsafe { Box::from_raw(current) });
            }
            current = next;
        }
    }

    fn approx_size(obj: *mut Obj) -> usize {
        match unsafe { &(*obj).data } {
            ObjData::String(s) => std::mem::size_of::<ObjString>() + s.chars.len(),
            ObjData::Function(_) => std::mem::size_of::<ObjFunction>(),
            ObjData::Closure(_) => std::mem::size_of::<ObjClosure>(),
            ObjData::Upvalue(_) => std::mem::size_of::<ObjUpvalue>(),
            ObjData::Native(_) => std::mem::size_of::<ObjNative>(),
            ObjData::Class(_) => std::mem::size_of::<ObjClass>(),
            ObjData::Instance(_) => std::mem::size_of::<ObjInstance>(),
            ObjData::BoundMethod(_) => std::mem::size_of::<ObjBoundMethod>(),
        }
    }

    pub fn adjust_next_gc(&mut self) {
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        if self.next_gc < INITIAL_GC_THRESHOLD {
            self.next_gc = INITIAL_GC_THRESHOLD;
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.objects;
        while !current.is_null() {
            let next = unsafe { (*current).next.get() };
            drop(unsafe { Box::from_raw(current) });
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_same_pointer() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn distinct_strings_intern_to_distinct_pointers() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("world");
        assert!(!std::ptr::eq(a, b));
    }

    #[test]
    fn sweep_frees_unreached_objects() {
        let mut heap = Heap::new();
        let before = heap.bytes_allocated();
        heap.intern("unreachable");
        assert!(heap.bytes_allocated() > before);
        heap.trace_references();
        heap.sweep_strings();
        heap.sweep();
        assert_eq!(heap.bytes_allocated(), 0);
    }
}
