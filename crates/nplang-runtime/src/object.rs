//! Heap-allocated object bodies and the arena that owns them.
//!
//! Rather than an intrusive `Obj*` linked list threaded through raw pointers,
//! the heap here is a generational-index arena: [`ObjRef`] is a small
//! `Copy` handle (slot index + generation) and [`Heap`] is the single owner
//! of every object's storage. This gives the same operational picture as a
//! pointer-linked "all objects" list — sweep walks every slot once per
//! collection — without reaching for `unsafe`.

use crate::chunk::Chunk;
use crate::error::RuntimeError;
use crate::table::{hash_string, Table};
use crate::value::Value;
use crate::vm::Vm;

/// A handle to a heap-allocated object. Two `ObjRef`s are equal iff they
/// name the same live object; this is the identity comparison the language
/// uses for everything except numbers, booleans, and nil.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError>;

pub struct ObjString {
    pub chars: String,
    pub hash: u64,
}

pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    /// `None` for the implicit top-level script function.
    pub name: Option<ObjRef>,
    pub chunk: Chunk,
}

impl ObjFunction {
    #[must_use]
    pub fn new(name: Option<ObjRef>) -> Self {
        Self {
            arity: 0,
            upvalue_count: 0,
            name,
            chunk: Chunk::new(),
        }
    }
}

pub struct ObjNative {
    pub name: ObjRef,
    pub function: NativeFn,
}

#[derive(Clone, Copy)]
pub struct UpvalueDesc {
    pub index: u8,
    pub is_local: bool,
}

pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// An upvalue is open while it still aliases a live stack slot, and is
/// closed (its value copied into the object itself) once that frame pops.
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

impl ObjClass {
    #[must_use]
    pub fn new(name: ObjRef) -> Self {
        Self {
            name,
            methods: Table::new(),
        }
    }
}

pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

impl ObjInstance {
    #[must_use]
    pub fn new(class: ObjRef) -> Self {
        Self {
            class,
            fields: Table::new(),
        }
    }
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// A heap object body. The discriminant doubles as the object's "kind" for
/// runtime type errors and the `type_name` family of diagnostics.
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(Upvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl Obj {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native function",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }

    /// A rough accounting size in bytes, used to drive the GC's
    /// `bytes_allocated` / `next_gc` threshold. Doesn't need to be exact.
    fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::String(s) => s.chars.len(),
            Obj::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * 16,
            Obj::Closure(c) => c.upvalues.len() * 8,
            Obj::Class(c) => c.methods.len() * 24,
            Obj::Instance(i) => i.fields.len() * 24,
            _ => 0,
        }
    }
}

enum Slot {
    Free { next_free: Option<u32> },
    Occupied { obj: Obj, marked: bool, generation: u32 },
}

/// The object arena. Owns every heap object the VM has ever allocated that
/// hasn't yet been swept, the interned-string table, and the GC's
/// bytes-allocated accounting.
pub struct Heap {
    slots: Vec<Slot>,
    /// Generation a slot's *next* occupant will receive; bumped on free so a
    /// stale `ObjRef` into a reused slot is rejected instead of aliasing.
    next_generation: Vec<u32>,
    free_list: Option<u32>,
    strings: Table,
    pub bytes_allocated: usize,
    pub next_gc: usize,
}

const INITIAL_NEXT_GC: usize = 1024 * 1024;
const GC_GROWTH_FACTOR: usize = 2;

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_generation: Vec::new(),
            free_list: None,
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
        }
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn grow_next_gc(&mut self) {
        self.next_gc = self.bytes_allocated * GC_GROWTH_FACTOR;
    }

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += obj.approx_size();
        if let Some(free_index) = self.free_list {
            let next_free = match &self.slots[free_index as usize] {
                Slot::Free { next_free } => *next_free,
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            self.free_list = next_free;
            let generation = self.next_generation[free_index as usize];
            self.slots[free_index as usize] = Slot::Occupied {
                obj,
                marked: false,
                generation,
            };
            ObjRef {
                index: free_index,
                generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied {
                obj,
                marked: false,
                generation: 0,
            });
            self.next_generation.push(0);
            ObjRef {
                index,
                generation: 0,
            }
        }
    }

    fn slot(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.index as usize] {
            Slot::Occupied { obj, generation, .. } if *generation == r.generation => obj,
            _ => panic!("dangling object reference {r:?}"),
        }
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.index as usize] {
            Slot::Occupied { obj, generation, .. } if *generation == r.generation => obj,
            _ => panic!("dangling object reference {r:?}"),
        }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slot(r)
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slot_mut(r)
    }

    pub fn string_contents(&self, r: ObjRef) -> &str {
        match self.slot(r) {
            Obj::String(s) => &s.chars,
            other => panic!("expected string object, found {}", other.kind_name()),
        }
    }

    pub fn string_hash(&self, r: ObjRef) -> u64 {
        match self.slot(r) {
            Obj::String(s) => s.hash,
            other => panic!("expected string object, found {}", other.kind_name()),
        }
    }

    /// Intern a string, returning the existing handle if this content has
    /// already been allocated, or allocating a fresh one otherwise.
    pub fn intern_string(&mut self, chars: &str) -> ObjRef {
        let hash = hash_string(chars);
        if let Some(existing) = self.strings.find_string(self, chars, hash) {
            return existing;
        }
        let r = self.alloc(Obj::String(ObjString {
            chars: chars.to_owned(),
            hash,
        }));
        self.strings.set(r, hash, Value::Null);
        r
    }

    pub fn alloc_function(&mut self, function: ObjFunction) -> ObjRef {
        self.alloc(Obj::Function(function))
    }

    pub fn alloc_native(&mut self, name: ObjRef, function: NativeFn) -> ObjRef {
        self.alloc(Obj::Native(ObjNative { name, function }))
    }

    pub fn alloc_closure(&mut self, function: ObjRef, upvalues: Vec<ObjRef>) -> ObjRef {
        self.alloc(Obj::Closure(ObjClosure { function, upvalues }))
    }

    pub fn alloc_open_upvalue(&mut self, stack_index: usize) -> ObjRef {
        self.alloc(Obj::Upvalue(Upvalue::Open(stack_index)))
    }

    pub fn alloc_class(&mut self, name: ObjRef) -> ObjRef {
        self.alloc(Obj::Class(ObjClass::new(name)))
    }

    pub fn alloc_instance(&mut self, class: ObjRef) -> ObjRef {
        self.alloc(Obj::Instance(ObjInstance::new(class)))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }))
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        match &self.slots[r.index as usize] {
            Slot::Occupied { marked, generation, .. } if *generation == r.generation => *marked,
            _ => false,
        }
    }

    pub fn mark(&mut self, r: ObjRef) -> bool {
        match &mut self.slots[r.index as usize] {
            Slot::Occupied { marked, generation, .. } if *generation == r.generation => {
                let was_marked = *marked;
                *marked = true;
                !was_marked
            }
            _ => false,
        }
    }

    /// Every `ObjRef` reachable in a single hop from `r` — used by the
    /// collector's gray worklist without it needing to match on `Obj`.
    pub fn children_of(&self, r: ObjRef) -> Vec<ObjRef> {
        match self.slot(r) {
            Obj::String(_) | Obj::Native(_) => Vec::new(),
            Obj::Function(f) => {
                let mut out: Vec<ObjRef> = f.chunk.constants.iter().filter_map(Value::as_obj).collect();
                out.extend(f.name);
                out
            }
            Obj::Closure(c) => {
                let mut out = vec![c.function];
                out.extend(c.upvalues.iter().copied());
                out
            }
            Obj::Upvalue(Upvalue::Closed(v)) => v.as_obj().into_iter().collect(),
            Obj::Upvalue(Upvalue::Open(_)) => Vec::new(),
            Obj::Class(c) => {
                let mut out = vec![c.name];
                for (key, value) in c.methods.iter() {
                    out.push(key);
                    out.extend(value.as_obj());
                }
                out
            }
            Obj::Instance(i) => {
                let mut out = vec![i.class];
                for (key, value) in i.fields.iter() {
                    out.push(key);
                    out.extend(value.as_obj());
                }
                out
            }
            Obj::BoundMethod(b) => {
                let mut out = vec![b.method];
                out.extend(b.receiver.as_obj());
                out
            }
        }
    }

    /// Drop the intern table's weak references to strings that didn't
    /// survive marking, then free every unmarked slot and clear marks on
    /// survivors. Called once per collection, after marking completes.
    pub fn sweep(&mut self) {
        let mut strings = std::mem::take(&mut self.strings);
        strings.remove_unmarked_strings(self);
        self.strings = strings;

        for index in 0..self.slots.len() {
            match &self.slots[index] {
                Slot::Occupied { marked, generation, obj } => {
                    if *marked {
                        continue;
                    }
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(obj.approx_size());
                    self.next_generation[index] = generation.wrapping_add(1);
                    let next_free = self.free_list;
                    self.slots[index] = Slot::Free { next_free };
                    self.free_list = Some(index as u32);
                }
                Slot::Free { .. } => {}
            }
        }
        for slot in &mut self.slots {
            if let Slot::Occupied { marked, .. } = slot {
                *marked = false;
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_identity_stable() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello");
        let b = heap.intern_string("hello");
        assert_eq!(a, b);
        let c = heap.intern_string("world");
        assert_ne!(a, c);
    }

    #[test]
    fn sweep_frees_unmarked_and_keeps_marked() {
        let mut heap = Heap::new();
        let keep = heap.intern_string("keep");
        let _drop = heap.intern_string("drop");
        heap.mark(keep);
        heap.sweep();
        assert_eq!(heap.string_contents(keep), "keep");
    }

    #[test]
    #[should_panic(expected = "dangling object reference")]
    fn dangling_ref_after_sweep_panics() {
        let mut heap = Heap::new();
        let gone = heap.intern_string("gone");
        heap.sweep();
        let _ = heap.string_contents(gone);
    }
}
