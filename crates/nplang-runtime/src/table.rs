//! Open-addressed, string-keyed hash table.
//!
//! One table implementation backs four different uses: the VM's globals,
//! the interned-string set, class method tables, and instance field tables.
//! Keys are handles to interned [`ObjString`](crate::object::Obj::String)
//! objects; since interning guarantees one record per distinct content, key
//! comparison is a cheap [`ObjRef`] equality check and never needs to touch
//! the heap — except for [`Table::find_string`], which is the one operation
//! that runs *before* an [`ObjRef`] exists (deciding whether a freshly
//! scanned string literal is already interned).

use crate::object::{Heap, ObjRef};
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone)]
enum Entry {
    Empty,
    Tombstone,
    Occupied {
        key: ObjRef,
        hash: u64,
        value: Value,
    },
}

/// An open-addressed hash table with linear probing and tombstone deletion.
pub struct Table {
    entries: Vec<Entry>,
    /// Live entries plus tombstones; drives the growth trigger.
    count: usize,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, Entry::Occupied { .. }))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, key: ObjRef, hash: u64) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.find_entry(key, hash);
        match &self.entries[idx] {
            Entry::Occupied { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Insert or overwrite `key`. Returns `true` if this created a brand new
    /// key (matches clox's `tableSet` return convention, used by the
    /// compiler and VM to distinguish "already declared" from "new").
    pub fn set(&mut self, key: ObjRef, hash: u64, value: Value) -> bool {
        if self.count + 1 > ((self.entries.len() as f64) * MAX_LOAD) as usize {
            let new_capacity = if self.entries.is_empty() {
                8
            } else {
                self.entries.len() * 2
            };
            self.adjust_capacity(new_capacity);
        }

        let idx = self.find_entry(key, hash);
        let is_new = !matches!(self.entries[idx], Entry::Occupied { .. });
        if is_new && matches!(self.entries[idx], Entry::Empty) {
            self.count += 1;
        }
        self.entries[idx] = Entry::Occupied { key, hash, value };
        is_new
    }

    pub fn delete(&mut self, key: ObjRef, hash: u64) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = self.find_entry(key, hash);
        if matches!(self.entries[idx], Entry::Occupied { .. }) {
            self.entries[idx] = Entry::Tombstone;
            true
        } else {
            false
        }
    }

    /// Find an already-interned string equal to `chars` by content, without
    /// requiring an `ObjRef` for it to already exist.
    #[must_use]
    pub fn find_string(&self, heap: &Heap, chars: &str, hash: u64) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut idx = (hash as usize) & mask;
        loop {
            match &self.entries[idx] {
                Entry::Empty => return None,
                Entry::Occupied {
                    key,
                    hash: entry_hash,
                    ..
                } => {
                    if *entry_hash == hash && heap.string_contents(*key) == chars {
                        return Some(*key);
                    }
                }
                Entry::Tombstone => {}
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Prune entries whose key string is unmarked — called on the intern
    /// table right before sweep so dead strings are not resurrected.
    pub fn remove_unmarked_strings(&mut self, heap: &Heap) {
        for entry in &mut self.entries {
            let should_prune = matches!(entry, Entry::Occupied { key, .. } if !heap.is_marked(*key));
            if should_prune {
                *entry = Entry::Tombstone;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Entry::Occupied { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjRef, &mut Value)> {
        self.entries.iter_mut().filter_map(|e| match e {
            Entry::Occupied { key, value, .. } => Some((*key, value)),
            _ => None,
        })
    }

    fn find_entry(&self, key: ObjRef, hash: u64) -> usize {
        let mask = self.entries.len() - 1;
        let mut idx = (hash as usize) & mask;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.entries[idx] {
                Entry::Empty => return first_tombstone.unwrap_or(idx),
                Entry::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Entry::Occupied { key: k, .. } if *k == key => return idx,
                Entry::Occupied { .. } => {}
            }
            idx = (idx + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Entry::Empty; new_capacity];
        let mut live = 0;
        for entry in self.entries.drain(..) {
            if let Entry::Occupied { key, hash, value } = entry {
                let mask = new_capacity - 1;
                let mut idx = (hash as usize) & mask;
                loop {
                    if matches!(new_entries[idx], Entry::Empty) {
                        new_entries[idx] = Entry::Occupied { key, hash, value };
                        live += 1;
                        break;
                    }
                    idx = (idx + 1) & mask;
                }
            }
        }
        self.entries = new_entries;
        self.count = live;
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Entry {
    fn clone(&self) -> Self {
        match self {
            Entry::Empty => Entry::Empty,
            Entry::Tombstone => Entry::Tombstone,
            Entry::Occupied { key, hash, value } => Entry::Occupied {
                key: *key,
                hash: *hash,
                value: *value,
            },
        }
    }
}

/// Compute the FNV-1a hash of a string — used for constant-pool strings and
/// interning; the result is cached on the `ObjString` so it is computed once.
#[must_use]
pub fn hash_string(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Heap;

    #[test]
    fn set_get_roundtrip() {
        let mut heap = Heap::new();
        let a = heap.intern_string("a");
        let b = heap.intern_string("b");
        let mut table = Table::new();
        assert!(table.set(a, hash_string("a"), Value::Number(1.0)));
        assert!(table.set(b, hash_string("b"), Value::Number(2.0)));
        assert!(!table.set(a, hash_string("a"), Value::Number(3.0)));
        assert_eq!(table.get(a, hash_string("a")), Some(Value::Number(3.0)));
        assert_eq!(table.get(b, hash_string("b")), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_then_absent() {
        let mut heap = Heap::new();
        let a = heap.intern_string("a");
        let mut table = Table::new();
        table.set(a, hash_string("a"), Value::Boolean(true));
        assert!(table.delete(a, hash_string("a")));
        assert_eq!(table.get(a, hash_string("a")), None);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..100 {
            let name = format!("var{i}");
            let key = heap.intern_string(&name);
            table.set(key, hash_string(&name), Value::Number(f64::from(i)));
        }
        for i in 0..100 {
            let name = format!("var{i}");
            let key = heap.intern_string(&name);
            assert_eq!(table.get(key, hash_string(&name)), Some(Value::Number(f64::from(i))));
        }
    }

    #[test]
    fn find_string_by_content() {
        let mut heap = Heap::new();
        let s = heap.intern_string("hello");
        let mut table = Table::new();
        table.set(s, hash_string("hello"), Value::Null);
        assert_eq!(table.find_string(&heap, "hello", hash_string("hello")), Some(s));
        assert_eq!(table.find_string(&heap, "nope", hash_string("nope")), None);
    }
}
