//! Open-addressed hash table keyed by interned strings.
//!
//! Used for the VM's globals, the global-constant sentinel set, every
//! class's method table, every instance's field table, and the VM's
//! own string-intern table. Keys are compared by pointer: strings are
//! interned before they ever reach a `Table`, so two equal-content
//! keys are always the same pointer.

use crate::values::{ObjString, Value};

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    /// `None` means either empty or tombstone; see `value` to tell
    /// them apart (tombstone: `value = Value::TRUE`, empty: `value =
    /// Value::NIL`), mirroring the source table's sentinel scheme.
    key: Option<*mut ObjString>,
    value: Value,
}

impl Entry {
    fn empty() -> Entry {
        Entry {
            key: None,
            value: Value::nil(),
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value.is_true()
    }
}

/// An open-addressing hash table with linear probing and tombstone
/// deletion, rebuilt (tombstones discarded) whenever it grows past
/// 75% load.
pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl Table {
    pub fn new() -> Table {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Probe for `key`'s slot, returning the one it lives in or the
    /// first tombstone/empty slot it should be inserted into. Starts
    /// from the string's own cached hash, not its pointer value —
    /// `ObjString` pointers are at least 8-byte aligned, so using the
    /// address directly would zero out the low bits that `% capacity`
    /// relies on for any power-of-two capacity and collapse every
    /// bucket onto index 0.
    fn find_entry(entries: &[Entry], capacity: usize, key: *mut ObjString) -> usize {
        let mut index = (unsafe { (*key).hash } as usize) % capacity;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            match entry.key {
                Some(k) if k == key => return index,
                None if !entry.is_tombstone() => {
                    // Truly empty: prefer an earlier tombstone if we passed one.
                    return tombstone.unwrap_or(index);
                }
                None => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut new_entries = vec![Entry::empty(); capacity];
        let mut new_count = 0;

        for entry in &self.entries {
            let Some(key) = entry.key else { continue };
            let index = Table::find_entry(&new_entries, capacity, key);
            new_entries[index] = Entry {
                key: Some(key),
                value: entry.value,
            };
            new_count += 1;
        }

        self.entries = new_entries;
        self.count = new_count;
    }

    /// Insert or overwrite `key`. Returns `true` if this added a new
    /// key (as opposed to overwriting an existing one).
    pub fn set(&mut self, key: *mut ObjString, value: Value) -> bool {
        if self.entries.is_empty()
            || (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD
        {
            let new_capacity = if self.entries.is_empty() {
                8
            } else {
                self.entries.len() * 2
            };
            self.adjust_capacity(new_capacity);
        }

        let capacity = self.entries.len();
        let index = Table::find_entry(&self.entries, capacity, key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    pub fn get(&self, key: *mut ObjString) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let index = Table::find_entry(&self.entries, capacity, key);
        let entry = &self.entries[index];
        if entry.key.is_some() {
            Some(entry.value)
        } else {
            None
        }
    }

    pub fn contains_key(&self, key: *mut ObjString) -> bool {
        self.get(key).is_some()
    }

    /// Delete `key`, leaving a tombstone so later probes still find
    /// keys that were inserted after a collision with it.
    pub fn delete(&mut self, key: *mut ObjString) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let capacity = self.entries.len();
        let index = Table::find_entry(&self.entries, capacity, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::bool(true);
        true
    }

    /// Copy every entry from `other` into `self` (class inheritance).
    pub fn add_all_from(&mut self, other: &Table) {
        for entry in &other.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.value);
            }
        }
    }

    /// Find the canonical interned string with this exact byte
    /// content and hash, if one already exists. This is the only
    /// place string identity is established: everywhere else compares
    /// `ObjString` pointers.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<*mut ObjString> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(key) => {
                    let s = unsafe { &*key };
                    if s.hash == hash && s.as_str() == chars {
                        return Some(key);
                    }
                }
                None => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// Evict every entry whose key is not marked. Called on the
    /// intern table between GC tracing and sweeping: the intern table
    /// is not itself a root, so strings only reachable from it must
    /// be pruned before their storage is freed, or they'd be immortal.
    pub fn remove_white(&mut self) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                let marked = unsafe { (*key).obj.is_marked };
                if !marked {
                    entry.key = None;
                    entry.value = Value::bool(true);
                }
            }
        }
    }

    /// Iterate `(key, value)` pairs, used by the GC to mark every
    /// entry as a root.
    pub fn iter(&self) -> impl Iterator<Item = (*mut ObjString, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}
