//! Open-addressing hash table with tombstone deletion, shared by string
//! interning, globals, and every class's method/instance field map. Keys
//! are always interned `ObjString` pointers, so lookup is pointer equality
//! once a key is already interned.

use crate::object::{hash_str, str_contents, Obj};

const MAX_LOAD: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

struct Entry<V> {
    key: Option<*mut Obj>,
    tombstone: bool,
    value: Option<V>,
}

impl<V> Entry<V> {
    fn empty() -> Self {
        Entry {
            key: None,
            tombstone: false,
            value: None,
        }
    }
}

pub struct Table<V> {
    entries: Vec<Entry<V>>,
    count: usize,
}

impl<V: Clone> Table<V> {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn hash_of(key: *mut Obj) -> u32 {
        hash_str(str_contents(key))
    }

    /// Finds the slot that either holds `key` or is the first free slot a
    /// new entry for `key` should occupy. Prefers recycling the first
    /// tombstone seen so repeated probes on the same key shorten over time.
    fn find_slot(entries: &[Entry<V>], key: *mut Obj) -> usize {
        let capacity = entries.len();
        let hash = Self::hash_of(key);
        let mut index = hash as usize & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None if !entry.tombstone => return tombstone.unwrap_or(index),
                None => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if std::ptr::eq(k, key) => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() {
            MIN_CAPACITY
        } else {
            self.entries.len() * 2
        };
        let mut expanded: Vec<Entry<V>> = (0..new_capacity).map(|_| Entry::empty()).collect();

        let mut live = 0;
        for entry in self.entries.drain(..) {
            if let Some(key) = entry.key {
                let slot = Self::find_slot(&expanded, key);
                expanded[slot].key = Some(key);
                expanded[slot].value = entry.value;
                live += 1;
            }
        }
        self.entries = expanded;
        self.count = live;
    }

    pub fn set(&mut self, key: *mut Obj, value: V) -> bool {
        if self.entries.is_empty() || self.count + 1 > (MAX_LOAD * self.capacity() as f64) as usize
        {
            self.grow();
        }
        let slot = Self::find_slot(&self.entries, key);
        let entry = &mut self.entries[slot];
        let existed = entry.key.map_or(false, |k| std::ptr::eq(k, key)) && !entry.tombstone;
        if !existed {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = Some(value);
        entry.tombstone = false;
        existed
    }

    pub fn get(&self, key: *mut Obj) -> Option<&V> {
        if self.entries.is_empty() {
            return None;
        }
        let slot = Self::find_slot(&self.entries, key);
        self.entries[slot].value.as_ref()
    }

    pub fn delete(&mut self, key: *mut Obj) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let slot = Self::find_slot(&self.entries, key);
        if self.entries[slot].key.is_none() {
            return false;
        }
        self.entries[slot].key = None;
        self.entries[slot].value = None;
        self.entries[slot].tombstone = true;
        self.count -= 1;
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut Obj, &V)> {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value.as_ref().unwrap())))
    }

    /// Drops every entry whose key object was not marked by the last GC
    /// trace, used to sweep the string-intern table after tracing roots.
    pub fn retain_marked(&mut self) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                let marked = unsafe { (*key).marked.get() };
                if !marked {
                    entry.key = None;
                    entry.value = None;
                    entry.tombstone = true;
                    self.count -= 1;
                }
            }
        }
    }

    /// String-interning lookup: there is no existing key pointer to compare
    /// against yet, only raw content and its hash, so this walks the table
    /// comparing bytes directly instead of going through `find_slot`.
    pub fn find_interned(&self, chars: &str, hash: u32) -> Option<*mut Obj> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.tombstone => return None,
                Some(key) if str_contents(key) == chars => return Some(key),
                _ => {}
            }
            index = (index + 1) % capacity;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let key = heap.intern("hello");
        let mut table: Table<u32> = Table::new();
        assert!(!table.set(key, 1));
        assert_eq!(table.get(key), Some(&1));
        assert!(table.delete(key));
        assert_eq!(table.get(key), None);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut table: Table<u32> = Table::new();
        for i in 0..64 {
            let key = heap.intern(&format!("key{i}"));
            table.set(key, i);
        }
        assert_eq!(table.len(), 64);
    }
}
