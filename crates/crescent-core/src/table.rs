//! Hybrid array+hash table for Lua.

use crate::gc::GcIdx;
use crate::string::StrId;
use crate::value::Value;
use indexmap::IndexMap;

/// Integer keys in 1..=ARRAY_THRESHOLD live in the dense array part;
/// anything past it spills into the hash part.
pub const ARRAY_THRESHOLD: usize = 50;

/// Errors from raw_set with an invalid key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKeyError {
    Nil,
    NaN,
}

/// A key in the hash part of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    /// Number key, stored as normalized raw bits (-0.0 folds into 0.0).
    Number(u64),
    String(StrId),
    Boolean(bool),
    /// Reference key (table, closure, userdata, ...), stored as raw
    /// Value bits so identity is the hash identity.
    GcRef(u64),
}

/// A Lua table: hybrid array + hash map.
pub struct Table {
    /// Array part (1-indexed: array[0] corresponds to key 1). Never longer
    /// than ARRAY_THRESHOLD.
    array: Vec<Value>,
    /// Hash part for everything else (insertion-order preserving).
    hash: IndexMap<TableKey, Value>,
    /// Metatable (if any). Stored and traced, otherwise inert in this core.
    pub metatable: Option<GcIdx<Table>>,
}

impl Table {
    /// Create a new empty table with size hints.
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint.min(ARRAY_THRESHOLD)),
            hash: IndexMap::with_capacity(hash_hint),
            metatable: None,
        }
    }

    /// If `key` addresses the array part, return its 1-based index.
    fn array_index(key: Value) -> Option<usize> {
        let f = key.as_number()?;
        if f >= 1.0 && f <= ARRAY_THRESHOLD as f64 && f.trunc() == f {
            Some(f as usize)
        } else {
            None
        }
    }

    /// Raw get by Value key. Absent keys (and invalid ones) read as nil.
    pub fn raw_get(&self, key: Value) -> Value {
        if let Some(i) = Self::array_index(key) {
            return if i <= self.array.len() {
                self.array[i - 1]
            } else {
                Value::nil()
            };
        }
        match value_to_key(key) {
            Some(tk) => self.hash.get(&tk).copied().unwrap_or(Value::nil()),
            None => Value::nil(),
        }
    }

    /// Raw set by Value key. nil and NaN keys are errors.
    pub fn raw_set(&mut self, key: Value, value: Value) -> Result<(), TableKeyError> {
        if key.is_none_or_nil() {
            return Err(TableKeyError::Nil);
        }
        if let Some(f) = key.as_number() {
            if f.is_nan() {
                return Err(TableKeyError::NaN);
            }
        }

        if let Some(i) = Self::array_index(key) {
            if i <= self.array.len() {
                self.array[i - 1] = value;
            } else if !value.is_nil() {
                // Extend with nils up to the written slot.
                self.array.resize(i - 1, Value::nil());
                self.array.push(value);
            }
            return Ok(());
        }

        let tk = value_to_key(key).expect("validated key");
        if value.is_nil() {
            // Keep a tombstone only for keys that existed, so iteration can
            // still find its position after a mid-loop delete.
            if self.hash.contains_key(&tk) {
                self.hash.insert(tk, value);
            }
        } else {
            self.hash.insert(tk, value);
        }
        Ok(())
    }

    /// Integer-key get (1-based, any range).
    pub fn raw_geti(&self, key: i64) -> Value {
        self.raw_get(Value::from_number(key as f64))
    }

    /// Integer-key set (1-based, any range). nil values remove.
    pub fn raw_seti(&mut self, key: i64, value: Value) {
        // Integer keys are never nil/NaN.
        let _ = self.raw_set(Value::from_number(key as f64), value);
    }

    /// String-key get.
    pub fn raw_get_str(&self, key: StrId) -> Value {
        self.hash
            .get(&TableKey::String(key))
            .copied()
            .unwrap_or(Value::nil())
    }

    /// String-key set.
    pub fn raw_set_str(&mut self, key: StrId, value: Value) {
        if value.is_nil() {
            if self.hash.contains_key(&TableKey::String(key)) {
                self.hash.insert(TableKey::String(key), value);
            }
        } else {
            self.hash.insert(TableKey::String(key), value);
        }
    }

    /// The length operator: the largest n with array[n] non-nil, found by
    /// reverse linear scan of the array part. A border, not a cardinality.
    pub fn length(&self) -> i64 {
        for i in (0..self.array.len()).rev() {
            if !self.array[i].is_nil() {
                return (i + 1) as i64;
            }
        }
        0
    }

    /// Get the next key-value pair after `key` (the pairs primitive).
    /// next(nil) starts iteration; Ok(None) ends it; Err(()) means the key
    /// was never in this table.
    #[allow(clippy::result_unit_err)]
    pub fn next(&self, key: Value) -> Result<Option<(Value, Value)>, ()> {
        if key.is_none_or_nil() {
            return Ok(self.first_from_array(0));
        }

        if let Some(i) = Self::array_index(key) {
            if i <= self.array.len() {
                return Ok(self.first_from_array(i));
            }
            // An array-range key beyond the populated part was never
            // handed out by next().
            return Err(());
        }

        let tk = match value_to_key(key) {
            Some(tk) => tk,
            None => return Err(()),
        };
        match self.hash.get_index_of(&tk) {
            Some(pos) => Ok(self.first_from_hash(pos + 1)),
            None => Err(()),
        }
    }

    /// First non-nil array entry at 0-based slot >= `start`, falling
    /// through to the hash part.
    fn first_from_array(&self, start: usize) -> Option<(Value, Value)> {
        for (j, v) in self.array.iter().enumerate().skip(start) {
            if !v.is_nil() {
                return Some((Value::from_number((j + 1) as f64), *v));
            }
        }
        self.first_from_hash(0)
    }

    /// First non-tombstone hash entry at position >= `start`.
    fn first_from_hash(&self, start: usize) -> Option<(Value, Value)> {
        for (&k, &v) in self.hash.iter().skip(start) {
            if !v.is_nil() {
                return Some((key_to_value(k), v));
            }
        }
        None
    }

    /// Iterate over the array part (GC traversal).
    pub fn array_values(&self) -> &[Value] {
        &self.array
    }

    /// Iterate over the hash part (GC traversal).
    pub fn hash_entries(&self) -> impl Iterator<Item = (&TableKey, &Value)> {
        self.hash.iter()
    }
}

/// Convert a Value to a TableKey for hash lookup.
fn value_to_key(v: Value) -> Option<TableKey> {
    if v.is_none_or_nil() {
        return None;
    }
    if let Some(f) = v.as_number() {
        if f.is_nan() {
            return None;
        }
        // Fold -0.0 into 0.0 so both address the same slot.
        let f = if f == 0.0 { 0.0 } else { f };
        return Some(TableKey::Number(f.to_bits()));
    }
    if let Some(b) = v.as_bool() {
        return Some(TableKey::Boolean(b));
    }
    if let Some(sid) = v.as_str_id() {
        return Some(TableKey::String(sid));
    }
    if v.is_gc() {
        return Some(TableKey::GcRef(v.raw_bits()));
    }
    None
}

/// Convert a TableKey back to a Value (for iteration).
fn key_to_value(k: TableKey) -> Value {
    match k {
        TableKey::Number(bits) => Value::from_number(f64::from_bits(bits)),
        TableKey::String(sid) => Value::from_str_id(sid),
        TableKey::Boolean(b) => Value::from_bool(b),
        TableKey::GcRef(bits) => Value::from_raw_bits(bits),
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.hash.len()
        )
    }
}
