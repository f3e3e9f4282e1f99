//! The constant pool and its two index modes.
//!
//! Reading resolves 1-based pool indices to values through
//! [`ConstantPool`]; index 0 is reserved: the empty string for the string
//! pool, the any-type for multinames, invalid for the numeric pools.
//!
//! Writing is a two-pass protocol driven by the [`PoolSink`] trait:
//!
//! 1. the whole file is serialized against a discarding writer with a
//!    [`PoolCounter`] sink, which records how often each poolable value is
//!    referenced (stub index 0 is returned everywhere);
//! 2. the counter is frozen into a [`PoolTable`] (pools ordered by
//!    descending frequency, ties broken by first appearance, so hot entries
//!    get the short LEB128 encodings and output is deterministic) and the
//!    file is serialized again with real bytes and real indices.
//!
//! A table can also be built directly from a pool that was just read, which
//! preserves the original index order and makes an unmodified file
//! re-serialize byte-identically.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::abc::{const_kind, ConstValue, MetadataId, Multiname, Namespace, NamespaceSet};
use crate::error::{Error, Result};
use crate::stream::{AbcReader, NullWriter, Writer};

/// The seven pool arrays of an ABC file.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    pub integers: Vec<i32>,
    pub uintegers: Vec<u32>,
    pub doubles: Vec<f64>,
    pub strings: Vec<String>,
    pub namespaces: Vec<Namespace>,
    pub ns_sets: Vec<NamespaceSet>,
    pub multinames: Vec<Multiname>,
}

impl ConstantPool {
    pub fn read(r: &mut AbcReader<'_>) -> Result<Self> {
        let mut pool = ConstantPool::default();

        let int_count = r.read_u30()?;
        for _ in 1..int_count.max(1) {
            pool.integers.push(r.read_s32()?);
        }
        let uint_count = r.read_u30()?;
        for _ in 1..uint_count.max(1) {
            pool.uintegers.push(r.read_u32()?);
        }
        let double_count = r.read_u30()?;
        for _ in 1..double_count.max(1) {
            pool.doubles.push(r.read_d64()?);
        }
        let string_count = r.read_u30()?;
        for _ in 1..string_count.max(1) {
            let len = r.read_u30()?;
            let bytes = r.read_bytes(len as usize)?;
            let s = String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::malformed("abc", "invalid utf-8 in string pool"))?;
            pool.strings.push(s);
        }
        // Namespaces reference strings, sets reference namespaces, and
        // multinames reference both; the pool order guarantees each array
        // only looks backwards.
        let namespace_count = r.read_u30()?;
        for _ in 1..namespace_count.max(1) {
            let ns = Namespace::read(r, &pool)?;
            pool.namespaces.push(ns);
        }
        let ns_set_count = r.read_u30()?;
        for _ in 1..ns_set_count.max(1) {
            let set = NamespaceSet::read(r, &pool)?;
            pool.ns_sets.push(set);
        }
        let multiname_count = r.read_u30()?;
        for _ in 1..multiname_count.max(1) {
            let mn = Multiname::read(r, &pool)?;
            pool.multinames.push(mn);
        }
        Ok(pool)
    }

    pub fn string(&self, index: u32) -> Result<&str> {
        if index == 0 {
            return Ok("");
        }
        self.strings
            .get(index as usize - 1)
            .map(String::as_str)
            .ok_or_else(|| Error::malformed("abc", format!("string index {index} out of range")))
    }

    pub fn integer(&self, index: u32) -> Result<i32> {
        self.indexed(&self.integers, index, "integer").copied()
    }

    pub fn uinteger(&self, index: u32) -> Result<u32> {
        self.indexed(&self.uintegers, index, "uinteger").copied()
    }

    pub fn double(&self, index: u32) -> Result<f64> {
        self.indexed(&self.doubles, index, "double").copied()
    }

    pub fn namespace(&self, index: u32) -> Result<&Namespace> {
        self.indexed(&self.namespaces, index, "namespace")
    }

    pub fn ns_set(&self, index: u32) -> Result<&NamespaceSet> {
        self.indexed(&self.ns_sets, index, "namespace set")
    }

    pub fn multiname(&self, index: u32) -> Result<Multiname> {
        if index == 0 {
            return Ok(Multiname::Any);
        }
        self.indexed(&self.multinames, index, "multiname").cloned()
    }

    fn indexed<'a, T>(&self, items: &'a [T], index: u32, what: &str) -> Result<&'a T> {
        if index == 0 {
            return Err(Error::malformed(
                "abc",
                format!("{what} index 0 is reserved"),
            ));
        }
        items
            .get(index as usize - 1)
            .ok_or_else(|| Error::malformed("abc", format!("{what} index {index} out of range")))
    }

    /// Resolve a (kind, index) constant reference.
    pub fn constant(&self, kind: u8, index: u32) -> Result<ConstValue> {
        Ok(match kind {
            const_kind::INT => ConstValue::Int(self.integer(index)?),
            const_kind::UINT => ConstValue::Uint(self.uinteger(index)?),
            const_kind::DOUBLE => ConstValue::Double(self.double(index)?),
            const_kind::UTF8 => ConstValue::Utf8(self.string(index)?.to_owned()),
            const_kind::TRUE => ConstValue::True,
            const_kind::FALSE => ConstValue::False,
            const_kind::NULL => ConstValue::Null,
            const_kind::UNDEFINED => ConstValue::Undefined,
            _ => {
                // The remaining legal kinds are the namespace kind bytes.
                ConstValue::Namespace(self.namespace(index)?.clone())
            }
        })
    }
}

/// Write-side pool access. Implemented by the counting pass and the
/// finalized table; entity serialization code is written once against this.
pub trait PoolSink {
    fn string_index(&mut self, value: &str) -> u32;
    fn int_index(&mut self, value: i32) -> u32;
    fn uint_index(&mut self, value: u32) -> u32;
    fn double_index(&mut self, value: f64) -> u32;
    fn namespace_index(&mut self, value: &Namespace) -> u32;
    fn ns_set_index(&mut self, value: &NamespaceSet) -> u32;
    fn multiname_index(&mut self, value: &Multiname) -> u32;
    fn metadata_index(&mut self, id: MetadataId) -> u32;

    /// (kind byte, pool index) for a constant value. Valueless kinds encode
    /// their kind byte as the index so the reference is non-zero.
    fn constant_index(&mut self, value: &ConstValue) -> (u8, u32) {
        match value {
            ConstValue::Int(v) => (const_kind::INT, self.int_index(*v)),
            ConstValue::Uint(v) => (const_kind::UINT, self.uint_index(*v)),
            ConstValue::Double(v) => (const_kind::DOUBLE, self.double_index(*v)),
            ConstValue::Utf8(v) => (const_kind::UTF8, self.string_index(v)),
            ConstValue::True => (const_kind::TRUE, const_kind::TRUE as u32),
            ConstValue::False => (const_kind::FALSE, const_kind::FALSE as u32),
            ConstValue::Null => (const_kind::NULL, const_kind::NULL as u32),
            ConstValue::Undefined => (const_kind::UNDEFINED, 0),
            ConstValue::Namespace(ns) => (ns.kind() as u8, self.namespace_index(ns)),
        }
    }

    /// Emit the constant pool itself. A no-op during the counting pass.
    fn write_pool(&mut self, w: &mut dyn Writer);
}

/// Reference-frequency recorder for the first serialization pass.
///
/// Registering a composite value also registers everything it references:
/// a multiname its name string and namespace (set), a set its members, a
/// namespace its name, by writing the value to the discarding stream with
/// this counter as the sink.
#[derive(Default)]
pub struct PoolCounter {
    strings: IndexMap<String, u32>,
    integers: IndexMap<i32, u32>,
    uintegers: IndexMap<u32, u32>,
    doubles: IndexMap<u64, u32>,
    namespaces: IndexMap<Namespace, u32>,
    ns_sets: IndexMap<NamespaceSet, u32>,
    multinames: IndexMap<Multiname, u32>,
}

impl PoolSink for PoolCounter {
    fn string_index(&mut self, value: &str) -> u32 {
        if let Some(count) = self.strings.get_mut(value) {
            *count += 1;
        } else {
            self.strings.insert(value.to_owned(), 1);
        }
        0
    }

    fn int_index(&mut self, value: i32) -> u32 {
        *self.integers.entry(value).or_insert(0) += 1;
        0
    }

    fn uint_index(&mut self, value: u32) -> u32 {
        *self.uintegers.entry(value).or_insert(0) += 1;
        0
    }

    fn double_index(&mut self, value: f64) -> u32 {
        *self.doubles.entry(value.to_bits()).or_insert(0) += 1;
        0
    }

    fn namespace_index(&mut self, value: &Namespace) -> u32 {
        if let Some(count) = self.namespaces.get_mut(value) {
            *count += 1;
        } else {
            self.namespaces.insert(value.clone(), 1);
        }
        // Each reference also counts the parts, so a hot multiname keeps
        // its strings hot too.
        value.write(&mut NullWriter, self);
        0
    }

    fn ns_set_index(&mut self, value: &NamespaceSet) -> u32 {
        if let Some(count) = self.ns_sets.get_mut(value) {
            *count += 1;
        } else {
            self.ns_sets.insert(value.clone(), 1);
        }
        value.write(&mut NullWriter, self);
        0
    }

    fn multiname_index(&mut self, value: &Multiname) -> u32 {
        if matches!(value, Multiname::Any) {
            return 0;
        }
        if let Some(count) = self.multinames.get_mut(value) {
            *count += 1;
        } else {
            self.multinames.insert(value.clone(), 1);
        }
        value.write(&mut NullWriter, self);
        0
    }

    fn metadata_index(&mut self, _id: MetadataId) -> u32 {
        0
    }

    fn write_pool(&mut self, _w: &mut dyn Writer) {}
}

/// Frozen pool with value → index lookup, for the second pass.
pub struct PoolTable {
    pool: ConstantPool,
    strings: HashMap<String, u32>,
    integers: HashMap<i32, u32>,
    uintegers: HashMap<u32, u32>,
    doubles: HashMap<u64, u32>,
    namespaces: HashMap<Namespace, u32>,
    ns_sets: HashMap<NamespaceSet, u32>,
    multinames: HashMap<Multiname, u32>,
}

fn by_descending_count<T>(map: IndexMap<T, u32>) -> Vec<T> {
    let mut entries: Vec<(usize, T, u32)> = map
        .into_iter()
        .enumerate()
        .map(|(seen, (value, count))| (seen, value, count))
        .collect();
    entries.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
    entries.into_iter().map(|(_, value, _)| value).collect()
}

fn index_of<T: std::hash::Hash + Eq + Clone>(items: &[T]) -> HashMap<T, u32> {
    items
        .iter()
        .enumerate()
        .map(|(i, v)| (v.clone(), i as u32 + 1))
        .collect()
}

impl PoolTable {
    /// Order the counted values into a pool: descending frequency, ties by
    /// first appearance.
    pub fn from_counter(counter: PoolCounter) -> Self {
        let pool = ConstantPool {
            integers: by_descending_count(counter.integers),
            uintegers: by_descending_count(counter.uintegers),
            doubles: by_descending_count(counter.doubles)
                .into_iter()
                .map(f64::from_bits)
                .collect(),
            strings: by_descending_count(counter.strings),
            namespaces: by_descending_count(counter.namespaces),
            ns_sets: by_descending_count(counter.ns_sets),
            multinames: by_descending_count(counter.multinames),
        };
        Self::from_pool(pool)
    }

    /// Use an existing pool verbatim, preserving its index order.
    pub fn from_pool(pool: ConstantPool) -> Self {
        Self {
            strings: index_of(&pool.strings),
            integers: index_of(&pool.integers),
            uintegers: index_of(&pool.uintegers),
            doubles: pool
                .doubles
                .iter()
                .enumerate()
                .map(|(i, v)| (v.to_bits(), i as u32 + 1))
                .collect(),
            namespaces: index_of(&pool.namespaces),
            ns_sets: index_of(&pool.ns_sets),
            multinames: index_of(&pool.multinames),
            pool,
        }
    }

    pub fn pool(&self) -> &ConstantPool {
        &self.pool
    }
}

fn interned<T: std::hash::Hash + Eq + std::fmt::Debug>(map: &HashMap<T, u32>, value: &T) -> u32 {
    *map.get(value)
        .unwrap_or_else(|| panic!("value not interned by the counting pass: {value:?}"))
}

impl PoolSink for PoolTable {
    fn string_index(&mut self, value: &str) -> u32 {
        *self
            .strings
            .get(value)
            .unwrap_or_else(|| panic!("string not interned by the counting pass: {value:?}"))
    }

    fn int_index(&mut self, value: i32) -> u32 {
        interned(&self.integers, &value)
    }

    fn uint_index(&mut self, value: u32) -> u32 {
        interned(&self.uintegers, &value)
    }

    fn double_index(&mut self, value: f64) -> u32 {
        interned(&self.doubles, &value.to_bits())
    }

    fn namespace_index(&mut self, value: &Namespace) -> u32 {
        interned(&self.namespaces, value)
    }

    fn ns_set_index(&mut self, value: &NamespaceSet) -> u32 {
        interned(&self.ns_sets, value)
    }

    fn multiname_index(&mut self, value: &Multiname) -> u32 {
        if matches!(value, Multiname::Any) {
            return 0;
        }
        interned(&self.multinames, value)
    }

    fn metadata_index(&mut self, id: MetadataId) -> u32 {
        id.0
    }

    fn write_pool(&mut self, w: &mut dyn Writer) {
        // Non-empty pools lead with count n+1; empty ones with a single 0.
        fn count_prefix(w: &mut dyn Writer, len: usize) {
            if len == 0 {
                w.write_u30(0);
            } else {
                w.write_u30(len as u32 + 1);
            }
        }
        let pool = self.pool.clone();
        count_prefix(w, pool.integers.len());
        for v in &pool.integers {
            w.write_s32(*v);
        }
        count_prefix(w, pool.uintegers.len());
        for v in &pool.uintegers {
            w.write_u32(*v);
        }
        count_prefix(w, pool.doubles.len());
        for v in &pool.doubles {
            w.write_d64(*v);
        }
        count_prefix(w, pool.strings.len());
        for v in &pool.strings {
            w.write_u30(v.len() as u32);
            w.write_bytes(v.as_bytes());
        }
        count_prefix(w, pool.namespaces.len());
        for v in &pool.namespaces {
            v.write(w, self);
        }
        count_prefix(w, pool.ns_sets.len());
        for v in &pool.ns_sets {
            v.write(w, self);
        }
        count_prefix(w, pool.multinames.len());
        for v in &pool.multinames {
            v.write(w, self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::AbcWriter;

    #[test]
    fn counting_a_multiname_registers_its_parts() {
        let mut counter = PoolCounter::default();
        let mn = Multiname::package("flash.display", "Sprite");
        counter.multiname_index(&mn);
        let table = PoolTable::from_counter(counter);
        let pool = table.pool();
        assert!(pool.strings.iter().any(|s| s == "flash.display"));
        assert!(pool.strings.iter().any(|s| s == "Sprite"));
        assert_eq!(pool.namespaces.len(), 1);
        assert_eq!(pool.multinames.len(), 1);
    }

    #[test]
    fn equal_values_collapse_to_one_entry() {
        let mut counter = PoolCounter::default();
        counter.string_index("x");
        counter.string_index("x");
        counter.string_index("y");
        let table = PoolTable::from_counter(counter);
        assert_eq!(table.pool().strings, vec!["x".to_owned(), "y".to_owned()]);
    }

    #[test]
    fn hot_entries_come_first() {
        let mut counter = PoolCounter::default();
        counter.int_index(10);
        counter.int_index(20);
        counter.int_index(20);
        counter.int_index(20);
        counter.int_index(30);
        let mut table = PoolTable::from_counter(counter);
        assert_eq!(table.pool().integers, vec![20, 10, 30]);
        assert_eq!(table.int_index(20), 1);
        assert_eq!(table.int_index(10), 2);
    }

    #[test]
    fn ties_break_by_first_appearance() {
        let mut counter = PoolCounter::default();
        counter.string_index("b");
        counter.string_index("a");
        counter.string_index("c");
        let table = PoolTable::from_counter(counter);
        assert_eq!(
            table.pool().strings,
            vec!["b".to_owned(), "a".to_owned(), "c".to_owned()]
        );
    }

    #[test]
    fn string_zero_is_the_empty_string() {
        let pool = ConstantPool::default();
        assert_eq!(pool.string(0).unwrap(), "");
        assert!(matches!(pool.multiname(0).unwrap(), Multiname::Any));
        assert!(pool.integer(0).is_err());
        assert!(pool.namespace(0).is_err());
    }

    #[test]
    fn empty_pools_encode_as_a_single_zero() {
        let mut table = PoolTable::from_pool(ConstantPool::default());
        let mut w = AbcWriter::new();
        table.write_pool(&mut w);
        assert_eq!(w.as_slice(), &[0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn pool_roundtrips_through_bytes() {
        let mut counter = PoolCounter::default();
        counter.int_index(-5);
        counter.uint_index(7);
        counter.double_index(1.25);
        counter.multiname_index(&Multiname::subscript());
        counter.multiname_index(&Multiname::qname("go"));
        let mut table = PoolTable::from_counter(counter);
        let mut w = AbcWriter::new();
        table.write_pool(&mut w);
        let back = ConstantPool::read(&mut AbcReader::new(w.as_slice())).unwrap();
        assert_eq!(back.integers, vec![-5]);
        assert_eq!(back.uintegers, vec![7]);
        assert_eq!(back.doubles, vec![1.25]);
        assert_eq!(back.multinames.len(), 2);
        assert_eq!(back.ns_sets.len(), 1);
    }

    #[test]
    fn nan_doubles_intern_by_bit_pattern() {
        let mut counter = PoolCounter::default();
        counter.double_index(f64::NAN);
        counter.double_index(f64::NAN);
        let table = PoolTable::from_counter(counter);
        assert_eq!(table.pool().doubles.len(), 1);
        assert!(table.pool().doubles[0].is_nan());
    }
}
