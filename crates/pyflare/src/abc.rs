//! In-memory model of the ABC file format.
//!
//! Every entity the format defines (namespaces, multinames, methods,
//! metadata, instances, classes, scripts, method bodies, exception handlers,
//! traits) is a plain value here, and knows how to read itself from a
//! stream (resolving pool references through the [`ConstantPool`]) and how
//! to write itself (interning references through a [`PoolSink`]).
//!
//! Cross-references between tables use positional ids ([`MethodId`],
//! [`ClassId`], [`MetadataId`]); tables are append-only, so an id handed out
//! stays valid for the life of the file. `class_info[i]` and
//! `instance_info[i]` describe the same class.
//!
//! Serialization runs the same code twice: once against a discarding writer
//! while a counting sink observes every pool reference, then against the
//! real buffer with finalized indices. See `pool` for the two sinks.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::asm;
use crate::error::{Error, Result};
use crate::ops::{Label, Op};
use crate::pool::{ConstantPool, PoolCounter, PoolSink, PoolTable};
use crate::stream::{AbcReader, AbcWriter, NullWriter, Writer};

/// Position of a method in `AbcFile::methods` (and the operand of
/// `newfunction`/`callstatic`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub u32);

/// Position of a class in `AbcFile::classes`/`instances`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// Position of a metadata entry in `AbcFile::metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataId(pub u32);

/// One-byte kind tags for namespace pool entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum NamespaceKind {
    Private = 0x05,
    Namespace = 0x08,
    Package = 0x16,
    PackageInternal = 0x17,
    Protected = 0x18,
    Explicit = 0x19,
    StaticProtected = 0x1a,
}

/// A namespace: one of seven kinds plus a name (the empty string names the
/// unnamed package). Equality is (kind, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    User(String),
    Package(String),
    PackageInternal(String),
    Protected(String),
    Explicit(String),
    StaticProtected(String),
    Private(String),
}

impl Namespace {
    /// The unnamed public package.
    pub fn public() -> Self {
        Namespace::Package(String::new())
    }

    pub fn kind(&self) -> NamespaceKind {
        match self {
            Namespace::User(_) => NamespaceKind::Namespace,
            Namespace::Package(_) => NamespaceKind::Package,
            Namespace::PackageInternal(_) => NamespaceKind::PackageInternal,
            Namespace::Protected(_) => NamespaceKind::Protected,
            Namespace::Explicit(_) => NamespaceKind::Explicit,
            Namespace::StaticProtected(_) => NamespaceKind::StaticProtected,
            Namespace::Private(_) => NamespaceKind::Private,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Namespace::User(n)
            | Namespace::Package(n)
            | Namespace::PackageInternal(n)
            | Namespace::Protected(n)
            | Namespace::Explicit(n)
            | Namespace::StaticProtected(n)
            | Namespace::Private(n) => n,
        }
    }

    pub fn from_kind(kind: NamespaceKind, name: String) -> Self {
        match kind {
            NamespaceKind::Namespace => Namespace::User(name),
            NamespaceKind::Package => Namespace::Package(name),
            NamespaceKind::PackageInternal => Namespace::PackageInternal(name),
            NamespaceKind::Protected => Namespace::Protected(name),
            NamespaceKind::Explicit => Namespace::Explicit(name),
            NamespaceKind::StaticProtected => Namespace::StaticProtected(name),
            NamespaceKind::Private => Namespace::Private(name),
        }
    }

    pub fn read(r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Self> {
        let byte = r.read_u8()?;
        let kind = NamespaceKind::try_from(byte)
            .map_err(|_| Error::malformed("abc", format!("unknown namespace kind 0x{byte:02x}")))?;
        let name = pool.string(r.read_u30()?)?.to_owned();
        Ok(Self::from_kind(kind, name))
    }

    pub fn write(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) {
        w.write_u8(self.kind() as u8);
        w.write_u30(pool.string_index(self.name()));
    }
}

/// An ordered set of namespaces, referenced by the `Multiname`/`MultinameL`
/// variants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceSet(pub Vec<Namespace>);

impl NamespaceSet {
    /// The set containing only the unnamed public package, which is the
    /// lookup set for runtime-name subscripts.
    pub fn public() -> Self {
        NamespaceSet(vec![Namespace::public()])
    }

    pub fn read(r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Self> {
        let count = r.read_u30()?;
        let mut ns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ns.push(pool.namespace(r.read_u30()?)?.clone());
        }
        Ok(NamespaceSet(ns))
    }

    pub fn write(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) {
        w.write_u30(self.0.len() as u32);
        for ns in &self.0 {
            w.write_u30(pool.namespace_index(ns));
        }
    }
}

/// One-byte kind tags for multiname pool entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MultinameKind {
    QName = 0x07,
    QNameA = 0x0d,
    Multiname = 0x09,
    MultinameA = 0x0e,
    RtqName = 0x0f,
    RtqNameA = 0x10,
    RtqNameL = 0x11,
    RtqNameLA = 0x12,
    MultinameL = 0x1b,
    MultinameLA = 0x1c,
}

/// A qualified name whose namespace-resolution policy is tagged.
///
/// The `A` variants are the attribute forms. `Any` is the reserved pool
/// index 0: the any-type as a type annotation, the catch-all as an
/// exception type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Multiname {
    Any,
    QName { ns: Namespace, name: String },
    QNameA { ns: Namespace, name: String },
    RtqName { name: String },
    RtqNameA { name: String },
    RtqNameL,
    RtqNameLA,
    Multiname { name: String, ns_set: NamespaceSet },
    MultinameA { name: String, ns_set: NamespaceSet },
    MultinameL { ns_set: NamespaceSet },
    MultinameLA { ns_set: NamespaceSet },
}

impl Multiname {
    /// A `QName` in the unnamed public package.
    pub fn qname(name: impl Into<String>) -> Self {
        Multiname::QName {
            ns: Namespace::public(),
            name: name.into(),
        }
    }

    /// A `QName` in the named package.
    pub fn package(pkg: impl Into<String>, name: impl Into<String>) -> Self {
        Multiname::QName {
            ns: Namespace::Package(pkg.into()),
            name: name.into(),
        }
    }

    /// The `MultinameL` over the public namespace set: the name used for
    /// every subscript access, where the property name flows through the
    /// stack.
    pub fn subscript() -> Self {
        Multiname::MultinameL {
            ns_set: NamespaceSet::public(),
        }
    }

    pub fn kind(&self) -> Option<MultinameKind> {
        Some(match self {
            Multiname::Any => return None,
            Multiname::QName { .. } => MultinameKind::QName,
            Multiname::QNameA { .. } => MultinameKind::QNameA,
            Multiname::RtqName { .. } => MultinameKind::RtqName,
            Multiname::RtqNameA { .. } => MultinameKind::RtqNameA,
            Multiname::RtqNameL => MultinameKind::RtqNameL,
            Multiname::RtqNameLA => MultinameKind::RtqNameLA,
            Multiname::Multiname { .. } => MultinameKind::Multiname,
            Multiname::MultinameA { .. } => MultinameKind::MultinameA,
            Multiname::MultinameL { .. } => MultinameKind::MultinameL,
            Multiname::MultinameLA { .. } => MultinameKind::MultinameLA,
        })
    }

    /// The compile-time local name, when the variant has one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Multiname::QName { name, .. }
            | Multiname::QNameA { name, .. }
            | Multiname::RtqName { name }
            | Multiname::RtqNameA { name }
            | Multiname::Multiname { name, .. }
            | Multiname::MultinameA { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The compile-time namespace, for the fully qualified variants.
    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            Multiname::QName { ns, .. } | Multiname::QNameA { ns, .. } => Some(ns),
            _ => None,
        }
    }

    /// How many name parts a property-accessing instruction takes from the
    /// runtime stack for this variant, on top of the receiver.
    pub fn runtime_args(&self) -> u32 {
        match self {
            Multiname::Any
            | Multiname::QName { .. }
            | Multiname::QNameA { .. }
            | Multiname::Multiname { .. }
            | Multiname::MultinameA { .. } => 0,
            Multiname::RtqName { .. }
            | Multiname::RtqNameA { .. }
            | Multiname::MultinameL { .. }
            | Multiname::MultinameLA { .. } => 1,
            Multiname::RtqNameL | Multiname::RtqNameLA => 2,
        }
    }

    pub fn read(r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Self> {
        let byte = r.read_u8()?;
        let kind = MultinameKind::try_from(byte)
            .map_err(|_| Error::malformed("abc", format!("unknown multiname kind 0x{byte:02x}")))?;
        Ok(match kind {
            MultinameKind::QName | MultinameKind::QNameA => {
                let ns = pool.namespace(r.read_u30()?)?.clone();
                let name = pool.string(r.read_u30()?)?.to_owned();
                if kind == MultinameKind::QName {
                    Multiname::QName { ns, name }
                } else {
                    Multiname::QNameA { ns, name }
                }
            }
            MultinameKind::RtqName | MultinameKind::RtqNameA => {
                let name = pool.string(r.read_u30()?)?.to_owned();
                if kind == MultinameKind::RtqName {
                    Multiname::RtqName { name }
                } else {
                    Multiname::RtqNameA { name }
                }
            }
            MultinameKind::RtqNameL => Multiname::RtqNameL,
            MultinameKind::RtqNameLA => Multiname::RtqNameLA,
            MultinameKind::Multiname | MultinameKind::MultinameA => {
                let name = pool.string(r.read_u30()?)?.to_owned();
                let ns_set = pool.ns_set(r.read_u30()?)?.clone();
                if kind == MultinameKind::Multiname {
                    Multiname::Multiname { name, ns_set }
                } else {
                    Multiname::MultinameA { name, ns_set }
                }
            }
            MultinameKind::MultinameL | MultinameKind::MultinameLA => {
                let ns_set = pool.ns_set(r.read_u30()?)?.clone();
                if kind == MultinameKind::MultinameL {
                    Multiname::MultinameL { ns_set }
                } else {
                    Multiname::MultinameLA { ns_set }
                }
            }
        })
    }

    pub fn write(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) {
        let kind = self
            .kind()
            .expect("the any-type has no pool entry to write");
        w.write_u8(kind as u8);
        match self {
            Multiname::QName { ns, name } | Multiname::QNameA { ns, name } => {
                w.write_u30(pool.namespace_index(ns));
                w.write_u30(pool.string_index(name));
            }
            Multiname::RtqName { name } | Multiname::RtqNameA { name } => {
                w.write_u30(pool.string_index(name));
            }
            Multiname::RtqNameL | Multiname::RtqNameLA => {}
            Multiname::Multiname { name, ns_set } | Multiname::MultinameA { name, ns_set } => {
                w.write_u30(pool.string_index(name));
                w.write_u30(pool.ns_set_index(ns_set));
            }
            Multiname::MultinameL { ns_set } | Multiname::MultinameLA { ns_set } => {
                w.write_u30(pool.ns_set_index(ns_set));
            }
            Multiname::Any => unreachable!(),
        }
    }
}

/// One-byte kind tags for constant values (option defaults, slot values).
pub mod const_kind {
    pub const UTF8: u8 = 0x01;
    pub const INT: u8 = 0x03;
    pub const UINT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x06;
    pub const FALSE: u8 = 0x0a;
    pub const TRUE: u8 = 0x0b;
    pub const NULL: u8 = 0x0c;
    pub const UNDEFINED: u8 = 0x00;
}

/// A constant value: a default for an optional parameter or a slot initial
/// value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i32),
    Uint(u32),
    Double(f64),
    Utf8(String),
    True,
    False,
    Null,
    Undefined,
    Namespace(Namespace),
}

impl ConstValue {
    pub fn kind(&self) -> u8 {
        match self {
            ConstValue::Int(_) => const_kind::INT,
            ConstValue::Uint(_) => const_kind::UINT,
            ConstValue::Double(_) => const_kind::DOUBLE,
            ConstValue::Utf8(_) => const_kind::UTF8,
            ConstValue::True => const_kind::TRUE,
            ConstValue::False => const_kind::FALSE,
            ConstValue::Null => const_kind::NULL,
            ConstValue::Undefined => const_kind::UNDEFINED,
            ConstValue::Namespace(ns) => ns.kind() as u8,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MethodFlags: u8 {
        const NEED_ARGUMENTS = 0x01;
        const NEED_ACTIVATION = 0x02;
        const NEED_REST = 0x04;
        const HAS_OPTIONAL = 0x08;
        const SET_DXNS = 0x40;
        const HAS_PARAM_NAMES = 0x80;
    }
}

/// A callable's signature.
#[derive(Debug, Clone, Default)]
pub struct MethodInfo {
    pub param_types: Vec<Multiname>,
    pub return_type: Multiname,
    pub name: String,
    pub flags: MethodFlags,
    pub options: Vec<ConstValue>,
    pub param_names: Vec<String>,
}

impl Default for Multiname {
    fn default() -> Self {
        Multiname::Any
    }
}

impl MethodInfo {
    pub fn read(r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Self> {
        let param_count = r.read_u30()?;
        let return_type = pool.multiname(r.read_u30()?)?;
        let mut param_types = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            param_types.push(pool.multiname(r.read_u30()?)?);
        }
        let name = pool.string(r.read_u30()?)?.to_owned();
        let flags = MethodFlags::from_bits_truncate(r.read_u8()?);
        let mut options = Vec::new();
        if flags.contains(MethodFlags::HAS_OPTIONAL) {
            let option_count = r.read_u30()?;
            for _ in 0..option_count {
                let index = r.read_u30()?;
                let kind = r.read_u8()?;
                options.push(pool.constant(kind, index)?);
            }
        }
        let mut param_names = Vec::new();
        if flags.contains(MethodFlags::HAS_PARAM_NAMES) {
            for _ in 0..param_count {
                param_names.push(pool.string(r.read_u30()?)?.to_owned());
            }
        }
        Ok(Self {
            param_types,
            return_type,
            name,
            flags,
            options,
            param_names,
        })
    }

    pub fn write(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) {
        w.write_u30(self.param_types.len() as u32);
        w.write_u30(pool.multiname_index(&self.return_type));
        for param in &self.param_types {
            w.write_u30(pool.multiname_index(param));
        }
        w.write_u30(pool.string_index(&self.name));
        let mut flags = self.flags;
        flags.set(MethodFlags::HAS_OPTIONAL, !self.options.is_empty());
        flags.set(MethodFlags::HAS_PARAM_NAMES, !self.param_names.is_empty());
        w.write_u8(flags.bits());
        if !self.options.is_empty() {
            w.write_u30(self.options.len() as u32);
            for option in &self.options {
                let (kind, index) = pool.constant_index(option);
                w.write_u30(index);
                w.write_u8(kind);
            }
        }
        if !self.param_names.is_empty() {
            assert_eq!(self.param_names.len(), self.param_types.len());
            for name in &self.param_names {
                w.write_u30(pool.string_index(name));
            }
        }
    }
}

/// A metadata entry: a name plus key/value items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Metadata {
    pub name: String,
    pub items: Vec<(String, String)>,
}

impl Metadata {
    /// Look up an item value by key.
    pub fn item(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn read(r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Self> {
        let name = pool.string(r.read_u30()?)?.to_owned();
        let item_count = r.read_u30()?;
        let mut items = Vec::with_capacity(item_count as usize);
        for _ in 0..item_count {
            let key = pool.string(r.read_u30()?)?.to_owned();
            let value = pool.string(r.read_u30()?)?.to_owned();
            items.push((key, value));
        }
        Ok(Self { name, items })
    }

    pub fn write(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) {
        w.write_u30(pool.string_index(&self.name));
        w.write_u30(self.items.len() as u32);
        for (key, value) in &self.items {
            w.write_u30(pool.string_index(key));
            w.write_u30(pool.string_index(value));
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TraitAttrs: u8 {
        const FINAL = 0x01;
        const OVERRIDE = 0x02;
        const METADATA = 0x04;
    }
}

/// The payload of a trait, discriminated by the low nibble of the trait's
/// attribute byte.
#[derive(Debug, Clone, PartialEq)]
pub enum TraitKind {
    Slot {
        slot_id: u32,
        type_name: Multiname,
        value: Option<ConstValue>,
    },
    Method {
        disp_id: u32,
        method: MethodId,
    },
    Getter {
        disp_id: u32,
        method: MethodId,
    },
    Setter {
        disp_id: u32,
        method: MethodId,
    },
    Class {
        slot_id: u32,
        class: ClassId,
    },
    Function {
        disp_id: u32,
        method: MethodId,
    },
    Const {
        slot_id: u32,
        type_name: Multiname,
        value: Option<ConstValue>,
    },
}

impl TraitKind {
    /// An untyped field slot with an automatic id.
    pub fn slot() -> Self {
        TraitKind::Slot {
            slot_id: 0,
            type_name: Multiname::Any,
            value: None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            TraitKind::Slot { .. } => 0,
            TraitKind::Method { .. } => 1,
            TraitKind::Getter { .. } => 2,
            TraitKind::Setter { .. } => 3,
            TraitKind::Class { .. } => 4,
            TraitKind::Function { .. } => 5,
            TraitKind::Const { .. } => 6,
        }
    }
}

/// A named member of a class, instance, script, or method body.
#[derive(Debug, Clone, PartialEq)]
pub struct Trait {
    pub name: Multiname,
    pub attr: TraitAttrs,
    pub kind: TraitKind,
    pub metadata: Vec<MetadataId>,
}

impl Trait {
    pub fn new(name: Multiname, kind: TraitKind) -> Self {
        Self {
            name,
            attr: TraitAttrs::empty(),
            kind,
            metadata: Vec::new(),
        }
    }

    pub fn read(r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Self> {
        let name = pool.multiname(r.read_u30()?)?;
        let byte = r.read_u8()?;
        let tag = byte & 0x0f;
        let attr = TraitAttrs::from_bits_truncate(byte >> 4);
        let slot_payload = |r: &mut AbcReader<'_>| -> Result<(u32, Multiname, Option<ConstValue>)> {
            let slot_id = r.read_u30()?;
            let type_name = pool.multiname(r.read_u30()?)?;
            let vindex = r.read_u30()?;
            let value = if vindex != 0 {
                let vkind = r.read_u8()?;
                Some(pool.constant(vkind, vindex)?)
            } else {
                None
            };
            Ok((slot_id, type_name, value))
        };
        let method_payload = |r: &mut AbcReader<'_>| -> Result<(u32, MethodId)> {
            Ok((r.read_u30()?, MethodId(r.read_u30()?)))
        };
        let kind = match tag {
            0 => {
                let (slot_id, type_name, value) = slot_payload(r)?;
                TraitKind::Slot {
                    slot_id,
                    type_name,
                    value,
                }
            }
            6 => {
                let (slot_id, type_name, value) = slot_payload(r)?;
                TraitKind::Const {
                    slot_id,
                    type_name,
                    value,
                }
            }
            1 => {
                let (disp_id, method) = method_payload(r)?;
                TraitKind::Method { disp_id, method }
            }
            2 => {
                let (disp_id, method) = method_payload(r)?;
                TraitKind::Getter { disp_id, method }
            }
            3 => {
                let (disp_id, method) = method_payload(r)?;
                TraitKind::Setter { disp_id, method }
            }
            4 => TraitKind::Class {
                slot_id: r.read_u30()?,
                class: ClassId(r.read_u30()?),
            },
            5 => {
                let (disp_id, method) = method_payload(r)?;
                TraitKind::Function { disp_id, method }
            }
            _ => {
                return Err(Error::malformed(
                    "abc",
                    format!("unknown trait kind {tag}"),
                ))
            }
        };
        let mut metadata = Vec::new();
        if attr.contains(TraitAttrs::METADATA) {
            let count = r.read_u30()?;
            for _ in 0..count {
                metadata.push(MetadataId(r.read_u30()?));
            }
        }
        Ok(Self {
            name,
            attr,
            kind,
            metadata,
        })
    }

    pub fn write(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) {
        w.write_u30(pool.multiname_index(&self.name));
        let mut attr = self.attr;
        attr.set(TraitAttrs::METADATA, !self.metadata.is_empty());
        w.write_u8(self.kind.tag() | (attr.bits() << 4));
        match &self.kind {
            TraitKind::Slot {
                slot_id,
                type_name,
                value,
            }
            | TraitKind::Const {
                slot_id,
                type_name,
                value,
            } => {
                w.write_u30(*slot_id);
                w.write_u30(pool.multiname_index(type_name));
                match value {
                    Some(value) => {
                        let (kind, index) = pool.constant_index(value);
                        w.write_u30(index);
                        w.write_u8(kind);
                    }
                    None => w.write_u30(0),
                }
            }
            TraitKind::Method { disp_id, method }
            | TraitKind::Getter { disp_id, method }
            | TraitKind::Setter { disp_id, method }
            | TraitKind::Function { disp_id, method } => {
                w.write_u30(*disp_id);
                w.write_u30(method.0);
            }
            TraitKind::Class { slot_id, class } => {
                w.write_u30(*slot_id);
                w.write_u30(class.0);
            }
        }
        if !self.metadata.is_empty() {
            w.write_u30(self.metadata.len() as u32);
            for id in &self.metadata {
                w.write_u30(pool.metadata_index(*id));
            }
        }
    }
}

fn read_traits(r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Vec<Trait>> {
    let count = r.read_u30()?;
    let mut traits = Vec::with_capacity(count as usize);
    for _ in 0..count {
        traits.push(Trait::read(r, pool)?);
    }
    Ok(traits)
}

fn write_traits(traits: &[Trait], w: &mut dyn Writer, pool: &mut dyn PoolSink) {
    w.write_u30(traits.len() as u32);
    for t in traits {
        t.write(w, pool);
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstanceFlags: u8 {
        const SEALED = 0x01;
        const FINAL = 0x02;
        const INTERFACE = 0x04;
        const PROTECTED_NS = 0x08;
    }
}

/// Object layout of a class: name, base, interfaces, instance initializer
/// and instance traits.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub name: Multiname,
    pub super_name: Multiname,
    pub flags: InstanceFlags,
    pub protected_ns: Option<Namespace>,
    pub interfaces: Vec<Multiname>,
    pub iinit: MethodId,
    pub traits: Vec<Trait>,
}

impl InstanceInfo {
    pub fn read(r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Self> {
        let name = pool.multiname(r.read_u30()?)?;
        let super_name = pool.multiname(r.read_u30()?)?;
        let flags = InstanceFlags::from_bits_truncate(r.read_u8()?);
        let protected_ns = if flags.contains(InstanceFlags::PROTECTED_NS) {
            Some(pool.namespace(r.read_u30()?)?.clone())
        } else {
            None
        };
        let interface_count = r.read_u30()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(pool.multiname(r.read_u30()?)?);
        }
        let iinit = MethodId(r.read_u30()?);
        let traits = read_traits(r, pool)?;
        Ok(Self {
            name,
            super_name,
            flags,
            protected_ns,
            interfaces,
            iinit,
            traits,
        })
    }

    pub fn write(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) {
        w.write_u30(pool.multiname_index(&self.name));
        w.write_u30(pool.multiname_index(&self.super_name));
        let mut flags = self.flags;
        flags.set(InstanceFlags::PROTECTED_NS, self.protected_ns.is_some());
        w.write_u8(flags.bits());
        if let Some(ns) = &self.protected_ns {
            w.write_u30(pool.namespace_index(ns));
        }
        w.write_u30(self.interfaces.len() as u32);
        for iface in &self.interfaces {
            w.write_u30(pool.multiname_index(iface));
        }
        w.write_u30(self.iinit.0);
        write_traits(&self.traits, w, pool);
    }
}

/// The class object itself: static initializer and static traits.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub cinit: MethodId,
    pub traits: Vec<Trait>,
}

impl ClassInfo {
    pub fn read(r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Self> {
        let cinit = MethodId(r.read_u30()?);
        let traits = read_traits(r, pool)?;
        Ok(Self { cinit, traits })
    }

    pub fn write(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) {
        w.write_u30(self.cinit.0);
        write_traits(&self.traits, w, pool);
    }
}

/// A top-level unit: its initializer method and the traits it publishes.
#[derive(Debug, Clone)]
pub struct ScriptInfo {
    pub init: MethodId,
    pub traits: Vec<Trait>,
}

impl ScriptInfo {
    pub fn read(r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Self> {
        let init = MethodId(r.read_u30()?);
        let traits = read_traits(r, pool)?;
        Ok(Self { init, traits })
    }

    pub fn write(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) {
        w.write_u30(self.init.0);
        write_traits(&self.traits, w, pool);
    }
}

/// An exception-table entry. On disk the three positions are byte offsets;
/// in memory they are labels shared with the body's instruction list, so
/// handlers survive reassembly untouched.
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    pub from: Label,
    pub to: Label,
    pub target: Label,
    pub exc_type: Multiname,
    pub var_name: Option<Multiname>,
}

/// Exception-table entry as read off the wire, offsets not yet resolved to
/// labels.
#[derive(Debug, Clone)]
pub struct RawException {
    pub from: u32,
    pub to: u32,
    pub target: u32,
    pub exc_type: Multiname,
    pub var_name: Option<Multiname>,
}

/// A method body: limits, bytecode, exception table, and the traits
/// declared inside the method (closure slots).
#[derive(Debug, Clone)]
pub struct MethodBody {
    pub method: MethodId,
    pub max_stack: u32,
    pub local_count: u32,
    pub init_scope_depth: u32,
    pub max_scope_depth: u32,
    pub code: Vec<Op>,
    pub exceptions: Vec<ExceptionHandler>,
    pub traits: Vec<Trait>,
}

impl MethodBody {
    pub fn read(r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Self> {
        let method = MethodId(r.read_u30()?);
        let max_stack = r.read_u30()?;
        let local_count = r.read_u30()?;
        let init_scope_depth = r.read_u30()?;
        let max_scope_depth = r.read_u30()?;
        let code_len = r.read_u30()?;
        let code_bytes = r.read_bytes(code_len as usize)?;
        let exception_count = r.read_u30()?;
        let mut raw_exceptions = Vec::with_capacity(exception_count as usize);
        for _ in 0..exception_count {
            let from = r.read_u30()?;
            let to = r.read_u30()?;
            let target = r.read_u30()?;
            let exc_type = pool.multiname(r.read_u30()?)?;
            let var_index = r.read_u30()?;
            let var_name = if var_index != 0 {
                Some(pool.multiname(var_index)?)
            } else {
                None
            };
            raw_exceptions.push(RawException {
                from,
                to,
                target,
                exc_type,
                var_name,
            });
        }
        let traits = read_traits(r, pool)?;
        let (code, exceptions) = asm::disassemble(code_bytes, pool, raw_exceptions)?;
        Ok(Self {
            method,
            max_stack,
            local_count,
            init_scope_depth,
            max_scope_depth,
            code,
            exceptions,
            traits,
        })
    }

    pub fn write(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) -> Result<()> {
        let assembled = asm::assemble(&self.code, pool)?;
        w.write_u30(self.method.0);
        w.write_u30(self.max_stack);
        w.write_u30(self.local_count);
        w.write_u30(self.init_scope_depth);
        w.write_u30(self.max_scope_depth);
        w.write_u30(assembled.bytes.len() as u32);
        w.write_bytes(&assembled.bytes);
        w.write_u30(self.exceptions.len() as u32);
        for exc in &self.exceptions {
            w.write_u30(assembled.offset_of(exc.from)?);
            w.write_u30(assembled.offset_of(exc.to)?);
            w.write_u30(assembled.offset_of(exc.target)?);
            w.write_u30(pool.multiname_index(&exc.exc_type));
            match &exc.var_name {
                Some(var) => w.write_u30(pool.multiname_index(var)),
                None => w.write_u30(0),
            }
        }
        write_traits(&self.traits, w, pool);
        Ok(())
    }
}

/// A whole ABC file.
///
/// On read the constant pool holds what the file declared; on write the
/// pool is rebuilt from scratch by the counting pass (unless
/// [`AbcFile::write_with_pool`] is used to preserve the read order).
#[derive(Debug, Clone)]
pub struct AbcFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub methods: Vec<MethodInfo>,
    pub metadata: Vec<Metadata>,
    pub instances: Vec<InstanceInfo>,
    pub classes: Vec<ClassInfo>,
    pub scripts: Vec<ScriptInfo>,
    pub bodies: Vec<MethodBody>,
}

pub const MINOR_VERSION: u16 = 16;
pub const MAJOR_VERSION: u16 = 46;

impl Default for AbcFile {
    fn default() -> Self {
        Self::new()
    }
}

impl AbcFile {
    pub fn new() -> Self {
        Self {
            minor_version: MINOR_VERSION,
            major_version: MAJOR_VERSION,
            constant_pool: ConstantPool::default(),
            methods: Vec::new(),
            metadata: Vec::new(),
            instances: Vec::new(),
            classes: Vec::new(),
            scripts: Vec::new(),
            bodies: Vec::new(),
        }
    }

    pub fn add_method(&mut self, method: MethodInfo) -> MethodId {
        self.methods.push(method);
        MethodId(self.methods.len() as u32 - 1)
    }

    pub fn add_body(&mut self, body: MethodBody) {
        self.bodies.push(body);
    }

    pub fn add_metadata(&mut self, metadata: Metadata) -> MetadataId {
        self.metadata.push(metadata);
        MetadataId(self.metadata.len() as u32 - 1)
    }

    /// Append a class. Instance and class info live at the same index.
    pub fn add_class(&mut self, instance: InstanceInfo, class: ClassInfo) -> ClassId {
        self.instances.push(instance);
        self.classes.push(class);
        ClassId(self.classes.len() as u32 - 1)
    }

    pub fn method(&self, id: MethodId) -> &MethodInfo {
        &self.methods[id.0 as usize]
    }

    pub fn body_of(&self, id: MethodId) -> Option<&MethodBody> {
        self.bodies.iter().find(|b| b.method == id)
    }

    pub fn read(data: &[u8]) -> Result<Self> {
        let mut r = AbcReader::new(data);
        let minor_version = r.read_u16()?;
        let major_version = r.read_u16()?;
        if (minor_version, major_version) != (MINOR_VERSION, MAJOR_VERSION) {
            return Err(Error::malformed(
                "abc",
                format!("unsupported version {major_version}.{minor_version}"),
            ));
        }
        let constant_pool = ConstantPool::read(&mut r)?;
        let pool = &constant_pool;

        let method_count = r.read_u30()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(MethodInfo::read(&mut r, pool)?);
        }

        let metadata_count = r.read_u30()?;
        let mut metadata = Vec::with_capacity(metadata_count as usize);
        for _ in 0..metadata_count {
            metadata.push(Metadata::read(&mut r, pool)?);
        }

        let class_count = r.read_u30()?;
        let mut instances = Vec::with_capacity(class_count as usize);
        for _ in 0..class_count {
            instances.push(InstanceInfo::read(&mut r, pool)?);
        }
        let mut classes = Vec::with_capacity(class_count as usize);
        for _ in 0..class_count {
            classes.push(ClassInfo::read(&mut r, pool)?);
        }

        let script_count = r.read_u30()?;
        let mut scripts = Vec::with_capacity(script_count as usize);
        for _ in 0..script_count {
            scripts.push(ScriptInfo::read(&mut r, pool)?);
        }

        let body_count = r.read_u30()?;
        let mut bodies = Vec::with_capacity(body_count as usize);
        for _ in 0..body_count {
            bodies.push(MethodBody::read(&mut r, pool)?);
        }

        if !r.is_empty() {
            return Err(Error::malformed("abc", "trailing data after method bodies"));
        }

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            methods,
            metadata,
            instances,
            classes,
            scripts,
            bodies,
        })
    }

    /// Serialize, rebuilding the constant pool ordered by descending
    /// reference frequency.
    pub fn write(&self) -> Result<Vec<u8>> {
        let mut counter = PoolCounter::default();
        self.write_inner(&mut NullWriter, &mut counter)?;
        let mut table = PoolTable::from_counter(counter);
        let mut w = AbcWriter::new();
        self.write_inner(&mut w, &mut table)?;
        Ok(w.into_bytes())
    }

    /// Serialize against the pool as read, preserving its index order. An
    /// unmodified file round-trips byte-identically through this.
    pub fn write_with_pool(&self) -> Result<Vec<u8>> {
        let mut table = PoolTable::from_pool(self.constant_pool.clone());
        let mut w = AbcWriter::new();
        self.write_inner(&mut w, &mut table)?;
        Ok(w.into_bytes())
    }

    fn write_inner(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) -> Result<()> {
        w.write_u16(self.minor_version);
        w.write_u16(self.major_version);
        pool.write_pool(w);
        w.write_u30(self.methods.len() as u32);
        for m in &self.methods {
            m.write(w, pool);
        }
        w.write_u30(self.metadata.len() as u32);
        for m in &self.metadata {
            m.write(w, pool);
        }
        w.write_u30(self.classes.len() as u32);
        for i in &self.instances {
            i.write(w, pool);
        }
        for c in &self.classes {
            c.write(w, pool);
        }
        w.write_u30(self.scripts.len() as u32);
        for s in &self.scripts {
            s.write(w, pool);
        }
        w.write_u30(self.bodies.len() as u32);
        for b in &self.bodies {
            b.write(w, pool)?;
        }
        Ok(())
    }

    /// Strip debug metadata: the metadata table, parameter names, and every
    /// trait's metadata references.
    pub fn clean_metadata(&mut self) {
        self.metadata.clear();
        for m in &mut self.methods {
            m.param_names.clear();
        }
        let strip = |traits: &mut Vec<Trait>| {
            for t in traits {
                t.metadata.clear();
            }
        };
        for s in &mut self.scripts {
            strip(&mut s.traits);
        }
        for c in &mut self.classes {
            strip(&mut c.traits);
        }
        for i in &mut self.instances {
            strip(&mut i.traits);
        }
        for b in &mut self.bodies {
            strip(&mut b.traits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_equality_is_kind_and_name() {
        assert_eq!(
            Namespace::Package("a".into()),
            Namespace::Package("a".into())
        );
        assert_ne!(
            Namespace::Package("a".into()),
            Namespace::Private("a".into())
        );
    }

    #[test]
    fn multiname_runtime_args_by_variant() {
        assert_eq!(Multiname::qname("x").runtime_args(), 0);
        assert_eq!(Multiname::RtqName { name: "x".into() }.runtime_args(), 1);
        assert_eq!(Multiname::subscript().runtime_args(), 1);
        assert_eq!(Multiname::RtqNameL.runtime_args(), 2);
        assert_eq!(Multiname::Any.runtime_args(), 0);
    }

    #[test]
    fn empty_file_roundtrips() {
        let file = AbcFile::new();
        let bytes = file.write().unwrap();
        let back = AbcFile::read(&bytes).unwrap();
        assert_eq!(back.minor_version, MINOR_VERSION);
        assert_eq!(back.major_version, MAJOR_VERSION);
        assert!(back.methods.is_empty());
        assert!(back.scripts.is_empty());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut file = AbcFile::new();
        file.major_version = 47;
        let bytes = file.write().unwrap();
        assert!(AbcFile::read(&bytes).is_err());
    }
}
