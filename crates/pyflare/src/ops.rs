//! The AVM2 instruction set.
//!
//! Each variant carries its decoded operands: pool-backed values appear as
//! the values themselves (multinames, strings, doubles), positional
//! references as typed ids ([`MethodId`], [`ClassId`]), registers as [`Reg`]
//! and branch targets as [`Label`]s. Pool indices only exist on the wire;
//! [`Op::write`] interns operands through a [`PoolSink`] and
//! [`Op::read_operands`] resolves them through the [`ConstantPool`].
//!
//! Branch instructions and labels are handled by the assembler
//! (`asm`), which owns offset computation; `Op::write` refuses them.
//!
//! Stack contracts live here too: [`Op::stack_pops`]/[`Op::stack_pushes`]
//! compute the variable effects from the operands: argument counts and the
//! runtime shape of the multiname (see [`Multiname::runtime_args`]).

use crate::abc::{ClassId, MethodId, Multiname, Namespace};
use crate::error::{Error, Result};
use crate::pool::{ConstantPool, PoolSink};
use crate::stream::{AbcReader, Writer};

/// A branch target with value identity and no wire form of its own.
///
/// Labels are allocated by a [`LabelGen`] and only gain a byte offset during
/// assembly; identity is per method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Allocator for fresh labels, one per method body under construction.
#[derive(Default)]
pub struct LabelGen(u32);

impl LabelGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> Label {
        self.0 += 1;
        Label(self.0)
    }
}

/// A local register operand.
///
/// `Temp` registers are placeholders handed out during code generation;
/// register compaction assigns them real numbers before assembly. Writing a
/// `Temp` is a bug in the compiler, not in user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Fixed(u32),
    Temp(u32),
}

impl Reg {
    pub fn index(self) -> u32 {
        match self {
            Reg::Fixed(n) => n,
            Reg::Temp(n) => panic!("temp register t{n} escaped register compaction"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // Pseudo-instruction: a branch target occupying no byte space.
    Mark(Label),

    Add,
    AddI,
    AsType(Multiname),
    AsTypeLate,
    BitAnd,
    BitNot,
    BitOr,
    BitXor,
    Call { num_args: u32 },
    CallMethod { method: MethodId, num_args: u32 },
    CallProperty { name: Multiname, num_args: u32 },
    CallPropLex { name: Multiname, num_args: u32 },
    CallPropVoid { name: Multiname, num_args: u32 },
    CallStatic { method: MethodId, num_args: u32 },
    CallSuper { name: Multiname, num_args: u32 },
    CallSuperVoid { name: Multiname, num_args: u32 },
    CheckFilter,
    Coerce(Multiname),
    CoerceA,
    CoerceS,
    Construct { num_args: u32 },
    ConstructProp { name: Multiname, num_args: u32 },
    ConstructSuper { num_args: u32 },
    ConvertB,
    ConvertD,
    ConvertI,
    ConvertO,
    ConvertS,
    ConvertU,
    Debug { kind: u8, name: String, reg: u8 },
    DebugFile(String),
    DebugLine(u32),
    DecLocal(Reg),
    DecLocalI(Reg),
    Decrement,
    DecrementI,
    DeleteProperty(Multiname),
    Divide,
    Dup,
    Dxns(String),
    DxnsLate,
    Equals,
    EscXAttr,
    EscXElem,
    FindProperty(Multiname),
    FindPropStrict(Multiname),
    GetDescendants(Multiname),
    GetGlobalScope,
    GetGlobalSlot(u32),
    GetLex(Multiname),
    GetLocal(Reg),
    GetLocal0,
    GetLocal1,
    GetLocal2,
    GetLocal3,
    GetProperty(Multiname),
    GetScopeObject(u8),
    GetSlot(u32),
    GetSuper(Multiname),
    GreaterEquals,
    GreaterThan,
    HasNext,
    HasNext2 { object: Reg, index: Reg },
    IfEq(Label),
    IfFalse(Label),
    IfGe(Label),
    IfGt(Label),
    IfLe(Label),
    IfLt(Label),
    IfNe(Label),
    IfNge(Label),
    IfNgt(Label),
    IfNle(Label),
    IfNlt(Label),
    IfStrictEq(Label),
    IfStrictNe(Label),
    IfTrue(Label),
    In,
    IncLocal(Reg),
    IncLocalI(Reg),
    Increment,
    IncrementI,
    InitProperty(Multiname),
    InstanceOf,
    IsType(Multiname),
    IsTypeLate,
    Jump(Label),
    Kill(Reg),
    // Wire opcode 0x09: a no-op the verifier requires at the head of every
    // backward branch. Doubles as a branch target like `Mark`.
    Label(Label),
    LessEquals,
    LessThan,
    LookupSwitch { default_offset: i32, case_offsets: Vec<i32> },
    LShift,
    Modulo,
    Multiply,
    MultiplyI,
    Negate,
    NegateI,
    NewActivation,
    NewArray { num_args: u32 },
    NewCatch(u32),
    NewClass(ClassId),
    NewFunction(MethodId),
    NewObject { num_args: u32 },
    NextName,
    NextValue,
    Nop,
    Not,
    Pop,
    PopScope,
    PushByte(u8),
    PushDouble(f64),
    PushFalse,
    PushInt(i32),
    PushNamespace(Namespace),
    PushNan,
    PushNull,
    PushScope,
    PushShort(u32),
    PushString(String),
    PushTrue,
    PushUint(u32),
    PushUndefined,
    PushWith,
    ReturnValue,
    ReturnVoid,
    RShift,
    SetGlobalSlot(u32),
    SetLocal(Reg),
    SetLocal0,
    SetLocal1,
    SetLocal2,
    SetLocal3,
    SetProperty(Multiname),
    SetSlot(u32),
    SetSuper(Multiname),
    StrictEquals,
    Subtract,
    SubtractI,
    Swap,
    Throw,
    TypeOf,
    URShift,
}

impl Op {
    /// The wire opcode. `Mark` has none.
    pub fn opcode(&self) -> Option<u8> {
        Some(match self {
            Op::Mark(_) => return None,
            Op::Add => 0xa0,
            Op::AddI => 0xc5,
            Op::AsType(_) => 0x86,
            Op::AsTypeLate => 0x87,
            Op::BitAnd => 0xa8,
            Op::BitNot => 0x97,
            Op::BitOr => 0xa9,
            Op::BitXor => 0xaa,
            Op::Call { .. } => 0x41,
            Op::CallMethod { .. } => 0x43,
            Op::CallProperty { .. } => 0x46,
            Op::CallPropLex { .. } => 0x4c,
            Op::CallPropVoid { .. } => 0x4f,
            Op::CallStatic { .. } => 0x44,
            Op::CallSuper { .. } => 0x45,
            Op::CallSuperVoid { .. } => 0x4e,
            Op::CheckFilter => 0x78,
            Op::Coerce(_) => 0x80,
            Op::CoerceA => 0x82,
            Op::CoerceS => 0x85,
            Op::Construct { .. } => 0x42,
            Op::ConstructProp { .. } => 0x4a,
            Op::ConstructSuper { .. } => 0x49,
            Op::ConvertB => 0x76,
            Op::ConvertD => 0x75,
            Op::ConvertI => 0x73,
            Op::ConvertO => 0x77,
            Op::ConvertS => 0x70,
            Op::ConvertU => 0x74,
            Op::Debug { .. } => 0xef,
            Op::DebugFile(_) => 0xf1,
            Op::DebugLine(_) => 0xf0,
            Op::DecLocal(_) => 0x94,
            Op::DecLocalI(_) => 0xc3,
            Op::Decrement => 0x93,
            Op::DecrementI => 0xc1,
            Op::DeleteProperty(_) => 0x6a,
            Op::Divide => 0xa3,
            Op::Dup => 0x2a,
            Op::Dxns(_) => 0x06,
            Op::DxnsLate => 0x07,
            Op::Equals => 0xab,
            Op::EscXAttr => 0x72,
            Op::EscXElem => 0x71,
            Op::FindProperty(_) => 0x5e,
            Op::FindPropStrict(_) => 0x5d,
            Op::GetDescendants(_) => 0x59,
            Op::GetGlobalScope => 0x64,
            Op::GetGlobalSlot(_) => 0x6e,
            Op::GetLex(_) => 0x60,
            Op::GetLocal(_) => 0x62,
            Op::GetLocal0 => 0xd0,
            Op::GetLocal1 => 0xd1,
            Op::GetLocal2 => 0xd2,
            Op::GetLocal3 => 0xd3,
            Op::GetProperty(_) => 0x66,
            Op::GetScopeObject(_) => 0x65,
            Op::GetSlot(_) => 0x6c,
            Op::GetSuper(_) => 0x04,
            Op::GreaterEquals => 0xb0,
            Op::GreaterThan => 0xaf,
            Op::HasNext => 0x1f,
            Op::HasNext2 { .. } => 0x32,
            Op::IfEq(_) => 0x13,
            Op::IfFalse(_) => 0x12,
            Op::IfGe(_) => 0x18,
            Op::IfGt(_) => 0x17,
            Op::IfLe(_) => 0x16,
            Op::IfLt(_) => 0x15,
            Op::IfNe(_) => 0x14,
            Op::IfNge(_) => 0x0f,
            Op::IfNgt(_) => 0x0e,
            Op::IfNle(_) => 0x0d,
            Op::IfNlt(_) => 0x0c,
            Op::IfStrictEq(_) => 0x19,
            Op::IfStrictNe(_) => 0x1a,
            Op::IfTrue(_) => 0x11,
            Op::In => 0xb4,
            Op::IncLocal(_) => 0x92,
            Op::IncLocalI(_) => 0xc2,
            Op::Increment => 0x91,
            Op::IncrementI => 0xc0,
            Op::InitProperty(_) => 0x68,
            Op::InstanceOf => 0xb1,
            Op::IsType(_) => 0xb2,
            Op::IsTypeLate => 0xb3,
            Op::Jump(_) => 0x10,
            Op::Kill(_) => 0x08,
            Op::Label(_) => 0x09,
            Op::LessEquals => 0xae,
            Op::LessThan => 0xad,
            Op::LookupSwitch { .. } => 0x1b,
            Op::LShift => 0xa5,
            Op::Modulo => 0xa4,
            Op::Multiply => 0xa2,
            Op::MultiplyI => 0xc7,
            Op::Negate => 0x90,
            Op::NegateI => 0xc4,
            Op::NewActivation => 0x57,
            Op::NewArray { .. } => 0x56,
            Op::NewCatch(_) => 0x5a,
            Op::NewClass(_) => 0x58,
            Op::NewFunction(_) => 0x40,
            Op::NewObject { .. } => 0x55,
            Op::NextName => 0x1e,
            Op::NextValue => 0x23,
            Op::Nop => 0x02,
            Op::Not => 0x96,
            Op::Pop => 0x29,
            Op::PopScope => 0x1d,
            Op::PushByte(_) => 0x24,
            Op::PushDouble(_) => 0x2f,
            Op::PushFalse => 0x27,
            Op::PushInt(_) => 0x2d,
            Op::PushNamespace(_) => 0x31,
            Op::PushNan => 0x28,
            Op::PushNull => 0x20,
            Op::PushScope => 0x30,
            Op::PushShort(_) => 0x25,
            Op::PushString(_) => 0x2c,
            Op::PushTrue => 0x26,
            Op::PushUint(_) => 0x2e,
            Op::PushUndefined => 0x21,
            Op::PushWith => 0x1c,
            Op::ReturnValue => 0x48,
            Op::ReturnVoid => 0x47,
            Op::RShift => 0xa6,
            Op::SetGlobalSlot(_) => 0x6f,
            Op::SetLocal(_) => 0x63,
            Op::SetLocal0 => 0xd4,
            Op::SetLocal1 => 0xd5,
            Op::SetLocal2 => 0xd6,
            Op::SetLocal3 => 0xd7,
            Op::SetProperty(_) => 0x61,
            Op::SetSlot(_) => 0x6d,
            Op::SetSuper(_) => 0x05,
            Op::StrictEquals => 0xac,
            Op::Subtract => 0xa1,
            Op::SubtractI => 0xc6,
            Op::Swap => 0x2b,
            Op::Throw => 0x03,
            Op::TypeOf => 0x95,
            Op::URShift => 0xa7,
        })
    }

    /// The branch target, for branch instructions and label markers.
    pub fn target(&self) -> Option<Label> {
        match self {
            Op::Jump(l)
            | Op::IfEq(l)
            | Op::IfFalse(l)
            | Op::IfGe(l)
            | Op::IfGt(l)
            | Op::IfLe(l)
            | Op::IfLt(l)
            | Op::IfNe(l)
            | Op::IfNge(l)
            | Op::IfNgt(l)
            | Op::IfNle(l)
            | Op::IfNlt(l)
            | Op::IfStrictEq(l)
            | Op::IfStrictNe(l)
            | Op::IfTrue(l) => Some(*l),
            _ => None,
        }
    }

    /// Whether this op marks a position branches may land on.
    pub fn is_label(&self) -> Option<Label> {
        match self {
            Op::Mark(l) | Op::Label(l) => Some(*l),
            _ => None,
        }
    }

    /// Whether `opcode` is a branch instruction (an `s24` offset operand).
    pub fn is_branch_opcode(opcode: u8) -> bool {
        matches!(opcode, 0x0c..=0x1a)
    }

    /// Build the branch variant for a branch opcode, if `opcode` is one.
    pub fn branch_from_opcode(opcode: u8, label: Label) -> Option<Op> {
        Some(match opcode {
            0x10 => Op::Jump(label),
            0x13 => Op::IfEq(label),
            0x12 => Op::IfFalse(label),
            0x18 => Op::IfGe(label),
            0x17 => Op::IfGt(label),
            0x16 => Op::IfLe(label),
            0x15 => Op::IfLt(label),
            0x14 => Op::IfNe(label),
            0x0f => Op::IfNge(label),
            0x0e => Op::IfNgt(label),
            0x0d => Op::IfNle(label),
            0x0c => Op::IfNlt(label),
            0x19 => Op::IfStrictEq(label),
            0x1a => Op::IfStrictNe(label),
            0x11 => Op::IfTrue(label),
            _ => return None,
        })
    }

    /// Serialize the opcode and its operands.
    ///
    /// Branch instructions and label markers are the assembler's business
    /// (their operand is an offset only the assembler knows); handing one
    /// here is a compiler bug.
    pub fn write(&self, w: &mut dyn Writer, pool: &mut dyn PoolSink) {
        assert!(
            self.target().is_none() && self.is_label().is_none(),
            "branch/label op must go through the assembler: {self:?}"
        );
        w.write_u8(self.opcode().expect("pseudo-op has no opcode"));
        match self {
            Op::AsType(mn)
            | Op::Coerce(mn)
            | Op::DeleteProperty(mn)
            | Op::FindProperty(mn)
            | Op::FindPropStrict(mn)
            | Op::GetDescendants(mn)
            | Op::GetLex(mn)
            | Op::GetProperty(mn)
            | Op::GetSuper(mn)
            | Op::InitProperty(mn)
            | Op::IsType(mn)
            | Op::SetProperty(mn)
            | Op::SetSuper(mn) => {
                w.write_u30(pool.multiname_index(mn));
            }
            Op::CallProperty { name, num_args }
            | Op::CallPropLex { name, num_args }
            | Op::CallPropVoid { name, num_args }
            | Op::CallSuper { name, num_args }
            | Op::CallSuperVoid { name, num_args }
            | Op::ConstructProp { name, num_args } => {
                w.write_u30(pool.multiname_index(name));
                w.write_u30(*num_args);
            }
            Op::Call { num_args }
            | Op::Construct { num_args }
            | Op::ConstructSuper { num_args }
            | Op::NewArray { num_args }
            | Op::NewObject { num_args } => {
                w.write_u30(*num_args);
            }
            Op::CallMethod { method, num_args } | Op::CallStatic { method, num_args } => {
                w.write_u30(method.0);
                w.write_u30(*num_args);
            }
            Op::Debug { kind, name, reg } => {
                w.write_u8(*kind);
                w.write_u30(pool.string_index(name));
                w.write_u8(*reg);
                w.write_u30(0);
            }
            Op::DebugFile(s) | Op::Dxns(s) | Op::PushString(s) => {
                w.write_u30(pool.string_index(s));
            }
            Op::DebugLine(n) => w.write_u30(*n),
            Op::DecLocal(r)
            | Op::DecLocalI(r)
            | Op::GetLocal(r)
            | Op::IncLocal(r)
            | Op::IncLocalI(r)
            | Op::Kill(r)
            | Op::SetLocal(r) => {
                w.write_u30(r.index());
            }
            Op::GetGlobalSlot(n)
            | Op::GetSlot(n)
            | Op::SetGlobalSlot(n)
            | Op::SetSlot(n)
            | Op::NewCatch(n)
            | Op::PushShort(n) => {
                w.write_u30(*n);
            }
            Op::GetScopeObject(n) => w.write_u8(*n),
            Op::HasNext2 { object, index } => {
                w.write_u30(object.index());
                w.write_u30(index.index());
            }
            Op::LookupSwitch {
                default_offset,
                case_offsets,
            } => {
                w.write_s24(*default_offset);
                w.write_u30(case_offsets.len() as u32);
                for off in case_offsets {
                    w.write_s24(*off);
                }
            }
            Op::NewClass(id) => w.write_u30(id.0),
            Op::NewFunction(id) => w.write_u30(id.0),
            Op::PushByte(b) => w.write_u8(*b),
            Op::PushDouble(d) => w.write_u30(pool.double_index(*d)),
            Op::PushInt(i) => w.write_u30(pool.int_index(*i)),
            Op::PushUint(u) => w.write_u30(pool.uint_index(*u)),
            Op::PushNamespace(ns) => w.write_u30(pool.namespace_index(ns)),
            _ => {}
        }
    }

    /// Decode the operands for a non-branch `opcode`. The opcode byte has
    /// already been consumed. Branch opcodes and unknown bytes are errors;
    /// the disassembler handles branches before calling this.
    pub fn read_operands(opcode: u8, r: &mut AbcReader<'_>, pool: &ConstantPool) -> Result<Op> {
        let mn = |r: &mut AbcReader<'_>, pool: &ConstantPool| -> Result<Multiname> {
            pool.multiname(r.read_u30()?)
        };
        Ok(match opcode {
            0xa0 => Op::Add,
            0xc5 => Op::AddI,
            0x86 => Op::AsType(mn(r, pool)?),
            0x87 => Op::AsTypeLate,
            0xa8 => Op::BitAnd,
            0x97 => Op::BitNot,
            0xa9 => Op::BitOr,
            0xaa => Op::BitXor,
            0x41 => Op::Call {
                num_args: r.read_u30()?,
            },
            0x43 => Op::CallMethod {
                method: MethodId(r.read_u30()?),
                num_args: r.read_u30()?,
            },
            0x46 => Op::CallProperty {
                name: mn(r, pool)?,
                num_args: r.read_u30()?,
            },
            0x4c => Op::CallPropLex {
                name: mn(r, pool)?,
                num_args: r.read_u30()?,
            },
            0x4f => Op::CallPropVoid {
                name: mn(r, pool)?,
                num_args: r.read_u30()?,
            },
            0x44 => Op::CallStatic {
                method: MethodId(r.read_u30()?),
                num_args: r.read_u30()?,
            },
            0x45 => Op::CallSuper {
                name: mn(r, pool)?,
                num_args: r.read_u30()?,
            },
            0x4e => Op::CallSuperVoid {
                name: mn(r, pool)?,
                num_args: r.read_u30()?,
            },
            0x78 => Op::CheckFilter,
            0x80 => Op::Coerce(mn(r, pool)?),
            0x82 => Op::CoerceA,
            0x85 => Op::CoerceS,
            0x42 => Op::Construct {
                num_args: r.read_u30()?,
            },
            0x4a => Op::ConstructProp {
                name: mn(r, pool)?,
                num_args: r.read_u30()?,
            },
            0x49 => Op::ConstructSuper {
                num_args: r.read_u30()?,
            },
            0x76 => Op::ConvertB,
            0x75 => Op::ConvertD,
            0x73 => Op::ConvertI,
            0x77 => Op::ConvertO,
            0x70 => Op::ConvertS,
            0x74 => Op::ConvertU,
            0xef => {
                let kind = r.read_u8()?;
                let name = pool.string(r.read_u30()?)?.to_owned();
                let reg = r.read_u8()?;
                r.read_u30()?;
                Op::Debug { kind, name, reg }
            }
            0xf1 => Op::DebugFile(pool.string(r.read_u30()?)?.to_owned()),
            0xf0 => Op::DebugLine(r.read_u30()?),
            0x94 => Op::DecLocal(Reg::Fixed(r.read_u30()?)),
            0xc3 => Op::DecLocalI(Reg::Fixed(r.read_u30()?)),
            0x93 => Op::Decrement,
            0xc1 => Op::DecrementI,
            0x6a => Op::DeleteProperty(mn(r, pool)?),
            0xa3 => Op::Divide,
            0x2a => Op::Dup,
            0x06 => Op::Dxns(pool.string(r.read_u30()?)?.to_owned()),
            0x07 => Op::DxnsLate,
            0xab => Op::Equals,
            0x72 => Op::EscXAttr,
            0x71 => Op::EscXElem,
            0x5e => Op::FindProperty(mn(r, pool)?),
            0x5d => Op::FindPropStrict(mn(r, pool)?),
            0x59 => Op::GetDescendants(mn(r, pool)?),
            0x64 => Op::GetGlobalScope,
            0x6e => Op::GetGlobalSlot(r.read_u30()?),
            0x60 => Op::GetLex(mn(r, pool)?),
            0x62 => Op::GetLocal(Reg::Fixed(r.read_u30()?)),
            0xd0 => Op::GetLocal0,
            0xd1 => Op::GetLocal1,
            0xd2 => Op::GetLocal2,
            0xd3 => Op::GetLocal3,
            0x66 => Op::GetProperty(mn(r, pool)?),
            0x65 => Op::GetScopeObject(r.read_u8()?),
            0x6c => Op::GetSlot(r.read_u30()?),
            0x04 => Op::GetSuper(mn(r, pool)?),
            0xb0 => Op::GreaterEquals,
            0xaf => Op::GreaterThan,
            0x1f => Op::HasNext,
            0x32 => Op::HasNext2 {
                object: Reg::Fixed(r.read_u30()?),
                index: Reg::Fixed(r.read_u30()?),
            },
            0xb4 => Op::In,
            0x92 => Op::IncLocal(Reg::Fixed(r.read_u30()?)),
            0xc2 => Op::IncLocalI(Reg::Fixed(r.read_u30()?)),
            0x91 => Op::Increment,
            0xc0 => Op::IncrementI,
            0x68 => Op::InitProperty(mn(r, pool)?),
            0xb1 => Op::InstanceOf,
            0xb2 => Op::IsType(mn(r, pool)?),
            0xb3 => Op::IsTypeLate,
            0x08 => Op::Kill(Reg::Fixed(r.read_u30()?)),
            0xae => Op::LessEquals,
            0xad => Op::LessThan,
            0x1b => {
                let default_offset = r.read_s24()?;
                let case_count = r.read_u30()?;
                let mut case_offsets = Vec::with_capacity(case_count as usize);
                for _ in 0..case_count {
                    case_offsets.push(r.read_s24()?);
                }
                Op::LookupSwitch {
                    default_offset,
                    case_offsets,
                }
            }
            0xa5 => Op::LShift,
            0xa4 => Op::Modulo,
            0xa2 => Op::Multiply,
            0xc7 => Op::MultiplyI,
            0x90 => Op::Negate,
            0xc4 => Op::NegateI,
            0x57 => Op::NewActivation,
            0x56 => Op::NewArray {
                num_args: r.read_u30()?,
            },
            0x5a => Op::NewCatch(r.read_u30()?),
            0x58 => Op::NewClass(ClassId(r.read_u30()?)),
            0x40 => Op::NewFunction(MethodId(r.read_u30()?)),
            0x55 => Op::NewObject {
                num_args: r.read_u30()?,
            },
            0x1e => Op::NextName,
            0x23 => Op::NextValue,
            0x02 => Op::Nop,
            0x96 => Op::Not,
            0x29 => Op::Pop,
            0x1d => Op::PopScope,
            0x24 => Op::PushByte(r.read_u8()?),
            0x2f => Op::PushDouble(pool.double(r.read_u30()?)?),
            0x27 => Op::PushFalse,
            0x2d => Op::PushInt(pool.integer(r.read_u30()?)?),
            0x31 => Op::PushNamespace(pool.namespace(r.read_u30()?)?.clone()),
            0x28 => Op::PushNan,
            0x20 => Op::PushNull,
            0x30 => Op::PushScope,
            0x25 => Op::PushShort(r.read_u30()?),
            0x2c => Op::PushString(pool.string(r.read_u30()?)?.to_owned()),
            0x26 => Op::PushTrue,
            0x2e => Op::PushUint(pool.uinteger(r.read_u30()?)?),
            0x21 => Op::PushUndefined,
            0x1c => Op::PushWith,
            0x48 => Op::ReturnValue,
            0x47 => Op::ReturnVoid,
            0xa6 => Op::RShift,
            0x6f => Op::SetGlobalSlot(r.read_u30()?),
            0x63 => Op::SetLocal(Reg::Fixed(r.read_u30()?)),
            0xd4 => Op::SetLocal0,
            0xd5 => Op::SetLocal1,
            0xd6 => Op::SetLocal2,
            0xd7 => Op::SetLocal3,
            0x61 => Op::SetProperty(mn(r, pool)?),
            0x6d => Op::SetSlot(r.read_u30()?),
            0x05 => Op::SetSuper(mn(r, pool)?),
            0xac => Op::StrictEquals,
            0xa1 => Op::Subtract,
            0xc6 => Op::SubtractI,
            0x2b => Op::Swap,
            0x03 => Op::Throw,
            0x95 => Op::TypeOf,
            0xa7 => Op::URShift,
            _ => {
                return Err(Error::malformed(
                    "bytecode",
                    format!("unknown opcode 0x{opcode:02x}"),
                ))
            }
        })
    }

    /// Apply `f` to every register operand. Used by register compaction to
    /// count and renumber temporaries.
    pub fn map_regs(&mut self, f: &mut impl FnMut(Reg) -> Reg) {
        match self {
            Op::DecLocal(r)
            | Op::DecLocalI(r)
            | Op::GetLocal(r)
            | Op::IncLocal(r)
            | Op::IncLocalI(r)
            | Op::Kill(r)
            | Op::SetLocal(r) => *r = f(*r),
            Op::HasNext2 { object, index } => {
                *object = f(*object);
                *index = f(*index);
            }
            _ => {}
        }
    }

    /// Visit every register operand.
    pub fn visit_regs(&self, f: &mut impl FnMut(Reg)) {
        match self {
            Op::DecLocal(r)
            | Op::DecLocalI(r)
            | Op::GetLocal(r)
            | Op::IncLocal(r)
            | Op::IncLocalI(r)
            | Op::Kill(r)
            | Op::SetLocal(r) => f(*r),
            Op::HasNext2 { object, index } => {
                f(*object);
                f(*index);
            }
            _ => {}
        }
    }

    /// Values consumed from the operand stack.
    pub fn stack_pops(&self) -> u32 {
        match self {
            // Property access: the multiname's runtime parts come off the
            // stack in addition to the receiver.
            Op::GetProperty(mn) | Op::DeleteProperty(mn) | Op::GetDescendants(mn) => {
                1 + mn.runtime_args()
            }
            Op::GetSuper(mn) => 1 + mn.runtime_args(),
            Op::SetProperty(mn) | Op::InitProperty(mn) | Op::SetSuper(mn) => {
                2 + mn.runtime_args()
            }
            Op::FindProperty(mn) | Op::FindPropStrict(mn) => mn.runtime_args(),
            Op::CallProperty { name, num_args }
            | Op::CallPropLex { name, num_args }
            | Op::CallPropVoid { name, num_args }
            | Op::CallSuper { name, num_args }
            | Op::CallSuperVoid { name, num_args }
            | Op::ConstructProp { name, num_args } => 1 + name.runtime_args() + num_args,
            Op::Call { num_args } => num_args + 2,
            Op::CallMethod { num_args, .. }
            | Op::CallStatic { num_args, .. }
            | Op::Construct { num_args }
            | Op::ConstructSuper { num_args } => num_args + 1,
            Op::NewArray { num_args } => *num_args,
            Op::NewObject { num_args } => 2 * num_args,

            // Binary operators.
            Op::Add
            | Op::AddI
            | Op::BitAnd
            | Op::BitOr
            | Op::BitXor
            | Op::Divide
            | Op::Equals
            | Op::GreaterEquals
            | Op::GreaterThan
            | Op::In
            | Op::InstanceOf
            | Op::IsTypeLate
            | Op::AsTypeLate
            | Op::LessEquals
            | Op::LessThan
            | Op::LShift
            | Op::Modulo
            | Op::Multiply
            | Op::MultiplyI
            | Op::RShift
            | Op::StrictEquals
            | Op::Subtract
            | Op::SubtractI
            | Op::URShift => 2,

            // Unary operators and coercions.
            Op::AsType(_)
            | Op::BitNot
            | Op::CheckFilter
            | Op::Coerce(_)
            | Op::CoerceA
            | Op::CoerceS
            | Op::ConvertB
            | Op::ConvertD
            | Op::ConvertI
            | Op::ConvertO
            | Op::ConvertS
            | Op::ConvertU
            | Op::Decrement
            | Op::DecrementI
            | Op::EscXAttr
            | Op::EscXElem
            | Op::Increment
            | Op::IncrementI
            | Op::IsType(_)
            | Op::Negate
            | Op::NegateI
            | Op::Not
            | Op::TypeOf => 1,

            Op::Dup | Op::Pop | Op::PushScope | Op::PushWith | Op::Throw | Op::ReturnValue => 1,
            Op::Swap | Op::HasNext | Op::NextName | Op::NextValue | Op::SetSlot(_) => 2,
            Op::GetSlot(_) | Op::DxnsLate | Op::SetGlobalSlot(_) => 1,
            Op::SetLocal(_) | Op::SetLocal0 | Op::SetLocal1 | Op::SetLocal2 | Op::SetLocal3 => 1,
            Op::IfEq(_)
            | Op::IfGe(_)
            | Op::IfGt(_)
            | Op::IfLe(_)
            | Op::IfLt(_)
            | Op::IfNe(_)
            | Op::IfNge(_)
            | Op::IfNgt(_)
            | Op::IfNle(_)
            | Op::IfNlt(_)
            | Op::IfStrictEq(_)
            | Op::IfStrictNe(_) => 2,
            Op::IfTrue(_) | Op::IfFalse(_) => 1,
            Op::LookupSwitch { .. } => 1,
            Op::NewClass(_) => 1,

            _ => 0,
        }
    }

    /// Values produced onto the operand stack.
    pub fn stack_pushes(&self) -> u32 {
        match self {
            // The catch entry point receives the thrown value along with the
            // new catch scope; modeling both as pushes of `newcatch` keeps
            // the linear verifier in balance at handler heads.
            Op::NewCatch(_) => 2,
            Op::Dup => 2,
            Op::Swap => 2,

            Op::Add
            | Op::AddI
            | Op::AsType(_)
            | Op::AsTypeLate
            | Op::BitAnd
            | Op::BitNot
            | Op::BitOr
            | Op::BitXor
            | Op::Call { .. }
            | Op::CallMethod { .. }
            | Op::CallProperty { .. }
            | Op::CallPropLex { .. }
            | Op::CallStatic { .. }
            | Op::CallSuper { .. }
            | Op::CheckFilter
            | Op::Coerce(_)
            | Op::CoerceA
            | Op::CoerceS
            | Op::Construct { .. }
            | Op::ConstructProp { .. }
            | Op::ConvertB
            | Op::ConvertD
            | Op::ConvertI
            | Op::ConvertO
            | Op::ConvertS
            | Op::ConvertU
            | Op::Decrement
            | Op::DecrementI
            | Op::DeleteProperty(_)
            | Op::Divide
            | Op::Equals
            | Op::EscXAttr
            | Op::EscXElem
            | Op::FindProperty(_)
            | Op::FindPropStrict(_)
            | Op::GetDescendants(_)
            | Op::GetGlobalScope
            | Op::GetGlobalSlot(_)
            | Op::GetLex(_)
            | Op::GetLocal(_)
            | Op::GetLocal0
            | Op::GetLocal1
            | Op::GetLocal2
            | Op::GetLocal3
            | Op::GetProperty(_)
            | Op::GetScopeObject(_)
            | Op::GetSlot(_)
            | Op::GetSuper(_)
            | Op::GreaterEquals
            | Op::GreaterThan
            | Op::HasNext
            | Op::HasNext2 { .. }
            | Op::In
            | Op::Increment
            | Op::IncrementI
            | Op::InstanceOf
            | Op::IsType(_)
            | Op::IsTypeLate
            | Op::LessEquals
            | Op::LessThan
            | Op::Modulo
            | Op::Multiply
            | Op::MultiplyI
            | Op::LShift
            | Op::Negate
            | Op::NegateI
            | Op::NewActivation
            | Op::NewArray { .. }
            | Op::NewClass(_)
            | Op::NewFunction(_)
            | Op::NewObject { .. }
            | Op::NextName
            | Op::NextValue
            | Op::Not
            | Op::PushByte(_)
            | Op::PushDouble(_)
            | Op::PushFalse
            | Op::PushInt(_)
            | Op::PushNamespace(_)
            | Op::PushNan
            | Op::PushNull
            | Op::PushShort(_)
            | Op::PushString(_)
            | Op::PushTrue
            | Op::PushUint(_)
            | Op::PushUndefined
            | Op::RShift
            | Op::StrictEquals
            | Op::Subtract
            | Op::SubtractI
            | Op::TypeOf
            | Op::URShift => 1,

            _ => 0,
        }
    }

    /// Net effect on the scope stack.
    pub fn scope_effect(&self) -> i32 {
        match self {
            Op::PushScope | Op::PushWith => 1,
            Op::PopScope => -1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::{Namespace, NamespaceSet};

    fn qname(name: &str) -> Multiname {
        Multiname::QName {
            ns: Namespace::Package(String::new()),
            name: name.into(),
        }
    }

    #[test]
    fn property_pops_follow_the_multiname_shape() {
        assert_eq!(Op::GetProperty(qname("x")).stack_pops(), 1);
        assert_eq!(Op::GetProperty(Multiname::RtqName { name: "x".into() }).stack_pops(), 2);
        assert_eq!(Op::GetProperty(Multiname::RtqNameL).stack_pops(), 3);
        assert_eq!(
            Op::GetProperty(Multiname::MultinameL {
                ns_set: NamespaceSet(vec![Namespace::Package(String::new())]),
            })
            .stack_pops(),
            2
        );
    }

    #[test]
    fn call_effects_scale_with_arg_count() {
        let op = Op::CallProperty {
            name: qname("f"),
            num_args: 3,
        };
        assert_eq!(op.stack_pops(), 4);
        assert_eq!(op.stack_pushes(), 1);
        let void = Op::CallPropVoid {
            name: qname("f"),
            num_args: 3,
        };
        assert_eq!(void.stack_pushes(), 0);
        assert_eq!(Op::Call { num_args: 2 }.stack_pops(), 4);
        assert_eq!(Op::NewObject { num_args: 3 }.stack_pops(), 6);
    }

    #[test]
    fn hasnext2_pushes_one_boolean() {
        let op = Op::HasNext2 {
            object: Reg::Fixed(1),
            index: Reg::Fixed(2),
        };
        assert_eq!(op.stack_pops(), 0);
        assert_eq!(op.stack_pushes(), 1);
    }

    #[test]
    fn callproperty_and_callpropvoid_use_distinct_opcodes() {
        let call = Op::CallProperty {
            name: qname("f"),
            num_args: 0,
        };
        let void = Op::CallPropVoid {
            name: qname("f"),
            num_args: 0,
        };
        assert_eq!(call.opcode(), Some(0x46));
        assert_eq!(void.opcode(), Some(0x4f));
    }

    #[test]
    #[should_panic(expected = "escaped register compaction")]
    fn temp_register_has_no_wire_index() {
        Reg::Temp(3).index();
    }
}
