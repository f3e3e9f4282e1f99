//! Bytecode assembler and disassembler.
//!
//! Labels never hold addresses in the instruction list; they gain one here.
//! The assembler emits left to right, recording each label's byte offset.
//! A branch to a label not yet seen writes a zero placeholder and queues a
//! patch keyed by label identity; meeting the label writes every queued
//! patch in place. Branch offsets are relative to the byte after the
//! four-byte branch instruction: `target − (branch_offset + 4)`.
//!
//! The disassembler runs the conversion in reverse: raw offsets become
//! shared labels. A backward branch must land on a wire `label` opcode (the
//! AVM requires one there anyway); a forward branch allocates a fresh label
//! that is inserted as a zero-byte [`Op::Mark`] at the target. Exception
//! handler offsets round-trip through labels the same way.

use std::collections::HashMap;

use crate::abc::{ExceptionHandler, RawException};
use crate::error::{Error, Result};
use crate::ops::{Label, LabelGen, Op};
use crate::pool::{ConstantPool, PoolSink};
use crate::stream::{AbcReader, AbcWriter, Writer};

/// Output of [`assemble`]: the raw code bytes plus every label's offset,
/// which the method-body writer uses to resolve exception-table offsets.
pub struct Assembled {
    pub bytes: Vec<u8>,
    labels: HashMap<Label, u32>,
}

impl Assembled {
    pub fn offset_of(&self, label: Label) -> Result<u32> {
        self.labels
            .get(&label)
            .copied()
            .ok_or_else(|| Error::Assertion(format!("label {label:?} not present in the code")))
    }
}

/// Assemble an instruction list into bytes.
pub fn assemble(ops: &[Op], pool: &mut dyn PoolSink) -> Result<Assembled> {
    let mut w = AbcWriter::new();
    let mut known: HashMap<Label, u32> = HashMap::new();
    let mut pending: HashMap<Label, Vec<usize>> = HashMap::new();

    for op in ops {
        let offset = w.len();
        if let Some(label) = op.is_label() {
            if known.insert(label, offset as u32).is_some() {
                return Err(Error::Assertion(format!(
                    "label {label:?} emitted more than once"
                )));
            }
            if let Some(branches) = pending.remove(&label) {
                for branch in branches {
                    w.patch_s24(branch + 1, offset as i32 - branch as i32 - 4);
                }
            }
            if matches!(op, Op::Label(_)) {
                w.write_u8(0x09);
            }
        } else if let Some(target) = op.target() {
            w.write_u8(op.opcode().expect("branch ops have opcodes"));
            match known.get(&target) {
                Some(&label_offset) => {
                    w.write_s24(label_offset as i32 - offset as i32 - 4);
                }
                None => {
                    pending.entry(target).or_default().push(offset);
                    w.write_s24(0);
                }
            }
        } else {
            op.write(&mut w, pool);
        }
    }

    if !pending.is_empty() {
        return Err(Error::Assertion(format!(
            "{} forward jump target(s) never emitted",
            pending.len()
        )));
    }
    Ok(Assembled {
        bytes: w.into_bytes(),
        labels: known,
    })
}

/// Disassemble code bytes into an instruction list with labels, converting
/// the exception table's raw offsets along the way.
pub fn disassemble(
    code: &[u8],
    pool: &ConstantPool,
    raw_exceptions: Vec<RawException>,
) -> Result<(Vec<Op>, Vec<ExceptionHandler>)> {
    let mut gen = LabelGen::new();

    // Exception offsets become labels up front so their marks precede the
    // instruction at each position.
    let mut inserts: HashMap<u32, Vec<Label>> = HashMap::new();
    let mut exceptions = Vec::with_capacity(raw_exceptions.len());
    for raw in raw_exceptions {
        let mut at = |offset: u32| {
            let label = gen.fresh();
            inserts.entry(offset).or_default().push(label);
            label
        };
        exceptions.push(ExceptionHandler {
            from: at(raw.from),
            to: at(raw.to),
            target: at(raw.target),
            exc_type: raw.exc_type,
            var_name: raw.var_name,
        });
    }

    let mut r = AbcReader::new(code);
    let mut decoded: Vec<(u32, Op)> = Vec::new();
    let mut wire_labels: HashMap<u32, Label> = HashMap::new();
    while !r.is_empty() {
        let offset = r.pos() as u32;
        let opcode = r.read_u8()?;
        let op = if opcode == 0x09 {
            let label = gen.fresh();
            wire_labels.insert(offset, label);
            Op::Label(label)
        } else if Op::is_branch_opcode(opcode) {
            let rel = r.read_s24()?;
            let target = offset as i64 + 4 + i64::from(rel);
            if !(0..=code.len() as i64).contains(&target) {
                return Err(Error::malformed(
                    "bytecode",
                    format!("branch target {target} outside the method body"),
                ));
            }
            let target = target as u32;
            let label = if rel < 0 {
                // Backward branches land on a wire label emitted earlier.
                *wire_labels.get(&target).ok_or_else(|| {
                    Error::malformed(
                        "bytecode",
                        format!("backward branch into {target} hits no label"),
                    )
                })?
            } else {
                let label = gen.fresh();
                inserts.entry(target).or_default().push(label);
                label
            };
            Op::branch_from_opcode(opcode, label).expect("checked branch opcode")
        } else {
            Op::read_operands(opcode, &mut r, pool)?
        };
        decoded.push((offset, op));
    }

    let mut ops = Vec::with_capacity(decoded.len());
    for (offset, op) in decoded {
        if let Some(labels) = inserts.remove(&offset) {
            ops.extend(labels.into_iter().map(Op::Mark));
        }
        ops.push(op);
    }
    // A label may point just past the last instruction (an exception range
    // ending at the end of the body).
    if let Some(labels) = inserts.remove(&(code.len() as u32)) {
        ops.extend(labels.into_iter().map(Op::Mark));
    }
    if let Some(offset) = inserts.keys().next() {
        return Err(Error::malformed(
            "bytecode",
            format!("branch target {offset} is not on an instruction boundary"),
        ));
    }
    Ok((ops, exceptions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::Multiname;
    use crate::ops::Reg;
    use crate::pool::{PoolCounter, PoolTable};

    fn assemble_bytes(ops: &[Op]) -> Vec<u8> {
        let mut counter = PoolCounter::default();
        assemble(ops, &mut counter).unwrap();
        let mut table = PoolTable::from_counter(counter);
        assemble(ops, &mut table).unwrap().bytes
    }

    #[test]
    fn forward_branch_is_backpatched() {
        let mut gen = LabelGen::new();
        let end = gen.fresh();
        let ops = vec![
            Op::PushTrue,
            Op::IfFalse(end),
            Op::PushNull,
            Op::Pop,
            Op::Mark(end),
            Op::ReturnVoid,
        ];
        let bytes = assemble_bytes(&ops);
        // pushtrue; iffalse +2; pushnull; pop; returnvoid
        assert_eq!(bytes, vec![0x26, 0x12, 0x02, 0x00, 0x00, 0x20, 0x29, 0x47]);
    }

    #[test]
    fn backward_branch_is_emitted_directly() {
        let mut gen = LabelGen::new();
        let top = gen.fresh();
        let ops = vec![
            Op::Label(top),
            Op::PushTrue,
            Op::IfTrue(top),
            Op::ReturnVoid,
        ];
        let bytes = assemble_bytes(&ops);
        // label; pushtrue; iftrue -6; returnvoid
        assert_eq!(bytes, vec![0x09, 0x26, 0x11, 0xfa, 0xff, 0xff, 0x47]);
    }

    #[test]
    fn unresolved_forward_jump_is_an_assertion_failure() {
        let mut gen = LabelGen::new();
        let nowhere = gen.fresh();
        let ops = vec![Op::Jump(nowhere), Op::ReturnVoid];
        let mut counter = PoolCounter::default();
        assert!(matches!(
            assemble(&ops, &mut counter),
            Err(Error::Assertion(_))
        ));
    }

    #[test]
    fn duplicate_label_is_an_assertion_failure() {
        let mut gen = LabelGen::new();
        let l = gen.fresh();
        let ops = vec![Op::Mark(l), Op::Mark(l)];
        let mut counter = PoolCounter::default();
        assert!(matches!(
            assemble(&ops, &mut counter),
            Err(Error::Assertion(_))
        ));
    }

    #[test]
    fn disassemble_assemble_roundtrips_bytes() {
        let mut gen = LabelGen::new();
        let top = gen.fresh();
        let end = gen.fresh();
        let ops = vec![
            Op::DebugLine(3),
            Op::PushByte(0),
            Op::ConvertI,
            Op::SetLocal(Reg::Fixed(1)),
            Op::Jump(end),
            Op::Label(top),
            Op::IncLocalI(Reg::Fixed(1)),
            Op::Mark(end),
            Op::GetLocal(Reg::Fixed(1)),
            Op::PushByte(3),
            Op::IfLt(top),
            Op::ReturnVoid,
        ];
        let bytes = assemble_bytes(&ops);
        let mut counter = PoolCounter::default();
        assemble(&ops, &mut counter).unwrap();
        let mut table = PoolTable::from_counter(counter);
        let (decoded, _) = disassemble(&bytes, table.pool(), Vec::new()).unwrap();
        let mut table2 = PoolTable::from_pool(table.pool().clone());
        let reassembled = assemble(&decoded, &mut table2).unwrap().bytes;
        assert_eq!(reassembled, bytes);
    }

    #[test]
    fn exception_offsets_roundtrip_through_labels() {
        let mut gen = LabelGen::new();
        let (from, to, target) = (gen.fresh(), gen.fresh(), gen.fresh());
        let end = gen.fresh();
        let ops = vec![
            Op::Mark(from),
            Op::PushNull,
            Op::Pop,
            Op::Mark(to),
            Op::Jump(end),
            Op::Mark(target),
            Op::Pop,
            Op::Pop,
            Op::Mark(end),
            Op::ReturnVoid,
        ];
        let mut counter = PoolCounter::default();
        let assembled = assemble(&ops, &mut counter).unwrap();
        assert_eq!(assembled.offset_of(from).unwrap(), 0);
        assert_eq!(assembled.offset_of(to).unwrap(), 2);
        assert_eq!(assembled.offset_of(target).unwrap(), 6);

        let table = PoolTable::from_counter(counter);
        let raw = vec![RawException {
            from: 0,
            to: 2,
            target: 6,
            exc_type: Multiname::Any,
            var_name: None,
        }];
        let (decoded, handlers) = disassemble(&assembled.bytes, table.pool(), raw).unwrap();
        let mut table2 = PoolTable::from_pool(table.pool().clone());
        let reassembled = assemble(&decoded, &mut table2).unwrap();
        assert_eq!(reassembled.bytes, assembled.bytes);
        assert_eq!(reassembled.offset_of(handlers[0].from).unwrap(), 0);
        assert_eq!(reassembled.offset_of(handlers[0].to).unwrap(), 2);
        assert_eq!(reassembled.offset_of(handlers[0].target).unwrap(), 6);
    }

    #[test]
    fn misaligned_branch_target_is_rejected() {
        // jump +1 lands in the middle of the following pushbyte.
        let bytes = vec![0x10, 0x01, 0x00, 0x00, 0x24, 0x07, 0x47];
        let pool = ConstantPool::default();
        assert!(disassemble(&bytes, &pool, Vec::new()).is_err());
    }
}
