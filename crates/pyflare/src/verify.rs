//! Stack-balance verification and register compaction.
//!
//! Both run on a finished instruction list, after generation and before the
//! body is attached to the file.
//!
//! The verifier simulates the operand stack linearly: every instruction's
//! operands must be present, a label pins the depth on first visit and must
//! see the same depth on every later one, a branch propagates its
//! post-instruction depth to its target, and the method must end balanced.
//! The maximum observed depth becomes `max_stack`; the scope stack is
//! simulated the same way for `max_scope_depth`.
//!
//! Compaction assigns wire numbers to the temporary registers the generator
//! allocated: counted by use, renumbered densely just past the parameter
//! registers (most used first, ties in allocation order), with a `debug`
//! instruction per named register inserted into the prelude.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::ops::{Op, Reg};

/// Body limits established by verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyLimits {
    pub max_stack: u32,
    pub max_scope_depth: u32,
}

/// Simulate the stack over `ops`. `method` names the body in errors.
pub fn verify(ops: &[Op], method: &str, init_scope_depth: u32) -> Result<BodyLimits> {
    let stack_err = |message: String| Error::Stack {
        method: method.to_owned(),
        message,
    };

    let mut depth: u32 = 0;
    let mut max_depth: u32 = 0;
    let mut scope_depth: u32 = init_scope_depth;
    let mut max_scope_depth: u32 = init_scope_depth;
    let mut at_label: HashMap<crate::ops::Label, u32> = HashMap::new();

    for op in ops {
        if let Some(label) = op.is_label() {
            match at_label.get(&label) {
                Some(&expected) if expected != depth => {
                    return Err(stack_err(format!(
                        "stack depth {depth} at {op:?} does not match {expected} from an earlier path"
                    )));
                }
                Some(_) => {}
                None => {
                    at_label.insert(label, depth);
                }
            }
        }

        let pops = op.stack_pops();
        if depth < pops {
            return Err(stack_err(format!(
                "not enough operands for {op:?}: needs {pops}, stack holds {depth}"
            )));
        }
        depth = depth - pops + op.stack_pushes();
        max_depth = max_depth.max(depth);

        if let Some(target) = op.target() {
            match at_label.get(&target) {
                Some(&expected) if expected != depth => {
                    return Err(stack_err(format!(
                        "branch {op:?} carries stack depth {depth} to a target expecting {expected}"
                    )));
                }
                Some(_) => {}
                None => {
                    at_label.insert(target, depth);
                }
            }
        }

        let scope = scope_depth as i64 + i64::from(op.scope_effect());
        if scope < 0 {
            return Err(stack_err(format!("{op:?} pops an empty scope stack")));
        }
        scope_depth = scope as u32;
        max_scope_depth = max_scope_depth.max(scope_depth);
    }

    if depth != 0 {
        return Err(stack_err(format!(
            "stack holds {depth} value(s) at the end of the body"
        )));
    }
    Ok(BodyLimits {
        max_stack: max_depth,
        max_scope_depth,
    })
}

/// Renumber temporary registers densely after the `reserved` parameter
/// registers. `named` associates source names with registers for the
/// debug-info prelude. Returns `local_count`.
pub fn compact_registers(ops: &mut Vec<Op>, reserved: u32, named: &[(String, Reg)]) -> u32 {
    let mut counts: IndexMap<u32, u32> = IndexMap::new();
    for op in ops.iter() {
        op.visit_regs(&mut |reg| {
            if let Reg::Temp(id) = reg {
                *counts.entry(id).or_insert(0) += 1;
            }
        });
    }

    let mut order: Vec<(u32, u32)> = counts.into_iter().collect();
    order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let assigned: HashMap<u32, u32> = order
        .iter()
        .enumerate()
        .map(|(rank, (id, _))| (*id, reserved + rank as u32))
        .collect();

    for op in ops.iter_mut() {
        op.map_regs(&mut |reg| match reg {
            Reg::Temp(id) => Reg::Fixed(assigned[&id]),
            fixed => fixed,
        });
    }

    let mut debug_ops = Vec::new();
    for (name, reg) in named {
        if let Reg::Temp(id) = reg {
            if let Some(&number) = assigned.get(id) {
                debug_ops.push(Op::Debug {
                    kind: 1,
                    name: name.clone(),
                    reg: number as u8,
                });
            }
        }
    }
    let at = ops.len().min(2);
    ops.splice(at..at, debug_ops);

    reserved + assigned.len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::LabelGen;

    #[test]
    fn max_stack_is_the_peak_depth() {
        let ops = vec![
            Op::GetLocal0,
            Op::PushScope,
            Op::PushByte(2),
            Op::PushByte(3),
            Op::Multiply,
            Op::PushByte(4),
            Op::Add,
            Op::Pop,
            Op::ReturnVoid,
        ];
        let limits = verify(&ops, "m", 1).unwrap();
        assert_eq!(limits.max_stack, 2);
        assert_eq!(limits.max_scope_depth, 2);
    }

    #[test]
    fn underflow_is_reported() {
        let ops = vec![Op::Add];
        let err = verify(&ops, "m", 0).unwrap_err();
        assert!(matches!(err, Error::Stack { .. }));
    }

    #[test]
    fn leftover_values_are_reported() {
        let ops = vec![Op::PushTrue];
        assert!(verify(&ops, "m", 0).is_err());
    }

    #[test]
    fn branch_depths_must_agree_at_the_join() {
        let mut gen = LabelGen::new();
        let join = gen.fresh();
        // One path reaches the join with one value, the other with none.
        let ops = vec![
            Op::PushTrue,
            Op::IfFalse(join),
            Op::PushByte(1),
            Op::Mark(join),
            Op::Pop,
            Op::ReturnVoid,
        ];
        assert!(verify(&ops, "m", 0).is_err());
    }

    #[test]
    fn agreeing_branch_depths_pass() {
        let mut gen = LabelGen::new();
        let join = gen.fresh();
        let ops = vec![
            Op::PushTrue,
            Op::IfFalse(join),
            Op::PushByte(1),
            Op::Pop,
            Op::Mark(join),
            Op::ReturnVoid,
        ];
        verify(&ops, "m", 0).unwrap();
    }

    #[test]
    fn compaction_renumbers_by_frequency() {
        let rare = Reg::Temp(1);
        let hot = Reg::Temp(2);
        let mut ops = vec![
            Op::PushByte(1),
            Op::SetLocal(hot),
            Op::GetLocal(hot),
            Op::SetLocal(rare),
            Op::GetLocal(hot),
            Op::Pop,
            Op::ReturnVoid,
        ];
        let local_count = compact_registers(&mut ops, 2, &[]);
        assert_eq!(local_count, 4);
        // `hot` is used three times and takes the first free register.
        assert_eq!(ops[1], Op::SetLocal(Reg::Fixed(2)));
        assert_eq!(ops[3], Op::SetLocal(Reg::Fixed(3)));
    }

    #[test]
    fn named_registers_get_debug_entries() {
        let x = Reg::Temp(1);
        let mut ops = vec![
            Op::DebugFile("f.py".into()),
            Op::DebugLine(1),
            Op::GetLocal0,
            Op::PushScope,
            Op::PushByte(9),
            Op::SetLocal(x),
            Op::ReturnVoid,
        ];
        compact_registers(&mut ops, 1, &[("x".to_owned(), x)]);
        match &ops[2] {
            Op::Debug { kind: 1, name, reg } => {
                assert_eq!(name, "x");
                assert_eq!(*reg, 1);
            }
            other => panic!("expected a debug op, found {other:?}"),
        }
    }

    #[test]
    fn fixed_registers_survive_untouched() {
        let mut ops = vec![Op::GetLocal(Reg::Fixed(1)), Op::Pop, Op::ReturnVoid];
        let local_count = compact_registers(&mut ops, 2, &[]);
        assert_eq!(local_count, 2);
        assert_eq!(ops[0], Op::GetLocal(Reg::Fixed(1)));
    }
}
