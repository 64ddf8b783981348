//! Cleanup passes over a lowered method.

use std::collections::{HashMap, HashSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::dex::error::DexError;
use crate::transform::jvm::{JvmInst, Label, LoweredMethod};

/// How much cleanup to run after lowering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptLevel {
    /// Frame sizes only.
    #[serde(alias = "fast")]
    None,
    #[default]
    #[serde(alias = "optimized")]
    Normal,
}

/// A rewrite over a lowered method. Every pass is idempotent.
pub trait Pass {
    fn name(&self) -> &'static str;

    /// Applies the pass, returning whether the method changed.
    fn apply(&self, method: &mut LoweredMethod) -> Result<bool, DexError>;
}

/// Drops a store immediately followed by a final load of the same slot,
/// leaving the value on the stack. Only `nop` placeholders may sit between
/// the two.
pub struct EliminateStoreLoad;

impl Pass for EliminateStoreLoad {
    fn name(&self) -> &'static str {
        "store-load"
    }

    fn apply(&self, method: &mut LoweredMethod) -> Result<bool, DexError> {
        let code = &mut method.instructions;
        let mut changed = false;
        loop {
            let mut found = None;
            for (i, insn) in code.iter().enumerate() {
                let JvmInst::Store { kind, slot } = insn else {
                    continue;
                };
                let next = code[i + 1..].iter().position(|n| *n != JvmInst::Nop).map(|p| i + 1 + p);
                if let Some(j) = next {
                    if code[j] == (JvmInst::Load { kind: *kind, slot: *slot, last_use: true }) {
                        found = Some((i, j));
                        break;
                    }
                }
            }
            let Some((i, j)) = found else {
                break;
            };
            code.remove(j);
            code.remove(i);
            changed = true;
        }
        Ok(changed)
    }
}

pub struct RemoveNop;

impl Pass for RemoveNop {
    fn name(&self) -> &'static str {
        "remove-nop"
    }

    fn apply(&self, method: &mut LoweredMethod) -> Result<bool, DexError> {
        let before = method.instructions.len();
        method.instructions.retain(|i| *i != JvmInst::Nop);
        Ok(method.instructions.len() != before)
    }
}

/// Computes `max_stack` and `max_locals`.
///
/// The operand stack is empty at every label except handler entries, which
/// hold the caught exception, so one linear walk gives the maximum depth.
pub struct FrameSize;

impl Pass for FrameSize {
    fn name(&self) -> &'static str {
        "frame-size"
    }

    fn apply(&self, method: &mut LoweredMethod) -> Result<bool, DexError> {
        let handlers: HashSet<Label> = method.handler_labels().into_iter().collect();

        let mut depth: u16 = 0;
        let mut max_stack: u16 = 0;
        let mut max_locals: u16 = method.arguments;
        let mut falls_through = true;
        for insn in &method.instructions {
            if let JvmInst::Label(l) = insn {
                if falls_through && depth != 0 {
                    fail!(kind = Structural, "{} words left on the stack at {}", depth, l);
                }
                depth = if handlers.contains(l) { 1 } else { 0 };
                max_stack = max_stack.max(depth);
                falls_through = true;
                continue;
            }

            let (pops, pushes) = insn.stack_effect();
            if pops > depth {
                fail!(kind = Structural, "stack underflow at `{}`", insn);
            }
            depth = depth - pops + pushes;
            max_stack = max_stack.max(depth);

            match insn {
                JvmInst::Load { kind, slot, .. } | JvmInst::Store { kind, slot } => {
                    max_locals = max_locals.max(slot + kind.width());
                }
                JvmInst::IInc { slot, .. } => max_locals = max_locals.max(slot + 1),
                _ => {}
            }
            falls_through = !matches!(
                insn,
                JvmInst::Goto(_)
                    | JvmInst::Return(_)
                    | JvmInst::AThrow
                    | JvmInst::TableSwitch { .. }
                    | JvmInst::LookupSwitch { .. }
            );
        }

        let changed = method.max_stack != max_stack || method.max_locals != max_locals;
        method.max_stack = max_stack;
        method.max_locals = max_locals;
        Ok(changed)
    }
}

/// Passes run at `level`, in order.
pub fn pipeline(level: OptLevel) -> Vec<Box<dyn Pass>> {
    match level {
        OptLevel::None => vec![Box::new(FrameSize)],
        OptLevel::Normal => vec![Box::new(EliminateStoreLoad), Box::new(RemoveNop), Box::new(FrameSize)],
    }
}

/// Runs the pipeline for `level`, then drops try ranges that no longer cover
/// any instruction.
pub fn cleanup(method: &mut LoweredMethod, level: OptLevel) -> Result<(), DexError> {
    for pass in pipeline(level) {
        let changed = pass.apply(method)?;
        debug!("{:>12} {} {}", pass.name(), method.name, if changed { "changed" } else { "unchanged" });
    }
    drop_empty_ranges(method)
}

fn drop_empty_ranges(method: &mut LoweredMethod) -> Result<(), DexError> {
    // position of each label counted in real instructions
    let mut position: HashMap<Label, usize> = HashMap::new();
    let mut count = 0;
    for insn in &method.instructions {
        match insn {
            JvmInst::Label(l) => {
                position.insert(*l, count);
            }
            _ => count += 1,
        }
    }

    let mut kept = Vec::with_capacity(method.try_catches.len());
    for tc in method.try_catches.drain(..) {
        let (Some(start), Some(end)) = (position.get(&tc.start), position.get(&tc.end)) else {
            fail!(kind = Structural, "try range {}..{} has no label in the method", tc.start, tc.end);
        };
        if start < end {
            kept.push(tc);
        }
    }
    method.try_catches = kept;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::container::AccessFlags;
    use crate::dex::error::ErrorKind;
    use crate::dex::instructions::{ArithOp, NumKind};
    use crate::transform::jvm::{Constant, SlotKind, TryCatch};

    fn method(instructions: Vec<JvmInst>) -> LoweredMethod {
        LoweredMethod {
            name: "f".to_string(),
            descriptor: "(I)I".to_string(),
            access: AccessFlags::STATIC,
            arguments: 1,
            instructions,
            try_catches: vec![],
            max_stack: 0,
            max_locals: 0,
        }
    }

    fn load(slot: u16, last_use: bool) -> JvmInst {
        JvmInst::Load { kind: SlotKind::Int, slot, last_use }
    }

    fn store(slot: u16) -> JvmInst {
        JvmInst::Store { kind: SlotKind::Int, slot }
    }

    #[test]
    fn store_load_pairs_collapse()
    {
        let mut m = method(vec![
            load(0, true),
            JvmInst::Push(Constant::Int(1)),
            JvmInst::Binary(ArithOp::Add, NumKind::Int),
            store(1),
            JvmInst::Nop,
            load(1, true),
            JvmInst::Return(Some(SlotKind::Int)),
        ]);
        assert!(EliminateStoreLoad.apply(&mut m).unwrap());
        assert_eq!(
            m.instructions,
            vec![
                load(0, true),
                JvmInst::Push(Constant::Int(1)),
                JvmInst::Binary(ArithOp::Add, NumKind::Int),
                JvmInst::Nop,
                JvmInst::Return(Some(SlotKind::Int)),
            ]
        );
        // idempotent
        let snapshot = m.clone();
        assert!(!EliminateStoreLoad.apply(&mut m).unwrap());
        assert_eq!(m, snapshot);
    }

    #[test]
    fn live_values_and_labels_block_elimination()
    {
        let original = vec![
            load(0, true),
            store(1),
            load(1, false),
            store(2),
            JvmInst::Label(Label(4)),
            load(2, true),
            JvmInst::Pop,
            load(1, true),
            JvmInst::Return(Some(SlotKind::Int)),
        ];
        let mut m = method(original.clone());
        assert!(!EliminateStoreLoad.apply(&mut m).unwrap());
        assert_eq!(m.instructions, original);
    }

    #[test]
    fn nops_are_removed()
    {
        let mut m = method(vec![JvmInst::Nop, JvmInst::Return(None), JvmInst::Nop]);
        assert!(RemoveNop.apply(&mut m).unwrap());
        assert_eq!(m.instructions, vec![JvmInst::Return(None)]);
        assert!(!RemoveNop.apply(&mut m).unwrap());
    }

    #[test]
    fn frame_sizes()
    {
        let mut m = method(vec![
            JvmInst::Push(Constant::Long(3)),
            JvmInst::Push(Constant::Long(4)),
            JvmInst::Binary(ArithOp::Add, NumKind::Long),
            JvmInst::Store { kind: SlotKind::Long, slot: 4 },
            JvmInst::Return(None),
            JvmInst::Label(Label(9)),
            JvmInst::AThrow,
        ]);
        m.try_catches.push(TryCatch { start: Label(0), end: Label(9), handler: Label(9), catch_type: None });
        m.instructions.insert(0, JvmInst::Label(Label(0)));
        FrameSize.apply(&mut m).unwrap();
        assert_eq!(m.max_stack, 4);
        assert_eq!(m.max_locals, 6);
    }

    #[test]
    fn frame_size_rejects_underflow()
    {
        let mut m = method(vec![JvmInst::Pop, JvmInst::Return(None)]);
        let err = FrameSize.apply(&mut m).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Structural);
    }

    #[test]
    fn level_none_keeps_stores()
    {
        let code = vec![JvmInst::Nop, load(0, true), store(1), load(1, true), JvmInst::Return(Some(SlotKind::Int))];
        let mut m = method(code.clone());
        cleanup(&mut m, OptLevel::None).unwrap();
        assert_eq!(m.instructions, code);
        assert_eq!((m.max_stack, m.max_locals), (1, 2));

        cleanup(&mut m, OptLevel::Normal).unwrap();
        assert_eq!(m.instructions, vec![load(0, true), JvmInst::Return(Some(SlotKind::Int))]);
        assert_eq!((m.max_stack, m.max_locals), (1, 1));
    }

    #[test]
    fn level_names()
    {
        use serde::de::value::{Error, StrDeserializer};
        use serde::de::IntoDeserializer;

        let level = |name: &str| {
            let d: StrDeserializer<Error> = name.into_deserializer();
            OptLevel::deserialize(d)
        };
        assert_eq!(level("none").unwrap(), OptLevel::None);
        assert_eq!(level("fast").unwrap(), OptLevel::None);
        assert_eq!(level("normal").unwrap(), OptLevel::Normal);
        assert_eq!(level("optimized").unwrap(), OptLevel::Normal);
        assert!(level("aggressive").is_err());
        assert_eq!(OptLevel::default(), OptLevel::Normal);
    }

    #[test]
    fn empty_try_ranges_are_dropped()
    {
        let mut m = method(vec![
            JvmInst::Label(Label(0)),
            JvmInst::Nop,
            JvmInst::Label(Label(1)),
            JvmInst::Return(None),
            JvmInst::Label(Label(2)),
            JvmInst::AThrow,
        ]);
        m.try_catches.push(TryCatch { start: Label(0), end: Label(1), handler: Label(2), catch_type: None });
        cleanup(&mut m, OptLevel::Normal).unwrap();
        assert!(m.try_catches.is_empty());
    }
}
