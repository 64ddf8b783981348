//! Register-to-stack lowering of one method.
//!
//! Every Dalvik instruction becomes loads of its source registers, the
//! stack operation, and a store of its destination. Parameter registers (the
//! last `ins_size` registers) map to local slots `0..ins_size` and the other
//! registers follow them, so the argument layout matches the JVM calling
//! convention.

use std::collections::{BTreeSet, HashSet};

use log::debug;

use crate::analysis::bitset::BitSet;
use crate::analysis::cfg::{BlockId, Cfg};
use crate::analysis::liveness::LivenessInfo;
use crate::dex::descriptors::{FieldRef, MethodDescriptor, MethodRef, RefResolver, TypeDescriptor, TypeRef};
use crate::dex::error::{Context, DexError};
use crate::dex::instructions::{
    ArithOp, ArrayOperation, BinaryOperation, CompareType, DecodedInstruction, InvokeKind, NumKind, Operands,
    PoolRef, UnaryOperation,
};
use crate::dex::opcodes::{ConstKind, Family, ValueKind};
use crate::transform::frame::StackFrame;
use crate::transform::jvm::{
    ArrayKind, Constant, InvokeType, JvmInst, Label, LoweredMethod, SlotKind, TryCatch, Truncation,
};

/// Lowers `method` into an unoptimised JVM instruction list.
pub fn lower(
    method: &MethodDescriptor,
    cfg: &Cfg,
    liveness: &LivenessInfo,
    resolver: &dyn RefResolver,
) -> Result<LoweredMethod, DexError> {
    let mut lowering = Lowering::new(method, cfg, liveness, resolver)?;
    let blocks = lowering.lower_blocks().context(|| method.to_string())?;
    let try_catches = lowering.try_catches().context(|| method.to_string())?;
    let instructions = assemble(cfg, blocks, &try_catches)?;

    debug!(
        "lowered {}: {} blocks, {} instructions, {} try entries",
        method,
        cfg.block_count(),
        instructions.len(),
        try_catches.len()
    );
    Ok(LoweredMethod {
        name: method.name.clone(),
        descriptor: method.descriptor(),
        access: method.access,
        arguments: method.ins_size(),
        instructions,
        try_catches,
        max_stack: 0,
        max_locals: 0,
    })
}

struct Lowering<'a, 'm> {
    method: &'a MethodDescriptor,
    cfg: &'a Cfg<'m>,
    liveness: &'a LivenessInfo,
    resolver: &'a dyn RefResolver,
    registers: u16,
    ins: u16,
    first_param: u16,
    return_kind: Option<SlotKind>,
    /// `move-result*` offsets already emitted with the instruction before them.
    consumed: HashSet<u32>,
}

/// Per-block lowering state.
struct BlockContext {
    block: BlockId,
    frame: StackFrame,
    out: Vec<JvmInst>,
    /// Frame joined over every instruction that may throw into a handler.
    throw_frame: Option<StackFrame>,
}

impl<'a, 'm> Lowering<'a, 'm> {
    fn new(
        method: &'a MethodDescriptor,
        cfg: &'a Cfg<'m>,
        liveness: &'a LivenessInfo,
        resolver: &'a dyn RefResolver,
    ) -> Result<Lowering<'a, 'm>, DexError> {
        let registers = method.registers_size();
        let ins = method.ins_size();
        if ins > registers {
            fail!(kind = Structural, "{} has {} argument registers but only {} registers", method, ins, registers);
        }
        let return_kind = match method.proto.return_type.as_ref() {
            TypeDescriptor::Void => None,
            ty => Some(SlotKind::of(ty)?),
        };
        Ok(Lowering {
            method,
            cfg,
            liveness,
            resolver,
            registers,
            ins,
            first_param: registers - ins,
            return_kind,
            consumed: HashSet::new(),
        })
    }

    /// Lowers every block in reverse postorder, so each block sees the exit
    /// frames of all its forward predecessors. Returns the code per block id.
    fn lower_blocks(&mut self) -> Result<Vec<Vec<JvmInst>>, DexError> {
        let n = self.cfg.block_count();
        let mut entry: Vec<Option<StackFrame>> = vec![None; n];
        let mut exit: Vec<Option<StackFrame>> = vec![None; n];
        let mut throw: Vec<Option<StackFrame>> = vec![None; n];
        let mut code: Vec<Vec<JvmInst>> = vec![vec![]; n];

        let (cfg, liveness) = (self.cfg, self.liveness);
        for b in cfg.reverse_postorder() {
            let block = cfg.block(b);
            let live = &liveness.live_in[b];

            let mut frame: Option<StackFrame> = None;
            if b == 0 {
                frame = Some(StackFrame::entry(self.method)?);
            }
            let incoming = block
                .preds
                .iter()
                .filter_map(|p| exit[*p].as_ref())
                .chain(block.exception_preds.iter().filter_map(|p| throw[*p].as_ref()));
            for f in incoming {
                match frame.as_mut() {
                    None => frame = Some(f.clone()),
                    Some(acc) => acc.merge(f, live).context(|| format!("block {}", b))?,
                }
            }
            let frame = frame.unwrap_or_else(|| StackFrame::new(self.registers));
            entry[b] = Some(frame.clone());

            let mut ctx = BlockContext { block: b, frame, out: vec![], throw_frame: None };
            self.lower_block(&mut ctx)?;

            // frames flowing along back edges must agree with the fixed entry frame
            for s in &block.succs {
                if let Some(target) = &entry[*s] {
                    target.check_compatible(&ctx.frame, &liveness.live_in[*s]).context(|| format!("block {}", s))?;
                }
            }
            if let Some(tf) = &ctx.throw_frame {
                for h in &block.handlers {
                    if let Some(target) = &entry[*h] {
                        target.check_compatible(tf, &liveness.live_in[*h]).context(|| format!("block {}", h))?;
                    }
                }
            }

            code[b] = ctx.out;
            exit[b] = Some(ctx.frame);
            throw[b] = ctx.throw_frame;
        }
        Ok(code)
    }

    fn lower_block(&mut self, ctx: &mut BlockContext) -> Result<(), DexError> {
        let (cfg, liveness) = (self.cfg, self.liveness);
        let block = cfg.block(ctx.block);
        let insns: Vec<&'m DecodedInstruction> = cfg.instructions(ctx.block).collect();

        let mut handler_live = BitSet::new_empty(self.registers as usize);
        for h in &block.handlers {
            handler_live.union_with(&liveness.live_in[*h]);
        }

        if block.is_handler {
            // the caught exception is on the stack at handler entry
            let stores_it = matches!(insns.first().map(|i| i.family()), Some(Family::MoveException));
            if !stores_it {
                ctx.out.push(JvmInst::Pop);
            }
        }

        for (i, insn) in insns.iter().enumerate() {
            if self.consumed.contains(&insn.offset) {
                continue;
            }
            if insn.opcode.can_throw() && !block.handlers.is_empty() {
                match ctx.throw_frame.as_mut() {
                    None => ctx.throw_frame = Some(ctx.frame.clone()),
                    Some(tf) => tf.merge(&ctx.frame, &handler_live)?,
                }
            }
            let start = ctx.out.len();
            let at_handler_entry = i == 0 && block.is_handler;
            self.lower_insn(ctx, insn, at_handler_entry).context(|| insn.to_string())?;
            keep_final_last_use(&mut ctx.out[start..]);
        }
        Ok(())
    }

    fn slot(&self, reg: u16, kind: SlotKind) -> Result<u16, DexError> {
        let width = kind.width();
        if reg + width > self.registers {
            fail!(kind = Structural, "register v{} exceeds the {} registers of the frame", reg + width - 1, self.registers);
        }
        if reg < self.first_param {
            if reg + width > self.first_param {
                fail!(kind = Structural, "wide register pair v{} straddles the argument registers", reg);
            }
            Ok(reg + self.ins)
        } else {
            Ok(reg - self.first_param)
        }
    }

    fn load(&self, ctx: &mut BlockContext, insn: &DecodedInstruction, reg: u16, kind: SlotKind) -> Result<(), DexError> {
        let slot = self.slot(reg, kind)?;
        let mut last_use = self.liveness.is_last_use(insn.offset, reg);
        if kind.is_wide() {
            last_use = last_use && self.liveness.is_last_use(insn.offset, reg + 1);
        }
        ctx.out.push(JvmInst::Load { kind, slot, last_use });
        Ok(())
    }

    fn store(&self, ctx: &mut BlockContext, reg: u16, kind: SlotKind) -> Result<(), DexError> {
        let slot = self.slot(reg, kind)?;
        ctx.out.push(JvmInst::Store { kind, slot });
        ctx.frame.set(reg, kind);
        Ok(())
    }

    fn lower_insn(&mut self, ctx: &mut BlockContext, insn: &DecodedInstruction, at_handler_entry: bool) -> Result<(), DexError> {
        let regs = insn.registers();
        let reg = |i: usize| operand(&regs, i);

        match insn.family() {
            Family::Nop => ctx.out.push(JvmInst::Nop),
            Family::Move(vk) => {
                let (dst, src) = (reg(0)?, reg(1)?);
                let kind = move_kind(vk, ctx.frame.get(src));
                self.load(ctx, insn, src, kind)?;
                self.store(ctx, dst, kind)?;
            }
            Family::MoveResult(_) => {
                fail!(kind = Structural, "{} does not follow an invoke or filled-new-array", insn.opcode.name);
            }
            Family::MoveException => {
                if !at_handler_entry {
                    fail!(kind = Structural, "move-exception outside a handler entry");
                }
                self.store(ctx, reg(0)?, SlotKind::Reference)?;
            }
            Family::ReturnVoid => ctx.out.push(JvmInst::Return(None)),
            Family::Return(_) => {
                let Some(kind) = self.return_kind else {
                    fail!(kind = Structural, "value returned from a void method");
                };
                self.load(ctx, insn, reg(0)?, kind)?;
                ctx.out.push(JvmInst::Return(Some(kind)));
            }
            Family::Const(ck) => self.lower_const(ctx, insn, ck)?,
            Family::MonitorEnter | Family::MonitorExit | Family::Throw => {
                self.load(ctx, insn, reg(0)?, SlotKind::Reference)?;
                ctx.out.push(match insn.family() {
                    Family::MonitorEnter => JvmInst::MonitorEnter,
                    Family::MonitorExit => JvmInst::MonitorExit,
                    _ => JvmInst::AThrow,
                });
            }
            Family::CheckCast => {
                let ty = self.type_operand(insn)?;
                let r = reg(0)?;
                self.load(ctx, insn, r, SlotKind::Reference)?;
                ctx.out.push(JvmInst::CheckCast(ty));
                self.store(ctx, r, SlotKind::Reference)?;
            }
            Family::InstanceOf => {
                let ty = self.type_operand(insn)?;
                self.load(ctx, insn, reg(1)?, SlotKind::Reference)?;
                ctx.out.push(JvmInst::InstanceOf(ty));
                self.store(ctx, reg(0)?, SlotKind::Int)?;
            }
            Family::ArrayLength => {
                self.load(ctx, insn, reg(1)?, SlotKind::Reference)?;
                ctx.out.push(JvmInst::ArrayLength);
                self.store(ctx, reg(0)?, SlotKind::Int)?;
            }
            Family::NewInstance => {
                let ty = self.type_operand(insn)?;
                ctx.out.push(JvmInst::New(ty));
                self.store(ctx, reg(0)?, SlotKind::Reference)?;
            }
            Family::NewArray => {
                let ty = self.type_operand(insn)?;
                if ty.element().is_none() {
                    fail!(kind = Structural, "new-array of non-array type {}", ty);
                }
                self.load(ctx, insn, reg(1)?, SlotKind::Int)?;
                ctx.out.push(JvmInst::NewArray(ty));
                self.store(ctx, reg(0)?, SlotKind::Reference)?;
            }
            Family::FilledNewArray => self.lower_filled_new_array(ctx, insn)?,
            Family::FillArrayData => self.lower_fill_array_data(ctx, insn)?,
            Family::Goto => ctx.out.push(JvmInst::Goto(branch_target(insn)?)),
            Family::Switch => self.lower_switch(ctx, insn)?,
            Family::Compare(ct) => {
                let kind = match ct {
                    CompareType::LessThanFloat | CompareType::GreaterThanFloat => SlotKind::Float,
                    CompareType::LessThanDouble | CompareType::GreaterThanDouble => SlotKind::Double,
                    CompareType::Long => SlotKind::Long,
                };
                self.load(ctx, insn, reg(1)?, kind)?;
                self.load(ctx, insn, reg(2)?, kind)?;
                ctx.out.push(JvmInst::Compare(ct));
                self.store(ctx, reg(0)?, SlotKind::Int)?;
            }
            Family::If(test) => {
                let (a, b) = (reg(0)?, reg(1)?);
                let reference = ctx.frame.get(a) == Some(SlotKind::Reference) || ctx.frame.get(b) == Some(SlotKind::Reference);
                if reference && !test.is_equality() {
                    fail!(kind = Structural, "ordered comparison of references in v{} and v{}", a, b);
                }
                let kind = if reference { SlotKind::Reference } else { SlotKind::Int };
                self.load(ctx, insn, a, kind)?;
                self.load(ctx, insn, b, kind)?;
                ctx.out.push(JvmInst::IfCompare { test, reference, target: branch_target(insn)? });
            }
            Family::IfZ(test) => {
                let a = reg(0)?;
                let reference = ctx.frame.get(a) == Some(SlotKind::Reference);
                if reference && !test.is_equality() {
                    fail!(kind = Structural, "ordered comparison of reference v{} with null", a);
                }
                let kind = if reference { SlotKind::Reference } else { SlotKind::Int };
                self.load(ctx, insn, a, kind)?;
                ctx.out.push(JvmInst::IfZero { test, reference, target: branch_target(insn)? });
            }
            Family::Array(op) => self.lower_array(ctx, insn, op)?,
            Family::Instance(op) => {
                let field = self.field_operand(insn)?;
                let kind = SlotKind::of(&field.field_type)?;
                let (value, object) = (reg(0)?, reg(1)?);
                self.load(ctx, insn, object, SlotKind::Reference)?;
                if op.is_put() {
                    self.load(ctx, insn, value, kind)?;
                    ctx.out.push(JvmInst::PutField(field));
                } else {
                    ctx.out.push(JvmInst::GetField(field));
                    self.store(ctx, value, kind)?;
                }
            }
            Family::Static(op) => {
                let field = self.field_operand(insn)?;
                let kind = SlotKind::of(&field.field_type)?;
                let value = reg(0)?;
                if op.is_put() {
                    self.load(ctx, insn, value, kind)?;
                    ctx.out.push(JvmInst::PutStatic(field));
                } else {
                    ctx.out.push(JvmInst::GetStatic(field));
                    self.store(ctx, value, kind)?;
                }
            }
            Family::Invoke(kind) => self.lower_invoke(ctx, insn, kind)?,
            Family::InvokePolymorphic | Family::InvokeCustom => {
                fail!(kind = Unsupported, "{} cannot be lowered", insn.opcode.name);
            }
            Family::Unary(op) => self.lower_unary(ctx, insn, op)?,
            Family::Binary(op) => {
                let (arith, num) = op.split();
                self.lower_binary(ctx, insn, arith, num, reg(0)?, reg(1)?, reg(2)?)?;
            }
            Family::Binary2Addr(op) => {
                let (arith, num) = op.split();
                let a = reg(0)?;
                self.lower_binary(ctx, insn, arith, num, a, a, reg(1)?)?;
            }
            Family::BinaryLit(op) => self.lower_binary_lit(ctx, insn, op)?,
        }
        Ok(())
    }

    fn lower_const(&mut self, ctx: &mut BlockContext, insn: &DecodedInstruction, ck: ConstKind) -> Result<(), DexError> {
        let dst = operand(&insn.registers(), 0)?;
        let constant = match ck {
            ConstKind::Narrow => {
                let value = literal(insn)?;
                match self.infer_kind(ctx.block, insn, dst, false)? {
                    SlotKind::Float => Constant::Float(f32::from_bits(value as u32)),
                    SlotKind::Reference if value == 0 => Constant::Null,
                    SlotKind::Reference => {
                        fail!(kind = Structural, "non-zero literal {} used as a reference in v{}", value, dst);
                    }
                    _ => Constant::Int(value as i32),
                }
            }
            ConstKind::Wide => {
                let value = literal(insn)?;
                match self.infer_kind(ctx.block, insn, dst, true)? {
                    SlotKind::Double => Constant::Double(f64::from_bits(value as u64)),
                    _ => Constant::Long(value),
                }
            }
            ConstKind::String => match insn.operands.reference() {
                Some(PoolRef::String(idx)) => Constant::String(self.resolver.string(idx)?),
                other => fail!(kind = Structural, "const-string without a string operand: {:?}", other),
            },
            ConstKind::Class => Constant::Class(self.type_operand(insn)?),
            ConstKind::MethodHandle | ConstKind::MethodType => {
                fail!(kind = Unsupported, "{} cannot be lowered", insn.opcode.name);
            }
        };
        let kind = constant.kind();
        ctx.out.push(JvmInst::Push(constant));
        self.store(ctx, dst, kind)
    }

    fn lower_invoke(&mut self, ctx: &mut BlockContext, insn: &DecodedInstruction, kind: InvokeKind) -> Result<(), DexError> {
        let method = self.method_operand(insn)?;
        let is_static = kind == InvokeKind::Static;
        let arg_kinds = argument_kinds(&method, is_static)?;
        let regs = insn.registers();
        if regs.len() != arg_kinds.len() {
            fail!(
                kind = Structural,
                "{} passes {} argument registers to {}, which takes {}",
                insn.opcode.name,
                regs.len(),
                method,
                arg_kinds.len()
            );
        }
        for (r, k) in regs.iter().zip(arg_kinds.iter()) {
            if let Some(k) = k {
                self.load(ctx, insn, *r, *k)?;
            }
        }
        let ty = match kind {
            InvokeKind::Virtual => InvokeType::Virtual,
            InvokeKind::Super | InvokeKind::Direct => InvokeType::Special,
            InvokeKind::Static => InvokeType::Static,
            InvokeKind::Interface => InvokeType::Interface,
        };
        let result = match method.proto.return_type.as_ref() {
            TypeDescriptor::Void => None,
            ret => Some(SlotKind::of(ret)?),
        };
        ctx.out.push(JvmInst::Invoke(ty, method));
        self.take_result(ctx, insn, result)
    }

    /// Stores the value left by `insn` into the register named by the
    /// `move-result*` after it, or drops it when there is none.
    fn take_result(&mut self, ctx: &mut BlockContext, insn: &DecodedInstruction, result: Option<SlotKind>) -> Result<(), DexError> {
        let next = self.cfg.instruction(insn.next_offset());
        let move_result = next.filter(|n| insn.opcode.sets_result() && matches!(n.family(), Family::MoveResult(_)));
        match (move_result, result) {
            (Some(n), Some(kind)) => {
                let expected = match n.family() {
                    Family::MoveResult(ValueKind::Wide) => kind.is_wide(),
                    Family::MoveResult(ValueKind::Object) => kind == SlotKind::Reference,
                    _ => !kind.is_wide() && kind != SlotKind::Reference,
                };
                if !expected {
                    fail!(kind = Structural, "{} does not match a {:?} result", n.opcode.name, kind);
                }
                self.consumed.insert(n.offset);
                self.store(ctx, operand(&n.registers(), 0)?, kind)?;
            }
            (Some(n), None) => fail!(kind = Structural, "{} after a call that returns nothing", n.opcode.name),
            (None, Some(kind)) => ctx.out.push(if kind.is_wide() { JvmInst::Pop2 } else { JvmInst::Pop }),
            (None, None) => {}
        }
        Ok(())
    }

    fn lower_filled_new_array(&mut self, ctx: &mut BlockContext, insn: &DecodedInstruction) -> Result<(), DexError> {
        let ty = self.type_operand(insn)?;
        let Some(element) = ty.element() else {
            fail!(kind = Structural, "filled-new-array of non-array type {}", ty);
        };
        let array_kind = ArrayKind::of(element)?;
        let regs = insn.registers();
        ctx.out.push(JvmInst::Push(Constant::Int(regs.len() as i32)));
        ctx.out.push(JvmInst::NewArray(ty.clone()));
        for (i, r) in regs.iter().enumerate() {
            ctx.out.push(JvmInst::Dup);
            ctx.out.push(JvmInst::Push(Constant::Int(i as i32)));
            self.load(ctx, insn, *r, array_kind.value_kind())?;
            ctx.out.push(JvmInst::ArrayStore(array_kind));
        }
        self.take_result(ctx, insn, Some(SlotKind::Reference))
    }

    fn lower_fill_array_data(&mut self, ctx: &mut BlockContext, insn: &DecodedInstruction) -> Result<(), DexError> {
        let Operands::ArrayData { reg, width, elements } = &insn.operands else {
            fail!(kind = Structural, "fill-array-data without a payload");
        };
        let hinted = self.array_hint(ctx.block, insn, *reg)?;
        let array_kind = match (hinted, width) {
            (Some(k), _) => k,
            (None, 1) => ArrayKind::Byte,
            (None, 2) => ArrayKind::Short,
            (None, 8) => ArrayKind::Long,
            (None, _) => ArrayKind::Int,
        };
        for (i, value) in elements.iter().enumerate() {
            self.load(ctx, insn, *reg, SlotKind::Reference)?;
            ctx.out.push(JvmInst::Push(Constant::Int(i as i32)));
            let constant = match array_kind {
                ArrayKind::Long => Constant::Long(*value),
                ArrayKind::Double => Constant::Double(f64::from_bits(*value as u64)),
                ArrayKind::Float => Constant::Float(f32::from_bits(*value as u32)),
                _ => Constant::Int(*value as i32),
            };
            ctx.out.push(JvmInst::Push(constant));
            ctx.out.push(JvmInst::ArrayStore(array_kind));
        }
        Ok(())
    }

    fn lower_switch(&mut self, ctx: &mut BlockContext, insn: &DecodedInstruction) -> Result<(), DexError> {
        let Operands::Switch { reg, packed, cases } = &insn.operands else {
            fail!(kind = Structural, "switch without a payload");
        };
        self.load(ctx, insn, *reg, SlotKind::Int)?;
        let default = Label(insn.next_offset());
        if *packed && !cases.is_empty() {
            ctx.out.push(JvmInst::TableSwitch {
                low: cases[0].0,
                targets: cases.iter().map(|(_, t)| Label(*t)).collect(),
                default,
            });
        } else {
            let mut pairs: Vec<(i32, Label)> = cases.iter().map(|(k, t)| (*k, Label(*t))).collect();
            pairs.sort_by_key(|(k, _)| *k);
            ctx.out.push(JvmInst::LookupSwitch { pairs, default });
        }
        Ok(())
    }

    fn lower_array(&mut self, ctx: &mut BlockContext, insn: &DecodedInstruction, op: ArrayOperation) -> Result<(), DexError> {
        let regs = insn.registers();
        let (value, array, index) = (operand(&regs, 0)?, operand(&regs, 1)?, operand(&regs, 2)?);
        let hint = self.array_hint(ctx.block, insn, array)?;

        let array_kind = match op {
            ArrayOperation::Get | ArrayOperation::Put => match hint {
                Some(k @ (ArrayKind::Int | ArrayKind::Float)) => k,
                _ if op.is_put() && ctx.frame.get(value) == Some(SlotKind::Float) => ArrayKind::Float,
                _ if !op.is_put() && self.infer_kind(ctx.block, insn, value, false)? == SlotKind::Float => ArrayKind::Float,
                _ => ArrayKind::Int,
            },
            ArrayOperation::GetWide | ArrayOperation::PutWide => match hint {
                Some(k @ (ArrayKind::Long | ArrayKind::Double)) => k,
                _ if op.is_put() && ctx.frame.get(value) == Some(SlotKind::Double) => ArrayKind::Double,
                _ if !op.is_put() && self.infer_kind(ctx.block, insn, value, true)? == SlotKind::Double => ArrayKind::Double,
                _ => ArrayKind::Long,
            },
            ArrayOperation::GetObject | ArrayOperation::PutObject => ArrayKind::Reference,
            ArrayOperation::GetBoolean
            | ArrayOperation::PutBoolean
            | ArrayOperation::GetByte
            | ArrayOperation::PutByte => ArrayKind::Byte,
            ArrayOperation::GetChar | ArrayOperation::PutChar => ArrayKind::Char,
            ArrayOperation::GetShort | ArrayOperation::PutShort => ArrayKind::Short,
        };

        self.load(ctx, insn, array, SlotKind::Reference)?;
        self.load(ctx, insn, index, SlotKind::Int)?;
        if op.is_put() {
            self.load(ctx, insn, value, array_kind.value_kind())?;
            ctx.out.push(JvmInst::ArrayStore(array_kind));
        } else {
            ctx.out.push(JvmInst::ArrayLoad(array_kind));
            self.store(ctx, value, array_kind.value_kind())?;
        }
        Ok(())
    }

    fn lower_unary(&mut self, ctx: &mut BlockContext, insn: &DecodedInstruction, op: UnaryOperation) -> Result<(), DexError> {
        let regs = insn.registers();
        let (dst, src) = (operand(&regs, 0)?, operand(&regs, 1)?);
        let (from, to) = op.kinds();
        self.load(ctx, insn, src, from.into())?;
        match op {
            UnaryOperation::NegateInt
            | UnaryOperation::NegateLong
            | UnaryOperation::NegateFloat
            | UnaryOperation::NegateDouble => ctx.out.push(JvmInst::Neg(from)),
            UnaryOperation::NotInt => {
                ctx.out.push(JvmInst::Push(Constant::Int(-1)));
                ctx.out.push(JvmInst::Binary(ArithOp::Xor, NumKind::Int));
            }
            UnaryOperation::NotLong => {
                ctx.out.push(JvmInst::Push(Constant::Long(-1)));
                ctx.out.push(JvmInst::Binary(ArithOp::Xor, NumKind::Long));
            }
            UnaryOperation::IntToByte => ctx.out.push(JvmInst::Truncate(Truncation::Byte)),
            UnaryOperation::IntToChar => ctx.out.push(JvmInst::Truncate(Truncation::Char)),
            UnaryOperation::IntToShort => ctx.out.push(JvmInst::Truncate(Truncation::Short)),
            _ => ctx.out.push(JvmInst::Convert { from, to }),
        }
        self.store(ctx, dst, to.into())
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_binary(
        &mut self,
        ctx: &mut BlockContext,
        insn: &DecodedInstruction,
        op: ArithOp,
        num: NumKind,
        dst: u16,
        lhs: u16,
        rhs: u16,
    ) -> Result<(), DexError> {
        let kind: SlotKind = num.into();
        self.load(ctx, insn, lhs, kind)?;
        self.load(ctx, insn, rhs, if op.is_shift() { SlotKind::Int } else { kind })?;
        ctx.out.push(JvmInst::Binary(op, num));
        self.store(ctx, dst, kind)
    }

    fn lower_binary_lit(&mut self, ctx: &mut BlockContext, insn: &DecodedInstruction, op: BinaryOperation) -> Result<(), DexError> {
        let regs = insn.registers();
        let (dst, src) = (operand(&regs, 0)?, operand(&regs, 1)?);
        let value = literal(insn)? as i32;
        let (arith, _) = op.split();

        if op == BinaryOperation::RsubInt {
            ctx.out.push(JvmInst::Push(Constant::Int(value)));
            self.load(ctx, insn, src, SlotKind::Int)?;
        } else if arith == ArithOp::Add && dst == src && i16::try_from(value).is_ok() {
            let slot = self.slot(dst, SlotKind::Int)?;
            ctx.out.push(JvmInst::IInc { slot, delta: value as i16 });
            ctx.frame.set(dst, SlotKind::Int);
            return Ok(());
        } else {
            self.load(ctx, insn, src, SlotKind::Int)?;
            ctx.out.push(JvmInst::Push(Constant::Int(value)));
        }
        ctx.out.push(JvmInst::Binary(arith, NumKind::Int));
        self.store(ctx, dst, SlotKind::Int)
    }

    /// Kind a constant or untyped load written to `reg` by `insn` should take:
    /// its first typed read later in the same block, then any typed read in the
    /// method, then int or long.
    fn infer_kind(&self, block: BlockId, insn: &DecodedInstruction, reg: u16, wide: bool) -> Result<SlotKind, DexError> {
        let fits = |k: SlotKind| k.is_wide() == wide;

        let mut after = false;
        for next in self.cfg.instructions(block) {
            if next.offset == insn.offset {
                after = true;
                continue;
            }
            if !after {
                continue;
            }
            let roles = next.roles();
            if roles.uses.contains(&reg) {
                if let Some(k) = self.expected_use(next, reg)?.filter(|k| fits(*k)) {
                    return Ok(k);
                }
            }
            if roles.defs.contains(&reg) && !roles.uses.contains(&reg) {
                break;
            }
        }

        for b in self.cfg.blocks() {
            for next in self.cfg.instructions(b.id) {
                if next.offset == insn.offset || !next.roles().uses.contains(&reg) {
                    continue;
                }
                if let Some(k) = self.expected_use(next, reg)?.filter(|k| fits(*k)) {
                    return Ok(k);
                }
            }
        }

        Ok(if wide { SlotKind::Long } else { SlotKind::Int })
    }

    /// Kind `insn` reads `reg` as, when the opcode alone determines it.
    fn expected_use(&self, insn: &DecodedInstruction, reg: u16) -> Result<Option<SlotKind>, DexError> {
        let regs = insn.registers();
        for (pos, r) in regs.iter().enumerate() {
            if *r != reg {
                continue;
            }
            if let Some(k) = self.operand_kind(insn, pos)? {
                return Ok(Some(k));
            }
        }
        Ok(None)
    }

    fn operand_kind(&self, insn: &DecodedInstruction, pos: usize) -> Result<Option<SlotKind>, DexError> {
        use SlotKind::*;
        Ok(match (insn.family(), pos) {
            (Family::Move(ValueKind::Object), 1) => Some(Reference),
            (Family::Return(_), 0) => self.return_kind,
            (Family::MonitorEnter | Family::MonitorExit | Family::Throw | Family::CheckCast, 0) => Some(Reference),
            (Family::InstanceOf | Family::ArrayLength, 1) => Some(Reference),
            (Family::NewArray, 1) => Some(Int),
            (Family::FilledNewArray, _) => {
                let ty = self.type_operand(insn)?;
                match ty.element() {
                    Some(e) => Some(ArrayKind::of(e)?.value_kind()),
                    None => None,
                }
            }
            (Family::FillArrayData, 0) => Some(Reference),
            (Family::Switch, 0) => Some(Int),
            (Family::Compare(ct), 1 | 2) => Some(match ct {
                CompareType::LessThanFloat | CompareType::GreaterThanFloat => Float,
                CompareType::LessThanDouble | CompareType::GreaterThanDouble => Double,
                CompareType::Long => Long,
            }),
            (Family::Array(_), 1) => Some(Reference),
            (Family::Array(_), 2) => Some(Int),
            (Family::Array(op), 0) if op.is_put() => match op {
                ArrayOperation::PutObject => Some(Reference),
                ArrayOperation::PutBoolean | ArrayOperation::PutByte | ArrayOperation::PutChar | ArrayOperation::PutShort => {
                    Some(Int)
                }
                _ => None,
            },
            (Family::Instance(_), 1) => Some(Reference),
            (Family::Instance(op) | Family::Static(op), 0) if op.is_put() => {
                Some(SlotKind::of(&self.field_operand(insn)?.field_type)?)
            }
            (Family::Invoke(kind), _) => {
                let method = self.method_operand(insn)?;
                argument_kinds(&method, kind == InvokeKind::Static)?.get(pos).copied().flatten()
            }
            (Family::Unary(op), 1) => Some(op.kinds().0.into()),
            (Family::Binary(op), 1) => Some(op.split().1.into()),
            (Family::Binary(op), 2) | (Family::Binary2Addr(op), 1) => {
                let (arith, num) = op.split();
                Some(if arith.is_shift() { Int } else { num.into() })
            }
            (Family::Binary2Addr(op), 0) => Some(op.split().1.into()),
            (Family::BinaryLit(_), 1) => Some(Int),
            _ => None,
        })
    }

    /// Element kind of the array in `reg` when the same block created it
    /// with `new-array` before `insn`.
    fn array_hint(&self, block: BlockId, insn: &DecodedInstruction, reg: u16) -> Result<Option<ArrayKind>, DexError> {
        let before: Vec<&DecodedInstruction> = self
            .cfg
            .instructions(block)
            .take_while(|i| i.offset != insn.offset)
            .collect();
        for prev in before.iter().rev() {
            if !prev.roles().defs.contains(&reg) {
                continue;
            }
            if prev.family() == Family::NewArray && operand(&prev.registers(), 0)? == reg {
                let ty = self.type_operand(prev)?;
                return match ty.element() {
                    Some(e) => Ok(Some(ArrayKind::of(e)?)),
                    None => Ok(None),
                };
            }
            return Ok(None);
        }
        Ok(None)
    }

    fn type_operand(&self, insn: &DecodedInstruction) -> Result<TypeRef, DexError> {
        match insn.operands.reference() {
            Some(PoolRef::Type(idx)) => self.resolver.type_ref(idx),
            other => fail!(kind = Structural, "{} expects a type operand, found {:?}", insn.opcode.name, other),
        }
    }

    fn field_operand(&self, insn: &DecodedInstruction) -> Result<FieldRef, DexError> {
        match insn.operands.reference() {
            Some(PoolRef::Field(idx)) => self.resolver.field_ref(idx),
            other => fail!(kind = Structural, "{} expects a field operand, found {:?}", insn.opcode.name, other),
        }
    }

    fn method_operand(&self, insn: &DecodedInstruction) -> Result<MethodRef, DexError> {
        match insn.operands.reference() {
            Some(PoolRef::Method(idx)) => self.resolver.method_ref(idx),
            other => fail!(kind = Structural, "{} expects a method operand, found {:?}", insn.opcode.name, other),
        }
    }

    /// Exception table entries from the raw try regions, in region order and
    /// clause order. Clauses whose handler block was pruned are dropped.
    fn try_catches(&self) -> Result<Vec<TryCatch>, DexError> {
        let mut entries = vec![];
        for region in self.cfg.exceptions().regions() {
            for clause in &region.clauses {
                if self.cfg.block_at(clause.address).is_none() {
                    continue;
                }
                let catch_type = match clause.catch_type {
                    Some(idx) => Some(self.resolver.type_ref(idx)?),
                    None => None,
                };
                entries.push(TryCatch {
                    start: Label(region.start),
                    end: Label(region.end),
                    handler: Label(clause.address),
                    catch_type,
                });
            }
        }
        Ok(entries)
    }
}

/// Lays the blocks out in code order. Labels are emitted only where something
/// refers to them; a referenced offset with no block of its own (the end of a
/// try range, or a pruned block) is placed before the next block after it.
fn assemble(cfg: &Cfg, mut blocks: Vec<Vec<JvmInst>>, try_catches: &[TryCatch]) -> Result<Vec<JvmInst>, DexError> {
    let mut needed: BTreeSet<u32> = BTreeSet::new();
    for code in &blocks {
        for insn in code {
            needed.extend(insn.targets().iter().map(|l| l.0));
        }
    }
    for tc in try_catches {
        needed.extend([tc.start.0, tc.end.0, tc.handler.0]);
    }

    let mut layout = Vec::with_capacity(cfg.block_count());
    for b in cfg.blocks() {
        layout.push((b.first_offset()?, b.id));
    }
    layout.sort();

    let mut out = Vec::new();
    let mut pending = needed.into_iter().peekable();
    for (offset, b) in layout {
        while let Some(l) = pending.next_if(|l| *l <= offset) {
            out.push(JvmInst::Label(Label(l)));
        }
        out.append(&mut blocks[b]);
    }
    out.extend(pending.map(|l| JvmInst::Label(Label(l))));
    Ok(out)
}

/// Only the final read of a slot within one instruction may carry `last_use`.
fn keep_final_last_use(code: &mut [JvmInst]) {
    let mut seen = HashSet::new();
    for insn in code.iter_mut().rev() {
        if let JvmInst::Load { slot, last_use, .. } = insn {
            if !seen.insert(*slot) {
                *last_use = false;
            }
        }
    }
}

/// Argument kinds per register word, `None` for the upper half of a wide value.
fn argument_kinds(method: &MethodRef, is_static: bool) -> Result<Vec<Option<SlotKind>>, DexError> {
    let mut kinds = vec![];
    if !is_static {
        kinds.push(Some(SlotKind::Reference));
    }
    for p in &method.proto.params {
        let k = SlotKind::of(p)?;
        kinds.push(Some(k));
        if k.is_wide() {
            kinds.push(None);
        }
    }
    Ok(kinds)
}

fn move_kind(vk: ValueKind, known: Option<SlotKind>) -> SlotKind {
    match (vk, known) {
        (ValueKind::Object, _) => SlotKind::Reference,
        (ValueKind::Narrow, Some(SlotKind::Float)) => SlotKind::Float,
        (ValueKind::Narrow, _) => SlotKind::Int,
        (ValueKind::Wide, Some(SlotKind::Double)) => SlotKind::Double,
        (ValueKind::Wide, _) => SlotKind::Long,
    }
}

fn operand(regs: &[u16], i: usize) -> Result<u16, DexError> {
    match regs.get(i) {
        Some(r) => Ok(*r),
        None => fail!(kind = Structural, "missing register operand {}", i),
    }
}

fn literal(insn: &DecodedInstruction) -> Result<i64, DexError> {
    match insn.operands.literal() {
        Some(v) => Ok(v),
        None => fail!(kind = Structural, "{} has no literal operand", insn.opcode.name),
    }
}

fn branch_target(insn: &DecodedInstruction) -> Result<Label, DexError> {
    match &insn.operands {
        Operands::Branch { target, .. } => Ok(Label(*target)),
        _ => fail!(kind = Structural, "{} has no branch target", insn.opcode.name),
    }
}
