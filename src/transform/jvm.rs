//! JVM stack-machine instructions produced by lowering.
//!
//! The shapes are symbolic rather than encoded: a class writer picks the
//! concrete opcode (`iconst_1` against `bipush`, `ldc` against `ldc_w`,
//! `aload_0` against `aload`) when it serialises a method.

use std::fmt;

use serde::Serialize;

use crate::dex::container::AccessFlags;
use crate::dex::descriptors::{FieldRef, MethodRef, TypeDescriptor, TypeRef};
use crate::dex::error::DexError;
use crate::dex::instructions::{ArithOp, CompareType, NumKind, TestType};

/// Computational type of a local slot or operand stack entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum SlotKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl SlotKind {
    /// Slots (and stack words) taken by a value of this kind.
    pub fn width(&self) -> u16 {
        if self.is_wide() { 2 } else { 1 }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, SlotKind::Long | SlotKind::Double)
    }

    /// Kind of a value of the given field, parameter or return type.
    pub fn of(ty: &TypeDescriptor) -> Result<SlotKind, DexError> {
        Ok(match ty {
            TypeDescriptor::Boolean
            | TypeDescriptor::Byte
            | TypeDescriptor::Char
            | TypeDescriptor::Short
            | TypeDescriptor::Int => SlotKind::Int,
            TypeDescriptor::Long => SlotKind::Long,
            TypeDescriptor::Float => SlotKind::Float,
            TypeDescriptor::Double => SlotKind::Double,
            TypeDescriptor::Object(_) | TypeDescriptor::Array(_) => SlotKind::Reference,
            TypeDescriptor::Void => fail!(kind = Structural, "void is not a value type"),
        })
    }

    fn prefix(&self) -> char {
        match self {
            SlotKind::Int => 'i',
            SlotKind::Long => 'l',
            SlotKind::Float => 'f',
            SlotKind::Double => 'd',
            SlotKind::Reference => 'a',
        }
    }
}

impl From<NumKind> for SlotKind {
    fn from(kind: NumKind) -> Self {
        match kind {
            NumKind::Int => SlotKind::Int,
            NumKind::Long => SlotKind::Long,
            NumKind::Float => SlotKind::Float,
            NumKind::Double => SlotKind::Double,
        }
    }
}

/// Element kind of an array load or store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ArrayKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
    /// `byte[]` and `boolean[]` share `baload`/`bastore`.
    Byte,
    Char,
    Short,
}

impl ArrayKind {
    /// Element kind for arrays of `element`.
    pub fn of(element: &TypeDescriptor) -> Result<ArrayKind, DexError> {
        Ok(match element {
            TypeDescriptor::Boolean | TypeDescriptor::Byte => ArrayKind::Byte,
            TypeDescriptor::Char => ArrayKind::Char,
            TypeDescriptor::Short => ArrayKind::Short,
            TypeDescriptor::Int => ArrayKind::Int,
            TypeDescriptor::Long => ArrayKind::Long,
            TypeDescriptor::Float => ArrayKind::Float,
            TypeDescriptor::Double => ArrayKind::Double,
            TypeDescriptor::Object(_) | TypeDescriptor::Array(_) => ArrayKind::Reference,
            TypeDescriptor::Void => fail!(kind = Structural, "array of void"),
        })
    }

    /// Kind of the value moved in or out of the array.
    pub fn value_kind(&self) -> SlotKind {
        match self {
            ArrayKind::Long => SlotKind::Long,
            ArrayKind::Float => SlotKind::Float,
            ArrayKind::Double => SlotKind::Double,
            ArrayKind::Reference => SlotKind::Reference,
            ArrayKind::Int | ArrayKind::Byte | ArrayKind::Char | ArrayKind::Short => SlotKind::Int,
        }
    }

    fn prefix(&self) -> char {
        match self {
            ArrayKind::Int => 'i',
            ArrayKind::Long => 'l',
            ArrayKind::Float => 'f',
            ArrayKind::Double => 'd',
            ArrayKind::Reference => 'a',
            ArrayKind::Byte => 'b',
            ArrayKind::Char => 'c',
            ArrayKind::Short => 's',
        }
    }
}

/// Narrowing of an `int` to a smaller integral type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Truncation {
    Byte,
    Char,
    Short,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum InvokeType {
    Virtual,
    Special,
    Static,
    Interface,
}

/// A jump target. Labels are named after the code-unit offset of the Dalvik
/// instruction they stand for, so every offset has at most one label.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "L{:04x}", self.0)
    }
}

/// Value pushed by a constant instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Constant {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Class(TypeRef),
}

impl Constant {
    pub fn kind(&self) -> SlotKind {
        match self {
            Constant::Int(_) => SlotKind::Int,
            Constant::Long(_) => SlotKind::Long,
            Constant::Float(_) => SlotKind::Float,
            Constant::Double(_) => SlotKind::Double,
            Constant::Null | Constant::String(_) | Constant::Class(_) => SlotKind::Reference,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Constant::Null => write!(f, "null"),
            Constant::Int(v) => write!(f, "{}", v),
            Constant::Long(v) => write!(f, "{}L", v),
            Constant::Float(v) => write!(f, "{:?}f", v),
            Constant::Double(v) => write!(f, "{:?}d", v),
            Constant::String(s) => write!(f, "{:?}", s),
            Constant::Class(t) => write!(f, "{}.class", t),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum JvmInst {
    Label(Label),
    /// Placeholder left by a Dalvik `nop` or an unknown opcode.
    Nop,
    Push(Constant),
    Load {
        kind: SlotKind,
        slot: u16,
        /// The register held in `slot` is dead after this read.
        last_use: bool,
    },
    Store { kind: SlotKind, slot: u16 },
    IInc { slot: u16, delta: i16 },
    ArrayLoad(ArrayKind),
    ArrayStore(ArrayKind),
    Pop,
    Pop2,
    Dup,
    Binary(ArithOp, NumKind),
    Neg(NumKind),
    Convert { from: NumKind, to: NumKind },
    Truncate(Truncation),
    Compare(CompareType),
    GetField(FieldRef),
    PutField(FieldRef),
    GetStatic(FieldRef),
    PutStatic(FieldRef),
    Invoke(InvokeType, MethodRef),
    New(TypeRef),
    /// Creates an array of the given array type.
    NewArray(TypeRef),
    ArrayLength,
    CheckCast(TypeRef),
    InstanceOf(TypeRef),
    AThrow,
    MonitorEnter,
    MonitorExit,
    /// Compares the top of stack with zero, or with null when `reference` is set.
    IfZero { test: TestType, reference: bool, target: Label },
    IfCompare { test: TestType, reference: bool, target: Label },
    Goto(Label),
    TableSwitch { low: i32, targets: Vec<Label>, default: Label },
    LookupSwitch { pairs: Vec<(i32, Label)>, default: Label },
    Return(Option<SlotKind>),
}

impl JvmInst {
    /// Operand stack words consumed and produced.
    pub fn stack_effect(&self) -> (u16, u16) {
        use JvmInst::*;
        match self {
            JvmInst::Label(_) | Nop | IInc { .. } | Goto(_) => (0, 0),
            Push(c) => (0, c.kind().width()),
            Load { kind, .. } => (0, kind.width()),
            Store { kind, .. } => (kind.width(), 0),
            ArrayLoad(k) => (2, k.value_kind().width()),
            ArrayStore(k) => (2 + k.value_kind().width(), 0),
            Pop => (1, 0),
            Pop2 => (2, 0),
            Dup => (1, 2),
            Binary(op, kind) => {
                let w = SlotKind::from(*kind).width();
                if op.is_shift() { (w + 1, w) } else { (2 * w, w) }
            }
            Neg(kind) => {
                let w = SlotKind::from(*kind).width();
                (w, w)
            }
            Convert { from, to } => (SlotKind::from(*from).width(), SlotKind::from(*to).width()),
            Truncate(_) => (1, 1),
            Compare(ct) => if ct.is_wide() { (4, 1) } else { (2, 1) },
            GetField(f) => (1, width_of(&f.field_type)),
            PutField(f) => (1 + width_of(&f.field_type), 0),
            GetStatic(f) => (0, width_of(&f.field_type)),
            PutStatic(f) => (width_of(&f.field_type), 0),
            Invoke(ty, m) => {
                let args: u16 = m.proto.params.iter().map(|p| p.slot_width()).sum();
                let receiver = if *ty == InvokeType::Static { 0 } else { 1 };
                let ret = if *m.proto.return_type == TypeDescriptor::Void { 0 } else { width_of(&m.proto.return_type) };
                (args + receiver, ret)
            }
            New(_) => (0, 1),
            NewArray(_) | ArrayLength | CheckCast(_) | InstanceOf(_) => (1, 1),
            AThrow | MonitorEnter | MonitorExit => (1, 0),
            IfZero { .. } => (1, 0),
            IfCompare { .. } => (2, 0),
            TableSwitch { .. } | LookupSwitch { .. } => (1, 0),
            Return(kind) => (kind.map(|k| k.width()).unwrap_or(0), 0),
        }
    }

    /// Labels this instruction may transfer control to.
    pub fn targets(&self) -> Vec<Label> {
        match self {
            JvmInst::IfZero { target, .. } | JvmInst::IfCompare { target, .. } | JvmInst::Goto(target) => vec![*target],
            JvmInst::TableSwitch { targets, default, .. } => {
                targets.iter().copied().chain(std::iter::once(*default)).collect()
            }
            JvmInst::LookupSwitch { pairs, default } => {
                pairs.iter().map(|(_, l)| *l).chain(std::iter::once(*default)).collect()
            }
            _ => vec![],
        }
    }
}

fn width_of(ty: &TypeDescriptor) -> u16 {
    SlotKind::of(ty).map(|k| k.width()).unwrap_or(0)
}

fn test_name(test: TestType) -> &'static str {
    test.suffix()
}

fn arith_name(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "add",
        ArithOp::Sub => "sub",
        ArithOp::Mul => "mul",
        ArithOp::Div => "div",
        ArithOp::Rem => "rem",
        ArithOp::And => "and",
        ArithOp::Or => "or",
        ArithOp::Xor => "xor",
        ArithOp::Shl => "shl",
        ArithOp::Shr => "shr",
        ArithOp::Ushr => "ushr",
    }
}

fn num_prefix(kind: NumKind) -> char {
    SlotKind::from(kind).prefix()
}

impl fmt::Display for JvmInst {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use JvmInst::*;
        match self {
            JvmInst::Label(l) => write!(f, "{}:", l),
            Nop => write!(f, "nop"),
            Push(c) => write!(f, "push {}", c),
            Load { kind, slot, last_use } => {
                write!(f, "{}load {}", kind.prefix(), slot)?;
                if *last_use { write!(f, " (last)") } else { Ok(()) }
            }
            Store { kind, slot } => write!(f, "{}store {}", kind.prefix(), slot),
            IInc { slot, delta } => write!(f, "iinc {} {}", slot, delta),
            ArrayLoad(k) => write!(f, "{}aload", k.prefix()),
            ArrayStore(k) => write!(f, "{}astore", k.prefix()),
            Pop => write!(f, "pop"),
            Pop2 => write!(f, "pop2"),
            Dup => write!(f, "dup"),
            Binary(op, kind) => write!(f, "{}{}", num_prefix(*kind), arith_name(*op)),
            Neg(kind) => write!(f, "{}neg", num_prefix(*kind)),
            Convert { from, to } => write!(f, "{}2{}", num_prefix(*from), num_prefix(*to)),
            Truncate(t) => match t {
                Truncation::Byte => write!(f, "i2b"),
                Truncation::Char => write!(f, "i2c"),
                Truncation::Short => write!(f, "i2s"),
            },
            Compare(ct) => match ct {
                CompareType::LessThanFloat => write!(f, "fcmpl"),
                CompareType::GreaterThanFloat => write!(f, "fcmpg"),
                CompareType::LessThanDouble => write!(f, "dcmpl"),
                CompareType::GreaterThanDouble => write!(f, "dcmpg"),
                CompareType::Long => write!(f, "lcmp"),
            },
            GetField(r) => write!(f, "getfield {}", r),
            PutField(r) => write!(f, "putfield {}", r),
            GetStatic(r) => write!(f, "getstatic {}", r),
            PutStatic(r) => write!(f, "putstatic {}", r),
            Invoke(ty, m) => {
                let name = match ty {
                    InvokeType::Virtual => "invokevirtual",
                    InvokeType::Special => "invokespecial",
                    InvokeType::Static => "invokestatic",
                    InvokeType::Interface => "invokeinterface",
                };
                write!(f, "{} {}", name, m)
            }
            New(t) => write!(f, "new {}", t),
            NewArray(t) => write!(f, "newarray {}", t),
            ArrayLength => write!(f, "arraylength"),
            CheckCast(t) => write!(f, "checkcast {}", t),
            InstanceOf(t) => write!(f, "instanceof {}", t),
            AThrow => write!(f, "athrow"),
            MonitorEnter => write!(f, "monitorenter"),
            MonitorExit => write!(f, "monitorexit"),
            IfZero { test, reference: true, target } => {
                let name = if *test == TestType::Equal { "ifnull" } else { "ifnonnull" };
                write!(f, "{} {}", name, target)
            }
            IfZero { test, reference: false, target } => write!(f, "if{} {}", test_name(*test), target),
            IfCompare { test, reference, target } => {
                let kind = if *reference { 'a' } else { 'i' };
                write!(f, "if_{}cmp{} {}", kind, test_name(*test), target)
            }
            Goto(l) => write!(f, "goto {}", l),
            TableSwitch { low, targets, default } => {
                write!(f, "tableswitch {}", low)?;
                for t in targets {
                    write!(f, " {}", t)?;
                }
                write!(f, " default {}", default)
            }
            LookupSwitch { pairs, default } => {
                write!(f, "lookupswitch")?;
                for (k, t) in pairs {
                    write!(f, " {}:{}", k, t)?;
                }
                write!(f, " default {}", default)
            }
            Return(None) => write!(f, "return"),
            Return(Some(kind)) => write!(f, "{}return", kind.prefix()),
        }
    }
}

/// One entry of the method's exception table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TryCatch {
    pub start: Label,
    /// Exclusive.
    pub end: Label,
    pub handler: Label,
    /// `None` catches everything.
    pub catch_type: Option<TypeRef>,
}

/// A fully lowered method, ready for a class writer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoweredMethod {
    pub name: String,
    pub descriptor: String,
    pub access: AccessFlags,
    /// Local slots taken by `this` and the parameters.
    pub arguments: u16,
    pub instructions: Vec<JvmInst>,
    pub try_catches: Vec<TryCatch>,
    pub max_stack: u16,
    pub max_locals: u16,
}

impl LoweredMethod {
    /// Instructions other than labels.
    pub fn code_len(&self) -> usize {
        self.instructions.iter().filter(|i| !matches!(i, JvmInst::Label(_))).count()
    }

    /// Labels that start an exception handler.
    pub fn handler_labels(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self.try_catches.iter().map(|t| t.handler).collect();
        labels.sort();
        labels.dedup();
        labels
    }
}

impl fmt::Display for LoweredMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}{} stack={} locals={}", self.name, self.descriptor, self.max_stack, self.max_locals)?;
        for insn in &self.instructions {
            match insn {
                JvmInst::Label(_) => writeln!(f, "  {}", insn)?,
                _ => writeln!(f, "    {}", insn)?,
            }
        }
        for tc in &self.try_catches {
            match &tc.catch_type {
                Some(t) => writeln!(f, "  try {} {} -> {} {}", tc.start, tc.end, tc.handler, t)?,
                None => writeln!(f, "  try {} {} -> {} any", tc.start, tc.end, tc.handler)?,
            }
        }
        Ok(())
    }
}
