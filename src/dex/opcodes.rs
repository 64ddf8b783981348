use bitflags::bitflags;
use once_cell::sync::Lazy;
use crate::dex::instructions::{ArithOp, ArrayOperation, BinaryOperation, CompareType, InvokeKind, NumKind, TestType, UnaryOperation};

/// Instruction formats in use by current Dalvik bytecode. The name encodes
/// the unit count, the register count and the kind of extra data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F22x,
    F21t,
    F21s,
    F21h,
    F21c,
    F23x,
    F22b,
    F22t,
    F22s,
    F22c,
    F30t,
    F32x,
    F31i,
    F31t,
    F31c,
    F35c,
    F3rc,
    F45cc,
    F4rcc,
    F51l,
}

impl Format {
    /// Size in 16-bit code units.
    pub const fn units(&self) -> usize {
        match self {
            Format::F10x | Format::F12x | Format::F11n | Format::F11x | Format::F10t => 1,

            Format::F20t
            | Format::F22x
            | Format::F21t
            | Format::F21s
            | Format::F21h
            | Format::F21c
            | Format::F23x
            | Format::F22b
            | Format::F22t
            | Format::F22s
            | Format::F22c => 2,

            Format::F30t
            | Format::F32x
            | Format::F31i
            | Format::F31t
            | Format::F31c
            | Format::F35c
            | Format::F3rc => 3,

            Format::F45cc | Format::F4rcc => 4,

            Format::F51l => 5,
        }
    }
}

/// Represents different types of references used by opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceType {
    None,
    String,
    Type,
    Field,
    Method,
    CallSite,
    MethodProto,
    MethodHandle,
}

// Defines various flags that can be associated with an opcode.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpcodeFlags: u32 {
        const CAN_THROW = 0x1;
        const CAN_CONTINUE = 0x4;
        const SETS_RESULT = 0x8;
    }
}

/// How an instruction treats the register in one operand position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Use,
    UseWide,
    Def,
    DefWide,
    /// Read then overwritten, as by the `/2addr` forms.
    UseDef,
    UseDefWide,
}

impl Role {
    /// True when the operand names the low half of a register pair.
    pub fn is_wide(self) -> bool {
        matches!(self, Role::UseWide | Role::DefWide | Role::UseDefWide)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Narrow,
    Wide,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstKind {
    Narrow,
    Wide,
    String,
    Class,
    MethodHandle,
    MethodType,
}

/// Semantic group of an opcode. Every consumer dispatches on this instead of
/// raw opcode values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Nop,
    Move(ValueKind),
    MoveResult(ValueKind),
    MoveException,
    ReturnVoid,
    Return(ValueKind),
    Const(ConstKind),
    MonitorEnter,
    MonitorExit,
    CheckCast,
    InstanceOf,
    ArrayLength,
    NewInstance,
    NewArray,
    FilledNewArray,
    FillArrayData,
    Throw,
    Goto,
    Switch,
    Compare(CompareType),
    If(TestType),
    IfZ(TestType),
    Array(ArrayOperation),
    Instance(ArrayOperation),
    Static(ArrayOperation),
    Invoke(InvokeKind),
    InvokePolymorphic,
    InvokeCustom,
    Unary(UnaryOperation),
    Binary(BinaryOperation),
    Binary2Addr(BinaryOperation),
    BinaryLit(BinaryOperation),
}

/// Represents an opcode with its associated properties.
#[derive(Debug)]
pub struct Opcode {
    pub value: u8,
    pub name: String,
    pub format: Format,
    pub reference_type: ReferenceType,
    pub flags: OpcodeFlags,
    pub family: Family,
    pub roles: &'static [Role],
}

impl PartialEq for Opcode {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Opcode {
    fn new(
        value: u8,
        name: impl Into<String>,
        format: Format,
        reference_type: ReferenceType,
        flags: OpcodeFlags,
        family: Family,
        roles: &'static [Role],
    ) -> Self {
        Opcode { value, name: name.into(), format, reference_type, flags, family, roles }
    }

    /// Determines if the opcode can throw an exception.
    pub fn can_throw(&self) -> bool {
        self.flags.contains(OpcodeFlags::CAN_THROW)
    }

    /// Determines if execution can continue to the next instruction.
    pub fn can_continue(&self) -> bool {
        self.flags.contains(OpcodeFlags::CAN_CONTINUE)
    }

    /// Determines if the opcode sets the "hidden" result register.
    pub fn sets_result(&self) -> bool {
        self.flags.contains(OpcodeFlags::SETS_RESULT)
    }
}

use Role::*;

const NONE: &[Role] = &[];
const D: &[Role] = &[Def];
const DW: &[Role] = &[DefWide];
const U: &[Role] = &[Use];
const UW: &[Role] = &[UseWide];
const D_U: &[Role] = &[Def, Use];
const D_UW: &[Role] = &[Def, UseWide];
const DW_U: &[Role] = &[DefWide, Use];
const DW_UW: &[Role] = &[DefWide, UseWide];
const U_U: &[Role] = &[Use, Use];
const UW_U: &[Role] = &[UseWide, Use];
const D_U_U: &[Role] = &[Def, Use, Use];
const DW_U_U: &[Role] = &[DefWide, Use, Use];
const U_U_U: &[Role] = &[Use, Use, Use];
const UW_U_U: &[Role] = &[UseWide, Use, Use];
const D_UW_UW: &[Role] = &[Def, UseWide, UseWide];
const DW_UW_UW: &[Role] = &[DefWide, UseWide, UseWide];
const DW_UW_U: &[Role] = &[DefWide, UseWide, Use];
const UD_U: &[Role] = &[UseDef, Use];
const UDW_UW: &[Role] = &[UseDefWide, UseWide];
const UDW_U: &[Role] = &[UseDefWide, Use];

const C: OpcodeFlags = OpcodeFlags::CAN_CONTINUE;
const T: OpcodeFlags = OpcodeFlags::CAN_THROW;
const S: OpcodeFlags = OpcodeFlags::SETS_RESULT;

pub(crate) static OPCODES: Lazy<Vec<Option<Opcode>>> = Lazy::new(build_table);

/// Looks up the opcode for the low byte of an instruction's first unit.
pub fn lookup(value: u8) -> Option<&'static Opcode> {
    OPCODES[value as usize].as_ref()
}

static NOP: Lazy<Opcode> = Lazy::new(nop_opcode);

/// The `nop` opcode, also used to stand in for unknown opcodes.
pub fn nop() -> &'static Opcode {
    &NOP
}

fn nop_opcode() -> Opcode {
    Opcode::new(0x00, "nop", Format::F10x, ReferenceType::None, C, Family::Nop, NONE)
}

fn put(table: &mut [Option<Opcode>], op: Opcode) {
    let ix = op.value as usize;
    table[ix] = Some(op);
}

fn build_table() -> Vec<Option<Opcode>> {
    use Format::*;
    use ReferenceType as Ref;

    let mut t: Vec<Option<Opcode>> = (0..256).map(|_| None).collect();

    put(&mut t, nop_opcode());

    // moves
    for (base, name, kind, roles, flags) in [
        (0x01u8, "move", ValueKind::Narrow, D_U, C),
        (0x04, "move-wide", ValueKind::Wide, DW_UW, C),
        (0x07, "move-object", ValueKind::Object, D_U, C),
    ] {
        put(&mut t, Opcode::new(base, name, F12x, Ref::None, flags, Family::Move(kind), roles));
        put(&mut t, Opcode::new(base + 1, format!("{}/from16", name), F22x, Ref::None, flags, Family::Move(kind), roles));
        put(&mut t, Opcode::new(base + 2, format!("{}/16", name), F32x, Ref::None, flags, Family::Move(kind), roles));
    }
    put(&mut t, Opcode::new(0x0a, "move-result", F11x, Ref::None, C, Family::MoveResult(ValueKind::Narrow), D));
    put(&mut t, Opcode::new(0x0b, "move-result-wide", F11x, Ref::None, C, Family::MoveResult(ValueKind::Wide), DW));
    put(&mut t, Opcode::new(0x0c, "move-result-object", F11x, Ref::None, C, Family::MoveResult(ValueKind::Object), D));
    put(&mut t, Opcode::new(0x0d, "move-exception", F11x, Ref::None, C, Family::MoveException, D));

    // returns
    put(&mut t, Opcode::new(0x0e, "return-void", F10x, Ref::None, OpcodeFlags::empty(), Family::ReturnVoid, NONE));
    put(&mut t, Opcode::new(0x0f, "return", F11x, Ref::None, OpcodeFlags::empty(), Family::Return(ValueKind::Narrow), U));
    put(&mut t, Opcode::new(0x10, "return-wide", F11x, Ref::None, OpcodeFlags::empty(), Family::Return(ValueKind::Wide), UW));
    put(&mut t, Opcode::new(0x11, "return-object", F11x, Ref::None, OpcodeFlags::empty(), Family::Return(ValueKind::Object), U));

    // constants
    let narrow = Family::Const(ConstKind::Narrow);
    let wide = Family::Const(ConstKind::Wide);
    put(&mut t, Opcode::new(0x12, "const/4", F11n, Ref::None, C, narrow, D));
    put(&mut t, Opcode::new(0x13, "const/16", F21s, Ref::None, C, narrow, D));
    put(&mut t, Opcode::new(0x14, "const", F31i, Ref::None, C, narrow, D));
    put(&mut t, Opcode::new(0x15, "const/high16", F21h, Ref::None, C, narrow, D));
    put(&mut t, Opcode::new(0x16, "const-wide/16", F21s, Ref::None, C, wide, DW));
    put(&mut t, Opcode::new(0x17, "const-wide/32", F31i, Ref::None, C, wide, DW));
    put(&mut t, Opcode::new(0x18, "const-wide", F51l, Ref::None, C, wide, DW));
    put(&mut t, Opcode::new(0x19, "const-wide/high16", F21h, Ref::None, C, wide, DW));
    put(&mut t, Opcode::new(0x1a, "const-string", F21c, Ref::String, T | C, Family::Const(ConstKind::String), D));
    put(&mut t, Opcode::new(0x1b, "const-string/jumbo", F31c, Ref::String, T | C, Family::Const(ConstKind::String), D));
    put(&mut t, Opcode::new(0x1c, "const-class", F21c, Ref::Type, T | C, Family::Const(ConstKind::Class), D));

    // object model
    put(&mut t, Opcode::new(0x1d, "monitor-enter", F11x, Ref::None, T | C, Family::MonitorEnter, U));
    put(&mut t, Opcode::new(0x1e, "monitor-exit", F11x, Ref::None, T | C, Family::MonitorExit, U));
    put(&mut t, Opcode::new(0x1f, "check-cast", F21c, Ref::Type, T | C, Family::CheckCast, U));
    put(&mut t, Opcode::new(0x20, "instance-of", F22c, Ref::Type, T | C, Family::InstanceOf, D_U));
    put(&mut t, Opcode::new(0x21, "array-length", F12x, Ref::None, T | C, Family::ArrayLength, D_U));
    put(&mut t, Opcode::new(0x22, "new-instance", F21c, Ref::Type, T | C, Family::NewInstance, D));
    put(&mut t, Opcode::new(0x23, "new-array", F22c, Ref::Type, T | C, Family::NewArray, D_U));
    put(&mut t, Opcode::new(0x24, "filled-new-array", F35c, Ref::Type, T | C | S, Family::FilledNewArray, NONE));
    put(&mut t, Opcode::new(0x25, "filled-new-array/range", F3rc, Ref::Type, T | C | S, Family::FilledNewArray, NONE));
    put(&mut t, Opcode::new(0x26, "fill-array-data", F31t, Ref::None, T | C, Family::FillArrayData, U));
    put(&mut t, Opcode::new(0x27, "throw", F11x, Ref::None, T, Family::Throw, U));

    // control flow
    put(&mut t, Opcode::new(0x28, "goto", F10t, Ref::None, OpcodeFlags::empty(), Family::Goto, NONE));
    put(&mut t, Opcode::new(0x29, "goto/16", F20t, Ref::None, OpcodeFlags::empty(), Family::Goto, NONE));
    put(&mut t, Opcode::new(0x2a, "goto/32", F30t, Ref::None, OpcodeFlags::empty(), Family::Goto, NONE));
    put(&mut t, Opcode::new(0x2b, "packed-switch", F31t, Ref::None, C, Family::Switch, U));
    put(&mut t, Opcode::new(0x2c, "sparse-switch", F31t, Ref::None, C, Family::Switch, U));

    for value in 0x2du8..=0x31 {
        if let Some(cmp) = CompareType::from_opcode(value) {
            let roles = if cmp.is_wide() { D_UW_UW } else { D_U_U };
            put(&mut t, Opcode::new(value, cmp.name(), F23x, Ref::None, C, Family::Compare(cmp), roles));
        }
    }

    for ix in 0u8..6 {
        if let Some(test) = TestType::from_index(ix) {
            put(&mut t, Opcode::new(0x32 + ix, format!("if-{}", test.suffix()), F22t, Ref::None, C, Family::If(test), U_U));
            put(&mut t, Opcode::new(0x38 + ix, format!("if-{}z", test.suffix()), F21t, Ref::None, C, Family::IfZ(test), U));
        }
    }

    // field and array accessors
    for ix in 0u8..14 {
        if let Some(op) = ArrayOperation::from_index(ix) {
            let (array_roles, instance_roles, static_roles, flags) = match (op.is_put(), op.is_wide()) {
                (false, false) => (D_U_U, D_U, D, T | C),
                (false, true) => (DW_U_U, DW_U, DW, T | C),
                (true, false) => (U_U_U, U_U, U, T | C),
                (true, true) => (UW_U_U, UW_U, UW, T | C),
            };
            put(&mut t, Opcode::new(0x44 + ix, format!("a{}", op.suffix()), F23x, Ref::None, flags, Family::Array(op), array_roles));
            put(&mut t, Opcode::new(0x52 + ix, format!("i{}", op.suffix()), F22c, Ref::Field, flags, Family::Instance(op), instance_roles));
            put(&mut t, Opcode::new(0x60 + ix, format!("s{}", op.suffix()), F21c, Ref::Field, flags, Family::Static(op), static_roles));
        }
    }

    // invokes
    for ix in 0u8..5 {
        if let Some(kind) = InvokeKind::from_index(ix) {
            put(&mut t, Opcode::new(0x6e + ix, kind.name(), F35c, Ref::Method, T | C | S, Family::Invoke(kind), NONE));
            put(&mut t, Opcode::new(0x74 + ix, format!("{}/range", kind.name()), F3rc, Ref::Method, T | C | S, Family::Invoke(kind), NONE));
        }
    }

    // unary operations
    for ix in 0u8..21 {
        if let Some(op) = UnaryOperation::from_index(ix) {
            let (src, dst) = op.kinds();
            let (roles, flags) = match (dst.is_wide(), src.is_wide()) {
                (false, false) => (D_U, C),
                (false, true) => (D_UW, C),
                (true, false) => (DW_U, C),
                (true, true) => (DW_UW, C),
            };
            put(&mut t, Opcode::new(0x7b + ix, op.name(), F12x, Ref::None, flags, Family::Unary(op), roles));
        }
    }

    // binary operations
    for ix in 0u8..32 {
        if let Some(op) = BinaryOperation::from_index(ix) {
            let (arith, kind) = op.split();
            let throws = if matches!(kind, NumKind::Int | NumKind::Long) && matches!(arith, ArithOp::Div | ArithOp::Rem) {
                T
            } else {
                OpcodeFlags::empty()
            };
            let (roles, roles_2addr, flags) = if !kind.is_wide() {
                (D_U_U, UD_U, C)
            } else if arith.is_shift() {
                (DW_UW_U, UDW_U, C)
            } else {
                (DW_UW_UW, UDW_UW, C)
            };
            put(&mut t, Opcode::new(0x90 + ix, op.name(), F23x, Ref::None, flags | throws, Family::Binary(op), roles));
            put(&mut t, Opcode::new(0xb0 + ix, format!("{}/2addr", op.name()), F12x, Ref::None, flags | throws, Family::Binary2Addr(op), roles_2addr));
        }
    }

    for ix in 0u8..11 {
        if let Some(op) = BinaryOperation::from_literal_index(ix) {
            let throws = if matches!(op, BinaryOperation::DivInt | BinaryOperation::RemInt) { T } else { OpcodeFlags::empty() };
            // rsub-int has no "/lit16" suffix
            if ix < 8 {
                let name = if op == BinaryOperation::RsubInt { op.name().to_string() } else { format!("{}/lit16", op.name()) };
                put(&mut t, Opcode::new(0xd0 + ix, name, F22s, Ref::None, C | throws, Family::BinaryLit(op), D_U));
            }
            put(&mut t, Opcode::new(0xd8 + ix, format!("{}/lit8", op.name()), F22b, Ref::None, C | throws, Family::BinaryLit(op), D_U));
        }
    }

    // method handles and call sites
    put(&mut t, Opcode::new(0xfa, "invoke-polymorphic", F45cc, Ref::Method, T | C | S, Family::InvokePolymorphic, NONE));
    put(&mut t, Opcode::new(0xfb, "invoke-polymorphic/range", F4rcc, Ref::Method, T | C | S, Family::InvokePolymorphic, NONE));
    put(&mut t, Opcode::new(0xfc, "invoke-custom", F35c, Ref::CallSite, T | C | S, Family::InvokeCustom, NONE));
    put(&mut t, Opcode::new(0xfd, "invoke-custom/range", F3rc, Ref::CallSite, T | C | S, Family::InvokeCustom, NONE));
    put(&mut t, Opcode::new(0xfe, "const-method-handle", F21c, Ref::MethodHandle, T | C, Family::Const(ConstKind::MethodHandle), D));
    put(&mut t, Opcode::new(0xff, "const-method-type", F21c, Ref::MethodProto, T | C, Family::Const(ConstKind::MethodType), D));

    t
}
