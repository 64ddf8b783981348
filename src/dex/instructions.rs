//! Representation of decoded Dalvik instructions

use std::fmt;
use serde::Serialize;
use crate::dex::opcodes::{Family, Format, Opcode, Role};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum CompareType {
    LessThanFloat,
    GreaterThanFloat,
    LessThanDouble,
    GreaterThanDouble,
    Long,
}

impl CompareType {
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x2D => Some(Self::LessThanFloat),
            0x2E => Some(Self::GreaterThanFloat),
            0x2F => Some(Self::LessThanDouble),
            0x30 => Some(Self::GreaterThanDouble),
            0x31 => Some(Self::Long),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LessThanFloat => "cmpl-float",
            Self::GreaterThanFloat => "cmpg-float",
            Self::LessThanDouble => "cmpl-double",
            Self::GreaterThanDouble => "cmpg-double",
            Self::Long => "cmp-long",
        }
    }

    pub fn is_wide(&self) -> bool {
        !matches!(self, Self::LessThanFloat | Self::GreaterThanFloat)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum TestType {
    Equal,
    NotEqual,
    LessThan,
    GreaterThanOrEqual,
    GreaterThan,
    LessThanOrEqual,
}

impl TestType {
    /// Both `if-test` (0x32..) and `if-testz` (0x38..) share the same ordering.
    pub fn from_index(ix: u8) -> Option<Self> {
        match ix {
            0 => Some(Self::Equal),
            1 => Some(Self::NotEqual),
            2 => Some(Self::LessThan),
            3 => Some(Self::GreaterThanOrEqual),
            4 => Some(Self::GreaterThan),
            5 => Some(Self::LessThanOrEqual),
            _ => None,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Equal => "eq",
            Self::NotEqual => "ne",
            Self::LessThan => "lt",
            Self::GreaterThanOrEqual => "ge",
            Self::GreaterThan => "gt",
            Self::LessThanOrEqual => "le",
        }
    }

    pub fn is_equality(&self) -> bool {
        matches!(self, Self::Equal | Self::NotEqual)
    }
}

/// Element kind moved by `aget`/`aput`, `iget`/`iput` and `sget`/`sput`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum ArrayOperation {
    Get,
    GetWide,
    GetObject,
    GetBoolean,
    GetByte,
    GetChar,
    GetShort,
    Put,
    PutWide,
    PutObject,
    PutBoolean,
    PutByte,
    PutChar,
    PutShort,
}

impl ArrayOperation {
    /// Index within any of the three accessor groups.
    pub fn from_index(ix: u8) -> Option<Self> {
        Some(match ix {
            0 => Self::Get,
            1 => Self::GetWide,
            2 => Self::GetObject,
            3 => Self::GetBoolean,
            4 => Self::GetByte,
            5 => Self::GetChar,
            6 => Self::GetShort,
            7 => Self::Put,
            8 => Self::PutWide,
            9 => Self::PutObject,
            10 => Self::PutBoolean,
            11 => Self::PutByte,
            12 => Self::PutChar,
            13 => Self::PutShort,
            _ => return None,
        })
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::GetWide => "get-wide",
            Self::GetObject => "get-object",
            Self::GetBoolean => "get-boolean",
            Self::GetByte => "get-byte",
            Self::GetChar => "get-char",
            Self::GetShort => "get-short",
            Self::Put => "put",
            Self::PutWide => "put-wide",
            Self::PutObject => "put-object",
            Self::PutBoolean => "put-boolean",
            Self::PutByte => "put-byte",
            Self::PutChar => "put-char",
            Self::PutShort => "put-short",
        }
    }

    pub fn is_put(&self) -> bool {
        matches!(
            self,
            Self::Put | Self::PutWide | Self::PutObject | Self::PutBoolean | Self::PutByte | Self::PutChar | Self::PutShort
        )
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, Self::GetWide | Self::PutWide)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::GetObject | Self::PutObject)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum InvokeKind {
    Virtual,
    Super,
    Direct,
    Static,
    Interface,
}

impl InvokeKind {
    pub fn from_index(ix: u8) -> Option<Self> {
        match ix {
            0 => Some(Self::Virtual),
            1 => Some(Self::Super),
            2 => Some(Self::Direct),
            3 => Some(Self::Static),
            4 => Some(Self::Interface),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Virtual => "invoke-virtual",
            Self::Super => "invoke-super",
            Self::Direct => "invoke-direct",
            Self::Static => "invoke-static",
            Self::Interface => "invoke-interface",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum UnaryOperation {
    NegateInt,
    NotInt,
    NegateLong,
    NotLong,
    NegateFloat,
    NegateDouble,
    IntToLong,
    IntToFloat,
    IntToDouble,
    LongToInt,
    LongToFloat,
    LongToDouble,
    FloatToInt,
    FloatToLong,
    FloatToDouble,
    DoubleToInt,
    DoubleToLong,
    DoubleToFloat,
    IntToByte,
    IntToChar,
    IntToShort,
}

const UNARY_OPERATIONS: [UnaryOperation; 21] = [
    UnaryOperation::NegateInt,
    UnaryOperation::NotInt,
    UnaryOperation::NegateLong,
    UnaryOperation::NotLong,
    UnaryOperation::NegateFloat,
    UnaryOperation::NegateDouble,
    UnaryOperation::IntToLong,
    UnaryOperation::IntToFloat,
    UnaryOperation::IntToDouble,
    UnaryOperation::LongToInt,
    UnaryOperation::LongToFloat,
    UnaryOperation::LongToDouble,
    UnaryOperation::FloatToInt,
    UnaryOperation::FloatToLong,
    UnaryOperation::FloatToDouble,
    UnaryOperation::DoubleToInt,
    UnaryOperation::DoubleToLong,
    UnaryOperation::DoubleToFloat,
    UnaryOperation::IntToByte,
    UnaryOperation::IntToChar,
    UnaryOperation::IntToShort,
];

impl UnaryOperation {
    pub fn from_index(ix: u8) -> Option<Self> {
        UNARY_OPERATIONS.get(ix as usize).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NegateInt => "neg-int",
            Self::NotInt => "not-int",
            Self::NegateLong => "neg-long",
            Self::NotLong => "not-long",
            Self::NegateFloat => "neg-float",
            Self::NegateDouble => "neg-double",
            Self::IntToLong => "int-to-long",
            Self::IntToFloat => "int-to-float",
            Self::IntToDouble => "int-to-double",
            Self::LongToInt => "long-to-int",
            Self::LongToFloat => "long-to-float",
            Self::LongToDouble => "long-to-double",
            Self::FloatToInt => "float-to-int",
            Self::FloatToLong => "float-to-long",
            Self::FloatToDouble => "float-to-double",
            Self::DoubleToInt => "double-to-int",
            Self::DoubleToLong => "double-to-long",
            Self::DoubleToFloat => "double-to-float",
            Self::IntToByte => "int-to-byte",
            Self::IntToChar => "int-to-char",
            Self::IntToShort => "int-to-short",
        }
    }

    /// (source, result) kinds.
    pub fn kinds(&self) -> (NumKind, NumKind) {
        use NumKind::*;
        match self {
            Self::NegateInt | Self::NotInt | Self::IntToByte | Self::IntToChar | Self::IntToShort => (Int, Int),
            Self::NegateLong | Self::NotLong => (Long, Long),
            Self::NegateFloat => (Float, Float),
            Self::NegateDouble => (Double, Double),
            Self::IntToLong => (Int, Long),
            Self::IntToFloat => (Int, Float),
            Self::IntToDouble => (Int, Double),
            Self::LongToInt => (Long, Int),
            Self::LongToFloat => (Long, Float),
            Self::LongToDouble => (Long, Double),
            Self::FloatToInt => (Float, Int),
            Self::FloatToLong => (Float, Long),
            Self::FloatToDouble => (Float, Double),
            Self::DoubleToInt => (Double, Int),
            Self::DoubleToLong => (Double, Long),
            Self::DoubleToFloat => (Double, Float),
        }
    }
}

/// Arithmetic operator, independent of operand width.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

impl ArithOp {
    pub fn is_shift(&self) -> bool {
        matches!(self, Self::Shl | Self::Shr | Self::Ushr)
    }
}

/// Numeric operand kinds used by arithmetic and conversions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum NumKind {
    Int,
    Long,
    Float,
    Double,
}

impl NumKind {
    pub fn is_wide(&self) -> bool {
        matches!(self, NumKind::Long | NumKind::Double)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum BinaryOperation {
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    RemInt,
    AndInt,
    OrInt,
    XorInt,
    ShlInt,
    ShrInt,
    UshrInt,
    AddLong,
    SubLong,
    MulLong,
    DivLong,
    RemLong,
    AndLong,
    OrLong,
    XorLong,
    ShlLong,
    ShrLong,
    UshrLong,
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    RemFloat,
    AddDouble,
    SubDouble,
    MulDouble,
    DivDouble,
    RemDouble,
    /// Reverse subtract, only produced by the literal forms.
    RsubInt,
}

const BINARY_OPERATIONS: [BinaryOperation; 32] = [
    BinaryOperation::AddInt,
    BinaryOperation::SubInt,
    BinaryOperation::MulInt,
    BinaryOperation::DivInt,
    BinaryOperation::RemInt,
    BinaryOperation::AndInt,
    BinaryOperation::OrInt,
    BinaryOperation::XorInt,
    BinaryOperation::ShlInt,
    BinaryOperation::ShrInt,
    BinaryOperation::UshrInt,
    BinaryOperation::AddLong,
    BinaryOperation::SubLong,
    BinaryOperation::MulLong,
    BinaryOperation::DivLong,
    BinaryOperation::RemLong,
    BinaryOperation::AndLong,
    BinaryOperation::OrLong,
    BinaryOperation::XorLong,
    BinaryOperation::ShlLong,
    BinaryOperation::ShrLong,
    BinaryOperation::UshrLong,
    BinaryOperation::AddFloat,
    BinaryOperation::SubFloat,
    BinaryOperation::MulFloat,
    BinaryOperation::DivFloat,
    BinaryOperation::RemFloat,
    BinaryOperation::AddDouble,
    BinaryOperation::SubDouble,
    BinaryOperation::MulDouble,
    BinaryOperation::DivDouble,
    BinaryOperation::RemDouble,
];

// add, rsub, mul, div, rem, and, or, xor, shl, shr, ushr
const LITERAL_OPERATIONS: [BinaryOperation; 11] = [
    BinaryOperation::AddInt,
    BinaryOperation::RsubInt,
    BinaryOperation::MulInt,
    BinaryOperation::DivInt,
    BinaryOperation::RemInt,
    BinaryOperation::AndInt,
    BinaryOperation::OrInt,
    BinaryOperation::XorInt,
    BinaryOperation::ShlInt,
    BinaryOperation::ShrInt,
    BinaryOperation::UshrInt,
];

impl BinaryOperation {
    /// Index within the `binop` (0x90) and `binop/2addr` (0xb0) groups.
    pub fn from_index(ix: u8) -> Option<Self> {
        BINARY_OPERATIONS.get(ix as usize).copied()
    }

    /// Index within the `binop/lit16` (0xd0) and `binop/lit8` (0xd8) groups.
    pub fn from_literal_index(ix: u8) -> Option<Self> {
        LITERAL_OPERATIONS.get(ix as usize).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AddInt => "add-int",
            Self::SubInt => "sub-int",
            Self::MulInt => "mul-int",
            Self::DivInt => "div-int",
            Self::RemInt => "rem-int",
            Self::AndInt => "and-int",
            Self::OrInt => "or-int",
            Self::XorInt => "xor-int",
            Self::ShlInt => "shl-int",
            Self::ShrInt => "shr-int",
            Self::UshrInt => "ushr-int",
            Self::AddLong => "add-long",
            Self::SubLong => "sub-long",
            Self::MulLong => "mul-long",
            Self::DivLong => "div-long",
            Self::RemLong => "rem-long",
            Self::AndLong => "and-long",
            Self::OrLong => "or-long",
            Self::XorLong => "xor-long",
            Self::ShlLong => "shl-long",
            Self::ShrLong => "shr-long",
            Self::UshrLong => "ushr-long",
            Self::AddFloat => "add-float",
            Self::SubFloat => "sub-float",
            Self::MulFloat => "mul-float",
            Self::DivFloat => "div-float",
            Self::RemFloat => "rem-float",
            Self::AddDouble => "add-double",
            Self::SubDouble => "sub-double",
            Self::MulDouble => "mul-double",
            Self::DivDouble => "div-double",
            Self::RemDouble => "rem-double",
            Self::RsubInt => "rsub-int",
        }
    }

    /// Splits the operation into its operator and operand kind.
    pub fn split(&self) -> (ArithOp, NumKind) {
        use ArithOp::*;
        match self {
            Self::AddInt => (Add, NumKind::Int),
            Self::SubInt | Self::RsubInt => (Sub, NumKind::Int),
            Self::MulInt => (Mul, NumKind::Int),
            Self::DivInt => (Div, NumKind::Int),
            Self::RemInt => (Rem, NumKind::Int),
            Self::AndInt => (And, NumKind::Int),
            Self::OrInt => (Or, NumKind::Int),
            Self::XorInt => (Xor, NumKind::Int),
            Self::ShlInt => (Shl, NumKind::Int),
            Self::ShrInt => (Shr, NumKind::Int),
            Self::UshrInt => (Ushr, NumKind::Int),
            Self::AddLong => (Add, NumKind::Long),
            Self::SubLong => (Sub, NumKind::Long),
            Self::MulLong => (Mul, NumKind::Long),
            Self::DivLong => (Div, NumKind::Long),
            Self::RemLong => (Rem, NumKind::Long),
            Self::AndLong => (And, NumKind::Long),
            Self::OrLong => (Or, NumKind::Long),
            Self::XorLong => (Xor, NumKind::Long),
            Self::ShlLong => (Shl, NumKind::Long),
            Self::ShrLong => (Shr, NumKind::Long),
            Self::UshrLong => (Ushr, NumKind::Long),
            Self::AddFloat => (Add, NumKind::Float),
            Self::SubFloat => (Sub, NumKind::Float),
            Self::MulFloat => (Mul, NumKind::Float),
            Self::DivFloat => (Div, NumKind::Float),
            Self::RemFloat => (Rem, NumKind::Float),
            Self::AddDouble => (Add, NumKind::Double),
            Self::SubDouble => (Sub, NumKind::Double),
            Self::MulDouble => (Mul, NumKind::Double),
            Self::DivDouble => (Div, NumKind::Double),
            Self::RemDouble => (Rem, NumKind::Double),
        }
    }
}

/// Constant-pool reference carried by an instruction, one variant per pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum PoolRef {
    String(u32),
    Type(u32),
    Field(u32),
    Method(u32),
    Proto(u32),
    CallSite(u32),
    MethodHandle(u32),
    /// `invoke-polymorphic` carries both a method and a prototype.
    Polymorphic { method: u32, proto: u32 },
}

/// Operand shapes. Registers are listed in the order the format encodes them
/// (vA, vB, vC), which is also the order of the opcode's role table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Operands {
    None,
    Registers(Vec<u16>),
    Literal { regs: Vec<u16>, value: i64 },
    Branch { regs: Vec<u16>, target: u32 },
    Reference { regs: Vec<u16>, reference: PoolRef },
    Range { first: u16, count: u16, reference: PoolRef },
    /// Resolved `packed-switch`/`sparse-switch`: (key, absolute target) pairs.
    Switch { reg: u16, packed: bool, cases: Vec<(i32, u32)> },
    /// Resolved `fill-array-data` payload, elements sign-extended from `width` bytes.
    ArrayData { reg: u16, width: u16, elements: Vec<i64> },
}

impl Operands {
    pub fn registers(&self) -> Vec<u16> {
        match self {
            Operands::None => vec![],
            Operands::Registers(regs)
            | Operands::Literal { regs, .. }
            | Operands::Branch { regs, .. }
            | Operands::Reference { regs, .. } => regs.clone(),
            Operands::Range { first, count, .. } => (*first as u32..*first as u32 + *count as u32).map(|r| r as u16).collect(),
            Operands::Switch { reg, .. } | Operands::ArrayData { reg, .. } => vec![*reg],
        }
    }

    pub fn reference(&self) -> Option<PoolRef> {
        match self {
            Operands::Reference { reference, .. } | Operands::Range { reference, .. } => Some(*reference),
            _ => None,
        }
    }

    pub fn literal(&self) -> Option<i64> {
        match self {
            Operands::Literal { value, .. } => Some(*value),
            _ => None,
        }
    }
}

/// Registers read and written by one instruction, wide operands expanded to
/// both halves of their register pair.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisterRoles {
    pub uses: Vec<u16>,
    pub defs: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInstruction {
    /// Code-unit position of the first unit.
    pub offset: u32,
    pub opcode: &'static Opcode,
    pub operands: Operands,
    /// Set when the raw opcode was unknown and this is a stand-in `nop`.
    pub placeholder: bool,
}

impl DecodedInstruction {
    pub fn family(&self) -> Family {
        self.opcode.family
    }

    /// Number of code units occupied.
    pub fn size(&self) -> u32 {
        self.opcode.format.units() as u32
    }

    pub fn next_offset(&self) -> u32 {
        self.offset + self.size()
    }

    pub fn registers(&self) -> Vec<u16> {
        self.operands.registers()
    }

    pub fn roles(&self) -> RegisterRoles {
        let mut roles = RegisterRoles::default();
        let regs = self.registers();
        if matches!(self.opcode.format, Format::F35c | Format::F3rc | Format::F45cc | Format::F4rcc) {
            // argument lists name both halves of wide values explicitly
            roles.uses = regs;
            return roles;
        }
        for (reg, role) in regs.iter().zip(self.opcode.roles.iter()) {
            match role {
                Role::Use => roles.uses.push(*reg),
                Role::UseWide => roles.uses.extend([*reg, *reg + 1]),
                Role::Def => roles.defs.push(*reg),
                Role::DefWide => roles.defs.extend([*reg, *reg + 1]),
                Role::UseDef => {
                    roles.uses.push(*reg);
                    roles.defs.push(*reg);
                }
                Role::UseDefWide => {
                    roles.uses.extend([*reg, *reg + 1]);
                    roles.defs.extend([*reg, *reg + 1]);
                }
            }
        }
        roles
    }

    /// Absolute branch targets, switch cases in payload order.
    pub fn branch_targets(&self) -> Vec<u32> {
        match &self.operands {
            Operands::Branch { target, .. } => vec![*target],
            Operands::Switch { cases, .. } => cases.iter().map(|(_, t)| *t).collect(),
            _ => vec![],
        }
    }

    /// True for instructions that end a basic block.
    pub fn ends_block(&self) -> bool {
        matches!(
            self.family(),
            Family::Goto | Family::If(_) | Family::IfZ(_) | Family::Switch | Family::Return(_) | Family::ReturnVoid | Family::Throw
        )
    }

    pub fn can_continue(&self) -> bool {
        self.opcode.can_continue()
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}: {}", self.offset, self.opcode.name)?;
        let regs = self.registers();
        for (i, r) in regs.iter().enumerate() {
            write!(f, "{}v{}", if i == 0 { " " } else { ", " }, r)?;
        }
        match &self.operands {
            Operands::Literal { value, .. } => write!(f, ", #{}", value),
            Operands::Branch { target, .. } => write!(f, ", :{:04x}", target),
            Operands::Reference { reference, .. } | Operands::Range { reference, .. } => write!(f, ", {:?}", reference),
            Operands::Switch { cases, .. } => write!(f, ", {} cases", cases.len()),
            Operands::ArrayData { elements, .. } => write!(f, ", {} elements", elements.len()),
            Operands::None | Operands::Registers(_) => Ok(()),
        }
    }
}
