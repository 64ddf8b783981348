//! Register typing at a program point.

use std::fmt;

use crate::analysis::bitset::BitSet;
use crate::dex::descriptors::MethodDescriptor;
use crate::dex::error::DexError;
use crate::transform::jvm::SlotKind;

/// Type held by one register.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LocalType {
    Value(SlotKind),
    /// Upper half of the wide value in the register below.
    Top,
}

impl fmt::Display for LocalType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LocalType::Value(k) => write!(f, "{:?}", k),
            LocalType::Top => write!(f, "Top"),
        }
    }
}

/// Maps each Dalvik register to the type it holds, or `None` when unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    locals: Vec<Option<LocalType>>,
}

impl StackFrame {
    pub fn new(register_count: u16) -> StackFrame {
        StackFrame { locals: vec![None; register_count as usize] }
    }

    /// Frame at method entry: `this` and the parameters occupy the last
    /// registers of the frame.
    pub fn entry(method: &MethodDescriptor) -> Result<StackFrame, DexError> {
        let mut frame = StackFrame::new(method.registers_size());
        let ins = method.proto.ins_words(method.is_static());
        if ins != method.ins_size() {
            fail!(
                kind = Structural,
                "{} declares {} argument registers, its prototype needs {}",
                method,
                method.ins_size(),
                ins
            );
        }
        let mut reg = method.registers_size() - ins;
        if !method.is_static() {
            frame.set(reg, SlotKind::Reference);
            reg += 1;
        }
        for p in &method.proto.params {
            let kind = SlotKind::of(p)?;
            frame.set(reg, kind);
            reg += kind.width();
        }
        Ok(frame)
    }

    pub fn register_count(&self) -> usize {
        self.locals.len()
    }

    /// Kind of the value starting at `reg`.
    pub fn get(&self, reg: u16) -> Option<SlotKind> {
        match self.locals.get(reg as usize) {
            Some(Some(LocalType::Value(k))) => Some(*k),
            _ => None,
        }
    }

    pub fn local(&self, reg: u16) -> Option<LocalType> {
        self.locals.get(reg as usize).copied().flatten()
    }

    /// Records a write of `kind` to `reg`, and to `reg + 1` for wide kinds.
    pub fn set(&mut self, reg: u16, kind: SlotKind) {
        let r = reg as usize;
        let end = (r + kind.width() as usize).min(self.locals.len());
        for i in r..end {
            self.clobber(i);
        }
        if r < self.locals.len() {
            self.locals[r] = Some(LocalType::Value(kind));
        }
        if kind.is_wide() && r + 1 < self.locals.len() {
            self.locals[r + 1] = Some(LocalType::Top);
        }
    }

    // a write into either half of a wide pair invalidates the other half
    fn clobber(&mut self, r: usize) {
        match self.locals[r] {
            Some(LocalType::Top) if r > 0 => self.locals[r - 1] = None,
            Some(LocalType::Value(k)) if k.is_wide() && r + 1 < self.locals.len() => self.locals[r + 1] = None,
            _ => {}
        }
        self.locals[r] = None;
    }

    /// Joins `other` into this frame. Registers in `live` must agree; any
    /// other disagreement makes the register unknown.
    pub fn merge(&mut self, other: &StackFrame, live: &BitSet) -> Result<(), DexError> {
        for (reg, (mine, theirs)) in self.locals.iter_mut().zip(other.locals.iter()).enumerate() {
            match (*mine, *theirs) {
                (Some(a), Some(b)) if a != b => {
                    if live.get(reg) {
                        fail!(kind = Structural, "conflicting types for v{} at join: {} and {}", reg, a, b);
                    }
                    *mine = None;
                }
                (Some(_), None) => *mine = None,
                _ => {}
            }
        }
        Ok(())
    }

    /// Checks an incoming frame against a join point whose entry frame is
    /// already fixed.
    pub fn check_compatible(&self, incoming: &StackFrame, live: &BitSet) -> Result<(), DexError> {
        for reg in live.iter() {
            if let (Some(a), Some(b)) = (self.local(reg as u16), incoming.local(reg as u16)) {
                if a != b {
                    fail!(kind = Structural, "conflicting types for v{} at join: {} and {}", reg, a, b);
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, l) in self.locals.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match l {
                Some(t) => write!(f, "{}", t)?,
                None => write!(f, "-")?,
            }
        }
        write!(f, "]")
    }
}
