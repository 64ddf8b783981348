use std::fmt;
use serde::Serialize;

macro_rules! err {
    (kind = $kind:ident, $fmtstr:literal $(, $args:expr)* $(,)?) => {
        $crate::dex::error::DexError::of_kind($crate::dex::error::ErrorKind::$kind, format!($fmtstr $(, $args)*))
    };
    ($base:ident, $msg:literal) => {
        $crate::dex::error::DexError::with_context($base, $msg.to_string())
    };
    ($base:ident, $fmtstr:literal, $($args:tt)*) => {
        $crate::dex::error::DexError::with_context($base, format!($fmtstr, $($args)*))
    };
    ($msg:literal) => {
        $crate::dex::error::DexError::new($msg)
    };
    ($fmtstr:literal, $($args:tt)*) => {
        $crate::dex::error::DexError::new(format!($fmtstr, $($args)*))
    };
}


#[macro_export]
macro_rules! fail {
    (kind = $kind:ident, $fmtstr:literal $(, $args:expr)* $(,)?) => {
        return Err($crate::dex::error::DexError::of_kind($crate::dex::error::ErrorKind::$kind, format!($fmtstr $(, $args)*)))
    };
    (at = $offset:expr, $fmtstr:literal $(, $args:expr)* $(,)?) => {
        return Err($crate::dex::error::DexError::new(format!($fmtstr $(, $args)*)).at($offset))
    };
    ($msg:literal) => {
        return Err($crate::dex::error::DexError::new($msg))
    };
    (($msg:literal), ($context:literal)) => {
        return Err($crate::dex::error::DexError::with_context($crate::dex::error::DexError::new($msg), $context.to_string()))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        return Err($crate::dex::error::DexError::new(&format!($fmtstr, $($args)*)))
    };
}


/// Broad classes of failure. Decode errors mean the input bytes are malformed,
/// structural errors mean an analysis found an inconsistency, and unsupported
/// errors mean the input is valid but cannot be lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind
{
    Decode,
    Structural,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexError
{
    kind: ErrorKind,
    msg: String,
    offset: Option<usize>,
    contexts: Vec<String>,
}

impl DexError
{
    pub(crate) fn new(msg: impl Into<String>) -> Self
    {
        DexError::of_kind(ErrorKind::Decode, msg)
    }

    pub(crate) fn of_kind(kind: ErrorKind, msg: impl Into<String>) -> Self
    {
        DexError {
            kind,
            msg: msg.into(),
            offset: None,
            contexts: Vec::new(),
        }
    }

    /// Attach the offending offset. An offset that is already recorded wins.
    pub(crate) fn at(mut self, offset: usize) -> Self
    {
        if self.offset.is_none() { self.offset = Some(offset); }
        self
    }

    pub(crate) fn with_context(base: DexError, context: String) -> Self
    {
        let mut contexts = base.contexts;
        contexts.push(context);
        DexError { contexts, ..base }
    }

    pub fn kind(&self) -> ErrorKind
    {
        self.kind
    }

    pub fn offset(&self) -> Option<usize>
    {
        self.offset
    }

    pub fn message(&self) -> &str
    {
        &self.msg
    }
}

impl fmt::Display for DexError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{:?} error: {}", self.kind, self.msg)?;
        if let Some(offset) = self.offset
        {
            write!(f, " at 0x{:x}", offset)?;
        }
        let mut connector = " for ";
        for context in &self.contexts
        {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for DexError {}

/// Extension used at pipeline boundaries to tag an error with where it happened.
pub trait Context<T>
{
    fn context(self, context: impl FnOnce() -> String) -> Result<T, DexError>;
}

impl<T> Context<T> for Result<T, DexError>
{
    fn context(self, context: impl FnOnce() -> String) -> Result<T, DexError>
    {
        self.map_err(|e| DexError::with_context(e, context()))
    }
}
