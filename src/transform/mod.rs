//! Lowering of analysed Dalvik methods to JVM stack code, and the cleanup
//! passes run over the result.

pub mod frame;
pub mod jvm;
pub mod lower;
pub mod passes;
