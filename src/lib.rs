//! # dex2jvm
//!
//! Translates the register-based bytecode of Android `.dex` containers into
//! JVM stack bytecode: each method is decoded, split into basic blocks,
//! analysed for register liveness and lowered to symbolic JVM instructions
//! that a class writer can serialise.
//!
//! ```no_run
//!  use dex2jvm::dex::container::Container;
//!  use dex2jvm::dex::descriptors::Registry;
//!  use std::path::Path;
//!
//!  let container = Container::from_file(Path::new("classes.dex")).unwrap();
//!  let registry = Registry::new();
//!  for class in dex2jvm::parse(&container, &registry).unwrap() {
//!      for method in class.methods.iter().filter(|m| m.code().is_some()) {
//!          let cfg = dex2jvm::build_cfg(method).unwrap();
//!          let liveness = dex2jvm::analyze_liveness(&cfg).unwrap();
//!          let resolver = dex2jvm::dex::descriptors::PoolResolver::new(&container, &registry);
//!          println!("{}", dex2jvm::lower(method, &cfg, &liveness, &resolver).unwrap());
//!      }
//!  }
//! ```

use crate::analysis::cfg::Cfg;
use crate::analysis::liveness::LivenessInfo;
use crate::dex::container::Container;
use crate::dex::descriptors::{ClassDescriptor, MethodDescriptor, RefResolver, Registry};
use crate::dex::error::DexError;
use crate::dex::instructions::DecodedInstruction;
use crate::transform::jvm::LoweredMethod;
use crate::transform::passes::OptLevel;

#[macro_use]
pub mod dex;
pub mod analysis;
pub mod transform;
pub mod translate;
#[cfg(test)]
mod tests;

pub use crate::translate::{BatchSummary, ClassSink, MethodBody, TranslateOptions, Translator};

/// Parses every class definition in the container, registering class
/// identities in `registry` first.
pub fn parse(container: &Container, registry: &Registry) -> Result<Vec<ClassDescriptor>, DexError> {
    dex::descriptors::parse_classes(container, registry)
}

/// Decoded instruction slots of a method, one per code unit. Continuation
/// units and payload tables hold `None`.
pub fn decode(method: &MethodDescriptor) -> Result<&[Option<DecodedInstruction>], DexError> {
    method.decode()
}

pub fn build_cfg(method: &MethodDescriptor) -> Result<Cfg<'_>, DexError> {
    Cfg::build(method)
}

pub fn analyze_liveness(cfg: &Cfg) -> Result<LivenessInfo, DexError> {
    analysis::liveness::analyze(cfg)
}

/// Lowers a method and runs the default cleanup passes over the result.
pub fn lower(
    method: &MethodDescriptor,
    cfg: &Cfg,
    liveness: &LivenessInfo,
    resolver: &dyn RefResolver,
) -> Result<LoweredMethod, DexError> {
    let mut lowered = transform::lower::lower(method, cfg, liveness, resolver)?;
    transform::passes::cleanup(&mut lowered, OptLevel::Normal)?;
    Ok(lowered)
}
