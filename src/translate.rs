//! Batch translation of every class in a container.
//!
//! A failing method is reported to the sink and counted; its siblings are
//! still translated. A class that cannot be parsed is skipped the same way.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::analysis::cfg::Cfg;
use crate::analysis::liveness;
use crate::dex::container::Container;
use crate::dex::descriptors::{parse_class, register_classes, ClassDescriptor, MethodDescriptor, PoolResolver, Registry};
use crate::dex::error::{Context, DexError, ErrorKind};
use crate::transform::jvm::LoweredMethod;
use crate::transform::lower::lower;
use crate::transform::passes::{cleanup, OptLevel};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslateOptions {
    #[serde(default)]
    pub opt_level: OptLevel,
}

/// Outcome for one method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MethodBody {
    /// Abstract or native.
    NoCode,
    Lowered(LoweredMethod),
    Failed { kind: ErrorKind, message: String },
}

/// Receives translated classes, typically to write them out as class files.
pub trait ClassSink {
    fn begin_class(&mut self, class: &ClassDescriptor) -> Result<(), DexError>;
    fn method(&mut self, class: &ClassDescriptor, method: &MethodDescriptor, body: MethodBody) -> Result<(), DexError>;
    fn end_class(&mut self, class: &ClassDescriptor) -> Result<(), DexError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub classes: usize,
    pub failed_classes: usize,
    pub methods_succeeded: usize,
    pub methods_failed: usize,
    pub methods_without_code: usize,
}

pub struct Translator<'a> {
    container: &'a Container,
    registry: &'a Registry,
    options: TranslateOptions,
}

impl<'a> Translator<'a> {
    pub fn new(container: &'a Container, registry: &'a Registry, options: TranslateOptions) -> Translator<'a> {
        Translator { container, registry, options }
    }

    /// Translates every class definition, handing the results to `sink`.
    ///
    /// Only sink errors abort the batch.
    pub fn translate(&self, sink: &mut dyn ClassSink) -> Result<BatchSummary, DexError> {
        register_classes(self.container, self.registry);

        let mut summary = BatchSummary::default();
        for def in self.container.class_defs() {
            let class = match parse_class(self.container, self.registry, def) {
                Ok(c) => c,
                Err(e) => {
                    error!("skipping class: {}", e);
                    summary.failed_classes += 1;
                    continue;
                }
            };

            sink.begin_class(&class)?;
            let mut failed = 0;
            for method in &class.methods {
                let body = if method.code().is_none() {
                    summary.methods_without_code += 1;
                    MethodBody::NoCode
                } else {
                    match self.translate_method(method) {
                        Ok(lowered) => {
                            summary.methods_succeeded += 1;
                            MethodBody::Lowered(lowered)
                        }
                        Err(e) => {
                            error!("{}", e);
                            failed += 1;
                            MethodBody::Failed { kind: e.kind(), message: e.to_string() }
                        }
                    }
                };
                sink.method(&class, method, body)?;
            }
            sink.end_class(&class)?;

            summary.classes += 1;
            summary.methods_failed += failed;
            if failed > 0 {
                warn!("{}: {} of {} methods failed", class.info, failed, class.methods.len());
            } else {
                info!("{}: {} methods", class.info, class.methods.len());
            }
        }

        info!(
            "translated {} classes ({} failed), {} methods ({} failed, {} without code)",
            summary.classes,
            summary.failed_classes,
            summary.methods_succeeded,
            summary.methods_failed,
            summary.methods_without_code
        );
        Ok(summary)
    }

    /// Runs the pipeline over one method with code.
    pub fn translate_method(&self, method: &MethodDescriptor) -> Result<LoweredMethod, DexError> {
        let cfg = Cfg::build(method)?;
        let liveness = liveness::analyze(&cfg).context(|| method.to_string())?;
        let resolver = PoolResolver::new(self.container, self.registry);
        let mut lowered = lower(method, &cfg, &liveness, &resolver)?;
        cleanup(&mut lowered, self.options.opt_level)?;
        Ok(lowered)
    }
}
