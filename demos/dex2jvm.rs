use dex2jvm::dex::container::Container;
use dex2jvm::dex::descriptors::{ClassDescriptor, MethodDescriptor, Registry};
use dex2jvm::dex::error::DexError;
use dex2jvm::transform::passes::OptLevel;
use dex2jvm::{ClassSink, MethodBody, TranslateOptions, Translator};
use std::env;
use std::error::Error;
use std::path::Path;

// Prints the lowered JVM code of every method in a dex file.
// Set RUST_LOG=info (or debug) to see per-class and per-pass logging.

//Usage: dex2jvm <dex-file> [--no-opt]
fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        println!("Usage: {} <dex-file> [--no-opt]", args[0]);
        return;
    }

    match process_dex(&args[1], args.iter().any(|a| a == "--no-opt")) {
        Ok(_) => {}
        Err(e) => {
            println!("Aborted due to error: {}", e);
        }
    }
}

struct Printer;

impl ClassSink for Printer {
    fn begin_class(&mut self, class: &ClassDescriptor) -> Result<(), DexError> {
        let super_name = class.super_class.as_ref().map(|s| s.internal_name()).unwrap_or_default();
        println!("class {} extends {} [{:?}]", class.name(), super_name, class.access);
        Ok(())
    }

    fn method(&mut self, _class: &ClassDescriptor, method: &MethodDescriptor, body: MethodBody) -> Result<(), DexError> {
        match body {
            MethodBody::NoCode => println!("  {}{} (no code)", method.name, method.descriptor()),
            MethodBody::Lowered(m) => print!("  {}", m),
            MethodBody::Failed { kind, message } => println!("  {}{} FAILED {:?}: {}", method.name, method.descriptor(), kind, message),
        }
        Ok(())
    }

    fn end_class(&mut self, _class: &ClassDescriptor) -> Result<(), DexError> {
        println!();
        Ok(())
    }
}

fn process_dex(dex_file: &str, no_opt: bool) -> Result<(), Box<dyn Error>> {
    let container = Container::from_file(Path::new(dex_file))?;
    let registry = Registry::new();
    let options = TranslateOptions { opt_level: if no_opt { OptLevel::None } else { OptLevel::Normal } };

    let summary = Translator::new(&container, &registry, options).translate(&mut Printer)?;
    println!(
        "{} classes ({} failed), {} methods lowered, {} failed, {} without code",
        summary.classes, summary.failed_classes, summary.methods_succeeded, summary.methods_failed, summary.methods_without_code
    );
    Ok(())
}
