pub(crate) mod fixture;

#[cfg(test)]
mod tests {
    use super::fixture::{ClassSpec, CodeSpec, DexBuilder, MethodSpec};
    use crate::analysis::exceptions::ExceptionTable;
    use crate::dex::container::{AccessFlags, Container};
    use crate::dex::descriptors::{ClassDescriptor, MethodDescriptor, PoolResolver, Registry};
    use crate::dex::error::{DexError, ErrorKind};
    use crate::dex::instructions::{ArithOp, NumKind};
    use crate::transform::jvm::{JvmInst, Label, SlotKind};
    use crate::transform::passes::OptLevel;
    use crate::translate::{BatchSummary, ClassSink, MethodBody, TranslateOptions, Translator};

    const CALC: &str = "Lcom/example/Calc;";
    const FOO_EXCEPTION: &str = "Lcom/example/FooException;";

    fn static_method(name: &str, ret: &str, params: &[&str], code: CodeSpec) -> MethodSpec {
        MethodSpec::new(name, ret, params).flags(AccessFlags::PUBLIC | AccessFlags::STATIC).code(code)
    }

    fn container(class: ClassSpec) -> Container {
        let mut b = DexBuilder::new();
        b.class(class);
        Container::from_bytes(b.build()).unwrap()
    }

    fn find<'c>(classes: &'c [ClassDescriptor], name: &str) -> &'c MethodDescriptor {
        classes[0].methods.iter().find(|m| m.name == name).unwrap()
    }

    #[test]
    fn scenario_add_decodes_to_one_block()
    {
        // add-int v2, v0, v1 ; return v2
        let c = container(ClassSpec::new(CALC).method(static_method(
            "add",
            "I",
            &["I", "I"],
            CodeSpec::new(3, 2, vec![0x0290, 0x0100, 0x020f]),
        )));
        let registry = Registry::new();
        let classes = crate::parse(&c, &registry).unwrap();
        let add = find(&classes, "add");

        let slots = crate::decode(add).unwrap();
        assert_eq!(slots.len(), 3);
        assert!(slots[0].is_some() && slots[1].is_none() && slots[2].is_some());

        let cfg = crate::build_cfg(add).unwrap();
        assert_eq!(cfg.block_count(), 1);
        assert!(cfg.block(0).succs.is_empty());

        let liveness = crate::analyze_liveness(&cfg).unwrap();
        assert_eq!(liveness.use_sets[0].to_string(), "{0 1}");
        assert_eq!(liveness.def_sets[0].to_string(), "{2}");
        assert!(liveness.live_out[0].is_empty());
    }

    #[test]
    fn scenario_self_loop_converges()
    {
        // :0 add-int/lit8 v0, v0, 1 ; goto :0
        let c = container(ClassSpec::new(CALC).method(static_method(
            "spin",
            "V",
            &["I"],
            CodeSpec::new(1, 1, vec![0x00d8, 0x0100, 0xfe28]),
        )));
        let registry = Registry::new();
        let classes = crate::parse(&c, &registry).unwrap();
        let spin = find(&classes, "spin");

        let cfg = crate::build_cfg(spin).unwrap();
        assert_eq!(cfg.block(0).succs, vec![0]);
        let liveness = crate::analyze_liveness(&cfg).unwrap();
        assert!(liveness.passes <= cfg.register_count() as usize * cfg.block_count() + 2);
        assert_eq!(liveness.live_in[0].to_string(), "{0}");
        assert_eq!(liveness.live_out[0].to_string(), "{0}");

        let resolver = PoolResolver::new(&c, &registry);
        let lowered = crate::lower(spin, &cfg, &liveness, &resolver).unwrap();
        assert_eq!(
            lowered.instructions,
            vec![JvmInst::Label(Label(0)), JvmInst::IInc { slot: 0, delta: 1 }, JvmInst::Goto(Label(0))]
        );
        assert_eq!((lowered.max_stack, lowered.max_locals), (0, 1));
    }

    #[test]
    fn scenario_shared_handler_is_merged()
    {
        // two regions over nops, both catching FooException at 0x10
        let mut insns = vec![0x0000; 0x10];
        insns.extend([0x000d, 0x0027]);
        let code = CodeSpec::new(1, 0, insns)
            .handler(&[(FOO_EXCEPTION, 0x10)], None)
            .try_range(0, 4, 0)
            .try_range(4, 4, 0);
        let c = container(ClassSpec::new(CALC).method(static_method("guarded", "V", &[], code)));
        let registry = Registry::new();
        let classes = crate::parse(&c, &registry).unwrap();
        let code = find(&classes, "guarded").code().unwrap();

        let mut table = ExceptionTable::collect(code).unwrap();
        assert_eq!(table.handlers().len(), 1);
        assert_eq!(table.handler_ref_count(), 2);
        table.merge();
        assert_eq!(table.handler_ref_count(), 1);
        assert_eq!(ExceptionTable::build(code).unwrap().handler_ref_count(), 1);
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        bodies: Vec<(String, MethodBody)>,
    }

    impl ClassSink for Recorder {
        fn begin_class(&mut self, class: &ClassDescriptor) -> Result<(), DexError> {
            self.events.push(format!("begin {}", class.name()));
            Ok(())
        }

        fn method(&mut self, _class: &ClassDescriptor, method: &MethodDescriptor, body: MethodBody) -> Result<(), DexError> {
            self.events.push(format!("method {}", method.name));
            self.bodies.push((method.name.clone(), body));
            Ok(())
        }

        fn end_class(&mut self, class: &ClassDescriptor) -> Result<(), DexError> {
            self.events.push(format!("end {}", class.name()));
            Ok(())
        }
    }

    fn calculator() -> Container {
        let mut b = DexBuilder::new();
        b.class(
            ClassSpec::new(CALC)
                // add-int v0, v1, v2 ; return v0
                .method(static_method("add", "I", &["I", "I"], CodeSpec::new(3, 2, vec![0x0090, 0x0201, 0x000f])))
                // const-method-type v0, proto@0 ; return-void
                .method(static_method("handle", "V", &[], CodeSpec::new(1, 0, vec![0x00ff, 0x0000, 0x000e])))
                .method(MethodSpec::new("hash", "I", &[]).flags(AccessFlags::PUBLIC | AccessFlags::NATIVE)),
        );
        b.class(
            ClassSpec::new("Lcom/example/Empty;")
                .method(MethodSpec::new("run", "V", &[]).flags(AccessFlags::PUBLIC | AccessFlags::ABSTRACT)),
        );
        Container::from_bytes(b.build()).unwrap()
    }

    #[test]
    fn batch_isolates_failing_methods()
    {
        let c = calculator();
        let registry = Registry::new();
        let translator = Translator::new(&c, &registry, TranslateOptions::default());
        let mut sink = Recorder::default();
        let summary = translator.translate(&mut sink).unwrap();

        assert_eq!(
            summary,
            BatchSummary {
                classes: 2,
                failed_classes: 0,
                methods_succeeded: 1,
                methods_failed: 1,
                methods_without_code: 2,
            }
        );
        assert_eq!(sink.events.first().unwrap(), "begin com/example/Calc");
        assert_eq!(sink.events.last().unwrap(), "end com/example/Empty");
        assert_eq!(sink.events.len(), 2 + 3 + 2 + 1);

        let body = |name: &str| sink.bodies.iter().find(|(n, _)| n == name).map(|(_, b)| b.clone()).unwrap();
        match body("add") {
            MethodBody::Lowered(m) => {
                assert_eq!(
                    m.instructions,
                    vec![
                        JvmInst::Load { kind: SlotKind::Int, slot: 0, last_use: true },
                        JvmInst::Load { kind: SlotKind::Int, slot: 1, last_use: true },
                        JvmInst::Binary(ArithOp::Add, NumKind::Int),
                        JvmInst::Return(Some(SlotKind::Int)),
                    ]
                );
                assert_eq!((m.max_stack, m.max_locals), (2, 2));
            }
            other => panic!("unexpected {:?}", other),
        }
        match body("handle") {
            MethodBody::Failed { kind, message } => {
                assert_eq!(kind, ErrorKind::Unsupported);
                assert!(message.contains("handle"), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(body("hash"), MethodBody::NoCode);
        assert_eq!(body("run"), MethodBody::NoCode);
    }

    #[test]
    fn batch_skips_class_with_array_type()
    {
        let mut b = DexBuilder::new();
        b.class(
            ClassSpec::new("Lcom/example/Good;")
                .method(static_method("add", "I", &["I", "I"], CodeSpec::new(3, 2, vec![0x0090, 0x0201, 0x000f]))),
        );
        b.class(ClassSpec::new("[I"));
        let c = Container::from_bytes(b.build()).unwrap();
        let registry = Registry::new();
        let translator = Translator::new(&c, &registry, TranslateOptions::default());
        let mut sink = Recorder::default();
        let summary = translator.translate(&mut sink).unwrap();

        assert_eq!(summary.classes, 1);
        assert_eq!(summary.failed_classes, 1);
        assert_eq!(summary.methods_succeeded, 1);
        assert_eq!(sink.events, vec!["begin com/example/Good", "method add", "end com/example/Good"]);
        assert!(crate::parse(&c, &registry).is_err());
    }

    #[test]
    fn unoptimised_batch_keeps_stores()
    {
        let c = calculator();
        let registry = Registry::new();
        let options = TranslateOptions { opt_level: OptLevel::None };
        let translator = Translator::new(&c, &registry, options);
        let classes = crate::parse(&c, &registry).unwrap();
        let lowered = translator.translate_method(find(&classes, "add")).unwrap();
        assert_eq!(lowered.code_len(), 6);
        assert_eq!((lowered.max_stack, lowered.max_locals), (2, 3));
    }
}
