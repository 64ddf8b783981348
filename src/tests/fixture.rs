//! In-memory writer for small dex containers used by the tests.
//!
//! Pools are interned in insertion order, so indices returned by
//! [`DexBuilder::method`] and friends can be embedded in instruction words
//! before the class that uses them is added.

use std::collections::HashMap;

use crate::dex::container::{AccessFlags, ENDIAN_CONSTANT, HEADER_SIZE};
use crate::dex::{write_sleb128, write_u2, write_u4, write_uleb128};

const OBJECT: &str = "Ljava/lang/Object;";

#[derive(Debug, Clone)]
pub struct CodeSpec {
    registers: u16,
    ins: u16,
    outs: u16,
    insns: Vec<u16>,
    tries: Vec<(u32, u16, usize)>,
    handlers: Vec<(Vec<(String, u32)>, Option<u32>)>,
}

impl CodeSpec {
    pub fn new(registers: u16, ins: u16, insns: Vec<u16>) -> CodeSpec {
        CodeSpec { registers, ins, outs: 0, insns, tries: vec![], handlers: vec![] }
    }

    pub fn outs(mut self, outs: u16) -> CodeSpec {
        self.outs = outs;
        self
    }

    /// Adds a handler entry; entries are numbered in the order they are added.
    pub fn handler(mut self, catches: &[(&str, u32)], catch_all: Option<u32>) -> CodeSpec {
        self.handlers.push((catches.iter().map(|(t, a)| (t.to_string(), *a)).collect(), catch_all));
        self
    }

    pub fn try_range(mut self, start: u32, count: u16, handler: usize) -> CodeSpec {
        self.tries.push((start, count, handler));
        self
    }
}

#[derive(Debug, Clone)]
pub struct MethodSpec {
    name: String,
    ret: String,
    params: Vec<String>,
    access: AccessFlags,
    code: Option<CodeSpec>,
}

impl MethodSpec {
    pub fn new(name: &str, ret: &str, params: &[&str]) -> MethodSpec {
        MethodSpec {
            name: name.to_string(),
            ret: ret.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            access: AccessFlags::PUBLIC,
            code: None,
        }
    }

    pub fn flags(mut self, access: AccessFlags) -> MethodSpec {
        self.access = access;
        self
    }

    pub fn code(mut self, code: CodeSpec) -> MethodSpec {
        self.code = Some(code);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClassSpec {
    name: String,
    super_name: Option<String>,
    access: AccessFlags,
    interfaces: Vec<String>,
    fields: Vec<(String, String, AccessFlags)>,
    methods: Vec<MethodSpec>,
}

impl ClassSpec {
    pub fn new(name: &str) -> ClassSpec {
        ClassSpec {
            name: name.to_string(),
            super_name: Some(OBJECT.to_string()),
            access: AccessFlags::PUBLIC,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
        }
    }

    pub fn super_class(mut self, name: Option<&str>) -> ClassSpec {
        self.super_name = name.map(|n| n.to_string());
        self
    }

    pub fn interface(mut self, name: &str) -> ClassSpec {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn field(mut self, name: &str, ty: &str, access: AccessFlags) -> ClassSpec {
        self.fields.push((name.to_string(), ty.to_string(), access));
        self
    }

    pub fn method(mut self, method: MethodSpec) -> ClassSpec {
        self.methods.push(method);
        self
    }
}

struct CodePlan {
    registers: u16,
    ins: u16,
    outs: u16,
    insns: Vec<u16>,
    tries: Vec<(u32, u16, usize)>,
    handlers: Vec<(Vec<(u32, u32)>, Option<u32>)>,
}

struct ClassPlan {
    class_idx: u32,
    access: AccessFlags,
    super_idx: Option<u32>,
    interfaces: Vec<u32>,
    static_fields: Vec<(u32, AccessFlags)>,
    instance_fields: Vec<(u32, AccessFlags)>,
    direct: Vec<(u32, AccessFlags, Option<CodePlan>)>,
    virtuals: Vec<(u32, AccessFlags, Option<CodePlan>)>,
}

#[derive(Default)]
pub struct DexBuilder {
    strings: Vec<String>,
    string_ix: HashMap<String, u32>,
    types: Vec<u32>,
    type_ix: HashMap<String, u32>,
    protos: Vec<(u32, u32, Vec<u32>)>,
    proto_ix: HashMap<String, u32>,
    fields: Vec<(u32, u32, u32)>,
    field_ix: HashMap<(u32, u32, u32), u32>,
    methods: Vec<(u32, u32, u32)>,
    method_ix: HashMap<(u32, u32, u32), u32>,
    classes: Vec<ClassPlan>,
}

fn shorty_char(descriptor: &str) -> char {
    match descriptor.chars().next() {
        Some('L') | Some('[') => 'L',
        Some(c) => c,
        None => 'V',
    }
}

fn align(buffer: &mut Vec<u8>, base: usize, to: usize) {
    while (base + buffer.len()) % to != 0 {
        buffer.push(0);
    }
}

impl DexBuilder {
    pub fn new() -> DexBuilder {
        DexBuilder::default()
    }

    pub fn string(&mut self, s: &str) -> u32 {
        if let Some(ix) = self.string_ix.get(s) {
            return *ix;
        }
        let ix = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_ix.insert(s.to_string(), ix);
        ix
    }

    pub fn type_id(&mut self, descriptor: &str) -> u32 {
        if let Some(ix) = self.type_ix.get(descriptor) {
            return *ix;
        }
        let string = self.string(descriptor);
        let ix = self.types.len() as u32;
        self.types.push(string);
        self.type_ix.insert(descriptor.to_string(), ix);
        ix
    }

    pub fn proto(&mut self, ret: &str, params: &[&str]) -> u32 {
        let key = format!("({}){}", params.concat(), ret);
        if let Some(ix) = self.proto_ix.get(&key) {
            return *ix;
        }
        let shorty: String = std::iter::once(ret).chain(params.iter().copied()).map(shorty_char).collect();
        let shorty = self.string(&shorty);
        let ret = self.type_id(ret);
        let params = params.iter().map(|p| self.type_id(p)).collect();
        let ix = self.protos.len() as u32;
        self.protos.push((shorty, ret, params));
        self.proto_ix.insert(key, ix);
        ix
    }

    pub fn field(&mut self, class: &str, name: &str, ty: &str) -> u32 {
        let key = (self.type_id(class), self.type_id(ty), self.string(name));
        if let Some(ix) = self.field_ix.get(&key) {
            return *ix;
        }
        let ix = self.fields.len() as u32;
        self.fields.push(key);
        self.field_ix.insert(key, ix);
        ix
    }

    pub fn method(&mut self, class: &str, name: &str, ret: &str, params: &[&str]) -> u32 {
        let key = (self.type_id(class), self.proto(ret, params), self.string(name));
        if let Some(ix) = self.method_ix.get(&key) {
            return *ix;
        }
        let ix = self.methods.len() as u32;
        self.methods.push(key);
        self.method_ix.insert(key, ix);
        ix
    }

    pub fn class(&mut self, spec: ClassSpec) -> &mut DexBuilder {
        let class_idx = self.type_id(&spec.name);
        let super_idx = spec.super_name.as_deref().map(|s| self.type_id(s));
        let interfaces = spec.interfaces.iter().map(|i| self.type_id(i)).collect();

        let mut static_fields = vec![];
        let mut instance_fields = vec![];
        for (name, ty, access) in &spec.fields {
            let idx = self.field(&spec.name, name, ty);
            if access.contains(AccessFlags::STATIC) {
                static_fields.push((idx, *access));
            } else {
                instance_fields.push((idx, *access));
            }
        }

        let mut direct = vec![];
        let mut virtuals = vec![];
        for m in &spec.methods {
            let params: Vec<&str> = m.params.iter().map(|p| p.as_str()).collect();
            let idx = self.method(&spec.name, &m.name, &m.ret, &params);
            let code = m.code.as_ref().map(|c| CodePlan {
                registers: c.registers,
                ins: c.ins,
                outs: c.outs,
                insns: c.insns.clone(),
                tries: c.tries.clone(),
                handlers: c
                    .handlers
                    .iter()
                    .map(|(catches, all)| (catches.iter().map(|(t, a)| (self.type_id(t), *a)).collect(), *all))
                    .collect(),
            });
            if m.access.intersects(AccessFlags::STATIC | AccessFlags::PRIVATE | AccessFlags::CONSTRUCTOR) {
                direct.push((idx, m.access, code));
            } else {
                virtuals.push((idx, m.access, code));
            }
        }
        static_fields.sort_by_key(|f| f.0);
        instance_fields.sort_by_key(|f| f.0);
        direct.sort_by_key(|m| m.0);
        virtuals.sort_by_key(|m| m.0);

        self.classes.push(ClassPlan { class_idx, access: spec.access, super_idx, interfaces, static_fields, instance_fields, direct, virtuals });
        self
    }

    pub fn build(&mut self) -> Vec<u8> {
        let string_ids_off = HEADER_SIZE;
        let type_ids_off = string_ids_off + 4 * self.strings.len();
        let proto_ids_off = type_ids_off + 4 * self.types.len();
        let field_ids_off = proto_ids_off + 12 * self.protos.len();
        let method_ids_off = field_ids_off + 8 * self.fields.len();
        let class_defs_off = method_ids_off + 8 * self.methods.len();
        let data_off = class_defs_off + 32 * self.classes.len();

        let mut data: Vec<u8> = vec![];

        let mut string_offsets = vec![];
        for s in &self.strings {
            string_offsets.push((data_off + data.len()) as u32);
            write_uleb128(&mut data, s.encode_utf16().count() as u32);
            data.extend_from_slice(&cesu8::to_java_cesu8(s));
            data.push(0);
        }

        let write_type_list = |data: &mut Vec<u8>, list: &[u32]| -> u32 {
            if list.is_empty() {
                return 0;
            }
            align(data, data_off, 4);
            let off = (data_off + data.len()) as u32;
            write_u4(data, list.len() as u32);
            for t in list {
                write_u2(data, *t as u16);
            }
            off
        };
        let proto_params: Vec<u32> = self.protos.iter().map(|p| write_type_list(&mut data, &p.2)).collect();
        let interfaces: Vec<u32> = self.classes.iter().map(|c| write_type_list(&mut data, &c.interfaces)).collect();

        let mut class_data_offs = vec![];
        for class in &self.classes {
            let mut code_offs = HashMap::new();
            for (idx, _, code) in class.direct.iter().chain(class.virtuals.iter()) {
                if let Some(code) = code {
                    align(&mut data, data_off, 4);
                    code_offs.insert(*idx, (data_off + data.len()) as u32);
                    write_code(&mut data, code);
                }
            }

            let off = (data_off + data.len()) as u32;
            write_uleb128(&mut data, class.static_fields.len() as u32);
            write_uleb128(&mut data, class.instance_fields.len() as u32);
            write_uleb128(&mut data, class.direct.len() as u32);
            write_uleb128(&mut data, class.virtuals.len() as u32);
            for fields in [&class.static_fields, &class.instance_fields] {
                let mut last = 0;
                for (idx, access) in fields {
                    write_uleb128(&mut data, idx - last);
                    write_uleb128(&mut data, access.bits());
                    last = *idx;
                }
            }
            for methods in [&class.direct, &class.virtuals] {
                let mut last = 0;
                for (idx, access, _) in methods {
                    write_uleb128(&mut data, idx - last);
                    write_uleb128(&mut data, access.bits());
                    write_uleb128(&mut data, code_offs.get(idx).copied().unwrap_or(0));
                    last = *idx;
                }
            }
            class_data_offs.push(off);
        }

        let file_size = data_off + data.len();
        let mut out = Vec::with_capacity(file_size);
        out.extend_from_slice(b"dex\n035\0");
        write_u4(&mut out, 0); // checksum
        out.extend_from_slice(&[0u8; 20]);
        write_u4(&mut out, file_size as u32);
        write_u4(&mut out, HEADER_SIZE as u32);
        write_u4(&mut out, ENDIAN_CONSTANT);
        write_u4(&mut out, 0); // link_size
        write_u4(&mut out, 0); // link_off
        write_u4(&mut out, 0); // map_off
        for (size, off) in [
            (self.strings.len(), string_ids_off),
            (self.types.len(), type_ids_off),
            (self.protos.len(), proto_ids_off),
            (self.fields.len(), field_ids_off),
            (self.methods.len(), method_ids_off),
            (self.classes.len(), class_defs_off),
            (data.len(), data_off),
        ] {
            write_u4(&mut out, size as u32);
            write_u4(&mut out, if size == 0 { 0 } else { off as u32 });
        }

        for off in &string_offsets {
            write_u4(&mut out, *off);
        }
        for t in &self.types {
            write_u4(&mut out, *t);
        }
        for (p, params_off) in self.protos.iter().zip(proto_params) {
            write_u4(&mut out, p.0);
            write_u4(&mut out, p.1);
            write_u4(&mut out, params_off);
        }
        for f in &self.fields {
            write_u2(&mut out, f.0 as u16);
            write_u2(&mut out, f.1 as u16);
            write_u4(&mut out, f.2);
        }
        for m in &self.methods {
            write_u2(&mut out, m.0 as u16);
            write_u2(&mut out, m.1 as u16);
            write_u4(&mut out, m.2);
        }
        for ((class, interfaces_off), class_data_off) in self.classes.iter().zip(interfaces).zip(class_data_offs) {
            write_u4(&mut out, class.class_idx);
            write_u4(&mut out, class.access.bits());
            write_u4(&mut out, class.super_idx.unwrap_or(0xffffffff));
            write_u4(&mut out, interfaces_off);
            write_u4(&mut out, 0xffffffff); // source file
            write_u4(&mut out, 0); // annotations
            write_u4(&mut out, class_data_off);
            write_u4(&mut out, 0); // static values
        }
        out.extend_from_slice(&data);
        out
    }
}

fn write_code(data: &mut Vec<u8>, code: &CodePlan) {
    write_u2(data, code.registers);
    write_u2(data, code.ins);
    write_u2(data, code.outs);
    write_u2(data, code.tries.len() as u16);
    write_u4(data, 0); // debug info
    write_u4(data, code.insns.len() as u32);
    for u in &code.insns {
        write_u2(data, *u);
    }
    if code.tries.is_empty() {
        return;
    }
    if code.insns.len() % 2 == 1 {
        write_u2(data, 0);
    }

    let mut list = vec![];
    let mut offsets = vec![];
    write_uleb128(&mut list, code.handlers.len() as u32);
    for (catches, catch_all) in &code.handlers {
        offsets.push(list.len() as u16);
        let size = catches.len() as i32;
        write_sleb128(&mut list, if catch_all.is_some() { -size } else { size });
        for (t, addr) in catches {
            write_uleb128(&mut list, *t);
            write_uleb128(&mut list, *addr);
        }
        if let Some(addr) = catch_all {
            write_uleb128(&mut list, *addr);
        }
    }

    for (start, count, handler) in &code.tries {
        write_u4(data, *start);
        write_u2(data, *count);
        write_u2(data, offsets[*handler]);
    }
    data.extend_from_slice(&list);
}
