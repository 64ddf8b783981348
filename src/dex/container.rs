/* Dex container: header, id tables, class data and code items */

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use bitflags::bitflags;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::dex::error::{Context, DexError};
use crate::dex::Cursor;

/* Constants */
pub const DEX_FILE_MAGIC_PREFIX: [u8; 4] = [0x64, 0x65, 0x78, 0x0a];
pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const REVERSE_ENDIAN_CONSTANT: u32 = 0x78563412;
pub const NO_INDEX: u32 = 0xffffffff;
pub const HEADER_SIZE: usize = 0x70;

bitflags! {
    /// Access flags shared by classes, fields and methods.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub checksum: u32,
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub string_ids: TableExtent,
    pub type_ids: TableExtent,
    pub proto_ids: TableExtent,
    pub field_ids: TableExtent,
    pub method_ids: TableExtent,
    pub class_defs: TableExtent,
    pub data: TableExtent,
}

/// Size and byte offset of one section as recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableExtent {
    pub size: u32,
    pub off: u32,
}

impl TableExtent {
    fn read(c: &mut Cursor) -> Result<TableExtent, DexError> {
        let size = c.read_u4()?;
        let off = c.read_u4()?;
        Ok(TableExtent { size, off })
    }

    fn check(&self, name: &str, item_size: usize, file_len: usize) -> Result<(), DexError> {
        if self.size == 0 {
            return Ok(());
        }
        let end = (self.off as usize).checked_add(self.size as usize * item_size);
        match end {
            Some(end) if end <= file_len => Ok(()),
            _ => fail!(
                at = self.off as usize,
                "{} table of {} entries does not fit in {} bytes",
                name,
                self.size,
                file_len
            ),
        }
    }
}

impl Header {
    pub fn read(bytes: &[u8]) -> Result<Header, DexError> {
        if bytes.len() < HEADER_SIZE {
            fail!(at = bytes.len(), "Not enough bytes for header");
        }
        let mut c = Cursor::new(bytes, 0)?;

        let magic = c.read_x(8)?;
        if magic[0..4] != DEX_FILE_MAGIC_PREFIX || magic[7] != 0 {
            fail!(at = 0, "Invalid magic value");
        }
        let version = std::str::from_utf8(&magic[4..7])
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| DexError::new("Invalid dex version").at(4))?;

        let checksum = c.read_u4()?;
        c.read_x(20)?; // signature
        let file_size = c.read_u4()?;
        let header_size = c.read_u4()?;
        let endian_tag = c.read_u4()?;
        match endian_tag {
            ENDIAN_CONSTANT => {}
            REVERSE_ENDIAN_CONSTANT => fail!(at = 0x28, "Big-endian dex containers are not supported"),
            other => fail!(at = 0x28, "Invalid endian tag 0x{:08x}", other),
        }
        TableExtent::read(&mut c)?; // link
        c.read_u4()?; // map_off

        let header = Header {
            version,
            checksum,
            file_size,
            header_size,
            endian_tag,
            string_ids: TableExtent::read(&mut c)?,
            type_ids: TableExtent::read(&mut c)?,
            proto_ids: TableExtent::read(&mut c)?,
            field_ids: TableExtent::read(&mut c)?,
            method_ids: TableExtent::read(&mut c)?,
            class_defs: TableExtent::read(&mut c)?,
            data: TableExtent::read(&mut c)?,
        };

        if header.file_size as usize > bytes.len() {
            fail!(at = 0x20, "Header claims {} bytes but container has {}", header.file_size, bytes.len());
        }
        let len = bytes.len();
        header.string_ids.check("string_ids", 4, len)?;
        header.type_ids.check("type_ids", 4, len)?;
        header.proto_ids.check("proto_ids", 12, len)?;
        header.field_ids.check("field_ids", 8, len)?;
        header.method_ids.check("method_ids", 8, len)?;
        header.class_defs.check("class_defs", 32, len)?;
        Ok(header)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoItem {
    pub shorty_idx: u32,
    pub return_type_idx: u32,
    pub parameters: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldItem {
    pub class_idx: u16,
    pub type_idx: u16,
    pub name_idx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodItem {
    pub class_idx: u16,
    pub proto_idx: u16,
    pub name_idx: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDefItem {
    pub class_idx: u32,
    pub access_flags: AccessFlags,
    pub superclass_idx: Option<u32>,
    pub interfaces_off: u32,
    pub source_file_idx: Option<u32>,
    pub class_data_off: u32,
}

impl ClassDefItem {
    fn read(c: &mut Cursor) -> Result<ClassDefItem, DexError> {
        let class_idx = c.read_u4()?;
        let access_flags = AccessFlags::from_bits_retain(c.read_u4()?);
        let superclass_idx = Some(c.read_u4()?).filter(|i| *i != NO_INDEX);
        let interfaces_off = c.read_u4()?;
        let source_file_idx = Some(c.read_u4()?).filter(|i| *i != NO_INDEX);
        c.read_u4()?; // annotations_off
        let class_data_off = c.read_u4()?;
        c.read_u4()?; // static_values_off
        Ok(ClassDefItem { class_idx, access_flags, superclass_idx, interfaces_off, source_file_idx, class_data_off })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedField {
    pub field_idx: u32,
    pub access_flags: AccessFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedMethod {
    pub method_idx: u32,
    pub access_flags: AccessFlags,
    pub code_off: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassData {
    pub static_fields: Vec<EncodedField>,
    pub instance_fields: Vec<EncodedField>,
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

impl ClassData {
    fn read(c: &mut Cursor) -> Result<ClassData, DexError> {
        let static_field_size = c.read_uleb128()?;
        let instance_field_size = c.read_uleb128()?;
        let direct_method_size = c.read_uleb128()?;
        let virtual_method_size = c.read_uleb128()?;

        let mut read_fields = |count: u32| -> Result<Vec<EncodedField>, DexError> {
            let mut fields = Vec::new();
            let mut idx = 0u32;
            for _ in 0..count {
                idx = idx.wrapping_add(c.read_uleb128()?);
                fields.push(EncodedField { field_idx: idx, access_flags: AccessFlags::from_bits_retain(c.read_uleb128()?) });
            }
            Ok(fields)
        };
        let static_fields = read_fields(static_field_size)?;
        let instance_fields = read_fields(instance_field_size)?;

        let mut read_methods = |count: u32| -> Result<Vec<EncodedMethod>, DexError> {
            let mut methods = Vec::new();
            let mut idx = 0u32;
            for _ in 0..count {
                idx = idx.wrapping_add(c.read_uleb128()?);
                let access_flags = AccessFlags::from_bits_retain(c.read_uleb128()?);
                let code_off = c.read_uleb128()?;
                methods.push(EncodedMethod { method_idx: idx, access_flags, code_off });
            }
            Ok(methods)
        };
        let direct_methods = read_methods(direct_method_size)?;
        let virtual_methods = read_methods(virtual_method_size)?;

        Ok(ClassData { static_fields, instance_fields, direct_methods, virtual_methods })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TryItem {
    pub start_addr: u32,
    pub insn_count: u16,
    /// Byte offset into the encoded catch handler list.
    pub handler_off: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypeAddrPair {
    pub type_idx: u32,
    pub addr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatchHandler {
    /// Byte offset of this entry relative to the start of the handler list.
    pub offset: u16,
    pub pairs: Vec<TypeAddrPair>,
    pub catch_all_addr: Option<u32>,
}

impl CatchHandler {
    fn read(c: &mut Cursor, offset: u16) -> Result<CatchHandler, DexError> {
        let size = c.read_sleb128()?;
        let count = size.unsigned_abs();
        let mut pairs = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let type_idx = c.read_uleb128()?;
            let addr = c.read_uleb128()?;
            pairs.push(TypeAddrPair { type_idx, addr });
        }
        let catch_all_addr = if size <= 0 { Some(c.read_uleb128()?) } else { None };
        Ok(CatchHandler { offset, pairs, catch_all_addr })
    }
}

/// A method body as stored in the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeItem {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub debug_info_off: u32,
    pub insns: Vec<u16>,
    pub tries: Vec<TryItem>,
    pub handlers: Vec<CatchHandler>,
}

impl CodeItem {
    pub fn read(bytes: &[u8], offset: usize) -> Result<CodeItem, DexError> {
        let mut c = Cursor::new(bytes, offset)?;
        let registers_size = c.read_u2()?;
        let ins_size = c.read_u2()?;
        let outs_size = c.read_u2()?;
        let tries_size = c.read_u2()?;
        let debug_info_off = c.read_u4()?;

        let insns_size = c.read_u4()? as usize;
        if insns_size > c.remaining() / 2 {
            fail!(at = c.position(), "Code item claims {} code units past the end of the container", insns_size);
        }
        let mut insns = Vec::with_capacity(insns_size);
        for _ in 0..insns_size {
            insns.push(c.read_u2()?);
        }

        if ins_size > registers_size {
            return Err(err!(kind = Structural, "{} incoming registers but only {} declared", ins_size, registers_size).at(offset));
        }

        let mut tries = Vec::with_capacity(tries_size as usize);
        let mut handlers = Vec::new();
        if tries_size > 0 {
            // Optional 2-byte padding if there are tries and insns_size is odd
            if insns_size & 1 != 0 {
                let padding = c.read_u2()?;
                if padding != 0 {
                    warn!("[codeitem] non-zero padding 0x{:04x} at 0x{:x} (code_item_start=0x{:x})", padding, c.position() - 2, offset);
                }
            }
            for _ in 0..tries_size {
                tries.push(TryItem { start_addr: c.read_u4()?, insn_count: c.read_u2()?, handler_off: c.read_u2()? });
            }

            // encoded_catch_handler_list starts here
            let base = c.position();
            let handlers_size = c.read_uleb128()?;
            for i in 0..handlers_size {
                let entry = c.position() - base;
                let entry_off = u16::try_from(entry).map_err(|_| DexError::new("Catch handler list too large").at(c.position()))?;
                let h = CatchHandler::read(&mut c, entry_off)
                    .context(|| format!("EncodedCatchHandler #{}/{} (code_item_start=0x{:x})", i + 1, handlers_size, offset))?;
                handlers.push(h);
            }

            for t in &tries {
                if !handlers.iter().any(|h| h.offset == t.handler_off) {
                    fail!(at = base, "Try item at {:04x} refers to missing handler offset {}", t.start_addr, t.handler_off);
                }
                if t.start_addr as usize + t.insn_count as usize > insns_size {
                    fail!(at = offset, "Try item at {:04x} extends past the method", t.start_addr);
                }
            }
        }

        Ok(CodeItem { registers_size, ins_size, outs_size, debug_info_off, insns, tries, handlers })
    }

    /// The handler entry a try item points at.
    pub fn catch_handler(&self, item: &TryItem) -> Result<&CatchHandler, DexError> {
        self.handlers
            .iter()
            .find(|h| h.offset == item.handler_off)
            .ok_or_else(|| err!("No catch handler at offset {}", item.handler_off))
    }
}

/// An opened dex container. Owns the raw bytes; every table is index-checked
/// on access.
#[derive(Debug)]
pub struct Container {
    bytes: Vec<u8>,
    pub header: Header,
    string_offsets: Vec<u32>,
    types: Vec<u32>,
    protos: Vec<ProtoItem>,
    fields: Vec<FieldItem>,
    methods: Vec<MethodItem>,
    class_defs: Vec<ClassDefItem>,
}

impl Container {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Container, DexError> {
        let header = Header::read(&bytes)?;

        let mut c = Cursor::new(&bytes, header.string_ids.off as usize)?;
        let mut string_offsets = Vec::with_capacity(header.string_ids.size as usize);
        for _ in 0..header.string_ids.size {
            string_offsets.push(c.read_u4()?);
        }

        c.seek(header.type_ids.off as usize)?;
        let mut types = Vec::with_capacity(header.type_ids.size as usize);
        for _ in 0..header.type_ids.size {
            let idx = c.read_u4()?;
            if idx as usize >= string_offsets.len() {
                fail!(at = c.position() - 4, "Type descriptor refers to string {}", idx);
            }
            types.push(idx);
        }

        c.seek(header.proto_ids.off as usize)?;
        let mut protos = Vec::with_capacity(header.proto_ids.size as usize);
        for _ in 0..header.proto_ids.size {
            let shorty_idx = c.read_u4()?;
            let return_type_idx = c.read_u4()?;
            let parameters_off = c.read_u4()?;
            let parameters = read_type_list(&bytes, parameters_off)?;
            protos.push(ProtoItem { shorty_idx, return_type_idx, parameters });
        }

        c.seek(header.field_ids.off as usize)?;
        let mut fields = Vec::with_capacity(header.field_ids.size as usize);
        for _ in 0..header.field_ids.size {
            fields.push(FieldItem { class_idx: c.read_u2()?, type_idx: c.read_u2()?, name_idx: c.read_u4()? });
        }

        c.seek(header.method_ids.off as usize)?;
        let mut methods = Vec::with_capacity(header.method_ids.size as usize);
        for _ in 0..header.method_ids.size {
            methods.push(MethodItem { class_idx: c.read_u2()?, proto_idx: c.read_u2()?, name_idx: c.read_u4()? });
        }

        c.seek(header.class_defs.off as usize)?;
        let mut class_defs = Vec::with_capacity(header.class_defs.size as usize);
        for _ in 0..header.class_defs.size {
            class_defs.push(ClassDefItem::read(&mut c)?);
        }

        debug!(
            "dex {:03}: {} strings, {} types, {} methods, {} classes",
            header.version,
            string_offsets.len(),
            types.len(),
            methods.len(),
            class_defs.len()
        );

        Ok(Container { bytes, header, string_offsets, types, protos, fields, methods, class_defs })
    }

    pub fn from_file(path: &Path) -> Result<Container, DexError> {
        let bytes = fs::read(path).map_err(|e| DexError::new(format!("io Error: {}", e)))?;
        Container::from_bytes(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Positions a cursor at an absolute byte offset.
    pub fn open(&self, offset: usize) -> Result<Cursor<'_>, DexError> {
        Cursor::new(&self.bytes, offset)
    }

    pub fn string_count(&self) -> usize {
        self.string_offsets.len()
    }

    pub fn string(&self, idx: u32) -> Result<String, DexError> {
        let Some(off) = self.string_offsets.get(idx as usize) else {
            fail!("String index {} out of range", idx);
        };
        let mut c = self.open(*off as usize)?;
        c.read_uleb128()?; // utf16 size
        let start = c.position();
        let raw = c.read_until_nul()?;
        match cesu8::from_java_cesu8(raw) {
            Ok(Cow::Borrowed(s)) => Ok(s.to_string()),
            Ok(Cow::Owned(s)) => Ok(s),
            Err(_) => fail!(at = start, "Malformed MUTF-8 in string {}", idx),
        }
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn type_descriptor(&self, idx: u32) -> Result<String, DexError> {
        match self.types.get(idx as usize) {
            Some(string_idx) => self.string(*string_idx),
            None => fail!("Type index {} out of range", idx),
        }
    }

    pub fn proto(&self, idx: u32) -> Result<&ProtoItem, DexError> {
        match self.protos.get(idx as usize) {
            Some(p) => Ok(p),
            None => fail!("Proto index {} out of range", idx),
        }
    }

    pub fn field_id(&self, idx: u32) -> Result<&FieldItem, DexError> {
        match self.fields.get(idx as usize) {
            Some(f) => Ok(f),
            None => fail!("Field index {} out of range", idx),
        }
    }

    pub fn method_id(&self, idx: u32) -> Result<&MethodItem, DexError> {
        match self.methods.get(idx as usize) {
            Some(m) => Ok(m),
            None => fail!("Method index {} out of range", idx),
        }
    }

    pub fn class_defs(&self) -> &[ClassDefItem] {
        &self.class_defs
    }

    pub fn interfaces(&self, def: &ClassDefItem) -> Result<Vec<u32>, DexError> {
        read_type_list(&self.bytes, def.interfaces_off)
    }

    pub fn class_data(&self, def: &ClassDefItem) -> Result<ClassData, DexError> {
        if def.class_data_off == 0 {
            return Ok(ClassData::default());
        }
        let mut c = self.open(def.class_data_off as usize)?;
        ClassData::read(&mut c)
    }

    pub fn code_item(&self, offset: u32) -> Result<Option<CodeItem>, DexError> {
        if offset == 0 {
            return Ok(None);
        }
        CodeItem::read(&self.bytes, offset as usize).map(Some)
    }
}

fn read_type_list(bytes: &[u8], offset: u32) -> Result<Vec<u32>, DexError> {
    if offset == 0 {
        return Ok(vec![]);
    }
    let mut c = Cursor::new(bytes, offset as usize)?;
    let size = c.read_u4()?;
    let mut v = Vec::with_capacity(size.min(255) as usize);
    for _ in 0..size {
        v.push(c.read_u2()? as u32);
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::error::ErrorKind;
    use crate::tests::fixture::{ClassSpec, CodeSpec, DexBuilder, MethodSpec};

    fn sample() -> Vec<u8> {
        let mut b = DexBuilder::new();
        let add = MethodSpec::new("add", "I", &["I", "I"])
            .flags(AccessFlags::PUBLIC | AccessFlags::STATIC)
            .code(CodeSpec::new(3, 2, vec![0x0290, 0x0100, 0x020f]));
        b.class(ClassSpec::new("Lcom/example/Calc;").method(add).interface("Ljava/io/Serializable;"));
        b.build()
    }

    #[test]
    fn reads_tables()
    {
        let dex = Container::from_bytes(sample()).unwrap();
        assert_eq!(dex.header.version, 35);
        assert_eq!(dex.class_defs().len(), 1);

        let def = &dex.class_defs()[0];
        assert_eq!(dex.type_descriptor(def.class_idx).unwrap(), "Lcom/example/Calc;");
        assert_eq!(dex.type_descriptor(def.superclass_idx.unwrap()).unwrap(), "Ljava/lang/Object;");
        let interfaces = dex.interfaces(def).unwrap();
        assert_eq!(dex.type_descriptor(interfaces[0]).unwrap(), "Ljava/io/Serializable;");

        let data = dex.class_data(def).unwrap();
        assert_eq!(data.direct_methods.len(), 1);
        let m = data.direct_methods[0];
        assert!(m.access_flags.contains(AccessFlags::STATIC));
        let mid = dex.method_id(m.method_idx).unwrap();
        assert_eq!(dex.string(mid.name_idx).unwrap(), "add");

        let code = dex.code_item(m.code_off).unwrap().unwrap();
        assert_eq!(code.registers_size, 3);
        assert_eq!(code.ins_size, 2);
        assert_eq!(code.insns, vec![0x0290, 0x0100, 0x020f]);
    }

    #[test]
    fn rejects_bad_magic()
    {
        let mut bytes = sample();
        bytes[1] = b'x';
        let e = Container::from_bytes(bytes).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Decode);
        assert_eq!(e.offset(), Some(0));
    }

    #[test]
    fn rejects_short_and_truncated_files()
    {
        assert!(Container::from_bytes(vec![0x64, 0x65, 0x78]).is_err());

        let mut bytes = sample();
        bytes.truncate(bytes.len() - 4);
        let e = Container::from_bytes(bytes).unwrap_err();
        assert_eq!(e.offset(), Some(0x20));
    }

    #[test]
    fn rejects_foreign_endian()
    {
        let mut bytes = sample();
        bytes[0x28..0x2c].copy_from_slice(&REVERSE_ENDIAN_CONSTANT.to_le_bytes());
        assert!(Container::from_bytes(bytes).unwrap_err().message().contains("Big-endian"));
    }

    #[test]
    fn index_out_of_range()
    {
        let dex = Container::from_bytes(sample()).unwrap();
        assert!(dex.string(10_000).is_err());
        assert!(dex.type_descriptor(10_000).is_err());
        assert!(dex.method_id(10_000).is_err());
    }

    #[test]
    fn code_item_with_tries()
    {
        let mut bytes = vec![];
        // registers, ins, outs, tries
        for v in [2u16, 0, 0, 1] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(&0u32.to_le_bytes()); // debug
        bytes.extend_from_slice(&3u32.to_le_bytes()); // insns_size
        for v in [0x0012u16, 0x0027, 0x000e, 0x0000] {
            // const/4 v0, 0; throw v0; return-void; padding
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(&0u32.to_le_bytes()); // start
        bytes.extend_from_slice(&2u16.to_le_bytes()); // count
        bytes.extend_from_slice(&1u16.to_le_bytes()); // handler_off
        bytes.extend_from_slice(&[0x01, 0x00, 0x02]); // one entry: no typed catches, catch-all -> 2

        let code = CodeItem::read(&bytes, 0).unwrap();
        assert_eq!(code.tries.len(), 1);
        let h = code.catch_handler(&code.tries[0]).unwrap();
        assert!(h.pairs.is_empty());
        assert_eq!(h.catch_all_addr, Some(2));
    }
}
