//! Type, class, field and method descriptors resolved out of a container.
//!
//! Types are interned by descriptor string in a [`Registry`], so two
//! resolutions of the same descriptor share one allocation and compare equal.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use log::{debug, warn};
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::char;
use nom::combinator::{map, value, verify};
use nom::multi::many0_count;
use nom::sequence::{preceded, terminated};
use nom::IResult;
use once_cell::unsync::OnceCell;
use serde::Serialize;

use crate::dex::container::{AccessFlags, ClassDefItem, CodeItem, Container, EncodedMethod};
use crate::dex::decoder::decode_method;
use crate::dex::error::{Context, DexError};
use crate::dex::instructions::DecodedInstruction;

/// A Java type descriptor such as `I`, `[J` or `Ljava/lang/String;`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum TypeDescriptor {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
    /// Internal (slash separated) class name.
    Object(String),
    Array(Box<TypeDescriptor>),
}

pub type TypeRef = Arc<TypeDescriptor>;

/// The dex format caps array types at 255 dimensions.
pub const MAX_ARRAY_DIMENSIONS: usize = 255;

fn parse_element_type(input: &str) -> IResult<&str, TypeDescriptor> {
    alt((
        value(TypeDescriptor::Boolean, char('Z')),
        value(TypeDescriptor::Byte, char('B')),
        value(TypeDescriptor::Char, char('C')),
        value(TypeDescriptor::Short, char('S')),
        value(TypeDescriptor::Int, char('I')),
        value(TypeDescriptor::Long, char('J')),
        value(TypeDescriptor::Float, char('F')),
        value(TypeDescriptor::Double, char('D')),
        value(TypeDescriptor::Void, char('V')),
        map(
            preceded(char('L'), terminated(take_while1(|c| c != ';'), char(';'))),
            |name: &str| TypeDescriptor::Object(name.to_string()),
        ),
    ))(input)
}

pub(crate) fn parse_type_descriptor(input: &str) -> IResult<&str, TypeDescriptor> {
    let (input, dimensions) = verify(many0_count(char('[')), |d: &usize| *d <= MAX_ARRAY_DIMENSIONS)(input)?;
    let (input, element) = parse_element_type(input)?;
    let t = (0..dimensions).fold(element, |t, _| TypeDescriptor::Array(Box::new(t)));
    Ok((input, t))
}

impl TypeDescriptor {
    /// Parses a complete descriptor. Trailing characters are an error.
    pub fn parse(descriptor: &str) -> Result<TypeDescriptor, DexError> {
        match parse_type_descriptor(descriptor) {
            Ok(("", t)) => Ok(t),
            Ok((rest, _)) => fail!(at = descriptor.len() - rest.len(), "Trailing characters in type descriptor {}", descriptor),
            Err(_) => {
                let depth = descriptor.bytes().take_while(|b| *b == b'[').count();
                if depth > MAX_ARRAY_DIMENSIONS {
                    fail!(at = 0, "Array type with {} dimensions, at most {} allowed", depth, MAX_ARRAY_DIMENSIONS);
                }
                match descriptor[depth..].chars().next() {
                    Some(lead) => fail!(at = depth, "Unrecognised type descriptor lead character '{}' in {}", lead, descriptor),
                    None => fail!(at = depth, "Empty type descriptor"),
                }
            }
        }
    }

    pub fn object(internal_name: &str) -> TypeDescriptor {
        TypeDescriptor::Object(internal_name.to_string())
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, TypeDescriptor::Long | TypeDescriptor::Double)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, TypeDescriptor::Object(_) | TypeDescriptor::Array(_))
    }

    /// JVM local slots (or Dalvik registers) a value of this type occupies.
    pub fn slot_width(&self) -> u16 {
        match self {
            TypeDescriptor::Void => 0,
            TypeDescriptor::Long | TypeDescriptor::Double => 2,
            _ => 1,
        }
    }

    pub fn element(&self) -> Option<&TypeDescriptor> {
        match self {
            TypeDescriptor::Array(e) => Some(e),
            _ => None,
        }
    }

    /// Name as used by class-file constant pool entries: the internal name for
    /// classes, the full descriptor for arrays.
    pub fn internal_name(&self) -> String {
        match self {
            TypeDescriptor::Object(name) => name.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TypeDescriptor::Boolean => write!(f, "Z"),
            TypeDescriptor::Byte => write!(f, "B"),
            TypeDescriptor::Char => write!(f, "C"),
            TypeDescriptor::Short => write!(f, "S"),
            TypeDescriptor::Int => write!(f, "I"),
            TypeDescriptor::Long => write!(f, "J"),
            TypeDescriptor::Float => write!(f, "F"),
            TypeDescriptor::Double => write!(f, "D"),
            TypeDescriptor::Void => write!(f, "V"),
            TypeDescriptor::Object(name) => write!(f, "L{};", name),
            TypeDescriptor::Array(e) => write!(f, "[{}", e),
        }
    }
}

/// Return and parameter types of a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Proto {
    pub return_type: TypeRef,
    pub params: Vec<TypeRef>,
}

impl Proto {
    pub fn descriptor(&self) -> String {
        let mut s = String::from("(");
        for p in &self.params {
            s.push_str(&p.to_string());
        }
        s.push(')');
        s.push_str(&self.return_type.to_string());
        s
    }

    /// Registers taken by the arguments, including `this` for instance methods.
    pub fn ins_words(&self, is_static: bool) -> u16 {
        let params: u16 = self.params.iter().map(|p| p.slot_width()).sum();
        if is_static { params } else { params + 1 }
    }
}

/// Interned identity of a class.
#[derive(Debug, Serialize)]
pub struct ClassInfo {
    /// Internal name, e.g. `com/example/Outer$Inner`.
    pub full_name: String,
    pub package: String,
    pub simple_name: String,
    pub parent: Option<Arc<ClassInfo>>,
    pub type_ref: TypeRef,
}

impl PartialEq for ClassInfo {
    fn eq(&self, other: &Self) -> bool {
        self.full_name == other.full_name
    }
}

impl Eq for ClassInfo {}

impl Hash for ClassInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full_name.hash(state);
    }
}

impl fmt::Display for ClassInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.type_ref)
    }
}

/// Session cache of interned types and class identities.
///
/// Not internally synchronised; values are `Arc`s so a registry shared across
/// workers only needs an outer lock.
#[derive(Debug, Default)]
pub struct Registry {
    types: RefCell<HashMap<String, TypeRef>>,
    classes: RefCell<HashMap<String, Arc<ClassInfo>>>,
}

/// Index into one of the container pools that resolve without further context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolIndex {
    String(u32),
    Type(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    String(String),
    Type(TypeRef),
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn intern_type(&self, descriptor: &str) -> Result<TypeRef, DexError> {
        if let Some(t) = self.types.borrow().get(descriptor) {
            return Ok(t.clone());
        }
        let t = Arc::new(TypeDescriptor::parse(descriptor)?);
        self.types.borrow_mut().insert(descriptor.to_string(), t.clone());
        Ok(t)
    }

    pub fn resolve(&self, container: &Container, index: PoolIndex) -> Result<Resolved, DexError> {
        match index {
            PoolIndex::String(idx) => Ok(Resolved::String(container.string(idx)?)),
            PoolIndex::Type(idx) => {
                let descriptor = container.type_descriptor(idx)?;
                let t = self.intern_type(&descriptor).context(|| format!("type@{}", idx))?;
                Ok(Resolved::Type(t))
            }
        }
    }

    pub fn lookup_class(&self, full_name: &str) -> Option<Arc<ClassInfo>> {
        self.classes.borrow().get(full_name).cloned()
    }

    /// Returns the class identity for an object type, registering it on first
    /// sight. A `$` in the name marks an inner class only when the outer class
    /// is already registered.
    pub fn class_info(&self, type_ref: &TypeRef) -> Result<Arc<ClassInfo>, DexError> {
        let TypeDescriptor::Object(full_name) = type_ref.as_ref() else {
            fail!("{} is not a class type", type_ref);
        };
        if let Some(info) = self.lookup_class(full_name) {
            return Ok(info);
        }

        let (package, local) = match full_name.rfind('/') {
            Some(ix) => (&full_name[..ix], &full_name[ix + 1..]),
            None => ("", full_name.as_str()),
        };
        let parent = full_name
            .rfind('$')
            .filter(|ix| *ix > package.len())
            .and_then(|ix| self.lookup_class(&full_name[..ix]).map(|outer| (ix, outer)));
        let (simple_name, parent) = match parent {
            Some((ix, outer)) => (full_name[ix + 1..].to_string(), Some(outer)),
            None => (local.to_string(), None),
        };

        let info = Arc::new(ClassInfo {
            full_name: full_name.clone(),
            package: package.to_string(),
            simple_name,
            parent,
            type_ref: type_ref.clone(),
        });
        self.classes.borrow_mut().insert(full_name.clone(), info.clone());
        Ok(info)
    }

    pub(crate) fn proto(&self, container: &Container, idx: u32) -> Result<Proto, DexError> {
        let item = container.proto(idx)?;
        let return_type = self.intern_type(&container.type_descriptor(item.return_type_idx)?)?;
        let params = item
            .parameters
            .iter()
            .map(|p| container.type_descriptor(*p).and_then(|d| self.intern_type(&d)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Proto { return_type, params })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FieldRef {
    pub owner: TypeRef,
    pub name: String,
    pub field_type: TypeRef,
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}->{}:{}", self.owner, self.name, self.field_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MethodRef {
    pub owner: TypeRef,
    pub name: String,
    pub proto: Proto,
}

impl MethodRef {
    pub fn descriptor(&self) -> String {
        self.proto.descriptor()
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}->{}{}", self.owner, self.name, self.proto.descriptor())
    }
}

/// Resolves constant-pool indices carried by instructions.
pub trait RefResolver {
    fn string(&self, idx: u32) -> Result<String, DexError>;
    fn type_ref(&self, idx: u32) -> Result<TypeRef, DexError>;
    fn field_ref(&self, idx: u32) -> Result<FieldRef, DexError>;
    fn method_ref(&self, idx: u32) -> Result<MethodRef, DexError>;
}

/// Resolver backed by a container and a session registry.
pub struct PoolResolver<'a> {
    container: &'a Container,
    registry: &'a Registry,
}

impl<'a> PoolResolver<'a> {
    pub fn new(container: &'a Container, registry: &'a Registry) -> PoolResolver<'a> {
        PoolResolver { container, registry }
    }
}

impl RefResolver for PoolResolver<'_> {
    fn string(&self, idx: u32) -> Result<String, DexError> {
        match self.registry.resolve(self.container, PoolIndex::String(idx))? {
            Resolved::String(s) => Ok(s),
            Resolved::Type(t) => fail!("string@{} resolved to type {}", idx, t),
        }
    }

    fn type_ref(&self, idx: u32) -> Result<TypeRef, DexError> {
        match self.registry.resolve(self.container, PoolIndex::Type(idx))? {
            Resolved::Type(t) => Ok(t),
            Resolved::String(s) => fail!("type@{} resolved to string {}", idx, s),
        }
    }

    fn field_ref(&self, idx: u32) -> Result<FieldRef, DexError> {
        let item = *self.container.field_id(idx)?;
        Ok(FieldRef {
            owner: self.type_ref(item.class_idx as u32)?,
            name: self.string(item.name_idx)?,
            field_type: self.type_ref(item.type_idx as u32)?,
        })
    }

    fn method_ref(&self, idx: u32) -> Result<MethodRef, DexError> {
        let item = *self.container.method_id(idx)?;
        Ok(MethodRef {
            owner: self.type_ref(item.class_idx as u32)?,
            name: self.string(item.name_idx)?,
            proto: self.registry.proto(self.container, item.proto_idx as u32)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: TypeRef,
    pub access: AccessFlags,
}

/// A method defined by a class in the container.
#[derive(Debug)]
pub struct MethodDescriptor {
    pub owner: Arc<ClassInfo>,
    pub name: String,
    pub proto: Proto,
    pub access: AccessFlags,
    pub method_idx: u32,
    code_off: u32,
    code: Option<CodeItem>,
    decoded: OnceCell<Vec<Option<DecodedInstruction>>>,
}

impl MethodDescriptor {
    pub fn new(owner: Arc<ClassInfo>, name: &str, proto: Proto, access: AccessFlags, code: Option<CodeItem>) -> MethodDescriptor {
        MethodDescriptor {
            owner,
            name: name.to_string(),
            proto,
            access,
            method_idx: 0,
            code_off: 0,
            code,
            decoded: OnceCell::new(),
        }
    }

    pub fn code(&self) -> Option<&CodeItem> {
        self.code.as_ref()
    }

    pub fn code_offset(&self) -> u32 {
        self.code_off
    }

    pub fn registers_size(&self) -> u16 {
        self.code.as_ref().map(|c| c.registers_size).unwrap_or(0)
    }

    pub fn ins_size(&self) -> u16 {
        self.code.as_ref().map(|c| c.ins_size).unwrap_or(0)
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    pub fn descriptor(&self) -> String {
        self.proto.descriptor()
    }

    /// Decodes the method body on first call and returns the cached slots on
    /// every later call.
    pub fn decode(&self) -> Result<&[Option<DecodedInstruction>], DexError> {
        let slots = self.decoded.get_or_try_init(|| {
            let Some(code) = &self.code else {
                fail!(kind = Structural, "{} has no code", self);
            };
            decode_method(&code.insns, code.registers_size).context(|| self.to_string())
        })?;
        Ok(slots)
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.get().is_some()
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}->{}{}", self.owner, self.name, self.proto.descriptor())
    }
}

/// A parsed class definition.
#[derive(Debug)]
pub struct ClassDescriptor {
    pub info: Arc<ClassInfo>,
    pub access: AccessFlags,
    pub super_class: Option<TypeRef>,
    pub interfaces: Vec<TypeRef>,
    pub source_file: Option<String>,
    pub fields: Vec<FieldDescriptor>,
    pub methods: Vec<MethodDescriptor>,
}

impl PartialEq for ClassDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.info == other.info
    }
}

impl ClassDescriptor {
    pub fn name(&self) -> &str {
        &self.info.full_name
    }
}

/// Registers every defined class, shortest name first so that outer classes
/// are known before their inner classes.
///
/// A class def whose type cannot be registered is skipped here and fails
/// later when the class itself is parsed.
pub fn register_classes(container: &Container, registry: &Registry) {
    let mut names = vec![];
    for def in container.class_defs() {
        match container.type_descriptor(def.class_idx) {
            Ok(name) => names.push(name),
            Err(e) => warn!("not registering class: {}", e),
        }
    }
    names.sort_by_key(|n| n.len());
    for name in names {
        if let Err(e) = registry.intern_type(&name).and_then(|t| registry.class_info(&t)) {
            warn!("not registering class: {}", e);
        }
    }
}

/// Builds the descriptor for one class definition.
pub fn parse_class(container: &Container, registry: &Registry, def: &ClassDefItem) -> Result<ClassDescriptor, DexError> {
    let resolver = PoolResolver::new(container, registry);
    let this = resolver.type_ref(def.class_idx)?;
    let info = registry.class_info(&this)?;

    let super_class = def.superclass_idx.map(|idx| resolver.type_ref(idx)).transpose().context(|| format!("superclass of {}", info))?;
    let interfaces = container
        .interfaces(def)?
        .into_iter()
        .map(|idx| resolver.type_ref(idx))
        .collect::<Result<Vec<_>, _>>()?;
    let source_file = def.source_file_idx.map(|idx| container.string(idx)).transpose()?;

    let data = container.class_data(def).context(|| format!("class data of {}", info))?;
    let mut fields = Vec::with_capacity(data.static_fields.len() + data.instance_fields.len());
    for f in data.static_fields.iter().chain(data.instance_fields.iter()) {
        let r = resolver.field_ref(f.field_idx)?;
        fields.push(FieldDescriptor { name: r.name, field_type: r.field_type, access: f.access_flags });
    }

    let mut methods = Vec::with_capacity(data.direct_methods.len() + data.virtual_methods.len());
    for m in data.direct_methods.iter().chain(data.virtual_methods.iter()) {
        methods.push(method_descriptor(container, &resolver, &info, m)?);
    }

    debug!("parsed {} with {} fields and {} methods", info, fields.len(), methods.len());
    Ok(ClassDescriptor { info, access: def.access_flags, super_class, interfaces, source_file, fields, methods })
}

fn method_descriptor(
    container: &Container,
    resolver: &PoolResolver,
    owner: &Arc<ClassInfo>,
    encoded: &EncodedMethod,
) -> Result<MethodDescriptor, DexError> {
    let r = resolver.method_ref(encoded.method_idx)?;
    let code = container
        .code_item(encoded.code_off)
        .context(|| format!("code of {}->{}{}", owner, r.name, r.descriptor()))?;
    let mut m = MethodDescriptor::new(owner.clone(), &r.name, r.proto, encoded.access_flags, code);
    m.method_idx = encoded.method_idx;
    m.code_off = encoded.code_off;
    Ok(m)
}

/// Parses every class definition, failing on the first class that cannot be
/// resolved.
pub fn parse_classes(container: &Container, registry: &Registry) -> Result<Vec<ClassDescriptor>, DexError> {
    register_classes(container, registry);
    container
        .class_defs()
        .iter()
        .map(|def| parse_class(container, registry, def))
        .collect()
}
