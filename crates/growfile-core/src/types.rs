//! Type descriptors for stored values
//!
//! Every definition in the directory carries a `TypeDesc`. Lookups compare
//! descriptors structurally, so a reader asking for `[i32]` never gets a view
//! over a `[f64]`. Rust types opt in through the `Storable` trait, which is
//! only implementable for `bytemuck::Pod` types: anything stored in the file
//! must be valid for every bit pattern, because a reader may observe it while
//! the writer is halfway through filling a block.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::error::{GrowError, GrowResult};
use crate::format::Kind;

/// Maximum nesting depth accepted when decoding a descriptor.
const MAX_DEPTH: usize = 16;

const TAG_TEXT: u8 = 0x10;
const TAG_ARRAY: u8 = 0x20;
const TAG_REF: u8 = 0x21;
const TAG_RECORD: u8 = 0x30;

/// Primitive scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prim {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl Prim {
    /// Size in bytes; primitives are aligned to their size.
    pub fn size(self) -> u64 {
        match self {
            Prim::I8 | Prim::U8 => 1,
            Prim::I16 | Prim::U16 => 2,
            Prim::I32 | Prim::U32 | Prim::F32 => 4,
            Prim::I64 | Prim::U64 | Prim::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Prim::I8 => "i8",
            Prim::U8 => "u8",
            Prim::I16 => "i16",
            Prim::U16 => "u16",
            Prim::I32 => "i32",
            Prim::U32 => "u32",
            Prim::I64 => "i64",
            Prim::U64 => "u64",
            Prim::F32 => "f32",
            Prim::F64 => "f64",
        }
    }

    fn tag(self) -> u8 {
        match self {
            Prim::I8 => 0x01,
            Prim::U8 => 0x02,
            Prim::I16 => 0x03,
            Prim::U16 => 0x04,
            Prim::I32 => 0x05,
            Prim::U32 => 0x06,
            Prim::I64 => 0x07,
            Prim::U64 => 0x08,
            Prim::F32 => 0x09,
            Prim::F64 => 0x0A,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Prim::I8,
            0x02 => Prim::U8,
            0x03 => Prim::I16,
            0x04 => Prim::U16,
            0x05 => Prim::I32,
            0x06 => Prim::U32,
            0x07 => Prim::I64,
            0x08 => Prim::U64,
            0x09 => Prim::F32,
            0x0A => Prim::F64,
            _ => return None,
        })
    }
}

/// A named field of a record at a fixed byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub offset: u32,
    pub ty: TypeDesc,
}

impl Field {
    /// Build a field; `offset` is usually `std::mem::offset_of!(Record, field)`.
    pub fn new(name: impl Into<String>, offset: usize, ty: TypeDesc) -> Self {
        Self { name: name.into(), offset: offset as u32, ty }
    }
}

/// Size and alignment of a fixed-size value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub size: u64,
    pub align: u64,
}

/// Structural description of a stored type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    /// Fixed-size primitive.
    Prim(Prim),
    /// Pointer-sized reference to a byte array holding UTF-8 text.
    Text,
    /// Fixed-size record with explicit field offsets.
    Record { size: u32, align: u32, fields: Vec<Field> },
    /// Dynamic array of fixed-size elements, stored behind an indirection cell.
    Array(Box<TypeDesc>),
    /// Single stored reference to a fixed-size value.
    Ref(Box<TypeDesc>),
}

impl TypeDesc {
    pub fn array(elem: TypeDesc) -> Self {
        TypeDesc::Array(Box::new(elem))
    }

    pub fn reference(target: TypeDesc) -> Self {
        TypeDesc::Ref(Box::new(target))
    }

    /// Describe the Rust record type `T` by its fields.
    pub fn record<T>(fields: Vec<Field>) -> Self {
        TypeDesc::Record {
            size: std::mem::size_of::<T>() as u32,
            align: std::mem::align_of::<T>() as u32,
            fields,
        }
    }

    /// Which kind of definition this descriptor produces.
    pub fn kind(&self) -> Kind {
        match self {
            TypeDesc::Array(_) => Kind::Array,
            TypeDesc::Ref(_) => Kind::Ref,
            _ => Kind::Scalar,
        }
    }

    /// Layout of a fixed-size value. `None` for arrays and references,
    /// which are definition shapes rather than values.
    pub fn layout(&self) -> Option<Layout> {
        match self {
            TypeDesc::Prim(p) => Some(Layout { size: p.size(), align: p.size() }),
            TypeDesc::Text => Some(Layout { size: 8, align: 8 }),
            TypeDesc::Record { size, align, .. } => Some(Layout {
                size: *size as u64,
                align: *align as u64,
            }),
            TypeDesc::Array(_) | TypeDesc::Ref(_) => None,
        }
    }

    /// Layout of the value a definition of this type stores: the element for
    /// arrays, the target for references, the value itself otherwise.
    pub fn value_layout(&self) -> Option<Layout> {
        match self {
            TypeDesc::Array(inner) | TypeDesc::Ref(inner) => inner.layout(),
            other => other.layout(),
        }
    }

    /// The fixed-size type held by this definition (element, target, or self).
    pub fn value_type(&self) -> &TypeDesc {
        match self {
            TypeDesc::Array(inner) | TypeDesc::Ref(inner) => inner,
            other => other,
        }
    }

    /// Byte offsets of every `Text` field inside a fixed-size value.
    pub fn text_offsets(&self) -> Vec<u64> {
        let mut out = Vec::new();
        self.collect_text(0, &mut out);
        out
    }

    fn collect_text(&self, base: u64, out: &mut Vec<u64>) {
        match self {
            TypeDesc::Text => out.push(base),
            TypeDesc::Record { fields, .. } => {
                for field in fields {
                    field.ty.collect_text(base + field.offset as u64, out);
                }
            }
            _ => {}
        }
    }

    /// Check that the descriptor describes something the store can hold.
    pub fn validate(&self) -> GrowResult<()> {
        self.check(0).map_err(|reason| GrowError::InvalidType {
            desc: self.to_string(),
            reason,
        })
    }

    fn check(&self, depth: usize) -> Result<(), String> {
        if depth > MAX_DEPTH {
            return Err("type nested too deeply".into());
        }
        match self {
            TypeDesc::Prim(_) | TypeDesc::Text => Ok(()),
            TypeDesc::Array(inner) | TypeDesc::Ref(inner) => {
                if inner.layout().is_none() {
                    return Err(format!("{} cannot be nested inside {}", inner, self.kind().name()));
                }
                inner.check(depth + 1)
            }
            TypeDesc::Record { size, align, fields } => {
                if !align.is_power_of_two() || *align > 8 {
                    return Err(format!("record alignment {} must be a power of two <= 8", align));
                }
                if *size == 0 || size % align != 0 {
                    return Err(format!(
                        "record size {} must be a non-zero multiple of {}",
                        size, align
                    ));
                }
                let mut seen = hashbrown::HashSet::new();
                for field in fields {
                    if !seen.insert(field.name.as_str()) {
                        return Err(format!("duplicate field '{}'", field.name));
                    }
                    let layout = field.ty.layout()
                        .ok_or_else(|| format!("field '{}' must be fixed-size", field.name))?;
                    if field.offset as u64 % layout.align != 0 {
                        return Err(format!(
                            "field '{}' at offset {} is misaligned",
                            field.name, field.offset
                        ));
                    }
                    if field.offset as u64 + layout.size > *size as u64 {
                        return Err(format!("field '{}' overruns the record", field.name));
                    }
                    if layout.align > *align as u64 {
                        return Err(format!(
                            "field '{}' is more aligned than its record",
                            field.name
                        ));
                    }
                    field.ty.check(depth + 1)?;
                }
                Ok(())
            }
        }
    }

    /// Append the binary encoding of this descriptor to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            TypeDesc::Prim(p) => out.push(p.tag()),
            TypeDesc::Text => out.push(TAG_TEXT),
            TypeDesc::Array(inner) => {
                out.push(TAG_ARRAY);
                inner.encode(out);
            }
            TypeDesc::Ref(inner) => {
                out.push(TAG_REF);
                inner.encode(out);
            }
            TypeDesc::Record { size, align, fields } => {
                out.push(TAG_RECORD);
                out.extend_from_slice(&size.to_le_bytes());
                out.extend_from_slice(&align.to_le_bytes());
                out.extend_from_slice(&(fields.len() as u16).to_le_bytes());
                for field in fields {
                    out.extend_from_slice(&(field.name.len() as u16).to_le_bytes());
                    out.extend_from_slice(field.name.as_bytes());
                    out.extend_from_slice(&field.offset.to_le_bytes());
                    field.ty.encode(out);
                }
            }
        }
    }

    /// Decode a descriptor that must span exactly `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let desc = cursor.desc(0)?;
        if cursor.pos != bytes.len() {
            return Err(format!(
                "{} trailing bytes after type descriptor",
                bytes.len() - cursor.pos
            ));
        }
        Ok(desc)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.bytes.len() {
            return Err("type descriptor truncated".into());
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn desc(&mut self, depth: usize) -> Result<TypeDesc, String> {
        if depth > MAX_DEPTH {
            return Err("type descriptor nested too deeply".into());
        }
        let tag = self.u8()?;
        if let Some(p) = Prim::from_tag(tag) {
            return Ok(TypeDesc::Prim(p));
        }
        match tag {
            TAG_TEXT => Ok(TypeDesc::Text),
            TAG_ARRAY => Ok(TypeDesc::Array(Box::new(self.desc(depth + 1)?))),
            TAG_REF => Ok(TypeDesc::Ref(Box::new(self.desc(depth + 1)?))),
            TAG_RECORD => {
                let size = self.u32()?;
                let align = self.u32()?;
                let count = self.u16()?;
                let mut fields = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name_len = self.u16()? as usize;
                    let name = std::str::from_utf8(self.take(name_len)?)
                        .map_err(|_| "field name is not UTF-8".to_string())?
                        .to_string();
                    let offset = self.u32()?;
                    let ty = self.desc(depth + 1)?;
                    fields.push(Field { name, offset, ty });
                }
                Ok(TypeDesc::Record { size, align, fields })
            }
            other => Err(format!("unknown type tag 0x{:02x}", other)),
        }
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDesc::Prim(p) => f.write_str(p.name()),
            TypeDesc::Text => f.write_str("text"),
            TypeDesc::Array(inner) => write!(f, "[{}]", inner),
            TypeDesc::Ref(inner) => write!(f, "&{}", inner),
            TypeDesc::Record { fields, .. } => {
                f.write_str("{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}:{}", field.name, field.ty)?;
                }
                f.write_str("}")
            }
        }
    }
}

/// A Rust type that can live inside a store.
///
/// Implemented for the primitive integer and float types and for `TextRef`.
/// Records implement it by describing their fields:
///
/// ```
/// use bytemuck::{Pod, Zeroable};
/// use growfile_core::{Field, Storable, TextRef, TypeDesc};
///
/// #[repr(C)]
/// #[derive(Clone, Copy, Pod, Zeroable)]
/// struct Tick {
///     x: i64,
///     y: f64,
///     z: TextRef,
/// }
///
/// impl Storable for Tick {
///     fn type_desc() -> TypeDesc {
///         TypeDesc::record::<Tick>(vec![
///             Field::new("x", std::mem::offset_of!(Tick, x), i64::type_desc()),
///             Field::new("y", std::mem::offset_of!(Tick, y), f64::type_desc()),
///             Field::new("z", std::mem::offset_of!(Tick, z), TextRef::type_desc()),
///         ])
///     }
/// }
/// ```
pub trait Storable: Pod {
    fn type_desc() -> TypeDesc;
}

macro_rules! prim_storable {
    ($($t:ty => $p:ident),* $(,)?) => {
        $(
            impl Storable for $t {
                fn type_desc() -> TypeDesc {
                    TypeDesc::Prim(Prim::$p)
                }
            }
        )*
    };
}

prim_storable! {
    i8 => I8, u8 => U8, i16 => I16, u16 => U16,
    i32 => I32, u32 => U32, i64 => I64, u64 => U64,
    f32 => F32, f64 => F64,
}

/// Reference to text stored in the same file.
///
/// Holds the offset of a byte array's indirection cell. The zero value is
/// the null reference and reads back as an empty string.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct TextRef(u64);

impl TextRef {
    pub const NULL: Self = Self(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn from_cell(cell: crate::format::Offset) -> Self {
        Self(cell.as_u64())
    }

    pub(crate) fn cell(&self) -> crate::format::Offset {
        crate::format::Offset::new(self.0)
    }
}

impl Storable for TextRef {
    fn type_desc() -> TypeDesc {
        TypeDesc::Text
    }
}

/// Copy packed elements out of a byte buffer.
pub(crate) fn decode_elements<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// Check that `T`'s Rust layout matches the descriptor it claims.
pub(crate) fn check_storable<T: Storable>(desc: &TypeDesc) -> GrowResult<()> {
    desc.validate()?;
    let layout = desc.layout().ok_or_else(|| GrowError::InvalidType {
        desc: desc.to_string(),
        reason: "not a fixed-size type".into(),
    })?;
    if layout.size != std::mem::size_of::<T>() as u64
        || layout.align != std::mem::align_of::<T>() as u64
    {
        return Err(GrowError::InvalidType {
            desc: desc.to_string(),
            reason: format!(
                "descriptor layout {}/{} disagrees with Rust layout {}/{}",
                layout.size,
                layout.align,
                std::mem::size_of::<T>(),
                std::mem::align_of::<T>()
            ),
        });
    }
    Ok(())
}
