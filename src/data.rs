//! Typed value containers flowing through the graph.

use crate::error::{XflowError, XflowResult};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a data entry in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub usize);

/// Type tag of a data entry. Immutable once the entry exists.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// One float per tuple.
    Float,
    /// Two floats per tuple.
    Float2,
    /// Three floats per tuple.
    Float3,
    /// Four floats per tuple.
    Float4,
    /// Column-major 4x4 matrix per tuple.
    Float4x4,
    /// One integer per tuple.
    Int,
    /// Four integers per tuple.
    Int4,
    /// One boolean per tuple.
    Bool,
    /// Image reference with sampler state.
    Texture,
}

/// Backing storage class of a [`DataType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// `Vec<f32>` storage.
    Float,
    /// `Vec<i32>` storage.
    Int,
    /// `Vec<bool>` storage.
    Bool,
    /// Texture, no numeric buffer.
    Texture,
}

impl DataType {
    /// Number of scalars making up one tuple.
    pub fn tuple_size(self) -> usize {
        match self {
            DataType::Float => 1,
            DataType::Float2 => 2,
            DataType::Float3 => 3,
            DataType::Float4 => 4,
            DataType::Float4x4 => 16,
            DataType::Int => 1,
            DataType::Int4 => 4,
            DataType::Bool => 1,
            DataType::Texture => 1,
        }
    }

    /// Storage class used for values of this type.
    pub fn storage(self) -> StorageKind {
        match self {
            DataType::Float
            | DataType::Float2
            | DataType::Float3
            | DataType::Float4
            | DataType::Float4x4 => StorageKind::Float,
            DataType::Int | DataType::Int4 => StorageKind::Int,
            DataType::Bool => StorageKind::Bool,
            DataType::Texture => StorageKind::Texture,
        }
    }

    /// Name used by operator descriptors.
    pub fn name(self) -> &'static str {
        match self {
            DataType::Float => "float",
            DataType::Float2 => "float2",
            DataType::Float3 => "float3",
            DataType::Float4 => "float4",
            DataType::Float4x4 => "float4x4",
            DataType::Int => "int",
            DataType::Int4 => "int4",
            DataType::Bool => "bool",
            DataType::Texture => "texture",
        }
    }
}

impl FromStr for DataType {
    type Err = XflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "float" => Ok(DataType::Float),
            "float2" => Ok(DataType::Float2),
            "float3" => Ok(DataType::Float3),
            "float4" => Ok(DataType::Float4),
            "float4x4" => Ok(DataType::Float4x4),
            "int" => Ok(DataType::Int),
            "int4" => Ok(DataType::Int4),
            "bool" => Ok(DataType::Bool),
            "texture" => Ok(DataType::Texture),
            other => Err(XflowError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw numeric payload of a buffer entry.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferValue {
    /// Float storage.
    Float(Vec<f32>),
    /// Integer storage.
    Int(Vec<i32>),
    /// Boolean storage.
    Bool(Vec<bool>),
}

impl BufferValue {
    /// Empty storage matching `kind`. Textures have no buffer and map to floats.
    pub fn empty(kind: StorageKind) -> Self {
        match kind {
            StorageKind::Int => BufferValue::Int(Vec::new()),
            StorageKind::Bool => BufferValue::Bool(Vec::new()),
            StorageKind::Float | StorageKind::Texture => BufferValue::Float(Vec::new()),
        }
    }

    /// Number of scalars stored.
    pub fn len(&self) -> usize {
        match self {
            BufferValue::Float(v) => v.len(),
            BufferValue::Int(v) => v.len(),
            BufferValue::Bool(v) => v.len(),
        }
    }

    /// Whether no scalars are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage class of the payload.
    pub fn storage(&self) -> StorageKind {
        match self {
            BufferValue::Float(_) => StorageKind::Float,
            BufferValue::Int(_) => StorageKind::Int,
            BufferValue::Bool(_) => StorageKind::Bool,
        }
    }

    /// Resize to `len` scalars, zero-filling new space.
    pub fn resize(&mut self, len: usize) {
        match self {
            BufferValue::Float(v) => v.resize(len, 0.0),
            BufferValue::Int(v) => v.resize(len, 0),
            BufferValue::Bool(v) => v.resize(len, false),
        }
    }

    /// Float view, if this is float storage.
    pub fn as_floats(&self) -> Option<&[f32]> {
        match self {
            BufferValue::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Integer view, if this is integer storage.
    pub fn as_ints(&self) -> Option<&[i32]> {
        match self {
            BufferValue::Int(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean view, if this is boolean storage.
    pub fn as_bools(&self) -> Option<&[bool]> {
        match self {
            BufferValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

/// Numeric buffer with an immutable type tag.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
    ty: DataType,
    value: BufferValue,
}

impl BufferEntry {
    /// Create a buffer, checking the payload matches the type's storage class.
    pub fn new(ty: DataType, value: BufferValue) -> XflowResult<Self> {
        if ty.storage() != value.storage() {
            return Err(XflowError::TypeMismatch {
                expected: ty.to_string(),
                actual: format!("{:?}", value.storage()),
            });
        }
        Ok(Self { ty, value })
    }

    /// An empty buffer of the given type.
    pub fn empty(ty: DataType) -> Self {
        Self {
            ty,
            value: BufferValue::empty(ty.storage()),
        }
    }

    /// Type tag.
    pub fn data_type(&self) -> DataType {
        self.ty
    }

    /// Payload.
    pub fn value(&self) -> &BufferValue {
        &self.value
    }

    pub(crate) fn value_mut(&mut self) -> &mut BufferValue {
        &mut self.value
    }

    /// Replace the payload; the storage class must not change.
    pub fn set_value(&mut self, value: BufferValue) -> XflowResult<()> {
        if value.storage() != self.ty.storage() {
            return Err(XflowError::TypeMismatch {
                expected: self.ty.to_string(),
                actual: format!("{:?}", value.storage()),
            });
        }
        self.value = value;
        Ok(())
    }

    /// Number of whole tuples in the payload.
    pub fn tuple_count(&self) -> usize {
        self.value.len() / self.ty.tuple_size()
    }
}

/// Texture wrap mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapMode {
    /// Clamp texture coordinates to the edge.
    #[default]
    Clamp,
    /// Repeat the image.
    Repeat,
}

/// Texture filter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Nearest texel.
    Nearest,
    /// Bilinear.
    #[default]
    Linear,
}

/// Sampling state attached to a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplerConfig {
    /// Horizontal wrap.
    pub wrap_s: WrapMode,
    /// Vertical wrap.
    pub wrap_t: WrapMode,
    /// Minification filter.
    pub min_filter: FilterMode,
    /// Magnification filter.
    pub mag_filter: FilterMode,
    /// Generate mipmaps on upload.
    pub generate_mipmap: bool,
}

/// Opaque reference to an image owned by an external loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHandle {
    /// Loader-defined identifier.
    pub id: u64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Image reference plus sampler state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextureEntry {
    /// Sampling state.
    pub sampler: SamplerConfig,
    /// Loaded image, if any.
    pub image: Option<ImageHandle>,
    /// The external loader has not delivered the image yet.
    pub loading: bool,
}

/// A typed payload flowing through channels.
#[derive(Debug, Clone, PartialEq)]
pub enum DataEntry {
    /// Numeric buffer.
    Buffer(BufferEntry),
    /// Texture reference.
    Texture(TextureEntry),
}

impl DataEntry {
    /// Float buffer of the given float type.
    pub fn floats(ty: DataType, values: Vec<f32>) -> XflowResult<Self> {
        Ok(DataEntry::Buffer(BufferEntry::new(ty, BufferValue::Float(values))?))
    }

    /// Integer buffer of the given integer type.
    pub fn ints(ty: DataType, values: Vec<i32>) -> XflowResult<Self> {
        Ok(DataEntry::Buffer(BufferEntry::new(ty, BufferValue::Int(values))?))
    }

    /// Boolean buffer.
    pub fn bools(values: Vec<bool>) -> Self {
        DataEntry::Buffer(BufferEntry {
            ty: DataType::Bool,
            value: BufferValue::Bool(values),
        })
    }

    /// An empty entry of the given type.
    pub fn empty(ty: DataType) -> Self {
        match ty {
            DataType::Texture => DataEntry::Texture(TextureEntry::default()),
            _ => DataEntry::Buffer(BufferEntry::empty(ty)),
        }
    }

    /// Type tag.
    pub fn data_type(&self) -> DataType {
        match self {
            DataEntry::Buffer(b) => b.data_type(),
            DataEntry::Texture(_) => DataType::Texture,
        }
    }

    /// Buffer payload, if this is a buffer.
    pub fn as_buffer(&self) -> Option<&BufferEntry> {
        match self {
            DataEntry::Buffer(b) => Some(b),
            DataEntry::Texture(_) => None,
        }
    }

    /// Texture, if this is a texture.
    pub fn as_texture(&self) -> Option<&TextureEntry> {
        match self {
            DataEntry::Texture(t) => Some(t),
            DataEntry::Buffer(_) => None,
        }
    }

    /// Float values of a float buffer.
    pub fn float_values(&self) -> Option<&[f32]> {
        self.as_buffer().and_then(|b| b.value().as_floats())
    }

    /// Integer values of an integer buffer.
    pub fn int_values(&self) -> Option<&[i32]> {
        self.as_buffer().and_then(|b| b.value().as_ints())
    }

    /// Number of tuples. A texture counts as one.
    pub fn tuple_count(&self) -> usize {
        match self {
            DataEntry::Buffer(b) => b.tuple_count(),
            DataEntry::Texture(_) => 1,
        }
    }

    /// Whether there is nothing to read: an empty buffer or an unloaded texture.
    pub fn is_empty(&self) -> bool {
        match self {
            DataEntry::Buffer(b) => b.value().is_empty(),
            DataEntry::Texture(t) => t.image.is_none(),
        }
    }

    /// Texture still loading.
    pub fn is_loading(&self) -> bool {
        matches!(self, DataEntry::Texture(t) if t.loading)
    }
}
