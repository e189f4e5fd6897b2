//! Type system for the shader IR.
//!
//! Types are interned in a [`UniqueArena`], so two structurally equal types
//! always share a [`Handle`]. Struct definitions live in their own arena and
//! are referenced by handle, which keeps struct identity nominal and lets
//! passes update struct flags in place.

use std::collections::HashMap;
use std::fmt;
use std::ops::Index;

use crate::arena::{Arena, Handle, UniqueArena};
use crate::attributes::IoAttributes;

/// Width of a scalar type in bytes.
pub type Bytes = u8;

/// The kind of a scalar type.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ScalarKind {
    /// Boolean.
    Bool,
    /// Signed integer.
    Sint,
    /// Unsigned integer.
    Uint,
    /// Floating point.
    Float,
}

/// A scalar type: kind + byte width.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub width: Bytes,
}

impl Scalar {
    pub const BOOL: Self = Self {
        kind: ScalarKind::Bool,
        width: 1,
    };
    pub const I32: Self = Self {
        kind: ScalarKind::Sint,
        width: 4,
    };
    pub const U32: Self = Self {
        kind: ScalarKind::Uint,
        width: 4,
    };
    pub const F16: Self = Self {
        kind: ScalarKind::Float,
        width: 2,
    };
    pub const F32: Self = Self {
        kind: ScalarKind::Float,
        width: 4,
    };

    pub fn is_integer(self) -> bool {
        matches!(self.kind, ScalarKind::Sint | ScalarKind::Uint)
    }

    pub fn is_float(self) -> bool {
        self.kind == ScalarKind::Float
    }

    /// The integer scalar of the same width with the requested signedness.
    pub fn with_signedness(self, signed: bool) -> Self {
        let kind = if signed {
            ScalarKind::Sint
        } else {
            ScalarKind::Uint
        };
        Self {
            kind,
            width: self.width,
        }
    }
}

/// Number of components in a vector.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum VectorSize {
    /// 2 components.
    Bi = 2,
    /// 3 components.
    Tri = 3,
    /// 4 components.
    Quad = 4,
}

impl VectorSize {
    /// Converts a component count into a vector size.
    pub fn from_count(count: u32) -> Option<Self> {
        match count {
            2 => Some(Self::Bi),
            3 => Some(Self::Tri),
            4 => Some(Self::Quad),
            _ => None,
        }
    }

    pub fn count(self) -> u32 {
        self as u32
    }
}

/// Size of an array.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ArraySize {
    /// Fixed-size array.
    Constant(u32),
    /// Runtime-sized array (storage buffers only).
    Runtime,
}

/// Memory address space of a pointer or variable.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum AddressSpace {
    Function,
    Private,
    Workgroup,
    Uniform,
    Storage,
    /// Push-constant / immediate data block.
    Immediate,
    /// Textures and samplers.
    Handle,
}

impl AddressSpace {
    /// Spaces whose contents are shared with the host and need an explicit layout.
    pub fn is_host_shareable(self) -> bool {
        matches!(self, Self::Uniform | Self::Storage | Self::Immediate)
    }
}

/// Access mode of a pointer or storage texture.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

/// Dimensionality of a texture, including arrayness.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum TextureDimension {
    D1,
    D2,
    D2Array,
    D3,
    Cube,
    CubeArray,
}

impl TextureDimension {
    pub fn is_arrayed(self) -> bool {
        matches!(self, Self::D2Array | Self::CubeArray)
    }

    /// Number of coordinate components, excluding the array layer.
    pub fn coordinate_count(self) -> u32 {
        match self {
            Self::D1 => 1,
            Self::D2 | Self::D2Array => 2,
            Self::D3 | Self::Cube | Self::CubeArray => 3,
        }
    }
}

/// The kind of a sampler.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum SamplerKind {
    Sampler,
    Comparison,
}

/// Texel format of a storage texture.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum TexelFormat {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Uint,
    R32Sint,
    R32Float,
}

impl TexelFormat {
    /// The scalar type of a texel channel.
    pub fn channel(self) -> Scalar {
        match self {
            Self::Rgba8Unorm | Self::Rgba16Float | Self::Rgba32Float | Self::R32Float => {
                Scalar::F32
            }
            Self::R32Uint => Scalar::U32,
            Self::R32Sint => Scalar::I32,
        }
    }
}

/// Bitflags describing struct properties.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct StructFlags(u32);

impl StructFlags {
    pub const EMPTY: Self = Self(0);
    /// The struct uses the explicit (host-shareable) memory layout.
    pub const EXPLICIT_LAYOUT: Self = Self(1);
    /// The struct is the top-level type of a buffer block.
    pub const BLOCK: Self = Self(2);

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for StructFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for StructFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Bitflags recording how an IO struct is used by the pipeline.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct PipelineUsage(u32);

impl PipelineUsage {
    pub const EMPTY: Self = Self(0);
    pub const VERTEX_INPUT: Self = Self(1);
    pub const VERTEX_OUTPUT: Self = Self(2);
    pub const FRAGMENT_INPUT: Self = Self(4);
    pub const FRAGMENT_OUTPUT: Self = Self(8);
    pub const COMPUTE_INPUT: Self = Self(16);

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOrAssign for PipelineUsage {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A member of a struct type.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct StructMember {
    pub name: String,
    pub ty: Handle<Type>,
    pub attributes: IoAttributes,
}

impl StructMember {
    pub fn new(name: impl Into<String>, ty: Handle<Type>) -> Self {
        Self {
            name: name.into(),
            ty,
            attributes: IoAttributes::default(),
        }
    }

    pub fn with_attributes(name: impl Into<String>, ty: Handle<Type>, attributes: IoAttributes) -> Self {
        Self {
            name: name.into(),
            ty,
            attributes,
        }
    }
}

/// A struct definition.
#[derive(Clone, Debug)]
pub struct StructDef {
    pub name: String,
    pub members: Vec<StructMember>,
    pub flags: StructFlags,
    pub usage: PipelineUsage,
}

/// A type.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Type {
    Void,
    /// A single scalar value.
    Scalar(Scalar),
    /// A vector of scalars.
    Vector { size: VectorSize, scalar: Scalar },
    /// A matrix of column vectors.
    Matrix {
        columns: VectorSize,
        rows: VectorSize,
        scalar: Scalar,
    },
    /// A fixed-size or runtime-sized array. A `stride` marks the
    /// explicit-layout form used in host-shareable memory.
    Array {
        base: Handle<Type>,
        size: ArraySize,
        stride: Option<u32>,
    },
    /// A struct; the definition is stored in the [`TypeTable`].
    Struct(Handle<StructDef>),
    /// An atomic scalar.
    Atomic(Scalar),
    /// A pointer to a value in a given address space.
    Pointer {
        space: AddressSpace,
        store: Handle<Type>,
        access: Access,
    },
    SampledTexture {
        dim: TextureDimension,
        sampled: Scalar,
    },
    MultisampledTexture {
        dim: TextureDimension,
        sampled: Scalar,
    },
    DepthTexture {
        dim: TextureDimension,
    },
    DepthMultisampledTexture {
        dim: TextureDimension,
    },
    StorageTexture {
        dim: TextureDimension,
        format: TexelFormat,
        access: Access,
    },
    Sampler(SamplerKind),
    /// A combined image and sampler handle. Not a core type.
    SampledImage { image: Handle<Type> },
    /// A string literal, only used for diagnostic format strings.
    String,
}

impl Type {
    pub fn is_texture(&self) -> bool {
        matches!(
            self,
            Self::SampledTexture { .. }
                | Self::MultisampledTexture { .. }
                | Self::DepthTexture { .. }
                | Self::DepthMultisampledTexture { .. }
                | Self::StorageTexture { .. }
        )
    }

    pub fn is_depth_texture(&self) -> bool {
        matches!(
            self,
            Self::DepthTexture { .. } | Self::DepthMultisampledTexture { .. }
        )
    }

    /// The dimensionality of a texture type.
    pub fn texture_dimension(&self) -> Option<TextureDimension> {
        match *self {
            Self::SampledTexture { dim, .. }
            | Self::MultisampledTexture { dim, .. }
            | Self::DepthTexture { dim }
            | Self::DepthMultisampledTexture { dim }
            | Self::StorageTexture { dim, .. } => Some(dim),
            _ => None,
        }
    }
}

/// Owner of all types of a module.
#[derive(Clone, Debug, Default)]
pub struct TypeTable {
    types: UniqueArena<Type>,
    structs: Arena<StructDef>,
    builtin_structs: HashMap<String, Handle<Type>>,
}

impl Index<Handle<Type>> for TypeTable {
    type Output = Type;

    fn index(&self, handle: Handle<Type>) -> &Type {
        &self.types[handle]
    }
}

impl TypeTable {
    pub fn insert(&mut self, ty: Type) -> Handle<Type> {
        self.types.insert(ty)
    }

    /// The handle of an already interned type.
    pub fn lookup(&self, ty: &Type) -> Option<Handle<Type>> {
        self.types.get_handle(ty)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<Type>, &Type)> {
        self.types.iter()
    }

    pub fn void(&mut self) -> Handle<Type> {
        self.insert(Type::Void)
    }

    pub fn bool(&mut self) -> Handle<Type> {
        self.scalar(Scalar::BOOL)
    }

    pub fn i32(&mut self) -> Handle<Type> {
        self.scalar(Scalar::I32)
    }

    pub fn u32(&mut self) -> Handle<Type> {
        self.scalar(Scalar::U32)
    }

    pub fn f32(&mut self) -> Handle<Type> {
        self.scalar(Scalar::F32)
    }

    pub fn f16(&mut self) -> Handle<Type> {
        self.scalar(Scalar::F16)
    }

    pub fn string(&mut self) -> Handle<Type> {
        self.insert(Type::String)
    }

    pub fn scalar(&mut self, scalar: Scalar) -> Handle<Type> {
        self.insert(Type::Scalar(scalar))
    }

    pub fn vector(&mut self, size: VectorSize, scalar: Scalar) -> Handle<Type> {
        self.insert(Type::Vector { size, scalar })
    }

    /// A scalar for `count == 1`, otherwise a vector of `count` components.
    ///
    /// Panics if `count` is not in `1..=4`.
    pub fn vec_or_scalar(&mut self, count: u32, scalar: Scalar) -> Handle<Type> {
        if count == 1 {
            return self.scalar(scalar);
        }
        let size = VectorSize::from_count(count)
            .unwrap_or_else(|| panic!("invalid vector width {count}"));
        self.vector(size, scalar)
    }

    pub fn matrix(&mut self, columns: VectorSize, rows: VectorSize, scalar: Scalar) -> Handle<Type> {
        self.insert(Type::Matrix {
            columns,
            rows,
            scalar,
        })
    }

    pub fn array(&mut self, base: Handle<Type>, count: u32) -> Handle<Type> {
        self.insert(Type::Array {
            base,
            size: ArraySize::Constant(count),
            stride: None,
        })
    }

    pub fn runtime_array(&mut self, base: Handle<Type>) -> Handle<Type> {
        self.insert(Type::Array {
            base,
            size: ArraySize::Runtime,
            stride: None,
        })
    }

    pub fn pointer(&mut self, space: AddressSpace, store: Handle<Type>, access: Access) -> Handle<Type> {
        self.insert(Type::Pointer {
            space,
            store,
            access,
        })
    }

    pub fn atomic(&mut self, scalar: Scalar) -> Handle<Type> {
        self.insert(Type::Atomic(scalar))
    }

    pub fn sampler(&mut self, kind: SamplerKind) -> Handle<Type> {
        self.insert(Type::Sampler(kind))
    }

    /// Declares a new struct type. Struct identity is nominal: every call
    /// creates a distinct type.
    pub fn new_struct(&mut self, name: impl Into<String>, members: Vec<StructMember>) -> Handle<Type> {
        let def = self.structs.append(StructDef {
            name: name.into(),
            members,
            flags: StructFlags::EMPTY,
            usage: PipelineUsage::EMPTY,
        });
        self.insert(Type::Struct(def))
    }

    pub fn struct_def(&self, ty: Handle<Type>) -> Option<&StructDef> {
        match self.types[ty] {
            Type::Struct(def) => Some(&self.structs[def]),
            _ => None,
        }
    }

    pub fn struct_def_mut(&mut self, ty: Handle<Type>) -> Option<&mut StructDef> {
        match self.types[ty] {
            Type::Struct(def) => Some(&mut self.structs[def]),
            _ => None,
        }
    }

    /// Returns the scalar of a scalar, vector, matrix or atomic type.
    pub fn scalar_of(&self, ty: Handle<Type>) -> Option<Scalar> {
        match self.types[ty] {
            Type::Scalar(s) | Type::Atomic(s) => Some(s),
            Type::Vector { scalar, .. } | Type::Matrix { scalar, .. } => Some(scalar),
            _ => None,
        }
    }

    /// Number of components: 1 for scalars, N for vectors, 0 otherwise.
    pub fn width(&self, ty: Handle<Type>) -> u32 {
        match self.types[ty] {
            Type::Scalar(_) => 1,
            Type::Vector { size, .. } => size.count(),
            _ => 0,
        }
    }

    pub fn is_scalar(&self, ty: Handle<Type>) -> bool {
        matches!(self.types[ty], Type::Scalar(_))
    }

    pub fn is_vector(&self, ty: Handle<Type>) -> bool {
        matches!(self.types[ty], Type::Vector { .. })
    }

    pub fn is_matrix(&self, ty: Handle<Type>) -> bool {
        matches!(self.types[ty], Type::Matrix { .. })
    }

    pub fn is_scalar_or_vector(&self, ty: Handle<Type>) -> bool {
        self.is_scalar(ty) || self.is_vector(ty)
    }

    /// `true` for integer scalars and vectors.
    pub fn is_integer(&self, ty: Handle<Type>) -> bool {
        self.is_scalar_or_vector(ty) && self.scalar_of(ty).is_some_and(Scalar::is_integer)
    }

    /// `true` for floating point scalars and vectors.
    pub fn is_float(&self, ty: Handle<Type>) -> bool {
        self.is_scalar_or_vector(ty) && self.scalar_of(ty).is_some_and(Scalar::is_float)
    }

    pub fn is_signed_integer(&self, ty: Handle<Type>) -> bool {
        self.is_scalar_or_vector(ty) && self.scalar_of(ty).is_some_and(|s| s.kind == ScalarKind::Sint)
    }

    pub fn is_unsigned_integer(&self, ty: Handle<Type>) -> bool {
        self.is_scalar_or_vector(ty) && self.scalar_of(ty).is_some_and(|s| s.kind == ScalarKind::Uint)
    }

    pub fn is_bool(&self, ty: Handle<Type>) -> bool {
        self.is_scalar_or_vector(ty) && self.scalar_of(ty).is_some_and(|s| s.kind == ScalarKind::Bool)
    }

    /// A type with the shape of `ty` (scalar, vector or matrix) and a new scalar.
    pub fn with_scalar(&mut self, ty: Handle<Type>, scalar: Scalar) -> Handle<Type> {
        match self.types[ty] {
            Type::Scalar(_) => self.scalar(scalar),
            Type::Vector { size, .. } => self.vector(size, scalar),
            Type::Matrix { columns, rows, .. } => self.matrix(columns, rows, scalar),
            ref other => panic!("type {other:?} has no scalar shape"),
        }
    }

    /// The element type: vector → scalar, matrix → column vector, array → base.
    pub fn element(&mut self, ty: Handle<Type>) -> Option<Handle<Type>> {
        match self.types[ty] {
            Type::Vector { scalar, .. } => Some(self.scalar(scalar)),
            Type::Matrix { rows, scalar, .. } => Some(self.vector(rows, scalar)),
            Type::Array { base, .. } => Some(base),
            _ => None,
        }
    }

    /// Number of elements of a composite with a static element count.
    pub fn element_count(&self, ty: Handle<Type>) -> Option<u32> {
        match self.types[ty] {
            Type::Vector { size, .. } => Some(size.count()),
            Type::Matrix { columns, .. } => Some(columns.count()),
            Type::Array {
                size: ArraySize::Constant(n),
                ..
            } => Some(n),
            Type::Struct(def) => Some(self.structs[def].members.len() as u32),
            _ => None,
        }
    }

    /// The type produced by indexing into `ty` with `index` (a constant index
    /// is required for structs).
    pub fn member(&mut self, ty: Handle<Type>, index: Option<u32>) -> Option<Handle<Type>> {
        match self.types[ty] {
            Type::Struct(def) => {
                let idx = index? as usize;
                self.structs[def].members.get(idx).map(|m| m.ty)
            }
            _ => self.element(ty),
        }
    }

    /// Parts of a pointer type: `(space, store type, access)`.
    pub fn pointer_parts(&self, ty: Handle<Type>) -> Option<(AddressSpace, Handle<Type>, Access)> {
        match self.types[ty] {
            Type::Pointer {
                space,
                store,
                access,
            } => Some((space, store, access)),
            _ => None,
        }
    }

    pub fn store_type(&self, ty: Handle<Type>) -> Option<Handle<Type>> {
        self.pointer_parts(ty).map(|(_, store, _)| store)
    }

    /// Alignment in bytes under the host-shareable layout rules.
    pub fn align_of(&self, ty: Handle<Type>) -> u32 {
        match self.types[ty] {
            Type::Scalar(s) | Type::Atomic(s) => u32::from(s.width),
            Type::Vector { size, scalar } => {
                let n = if size == VectorSize::Tri { 4 } else { size.count() };
                n * u32::from(scalar.width)
            }
            Type::Matrix { rows, scalar, .. } => {
                let n = if rows == VectorSize::Tri { 4 } else { rows.count() };
                n * u32::from(scalar.width)
            }
            Type::Array { base, .. } => self.align_of(base),
            Type::Struct(def) => self.structs[def]
                .members
                .iter()
                .map(|m| self.align_of(m.ty))
                .max()
                .unwrap_or(1),
            _ => 1,
        }
    }

    /// Size in bytes under the host-shareable layout rules. Runtime-sized
    /// arrays report the size of one element.
    pub fn size_of(&self, ty: Handle<Type>) -> u32 {
        match self.types[ty] {
            Type::Scalar(s) | Type::Atomic(s) => u32::from(s.width),
            Type::Vector { size, scalar } => size.count() * u32::from(scalar.width),
            Type::Matrix { columns, rows, scalar } => {
                let col_align = if rows == VectorSize::Tri { 4 } else { rows.count() };
                columns.count() * col_align * u32::from(scalar.width)
            }
            Type::Array { base, size, stride } => {
                let stride = stride.unwrap_or_else(|| self.array_stride(base));
                match size {
                    ArraySize::Constant(n) => n * stride,
                    ArraySize::Runtime => stride,
                }
            }
            Type::Struct(def) => {
                let mut offset = 0;
                for member in &self.structs[def].members {
                    offset = round_up(offset, self.align_of(member.ty)) + self.size_of(member.ty);
                }
                round_up(offset, self.align_of(ty))
            }
            _ => 0,
        }
    }

    /// Stride of an array whose elements are of type `base`.
    pub fn array_stride(&self, base: Handle<Type>) -> u32 {
        round_up(self.size_of(base), self.align_of(base))
    }

    fn builtin_struct(
        &mut self,
        name: String,
        members: impl FnOnce(&mut Self) -> Vec<StructMember>,
    ) -> Handle<Type> {
        if let Some(&ty) = self.builtin_structs.get(&name) {
            return ty;
        }
        let members = members(self);
        let ty = self.new_struct(name.clone(), members);
        self.builtin_structs.insert(name, ty);
        ty
    }

    /// The result struct of `modf(ty)`: `{ fract: ty, whole: ty }`.
    pub fn modf_result(&mut self, ty: Handle<Type>) -> Handle<Type> {
        let name = format!("__modf_result_{}", self.mangle(ty));
        self.builtin_struct(name, |_| {
            vec![StructMember::new("fract", ty), StructMember::new("whole", ty)]
        })
    }

    /// The result struct of `frexp(ty)`: `{ fract: ty, exp: i32-shaped }`.
    pub fn frexp_result(&mut self, ty: Handle<Type>) -> Handle<Type> {
        let name = format!("__frexp_result_{}", self.mangle(ty));
        self.builtin_struct(name, |types| {
            let exp = types.with_scalar(ty, Scalar::I32);
            vec![StructMember::new("fract", ty), StructMember::new("exp", exp)]
        })
    }

    /// The result struct of `atomicCompareExchangeWeak` on `scalar`.
    pub fn atomic_compare_exchange_result(&mut self, scalar: Scalar) -> Handle<Type> {
        let ty = self.scalar(scalar);
        let name = format!("__atomic_compare_exchange_result_{}", self.mangle(ty));
        self.builtin_struct(name, |types| {
            let exchanged = types.bool();
            vec![
                StructMember::new("old_value", ty),
                StructMember::new("exchanged", exchanged),
            ]
        })
    }

    fn mangle(&self, ty: Handle<Type>) -> String {
        match self.types[ty] {
            Type::Vector { size, scalar } => format!("vec{}_{scalar}", size.count()),
            _ => self.name(ty),
        }
    }

    /// Human-readable, WGSL-like spelling of a type.
    pub fn name(&self, ty: Handle<Type>) -> String {
        match self.types[ty] {
            Type::Void => "void".into(),
            Type::Scalar(s) => s.to_string(),
            Type::Vector { size, scalar } => format!("vec{}<{scalar}>", size.count()),
            Type::Matrix {
                columns,
                rows,
                scalar,
            } => format!("mat{}x{}<{scalar}>", columns.count(), rows.count()),
            Type::Array { base, size, stride } => {
                let prefix = if stride.is_some() { "spirv.explicit_layout_array" } else { "array" };
                match size {
                    ArraySize::Constant(n) => format!("{prefix}<{}, {n}>", self.name(base)),
                    ArraySize::Runtime => format!("{prefix}<{}>", self.name(base)),
                }
            }
            Type::Struct(def) => self.structs[def].name.clone(),
            Type::Atomic(s) => format!("atomic<{s}>"),
            Type::Pointer {
                space,
                store,
                access,
            } => format!("ptr<{space}, {}, {access}>", self.name(store)),
            Type::SampledTexture { dim, sampled } => format!("texture_{dim}<{sampled}>"),
            Type::MultisampledTexture { dim, sampled } => {
                format!("texture_multisampled_{dim}<{sampled}>")
            }
            Type::DepthTexture { dim } => format!("texture_depth_{dim}"),
            Type::DepthMultisampledTexture { dim } => format!("texture_depth_multisampled_{dim}"),
            Type::StorageTexture {
                dim,
                format,
                access,
            } => format!("texture_storage_{dim}<{format:?}, {access}>"),
            Type::Sampler(SamplerKind::Sampler) => "sampler".into(),
            Type::Sampler(SamplerKind::Comparison) => "sampler_comparison".into(),
            Type::SampledImage { image } => format!("spirv.sampled_image<{}>", self.name(image)),
            Type::String => "string".into(),
        }
    }
}

fn round_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment.max(1)) * alignment.max(1)
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScalarKind::Bool => write!(f, "bool"),
            ScalarKind::Sint => write!(f, "i{}", u32::from(self.width) * 8),
            ScalarKind::Uint => write!(f, "u{}", u32::from(self.width) * 8),
            ScalarKind::Float => write!(f, "f{}", u32::from(self.width) * 8),
        }
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Function => "function",
            Self::Private => "private",
            Self::Workgroup => "workgroup",
            Self::Uniform => "uniform",
            Self::Storage => "storage",
            Self::Immediate => "immediate",
            Self::Handle => "handle",
        })
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read_write",
        })
    }
}

impl fmt::Display for TextureDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::D1 => "1d",
            Self::D2 => "2d",
            Self::D2Array => "2d_array",
            Self::D3 => "3d",
            Self::Cube => "cube",
            Self::CubeArray => "cube_array",
        })
    }
}
