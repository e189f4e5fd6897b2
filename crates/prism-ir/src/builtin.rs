//! Builtin function tags, one closed enum per dialect.

use std::fmt;

/// Core builtins.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum CoreBuiltin {
    Abs,
    All,
    Any,
    ArrayLength,
    AtomicAdd,
    AtomicAnd,
    AtomicCompareExchangeWeak,
    AtomicExchange,
    AtomicLoad,
    AtomicMax,
    AtomicMin,
    AtomicOr,
    AtomicStore,
    AtomicSub,
    AtomicXor,
    Clamp,
    Cos,
    CountLeadingZeros,
    CountOneBits,
    CountTrailingZeros,
    Cross,
    Determinant,
    Distance,
    Dot,
    Exp,
    ExtractBits,
    FaceForward,
    FirstLeadingBit,
    FirstTrailingBit,
    Floor,
    Fma,
    Fract,
    Frexp,
    InsertBits,
    InverseSqrt,
    Ldexp,
    Length,
    Log,
    Max,
    Min,
    Mix,
    Modf,
    Normalize,
    Pack2x16Float,
    Pow,
    /// Debug print of a single value.
    Print,
    QuantizeToF16,
    Reflect,
    Refract,
    Select,
    Sign,
    Sin,
    Sqrt,
    StorageBarrier,
    TextureBarrier,
    TextureDimensions,
    TextureGather,
    TextureGatherCompare,
    TextureLoad,
    TextureNumLayers,
    TextureNumLevels,
    TextureNumSamples,
    TextureSample,
    TextureSampleBias,
    TextureSampleCompare,
    TextureSampleCompareLevel,
    TextureSampleGrad,
    TextureSampleLevel,
    TextureStore,
    Transpose,
    Unpack2x16Float,
    WorkgroupBarrier,
}

/// Builtins produced by the SPIR-V reader, plus the intrinsics consumed by
/// the SPIR-V writer (`*Times*`).
///
/// Signedness-parameterized builtins take the requested signedness as their
/// first explicit type; a missing explicit type means "same as the first
/// argument".
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum SpirvBuiltin {
    Add,
    BitCount,
    BitFieldInsert,
    BitFieldSExtract,
    BitFieldUExtract,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    ConvertFToS,
    ConvertSToF,
    ConvertUToF,
    Equal,
    FaceForward,
    FindILsb,
    FindSMsb,
    FindUMsb,
    FMod,
    Frexp,
    Inverse,
    Ldexp,
    Modf,
    Mul,
    Normalize,
    Not,
    NotEqual,
    OuterProduct,
    Reflect,
    Refract,
    SAbs,
    SClamp,
    SDiv,
    SGreaterThan,
    SGreaterThanEqual,
    ShiftLeftLogical,
    ShiftRightArithmetic,
    ShiftRightLogical,
    SLessThan,
    SLessThanEqual,
    SMax,
    SMin,
    SMod,
    SNegate,
    Sub,
    UClamp,
    UDiv,
    UGreaterThan,
    UGreaterThanEqual,
    ULessThan,
    ULessThanEqual,
    UMax,
    UMin,
    UMod,

    /// `OpSampledImage(texture, sampler)`.
    SampledImage,
    /// `OpImage(sampled_image)`: the texture half of a combined handle.
    Image,
    ImageDrefGather,
    ImageFetch,
    ImageGather,
    ImageQueryLevels,
    ImageQuerySamples,
    ImageQuerySize,
    ImageQuerySizeLod,
    ImageRead,
    ImageSampleDrefExplicitLod,
    ImageSampleDrefImplicitLod,
    ImageSampleExplicitLod,
    ImageSampleImplicitLod,
    ImageSampleProjDrefExplicitLod,
    ImageSampleProjDrefImplicitLod,
    ImageSampleProjExplicitLod,
    ImageSampleProjImplicitLod,
    ImageWrite,

    MatrixTimesMatrix,
    MatrixTimesScalar,
    MatrixTimesVector,
    VectorTimesMatrix,
    VectorTimesScalar,
}

impl SpirvBuiltin {
    /// Image operations that consume a combined image/sampler or a texture.
    pub fn is_image_op(self) -> bool {
        matches!(
            self,
            Self::ImageDrefGather
                | Self::ImageFetch
                | Self::ImageGather
                | Self::ImageQueryLevels
                | Self::ImageQuerySamples
                | Self::ImageQuerySize
                | Self::ImageQuerySizeLod
                | Self::ImageRead
                | Self::ImageSampleDrefExplicitLod
                | Self::ImageSampleDrefImplicitLod
                | Self::ImageSampleExplicitLod
                | Self::ImageSampleImplicitLod
                | Self::ImageSampleProjDrefExplicitLod
                | Self::ImageSampleProjDrefImplicitLod
                | Self::ImageSampleProjExplicitLod
                | Self::ImageSampleProjImplicitLod
                | Self::ImageWrite
        )
    }

    /// Operations comparing against a depth reference.
    pub fn is_depth_compare(self) -> bool {
        matches!(
            self,
            Self::ImageDrefGather
                | Self::ImageSampleDrefExplicitLod
                | Self::ImageSampleDrefImplicitLod
                | Self::ImageSampleProjDrefExplicitLod
                | Self::ImageSampleProjDrefImplicitLod
        )
    }
}

/// Mask of optional image operands following the mask argument of a SPIR-V
/// image operation. Operand values appear in ascending bit order.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct ImageOperands(u32);

impl ImageOperands {
    pub const NONE: Self = Self(0);
    pub const BIAS: Self = Self(0x1);
    pub const LOD: Self = Self(0x2);
    /// Two operands: `ddx`, `ddy`.
    pub const GRAD: Self = Self(0x4);
    pub const CONST_OFFSET: Self = Self(0x8);
    pub const OFFSET: Self = Self(0x10);
    pub const SAMPLE: Self = Self(0x40);
    /// Every operand the core texture builtins can express.
    pub const SUPPORTED: Self = Self(0x1 | 0x2 | 0x4 | 0x8 | 0x10 | 0x40);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bits outside [`Self::SUPPORTED`].
    pub fn unsupported(self) -> Self {
        Self(self.0 & !Self::SUPPORTED.0)
    }

    /// Number of operand values following the mask, counting supported bits.
    pub fn operand_count(self) -> usize {
        let count = (self.0 & Self::SUPPORTED.0).count_ones() as usize;
        if self.contains(Self::GRAD) { count + 1 } else { count }
    }
}

impl std::ops::BitOr for ImageOperands {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// GLSL-target builtins.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum GlslBuiltin {
    AtomicCompSwap,
    AtomicSub,
    Barrier,
    BitCount,
    BitfieldExtract,
    BitfieldInsert,
    Frexp,
    MemoryBarrierBuffer,
    MemoryBarrierImage,
    Mix,
    Modf,
    PackHalf2X16,
    UnpackHalf2X16,
}

/// HLSL-target builtins.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum HlslBuiltin {
    WaveGetLaneCount,
    WaveGetLaneIndex,
}

/// MSL-target builtins.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum MslBuiltin {
    /// `os_log_default.log(format, args..)`.
    OsLog,
}

/// A builtin function tag from any dialect.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Builtin {
    Core(CoreBuiltin),
    Spirv(SpirvBuiltin),
    Glsl(GlslBuiltin),
    Hlsl(HlslBuiltin),
    Msl(MslBuiltin),
}

impl Builtin {
    pub fn is_core(self) -> bool {
        matches!(self, Self::Core(_))
    }
}

impl From<CoreBuiltin> for Builtin {
    fn from(b: CoreBuiltin) -> Self {
        Self::Core(b)
    }
}

impl From<SpirvBuiltin> for Builtin {
    fn from(b: SpirvBuiltin) -> Self {
        Self::Spirv(b)
    }
}

impl From<GlslBuiltin> for Builtin {
    fn from(b: GlslBuiltin) -> Self {
        Self::Glsl(b)
    }
}

impl From<HlslBuiltin> for Builtin {
    fn from(b: HlslBuiltin) -> Self {
        Self::Hlsl(b)
    }
}

impl From<MslBuiltin> for Builtin {
    fn from(b: MslBuiltin) -> Self {
        Self::Msl(b)
    }
}

/// Lower-cases the first character of a variant name.
fn camel(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) => c.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Core(b) => f.write_str(&camel(&format!("{b:?}"))),
            Self::Spirv(b) => write!(f, "spirv.{}", camel(&format!("{b:?}"))),
            Self::Glsl(b) => write!(f, "glsl.{}", camel(&format!("{b:?}"))),
            Self::Hlsl(b) => write!(f, "hlsl.{b:?}"),
            Self::Msl(MslBuiltin::OsLog) => f.write_str("msl.os_log"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names() {
        assert_eq!(Builtin::from(CoreBuiltin::TextureSample).to_string(), "textureSample");
        assert_eq!(Builtin::from(SpirvBuiltin::SAbs).to_string(), "spirv.sAbs");
        assert_eq!(Builtin::from(GlslBuiltin::BitCount).to_string(), "glsl.bitCount");
        assert_eq!(
            Builtin::from(HlslBuiltin::WaveGetLaneIndex).to_string(),
            "hlsl.WaveGetLaneIndex"
        );
    }

    #[test]
    fn image_operand_mask() {
        let mask = ImageOperands::BIAS | ImageOperands::CONST_OFFSET;
        assert!(mask.contains(ImageOperands::BIAS));
        assert!(!mask.contains(ImageOperands::LOD));
        assert_eq!(mask.bits(), 0x9);
        assert!(ImageOperands::NONE.is_empty());
    }

    #[test]
    fn depth_compare_ops() {
        assert!(SpirvBuiltin::ImageDrefGather.is_depth_compare());
        assert!(!SpirvBuiltin::ImageGather.is_depth_compare());
        assert!(SpirvBuiltin::ImageFetch.is_image_op());
        assert!(!SpirvBuiltin::SampledImage.is_image_op());
    }
}
