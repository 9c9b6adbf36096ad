//! Element kinds carried by tensor values.

use std::fmt;

/// Scalar storage kind of a tensor element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    F32,
    F16,
    Bf16,
    F8e4m3,
    F8e5m2,
    I32,
    I16,
    U16,
    I8,
    U8,
    I4,
}

impl ElementKind {
    pub fn bit_width(self) -> u32 {
        match self {
            Self::F32 | Self::I32 => 32,
            Self::F16 | Self::Bf16 | Self::I16 | Self::U16 => 16,
            Self::F8e4m3 | Self::F8e5m2 | Self::I8 | Self::U8 => 8,
            Self::I4 => 4,
        }
    }

    /// Storage width in whole bytes, never zero.
    pub fn byte_width(self) -> u32 {
        self.bit_width().div_ceil(8)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::I32 | Self::I16 | Self::U16 | Self::I8 | Self::U8 | Self::I4
        )
    }

    pub fn is_float(self) -> bool {
        !self.is_integer()
    }

    pub fn is_f8(self) -> bool {
        matches!(self, Self::F8e4m3 | Self::F8e5m2)
    }

    pub fn is_signed(self) -> bool {
        !matches!(self, Self::U16 | Self::U8)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::F8e4m3 => "f8e4m3",
            Self::F8e5m2 => "f8e5m2",
            Self::I32 => "i32",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I4 => "i4",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
