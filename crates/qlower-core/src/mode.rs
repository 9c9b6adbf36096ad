//! Execution modes and hardware families.

use std::fmt;
use std::str::FromStr;

use crate::ElementKind;

/// Execution precision of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    F32,
    F16,
    Bf16,
    Int8,
    Uint8,
    Int4,
    F8e4m3,
    F8e5m2,
    W8f16,
    W4f16,
    W8bf16,
    W4bf16,
}

impl Mode {
    pub const ALL: [Mode; 12] = [
        Mode::F32,
        Mode::F16,
        Mode::Bf16,
        Mode::Int8,
        Mode::Uint8,
        Mode::Int4,
        Mode::F8e4m3,
        Mode::F8e5m2,
        Mode::W8f16,
        Mode::W4f16,
        Mode::W8bf16,
        Mode::W4bf16,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::Bf16 => "BF16",
            Self::Int8 => "INT8",
            Self::Uint8 => "UINT8",
            Self::Int4 => "INT4",
            Self::F8e4m3 => "F8E4M3",
            Self::F8e5m2 => "F8E5M2",
            Self::W8f16 => "W8F16",
            Self::W4f16 => "W4F16",
            Self::W8bf16 => "W8BF16",
            Self::W4bf16 => "W4BF16",
        }
    }

    pub fn is_f16_family(self) -> bool {
        matches!(self, Self::F16 | Self::W8f16 | Self::W4f16)
    }

    pub fn is_bf16_family(self) -> bool {
        matches!(self, Self::Bf16 | Self::W8bf16 | Self::W4bf16)
    }

    pub fn is_f8(self) -> bool {
        matches!(self, Self::F8e4m3 | Self::F8e5m2)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int8 | Self::Uint8 | Self::Int4)
    }

    /// Element kind of activations for the float modes.
    pub fn activation_kind(self) -> Option<ElementKind> {
        match self {
            Self::F32 => Some(ElementKind::F32),
            Self::F16 | Self::W8f16 | Self::W4f16 => Some(ElementKind::F16),
            Self::Bf16 | Self::W8bf16 | Self::W4bf16 => Some(ElementKind::Bf16),
            Self::F8e5m2 => Some(ElementKind::F8e5m2),
            Self::Int8 | Self::Uint8 | Self::Int4 | Self::F8e4m3 => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mode keyword `{0}`")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.keyword().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownMode(s.to_owned()))
    }
}

/// Hardware family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chip {
    Bm1684x,
    Bm1688,
    Bm1684,
    Cv183x,
    Cv182x,
    Cv181x,
    Cv180x,
    Sg2260,
}

impl Chip {
    pub const ALL: [Chip; 8] = [
        Chip::Bm1684x,
        Chip::Bm1688,
        Chip::Bm1684,
        Chip::Cv183x,
        Chip::Cv182x,
        Chip::Cv181x,
        Chip::Cv180x,
        Chip::Sg2260,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Bm1684x => "bm1684x",
            Self::Bm1688 => "bm1688",
            Self::Bm1684 => "bm1684",
            Self::Cv183x => "cv183x",
            Self::Cv182x => "cv182x",
            Self::Cv181x => "cv181x",
            Self::Cv180x => "cv180x",
            Self::Sg2260 => "sg2260",
        }
    }

    pub fn is_bm1684x_family(self) -> bool {
        matches!(self, Self::Bm1684x | Self::Bm1688)
    }

    pub fn is_bm1684_family(self) -> bool {
        matches!(self, Self::Bm1684)
    }

    pub fn is_cv18xx(self) -> bool {
        matches!(
            self,
            Self::Cv183x | Self::Cv182x | Self::Cv181x | Self::Cv180x
        )
    }

    pub fn is_sg2260_family(self) -> bool {
        matches!(self, Self::Sg2260)
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown chip `{0}`")]
pub struct UnknownChip(pub String);

impl FromStr for Chip {
    type Err = UnknownChip;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Chip::ALL
            .into_iter()
            .find(|chip| chip.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownChip(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("w4bf16".parse::<Mode>(), Ok(Mode::W4bf16));
        assert_eq!("Int8".parse::<Mode>(), Ok(Mode::Int8));
        assert_eq!("F8E4M3".parse::<Mode>(), Ok(Mode::F8e4m3));
        assert_eq!(
            "INT16".parse::<Mode>(),
            Err(UnknownMode("INT16".to_owned()))
        );
    }

    #[test]
    fn mode_keywords_roundtrip() {
        for mode in Mode::ALL {
            assert_eq!(mode.keyword().parse::<Mode>(), Ok(mode));
        }
    }

    #[test]
    fn mode_families() {
        assert!(Mode::W8f16.is_f16_family());
        assert!(!Mode::W8f16.is_bf16_family());
        assert!(Mode::W4bf16.is_bf16_family());
        assert!(Mode::F8e5m2.is_f8());
        assert!(Mode::Int4.is_integer());
        assert_eq!(Mode::W4f16.activation_kind(), Some(ElementKind::F16));
        assert_eq!(Mode::Int8.activation_kind(), None);
    }

    #[test]
    fn chip_families() {
        assert_eq!("CV183X".parse::<Chip>(), Ok(Chip::Cv183x));
        assert!(Chip::Bm1688.is_bm1684x_family());
        assert!(Chip::Cv180x.is_cv18xx());
        assert!(!Chip::Sg2260.is_bm1684x_family());
        assert!("bm1690".parse::<Chip>().is_err());
    }

    #[test]
    fn mode_serializes_as_keyword() {
        let json = serde_json::to_string(&Mode::W8bf16).unwrap();
        assert_eq!(json, "\"W8BF16\"");
    }
}
