//! Value representations: plain, calibrated and quantized.
//!
//! A calibrated representation is the pre-lowering description of a float
//! tensor together with its observed dynamic range. Lowering turns it into
//! either a float representation of a narrower width (which keeps the range)
//! or into a quantized representation with scale and zero point.

use std::fmt;

use crate::ElementKind;

/// Closed interval `[min, max]` observed for a tensor during calibration.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Range {
    min: f64,
    max: f64,
}

impl Range {
    /// Panics if `min > max`. Use [`Range::try_new`] for untrusted input.
    pub fn new(min: f64, max: f64) -> Self {
        crate::invariants::ensure_ordered_range(min, max);
        Self { min, max }
    }

    pub fn try_new(min: f64, max: f64) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Negative lower bound. Zero counts as non-negative.
    pub fn is_signed(&self) -> bool {
        self.min < 0.0
    }

    pub fn abs_max(&self) -> f64 {
        self.min.abs().max(self.max.abs())
    }

    pub fn union(&self, other: &Range) -> Range {
        Range {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn with_min(&self, min: f64) -> Option<Range> {
        Range::try_new(min, self.max)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// How a value is stored and interpreted.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Representation {
    Plain {
        elem: ElementKind,
    },
    Calibrated {
        elem: ElementKind,
        range: Range,
    },
    Quantized {
        storage: ElementKind,
        scale: f64,
        zero_point: i64,
        #[serde(default)]
        asymmetric: bool,
    },
}

impl Representation {
    pub fn plain(elem: ElementKind) -> Self {
        Self::Plain { elem }
    }

    pub fn calibrated(elem: ElementKind, min: f64, max: f64) -> Self {
        Self::Calibrated {
            elem,
            range: Range::new(min, max),
        }
    }

    pub fn with_range(elem: ElementKind, range: Range) -> Self {
        Self::Calibrated { elem, range }
    }

    /// Element kind the value occupies in memory.
    pub fn storage(&self) -> ElementKind {
        match self {
            Self::Plain { elem } | Self::Calibrated { elem, .. } => *elem,
            Self::Quantized { storage, .. } => *storage,
        }
    }

    pub fn range(&self) -> Option<Range> {
        match self {
            Self::Calibrated { range, .. } => Some(*range),
            _ => None,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        matches!(self, Self::Calibrated { .. })
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized { .. })
    }

    /// Same representation with the storage kind replaced. Calibration
    /// survives, quantization parameters do not.
    pub fn retyped(&self, elem: ElementKind) -> Self {
        match self {
            Self::Calibrated { range, .. } => Self::Calibrated {
                elem,
                range: *range,
            },
            _ => Self::Plain { elem },
        }
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain { elem } => write!(f, "{elem}"),
            Self::Calibrated { elem, range } => write!(f, "{elem}{range}"),
            Self::Quantized {
                storage,
                scale,
                zero_point,
                asymmetric,
            } => {
                write!(f, "{storage}<{scale}")?;
                if *zero_point != 0 || *asymmetric {
                    write!(f, ":{zero_point}")?;
                }
                f.write_str(">")
            }
        }
    }
}
