//! Decode parameters and cache key composition
//!
//! A cached payload is only reusable for a request that asks for the same
//! source decoded the same way, so the key folds every decode dimension in.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

/// Resampling quality used when an image is downscaled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingMode {
    #[default]
    Unspecified,
    NearestNeighbor,
    Linear,
    Fant,
    HighQuality,
}

impl ScalingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::NearestNeighbor => "nearest-neighbor",
            Self::Linear => "linear",
            Self::Fant => "fant",
            Self::HighQuality => "high-quality",
        }
    }

    pub(crate) fn filter(self) -> image::imageops::FilterType {
        use image::imageops::FilterType;
        match self {
            Self::NearestNeighbor => FilterType::Nearest,
            Self::Unspecified | Self::Linear => FilterType::Triangle,
            Self::Fant => FilterType::CatmullRom,
            Self::HighQuality => FilterType::Lanczos3,
        }
    }
}

impl fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScalingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unspecified" | "default" => Ok(Self::Unspecified),
            "nearest-neighbor" | "nearest" => Ok(Self::NearestNeighbor),
            "linear" => Ok(Self::Linear),
            "fant" => Ok(Self::Fant),
            "high-quality" | "high" => Ok(Self::HighQuality),
            other => Err(format!("unknown scaling mode '{other}'")),
        }
    }
}

/// Display scale factors applied to the requested bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DpiScale {
    pub x: f64,
    pub y: f64,
}

impl DpiScale {
    pub const IDENTITY: DpiScale = DpiScale { x: 1.0, y: 1.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn uniform(scale: f64) -> Self {
        Self { x: scale, y: scale }
    }

    fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.x > 0.0 && self.y > 0.0
    }
}

impl Default for DpiScale {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// How a source should be decoded.
///
/// `None` bounds leave that axis unconstrained. Images are only ever
/// shrunk to fit the bounds, never enlarged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodeParams {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub dpi: Option<DpiScale>,
    pub scaling: ScalingMode,
}

impl DecodeParams {
    /// Decode at the source's native size.
    pub fn original() -> Self {
        Self::default()
    }

    pub fn with_max_width(mut self, width: u32) -> Self {
        self.max_width = Some(width);
        self
    }

    pub fn with_max_height(mut self, height: u32) -> Self {
        self.max_height = Some(height);
        self
    }

    pub fn with_dpi(mut self, dpi: DpiScale) -> Self {
        self.dpi = Some(dpi);
        self
    }

    pub fn with_scaling(mut self, scaling: ScalingMode) -> Self {
        self.scaling = scaling;
        self
    }

    /// Reject bounds no decode could satisfy.
    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.max_width == Some(0) || self.max_height == Some(0) {
            return Err(ResourceError::DecodeFailure(
                "requested dimensions must be non-zero".to_string(),
            ));
        }
        if let Some(dpi) = self.dpi {
            if !dpi.is_valid() {
                return Err(ResourceError::DecodeFailure(format!(
                    "invalid dpi scale {}x{}",
                    dpi.x, dpi.y
                )));
            }
        }
        Ok(())
    }

    /// Bounds in device pixels after applying the DPI scale.
    pub fn device_bounds(&self) -> (Option<u32>, Option<u32>) {
        let dpi = self.dpi.unwrap_or_default();
        let scale = |bound: Option<u32>, factor: f64| {
            bound.map(|b| ((b as f64 * factor).round() as u32).max(1))
        };
        (scale(self.max_width, dpi.x), scale(self.max_height, dpi.y))
    }

    /// Output size for a source of `width` x `height`.
    ///
    /// Preserves aspect ratio and never upscales.
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        let (bound_w, bound_h) = self.device_bounds();

        let mut scale = 1.0f64;
        if let Some(bound) = bound_w {
            if width > bound {
                scale = scale.min(bound as f64 / width as f64);
            }
        }
        if let Some(bound) = bound_h {
            if height > bound {
                scale = scale.min(bound as f64 / height as f64);
            }
        }

        if scale >= 1.0 {
            return (width, height);
        }

        let fit = |len: u32, bound: Option<u32>| {
            let scaled = ((len as f64 * scale).round() as u32).max(1);
            bound.map_or(scaled, |b| scaled.min(b))
        };
        (fit(width, bound_w), fit(height, bound_h))
    }
}

/// Identity of a cached decode: the source plus every decode dimension.
///
/// DPI factors are quantized to thousandths so the key is hashable; the
/// exact parameters travel as entry metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    source: Arc<str>,
    max_width: Option<u32>,
    max_height: Option<u32>,
    dpi_milli: Option<(u32, u32)>,
    scaling: ScalingMode,
}

impl ResourceKey {
    pub fn new(source: &str, params: &DecodeParams) -> Self {
        let quantize = |v: f64| {
            (v * 1000.0)
                .round()
                .clamp(0.0, u32::MAX as f64) as u32
        };
        Self {
            source: Arc::from(source),
            max_width: params.max_width,
            max_height: params.max_height,
            dpi_milli: params.dpi.map(|dpi| (quantize(dpi.x), quantize(dpi.y))),
            scaling: params.scaling,
        }
    }

    /// The logical source this key was derived from.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dim = |v: Option<u32>| v.unwrap_or(0);
        write!(
            f,
            "{}|{}x{}|",
            self.source,
            dim(self.max_width),
            dim(self.max_height)
        )?;
        if let Some((x, y)) = self.dpi_milli {
            write!(f, "{}x{}", x as f64 / 1000.0, y as f64 / 1000.0)?;
        }
        write!(f, "|{}", self.scaling)
    }
}
