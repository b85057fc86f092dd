//! Decoded payloads and the decode primitive

use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use image::{ImageReader, Limits, RgbaImage};

use crate::error::{ResourceError, ResourceResult};
use crate::params::DecodeParams;

/// Bytes per decoded pixel (RGBA8).
pub const BYTES_PER_PIXEL: usize = 4;

/// Largest width or height accepted from an image header.
pub const MAX_DECODE_DIMENSION: u32 = 16_384;

/// Ceiling on what the decoder may allocate for one image.
pub const MAX_DECODE_ALLOC: u64 = 256 * 1024 * 1024;

/// Limits applied to every [`ImageDecoder`] read.
///
/// Images are decoded at full resolution before scaling, so these bound the
/// transient buffer rather than the cached cost.
pub fn decode_limits() -> Limits {
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_DECODE_DIMENSION);
    limits.max_image_height = Some(MAX_DECODE_DIMENSION);
    limits.max_alloc = Some(MAX_DECODE_ALLOC);
    limits
}

/// A decoded image shared between the cache and its readers.
#[derive(Clone)]
pub struct DecodedImage {
    pixels: Arc<RgbaImage>,
}

impl DecodedImage {
    pub fn new(pixels: RgbaImage) -> Self {
        Self {
            pixels: Arc::new(pixels),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// In-memory size in bytes.
    pub fn cost(&self) -> usize {
        self.width() as usize * self.height() as usize * BYTES_PER_PIXEL
    }

    /// Whether both handles point at the same pixel buffer.
    pub fn ptr_eq(&self, other: &DecodedImage) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// Turns encoded bytes into a [`DecodedImage`].
pub trait Decoder: Send + Sync {
    fn decode(&self, bytes: &[u8], params: &DecodeParams) -> ResourceResult<DecodedImage>;

    /// Decode a file. Read errors surface as decode failures.
    fn decode_file(&self, path: &Path, params: &DecodeParams) -> ResourceResult<DecodedImage> {
        let bytes = std::fs::read(path).map_err(|err| {
            ResourceError::DecodeFailure(format!("{}: {err}", path.display()))
        })?;
        self.decode(&bytes, params)
    }
}

/// Default decoder backed by the `image` crate.
///
/// Reads the header first so bad requests, empty images and images beyond
/// [`decode_limits`] fail before any pixel buffer is allocated.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl ImageDecoder {
    fn reader<'a>(
        bytes: &'a [u8],
        limits: &Limits,
    ) -> ResourceResult<ImageReader<Cursor<&'a [u8]>>> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|err| ResourceError::DecodeFailure(err.to_string()))?;
        reader.limits(limits.clone());
        Ok(reader)
    }

    fn decode_within(
        bytes: &[u8],
        params: &DecodeParams,
        limits: &Limits,
    ) -> ResourceResult<DecodedImage> {
        params.validate()?;

        let (width, height) = Self::reader(bytes, limits)?.into_dimensions()?;
        if width == 0 || height == 0 {
            return Err(ResourceError::DecodeFailure(format!(
                "image has no pixels ({width}x{height})"
            )));
        }

        let (target_w, target_h) = params.target_size(width, height);
        let image = Self::reader(bytes, limits)?.decode()?;

        let image = if (target_w, target_h) == (width, height) {
            image
        } else {
            image.resize_exact(target_w, target_h, params.scaling.filter())
        };

        Ok(DecodedImage::new(image.into_rgba8()))
    }
}

impl Decoder for ImageDecoder {
    fn decode(&self, bytes: &[u8], params: &DecodeParams) -> ResourceResult<DecodedImage> {
        Self::decode_within(bytes, params, &decode_limits())
    }
}
