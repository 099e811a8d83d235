//! Screen images.
//!
//! An [`Image`] is the 2D pixel array a screen device hands out for one shot. The pixel depth
//! is preserved so raw frames persist exactly as acquired; fit strategies work on the
//! `f64` view returned by [`Image::to_f64`].

use ndarray::Array2;

use crate::tree::{ArrayValue, Value};

/// Pixel depth of an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit monochrome.
    Mono8,
    /// 16-bit monochrome.
    Mono16,
    /// Floating point (processed or simulated frames).
    Float64,
}

impl PixelFormat {
    /// Format name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono16 => "Mono16",
            PixelFormat::Float64 => "Float64",
        }
    }
}

/// One acquired frame, indexed `[row, column]` (`[y, x]`).
#[derive(Debug, Clone, PartialEq)]
pub enum Image {
    /// 8-bit monochrome pixels.
    Mono8(Array2<u8>),
    /// 16-bit monochrome pixels.
    Mono16(Array2<u16>),
    /// Floating point pixels.
    Float64(Array2<f64>),
}

impl Image {
    /// Pixel depth.
    pub fn pixel_format(&self) -> PixelFormat {
        match self {
            Image::Mono8(_) => PixelFormat::Mono8,
            Image::Mono16(_) => PixelFormat::Mono16,
            Image::Float64(_) => PixelFormat::Float64,
        }
    }

    /// `(height, width)` in pixels.
    pub fn dim(&self) -> (usize, usize) {
        match self {
            Image::Mono8(a) => a.dim(),
            Image::Mono16(a) => a.dim(),
            Image::Float64(a) => a.dim(),
        }
    }

    /// True when the image has no pixels.
    pub fn is_empty(&self) -> bool {
        let (h, w) = self.dim();
        h == 0 || w == 0
    }

    /// Pixel values as `f64`.
    pub fn to_f64(&self) -> Array2<f64> {
        match self {
            Image::Mono8(a) => a.mapv(f64::from),
            Image::Mono16(a) => a.mapv(f64::from),
            Image::Float64(a) => a.clone(),
        }
    }
}

impl From<Array2<u8>> for Image {
    fn from(a: Array2<u8>) -> Self {
        Image::Mono8(a)
    }
}

impl From<Array2<u16>> for Image {
    fn from(a: Array2<u16>) -> Self {
        Image::Mono16(a)
    }
}

impl From<Array2<f64>> for Image {
    fn from(a: Array2<f64>) -> Self {
        Image::Float64(a)
    }
}

impl From<Image> for Value {
    fn from(image: Image) -> Self {
        let array: ArrayValue = match image {
            Image::Mono8(a) => a.into(),
            Image::Mono16(a) => a.into(),
            Image::Float64(a) => a.into(),
        };
        Value::Array(array)
    }
}

impl From<Image> for crate::tree::Node {
    fn from(image: Image) -> Self {
        crate::tree::Node::Value(image.into())
    }
}

impl TryFrom<&Value> for Image {
    type Error = String;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let to_2d = |shape: &[usize]| -> Result<(), String> {
            if shape.len() == 2 {
                Ok(())
            } else {
                Err(format!("expected a 2D array, found shape {shape:?}"))
            }
        };
        match value {
            Value::Array(ArrayValue::U8(a)) => {
                to_2d(a.shape())?;
                a.clone()
                    .into_dimensionality()
                    .map(Image::Mono8)
                    .map_err(|e| e.to_string())
            }
            Value::Array(ArrayValue::U16(a)) => {
                to_2d(a.shape())?;
                a.clone()
                    .into_dimensionality()
                    .map(Image::Mono16)
                    .map_err(|e| e.to_string())
            }
            Value::Array(ArrayValue::F64(a)) => {
                to_2d(a.shape())?;
                a.clone()
                    .into_dimensionality()
                    .map(Image::Float64)
                    .map_err(|e| e.to_string())
            }
            other => Err(format!("{} is not an image", other.kind())),
        }
    }
}
