//! Beam-profile fit strategies.
//!
//! A fit strategy implements [`ImageFit`]: it turns one [`Image`] into a [`FitResult`], and
//! every result can [dump](FitResult::dump) itself into a flat tree of scalar and array
//! leaves for persistence.
//!
//! Strategies are selected from configuration by a `{type = "<name>", ...params}` record
//! ([`FitSpec`]). The set of types is closed: [`FitKind`] maps each known name to its
//! constructor and anything else is rejected with
//! [`ProfileError::UnknownFitType`](crate::error::ProfileError::UnknownFitType).
//! Each call to [`build_fit`] constructs a fresh instance, so no strategy state is shared
//! between measurements.

pub mod moments;
pub mod projection;

use std::fmt;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::error::{AppResult, ProfileError};
use crate::image::Image;
use crate::tree::ResultTree;

pub use moments::{ImageMomentsFit, MomentsFitResult};
pub use projection::{ImageProjectionFit, ProjectionFitResult};

/// Why a fit could not produce a result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// The image has no pixels.
    #[error("image is empty")]
    EmptyImage,

    /// A pixel is NaN or infinite.
    #[error("non-finite pixel at row {row}, column {column}")]
    NonFinitePixel {
        /// Pixel row.
        row: usize,
        /// Pixel column.
        column: usize,
    },

    /// Nothing in the image stands out from the background.
    #[error("no beam signal found: {0}")]
    NoSignal(String),

    /// The fit did not converge.
    #[error("fit did not converge: {0}")]
    NotConverged(String),
}

/// Structured output of one fit.
pub trait FitResult: fmt::Debug + Send + Sync {
    /// Flattens the result into string-keyed scalar and array leaves.
    fn dump(&self) -> ResultTree;
}

/// A beam-profile fitting algorithm.
pub trait ImageFit: fmt::Debug + Send + Sync {
    /// Registered type name.
    fn name(&self) -> &'static str;

    /// Fits one image.
    fn fit_image(&self, image: &Image) -> Result<Box<dyn FitResult>, FitError>;

    /// The configuration record that rebuilds this strategy.
    fn spec(&self) -> FitSpec;
}

/// Configuration record selecting a fit strategy: `{type = "<name>", ...params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSpec {
    /// Registered type name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Strategy parameters.
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl FitSpec {
    /// Record for `kind` with default parameters.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: serde_json::Map::new(),
        }
    }

    /// Adds one parameter.
    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Builds the spec of a strategy from its serializable parameters.
    pub(crate) fn from_params<P: Serialize>(kind: &str, params: &P) -> Self {
        let params = match serde_json::to_value(params) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            kind: kind.to_string(),
            params,
        }
    }

    /// Deserializes the parameters into a strategy's typed parameter struct.
    pub(crate) fn parse_params<P: DeserializeOwned>(&self) -> AppResult<P> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone())).map_err(|e| {
            ProfileError::Configuration(format!("invalid parameters for '{}': {e}", self.kind))
        })
    }
}

impl Default for FitSpec {
    fn default() -> Self {
        Self::new(FitKind::ImageProjection.name())
    }
}

/// The known fit strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitKind {
    /// [`ImageProjectionFit`].
    ImageProjection,
    /// [`ImageMomentsFit`].
    ImageMoments,
}

impl FitKind {
    /// Every registered kind.
    pub const ALL: [FitKind; 2] = [FitKind::ImageProjection, FitKind::ImageMoments];

    /// Type name used in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            FitKind::ImageProjection => "ImageProjectionFit",
            FitKind::ImageMoments => "ImageMomentsFit",
        }
    }

    /// All type names.
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(FitKind::name).collect()
    }

    /// Constructs a fresh strategy of this kind from `spec`'s parameters.
    pub fn build(&self, spec: &FitSpec) -> AppResult<Box<dyn ImageFit>> {
        match self {
            FitKind::ImageProjection => {
                Ok(Box::new(ImageProjectionFit::from_spec(spec)?) as Box<dyn ImageFit>)
            }
            FitKind::ImageMoments => Ok(Box::new(ImageMomentsFit::from_spec(spec)?)),
        }
    }
}

impl FromStr for FitKind {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| ProfileError::UnknownFitType(s.to_string()))
    }
}

/// Resolves a configuration record into a fresh fit strategy.
pub fn build_fit(spec: &FitSpec) -> AppResult<Box<dyn ImageFit>> {
    spec.kind.parse::<FitKind>()?.build(spec)
}

/// Validates an image and returns its pixels as `f64`.
pub(crate) fn finite_pixels(image: &Image) -> Result<ndarray::Array2<f64>, FitError> {
    if image.is_empty() {
        return Err(FitError::EmptyImage);
    }
    let pixels = image.to_f64();
    if let Some(((row, column), _)) = pixels.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(FitError::NonFinitePixel { row, column });
    }
    Ok(pixels)
}
