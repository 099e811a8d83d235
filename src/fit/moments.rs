//! Second-moment fit of the full 2D image.
//!
//! Pixels below `threshold_fraction` of the peak are discarded, the threshold is removed
//! from the rest, and the beam is described by the centroid, the second central moments,
//! and the tilt of the resulting RMS ellipse.

use ndarray::arr1;
use serde::{Deserialize, Serialize};

use super::{finite_pixels, FitError, FitResult, FitSpec, ImageFit};
use crate::error::{AppResult, ProfileError};
use crate::image::Image;
use crate::tree::ResultTree;

/// Parameters of [`ImageMomentsFit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MomentsParams {
    /// Fraction of the peak pixel value below which pixels are ignored, in `[0, 1)`.
    pub threshold_fraction: f64,
}

impl Default for MomentsParams {
    fn default() -> Self {
        Self {
            threshold_fraction: 0.05,
        }
    }
}

/// Thresholded 2D moments fit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMomentsFit {
    params: MomentsParams,
}

/// Output of [`ImageMomentsFit`]. Coordinates are pixels, `x` along columns.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentsFitResult {
    /// `[x, y]` centroid.
    pub centroid: [f64; 2],
    /// Second central moment along x.
    pub sigma_xx: f64,
    /// Second central moment along y.
    pub sigma_yy: f64,
    /// Mixed second central moment.
    pub sigma_xy: f64,
    /// Ellipse tilt from the x axis, radians.
    pub tilt_angle: f64,
    /// Sum of the thresholded signal.
    pub total_intensity: f64,
}

impl ImageMomentsFit {
    /// Strategy with the given parameters.
    pub fn new(params: MomentsParams) -> AppResult<Self> {
        if !(0.0..1.0).contains(&params.threshold_fraction) {
            return Err(ProfileError::Configuration(format!(
                "threshold_fraction must be in [0, 1), got {}",
                params.threshold_fraction
            )));
        }
        Ok(Self { params })
    }

    /// Strategy built from a configuration record.
    pub fn from_spec(spec: &FitSpec) -> AppResult<Self> {
        Self::new(spec.parse_params()?)
    }
}

impl ImageFit for ImageMomentsFit {
    fn name(&self) -> &'static str {
        "ImageMomentsFit"
    }

    fn fit_image(&self, image: &Image) -> Result<Box<dyn FitResult>, FitError> {
        let pixels = finite_pixels(image)?;
        let peak = pixels.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        if peak <= 0.0 {
            return Err(FitError::NoSignal(format!("peak pixel value is {peak}")));
        }

        let threshold = peak * self.params.threshold_fraction;
        let weights = pixels.mapv(|v| (v - threshold).max(0.0));
        let total: f64 = weights.sum();
        if total <= 0.0 {
            return Err(FitError::NoSignal(format!(
                "no pixels above threshold {threshold}"
            )));
        }

        let (mut sx, mut sy) = (0.0, 0.0);
        for ((y, x), &w) in weights.indexed_iter() {
            sx += x as f64 * w;
            sy += y as f64 * w;
        }
        let (cx, cy) = (sx / total, sy / total);

        let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
        for ((y, x), &w) in weights.indexed_iter() {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            sxx += dx * dx * w;
            syy += dy * dy * w;
            sxy += dx * dy * w;
        }
        let (sxx, syy, sxy) = (sxx / total, syy / total, sxy / total);

        Ok(Box::new(MomentsFitResult {
            centroid: [cx, cy],
            sigma_xx: sxx,
            sigma_yy: syy,
            sigma_xy: sxy,
            tilt_angle: 0.5 * (2.0 * sxy).atan2(sxx - syy),
            total_intensity: total,
        }))
    }

    fn spec(&self) -> FitSpec {
        FitSpec::from_params(self.name(), &self.params)
    }
}

impl FitResult for MomentsFitResult {
    fn dump(&self) -> ResultTree {
        let mut tree = ResultTree::new();
        tree.insert("centroid", arr1(&self.centroid))
            .insert("sigma_xx", self.sigma_xx)
            .insert("sigma_yy", self.sigma_yy)
            .insert("sigma_xy", self.sigma_xy)
            .insert("tilt_angle", self.tilt_angle)
            .insert("total_intensity", self.total_intensity);
        tree
    }
}
