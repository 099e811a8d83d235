//! Projection fit: the default strategy.
//!
//! The image is summed onto the x and y axes. Each projection gets a background estimate
//! removed and is then characterised by its Gaussian-equivalent centroid and RMS size,
//! computed from the first and second moments of the remaining signal.

use ndarray::{arr1, Array1, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use super::{finite_pixels, FitError, FitResult, FitSpec, ImageFit};
use crate::error::{AppResult, ProfileError};
use crate::image::Image;
use crate::tree::ResultTree;

/// Fraction of each projection, at either end, sampled to estimate noise.
const EDGE_FRACTION: f64 = 0.1;

/// Parameters of [`ImageProjectionFit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProjectionParams {
    /// Minimum ratio of projection peak to edge noise for a valid fit.
    pub signal_to_noise_threshold: f64,
    /// Subtract the projection minimum before taking moments.
    pub subtract_background: bool,
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            signal_to_noise_threshold: 2.0,
            subtract_background: true,
        }
    }
}

/// Fits the x and y projections of an image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageProjectionFit {
    params: ProjectionParams,
}

/// Statistics of one projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisProfile {
    /// Centroid in pixels.
    pub centroid: f64,
    /// RMS size in pixels.
    pub rms_size: f64,
    /// Peak height above background.
    pub amplitude: f64,
}

/// Output of [`ImageProjectionFit`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionFitResult {
    /// Horizontal profile.
    pub x: AxisProfile,
    /// Vertical profile.
    pub y: AxisProfile,
    /// Sum of all pixels.
    pub total_intensity: f64,
    /// Column sums.
    pub x_projection: Array1<f64>,
    /// Row sums.
    pub y_projection: Array1<f64>,
}

impl ImageProjectionFit {
    /// Strategy with the given parameters.
    pub fn new(params: ProjectionParams) -> AppResult<Self> {
        let threshold = params.signal_to_noise_threshold;
        if threshold.is_nan() || threshold < 0.0 {
            return Err(ProfileError::Configuration(format!(
                "signal_to_noise_threshold must be non-negative, got {}",
                params.signal_to_noise_threshold
            )));
        }
        Ok(Self { params })
    }

    /// Strategy built from a configuration record.
    pub fn from_spec(spec: &FitSpec) -> AppResult<Self> {
        Self::new(spec.parse_params()?)
    }

    /// Parameters in use.
    pub fn params(&self) -> &ProjectionParams {
        &self.params
    }

    fn fit_axis(&self, projection: ArrayView1<f64>, axis: &str) -> Result<AxisProfile, FitError> {
        let background = if self.params.subtract_background {
            projection.fold(f64::INFINITY, |acc, &v| acc.min(v))
        } else {
            0.0
        };
        let signal = projection.mapv(|v| (v - background).max(0.0));

        let total = signal.sum();
        let amplitude = signal.fold(0.0_f64, |acc, &v| acc.max(v));
        if total <= 0.0 || amplitude <= 0.0 {
            return Err(FitError::NoSignal(format!("{axis} projection is flat")));
        }

        let noise = edge_noise(signal.view());
        if noise > 0.0 && amplitude / noise < self.params.signal_to_noise_threshold {
            return Err(FitError::NoSignal(format!(
                "{axis} projection peak/noise {:.2} below threshold {:.2}",
                amplitude / noise,
                self.params.signal_to_noise_threshold
            )));
        }

        let centroid = signal
            .indexed_iter()
            .map(|(i, &w)| i as f64 * w)
            .sum::<f64>()
            / total;
        let variance = signal
            .indexed_iter()
            .map(|(i, &w)| (i as f64 - centroid).powi(2) * w)
            .sum::<f64>()
            / total;

        Ok(AxisProfile {
            centroid,
            rms_size: variance.sqrt(),
            amplitude,
        })
    }
}

/// Standard deviation of the samples at both ends of a projection.
fn edge_noise(signal: ArrayView1<f64>) -> f64 {
    let n = signal.len();
    let edge = ((n as f64 * EDGE_FRACTION).ceil() as usize).max(1);
    if 2 * edge >= n {
        return 0.0;
    }
    let samples: Vec<f64> = signal
        .iter()
        .take(edge)
        .chain(signal.iter().skip(n - edge))
        .copied()
        .collect();
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    var.sqrt()
}

impl ImageFit for ImageProjectionFit {
    fn name(&self) -> &'static str {
        "ImageProjectionFit"
    }

    fn fit_image(&self, image: &Image) -> Result<Box<dyn FitResult>, FitError> {
        let pixels = finite_pixels(image)?;
        let x_projection = pixels.sum_axis(Axis(0));
        let y_projection = pixels.sum_axis(Axis(1));

        let x = self.fit_axis(x_projection.view(), "x")?;
        let y = self.fit_axis(y_projection.view(), "y")?;

        Ok(Box::new(ProjectionFitResult {
            x,
            y,
            total_intensity: pixels.sum(),
            x_projection,
            y_projection,
        }))
    }

    fn spec(&self) -> FitSpec {
        FitSpec::from_params(self.name(), &self.params)
    }
}

impl FitResult for ProjectionFitResult {
    fn dump(&self) -> ResultTree {
        let mut tree = ResultTree::new();
        tree.insert("centroid", arr1(&[self.x.centroid, self.y.centroid]))
            .insert("rms_size", arr1(&[self.x.rms_size, self.y.rms_size]))
            .insert("amplitude", arr1(&[self.x.amplitude, self.y.amplitude]))
            .insert("total_intensity", self.total_intensity)
            .insert("x_projection", self.x_projection.clone())
            .insert("y_projection", self.y_projection.clone());
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{ArrayValue, Value};
    use ndarray::Array2;

    fn gaussian_spot(cx: f64, cy: f64, sigma: f64) -> Image {
        Image::from(Array2::from_shape_fn((64, 80), |(y, x)| {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            1000.0 * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
        }))
    }

    #[test]
    fn test_recovers_gaussian_spot() {
        let fit = ImageProjectionFit::default();
        let result = fit.fit_image(&gaussian_spot(30.0, 25.0, 4.0)).unwrap();
        let tree = result.dump();

        let Some(Value::Array(ArrayValue::F64(centroid))) = tree.value("centroid") else {
            panic!("centroid missing");
        };
        let centroid: Vec<f64> = centroid.iter().copied().collect();
        assert!((centroid[0] - 30.0).abs() < 0.1);
        assert!((centroid[1] - 25.0).abs() < 0.1);

        let Some(Value::Array(ArrayValue::F64(rms))) = tree.value("rms_size") else {
            panic!("rms_size missing");
        };
        let rms: Vec<f64> = rms.iter().copied().collect();
        assert!((rms[0] - 4.0).abs() < 0.2, "x rms {}", rms[0]);
        assert!((rms[1] - 4.0).abs() < 0.2, "y rms {}", rms[1]);

        assert_eq!(
            tree.keys().collect::<Vec<_>>(),
            vec![
                "centroid",
                "rms_size",
                "amplitude",
                "total_intensity",
                "x_projection",
                "y_projection"
            ]
        );
    }

    #[test]
    fn test_flat_image_has_no_signal() {
        let fit = ImageProjectionFit::default();
        let err = fit
            .fit_image(&Image::from(Array2::<u16>::from_elem((16, 16), 100)))
            .unwrap_err();
        assert!(matches!(err, FitError::NoSignal(_)));
    }

    #[test]
    fn test_empty_image_rejected() {
        let fit = ImageProjectionFit::default();
        let err = fit
            .fit_image(&Image::from(Array2::<u8>::zeros((0, 0))))
            .unwrap_err();
        assert_eq!(err, FitError::EmptyImage);
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let params = ProjectionParams {
            signal_to_noise_threshold: -1.0,
            ..Default::default()
        };
        assert!(ImageProjectionFit::new(params).is_err());
    }
}
