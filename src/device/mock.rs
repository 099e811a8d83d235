//! Mock screen
//!
//! Simulated beam-diagnostic screen for demos and tests without hardware. Each pull renders
//! a Gaussian beam spot with optional noise and advances a frame counter.
//!
//! Uses async-safe timing (`tokio::time::sleep`, not `std::thread::sleep`) when a readout
//! delay is configured.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use ndarray::Array2;
use rand::Rng;
use tracing::trace;

use super::ScreenDevice;
use crate::image::{Image, PixelFormat};

/// Beam and sensor parameters of a [`MockScreen`].
#[derive(Debug, Clone, PartialEq)]
pub struct MockScreenConfig {
    /// Frame width in pixels.
    pub width: usize,
    /// Frame height in pixels.
    pub height: usize,
    /// Beam centroid `(x, y)` in pixels.
    pub centroid: (f64, f64),
    /// Beam RMS size `(x, y)` in pixels.
    pub sigma: (f64, f64),
    /// Peak intensity in counts.
    pub amplitude: f64,
    /// Constant background in counts.
    pub background: f64,
    /// Uniform noise amplitude in counts (0 = deterministic frames).
    pub noise: f64,
    /// Pixel depth of produced frames.
    pub pixel_format: PixelFormat,
    /// Simulated readout time per frame.
    pub readout: Duration,
}

impl Default for MockScreenConfig {
    fn default() -> Self {
        Self {
            width: 128,
            height: 96,
            centroid: (64.0, 48.0),
            sigma: (8.0, 5.0),
            amplitude: 3000.0,
            background: 40.0,
            noise: 0.0,
            pixel_format: PixelFormat::Mono16,
            readout: Duration::ZERO,
        }
    }
}

/// Simulated screen.
///
/// # Example
///
/// ```rust,ignore
/// let screen = MockScreen::new("OTRS:IN20:571");
/// let image = screen.image().await?;
/// assert_eq!(screen.frames_read(), 1);
/// ```
#[derive(Debug)]
pub struct MockScreen {
    name: String,
    config: MockScreenConfig,
    frame_count: AtomicU64,
    fail_on_frame: Option<u64>,
}

impl MockScreen {
    /// Screen with the default beam.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, MockScreenConfig::default())
    }

    /// Screen with a custom beam and sensor.
    pub fn with_config(name: impl Into<String>, config: MockScreenConfig) -> Self {
        Self {
            name: name.into(),
            config,
            frame_count: AtomicU64::new(0),
            fail_on_frame: None,
        }
    }

    /// Makes the pull with zero-based index `frame` fail, simulating a readout fault.
    pub fn failing_on(mut self, frame: u64) -> Self {
        self.fail_on_frame = Some(frame);
        self
    }

    /// Number of pulls so far, failed ones included.
    pub fn frames_read(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Beam and sensor parameters.
    pub fn config(&self) -> &MockScreenConfig {
        &self.config
    }

    fn render(&self) -> Array2<f64> {
        let c = &self.config;
        let mut rng = rand::thread_rng();
        Array2::from_shape_fn((c.height, c.width), |(y, x)| {
            let dx = (x as f64 - c.centroid.0) / c.sigma.0;
            let dy = (y as f64 - c.centroid.1) / c.sigma.1;
            let spot = c.amplitude * (-0.5 * (dx * dx + dy * dy)).exp();
            let noise = if c.noise > 0.0 {
                rng.gen_range(-c.noise..c.noise)
            } else {
                0.0
            };
            (c.background + spot + noise).max(0.0)
        })
    }
}

#[async_trait]
impl ScreenDevice for MockScreen {
    fn name(&self) -> &str {
        &self.name
    }

    async fn image(&self) -> Result<Image> {
        let frame = self.frame_count.fetch_add(1, Ordering::SeqCst);
        if !self.config.readout.is_zero() {
            tokio::time::sleep(self.config.readout).await;
        }
        if self.fail_on_frame == Some(frame) {
            bail!("{}: readout fault on frame {}", self.name, frame);
        }

        let pixels = self.render();
        trace!(screen = %self.name, frame, "Frame rendered");
        Ok(match self.config.pixel_format {
            PixelFormat::Mono8 => Image::Mono8(pixels.mapv(|v| v.round().min(255.0) as u8)),
            PixelFormat::Mono16 => Image::Mono16(pixels.mapv(|v| v.round().min(65535.0) as u16)),
            PixelFormat::Float64 => Image::Float64(pixels),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_counted() {
        let screen = MockScreen::new("mock");
        tokio_test::block_on(async {
            for _ in 0..3 {
                screen.image().await.unwrap();
            }
        });
        assert_eq!(screen.frames_read(), 3);
    }

    #[tokio::test]
    async fn test_default_frame_shape_and_peak() {
        let screen = MockScreen::new("mock");
        let image = screen.image().await.unwrap();
        assert_eq!(image.dim(), (96, 128));
        assert_eq!(image.pixel_format(), PixelFormat::Mono16);

        let pixels = image.to_f64();
        assert_eq!(pixels[[48, 64]], 3040.0);
        assert_eq!(pixels[[0, 0]], 40.0);
    }

    #[tokio::test]
    async fn test_noiseless_frames_are_identical() {
        let screen = MockScreen::new("mock");
        let a = screen.image().await.unwrap();
        let b = screen.image().await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_injected_fault() {
        let screen = MockScreen::new("mock").failing_on(1);
        assert!(screen.image().await.is_ok());
        let err = screen.image().await.unwrap_err();
        assert!(err.to_string().contains("readout fault on frame 1"));
        assert!(screen.image().await.is_ok());
    }

    #[tokio::test]
    async fn test_noise_stays_in_bounds() {
        let config = MockScreenConfig {
            amplitude: 0.0,
            background: 100.0,
            noise: 5.0,
            pixel_format: PixelFormat::Float64,
            ..Default::default()
        };
        let image = MockScreen::with_config("noisy", config).image().await.unwrap();
        let pixels = image.to_f64();
        assert!(pixels.iter().all(|v| (95.0..=105.0).contains(v)));
    }
}
