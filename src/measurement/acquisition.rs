//! Acquisition loop.
//!
//! [`MeasurementLoop`] pulls exactly the requested number of images from a screen, strictly
//! one after another, and optionally fits each of them. Pull order defines the positional
//! keys (`image_0`, `image_1`, ...) of both branches of the result tree.
//!
//! The device gives no guarantee that consecutive pulls return distinct frames. A
//! [`FrameSync`] hook runs before every pull after the first; the default does nothing,
//! [`FixedDelay`] waits a fixed settle time.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::device::ScreenDevice;
use crate::error::{AppResult, MeasurementFailure, ProfileError};
use crate::fit::ImageFit;
use crate::image::Image;
use crate::tree::{shot_key, ResultTree};

/// Waits until the device is expected to hold a fresh frame.
#[async_trait]
pub trait FrameSync: Send + Sync {
    /// Called before pulling shot `shot` (never before shot 0).
    async fn wait_for_fresh_frame(&self, shot: usize);
}

/// No synchronisation between pulls.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWait;

#[async_trait]
impl FrameSync for NoWait {
    async fn wait_for_fresh_frame(&self, _shot: usize) {}
}

/// Fixed settle time between pulls.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

#[async_trait]
impl FrameSync for FixedDelay {
    async fn wait_for_fresh_frame(&self, shot: usize) {
        debug!(shot, delay_ms = duration_ms(self.0), "Waiting for fresh frame");
        tokio::time::sleep(self.0).await;
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Checks a requested shot count.
pub fn validate_shot_count(n_shots: i64) -> AppResult<usize> {
    usize::try_from(n_shots)
        .ok()
        .filter(|n| *n > 0)
        .ok_or(ProfileError::InvalidShotCount(n_shots))
}

/// Builds the `raw_images` branch from images in acquisition order.
pub fn raw_image_tree(images: Vec<Image>) -> ResultTree {
    images
        .into_iter()
        .enumerate()
        .map(|(shot, image)| (shot_key(shot), image.into()))
        .collect()
}

/// Sequential acquire-and-fit loop over one device.
pub struct MeasurementLoop<'a> {
    device: &'a dyn ScreenDevice,
    frame_sync: &'a dyn FrameSync,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> MeasurementLoop<'a> {
    /// Loop over `device` with no inter-pull synchronisation and no cancellation.
    pub fn new(device: &'a dyn ScreenDevice) -> Self {
        Self {
            device,
            frame_sync: &NoWait,
            cancel: None,
        }
    }

    /// Uses `frame_sync` between pulls.
    pub fn with_frame_sync(mut self, frame_sync: &'a dyn FrameSync) -> Self {
        self.frame_sync = frame_sync;
        self
    }

    /// Checks `token` before every pull.
    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Acquires and, when `fit` is given, fits `n_shots` images.
    ///
    /// Returns the canonical `{raw_images, fit_results}` tree. On a fit failure the error
    /// carries the raw images with `fit_results` null.
    pub async fn run(
        &self,
        fit: Option<&dyn ImageFit>,
        n_shots: i64,
    ) -> Result<ResultTree, MeasurementFailure> {
        let n_shots = validate_shot_count(n_shots)?;
        let images = self.acquire(n_shots).await?;
        assemble(fit, images)
    }

    /// Pulls exactly `n_shots` images in order.
    ///
    /// Fails, without truncating, on the first device error or on cancellation; the images
    /// already pulled are attached to the failure.
    pub async fn acquire(&self, n_shots: usize) -> Result<Vec<Image>, MeasurementFailure> {
        if n_shots == 0 {
            return Err(ProfileError::InvalidShotCount(0).into());
        }

        let device = self.device.name().to_string();
        info!(device = %device, n_shots, "Acquiring images");

        let mut images = Vec::with_capacity(n_shots);
        while images.len() < n_shots {
            let shot = images.len();
            if self.cancel.is_some_and(CancellationToken::is_cancelled) {
                info!(device = %device, acquired = shot, n_shots, "Acquisition cancelled");
                return Err(partial_failure(
                    ProfileError::Cancelled {
                        acquired: shot,
                        requested: n_shots,
                    },
                    images,
                ));
            }
            if shot > 0 {
                self.frame_sync.wait_for_fresh_frame(shot).await;
            }

            match self.device.image().await {
                Ok(image) => {
                    debug!(device = %device, shot, dim = ?image.dim(), "Image acquired");
                    images.push(image);
                }
                Err(source) => {
                    return Err(partial_failure(
                        ProfileError::DeviceAcquisition {
                            device,
                            shot,
                            source,
                        },
                        images,
                    ))
                }
            }
        }
        Ok(images)
    }
}

fn partial_failure(error: ProfileError, images: Vec<Image>) -> MeasurementFailure {
    if images.is_empty() {
        MeasurementFailure::new(error)
    } else {
        MeasurementFailure::with_partial(error, ResultTree::measurement(raw_image_tree(images), None))
    }
}

/// Builds the `{raw_images, fit_results}` tree from acquired images, fitting them first
/// when `fit` is given.
///
/// On a fit failure the error carries the raw images with `fit_results` null.
pub fn assemble(
    fit: Option<&dyn ImageFit>,
    images: Vec<Image>,
) -> Result<ResultTree, MeasurementFailure> {
    let fit_results = match fit {
        Some(fit) => match fit_images(fit, &images) {
            Ok(results) => Some(results),
            Err(error) => {
                return Err(MeasurementFailure::with_partial(
                    error,
                    ResultTree::measurement(raw_image_tree(images), None),
                ))
            }
        },
        None => None,
    };
    Ok(ResultTree::measurement(raw_image_tree(images), fit_results))
}

/// Fits every image in order, stopping at the first failure.
pub fn fit_images(fit: &dyn ImageFit, images: &[Image]) -> AppResult<ResultTree> {
    let mut results = ResultTree::new();
    for (shot, image) in images.iter().enumerate() {
        let result = fit
            .fit_image(image)
            .map_err(|source| ProfileError::FitFailed {
                fit: fit.name().to_string(),
                shot,
                source,
            })?;
        debug!(fit = fit.name(), shot, "Image fitted");
        results.insert(shot_key(shot), result.dump());
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MockScreen, MockScreenConfig};
    use crate::fit::ImageProjectionFit;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSync(AtomicUsize);

    #[async_trait]
    impl FrameSync for CountingSync {
        async fn wait_for_fresh_frame(&self, _shot: usize) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_validate_shot_count() {
        assert_eq!(validate_shot_count(4).unwrap(), 4);
        assert!(matches!(
            validate_shot_count(0),
            Err(ProfileError::InvalidShotCount(0))
        ));
        assert!(matches!(
            validate_shot_count(-3),
            Err(ProfileError::InvalidShotCount(-3))
        ));
    }

    #[tokio::test]
    async fn test_run_without_fit() {
        let screen = MockScreen::new("mock");
        let tree = MeasurementLoop::new(&screen).run(None, 4).await.unwrap();

        let raw = tree.raw_images().unwrap();
        assert_eq!(
            raw.keys().collect::<Vec<_>>(),
            vec!["image_0", "image_1", "image_2", "image_3"]
        );
        assert!(tree.get("fit_results").unwrap().is_null());
        assert_eq!(screen.frames_read(), 4);
    }

    #[tokio::test]
    async fn test_run_with_fit_matches_keys() {
        let screen = MockScreen::new("mock");
        let fit = ImageProjectionFit::default();
        let tree = MeasurementLoop::new(&screen)
            .run(Some(&fit), 3)
            .await
            .unwrap();

        let raw: Vec<_> = tree.raw_images().unwrap().keys().collect();
        let fits: Vec<_> = tree.fit_results().unwrap().keys().collect();
        assert_eq!(raw, fits);
    }

    #[tokio::test]
    async fn test_frame_sync_between_pulls_only() {
        let screen = MockScreen::new("mock");
        let sync = CountingSync::default();
        MeasurementLoop::new(&screen)
            .with_frame_sync(&sync)
            .acquire(5)
            .await
            .unwrap();
        assert_eq!(sync.0.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_waits() {
        let screen = MockScreen::new("mock");
        let delay = FixedDelay(Duration::from_millis(200));
        let start = tokio::time::Instant::now();
        MeasurementLoop::new(&screen)
            .with_frame_sync(&delay)
            .acquire(3)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn test_duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(250)), 250);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_assemble_fit_failure_keeps_raw_images() {
        let dark = MockScreenConfig {
            amplitude: 0.0,
            ..MockScreenConfig::default()
        };
        let screen = MockScreen::with_config("mock", dark);
        let images = MeasurementLoop::new(&screen).acquire(2).await.unwrap();

        let failure = assemble(Some(&ImageProjectionFit::default()), images).unwrap_err();
        assert!(matches!(failure.error, ProfileError::FitFailed { shot: 0, .. }));
        let partial = failure.partial.unwrap();
        assert_eq!(partial.raw_images().unwrap().len(), 2);
        assert!(partial.get("fit_results").unwrap().is_null());
    }

    #[tokio::test]
    async fn test_device_failure_aborts_with_partial_images() {
        let screen = MockScreen::new("mock").failing_on(2);
        let failure = MeasurementLoop::new(&screen)
            .run(None, 5)
            .await
            .unwrap_err();

        match &failure.error {
            ProfileError::DeviceAcquisition { shot, .. } => assert_eq!(*shot, 2),
            other => panic!("unexpected error: {other}"),
        }
        let partial = failure.partial.unwrap();
        assert_eq!(partial.raw_images().unwrap().len(), 2);
        assert_eq!(screen.frames_read(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_shot() {
        let screen = MockScreen::new("mock");
        let token = CancellationToken::new();
        token.cancel();
        let failure = MeasurementLoop::new(&screen)
            .with_cancellation(&token)
            .run(None, 3)
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            ProfileError::Cancelled {
                acquired: 0,
                requested: 3
            }
        ));
        assert!(failure.partial.is_none());
        assert_eq!(screen.frames_read(), 0);
    }
}
