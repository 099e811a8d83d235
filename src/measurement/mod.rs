//! Screen beam-profile measurement.
//!
//! [`ScreenBeamProfileMeasurement`] owns everything one measurement needs: the screen, the
//! fit strategy, whether to fit and whether to persist, and where to. Each call to
//! [`measure`](ScreenBeamProfileMeasurement::measure) runs
//!
//! ```text
//! Idle -> Acquiring -> (Fitting) -> (Persisting) -> Idle
//! ```
//!
//! from scratch; nothing is cached between calls. Progress can be observed through
//! [`subscribe_state`](ScreenBeamProfileMeasurement::subscribe_state).
//!
//! ## Cancellation
//!
//! Every run gets a child of the measurement's parent token.
//! [`RunCanceller::cancel`] stops the run in progress and leaves later runs alone.
//! Cancelling the parent (see [`MeasurementBuilder::cancellation`]) stops the current run
//! and every later one.
//!
//! ## Failure policy
//!
//! Errors are never retried. A failed call returns a [`MeasurementFailure`] carrying the
//! results gathered so far: the raw images if fitting failed, the complete tree if only
//! persistence failed. Nothing is persisted when acquisition or fitting fails.

pub mod acquisition;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::MeasurementConfig;
use crate::device::ScreenDevice;
use crate::error::{AppResult, MeasurementFailure, ProfileError};
use crate::fit::{build_fit, ImageFit, ImageProjectionFit};
use crate::storage::{HierarchicalStore, StorageBackend};
use crate::tree::ResultTree;

pub use acquisition::{
    assemble, duration_ms, fit_images, raw_image_tree, validate_shot_count, FixedDelay,
    FrameSync, MeasurementLoop, NoWait,
};

/// Phase of a running measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementState {
    /// Not measuring.
    Idle,
    /// Pulling images from the screen.
    Acquiring,
    /// Fitting acquired images.
    Fitting,
    /// Writing the result tree.
    Persisting,
}

impl fmt::Display for MeasurementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MeasurementState::Idle => "idle",
            MeasurementState::Acquiring => "acquiring",
            MeasurementState::Fitting => "fitting",
            MeasurementState::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

/// Cancels whichever run of one measurement is in progress.
#[derive(Debug, Clone)]
pub struct RunCanceller(watch::Receiver<CancellationToken>);

impl RunCanceller {
    /// Stops the current run before its next shot. Does nothing between runs.
    pub fn cancel(&self) {
        self.0.borrow().cancel();
    }
}

/// Repeated screen acquisition with optional fitting and persistence.
pub struct ScreenBeamProfileMeasurement {
    name: String,
    device: Arc<dyn ScreenDevice>,
    beam_fit: Box<dyn ImageFit>,
    n_shots: i64,
    fit_profile: bool,
    save_data: bool,
    destination: Option<PathBuf>,
    backend: StorageBackend,
    store: Box<dyn HierarchicalStore>,
    frame_sync: Box<dyn FrameSync>,
    settle: Option<Duration>,
    cancel: CancellationToken,
    run_token: watch::Sender<CancellationToken>,
    state: watch::Sender<MeasurementState>,
    last_saved: Option<PathBuf>,
}

impl fmt::Debug for ScreenBeamProfileMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScreenBeamProfileMeasurement")
            .field("name", &self.name)
            .field("device", &self.device.name())
            .field("beam_fit", &self.beam_fit)
            .field("n_shots", &self.n_shots)
            .field("fit_profile", &self.fit_profile)
            .field("save_data", &self.save_data)
            .field("destination", &self.destination)
            .field("store", &self.store.name())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl ScreenBeamProfileMeasurement {
    /// Starts building a measurement on `device`.
    pub fn builder(device: Arc<dyn ScreenDevice>) -> MeasurementBuilder {
        MeasurementBuilder::new(device)
    }

    /// Builds a measurement from configuration, resolving the fit strategy.
    pub fn from_config(device: Arc<dyn ScreenDevice>, config: &MeasurementConfig) -> AppResult<Self> {
        config.validate()?;
        let mut builder = Self::builder(device)
            .name(&config.name)
            .beam_fit(build_fit(&config.beam_fit)?)
            .n_shots(config.n_shots)
            .fit_profile(config.fit_profile)
            .save_data(config.save_data)
            .backend(config.backend);
        if let Some(destination) = &config.destination {
            builder = builder.destination(destination);
        }
        if let Some(settle) = config.settle_time() {
            builder = builder.settle(settle);
        }
        builder.build()
    }

    /// Configuration that rebuilds this measurement.
    ///
    /// A custom frame sync or store has no configuration form: it is reported as no settle
    /// time and as the selected built-in backend respectively.
    pub fn to_config(&self) -> MeasurementConfig {
        MeasurementConfig {
            name: self.name.clone(),
            n_shots: self.n_shots,
            fit_profile: self.fit_profile,
            save_data: self.save_data,
            destination: self.destination.clone(),
            backend: self.backend,
            settle_ms: self.settle.map_or(0, duration_ms),
            beam_fit: self.beam_fit.spec(),
        }
    }

    /// Measurement name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fit strategy in use.
    pub fn beam_fit(&self) -> &dyn ImageFit {
        self.beam_fit.as_ref()
    }

    /// Shots taken by [`measure_configured`](Self::measure_configured).
    pub fn n_shots(&self) -> i64 {
        self.n_shots
    }

    /// Whether images are fitted.
    pub fn fit_profile(&self) -> bool {
        self.fit_profile
    }

    /// Whether results are persisted.
    pub fn save_data(&self) -> bool {
        self.save_data
    }

    /// Configured destination.
    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// File written by the last successful save.
    pub fn last_saved(&self) -> Option<&Path> {
        self.last_saved.as_deref()
    }

    /// Current phase.
    pub fn state(&self) -> MeasurementState {
        *self.state.borrow()
    }

    /// Receiver that observes phase changes.
    pub fn subscribe_state(&self) -> watch::Receiver<MeasurementState> {
        self.state.subscribe()
    }

    /// Handle that cancels the run in progress.
    pub fn canceller(&self) -> RunCanceller {
        RunCanceller(self.run_token.subscribe())
    }

    fn enter(&self, state: MeasurementState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Measurement state changed");
        }
    }

    /// Acquires `n_shots` images, fits them if enabled, persists if enabled, and returns
    /// the `{raw_images, fit_results}` tree.
    pub async fn measure(&mut self, n_shots: i64) -> Result<ResultTree, MeasurementFailure> {
        let span = info_span!("measure", measurement = %self.name, n_shots);
        let outcome = self.run(n_shots).instrument(span).await;
        self.enter(MeasurementState::Idle);
        outcome
    }

    /// [`measure`](Self::measure) with the configured shot count.
    pub async fn measure_configured(&mut self) -> Result<ResultTree, MeasurementFailure> {
        self.measure(self.n_shots).await
    }

    async fn run(&mut self, n_shots: i64) -> Result<ResultTree, MeasurementFailure> {
        let n_shots = validate_shot_count(n_shots)?;

        let token = self.cancel.child_token();
        self.run_token.send_replace(token.clone());

        self.enter(MeasurementState::Acquiring);
        let images = MeasurementLoop::new(self.device.as_ref())
            .with_frame_sync(self.frame_sync.as_ref())
            .with_cancellation(&token)
            .acquire(n_shots)
            .await?;

        let fit: Option<&dyn ImageFit> = self.fit_profile.then(|| self.beam_fit.as_ref());
        if fit.is_some() {
            self.enter(MeasurementState::Fitting);
        }
        let tree = assemble(fit, images)
            .inspect_err(|failure| warn!(error = %failure.error, "Fit failed, nothing persisted"))?;

        if self.save_data {
            self.enter(MeasurementState::Persisting);
            let Some(destination) = self.destination.clone() else {
                return Err(MeasurementFailure::with_partial(
                    ProfileError::Configuration("save_data is enabled but no destination is set".into()),
                    tree,
                ));
            };
            match self.store.save(&tree, &destination) {
                Ok(path) => self.last_saved = Some(path),
                Err(error) => {
                    warn!(error = %error, "Persisting results failed, returning them in memory");
                    return Err(MeasurementFailure::with_partial(error, tree));
                }
            }
        }

        info!(
            shots = n_shots,
            fitted = self.fit_profile,
            saved = ?self.last_saved.as_ref().filter(|_| self.save_data),
            "Measurement complete"
        );
        Ok(tree)
    }
}

/// Builder for [`ScreenBeamProfileMeasurement`].
pub struct MeasurementBuilder {
    name: String,
    device: Arc<dyn ScreenDevice>,
    beam_fit: Option<Box<dyn ImageFit>>,
    n_shots: i64,
    fit_profile: bool,
    save_data: bool,
    destination: Option<PathBuf>,
    backend: StorageBackend,
    store: Option<Box<dyn HierarchicalStore>>,
    frame_sync: Option<Box<dyn FrameSync>>,
    settle: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl MeasurementBuilder {
    fn new(device: Arc<dyn ScreenDevice>) -> Self {
        Self {
            name: "beam_profile".to_string(),
            device,
            beam_fit: None,
            n_shots: 1,
            fit_profile: true,
            save_data: false,
            destination: None,
            backend: StorageBackend::default(),
            store: None,
            frame_sync: None,
            settle: None,
            cancel: None,
        }
    }

    /// Measurement name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Fit strategy; defaults to a fresh [`ImageProjectionFit`].
    pub fn beam_fit(mut self, beam_fit: Box<dyn ImageFit>) -> Self {
        self.beam_fit = Some(beam_fit);
        self
    }

    /// Shot count for [`ScreenBeamProfileMeasurement::measure_configured`] (default 1).
    /// Checked when measuring.
    pub fn n_shots(mut self, n_shots: i64) -> Self {
        self.n_shots = n_shots;
        self
    }

    /// Whether to fit each image (default `true`).
    pub fn fit_profile(mut self, enabled: bool) -> Self {
        self.fit_profile = enabled;
        self
    }

    /// Whether to persist results (default `false`).
    pub fn save_data(mut self, enabled: bool) -> Self {
        self.save_data = enabled;
        self
    }

    /// Persistence destination.
    pub fn destination(mut self, destination: impl AsRef<Path>) -> Self {
        self.destination = Some(destination.as_ref().to_path_buf());
        self
    }

    /// Enables persistence to `destination`.
    pub fn save_to(self, destination: impl AsRef<Path>) -> Self {
        self.save_data(true).destination(destination)
    }

    /// Built-in storage backend (default [`StorageBackend::Container`]).
    pub fn backend(mut self, backend: StorageBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Custom store, replacing the one selected by [`backend`](Self::backend).
    pub fn store(mut self, store: Box<dyn HierarchicalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Custom synchronisation between pulls.
    pub fn frame_sync(mut self, frame_sync: Box<dyn FrameSync>) -> Self {
        self.frame_sync = Some(frame_sync);
        self
    }

    /// Fixed settle time between pulls. Ignored when a custom frame sync is set.
    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = Some(settle);
        self
    }

    /// Parent token for every run. Cancelling it stops the current run and all later ones.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Validates and builds.
    pub fn build(self) -> AppResult<ScreenBeamProfileMeasurement> {
        if self.save_data && self.destination.is_none() {
            return Err(ProfileError::Configuration(
                "save_data is enabled but no destination is set".into(),
            ));
        }
        self.backend.ensure_available()?;

        let settle = match self.frame_sync {
            Some(_) => None,
            None => self.settle.filter(|d| !d.is_zero()),
        };
        let frame_sync: Box<dyn FrameSync> = match (self.frame_sync, self.settle) {
            (Some(sync), _) => sync,
            (None, Some(settle)) if !settle.is_zero() => Box::new(FixedDelay(settle)),
            (None, _) => Box::new(NoWait),
        };
        let (state, _) = watch::channel(MeasurementState::Idle);

        Ok(ScreenBeamProfileMeasurement {
            name: self.name,
            device: self.device,
            beam_fit: self
                .beam_fit
                .unwrap_or_else(|| Box::new(ImageProjectionFit::default())),
            n_shots: self.n_shots,
            fit_profile: self.fit_profile,
            save_data: self.save_data,
            destination: self.destination,
            backend: self.backend,
            store: self.store.unwrap_or_else(|| self.backend.store()),
            frame_sync,
            settle,
            cancel: self.cancel.unwrap_or_default(),
            run_token: watch::channel(CancellationToken::new()).0,
            state,
            last_saved: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MockScreen, MockScreenConfig};
    use crate::fit::FitSpec;
    use crate::tree::Node;
    use tracing_test::traced_test;

    fn screen() -> Arc<MockScreen> {
        Arc::new(MockScreen::new("OTRS:IN20:571"))
    }

    #[test]
    fn test_save_requires_destination() {
        let err = ScreenBeamProfileMeasurement::builder(screen())
            .save_data(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, ProfileError::Configuration(_)));
    }

    #[test]
    fn test_default_fit_is_projection_fit() {
        let measurement = ScreenBeamProfileMeasurement::builder(screen()).build().unwrap();
        assert_eq!(measurement.beam_fit().name(), "ImageProjectionFit");
        assert_eq!(measurement.beam_fit().spec(), ImageProjectionFit::default().spec());
        assert!(measurement.fit_profile());
        assert!(!measurement.save_data());
    }

    #[test]
    fn test_config_round_trip() {
        let config = MeasurementConfig {
            name: "OTR2".into(),
            n_shots: 4,
            fit_profile: false,
            save_data: true,
            destination: Some(PathBuf::from("out/otr2.bpc")),
            backend: StorageBackend::Container,
            settle_ms: 50,
            beam_fit: FitSpec::new("ImageMomentsFit").with_param("threshold_fraction", 0.25),
        };
        let measurement = ScreenBeamProfileMeasurement::from_config(screen(), &config).unwrap();
        assert_eq!(measurement.beam_fit().name(), "ImageMomentsFit");
        assert_eq!(measurement.n_shots(), 4);
        assert_eq!(measurement.to_config(), config);
    }

    #[test]
    fn test_custom_frame_sync_reports_no_settle() {
        let measurement = ScreenBeamProfileMeasurement::builder(screen())
            .settle(Duration::from_millis(80))
            .frame_sync(Box::new(NoWait))
            .build()
            .unwrap();
        assert_eq!(measurement.to_config().settle_ms, 0);

        let measurement = ScreenBeamProfileMeasurement::builder(screen())
            .settle(Duration::from_millis(80))
            .build()
            .unwrap();
        assert_eq!(measurement.to_config().settle_ms, 80);
    }

    #[test]
    fn test_unavailable_backend_rejected() {
        let result = ScreenBeamProfileMeasurement::builder(screen())
            .backend(StorageBackend::Hdf5)
            .build();
        assert_eq!(result.is_ok(), StorageBackend::Hdf5.is_available());
    }

    #[tokio::test]
    async fn test_measure_configured_uses_stored_count() {
        let device = screen();
        let mut measurement = ScreenBeamProfileMeasurement::builder(device.clone())
            .n_shots(3)
            .fit_profile(false)
            .build()
            .unwrap();
        let tree = measurement.measure_configured().await.unwrap();
        assert_eq!(tree.raw_images().unwrap().len(), 3);
        assert_eq!(device.frames_read(), 3);
    }

    #[tokio::test]
    async fn test_state_returns_to_idle() {
        let mut measurement = ScreenBeamProfileMeasurement::builder(screen())
            .fit_profile(false)
            .build()
            .unwrap();
        let mut states = measurement.subscribe_state();

        measurement.measure(2).await.unwrap();
        assert_eq!(measurement.state(), MeasurementState::Idle);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), MeasurementState::Idle);

        assert!(measurement.measure(0).await.is_err());
        assert_eq!(measurement.state(), MeasurementState::Idle);
    }

    #[tokio::test]
    async fn test_each_call_is_a_full_run() {
        let device = screen();
        let mut measurement = ScreenBeamProfileMeasurement::builder(device.clone())
            .fit_profile(false)
            .build()
            .unwrap();
        measurement.measure(2).await.unwrap();
        measurement.measure(2).await.unwrap();
        assert_eq!(device.frames_read(), 4);
    }

    #[tokio::test]
    async fn test_fit_enabled_fills_both_branches() {
        let mut measurement = ScreenBeamProfileMeasurement::builder(screen()).build().unwrap();
        let tree = measurement.measure(3).await.unwrap();

        let fits = tree.fit_results().unwrap();
        assert_eq!(fits.len(), 3);
        let first = fits.group("image_0").unwrap();
        assert!(matches!(first.get("centroid"), Some(Node::Value(_))));
    }

    #[tokio::test]
    async fn test_parent_token_stops_every_run() {
        let parent = CancellationToken::new();
        let mut measurement = ScreenBeamProfileMeasurement::builder(screen())
            .cancellation(parent.clone())
            .build()
            .unwrap();
        parent.cancel();

        for _ in 0..2 {
            let failure = measurement.measure(3).await.unwrap_err();
            assert!(matches!(
                failure.error,
                ProfileError::Cancelled {
                    acquired: 0,
                    requested: 3
                }
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_does_not_poison_the_next() {
        let slow = MockScreenConfig {
            readout: Duration::from_millis(50),
            ..MockScreenConfig::default()
        };
        let device = Arc::new(MockScreen::with_config("OTRS:IN20:571", slow));
        let mut measurement = ScreenBeamProfileMeasurement::builder(device.clone())
            .fit_profile(false)
            .build()
            .unwrap();
        let canceller = measurement.canceller();

        let (outcome, ()) = tokio::join!(measurement.measure(5), async {
            tokio::time::sleep(Duration::from_millis(75)).await;
            canceller.cancel();
        });
        let failure = outcome.unwrap_err();
        assert!(matches!(
            failure.error,
            ProfileError::Cancelled {
                acquired: 2,
                requested: 5
            }
        ));
        assert_eq!(failure.partial.unwrap().raw_images().unwrap().len(), 2);

        let tree = measurement.measure(2).await.unwrap();
        assert_eq!(tree.raw_images().unwrap().len(), 2);
        assert_eq!(device.frames_read(), 4);
    }

    #[tokio::test]
    async fn test_cancel_between_runs_is_ignored() {
        let mut measurement = ScreenBeamProfileMeasurement::builder(screen())
            .fit_profile(false)
            .build()
            .unwrap();
        measurement.canceller().cancel();
        assert!(measurement.measure(1).await.is_ok());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_completion_is_logged() {
        let mut measurement = ScreenBeamProfileMeasurement::builder(screen())
            .fit_profile(false)
            .build()
            .unwrap();
        measurement.measure(1).await.unwrap();
        assert!(logs_contain("Measurement complete"));
    }
}
