//! Screen beam-profile measurements.
//!
//! This library repeatedly acquires images from a beam-diagnostic screen, optionally fits
//! a beam-profile model to each image, and persists the combined raw and fitted results to
//! a hierarchical container file.
//!
//! - [`device`]: the screen capability and a simulated screen
//! - [`fit`]: fit strategies, selected by a `{type, ...params}` record
//! - [`measurement`]: the acquisition loop and the measurement orchestrator
//! - [`storage`]: recursive tree-to-container persistence
//! - [`tree`]: the in-memory result tree
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use screen_profile::device::MockScreen;
//! use screen_profile::measurement::ScreenBeamProfileMeasurement;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let screen = Arc::new(MockScreen::new("OTRS:IN20:571"));
//!     let mut measurement = ScreenBeamProfileMeasurement::builder(screen)
//!         .save_to("data/otr.bpc")
//!         .build()?;
//!     let results = measurement.measure(5).await?;
//!     println!("{} images", results.raw_images().map_or(0, |r| r.len()));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod fit;
pub mod image;
pub mod logging;
pub mod measurement;
pub mod storage;
pub mod tree;

pub use config::{MeasurementConfig, ProfileConfig};
pub use error::{AppResult, MeasurementFailure, ProfileError};
pub use image::Image;
pub use measurement::{MeasurementState, RunCanceller, ScreenBeamProfileMeasurement};
pub use storage::{ContainerStore, Hdf5Store, HierarchicalStore, StorageBackend};
pub use tree::{Node, ResultTree, Value};
