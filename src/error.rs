//! Custom error types for the crate.
//!
//! This module defines the primary error type, `ProfileError`, for every stage of a
//! screen beam-profile measurement. Using the `thiserror` crate, it provides a
//! centralized and consistent way to report failures from input validation,
//! configuration, acquisition, fitting, and persistence.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidShotCount`**: The requested number of shots was not positive. Raised before
//!   the device is touched.
//! - **`DeviceAcquisition`**: Wraps the opaque error returned by a screen device while
//!   pulling the image for a given shot.
//! - **`FitFailed`**: The fit strategy rejected the image of a given shot (malformed image,
//!   no signal, non-convergence).
//! - **`UnknownFitType`** / **`Configuration`** / **`Config`**: Problems found while
//!   resolving configuration, always before any measurement starts.
//! - **`StorageWrite`** / **`StorageRead`**: Failures persisting or loading a result tree,
//!   with the destination and the key path being processed.
//! - **`Cancelled`**: The cooperative cancellation token fired between shots.
//! - **`FeatureNotEnabled`**: A storage backend was requested that this build does not
//!   include (e.g. HDF5 without the `storage_hdf5` feature).
//!
//! `MeasurementFailure` is what the orchestrator hands back: the `ProfileError` plus any
//! in-memory results gathered before the failure.

use std::path::PathBuf;

use thiserror::Error;

use crate::fit::FitError;
use crate::tree::ResultTree;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, ProfileError>;

/// Errors raised while configuring, acquiring, fitting, or persisting a measurement.
#[derive(Error, Debug)]
pub enum ProfileError {
    /// The shot count was zero or negative.
    #[error("Invalid shot count {0}: at least one shot is required")]
    InvalidShotCount(i64),

    /// The device failed to deliver an image.
    #[error("Device '{device}' failed to acquire shot {shot}: {source}")]
    DeviceAcquisition {
        /// Device name.
        device: String,
        /// Zero-based shot index being acquired.
        shot: usize,
        /// Opaque device error.
        #[source]
        source: anyhow::Error,
    },

    /// The fit strategy failed for one image; the run is aborted.
    #[error("Fit '{fit}' failed on shot {shot}: {source}")]
    FitFailed {
        /// Fit strategy name.
        fit: String,
        /// Zero-based shot index of the offending image.
        shot: usize,
        /// Underlying fit error.
        #[source]
        source: FitError,
    },

    /// The fit configuration named a type that is not registered.
    #[error("Unknown fit type '{0}' (known types: {known})", known = crate::fit::FitKind::names().join(", "))]
    UnknownFitType(String),

    /// Semantic configuration error.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration load or extraction error.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Persisting a result tree failed.
    #[error("Failed to write '{path}' at {key}: {reason}")]
    StorageWrite {
        /// Destination being written.
        path: PathBuf,
        /// Key path within the tree (`/` for the root).
        key: String,
        /// What went wrong.
        reason: String,
    },

    /// Loading a result tree failed.
    #[error("Failed to read '{path}': {reason}")]
    StorageRead {
        /// Destination being read.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The measurement was cancelled between shots.
    #[error("Measurement cancelled after {acquired} of {requested} shots")]
    Cancelled {
        /// Shots acquired before cancellation.
        acquired: usize,
        /// Shots requested.
        requested: usize,
    },

    /// The requested functionality was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for ProfileError {
    fn from(err: figment::Error) -> Self {
        ProfileError::Config(Box::new(err))
    }
}

impl ProfileError {
    pub(crate) fn storage_write(
        path: impl Into<PathBuf>,
        key: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        ProfileError::StorageWrite {
            path: path.into(),
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn storage_read(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ProfileError::StorageRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// A failed `measure` call.
///
/// `partial` holds whatever was assembled before the failure: the raw images when a fit
/// failed, or the complete tree when only persistence failed.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct MeasurementFailure {
    /// What went wrong.
    #[source]
    pub error: ProfileError,
    /// Results gathered before the failure, if any.
    pub partial: Option<ResultTree>,
}

impl MeasurementFailure {
    pub(crate) fn new(error: ProfileError) -> Self {
        Self {
            error,
            partial: None,
        }
    }

    pub(crate) fn with_partial(error: ProfileError, partial: ResultTree) -> Self {
        Self {
            error,
            partial: Some(partial),
        }
    }

    /// Splits the failure into its error and partial results.
    pub fn into_parts(self) -> (ProfileError, Option<ResultTree>) {
        (self.error, self.partial)
    }
}

impl From<ProfileError> for MeasurementFailure {
    fn from(error: ProfileError) -> Self {
        Self::new(error)
    }
}
