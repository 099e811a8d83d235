//! Common test utilities for screen_profile integration tests
//!
//! Stub collaborators that record how they were used:
//! - `ConstantScreen` - yields the same deterministic frame and counts pulls
//! - `FlakyFit` - succeeds except on one chosen call
//! - `RecordingStore` - counts saves and can be told to fail

#![allow(dead_code)] // Utilities may not all be used by every test binary

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use ndarray::Array2;
use screen_profile::device::ScreenDevice;
use screen_profile::fit::{FitError, FitResult, FitSpec, ImageFit};
use screen_profile::storage::HierarchicalStore;
use screen_profile::{AppResult, Image, ProfileError, ResultTree};

/// Screen that always shows the same frame, tagged with its pull index in pixel `[0, 0]`
/// unless built with `constant`.
pub struct ConstantScreen {
    pulls: AtomicUsize,
    tag_frames: bool,
}

impl ConstantScreen {
    pub fn constant() -> Self {
        Self {
            pulls: AtomicUsize::new(0),
            tag_frames: false,
        }
    }

    pub fn tagged() -> Self {
        Self {
            pulls: AtomicUsize::new(0),
            tag_frames: true,
        }
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn frame(tag: u16) -> Image {
        let mut pixels = Array2::<u16>::from_shape_fn((6, 8), |(y, x)| (y * 8 + x) as u16 * 10);
        pixels[[0, 0]] = tag;
        Image::from(pixels)
    }
}

#[async_trait]
impl ScreenDevice for ConstantScreen {
    fn name(&self) -> &str {
        "constant"
    }

    async fn image(&self) -> Result<Image> {
        let pull = self.pulls.fetch_add(1, Ordering::SeqCst);
        let tag = if self.tag_frames { pull as u16 } else { 0 };
        Ok(Self::frame(tag))
    }
}

#[derive(Debug)]
pub struct ConstantResult;

impl FitResult for ConstantResult {
    fn dump(&self) -> ResultTree {
        let mut tree = ResultTree::new();
        tree.insert("sigma", 1.0);
        tree
    }
}

/// Fit that fails on the call with zero-based index `fail_on`, if any.
#[derive(Debug, Default)]
pub struct FlakyFit {
    calls: AtomicUsize,
    fail_on: Option<usize>,
}

impl FlakyFit {
    pub fn always_ok() -> Self {
        Self::default()
    }

    pub fn failing_on(call: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on: Some(call),
        }
    }
}

impl ImageFit for FlakyFit {
    fn name(&self) -> &'static str {
        "FlakyFit"
    }

    fn fit_image(&self, _image: &Image) -> Result<Box<dyn FitResult>, FitError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on == Some(call) {
            return Err(FitError::NotConverged(format!("call {call}")));
        }
        Ok(Box::new(ConstantResult))
    }

    fn spec(&self) -> FitSpec {
        FitSpec::new("FlakyFit")
    }
}

/// Store that counts calls and can be told to fail.
#[derive(Default, Clone)]
pub struct RecordingStore {
    saves: Arc<AtomicUsize>,
    fail: bool,
}

impl RecordingStore {
    pub fn failing() -> Self {
        Self {
            saves: Arc::default(),
            fail: true,
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl HierarchicalStore for RecordingStore {
    fn name(&self) -> &str {
        "recording"
    }

    fn save(&self, _tree: &ResultTree, destination: &Path) -> AppResult<PathBuf> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProfileError::StorageWrite {
                path: destination.to_path_buf(),
                key: "/".into(),
                reason: "disk full".into(),
            });
        }
        Ok(destination.to_path_buf())
    }

    fn load(&self, destination: &Path) -> AppResult<ResultTree> {
        Err(ProfileError::StorageRead {
            path: destination.to_path_buf(),
            reason: "recording store keeps nothing".into(),
        })
    }
}
