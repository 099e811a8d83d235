//! Screen device capability.
//!
//! A screen is pull-based: each call to [`ScreenDevice::image`] returns the frame the
//! device currently holds. Failures are opaque to the measurement and are wrapped with the
//! shot index by the acquisition loop.

pub mod mock;

use anyhow::Result;
use async_trait::async_trait;

use crate::image::Image;

pub use mock::{MockScreen, MockScreenConfig};

/// Hardware-agnostic interface to a beam-diagnostic screen.
///
/// Implementations must not require exclusive access; the measurement only ever reads.
#[async_trait]
pub trait ScreenDevice: Send + Sync {
    /// Device name, for logs and errors.
    fn name(&self) -> &str;

    /// Current image on the screen.
    async fn image(&self) -> Result<Image>;
}
