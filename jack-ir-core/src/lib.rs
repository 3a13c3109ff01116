pub mod audio;
pub mod capture;
pub mod config;
pub mod convolver;
pub mod deconvolution;
pub mod impulse_response;
pub mod post;
pub mod sweep;
pub mod wav;
pub mod window;

pub use audio::{AudioBackendError, AudioEngine, ResourceError, Session};
pub use capture::{AbortCause, Capture, CaptureScheduler, SessionState, Status};
pub use config::{Config, ConfigError, FrequencyRange, Layout, SilenceGap};
pub use convolver::{Convolver, ConvolverError, PartitionedConvolver, Tap};
pub use deconvolution::Deconvolver;
pub use impulse_response::{ImpulseResponse, SignalError};
pub use post::LatencyCompensation;
pub use sweep::SweepSignal;
pub use wav::WriteError;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] AudioBackendError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("deconvolution failed: {0}")]
    Deconvolution(#[from] ConvolverError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

#[inline]
pub fn dbfs(v: f32) -> f32 {
    20.0 * f32::log10(v.abs())
}

#[inline]
pub fn from_dbfs(db: f32) -> f32 {
    f32::powf(10.0, db / 20.0)
}
