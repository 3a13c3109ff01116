use std::path::Path;

use crate::{
    capture::Capture,
    convolver::Convolver,
    dbfs,
    deconvolution::Deconvolver,
    post::{self, LatencyCompensation, CLIP_LEVEL},
    sweep::SweepSignal,
    wav, Error, WriteError,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("input clipped, peak level {peak:.3}")]
    Clipped { peak: f32 },
    #[error("impulse response too short, trimmed to {trimmed} samples but it starts at {offset}")]
    TooShort { trimmed: usize, offset: usize },
}

/// Normalized and trimmed impulse responses, one per logical channel.
#[derive(Debug, Clone)]
pub struct ImpulseResponse {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
    applied_gain: f32,
    trimmed_length: usize,
    offset: usize,
}

impl ImpulseResponse {
    /// Computes the impulse responses from the raw capture.
    ///
    /// The capture is rejected if it clipped, before any processing. The
    /// response of every channel starts after the sweep plus the latency.
    pub fn from_capture<C: Convolver>(
        capture: Capture,
        sweep: &SweepSignal,
        sample_rate: u32,
        latency: LatencyCompensation,
        deconvolver: Deconvolver<C>,
    ) -> Result<Self, Error> {
        let peak = post::digital_peak(capture.channels());
        tracing::info!("input peak: {:.1} dBFS", dbfs(peak));

        if peak >= CLIP_LEVEL {
            return Err(SignalError::Clipped { peak }.into());
        }

        let round_trip_latency = capture.round_trip_latency();
        let latency = latency.effective(round_trip_latency);
        let offset = sweep.len() + latency;

        let mut channels = capture.into_channels();
        deconvolver.run(sweep.inverse(), &mut channels)?;

        let applied_gain = post::normalize_peak(&mut channels);
        tracing::info!("normalized by {:.2} dB", dbfs(applied_gain));

        let trimmed_length = post::trim_end(&mut channels, sample_rate);
        tracing::debug!("trimmed to {trimmed_length} samples, response starts at {offset}");

        if trimmed_length <= offset {
            return Err(SignalError::TooShort {
                trimmed: trimmed_length,
                offset,
            }
            .into());
        }

        let channels = channels
            .iter()
            .map(|channel| channel[offset..trimmed_length].to_vec())
            .collect();

        Ok(Self {
            sample_rate,
            channels,
            applied_gain,
            trimmed_length,
            offset,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// Length of every channel in samples.
    pub fn len(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn applied_gain(&self) -> f32 {
        self.applied_gain
    }

    pub fn trimmed_length(&self) -> usize {
        self.trimmed_length
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), WriteError> {
        let channels: Vec<&[f32]> = self.channels.iter().map(Vec::as_slice).collect();

        wav::write_channels(path, self.sample_rate, &channels)
    }
}
