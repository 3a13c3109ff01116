use std::{path::PathBuf, time};

use crate::LatencyCompensation;

pub const MIN_SAMPLE_RATE: u32 = 44_100;
pub const MAX_SAMPLE_RATE: u32 = 96_000;

const MAX_CAPTURE_SECS: f32 = 30.0;
const CAPTURE_MARGIN_SECS: f32 = 0.5;

const MIN_SILENCE_SECS: f32 = 1.0;
const MAX_SILENCE_SECS: f32 = 10.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid number of i/o ports: {capture} capture, {playback} playback")]
    Ports { capture: usize, playback: usize },
    #[error("true-stereo needs stereo i/o")]
    TrueStereo,
    #[error("capture length is out of bounds {min:.1} <= len <= {max:.1} [sec]")]
    CaptureLength { min: f32, max: f32 },
    #[error("sweep duration needs to be at least one sample long")]
    SweepDuration,
    #[error("sweep range needs 0 < start < end, got {from} .. {to} Hz")]
    FrequencyRange { from: f32, to: f32 },
    #[error("sweep end frequency {to} Hz is above nyquist for sample rate {sample_rate}")]
    AboveNyquist { to: f32, sample_rate: u32 },
    #[error("invalid sample rate {0}, not (44100 <= rate <= 96000)")]
    SampleRate(u32),
    #[error("IR file exists ('{}')", .0.display())]
    OutputExists(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyRange {
    from: f32,
    to: f32,
}

impl FrequencyRange {
    pub fn new(from: f32, to: f32) -> Result<Self, ConfigError> {
        if from > 0.0 && from < to && to.is_finite() {
            Ok(Self { from, to })
        } else {
            Err(ConfigError::FrequencyRange { from, to })
        }
    }

    pub fn from(&self) -> f32 {
        self.from
    }

    pub fn to(&self) -> f32 {
        self.to
    }
}

impl Default for FrequencyRange {
    fn default() -> Self {
        Self {
            from: 20.0,
            to: 20_000.0,
        }
    }
}

/// Silence between the two passes of a true-stereo capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SilenceGap(time::Duration);

impl SilenceGap {
    pub fn clamped(secs: f32) -> Self {
        let secs = if secs.is_nan() {
            MIN_SILENCE_SECS
        } else {
            secs.clamp(MIN_SILENCE_SECS, MAX_SILENCE_SECS)
        };

        Self(time::Duration::from_secs_f32(secs))
    }

    pub fn into_inner(self) -> time::Duration {
        self.0
    }
}

impl Default for SilenceGap {
    fn default() -> Self {
        Self(time::Duration::from_secs(1))
    }
}

/// Port configuration of a measurement, from the device's point of view the
/// playback ports feed its inputs and the capture ports record its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// 1 capture, 1 playback
    Mono,
    /// 2 capture, 1 playback
    MonoToStereo,
    /// 2 capture, 2 playback
    Stereo,
    /// 2 capture, 2 playback, 4 channels (L->L, L->R, R->L, R->R)
    TrueStereo,
}

impl Layout {
    pub fn from_ports(
        capture: usize,
        playback: usize,
        true_stereo: bool,
    ) -> Result<Self, ConfigError> {
        let layout = match (capture, playback) {
            (1, 1) => Layout::Mono,
            (2, 1) => Layout::MonoToStereo,
            (2, 2) if true_stereo => Layout::TrueStereo,
            (2, 2) => Layout::Stereo,
            _ => return Err(ConfigError::Ports { capture, playback }),
        };

        if true_stereo && layout != Layout::TrueStereo {
            return Err(ConfigError::TrueStereo);
        }

        Ok(layout)
    }

    pub fn capture_ports(&self) -> usize {
        match self {
            Layout::Mono => 1,
            Layout::MonoToStereo | Layout::Stereo | Layout::TrueStereo => 2,
        }
    }

    pub fn playback_ports(&self) -> usize {
        match self {
            Layout::Mono | Layout::MonoToStereo => 1,
            Layout::Stereo | Layout::TrueStereo => 2,
        }
    }

    pub fn ir_channels(&self) -> usize {
        self.channel_map().len()
    }

    pub fn is_multi_pass(&self) -> bool {
        *self == Layout::TrueStereo
    }

    pub fn channel_map(&self) -> ChannelMap {
        match self {
            Layout::TrueStereo => ChannelMap::true_stereo(),
            _ => ChannelMap::identity(self.capture_ports()),
        }
    }
}

/// Source of a logical IR channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub port: usize,
    pub pass: usize,
}

/// Maps logical IR channels to the capture port and pass they are recorded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap(Vec<Slot>);

impl ChannelMap {
    pub fn identity(n_ports: usize) -> Self {
        Self((0..n_ports).map(|port| Slot { port, pass: 0 }).collect())
    }

    pub fn true_stereo() -> Self {
        Self(
            [(0, 0), (1, 0), (0, 1), (1, 1)]
                .into_iter()
                .map(|(port, pass)| Slot { port, pass })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.0.iter()
    }

    pub fn passes(&self) -> usize {
        self.0.iter().map(|slot| slot.pass + 1).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    layout: Layout,
    sweep_range: FrequencyRange,
    sweep_duration: time::Duration,
    capture_length: time::Duration,
    silence: SilenceGap,
    latency: LatencyCompensation,
}

impl Config {
    pub fn new(
        layout: Layout,
        sweep_range: FrequencyRange,
        sweep_secs: f32,
        capture_secs: f32,
        silence: SilenceGap,
        latency: LatencyCompensation,
    ) -> Result<Self, ConfigError> {
        if !(sweep_secs > 0.0 && sweep_secs.is_finite()) {
            return Err(ConfigError::SweepDuration);
        }

        let min = sweep_secs + CAPTURE_MARGIN_SECS;
        let max = MAX_CAPTURE_SECS;
        if !(min..=max).contains(&capture_secs) {
            return Err(ConfigError::CaptureLength { min, max });
        }

        Ok(Self {
            layout,
            sweep_range,
            sweep_duration: time::Duration::from_secs_f32(sweep_secs),
            capture_length: time::Duration::from_secs_f32(capture_secs),
            silence,
            latency,
        })
    }

    /// Checks the parts of the configuration that depend on the engine's rate.
    pub fn check_sample_rate(&self, sample_rate: u32) -> Result<(), ConfigError> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
            return Err(ConfigError::SampleRate(sample_rate));
        }

        if samples(self.sweep_duration, sample_rate) == 0 {
            return Err(ConfigError::SweepDuration);
        }

        let to = self.sweep_range.to();
        if to >= sample_rate as f32 / 2.0 {
            return Err(ConfigError::AboveNyquist { to, sample_rate });
        }

        Ok(())
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn sweep_range(&self) -> FrequencyRange {
        self.sweep_range
    }

    pub fn sweep_secs(&self) -> f32 {
        self.sweep_duration.as_secs_f32()
    }

    pub fn latency(&self) -> LatencyCompensation {
        self.latency
    }

    pub fn record_len(&self, sample_rate: u32) -> usize {
        samples(self.capture_length, sample_rate)
    }

    pub fn silence_len(&self, sample_rate: u32) -> usize {
        samples(self.silence.into_inner(), sample_rate)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            layout: Layout::Mono,
            sweep_range: FrequencyRange::default(),
            sweep_duration: time::Duration::from_secs(10),
            capture_length: time::Duration::from_secs(15),
            silence: SilenceGap::default(),
            latency: LatencyCompensation::default(),
        }
    }
}

pub fn samples(duration: time::Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * sample_rate as f64).round() as usize
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layouts_from_port_counts() {
        assert_eq!(Layout::from_ports(1, 1, false), Ok(Layout::Mono));
        assert_eq!(Layout::from_ports(2, 1, false), Ok(Layout::MonoToStereo));
        assert_eq!(Layout::from_ports(2, 2, false), Ok(Layout::Stereo));
        assert_eq!(Layout::from_ports(2, 2, true), Ok(Layout::TrueStereo));
    }

    #[test]
    fn invalid_port_counts() {
        for (capture, playback) in [(0, 1), (1, 0), (1, 2), (3, 2), (3, 3)] {
            assert_eq!(
                Layout::from_ports(capture, playback, false),
                Err(ConfigError::Ports { capture, playback })
            );
        }
    }

    #[test]
    fn true_stereo_needs_stereo_io() {
        assert_eq!(Layout::from_ports(1, 1, true), Err(ConfigError::TrueStereo));
        assert_eq!(Layout::from_ports(2, 1, true), Err(ConfigError::TrueStereo));
    }

    #[test]
    fn channel_maps() {
        assert_eq!(Layout::Mono.ir_channels(), 1);
        assert_eq!(Layout::MonoToStereo.ir_channels(), 2);
        assert_eq!(Layout::Stereo.ir_channels(), 2);
        assert_eq!(Layout::TrueStereo.ir_channels(), 4);

        let map = Layout::TrueStereo.channel_map();
        let slots: Vec<_> = map.iter().map(|s| (s.port, s.pass)).collect();
        assert_eq!(slots, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
        assert_eq!(map.passes(), 2);

        assert_eq!(Layout::Stereo.channel_map().passes(), 1);
    }

    #[test]
    fn silence_gap_is_clamped() {
        assert_eq!(SilenceGap::clamped(0.2).into_inner().as_secs_f32(), 1.0);
        assert_eq!(SilenceGap::clamped(4.0).into_inner().as_secs_f32(), 4.0);
        assert_eq!(SilenceGap::clamped(60.0).into_inner().as_secs_f32(), 10.0);
        assert_eq!(SilenceGap::clamped(f32::NAN), SilenceGap::default());
    }

    #[test]
    fn capture_length_bounds() {
        let new = |capture_secs| {
            Config::new(
                Layout::Mono,
                FrequencyRange::default(),
                10.0,
                capture_secs,
                SilenceGap::default(),
                LatencyCompensation::default(),
            )
        };

        assert!(new(10.5).is_ok());
        assert!(new(30.0).is_ok());
        assert!(matches!(new(10.4), Err(ConfigError::CaptureLength { .. })));
        assert!(matches!(new(30.5), Err(ConfigError::CaptureLength { .. })));
    }

    #[test]
    fn frequency_range() {
        assert!(FrequencyRange::new(20.0, 20_000.0).is_ok());
        assert!(FrequencyRange::new(0.0, 20_000.0).is_err());
        assert!(FrequencyRange::new(1_000.0, 500.0).is_err());
    }

    #[test]
    fn sample_rate_bounds() {
        let config = Config::default();

        assert!(config.check_sample_rate(44_100).is_ok());
        assert!(config.check_sample_rate(96_000).is_ok());
        assert_eq!(
            config.check_sample_rate(32_000),
            Err(ConfigError::SampleRate(32_000))
        );
        assert_eq!(
            config.check_sample_rate(192_000),
            Err(ConfigError::SampleRate(192_000))
        );
    }

    #[test]
    fn sweep_shorter_than_a_sample_is_rejected() {
        let config = Config::new(
            Layout::Mono,
            FrequencyRange::default(),
            1e-6,
            1.0,
            SilenceGap::default(),
            LatencyCompensation::default(),
        )
        .unwrap();

        assert_eq!(
            config.check_sample_rate(48_000),
            Err(ConfigError::SweepDuration)
        );
        assert!(matches!(
            Config::new(
                Layout::Mono,
                FrequencyRange::default(),
                0.0,
                1.0,
                SilenceGap::default(),
                LatencyCompensation::default(),
            ),
            Err(ConfigError::SweepDuration)
        ));
    }

    #[test]
    fn sweep_must_stay_below_nyquist() {
        let config = Config::new(
            Layout::Mono,
            FrequencyRange::new(20.0, 23_000.0).unwrap(),
            10.0,
            15.0,
            SilenceGap::default(),
            LatencyCompensation::default(),
        )
        .unwrap();

        assert!(matches!(
            config.check_sample_rate(44_100),
            Err(ConfigError::AboveNyquist { .. })
        ));
        assert!(config.check_sample_rate(48_000).is_ok());
    }

    #[test]
    fn lengths_in_samples() {
        let config = Config::default();

        assert_eq!(config.record_len(48_000), 15 * 48_000);
        assert_eq!(config.silence_len(44_100), 44_100);
    }
}
